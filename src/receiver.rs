//! IDE-side end of the relay
//!
//! Accepts the connection a worker opens from its [`EventEmitter`], decodes
//! records in arrival order, and remembers what the worker announced about
//! itself (pid and control port) so a stop can be requested later.
//!
//! A worker that disappears (crash, `kill -9`, reset connection, half-written
//! frame) ends its stream normally; it is not a protocol error.
//!
//! [`EventEmitter`]: crate::emitter::EventEmitter

use crate::codec::EventCodec;
use crate::error::{RelayError, Result};
use crate::event::{EventRecord, RunnerEvent};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

/// Listening socket workers connect to
pub struct EventReceiver {
    listener: TcpListener,
}

impl EventReceiver {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Event receiver listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next worker to connect
    pub async fn accept(&self) -> Result<EventStream<TcpStream>> {
        let (stream, peer) = self.listener.accept().await?;
        info!("Worker connected from {}", peer);
        Ok(EventStream::new(stream, Some(peer.ip())))
    }
}

/// What a worker has announced over its event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSession {
    /// Address the worker connected from
    pub peer: Option<IpAddr>,
    pub pid: Option<u32>,
    pub control_port: Option<u16>,
    /// Whether the worker sent `close`
    pub closed: bool,
}

impl WorkerSession {
    /// Address of the worker's control server, once its port is known
    pub fn control_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.peer?, self.control_port?))
    }

    /// Ask the worker to stop.
    ///
    /// Returns `false` when the worker has not announced a control port.
    pub async fn request_stop(&self) -> Result<bool> {
        match self.control_addr() {
            Some(addr) => {
                request_stop(addr).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn observe(&mut self, event: &RunnerEvent) {
        match event {
            RunnerEvent::Pid(pid) => self.pid = Some(*pid),
            RunnerEvent::Port(port) => self.control_port = Some(*port),
            RunnerEvent::Close => self.closed = true,
            _ => {}
        }
    }
}

/// Ordered stream of records from one worker
pub struct EventStream<R> {
    frames: FramedRead<R, EventCodec>,
    session: WorkerSession,
    finished: bool,
}

impl<R: AsyncRead + Unpin> EventStream<R> {
    pub fn new(reader: R, peer: Option<IpAddr>) -> Self {
        Self {
            frames: FramedRead::new(reader, EventCodec::new()),
            session: WorkerSession {
                peer,
                ..WorkerSession::default()
            },
            finished: false,
        }
    }

    pub fn session(&self) -> &WorkerSession {
        &self.session
    }

    /// Next raw record, or `None` once the worker is gone
    pub async fn next_record(&mut self) -> Result<Option<EventRecord>> {
        if self.finished {
            return Ok(None);
        }

        match self.frames.next().await {
            Some(Ok(record)) => {
                debug!("Received {} event", record.name);
                Ok(Some(record))
            }
            Some(Err(RelayError::Io(e))) if is_disconnect(&e) => {
                debug!("Worker connection dropped: {}", e);
                self.finished = true;
                Ok(None)
            }
            Some(Err(e)) => Err(e),
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Next typed event, or `None` once the worker is gone
    pub async fn next_event(&mut self) -> Result<Option<RunnerEvent>> {
        let Some(record) = self.next_record().await? else {
            return Ok(None);
        };

        let event = RunnerEvent::try_from(record)?;
        self.session.observe(&event);
        Ok(Some(event))
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Ask the worker whose control server listens on `addr` to stop.
///
/// Connecting is the whole request; nothing is sent or read.
pub async fn request_stop(addr: SocketAddr) -> Result<()> {
    let stream = TcpStream::connect(addr).await?;
    drop(stream);
    info!("Sent stop request to {}", addr);
    Ok(())
}
