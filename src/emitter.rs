//! Worker-side event emitter
//!
//! Turns the test engine's lifecycle callbacks into records on a single
//! outbound connection to the IDE, and starts the worker's
//! [`ControlServer`] so the IDE can ask the run to stop.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──connect ok──▶ Connected ──close()──▶ Closed
//!   │                       │
//!   └──connect failed──▶ Disabled ◀──write failed
//! ```
//!
//! A worker must never fail because its IDE went away, so connection
//! problems only ever disable emission. Every emission call in the
//! `Disabled` or `Closed` state is a no-op.

use crate::cancel::StopSignal;
use crate::codec::EventCodec;
use crate::config::RelayConfig;
use crate::control::ControlServer;
use crate::error::Result;
use crate::event::{Attributes, EventName, EventRecord};
use bytes::BytesMut;
use serde_json::Value;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;
use tokio_util::codec::Encoder;
use tracing::{debug, info, trace, warn};

/// Lifecycle callbacks a test engine delivers to its listeners.
///
/// Emission methods only fail when a record cannot be encoded, which means
/// the caller handed over something the wire format cannot carry.
///
/// File paths travel as strings: non-UTF-8 components are replaced with
/// U+FFFD before sending.
pub trait RunListener {
    fn start_suite(&mut self, name: &str, attributes: &Attributes) -> Result<()>;
    fn end_suite(&mut self, name: &str, attributes: &Attributes) -> Result<()>;
    fn start_test(&mut self, name: &str, attributes: &Attributes) -> Result<()>;
    fn end_test(&mut self, name: &str, attributes: &Attributes) -> Result<()>;
    fn start_keyword(&mut self, name: &str, attributes: &Attributes) -> Result<()>;
    fn end_keyword(&mut self, name: &str, attributes: &Attributes) -> Result<()>;
    fn message(&mut self, message: &Attributes) -> Result<()>;
    fn log_message(&mut self, message: &Attributes) -> Result<()>;
    fn log_file(&mut self, path: &Path) -> Result<()>;
    fn output_file(&mut self, path: &Path) -> Result<()>;
    fn report_file(&mut self, path: &Path) -> Result<()>;
    fn summary_file(&mut self, path: &Path) -> Result<()>;
    fn debug_file(&mut self, path: &Path) -> Result<()>;

    /// End of run. Always safe to call, any number of times.
    fn close(&mut self);
}

/// Connection state of an [`EventEmitter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    /// Events are written to the receiver
    Connected,
    /// No receiver; emission is a no-op
    Disabled,
    /// `close()` was called
    Closed,
}

struct Connection {
    stream: TcpStream,
    codec: EventCodec,
    buf: BytesMut,
}

impl Connection {
    fn open(config: &RelayConfig) -> Option<Self> {
        match TcpStream::connect((config.host.as_str(), config.port)) {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle on event socket: {}", e);
                }
                info!("Connected to event receiver at {}", config);
                Some(Self {
                    stream,
                    codec: EventCodec::new(),
                    buf: BytesMut::new(),
                })
            }
            Err(e) => {
                warn!(
                    "Unable to open socket to {}: {}; event emission disabled",
                    config, e
                );
                None
            }
        }
    }

    fn encode(&mut self, record: EventRecord) -> Result<()> {
        self.buf.clear();
        self.codec.encode(record, &mut self.buf)
    }

    fn write_frame(&mut self) -> io::Result<()> {
        self.stream.write_all(&self.buf)?;
        self.stream.flush()
    }
}

/// Sends lifecycle events of one test run to the IDE
pub struct EventEmitter {
    config: RelayConfig,
    connection: Option<Connection>,
    state: EmitterState,
    control: Option<ControlServer>,
}

impl EventEmitter {
    /// Connect to the receiver and start the control server.
    ///
    /// Blocks while connecting. On success the first record sent is `pid`;
    /// `port` follows once the control server is listening. Never fails:
    /// an unreachable receiver leaves the emitter `Disabled`.
    pub fn new(config: RelayConfig, signal: Arc<dyn StopSignal>) -> Self {
        let connection = Connection::open(&config);
        let state = if connection.is_some() {
            EmitterState::Connected
        } else {
            EmitterState::Disabled
        };

        let mut emitter = Self {
            config,
            connection,
            state,
            control: None,
        };

        emitter.announce(EventName::Pid, Value::from(std::process::id()));
        emitter.start_control_server(signal);
        emitter
    }

    /// Build from positional listener arguments, see [`RelayConfig::from_args`]
    pub fn from_args<S: AsRef<str>>(args: &[S], signal: Arc<dyn StopSignal>) -> Result<Self> {
        Ok(Self::new(RelayConfig::from_args(args)?, signal))
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == EmitterState::Connected
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Port of this worker's control server, if it could be bound
    pub fn control_port(&self) -> Option<u16> {
        self.control.as_ref().map(ControlServer::port)
    }

    fn start_control_server(&mut self, signal: Arc<dyn StopSignal>) {
        // The IDE dials back over the family the event connection used
        let local_ip = self
            .connection
            .as_ref()
            .and_then(|connection| connection.stream.local_addr().ok())
            .map(|addr| addr.ip());

        let spawned = match local_ip {
            Some(ip) => ControlServer::spawn_for(ip, signal),
            None => ControlServer::spawn(signal),
        };

        match spawned {
            Ok(server) => {
                let port = server.port();
                self.control = Some(server);
                self.announce(EventName::Port, Value::from(port));
            }
            Err(e) => warn!("Failed to start control server: {}", e),
        }
    }

    /// Send a bootstrap record whose encoding cannot fail in practice
    fn announce(&mut self, name: EventName, value: Value) {
        if let Err(e) = self.send(name, vec![value]) {
            warn!("Failed to encode {} event: {}", name, e);
        }
    }

    fn send(&mut self, name: EventName, args: Vec<Value>) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };

        connection.encode(EventRecord::new(name, args))?;

        if let Err(e) = connection.write_frame() {
            warn!(
                "Lost connection to {} while sending {}: {}; event emission disabled",
                self.config, name, e
            );
            self.connection = None;
            self.state = EmitterState::Disabled;
            return Ok(());
        }

        trace!("Sent {} event", name);
        Ok(())
    }

    fn send_named(&mut self, event: EventName, name: &str, attributes: &Attributes) -> Result<()> {
        self.send(
            event,
            vec![Value::from(name), Value::Object(attributes.clone())],
        )
    }

    fn send_mapping(&mut self, event: EventName, mapping: &Attributes) -> Result<()> {
        self.send(event, vec![Value::Object(mapping.clone())])
    }

    /// Lossy for non-UTF-8 paths
    fn send_path(&mut self, event: EventName, path: &Path) -> Result<()> {
        self.send(event, vec![Value::from(path.to_string_lossy().into_owned())])
    }
}

impl RunListener for EventEmitter {
    fn start_suite(&mut self, name: &str, attributes: &Attributes) -> Result<()> {
        self.send_named(EventName::StartSuite, name, attributes)
    }

    fn end_suite(&mut self, name: &str, attributes: &Attributes) -> Result<()> {
        self.send_named(EventName::EndSuite, name, attributes)
    }

    fn start_test(&mut self, name: &str, attributes: &Attributes) -> Result<()> {
        self.send_named(EventName::StartTest, name, attributes)
    }

    fn end_test(&mut self, name: &str, attributes: &Attributes) -> Result<()> {
        self.send_named(EventName::EndTest, name, attributes)
    }

    fn start_keyword(&mut self, name: &str, attributes: &Attributes) -> Result<()> {
        self.send_named(EventName::StartKeyword, name, attributes)
    }

    fn end_keyword(&mut self, name: &str, attributes: &Attributes) -> Result<()> {
        self.send_named(EventName::EndKeyword, name, attributes)
    }

    fn message(&mut self, message: &Attributes) -> Result<()> {
        self.send_mapping(EventName::Message, message)
    }

    fn log_message(&mut self, message: &Attributes) -> Result<()> {
        self.send_mapping(EventName::LogMessage, message)
    }

    fn log_file(&mut self, path: &Path) -> Result<()> {
        self.send_path(EventName::LogFile, path)
    }

    fn output_file(&mut self, path: &Path) -> Result<()> {
        self.send_path(EventName::OutputFile, path)
    }

    fn report_file(&mut self, path: &Path) -> Result<()> {
        self.send_path(EventName::ReportFile, path)
    }

    fn summary_file(&mut self, path: &Path) -> Result<()> {
        self.send_path(EventName::SummaryFile, path)
    }

    fn debug_file(&mut self, path: &Path) -> Result<()> {
        self.send_path(EventName::DebugFile, path)
    }

    fn close(&mut self) {
        if self.state == EmitterState::Closed {
            return;
        }

        if let Err(e) = self.send(EventName::Close, Vec::new()) {
            warn!("Failed to encode close event: {}", e);
        }

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.stream.shutdown(Shutdown::Both) {
                debug!("Event socket shutdown failed: {}", e);
            }
            info!("Closed event stream to {}", self.config);
        }

        self.state = EmitterState::Closed;
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("control_port", &self.control_port())
            .finish()
    }
}
