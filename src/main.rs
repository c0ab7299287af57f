//! testrun-relay - command line front end
//!
//! `listen` plays the IDE: it accepts one worker and prints its events.
//! `emit` plays the worker: it runs a synthetic suite through an emitter.
//! `stop` sends a stop request to a worker's control port.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use testrun_relay::{
    request_stop, Attributes, CancellationFlag, EventEmitter, EventReceiver, EventRecord,
    RelayConfig, RunListener, RunnerEvent, WorkerSession,
};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "testrun-relay")]
#[command(about = "Relay test-run events from a worker process to an IDE", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept one worker and print its events as JSON lines
    Listen {
        /// Address to bind (overrides TESTRUN_RELAY_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides TESTRUN_RELAY_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Request a stop after this many finished tests
        #[arg(long)]
        stop_after_tests: Option<usize>,
    },

    /// Run a synthetic suite and stream its events
    Emit {
        /// Receiver host (overrides TESTRUN_RELAY_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Receiver port (overrides TESTRUN_RELAY_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Suite name
        #[arg(long, default_value = "Synthetic")]
        suite: String,

        /// Number of tests to run
        #[arg(long, default_value = "5")]
        tests: usize,

        /// Time spent in each test
        #[arg(long, default_value = "200")]
        delay_ms: u64,
    },

    /// Ask a worker to stop via its control port
    Stop {
        /// Worker host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Control port announced by the worker
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::new(format!("testrun_relay={}", level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // stdout carries event output
        .init();

    debug!("testrun-relay v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Listen {
            host,
            port,
            stop_after_tests,
        } => {
            let config = RelayConfig::load()?.with_overrides(host, port);
            listen(config, stop_after_tests).await
        }
        Commands::Emit {
            host,
            port,
            suite,
            tests,
            delay_ms,
        } => {
            let config = RelayConfig::load()?.with_overrides(host, port);
            let delay = Duration::from_millis(delay_ms);
            tokio::task::spawn_blocking(move || run_synthetic_suite(config, &suite, tests, delay))
                .await
                .context("synthetic suite panicked")?
        }
        Commands::Stop { host, port } => {
            let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .with_context(|| format!("could not resolve {}:{}", host, port))?;
            request_stop(addr).await?;
            Ok(())
        }
    }
}

async fn listen(config: RelayConfig, stop_after_tests: Option<usize>) -> anyhow::Result<()> {
    let receiver = EventReceiver::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind event receiver on {}", config))?;
    let mut stream = receiver.accept().await?;

    let mut finished_tests = 0;
    let mut stop_sent = false;

    while let Some(event) = stream.next_event().await? {
        if matches!(event, RunnerEvent::EndTest { .. }) {
            finished_tests += 1;
        }

        let record = EventRecord::from(event);
        println!("{}", serde_json::to_string(&record)?);

        if !stop_sent && stop_after_tests.is_some_and(|limit| finished_tests >= limit) {
            stop_sent = stop_worker(stream.session()).await;
        }
    }

    let session = stream.session();
    if session.closed {
        info!("Worker {:?} closed its event stream", session.pid);
    } else {
        warn!("Worker {:?} disconnected without closing", session.pid);
    }
    Ok(())
}

/// Request a stop, returning whether one was attempted.
///
/// A refused connection means the worker already exited; the remaining
/// events are still read.
async fn stop_worker(session: &WorkerSession) -> bool {
    match session.request_stop().await {
        Ok(true) => true,
        Ok(false) => {
            warn!("Worker has not announced a control port; cannot stop it");
            false
        }
        Err(e) => {
            warn!("Stop request to worker {:?} failed: {}", session.pid, e);
            true
        }
    }
}

fn attributes(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

fn run_synthetic_suite(
    config: RelayConfig,
    suite: &str,
    tests: usize,
    delay: Duration,
) -> anyhow::Result<()> {
    let flag = CancellationFlag::new();
    let mut emitter = EventEmitter::new(config, Arc::new(flag.clone()));

    emitter.start_suite(
        suite,
        &attributes(json!({ "longname": suite, "totaltests": tests })),
    )?;

    let mut passed = 0;
    for index in 1..=tests {
        if flag.is_cancelled() {
            warn!("Stop requested, skipping {} remaining test(s)", tests - index + 1);
            break;
        }

        let name = format!("Test {}", index);
        let longname = format!("{}.{}", suite, name);
        emitter.start_test(&name, &attributes(json!({ "longname": longname })))?;
        emitter.log_message(&attributes(json!({
            "message": format!("Running {}", name),
            "level": "INFO",
        })))?;
        std::thread::sleep(delay);
        emitter.end_test(
            &name,
            &attributes(json!({ "longname": longname, "status": "PASS" })),
        )?;
        passed += 1;
    }

    let status = if passed == tests { "PASS" } else { "FAIL" };
    emitter.end_suite(
        suite,
        &attributes(json!({ "longname": suite, "status": status, "passed": passed })),
    )?;
    flag.finish();
    emitter.close();

    info!("Suite {} finished: {}/{} passed", suite, passed, tests);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn session_with_port(control_port: Option<u16>) -> WorkerSession {
        WorkerSession {
            peer: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            pid: Some(1234),
            control_port,
            closed: false,
        }
    }

    #[tokio::test]
    async fn test_stop_worker_tolerates_exited_worker() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(stop_worker(&session_with_port(Some(port))).await);
    }

    #[tokio::test]
    async fn test_stop_worker_without_port() {
        assert!(!stop_worker(&session_with_port(None)).await);
    }

    #[tokio::test]
    async fn test_stop_worker_reaches_control_server() {
        let flag = CancellationFlag::new();
        let server = testrun_relay::ControlServer::spawn(Arc::new(flag.clone())).unwrap();

        assert!(stop_worker(&session_with_port(Some(server.port()))).await);

        for _ in 0..500 {
            if flag.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flag.is_cancelled());
        server.shutdown();
    }
}
