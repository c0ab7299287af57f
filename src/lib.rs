//! testrun-relay - Event relay between a test-execution worker and its IDE
//!
//! A spawned test worker reports its progress to the IDE that launched it,
//! and the IDE can ask the worker to stop:
//! - The worker's [`EventEmitter`] connects out to the IDE and writes one
//!   length-prefixed record per lifecycle callback, in call order
//! - The emitter also starts a [`ControlServer`] on an ephemeral port and
//!   announces that port over the event stream
//! - Connecting to the control port raises the worker's [`StopSignal`];
//!   the test engine checks it at its own safe points
//!
//! # Architecture
//!
//! - **Event**: the closed event vocabulary and its wire records
//! - **Codec**: length-delimited JSON framing shared by both ends
//! - **Emitter / Control**: worker side (blocking, no runtime required)
//! - **Receiver**: IDE side (Tokio)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use testrun_relay::{Attributes, CancellationFlag, EventEmitter, RelayConfig, RunListener};
//!
//! let flag = CancellationFlag::new();
//! let mut emitter = EventEmitter::new(RelayConfig::default(), Arc::new(flag.clone()));
//!
//! emitter.start_suite("Smoke", &Attributes::new())?;
//! if !flag.is_cancelled() {
//!     emitter.start_test("Login", &Attributes::new())?;
//!     emitter.end_test("Login", &Attributes::new())?;
//! }
//! emitter.end_suite("Smoke", &Attributes::new())?;
//! emitter.close();
//! ```

pub mod cancel;
pub mod codec;
pub mod config;
pub mod control;
pub mod emitter;
pub mod error;
pub mod event;
pub mod receiver;

// Re-export commonly used types
pub use cancel::{CancellationFlag, StopSignal};
pub use codec::EventCodec;
pub use crate::config::{RelayConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use control::ControlServer;
pub use emitter::{EmitterState, EventEmitter, RunListener};
pub use error::{RelayError, Result};
pub use event::{Attributes, EventName, EventRecord, RunnerEvent};
pub use receiver::{request_stop, EventReceiver, EventStream, WorkerSession};
