//! Cooperative cancellation
//!
//! The control server never stops a test run by itself; it asks the host
//! engine to stop through a [`StopSignal`]. The engine checks for the request
//! at its own safe points and unwinds.

use crate::error::{RelayError, Result};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capability to request that the running test execution stops.
///
/// `raise` may be called from any thread, concurrently with the test run,
/// and any number of times. It must not block. An `Err` means there was
/// nothing left to cancel; callers treat that as an expected race.
pub trait StopSignal: Send + Sync {
    fn raise(&self) -> Result<()>;
}

impl<F> StopSignal for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn raise(&self) -> Result<()> {
        self()
    }
}

impl StopSignal for CancellationToken {
    fn raise(&self) -> Result<()> {
        self.cancel();
        Ok(())
    }
}

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const FINISHED: u8 = 2;

#[derive(Debug, Default)]
struct FlagInner {
    state: AtomicU8,
    attempts: AtomicUsize,
}

/// Process-wide one-shot stop flag.
///
/// Clones share the same flag. Once raised it stays raised; once the run is
/// marked finished further raises are rejected with
/// [`RelayError::NotCancellable`].
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<FlagInner>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a stop has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether the run was marked finished
    pub fn is_finished(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FINISHED
    }

    /// Mark the run as over; later raises are rejected
    pub fn finish(&self) {
        self.inner.state.store(FINISHED, Ordering::Release);
    }

    /// Number of raise calls seen so far, accepted or not
    pub fn raise_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::Acquire)
    }
}

impl StopSignal for CancellationFlag {
    fn raise(&self) -> Result<()> {
        self.inner.attempts.fetch_add(1, Ordering::AcqRel);

        match self.inner.state.compare_exchange(
            RUNNING,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) | Err(CANCELLED) => Ok(()),
            Err(_) => Err(RelayError::NotCancellable(
                "test run already finished".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_flag_raise_is_idempotent() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());

        flag.raise().unwrap();
        flag.raise().unwrap();

        assert!(flag.is_cancelled());
        assert_eq!(flag.raise_attempts(), 2);
    }

    #[test]
    fn test_flag_rejects_raise_after_finish() {
        let flag = CancellationFlag::new();
        flag.finish();

        let err = flag.raise().unwrap_err();
        assert!(matches!(err, RelayError::NotCancellable(_)));
        assert!(!flag.is_cancelled());
        assert!(flag.is_finished());
        assert_eq!(flag.raise_attempts(), 1);
    }

    #[test]
    fn test_flag_shared_across_threads() {
        let flag = CancellationFlag::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = flag.clone();
                thread::spawn(move || flag.raise())
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert!(flag.is_cancelled());
        assert_eq!(flag.raise_attempts(), 8);
    }

    #[test]
    fn test_closure_and_token_signals() {
        let failing = || -> Result<()> { Err(RelayError::NotCancellable("idle".to_string())) };
        assert!(failing.raise().is_err());

        let token = CancellationToken::new();
        let signal: Arc<dyn StopSignal> = Arc::new(token.clone());
        signal.raise().unwrap();
        assert!(token.is_cancelled());
    }
}
