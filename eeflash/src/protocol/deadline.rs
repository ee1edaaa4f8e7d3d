//! Deadline-bounded polling.
//!
//! Every wait in the host client goes through [`poll_until`]: it retries a
//! non-blocking probe until the probe yields a value, the [`Deadline`]
//! expires, or cancellation is requested. Expiry is reported as `Ok(None)` so
//! callers can attach their own context (and any partial data) to the
//! timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Pause between probes of the transport.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Cloneable cancellation flag for in-flight waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every wait observing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Wall-clock point after which a pending wait is abandoned.
#[derive(Debug, Clone)]
pub struct Deadline {
    timeout: Duration,
    expires: Instant,
    cancel: Option<CancelToken>,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            timeout,
            expires: Instant::now() + timeout,
            cancel: None,
        }
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Option<CancelToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Push the deadline out by the full timeout, measured from now.
    ///
    /// Used by streaming reads, where the deadline bounds silence rather than
    /// the whole transfer.
    pub fn extend(&mut self) {
        self.expires = Instant::now() + self.timeout;
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
            || crate::is_interrupted_requested()
    }
}

/// Retry `probe` until it yields a value or the deadline expires.
///
/// The probe runs at least once, even on an already expired deadline.
/// Returns `Ok(None)` on expiry and [`Error::Interrupted`] on cancellation.
pub fn poll_until<T, F>(deadline: &Deadline, mut probe: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    loop {
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }
        if deadline.cancelled() {
            return Err(Error::Interrupted);
        }
        if deadline.expired() {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline.remaining()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_value_returned() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let mut calls = 0;
        let value = poll_until(&deadline, || {
            calls += 1;
            Ok((calls == 3).then_some(42))
        })
        .unwrap();
        assert_eq!(value, Some(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_expiry_returns_none_within_bound() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let start = Instant::now();
        let value: Option<u8> = poll_until(&deadline, || Ok(None)).unwrap();
        assert!(value.is_none());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_probe_runs_once_on_expired_deadline() {
        let deadline = Deadline::after(Duration::ZERO);
        let value = poll_until(&deadline, || Ok(Some(()))).unwrap();
        assert!(value.is_some());
    }

    #[test]
    fn test_cancel_token_interrupts() {
        let token = CancelToken::new();
        token.cancel();
        let deadline = Deadline::after(Duration::from_secs(10)).with_cancel(Some(token));
        let result: Result<Option<u8>> = poll_until(&deadline, || Ok(None));
        assert!(matches!(result, Err(Error::Interrupted)));
    }

    #[test]
    fn test_probe_error_propagates() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let result: Result<Option<u8>> =
            poll_until(&deadline, || Err(Error::HandshakeFailed("boom".into())));
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
    }

    #[test]
    fn test_extend_pushes_expiry() {
        let mut deadline = Deadline::after(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(30));
        deadline.extend();
        assert!(deadline.remaining() > Duration::from_millis(30));
        assert_eq!(deadline.timeout(), Duration::from_millis(50));
    }
}
