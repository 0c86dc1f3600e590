//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is checked at call boundaries; it never interrupts
//! I/O that is already in flight.

use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Requests cancellation once `millis` milliseconds have passed.
    pub fn cancel_after(&self, millis: u64) {
        let deadline = Instant::now() + Duration::from_millis(millis);
        *self.state.deadline.lock() = Some(deadline);
    }

    /// Returns true if cancel was called or the deadline passed.
    pub fn is_cancellation_requested(&self) -> bool {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let deadline = *self.state.deadline.lock();
        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            self.state.cancelled.store(true, Ordering::SeqCst);
        }
        expired
    }

    /// Fails with [`ClientError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> ClientResult<()> {
        if self.is_cancellation_requested() {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(observer.check_cancelled().is_ok());

        token.cancel();
        assert!(observer.is_cancellation_requested());
        assert!(matches!(observer.check_cancelled(), Err(ClientError::Cancelled)));
    }

    #[test]
    fn cancel_after_deadline() {
        let token = CancellationToken::new();
        token.cancel_after(0);
        assert!(token.is_cancellation_requested());

        let later = CancellationToken::new();
        later.cancel_after(60_000);
        assert!(!later.is_cancellation_requested());
    }
}
