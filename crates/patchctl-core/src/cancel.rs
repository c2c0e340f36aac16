//! Cooperative cancellation with an optional deadline.
//!
//! Long-running work (test commands, git subprocesses, file sweeps) checks
//! the token between steps or races it against child processes. The signal
//! itself is a `tokio_util` token; only the deadline is tracked here.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken as SignalToken;

/// A cloneable cancellation signal. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    signal: SignalToken,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Create a token in the "not cancelled" state with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that reports cancellation once `budget` has elapsed.
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            signal: SignalToken::new(),
            deadline: Some(Instant::now() + budget),
        }
    }

    /// A token that is cancelled when `self` is, but can also be cancelled
    /// on its own without affecting `self`. Inherits the deadline.
    pub fn child_token(&self) -> Self {
        Self {
            signal: self.signal.child_token(),
            deadline: self.deadline,
        }
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    /// Whether cancellation was requested or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolve once the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.signal.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.signal.cancelled().await,
        }
    }
}
