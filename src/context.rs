//! Caller context: cancellation plus an optional deadline.
//!
//! A [`CallContext`] is handed to every blocking operation in this crate
//! (`RateLimiter::wait`, `ToolExecutor::run`, `ToolOrchestrator::dispatch`)
//! and to tool handlers themselves. Derived contexts share the parent's
//! cancellation and can only tighten its deadline.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextDone {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for ContextDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextDone::Cancelled => write!(f, "context cancelled"),
            ContextDone::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Cancellation token plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wrap an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context that expires after `timeout`, or earlier if
    /// this context's own deadline comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context with the earlier of `deadline` and this
    /// context's deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check of whether the context is already finished.
    pub fn err(&self) -> Option<ContextDone> {
        if self.token.is_cancelled() {
            return Some(ContextDone::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextDone::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextDone {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextDone::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextDone::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextDone::Cancelled
            }
        }
    }

    /// The underlying token, for handlers that want `select!` on it directly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_is_never_done() {
        let ctx = CallContext::background();
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());
        let res = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn timeout_expires() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, ContextDone::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextDone::DeadlineExceeded));
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child() {
        let parent = CallContext::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.done().await, ContextDone::Cancelled);
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CallContext::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn child_keeps_the_earlier_deadline() {
        let parent = CallContext::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
