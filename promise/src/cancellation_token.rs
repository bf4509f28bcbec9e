//! Cooperative cancellation shared between promises and caller code.
//!
//! A [`CancellationToken`] is a reference-counted flag. Promises observe it,
//! they never own it: the same token may be handed to many promises, and
//! cancelling it asks every body that polls it to stop at its next safe
//! checkpoint. Nothing is interrupted preemptively.
//!
//! # Example
//!
//! ```
//! use hardy_promise::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let child = token.child_token();
//!
//! // Cancel the whole tree
//! token.invalidate();
//! assert!(child.is_cancelled());
//! ```

use super::*;

/// A token for cooperative cancellation of promise bodies.
///
/// Wraps the `tokio_util` token, so it can also be awaited from async code
/// through [`cancelled`](Self::cancelled).
///
/// # Key Methods
///
/// - `new()` - Create a new cancellation token
/// - `child_token()` - Create a child token that cancels when its parent does
/// - `invalidate()` / `cancel()` - Signal cancellation
/// - `is_cancelled()` - Check if cancellation has been requested
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(tokio_util::sync::CancellationToken);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a child token for hierarchical cancellation.
    ///
    /// Cancelling the child leaves the parent untouched, but cancelling the
    /// parent is observed by every child.
    pub fn child_token(&self) -> Self {
        Self(self.0.child_token())
    }

    /// Marks the token as cancelled. Repeated calls are no-ops.
    pub fn invalidate(&self) {
        if !self.0.is_cancelled() {
            trace!("Cancellation token invalidated");
        }
        self.0.cancel();
    }

    /// Same as [`invalidate`](Self::invalidate).
    pub fn cancel(&self) {
        self.invalidate()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}

impl From<tokio_util::sync::CancellationToken> for CancellationToken {
    fn from(token: tokio_util::sync::CancellationToken) -> Self {
        Self(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.invalidate();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn child_cancels_independently() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        // Cancel child without affecting parent
        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancels_descendants() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let grandchild = child.child_token();

        parent.invalidate();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn wraps_tokio_util_token() {
        let inner = tokio_util::sync::CancellationToken::new();
        let token = CancellationToken::from(inner.clone());
        let child = token.child_token();

        inner.cancel();

        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
    }
}
