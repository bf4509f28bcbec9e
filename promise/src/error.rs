use super::*;
use thiserror::Error;

/// A specialized `Result` type for promise operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors a promise can be rejected with.
///
/// `Error` is cheap to clone, because a single rejection is delivered to
/// every observer of the rejected promise.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The combinator was given input it cannot work with, such as an empty
    /// set of promises for [`any`](crate::any) or zero retry attempts.
    #[error("Invalid input")]
    InvalidInput,

    /// [`Promise::wait`](crate::Promise::wait) was called from the serial
    /// context the promise itself runs on, which would never wake up.
    #[error("Cannot wait for a promise on its own serial context")]
    InvalidContext,

    /// A timer fired before the promise settled.
    #[error("Timed out")]
    Timeout,

    /// An [`ensure`](crate::Promise::ensure) predicate returned `false`.
    #[error("Predicate rejected the value")]
    PredicateRejected,

    /// The promise was cancelled; only reported by the synchronous bridge.
    #[error("Cancelled")]
    Cancelled,

    /// A body or handler panicked.
    #[error("Panicked: {0}")]
    Panicked(String),

    /// An error supplied by user code.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error value so it can be carried through a chain.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(Arc::from(error.into()))
    }

    /// Returns the wrapped user error if it is of type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Other(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Custom(u32);

    impl std::fmt::Display for Custom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "custom {}", self.0)
        }
    }

    impl std::error::Error for Custom {}

    #[test]
    fn other_round_trips_through_downcast() {
        let e = Error::other(Custom(7));
        assert_eq!(e.downcast_ref::<Custom>(), Some(&Custom(7)));
        assert_eq!(e.to_string(), "custom 7");

        // Clones share the same payload
        let c = e.clone();
        assert_eq!(c.downcast_ref::<Custom>(), Some(&Custom(7)));
    }

    #[test]
    fn other_from_str() {
        let e = Error::other("boom");
        assert_eq!(e.to_string(), "boom");
        assert!(e.downcast_ref::<Custom>().is_none());
    }

    #[test]
    fn panic_payloads() {
        let e = Error::from_panic(Box::new("static"));
        assert!(matches!(e, Error::Panicked(ref m) if m == "static"));

        let e = Error::from_panic(Box::new(String::from("owned")));
        assert!(matches!(e, Error::Panicked(ref m) if m == "owned"));

        let e = Error::from_panic(Box::new(42u8));
        assert!(matches!(e, Error::Panicked(_)));
    }
}
