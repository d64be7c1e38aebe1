//! Error types for computed values.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

/// Errors produced while computing, reading or invalidating a computed value.
///
/// User errors can be propagated using the `?` operator, which automatically
/// converts any `Into<anyhow::Error>` type into `ComputeError::UserError`.
///
/// The error is `Clone` because it is stored as the output of a computed node
/// and handed to every reader of that node.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// A wait or computation was cancelled by the caller.
    Cancelled,

    /// A compute function read its own call identity in the same flow.
    ///
    /// The `path` contains the debug representation of the identity that
    /// was re-entered.
    Cycle {
        /// Debug representation of the identities forming the cycle.
        path: Vec<String>,
    },

    /// The read was performed in invalidation mode.
    ///
    /// The existing entry for the call (if any) was invalidated instead of
    /// being computed, so there is no value to return.
    Invalidating,

    /// The node has no output yet because it is still computing.
    NotComputed,

    /// The function, lock entry or call backing this value was already disposed.
    Disposed,

    /// User-defined error.
    ///
    /// Compute-function failures land here and are cached as the node's
    /// output, so every reader observes the same error until the node is
    /// invalidated.
    UserError(Arc<anyhow::Error>),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Cancelled => write!(f, "computation cancelled"),
            ComputeError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            ComputeError::Invalidating => {
                write!(f, "read performed in invalidation mode")
            }
            ComputeError::NotComputed => write!(f, "computed value is not ready yet"),
            ComputeError::Disposed => write!(f, "already disposed"),
            ComputeError::UserError(e) => write!(f, "user error: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::UserError(Arc::new(err.into()))
    }
}

impl ComputeError {
    /// Returns a reference to the inner user error if this is a `UserError` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ComputeError::UserError(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `UserError` containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Map a lock failure. A reentrant lock on the same call is a cycle.
    pub fn from_lock(err: crate::LockError) -> Self {
        match err {
            crate::LockError::AlreadyLocked { key } => ComputeError::Cycle { path: vec![key] },
            crate::LockError::Disposed => ComputeError::Disposed,
            crate::LockError::Cancelled => ComputeError::Cancelled,
        }
    }
}

/// A typed wrapper around a user error that provides `Deref` access to the inner error type.
///
/// # Example
///
/// ```ignore
/// use computed_flow::{ComputeResultExt, TypedErr};
///
/// match user.get(id).await.downcast_err::<NotFound>()? {
///     Ok(user) => { /* success */ }
///     Err(not_found) => println!("missing: {}", not_found.0),
/// }
/// ```
#[derive(Clone)]
pub struct TypedErr<E> {
    arc: Arc<anyhow::Error>,
    _marker: PhantomData<E>,
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    fn new(arc: Arc<anyhow::Error>) -> Option<Self> {
        arc.downcast_ref::<E>()?;
        Some(Self {
            arc,
            _marker: PhantomData,
        })
    }

    /// Returns a reference to the inner error.
    pub fn get(&self) -> &E {
        match self.arc.downcast_ref::<E>() {
            Some(err) => err,
            // `new` only constructs wrappers whose payload downcasts to `E`.
            None => unreachable!("TypedErr holds an error of another type"),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

/// Extension trait for computed results that provides ergonomic error downcasting.
pub trait ComputeResultExt<T> {
    /// Attempts to downcast a `UserError` to a specific error type.
    ///
    /// # Returns
    ///
    /// - `Ok(Ok(value))` - The computation succeeded with `value`
    /// - `Ok(Err(typed_err))` - The computation failed with a `UserError` of type `E`
    /// - `Err(compute_error)` - A system error, or a `UserError` that is not of type `E`
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<T, TypedErr<E>>, ComputeError>;
}

impl<T> ComputeResultExt<T> for Result<T, ComputeError> {
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<T, TypedErr<E>>, ComputeError> {
        match self {
            Ok(value) => Ok(Ok(value)),
            Err(ComputeError::UserError(arc)) => match TypedErr::new(arc.clone()) {
                Some(typed) => Ok(Err(typed)),
                None => Err(ComputeError::UserError(arc)),
            },
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("not found: {0}")]
    struct NotFound(String);

    #[test]
    fn test_user_error_from_anyhow() {
        let err: ComputeError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ComputeError::UserError(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_downcast_err() {
        let result: Result<i32, ComputeError> = Err(NotFound("a".into()).into());
        let typed = result.downcast_err::<NotFound>().unwrap().unwrap_err();
        assert_eq!(typed.0, "a");

        let result: Result<i32, ComputeError> = Err(ComputeError::Cancelled);
        assert!(matches!(
            result.downcast_err::<NotFound>(),
            Err(ComputeError::Cancelled)
        ));
    }

    #[test]
    fn test_lock_error_maps_to_cycle() {
        let err = ComputeError::from_lock(crate::LockError::AlreadyLocked {
            key: "sum(1)".into(),
        });
        match err {
            ComputeError::Cycle { path } => assert_eq!(path, vec!["sum(1)".to_string()]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }
}
