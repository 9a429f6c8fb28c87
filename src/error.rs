//! Error taxonomy and the global diagnostic handler.
//!
//! Instrumentation must never crash the instrumented application, so no
//! public operation in this crate returns an error or panics. Misuse is
//! instead reported through [`handle_error`] and the operation degrades to
//! a no-op, leaving prior state unchanged. Monitoring tooling that wants to
//! observe misuse can install a handler with [`set_error_handler`].

use std::sync::RwLock;
use thiserror::Error;

static GLOBAL_ERROR_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

struct ErrorHandler(Box<dyn Fn(ActivityError) + Send + Sync>);

/// Non-fatal errors reported by activity operations.
///
/// These are never returned to callers. They are delivered synchronously to
/// the handler installed via [`set_error_handler`], if any, and otherwise
/// logged through the crate's internal diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActivityError {
    /// `start` was called on an activity that already has an id.
    #[error("activity has already been started")]
    AlreadyStarted,

    /// `stop` or another post-start operation was called before `start`.
    #[error("activity has not been started")]
    NotStarted,

    /// An identity field was modified after `start` completed.
    #[error("activity identity is immutable after start")]
    ModifiedAfterStart,

    /// `set_parent_id` was called when a parent was already established.
    #[error("activity parent has already been set")]
    ParentAlreadySet,

    /// A sampling config instance was registered more than once.
    #[error("sampling config is already registered")]
    ConfigAlreadyRegistered,

    /// The current activity was set to an unstarted or finished activity.
    #[error("current activity must be started and not finished")]
    InvalidCurrent,

    /// An activity was constructed with an empty operation name.
    #[error("operation name must not be empty")]
    EmptyOperationName,

    /// `set_parent_id` was called with an empty id.
    #[error("parent id must not be empty")]
    EmptyParentId,

    /// The process-wide default id format was set to `Unknown`.
    #[error("default id format must be hierarchical or w3c")]
    UnknownIdFormat,
}

/// Coarse classification of an [`ActivityError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation was valid but arrived in the wrong lifecycle state.
    InvalidState,
    /// The operation was given an unusable argument.
    InvalidArgument,
}

impl ActivityError {
    /// The class of failure this error represents.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActivityError::AlreadyStarted
            | ActivityError::NotStarted
            | ActivityError::ModifiedAfterStart
            | ActivityError::ParentAlreadySet
            | ActivityError::ConfigAlreadyRegistered
            | ActivityError::InvalidCurrent => ErrorKind::InvalidState,
            ActivityError::EmptyOperationName
            | ActivityError::EmptyParentId
            | ActivityError::UnknownIdFormat => ErrorKind::InvalidArgument,
        }
    }
}

/// Reports an error through the globally configured handler.
///
/// Invoked synchronously at the point of failure. Falls back to the
/// crate's internal logging when no handler is installed.
pub(crate) fn handle_error(err: ActivityError) {
    match GLOBAL_ERROR_HANDLER.read() {
        Ok(guard) => match guard.as_ref() {
            Some(handler) => (handler.0)(err),
            None => {
                crate::actx_warn!(name: "Activity.Error", error = err.to_string());
            }
        },
        Err(_) => {
            crate::actx_warn!(name: "Activity.Error", error = err.to_string());
        }
    }
}

/// Sets the global handler invoked whenever an activity operation is
/// silently degraded.
///
/// The handler is called synchronously on the thread where the failure
/// occurred, before the failing operation returns.
///
/// # Examples
///
/// ```
/// use activity_context::{set_error_handler, Activity};
///
/// set_error_handler(|err| eprintln!("activity misuse: {err}"));
///
/// // Double-start is reported to the handler and otherwise ignored.
/// let activity = Activity::new("request");
/// activity.start();
/// activity.start();
/// ```
pub fn set_error_handler<F>(f: F)
where
    F: Fn(ActivityError) + Send + Sync + 'static,
{
    if let Ok(mut handler) = GLOBAL_ERROR_HANDLER.write() {
        *handler = Some(ErrorHandler(Box::new(f)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(ActivityError::AlreadyStarted.kind(), ErrorKind::InvalidState);
        assert_eq!(ActivityError::NotStarted.kind(), ErrorKind::InvalidState);
        assert_eq!(ActivityError::InvalidCurrent.kind(), ErrorKind::InvalidState);
        assert_eq!(
            ActivityError::EmptyOperationName.kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            ActivityError::UnknownIdFormat.kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn handle_error_does_not_panic_without_handler() {
        handle_error(ActivityError::NotStarted);
    }

    #[test]
    fn lifecycle_misuse_reaches_installed_handler() {
        let _lock = crate::testing::serialize_global_state();
        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        set_error_handler(move |err| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(err);
            }
        });

        let activity = crate::Activity::new("request");
        activity.start();
        activity.start();
        activity.stop();

        // Concurrent tests may report their own misuse through the same
        // handler, so assert delivery rather than exact contents.
        let seen = delivered.lock().unwrap();
        assert!(seen.contains(&ActivityError::AlreadyStarted));
        drop(seen);

        // Leave no handler capturing test-local state behind.
        set_error_handler(|_| {});
    }
}
