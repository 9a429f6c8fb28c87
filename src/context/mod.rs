//! Tracking of the ambient "current" activity.
//!
//! The current activity is scoped to a logical execution flow, never shared
//! process-wide: each thread observes and mutates its own pointer, and
//! async flows carry it explicitly with [`FutureActivityExt`]. Nested
//! scopes created with [`mark_current`] restore the prior value when they
//! end, mirroring call/return nesting.
//!
//! [`Activity::start`] publishes the started activity as current for the
//! calling flow and [`Activity::stop`] restores the parent, so most code
//! never touches this module directly; it is the seam for code that needs
//! to read or pin the ambient activity explicitly.
//!
//! [`Activity::start`]: crate::Activity::start
//! [`Activity::stop`]: crate::Activity::stop

use crate::error::{handle_error, ActivityError};
use crate::Activity;
use std::cell::RefCell;
use std::marker::PhantomData;

#[cfg(feature = "futures")]
mod future_ext;

#[cfg(feature = "futures")]
pub use future_ext::{FutureActivityExt, SinkActivityExt, StreamActivityExt, WithActivity};

thread_local! {
    static CURRENT_ACTIVITY: RefCell<Option<Activity>> = const { RefCell::new(None) };
}

/// Returns the activity currently in scope for this flow, if any.
///
/// # Examples
///
/// ```
/// use activity_context::{context, Activity};
///
/// assert!(context::current().is_none());
///
/// let activity = Activity::new("request");
/// activity.start();
/// assert_eq!(context::current().unwrap().id(), activity.id());
/// activity.stop();
/// ```
pub fn current() -> Option<Activity> {
    CURRENT_ACTIVITY.with(|current| current.borrow().clone())
}

/// Replaces the current activity for this flow.
///
/// The target must be `None`, or an activity that has been started and not
/// finished. Invalid requests are reported as a non-fatal error and
/// ignored, leaving the visible current pointer unchanged.
pub fn set_current(activity: Option<Activity>) {
    if let Some(activity) = &activity {
        if !activity.is_valid_current() {
            handle_error(ActivityError::InvalidCurrent);
            return;
        }
    }
    CURRENT_ACTIVITY.with(|current| *current.borrow_mut() = activity);
}

/// Marks an activity as current for the duration of the returned guard,
/// restoring the previous current activity when the guard drops.
///
/// The target is validated like [`set_current`]; an invalid target leaves
/// the current pointer unchanged and yields an inert guard.
///
/// # Examples
///
/// ```
/// use activity_context::{context, Activity};
///
/// let activity = Activity::new("request");
/// activity.start();
/// context::set_current(None);
///
/// {
///     let _guard = context::mark_current(activity.clone());
///     assert_eq!(context::current().unwrap().id(), activity.id());
/// }
///
/// // Restored once the guard is gone.
/// assert!(context::current().is_none());
/// activity.stop();
/// ```
pub fn mark_current(activity: Activity) -> CurrentGuard {
    if !activity.is_valid_current() {
        handle_error(ActivityError::InvalidCurrent);
        return CurrentGuard {
            previous: None,
            _marker: PhantomData,
        };
    }
    let previous = CURRENT_ACTIVITY.with(|current| current.borrow_mut().replace(activity));
    CurrentGuard {
        previous: Some(Restore(previous)),
        _marker: PhantomData,
    }
}

/// Installs a started activity as current without validation; start() has
/// already established the invariants.
pub(crate) fn publish(activity: Activity) {
    CURRENT_ACTIVITY.with(|current| *current.borrow_mut() = Some(activity));
}

/// Restores the current pointer to `parent` if `stopped` is the visible
/// current activity; a stop on a non-current activity (e.g. from a sibling
/// flow) leaves the pointer alone.
pub(crate) fn restore_if_current(stopped: &Activity, parent: Option<Activity>) {
    CURRENT_ACTIVITY.with(|current| {
        let mut current = current.borrow_mut();
        if current.as_ref().is_some_and(|active| active.same(stopped)) {
            *current = parent;
        }
    });
}

/// Swaps the current pointer unconditionally, returning the previous
/// value. Used by the future adapter to move a flow's pointer in and out
/// of the thread it is being polled on.
#[cfg(feature = "futures")]
pub(crate) fn swap(activity: Option<Activity>) -> Option<Activity> {
    CURRENT_ACTIVITY.with(|current| std::mem::replace(&mut *current.borrow_mut(), activity))
}

/// A guard that restores the prior current activity when dropped.
///
/// Returned by [`mark_current`].
#[derive(Debug)]
pub struct CurrentGuard {
    /// `None` for inert guards produced by rejected requests.
    previous: Option<Restore>,
    /// Relies on thread locals, so must not cross threads.
    _marker: PhantomData<*const ()>,
}

#[derive(Debug)]
struct Restore(Option<Activity>);

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        if let Some(Restore(previous)) = self.previous.take() {
            let _ = CURRENT_ACTIVITY.try_with(|current| *current.borrow_mut() = previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(name: &str) -> Activity {
        let activity = Activity::new(name);
        activity.start();
        // Tests manage the current pointer explicitly.
        set_current(None);
        activity
    }

    #[test]
    fn set_current_accepts_started_activities() {
        let activity = started("request");
        set_current(Some(activity.clone()));
        assert!(current().unwrap().same(&activity));
        set_current(None);
        assert!(current().is_none());
    }

    #[test]
    fn set_current_rejects_unstarted_activities() {
        let unstarted = Activity::new("request");
        set_current(Some(unstarted));
        assert!(current().is_none());
    }

    #[test]
    fn set_current_rejects_finished_activities() {
        let activity = started("request");
        activity.stop();
        set_current(Some(activity));
        assert!(current().is_none());
    }

    #[test]
    fn rejected_set_leaves_pointer_unchanged() {
        let activity = started("request");
        set_current(Some(activity.clone()));
        set_current(Some(Activity::new("unstarted")));
        assert!(current().unwrap().same(&activity));
        set_current(None);
    }

    #[test]
    fn guards_restore_in_nested_scopes() {
        let outer = started("outer");
        let inner = started("inner");

        let outer_guard = mark_current(outer.clone());
        assert!(current().unwrap().same(&outer));
        {
            let _inner_guard = mark_current(inner.clone());
            assert!(current().unwrap().same(&inner));
        }
        assert!(current().unwrap().same(&outer));
        drop(outer_guard);
        assert!(current().is_none());
    }

    #[test]
    fn invalid_mark_yields_inert_guard() {
        let activity = started("request");
        set_current(Some(activity.clone()));

        let guard = mark_current(Activity::new("unstarted"));
        assert!(current().unwrap().same(&activity));
        drop(guard);
        assert!(current().unwrap().same(&activity));
        set_current(None);
    }

    #[test]
    fn current_is_thread_isolated() {
        let activity = started("request");
        set_current(Some(activity));
        let seen_elsewhere = std::thread::spawn(|| current().is_some())
            .join()
            .expect("thread panicked");
        assert!(!seen_elsewhere);
        set_current(None);
    }
}
