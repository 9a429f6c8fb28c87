//! Activity identity, ambient propagation, and sampling primitives for
//! distributed tracing.
//!
//! An [`Activity`] is a timed unit of work with an identity. Activities are
//! linked to their parents so that causally related operations across
//! threads, async continuations, and process boundaries can be correlated
//! by downstream logging and tracing systems. This crate provides the
//! identity engine only: it does not transmit anything over a network and
//! does not decide what gets logged, merely whether an activity is flagged
//! for recording and what identity it carries.
//!
//! # Getting Started
//!
//! ```
//! use activity_context::Activity;
//!
//! let parent = Activity::new("request");
//! parent.start();
//!
//! // Activities started while another is current become its children and
//! // extend its id.
//! let child = Activity::new("handler");
//! child.start();
//! assert!(child.id().unwrap().starts_with(parent.id().unwrap()));
//!
//! // Stopping restores the parent as the current activity.
//! child.stop();
//! assert_eq!(
//!     activity_context::context::current().unwrap().id().map(str::to_owned),
//!     parent.id().map(str::to_owned),
//! );
//! parent.stop();
//! ```
//!
//! # Id formats
//!
//! Two incompatible id grammars are supported, selected per root activity:
//! the hierarchical format (`|root.child.grandchild.`), which encodes
//! lineage directly in the string, and the fixed 55-character
//! [W3C Trace Context] format (`00-{trace-id}-{span-id}-00`). The
//! process-wide default is controlled with [`set_default_id_format`], and
//! individual activities can be forced to a format with
//! [`Activity::set_id_format`] before they start.
//!
//! [W3C Trace Context]: https://www.w3.org/TR/trace-context/
//!
//! # Propagating across async boundaries
//!
//! The current activity is scoped to a logical execution flow, not shared
//! process-wide. Futures carry it explicitly:
//!
//! ```
//! # #[cfg(feature = "futures")]
//! # {
//! use activity_context::{context::FutureActivityExt, Activity};
//!
//! async fn handle() {
//!     // `context::current()` here observes the activity attached below.
//! }
//!
//! let activity = Activity::new("request");
//! activity.start();
//! let fut = handle().with_activity(Some(activity));
//! # }
//! ```
//!
//! # Sampling
//!
//! [`Activity::new_sampled`] consults the process-wide sampling controller
//! and marks the returned activity as recording or not. The effective
//! sampling rate is the most verbose of all live
//! [`ActivityConfig`] registrations.
//!
//! ```
//! use activity_context::{register_sampling_config, ActivityConfig, Activity};
//! use std::sync::Arc;
//!
//! let config = Arc::new(ActivityConfig::new(100.0));
//! let registration = register_sampling_config(config);
//!
//! let activity = Activity::new_sampled("request", false);
//! assert!(activity.is_recording());
//!
//! // Dropping the registration deterministically deregisters the config.
//! drop(registration);
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod context;
mod error;
mod id;
mod sampler;

mod activity;

pub use activity::{Activity, BaggageIter, KeyValue, TagIter};
pub use error::{set_error_handler, ActivityError, ErrorKind};
pub use id::{default_id_format, set_default_id_format, IdFormat, SpanId, TraceId};
pub use sampler::{register_sampling_config, ActivityConfig, SamplingRegistration};

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, warn};
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard};

    /// Serializes tests that touch process-global state (the default id
    /// format and the sampling controller), which would otherwise race
    /// across the test harness's worker threads.
    pub(crate) fn serialize_global_state() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Internal diagnostics at debug level.
///
/// Intended for use within this crate only; not a general logging facility.
#[doc(hidden)]
#[macro_export]
macro_rules! actx_debug {
    (name: $name:expr $(, $key:ident = $value:expr)* $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(target: env!("CARGO_PKG_NAME"), name = $name $(, $key = $value)*);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("actx_debug: name={}", $name);
            $(print!(", {}={}", stringify!($key), $value);)*
            println!();
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name $(, $value)*);
        }
    };
}

/// Internal diagnostics at warn level.
#[doc(hidden)]
#[macro_export]
macro_rules! actx_warn {
    (name: $name:expr $(, $key:ident = $value:expr)* $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(target: env!("CARGO_PKG_NAME"), name = $name $(, $key = $value)*);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("actx_warn: name={}", $name);
            $(print!(", {}={}", stringify!($key), $value);)*
            println!();
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name $(, $value)*);
        }
    };
}

/// Internal diagnostics at error level.
#[doc(hidden)]
#[macro_export]
macro_rules! actx_error {
    (name: $name:expr $(, $key:ident = $value:expr)* $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(target: env!("CARGO_PKG_NAME"), name = $name $(, $key = $value)*);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("actx_error: name={}", $name);
            $(print!(", {}={}", stringify!($key), $value);)*
            println!();
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name $(, $value)*);
        }
    };
}
