//! Probabilistic sampling with a guaranteed recording budget.
//!
//! The sampling controller decides, per root activity, whether it should be
//! flagged for recording. Multiple [`ActivityConfig`] registrations are
//! merged into one effective threshold with most-verbose-wins union
//! semantics: the live registration requesting the highest percentage
//! determines the fraction of non-parented activities that record.
//!
//! On top of the probabilistic threshold sits a bounded budget of explicit
//! recording slots. A caller that was already being recorded upstream
//! (cross-process) can request recording and will be honored even against
//! an unlucky hash, as long as budget remains; the budget replenishes from
//! sampled traffic that arrives while it is exhausted.
//!
//! All decisions are made with lock-free atomics; only registration and
//! deregistration take a lock, and in-flight decisions may observe a stale
//! (but previously valid) threshold.

use crate::error::{handle_error, ActivityError};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Record when the 16-bit id hash is `<=` this value. `u16::MAX` = 100%.
static SAMPLE_IF_LESS_EQ: AtomicU16 = AtomicU16::new(u16::MAX);

/// Remaining slots for honoring explicit recording requests whose hash
/// fell outside the sampled range.
static EXPLICIT_RECORD_BUDGET: AtomicI32 = AtomicI32::new(DEFAULT_EXPLICIT_BUDGET);

/// State of the process-wide pseudo-random hash sequence.
static HASH_STATE: AtomicU32 = AtomicU32::new(0x2545_f491);

static REGISTRY: Mutex<Vec<Arc<ActivityConfig>>> = Mutex::new(Vec::new());

const DEFAULT_EXPLICIT_BUDGET: i32 = 64;

/// A requested sampling rate, registered into the process-wide controller
/// with [`register_sampling_config`].
///
/// Each instance can be registered once; deregistration happens
/// deterministically when the returned [`SamplingRegistration`] is dropped.
#[derive(Debug)]
pub struct ActivityConfig {
    sample_if_less_eq: u16,
    registered: AtomicBool,
}

impl ActivityConfig {
    /// Creates a config requesting that `percent` of non-parented
    /// activities record.
    ///
    /// The value is clamped to `0.0..=100.0`.
    pub fn new(percent: f64) -> Self {
        let fraction = (percent.clamp(0.0, 100.0)) / 100.0;
        ActivityConfig {
            sample_if_less_eq: (fraction * f64::from(u16::MAX)).round() as u16,
            registered: AtomicBool::new(false),
        }
    }

    /// The threshold this config requests, as a 16-bit fixed-point
    /// fraction (`u16::MAX` = 100%).
    pub fn sample_if_less_eq(&self) -> u16 {
        self.sample_if_less_eq
    }
}

/// Deregistration handle returned by [`register_sampling_config`].
///
/// Dropping the handle removes the config from the controller and
/// recomputes the effective threshold from the remaining registrations.
#[derive(Debug)]
#[must_use = "dropping the registration deregisters the sampling config"]
pub struct SamplingRegistration {
    config: Option<Arc<ActivityConfig>>,
}

impl Drop for SamplingRegistration {
    fn drop(&mut self) {
        let Some(config) = self.config.take() else {
            return;
        };
        if let Ok(mut registry) = REGISTRY.lock() {
            registry.retain(|entry| !Arc::ptr_eq(entry, &config));
            SAMPLE_IF_LESS_EQ.store(effective_threshold(&registry), Ordering::Relaxed);
        }
    }
}

fn effective_threshold(registry: &[Arc<ActivityConfig>]) -> u16 {
    registry
        .iter()
        .map(|config| config.sample_if_less_eq)
        .max()
        .unwrap_or(u16::MAX)
}

/// Registers a sampling config with the process-wide controller.
///
/// The effective threshold becomes the most verbose request across all
/// live registrations. Registering the same instance twice is reported as
/// an error and yields an inert registration.
///
/// # Examples
///
/// ```
/// use activity_context::{register_sampling_config, ActivityConfig};
/// use std::sync::Arc;
///
/// let config = Arc::new(ActivityConfig::new(25.0));
/// let registration = register_sampling_config(config);
///
/// // ... activities created while registered sample at 25% ...
///
/// drop(registration); // deterministic deregistration
/// ```
pub fn register_sampling_config(config: Arc<ActivityConfig>) -> SamplingRegistration {
    if config.registered.swap(true, Ordering::AcqRel) {
        handle_error(ActivityError::ConfigAlreadyRegistered);
        return SamplingRegistration { config: None };
    }
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.push(config.clone());
        SAMPLE_IF_LESS_EQ.store(effective_threshold(&registry), Ordering::Relaxed);
    }
    SamplingRegistration {
        config: Some(config),
    }
}

/// Decides whether an activity with the given 16-bit id hash records.
///
/// `recording_requested` indicates the caller was already being recorded
/// upstream. In-range hashes record unconditionally, except that when the
/// explicit budget is exhausted and recording was not requested, the
/// sample is skipped and the slot is given back to the budget instead.
/// Out-of-range hashes record only on explicit request, consuming one
/// budget slot.
pub(crate) fn should_sample(recording_requested: bool, id_hash: u16) -> bool {
    if id_hash <= SAMPLE_IF_LESS_EQ.load(Ordering::Relaxed) {
        if !recording_requested && EXPLICIT_RECORD_BUDGET.load(Ordering::Relaxed) <= 0 {
            // Reserve capacity for future explicit requests instead of
            // sampling this one.
            EXPLICIT_RECORD_BUDGET.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        return true;
    }
    if recording_requested && EXPLICIT_RECORD_BUDGET.load(Ordering::Relaxed) > 0 {
        EXPLICIT_RECORD_BUDGET.fetch_sub(1, Ordering::Relaxed);
        return true;
    }
    false
}

/// Advances the process-wide pseudo-random state and returns the next
/// 16-bit candidate hash.
///
/// A plain linear-congruential step applied with `fetch_update`; the high
/// half of the 32-bit state is returned, which is the better-distributed
/// half of an LCG.
pub(crate) fn next_hash() -> u16 {
    let state = HASH_STATE
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |state| {
            Some(state.wrapping_mul(1_103_515_245).wrapping_add(12_345))
        })
        .unwrap_or_default()
        .wrapping_mul(1_103_515_245)
        .wrapping_add(12_345);
    (state >> 16) as u16
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.clear();
    }
    SAMPLE_IF_LESS_EQ.store(u16::MAX, Ordering::Relaxed);
    EXPLICIT_RECORD_BUDGET.store(DEFAULT_EXPLICIT_BUDGET, Ordering::Relaxed);
}
