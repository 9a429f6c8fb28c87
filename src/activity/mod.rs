//! The activity entity and its lifecycle.
//!
//! An [`Activity`] is constructed unstarted, configured (tags, baggage,
//! parent, start time — identity fields only before start), started, and
//! finally stopped. [`Activity::start`] resolves the id format, generates
//! the id, links the activity to the ambient current activity when no
//! explicit parent was supplied, and publishes the activity as current for
//! the calling flow. [`Activity::stop`] finalizes the duration and restores
//! the current activity to the parent.
//!
//! Misuse of the lifecycle never panics and never returns an error;
//! invalid calls are reported through the diagnostic channel and degrade
//! to no-ops (see [`crate::set_error_handler`]).

mod chain;

pub use chain::KeyValue;
use chain::{Chain, ChainIter};

use crate::context;
use crate::error::{handle_error, ActivityError};
use crate::id::{self, IdFormat};
use crate::sampler;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A timed unit of work with an identity, used to correlate related
/// operations for tracing and logging.
///
/// `Activity` is a cheap handle; cloning it yields another handle to the
/// same underlying activity. A single activity's lifecycle methods are
/// meant to be driven by one logical flow at a time, while reads (id,
/// baggage, tags) are safe from anywhere.
///
/// # Examples
///
/// ```
/// use activity_context::Activity;
///
/// let activity = Activity::new("request");
/// activity
///     .add_tag("http.method", "GET")
///     .add_baggage("tenant", "contoso")
///     .start();
///
/// assert!(activity.id().is_some());
/// activity.stop();
/// assert!(activity.is_finished());
/// ```
#[derive(Clone)]
pub struct Activity {
    inner: Arc<ActivityInner>,
}

pub(crate) struct ActivityInner {
    operation_name: String,
    /// Assigned exactly once, at start.
    id: OnceLock<String>,
    /// Established at most once, before start completes.
    parent: OnceLock<Parent>,
    /// Lazily computed from `id`/`parent_id`; ids are immutable once
    /// assigned, so the cache is never invalidated.
    root_id: OnceLock<String>,
    trace_state: Mutex<Option<String>>,
    /// Nanoseconds since `UNIX_EPOCH`; 0 = not set.
    start_time_nanos: AtomicU64,
    /// Nanoseconds; 0 = not ended.
    duration_nanos: AtomicU64,
    id_format: AtomicU8,
    recording: AtomicBool,
    finished: AtomicBool,
    /// Counter feeding hierarchical child suffixes of this activity.
    child_id: AtomicU64,
    tags: Mutex<Chain>,
    baggage: Mutex<Chain>,
}

enum Parent {
    /// Cross-process parent known only by its id string.
    Remote(String),
    /// In-process parent; a back-reference only, never owning.
    InProcess(Weak<ActivityInner>),
}

impl Activity {
    /// Creates a new unstarted activity.
    ///
    /// An empty operation name is reported as an error; the activity is
    /// still constructed and usable, carrying the empty name.
    pub fn new(operation_name: impl Into<String>) -> Activity {
        let operation_name = operation_name.into();
        if operation_name.is_empty() {
            handle_error(ActivityError::EmptyOperationName);
        }
        Activity {
            inner: Arc::new(ActivityInner {
                operation_name,
                id: OnceLock::new(),
                parent: OnceLock::new(),
                root_id: OnceLock::new(),
                trace_state: Mutex::new(None),
                start_time_nanos: AtomicU64::new(0),
                duration_nanos: AtomicU64::new(0),
                id_format: AtomicU8::new(IdFormat::Unknown as u8),
                recording: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                child_id: AtomicU64::new(0),
                tags: Mutex::new(Chain::default()),
                baggage: Mutex::new(Chain::default()),
            }),
        }
    }

    /// Creates a new unstarted activity whose `recording` flag is decided
    /// by the process-wide sampling controller.
    ///
    /// This is the only path that sets the recording flag.
    /// `recording_requested` indicates an upstream caller was already
    /// recording this unit of work (for example, a remote peer whose
    /// decision should be honored); such requests are honored even against
    /// an unlucky hash, up to a bounded quota.
    pub fn new_sampled(operation_name: impl Into<String>, recording_requested: bool) -> Activity {
        let activity = Activity::new(operation_name);
        let recording = sampler::should_sample(recording_requested, sampler::next_hash());
        activity.inner.recording.store(recording, Ordering::Relaxed);
        activity
    }

    /// The name of the operation this activity represents.
    pub fn operation_name(&self) -> &str {
        &self.inner.operation_name
    }

    /// The activity's id, or `None` before start.
    pub fn id(&self) -> Option<&str> {
        self.inner.id.get().map(String::as_str)
    }

    /// The id of this activity's parent: the explicit cross-process parent
    /// id if one was set, otherwise the id of the in-process parent.
    pub fn parent_id(&self) -> Option<String> {
        match self.inner.parent.get() {
            Some(Parent::Remote(id)) => Some(id.clone()),
            Some(Parent::InProcess(parent)) => parent
                .upgrade()
                .and_then(|parent| parent.id.get().cloned()),
            None => None,
        }
    }

    /// The root id shared by every activity in this trace.
    ///
    /// For W3C ids this is the trace-id segment; for hierarchical ids the
    /// token between the leading `|` and the first `.`. Computed from the
    /// id (or parent id, when not yet started) on first read and cached.
    pub fn root_id(&self) -> Option<&str> {
        if let Some(root) = self.inner.root_id.get() {
            return Some(root);
        }
        let source = match self.id() {
            Some(id) => id.to_owned(),
            None => self.parent_id()?,
        };
        let _ = self.inner.root_id.set(id::root_id_of(&source).to_owned());
        self.inner.root_id.get().map(String::as_str)
    }

    /// The wall-clock start time, or `None` before it is set or started.
    pub fn start_time(&self) -> Option<SystemTime> {
        match self.inner.start_time_nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(UNIX_EPOCH + Duration::from_nanos(nanos)),
        }
    }

    /// The duration of the activity. Zero means "not ended".
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.inner.duration_nanos.load(Ordering::Relaxed))
    }

    /// The id format this activity uses; `Unknown` until resolved at start.
    pub fn id_format(&self) -> IdFormat {
        match self.inner.id_format.load(Ordering::Relaxed) {
            1 => IdFormat::Hierarchical,
            2 => IdFormat::W3c,
            _ => IdFormat::Unknown,
        }
    }

    /// Whether the sampling controller flagged this activity for recording.
    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::Relaxed)
    }

    /// Whether `stop` has completed.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Relaxed)
    }

    /// Adds a tag: local-only metadata never seen by child activities.
    pub fn add_tag(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        let entry = KeyValue::new(key, value);
        if let Ok(mut tags) = self.inner.tags.lock() {
            *tags = tags.prepended(entry);
        }
        self
    }

    /// Adds a baggage entry: metadata logically inherited by descendants.
    pub fn add_baggage(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        let entry = KeyValue::new(key, value);
        if let Ok(mut baggage) = self.inner.baggage.lock() {
            *baggage = baggage.prepended(entry);
        }
        self
    }

    /// Sets the cross-process parent id.
    ///
    /// Must be called before start, at most once, and with a non-empty id;
    /// violations are reported and ignored.
    pub fn set_parent_id(&self, parent_id: impl Into<String>) -> &Self {
        let parent_id = parent_id.into();
        if self.id().is_some() {
            handle_error(ActivityError::ModifiedAfterStart);
            return self;
        }
        if parent_id.is_empty() {
            handle_error(ActivityError::EmptyParentId);
            return self;
        }
        if self
            .inner
            .parent
            .set(Parent::Remote(parent_id))
            .is_err()
        {
            handle_error(ActivityError::ParentAlreadySet);
        }
        self
    }

    /// Forces this activity's id format ahead of start.
    ///
    /// A forced format wins over both the parent id's grammar and the
    /// process-wide default.
    pub fn set_id_format(&self, format: IdFormat) -> &Self {
        if self.id().is_some() {
            handle_error(ActivityError::ModifiedAfterStart);
            return self;
        }
        if format == IdFormat::Unknown {
            handle_error(ActivityError::UnknownIdFormat);
            return self;
        }
        self.inner.id_format.store(format as u8, Ordering::Relaxed);
        self
    }

    /// Sets the start time explicitly instead of sampling the clock at
    /// start.
    pub fn set_start_time(&self, time: SystemTime) -> &Self {
        self.inner
            .start_time_nanos
            .store(nanos_since_epoch(time).max(1), Ordering::Relaxed);
        self
    }

    /// Sets the end time, fixing the duration relative to the start time.
    ///
    /// An end time at or before the start time yields the minimum non-zero
    /// duration, so an ended activity is always distinguishable from a
    /// running one. Reported and ignored if the activity has not started.
    pub fn set_end_time(&self, time: SystemTime) -> &Self {
        let start = self.inner.start_time_nanos.load(Ordering::Relaxed);
        if start == 0 {
            handle_error(ActivityError::NotStarted);
            return self;
        }
        let duration = nanos_since_epoch(time).saturating_sub(start).max(1);
        self.inner.duration_nanos.store(duration, Ordering::Relaxed);
        self
    }

    /// Sets the W3C `tracestate` value carried by this trace.
    pub fn set_trace_state(&self, state: impl Into<String>) -> &Self {
        if let Ok(mut trace_state) = self.inner.trace_state.lock() {
            *trace_state = Some(state.into());
        }
        self
    }

    /// The `tracestate` value: the local one if set, otherwise the first
    /// one found walking up the ancestor chain.
    pub fn trace_state(&self) -> Option<String> {
        let mut current = Some(self.inner.clone());
        while let Some(inner) = current {
            if let Ok(state) = inner.trace_state.lock() {
                if state.is_some() {
                    return state.clone();
                }
            }
            current = inner.in_process_parent();
        }
        None
    }

    /// Iterates this activity's local tags, newest first. Ancestor tags
    /// are never included.
    pub fn tags(&self) -> TagIter {
        TagIter {
            iter: self.inner.tags_snapshot(),
        }
    }

    /// Iterates baggage entries visible to this activity: the local chain
    /// newest-first, then each ancestor's chain in turn.
    ///
    /// A key set closer to this activity shadows the same key set further
    /// up; [`Activity::get_baggage_item`] returns the nearest value.
    pub fn baggage(&self) -> BaggageIter {
        BaggageIter {
            iter: self.inner.baggage_snapshot(),
            next_ancestor: self.inner.in_process_parent(),
        }
    }

    /// Returns the nearest value for a baggage key, searching this
    /// activity first and then its ancestors.
    pub fn get_baggage_item(&self, key: &str) -> Option<String> {
        self.baggage()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value)
    }

    /// Starts the activity: links it to the ambient current activity when
    /// no explicit parent id was set, resolves the id format, assigns the
    /// id, and publishes the activity as current for this flow.
    ///
    /// Starting twice is reported and ignored.
    pub fn start(&self) -> &Self {
        if self.id().is_some() {
            handle_error(ActivityError::AlreadyStarted);
            return self;
        }

        if self.inner.parent.get().is_none() {
            if let Some(current) = context::current() {
                let _ = self
                    .inner
                    .parent
                    .set(Parent::InProcess(Arc::downgrade(&current.inner)));
            }
        }

        if self.inner.start_time_nanos.load(Ordering::Relaxed) == 0 {
            self.inner
                .start_time_nanos
                .store(nanos_since_epoch(SystemTime::now()).max(1), Ordering::Relaxed);
        }

        let parent_id = self.parent_id();
        let format = self.resolve_format(parent_id.as_deref());
        self.inner.id_format.store(format as u8, Ordering::Relaxed);

        let new_id = match format {
            IdFormat::W3c => {
                id::new_w3c_id(parent_id.as_deref().filter(|pid| id::is_w3c_id(pid)))
            }
            _ => self.generate_hierarchical_id(parent_id.as_deref()),
        };
        let _ = self.inner.id.set(new_id);

        context::publish(self.clone());
        self
    }

    /// Stops the activity: finalizes the duration (unless `set_end_time`
    /// already fixed it) and restores the current activity to the parent.
    ///
    /// The restore only happens when this activity is the calling thread's
    /// visible current activity; a stop arriving from another flow leaves
    /// that flow's pointer untouched.
    ///
    /// Stopping twice is a no-op; stopping before start is reported and
    /// ignored.
    pub fn stop(&self) {
        if self.id().is_none() {
            handle_error(ActivityError::NotStarted);
            return;
        }
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.inner.duration_nanos.load(Ordering::Relaxed) == 0 {
            let start = self.inner.start_time_nanos.load(Ordering::Relaxed);
            let duration = nanos_since_epoch(SystemTime::now())
                .saturating_sub(start)
                .max(1);
            self.inner.duration_nanos.store(duration, Ordering::Relaxed);
        }

        let parent = self
            .inner
            .in_process_parent()
            .map(|inner| Activity { inner });
        context::restore_if_current(self, parent);
    }

    /// Format resolution: a pre-forced format wins; otherwise the parent
    /// id's grammar decides (inheritance by convention, not a hard field);
    /// otherwise the process-wide default applies.
    fn resolve_format(&self, parent_id: Option<&str>) -> IdFormat {
        match self.id_format() {
            IdFormat::Unknown => match parent_id {
                Some(pid) if id::is_w3c_id(pid) => IdFormat::W3c,
                Some(_) => IdFormat::Hierarchical,
                None => id::default_id_format(),
            },
            forced => forced,
        }
    }

    fn generate_hierarchical_id(&self, parent_id: Option<&str>) -> String {
        match self.inner.parent.get() {
            Some(Parent::InProcess(parent)) => match parent.upgrade() {
                Some(parent) if parent.id.get().is_some() => {
                    let child_number = parent.child_id.fetch_add(1, Ordering::Relaxed) + 1;
                    id::new_hierarchical_child_id(
                        parent.id.get().map(String::as_str).unwrap_or_default(),
                        child_number,
                    )
                }
                _ => id::new_hierarchical_root_id(),
            },
            Some(Parent::Remote(_)) => match parent_id {
                Some(pid) => id::new_hierarchical_remote_child_id(pid),
                None => id::new_hierarchical_root_id(),
            },
            None => id::new_hierarchical_root_id(),
        }
    }

    /// Whether this activity may be installed as the current activity:
    /// it must have an id and must not be finished.
    pub(crate) fn is_valid_current(&self) -> bool {
        self.id().is_some() && !self.is_finished()
    }

    pub(crate) fn same(&self, other: &Activity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ActivityInner {
    fn in_process_parent(self: &Arc<Self>) -> Option<Arc<ActivityInner>> {
        match self.parent.get() {
            Some(Parent::InProcess(parent)) => parent.upgrade(),
            _ => None,
        }
    }

    fn baggage_snapshot(&self) -> ChainIter {
        self.baggage
            .lock()
            .map(|chain| chain.iter())
            .unwrap_or_else(|_| Chain::default().iter())
    }

    fn tags_snapshot(&self) -> ChainIter {
        self.tags
            .lock()
            .map(|chain| chain.iter())
            .unwrap_or_else(|_| Chain::default().iter())
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("operation_name", &self.operation_name())
            .field("id", &self.id())
            .field("id_format", &self.id_format())
            .field("recording", &self.is_recording())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Iterator over an activity's local tags, newest first.
pub struct TagIter {
    iter: ChainIter,
}

impl Iterator for TagIter {
    type Item = KeyValue;

    fn next(&mut self) -> Option<KeyValue> {
        self.iter.next()
    }
}

/// Iterator over the baggage visible to an activity, nearest entries
/// first, continuing into ancestor chains.
///
/// The walk is lazy and bounded by the depth of the ancestor chain;
/// ancestors whose handles have been dropped simply end the walk.
pub struct BaggageIter {
    iter: ChainIter,
    next_ancestor: Option<Arc<ActivityInner>>,
}

impl Iterator for BaggageIter {
    type Item = KeyValue;

    fn next(&mut self) -> Option<KeyValue> {
        loop {
            if let Some(entry) = self.iter.next() {
                return Some(entry);
            }
            let ancestor = self.next_ancestor.take()?;
            self.iter = ancestor.baggage_snapshot();
            self.next_ancestor = ancestor.in_process_parent();
        }
    }
}

fn nanos_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
