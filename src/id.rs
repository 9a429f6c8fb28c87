//! Activity id generation.
//!
//! Two incompatible id grammars are produced, selected per root activity:
//!
//! * *Hierarchical*: `'|' root-token ('.'|'_' child-token)* ('.'|'_'|'#')`.
//!   Lineage is encoded directly in the string; a child id is a strict
//!   prefix extension of its parent id. Ids never exceed
//!   [`MAX_ID_LEN`] bytes.
//! * *W3C*: exactly 55 ASCII characters,
//!   `00-{trace-id:032x}-{span-id:016x}-{flags:02x}`, per the
//!   [W3C Trace Context] specification.
//!
//! A valid W3C id always starts with a digit and a hierarchical id always
//! starts with `|`, which is what makes [`is_w3c_id`] a reliable
//! disambiguation rule.
//!
//! [W3C Trace Context]: https://www.w3.org/TR/trace-context/

use crate::error::{handle_error, ActivityError};
use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::num::ParseIntError;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

/// Maximum length in bytes of a hierarchical activity id.
pub const MAX_ID_LEN: usize = 1024;

/// Length of the random suffix appended when an id is trimmed on overflow,
/// including the trailing `#`.
const OVERFLOW_SUFFIX_LEN: usize = 9;

/// The id grammar used by an activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdFormat {
    /// Not yet resolved; resolved when the activity starts.
    #[default]
    Unknown = 0,
    /// The hierarchical `|root.child.` grammar.
    Hierarchical = 1,
    /// The 55-character W3C trace context grammar.
    W3c = 2,
}

impl IdFormat {
    fn from_u8(value: u8) -> IdFormat {
        match value {
            1 => IdFormat::Hierarchical,
            2 => IdFormat::W3c,
            _ => IdFormat::Unknown,
        }
    }
}

static DEFAULT_ID_FORMAT: AtomicU8 = AtomicU8::new(IdFormat::Hierarchical as u8);

/// Returns the process-wide default id format used by root activities that
/// were not forced to a specific format.
pub fn default_id_format() -> IdFormat {
    IdFormat::from_u8(DEFAULT_ID_FORMAT.load(Ordering::Relaxed))
}

/// Sets the process-wide default id format.
///
/// `IdFormat::Unknown` is not a valid default; the request is reported as
/// an error and ignored.
pub fn set_default_id_format(format: IdFormat) {
    if format == IdFormat::Unknown {
        handle_error(ActivityError::UnknownIdFormat);
        return;
    }
    DEFAULT_ID_FORMAT.store(format as u8, Ordering::Relaxed);
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// A 16-byte value which identifies a trace, as carried by W3C ids.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid trace id
    pub const INVALID: TraceId = TraceId(0);

    /// Generates a new random trace id.
    pub fn random() -> Self {
        CURRENT_RNG.with(|rng| TraceId(rng.borrow_mut().gen::<u128>()))
    }

    /// Converts a string in base 16 to a trace id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value which identifies a single activity within a trace, as
/// carried by W3C ids.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid span id
    pub const INVALID: SpanId = SpanId(0);

    /// Generates a new random span id.
    pub fn random() -> Self {
        CURRENT_RNG.with(|rng| SpanId(rng.borrow_mut().gen::<u64>()))
    }

    /// Converts a string in base 16 to a span id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(SpanId)
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Process-wide counter feeding hierarchical root tokens and the
/// out-of-process child suffix.
static ROOT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Random per-process suffix shared by every hierarchical root id generated
/// in this process, making roots from different processes distinct even
/// when their counters collide.
fn process_suffix() -> &'static str {
    static SUFFIX: OnceLock<String> = OnceLock::new();
    SUFFIX.get_or_init(|| {
        let random: u64 = CURRENT_RNG.with(|rng| rng.borrow_mut().gen());
        format!("-{random:x}.")
    })
}

fn next_root_token() -> u64 {
    ROOT_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Generates a fresh hierarchical root id: `|{counter:x}-{process-random:x}.`
pub(crate) fn new_hierarchical_root_id() -> String {
    format!("|{:x}{}", next_root_token(), process_suffix())
}

/// Extends an in-process parent id with the next child counter value,
/// terminated by `.`.
pub(crate) fn new_hierarchical_child_id(parent_id: &str, child_number: u64) -> String {
    append_suffix(parent_id, &child_number.to_string(), '.')
}

/// Derives a child id from an out-of-process parent id string.
///
/// The incoming id is sanitized (prefixed with `|` if missing, terminated
/// with `.` unless it already ends in `.` or `_`) and extended with a
/// process-unique hex token terminated by `_`, marking the process
/// boundary in the id.
pub(crate) fn new_hierarchical_remote_child_id(parent_id: &str) -> String {
    let mut sanitized = String::with_capacity(parent_id.len() + 2);
    if !parent_id.starts_with('|') {
        sanitized.push('|');
    }
    sanitized.push_str(parent_id);
    if !matches!(sanitized.as_bytes().last(), Some(b'.') | Some(b'_')) {
        sanitized.push('.');
    }
    append_suffix(&sanitized, &format!("{:x}", next_root_token()), '_')
}

/// Appends `suffix` and `delimiter` to `parent_id`, keeping the result
/// within [`MAX_ID_LEN`].
///
/// On overflow the parent id is trimmed back to the last `.`/`_` boundary
/// before the overflow point and terminated with an 8-hex-digit random
/// suffix and `#`. If no boundary exists the lineage cannot be preserved
/// and a fresh root id is generated instead.
fn append_suffix(parent_id: &str, suffix: &str, delimiter: char) -> String {
    if parent_id.len() + suffix.len() < MAX_ID_LEN {
        let mut id = String::with_capacity(parent_id.len() + suffix.len() + 1);
        id.push_str(parent_id);
        id.push_str(suffix);
        id.push(delimiter);
        return id;
    }

    // Trimmed result is `trim_position + 8 random hex digits + '#'`.
    let mut trim_position = (MAX_ID_LEN - OVERFLOW_SUFFIX_LEN).min(parent_id.len());
    while trim_position > 1 {
        if matches!(parent_id.as_bytes()[trim_position - 1], b'.' | b'_') {
            break;
        }
        trim_position -= 1;
    }
    if trim_position == 1 {
        return new_hierarchical_root_id();
    }

    let random: u32 = CURRENT_RNG.with(|rng| rng.borrow_mut().gen());
    format!("{}{:08x}#", &parent_id[..trim_position], random)
}

/// Generates a W3C id, reusing the trace id of `parent_id` when one is
/// given.
///
/// The caller must have validated `parent_id` with [`is_w3c_id`]; only a
/// fresh 16-hex span id is generated in that case, so every activity in
/// the trace shares the parent's trace-id segment.
pub(crate) fn new_w3c_id(parent_id: Option<&str>) -> String {
    match parent_id {
        Some(parent) => format!("00-{}-{}-00", &parent[3..35], SpanId::random()),
        None => format!("00-{}-{}-00", TraceId::random(), SpanId::random()),
    }
}

/// Returns `true` if `id` is shaped like a W3C trace context id.
///
/// The check is deliberately shallow: exactly 55 ASCII characters with a
/// numeric first character. Hierarchical ids always start with `|`, so the
/// first character alone disambiguates the two grammars. The ASCII
/// requirement keeps the fixed byte offsets used to extract the trace-id
/// segment on character boundaries.
pub fn is_w3c_id(id: &str) -> bool {
    id.len() == 55 && id.is_ascii() && id.as_bytes()[0].is_ascii_digit()
}

/// Extracts the root id from an activity id of either format.
///
/// For W3C ids this is the 32-hex trace-id segment. For hierarchical ids
/// it is the substring between the optional leading `|` and the first `.`,
/// or the end of the string if there is none.
pub(crate) fn root_id_of(id: &str) -> &str {
    if is_w3c_id(id) {
        return &id[3..35];
    }
    let start = usize::from(id.starts_with('|'));
    let end = id.find('.').unwrap_or(id.len());
    &id[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_id_shape() {
        let id = new_hierarchical_root_id();
        assert!(id.starts_with('|'));
        assert!(id.ends_with('.'));
        assert!(id.len() < MAX_ID_LEN);
        let body = &id[1..id.len() - 1];
        let (counter, suffix) = body.split_once('-').expect("counter-suffix delimiter");
        assert!(u64::from_str_radix(counter, 16).is_ok());
        assert!(u64::from_str_radix(suffix, 16).is_ok());
    }

    #[test]
    fn root_ids_are_unique() {
        let a = new_hierarchical_root_id();
        let b = new_hierarchical_root_id();
        assert_ne!(a, b);
        // Same process, same random suffix.
        assert_eq!(a.rsplit_once('-').unwrap().1, b.rsplit_once('-').unwrap().1);
    }

    #[test]
    fn child_id_extends_parent() {
        let parent = new_hierarchical_root_id();
        let child = new_hierarchical_child_id(&parent, 1);
        assert_eq!(child, format!("{parent}1."));
        let second = new_hierarchical_child_id(&parent, 2);
        assert_eq!(second, format!("{parent}2."));
    }

    #[test]
    fn remote_child_id_sanitizes_parent() {
        // Missing `|` prefix and terminator are both repaired.
        let id = new_hierarchical_remote_child_id("abc123");
        assert!(id.starts_with("|abc123."));
        assert!(id.ends_with('_'));

        // Already well-formed ids are untouched before the new suffix.
        let id = new_hierarchical_remote_child_id("|abc123.");
        assert!(id.starts_with("|abc123."));
        assert!(!id.starts_with("|abc123.."));
        assert!(id.ends_with('_'));

        let id = new_hierarchical_remote_child_id("|abc123.1_");
        assert!(id.starts_with("|abc123.1_"));
        assert!(id.ends_with('_'));
    }

    #[test]
    fn overflow_trims_to_boundary_and_terminates_with_hash() {
        // A parent at the length limit forces the overflow path.
        let mut parent = String::from("|root.");
        while parent.len() < MAX_ID_LEN - 1 {
            parent.push_str("1.");
        }
        let id = new_hierarchical_child_id(&parent, 7);
        assert!(id.len() <= MAX_ID_LEN);
        assert!(id.ends_with('#'));
        // The trimmed prefix is a prefix of the parent ending at a boundary.
        let prefix = &id[..id.len() - OVERFLOW_SUFFIX_LEN];
        assert!(parent.starts_with(prefix));
        assert!(matches!(prefix.as_bytes().last(), Some(b'.') | Some(b'_')));
        // 8 hex digits between the boundary and the terminator.
        let overflow = &id[id.len() - OVERFLOW_SUFFIX_LEN..id.len() - 1];
        assert!(u32::from_str_radix(overflow, 16).is_ok());
    }

    #[test]
    fn overflow_without_boundary_falls_back_to_root() {
        // No `.`/`_` anywhere before the trim window ends.
        let parent = format!("|{}", "a".repeat(MAX_ID_LEN));
        let id = append_suffix(&parent, "1", '.');
        assert!(id.starts_with('|'));
        assert!(id.ends_with('.'));
        assert!(id.len() < MAX_ID_LEN);
        assert!(id.contains('-'));
    }

    #[test]
    fn w3c_id_shape() {
        let id = new_w3c_id(None);
        assert_eq!(id.len(), 55);
        assert!(is_w3c_id(&id));
        assert!(id.starts_with("00-"));
        assert!(id.ends_with("-00"));
        assert!(TraceId::from_hex(&id[3..35]).is_ok());
        assert!(SpanId::from_hex(&id[36..52]).is_ok());
        assert_eq!(&id[35..36], "-");
        assert_eq!(&id[52..53], "-");
    }

    #[test]
    fn w3c_child_copies_trace_id() {
        let parent = new_w3c_id(None);
        let child = new_w3c_id(Some(&parent));
        assert_eq!(&child[3..35], &parent[3..35]);
        assert_ne!(&child[36..52], &parent[36..52]);
    }

    #[test]
    fn w3c_detection_requires_length_and_digit() {
        assert!(is_w3c_id(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00"
        ));
        assert!(!is_w3c_id("|1-abc."));
        assert!(!is_w3c_id(
            "x0-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00"
        ));
        assert!(!is_w3c_id("00-0af7651916cd43dd8448eb211c80319c-b7ad6b71"));
    }

    #[test]
    fn w3c_detection_requires_ascii() {
        // 55 bytes, digit first, but multibyte: byte offset 3 lands inside
        // a character, so treating this as W3C would panic on extraction.
        let id = format!("0{}", "€".repeat(18));
        assert_eq!(id.len(), 55);
        assert!(!is_w3c_id(&id));
        // root_id_of must take the hierarchical path for it.
        assert_eq!(root_id_of(&id), id);
    }

    #[rustfmt::skip]
    fn root_id_test_data() -> Vec<(&'static str, &'static str)> {
        vec![
            ("|a000-1.", "a000-1"),
            ("|a000-1.b2.", "a000-1"),
            ("|a000-1.b2_c3.", "a000-1"),
            ("a000-1", "a000-1"),
            ("|a000-1", "a000-1"),
            ("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00", "0af7651916cd43dd8448eb211c80319c"),
        ]
    }

    #[test]
    fn root_id_extraction() {
        for (id, expected) in root_id_test_data() {
            assert_eq!(root_id_of(id), expected, "id: {id:?}");
        }
    }

    #[test]
    fn trace_and_span_id_formatting() {
        assert_eq!(
            format!("{}", TraceId::from(42u128)),
            "0000000000000000000000000000002a"
        );
        assert_eq!(format!("{}", SpanId::from(42u64)), "000000000000002a");
        assert_eq!(TraceId::from_hex("2a").unwrap(), TraceId::from(42u128));
        assert_eq!(SpanId::from_hex("2a").unwrap(), SpanId::from(42u64));
        assert_eq!(TraceId::INVALID, TraceId::from(0u128));
        assert_eq!(SpanId::INVALID, SpanId::from(0u64));
    }

    #[test]
    fn default_format_rejects_unknown() {
        let _lock = crate::testing::serialize_global_state();
        let before = default_id_format();
        set_default_id_format(IdFormat::Unknown);
        assert_eq!(default_id_format(), before);
    }
}
