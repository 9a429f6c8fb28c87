//! Persistent key-value chains backing tags and baggage.
//!
//! Entries are prepended onto an immutable, structurally shared cons list,
//! so taking a snapshot of a chain is a single `Arc` clone and readers are
//! never invalidated by later appends. Baggage enumeration continues into
//! ancestor chains; a key set closer to the reading activity shadows the
//! same key set further up.

use std::sync::Arc;

/// A key-value metadata entry attached to an activity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The entry key.
    pub key: String,
    /// The entry value.
    pub value: String,
}

impl KeyValue {
    /// Creates a new key-value entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

struct Node {
    entry: KeyValue,
    next: Option<Arc<Node>>,
}

/// An immutable, prepend-only chain of [`KeyValue`] entries.
///
/// Cloning a chain shares structure with the original; prepending returns
/// a new chain without touching existing snapshots.
#[derive(Clone, Default)]
pub(crate) struct Chain {
    head: Option<Arc<Node>>,
}

impl Chain {
    /// Returns a new chain with `entry` at the front.
    pub(crate) fn prepended(&self, entry: KeyValue) -> Chain {
        Chain {
            head: Some(Arc::new(Node {
                entry,
                next: self.head.clone(),
            })),
        }
    }

    /// Iterates the local entries, newest first.
    pub(crate) fn iter(&self) -> ChainIter {
        ChainIter {
            node: self.head.clone(),
        }
    }
}

/// Iterator over one chain, newest entry first.
pub(crate) struct ChainIter {
    node: Option<Arc<Node>>,
}

impl Iterator for ChainIter {
    type Item = KeyValue;

    fn next(&mut self) -> Option<KeyValue> {
        let node = self.node.take()?;
        self.node = node.next.clone();
        Some(node.entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_orders_newest_first() {
        let chain = Chain::default()
            .prepended(KeyValue::new("a", "1"))
            .prepended(KeyValue::new("b", "2"));
        let keys: Vec<_> = chain.iter().map(|kv| kv.key).collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn snapshots_are_unaffected_by_later_prepends() {
        let base = Chain::default().prepended(KeyValue::new("a", "1"));
        let snapshot = base.clone();
        let extended = base.prepended(KeyValue::new("b", "2"));
        assert_eq!(snapshot.iter().count(), 1);
        assert_eq!(extended.iter().count(), 2);
    }

    #[test]
    fn empty_chain_yields_nothing() {
        assert_eq!(Chain::default().iter().next(), None);
    }
}
