//! Key ordering for skip list entries
//!
//! User keys ascend under a pluggable [`UserComparator`]; versions of one
//! user key are ordered newest first (descending sequence number).

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::types::{EntryRef, SequenceNumber, TAG_SIZE};

pub trait UserComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn name(&self) -> &'static str;
}

/// Lexicographic byte order
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl UserComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "luma.BytewiseComparator"
    }
}

/// Relation between two entries as seen by compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrder {
    /// First entry's user key sorts before the second's
    Before,
    /// First entry's user key sorts after the second's
    After,
    /// Same user key. `older_obsolete` is set when the newer version is
    /// visible at the compaction snapshot, so the older one can never be
    /// read again.
    SameUserKey { older_obsolete: bool },
}

/// Compares encoded entries (length-prefixed internal key, then value).
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn UserComparator>,
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

impl Default for InternalKeyComparator {
    fn default() -> Self {
        Self::new(Arc::new(BytewiseComparator))
    }
}

#[inline]
fn split_entry(entry: &[u8]) -> (&[u8], SequenceNumber) {
    let view = match EntryRef::decode(entry) {
        Some(view) => view,
        None => panic!("corrupted skip list entry ({} bytes)", entry.len()),
    };
    let ikey = view.internal_key;
    let (user_key, tag) = ikey.split_at(ikey.len() - TAG_SIZE);
    let mut raw = [0u8; TAG_SIZE];
    raw.copy_from_slice(tag);
    (user_key, u64::from_le_bytes(raw) >> 8)
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn UserComparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &dyn UserComparator {
        self.user.as_ref()
    }

    pub fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }

    /// Total order over entries: user key ascending, sequence descending
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (ua, sa) = split_entry(a);
        let (ub, sb) = split_entry(b);
        self.user
            .compare(ua, ub)
            .then_with(|| sb.cmp(&sa))
    }

    /// Classify `a` relative to `b` against a compaction snapshot
    pub fn order(&self, a: &[u8], b: &[u8], snapshot: SequenceNumber) -> EntryOrder {
        let (ua, sa) = split_entry(a);
        let (ub, sb) = split_entry(b);
        match self.user.compare(ua, ub) {
            Ordering::Less => EntryOrder::Before,
            Ordering::Greater => EntryOrder::After,
            Ordering::Equal => EntryOrder::SameUserKey {
                older_obsolete: sa.max(sb) <= snapshot,
            },
        }
    }

    /// True when both entries carry the same user key and `a` is newer
    pub fn same_key_newer(&self, a: &[u8], b: &[u8]) -> bool {
        let (ua, sa) = split_entry(a);
        let (ub, sb) = split_entry(b);
        self.user.compare(ua, ub) == Ordering::Equal && sa > sb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{encode_entry, ValueType};

    #[test]
    fn test_newer_versions_sort_first() {
        let cmp = InternalKeyComparator::default();
        let old = encode_entry(1, ValueType::Value, b"a", b"v1");
        let new = encode_entry(2, ValueType::Value, b"a", b"v2");
        let other = encode_entry(1, ValueType::Value, b"b", b"v");

        assert_eq!(cmp.compare(&new, &old), Ordering::Less);
        assert_eq!(cmp.compare(&old, &other), Ordering::Less);
        assert!(cmp.same_key_newer(&new, &old));
        assert!(!cmp.same_key_newer(&old, &new));
    }

    #[test]
    fn test_order_against_snapshot() {
        let cmp = InternalKeyComparator::default();
        let old = encode_entry(3, ValueType::Value, b"k", b"x");
        let new = encode_entry(5, ValueType::Deletion, b"k", b"");

        assert_eq!(
            cmp.order(&new, &old, 5),
            EntryOrder::SameUserKey { older_obsolete: true }
        );
        // A reader at snapshot 4 may still need the older version
        assert_eq!(
            cmp.order(&new, &old, 4),
            EntryOrder::SameUserKey { older_obsolete: false }
        );

        let later = encode_entry(1, ValueType::Value, b"z", b"");
        assert_eq!(cmp.order(&old, &later, 10), EntryOrder::Before);
        assert_eq!(cmp.order(&later, &old, 10), EntryOrder::After);
    }
}
