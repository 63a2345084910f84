use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque identifier of a storage location (its path on the wire).
///
/// Equality and ordering are byte-lexicographic; locations carry no other
/// attributes. Clones are cheap (shared backing buffer).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationId(Bytes);

impl LocationId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for LocationId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl From<String> for LocationId {
    fn from(id: String) -> Self {
        Self(Bytes::from(id.into_bytes()))
    }
}

impl From<Vec<u8>> for LocationId {
    fn from(id: Vec<u8>) -> Self {
        Self(Bytes::from(id))
    }
}

impl From<&[u8]> for LocationId {
    fn from(id: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(id))
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Handle into the engine's assignment arena. Stable for the lifetime of the
/// assignment; slots are recycled only after a prune drops the assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AssignmentId(pub(crate) u32);

/// A claim that a location is (or was) responsible for a bin.
///
/// An assignment is created active, expires at most once, and is never
/// resurrected; a removed-then-re-added location produces new assignments.
#[derive(Debug, Clone)]
pub(crate) struct Assignment {
    pub(crate) location: LocationId,
    pub(crate) bin: u16,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub(crate) fn is_active(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Per-location bookkeeping: every assignment the location owns (live and
/// tombstoned), the count of active ones, and the set of bins it is actively
/// assigned to (a hot-path cache used during rebalancing).
#[derive(Debug)]
pub(crate) struct LocationRecord {
    pub(crate) id: LocationId,
    pub(crate) active: u32,
    pub(crate) assignments: Vec<AssignmentId>,
    pub(crate) bins: BTreeSet<u16>,
}

impl LocationRecord {
    pub(crate) fn new(id: LocationId) -> Self {
        Self {
            id,
            active: 0,
            assignments: Vec::new(),
            bins: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_byte_lexicographic() {
        let a = LocationId::from("node/a");
        let b = LocationId::from("node/b");
        let prefix = LocationId::from("node");
        assert!(a < b);
        assert!(prefix < a);
        assert_eq!(a, LocationId::from("node/a".as_bytes()));
    }

    #[test]
    fn display_is_lossy_utf8() {
        let id = LocationId::from(vec![0x66, 0x6f, 0x6f]);
        assert_eq!(id.to_string(), "foo");
        assert_eq!(id.len(), 3);
        assert!(!id.is_empty());
    }
}
