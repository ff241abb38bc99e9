//! Identifiers for CONVEYOR entities.
//!
//! Identifiers are process-local and allocated from monotonic counters, so
//! they order by creation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_COLLECTION: AtomicU64 = AtomicU64::new(1);
static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

/// Collection identifier - identifies one handlers collection (pipeline stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(u64);

impl CollectionId {
    /// Allocate a fresh CollectionId
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_COLLECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "collection_{}", self.0)
    }
}

/// Task sequence number - distinguishes queue entries that share an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskSeq(u64);

impl TaskSeq {
    /// Allocate the next TaskSeq
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TASK.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_id_unique() {
        let a = CollectionId::new();
        let b = CollectionId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_collection_id_display() {
        let id = CollectionId::new();
        let shown = id.to_string();
        let raw: u64 = shown.strip_prefix("collection_").unwrap().parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), raw.to_string());
    }

    #[test]
    fn test_task_seq_monotonic() {
        let a = TaskSeq::next();
        let b = TaskSeq::next();
        assert!(b > a);
        assert!(b.to_string().starts_with("task_"));
    }

    #[test]
    fn test_collection_id_serde() {
        let id: CollectionId = serde_json::from_str("42").unwrap();
        assert_eq!(id.to_string(), "collection_42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let back: CollectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
