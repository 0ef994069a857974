use core::num::NonZeroU32;
use rustc_hash::FxBuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier of a task within its graph.
///
/// Compact `NonZeroU32` keeps task handles `Copy` and lets the graph store
/// its managers in an index map keyed by id.
pub type TaskId = NonZeroU32;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher, used for ordered task bookkeeping.
pub type IndexMap<K, V> = indexmap::IndexMap<K, V, FxBuildHasher>;

/// Process-unique identity of a graph instance.
///
/// Task handles carry the id of the graph that minted them, so that wiring a
/// handle into a different graph is detected at edge-construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GraphId(pub(crate) u64);

impl GraphId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
