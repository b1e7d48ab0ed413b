//! # Transient Per-Namespace State
//!
//! Derived, in-memory state for each collection: the set of indexed field
//! names, compiled index specs, and the query-plan cache. None of it is
//! persisted; all of it is recomputable from the catalog, so invalidation is
//! always safe.
//!
//! The cache is a service object owned by the `Db` instance (not a global),
//! keyed by namespace name. Entries are created lazily on first access and
//! destroyed when the collection is dropped — including prefix-based
//! destruction, since index sub-namespaces share the collection's name
//! prefix.
//!
//! ## Locking
//!
//! The outer map and the per-namespace general state share the calling
//! operation's latch discipline and carry their own mutexes only for
//! interior mutability. The compiled-spec map has a *dedicated* mutex
//! because spec compilation happens lazily under what may be a reader
//! context; initialization is lock-then-recheck.

use std::sync::Arc;

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::document::Document;
use crate::index::IndexSpec;
use crate::query::QueryPattern;
use crate::storage::DiskLoc;

/// Writes tolerated before the plan cache is flushed wholesale. The
/// amortized flush stands in for cardinality statistics: any plan decision
/// is revisited at least every hundred writes.
const QC_WRITE_LIMIT: u32 = 100;

/// Upper bound on cached patterns per namespace.
const QC_MAX_ENTRIES: usize = 512;

#[derive(Debug, Default)]
struct GeneralState {
    keys_computed: bool,
    index_keys: HashSet<String>,
    qc_write_count: u32,
    qc_cache: HashMap<QueryPattern, (Document, u64)>,
    cll_ns: String,
    cll_enabled: bool,
}

#[derive(Debug, Default)]
pub struct NsTransient {
    state: Mutex<GeneralState>,
    /// Dedicated latch; see the module docs.
    specs: Mutex<HashMap<DiskLoc, Arc<IndexSpec>>>,
}

impl NsTransient {
    /// The union of all indexed field names, computing it on first use.
    pub fn index_keys(
        &self,
        compute: impl FnOnce() -> Result<HashSet<String>>,
    ) -> Result<HashSet<String>> {
        let mut state = self.state.lock();
        if !state.keys_computed {
            state.index_keys = compute()?;
            state.keys_computed = true;
        }
        Ok(state.index_keys.clone())
    }

    pub fn added_index(&self) {
        self.reset();
    }

    pub fn deleted_index(&self) {
        self.reset();
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.keys_computed = false;
        state.index_keys.clear();
        state.qc_cache.clear();
        state.qc_write_count = 0;
        self.specs.lock().clear();
    }

    /// Compiled spec for the descriptor whose info document lives at
    /// `info_loc`. Lock-then-recheck: the first caller compiles, later
    /// callers share the Arc.
    pub fn index_spec(
        &self,
        info_loc: DiskLoc,
        compile: impl FnOnce() -> Result<IndexSpec>,
    ) -> Result<Arc<IndexSpec>> {
        let mut specs = self.specs.lock();
        if let Some(spec) = specs.get(&info_loc) {
            return Ok(Arc::clone(spec));
        }
        let spec = Arc::new(compile()?);
        specs.insert(info_loc, Arc::clone(&spec));
        Ok(spec)
    }

    /// Every write counts against the plan cache; the hundredth flushes it.
    pub fn notify_of_write_op(&self) {
        let mut state = self.state.lock();
        if state.qc_cache.is_empty() {
            return;
        }
        state.qc_write_count += 1;
        if state.qc_write_count >= QC_WRITE_LIMIT {
            state.qc_cache.clear();
            state.qc_write_count = 0;
        }
    }

    pub fn clear_query_cache(&self) {
        let mut state = self.state.lock();
        state.qc_cache.clear();
        state.qc_write_count = 0;
    }

    /// The recorded winner for a pattern: its index key pattern and the
    /// `n_scanned` observed when it won.
    pub fn index_for_pattern(&self, pattern: &QueryPattern) -> Option<(Document, u64)> {
        self.state.lock().qc_cache.get(pattern).cloned()
    }

    pub fn register_index_for_pattern(
        &self,
        pattern: QueryPattern,
        index_key: Document,
        n_scanned: u64,
    ) {
        let mut state = self.state.lock();
        if state.qc_cache.len() >= QC_MAX_ENTRIES && !state.qc_cache.contains_key(&pattern) {
            state.qc_cache.clear();
        }
        state.qc_cache.insert(pattern, (index_key, n_scanned));
    }

    pub fn n_cached_plans(&self) -> usize {
        self.state.lock().qc_cache.len()
    }

    // collection-level logging state; carried for the facade, inert here

    pub fn cll_start(&self, sibling_ns: String) {
        let mut state = self.state.lock();
        state.cll_ns = sibling_ns;
        state.cll_enabled = true;
    }

    pub fn cll_invalidate(&self) {
        let mut state = self.state.lock();
        state.cll_enabled = false;
    }

    pub fn cll_enabled(&self) -> bool {
        self.state.lock().cll_enabled
    }

    pub fn cll_ns(&self) -> String {
        self.state.lock().cll_ns.clone()
    }
}

/// The per-database map of transient entries.
#[derive(Debug, Default)]
pub struct TransientCache {
    map: Mutex<HashMap<String, Arc<NsTransient>>>,
}

impl TransientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `ns`, created lazily.
    pub fn get(&self, ns: &str) -> Arc<NsTransient> {
        let mut map = self.map.lock();
        Arc::clone(
            map.entry(ns.to_string())
                .or_insert_with(|| Arc::new(NsTransient::default())),
        )
    }

    pub fn clear(&self, ns: &str) {
        self.map.lock().remove(ns);
    }

    /// Drops every entry whose namespace starts with `prefix`. Index
    /// sub-namespaces share the collection's prefix, so a collection drop
    /// uses this to catch them all. Sequential scan of the map.
    pub fn clear_for_prefix(&self, prefix: &str) {
        self.map.lock().retain(|ns, _| !ns.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
