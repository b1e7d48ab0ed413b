//! # Database Facade
//!
//! `Db` owns everything for a data directory: one catalog + data-file set +
//! index store per database, the transient cache service, and the
//! process-wide latch.
//!
//! ## Latching
//!
//! All state sits behind a single `parking_lot::RwLock`. Readers (`find`)
//! take it shared; every mutation — inserts, free-list updates, index
//! add/drop, renames — takes it exclusive. The transient cache lives
//! outside the latch and carries its own mutexes (the compiled-spec cache
//! in particular is populated lazily from reader contexts).
//!
//! ## Interruption
//!
//! The `Db` carries an [`InterruptToken`]; signalling it makes running
//! operations fail at their next yield point (between plan-race `next`
//! calls, between capped allocation attempts) with error code 11600.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::catalog::{ns_to_database, IndexSlot, NamespaceCatalog};
use crate::config::Config;
use crate::document::matcher::Matcher;
use crate::document::{decode_document, encode_document, Document, Value};
use crate::index::{extract_keys, IndexSpec, IndexStore};
use crate::interrupt::InterruptToken;
use crate::query::{
    scan_all, CollectionScanSpec, Cursor, FindOp, MultiCursor, MultiPlanScanner, PlanIndex,
    PlanSource, QueryCtx,
};
use crate::storage::{Allocator, DataFiles, DiskLoc, RECORD_HEADER_SIZE};
use crate::transient::{NsTransient, TransientCache};

/// Deleted-record insertions tolerated before adjacent free runs are merged.
const FREES_PER_COMPACT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct CollectionOptions {
    pub capped: bool,
    /// Total capacity in bytes for a capped collection's ring.
    pub size_bytes: usize,
    /// Extent granularity for capped preallocation; defaults to the
    /// configured initial extent size.
    pub extent_size: Option<usize>,
    /// Cap on object count for a capped collection; 0 means unlimited.
    pub max_docs: i32,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            capped: false,
            size_bytes: 0,
            extent_size: None,
            max_docs: 0,
        }
    }
}

impl CollectionOptions {
    pub fn capped(size_bytes: usize) -> Self {
        Self {
            capped: true,
            size_bytes,
            ..Default::default()
        }
    }
}

struct Database {
    name: String,
    catalog: NamespaceCatalog,
    files: DataFiles,
    indexes: IndexStore,
    frees: HashMap<String, u32>,
}

impl Database {
    fn open(config: &Config, name: &str) -> Result<Self> {
        let data_dir = if config.directory_per_db {
            config.db_path.join(name)
        } else {
            config.db_path.clone()
        };
        if config.directory_per_db && !data_dir.exists() {
            std::fs::create_dir_all(&data_dir)?;
        }
        let mut catalog = NamespaceCatalog::new(
            &config.db_path,
            name,
            config.directory_per_db,
            config.ns_size_mb * 1024 * 1024,
        );
        if catalog.exists() {
            catalog.init()?;
        }
        let files = DataFiles::open(&data_dir, name, config.data_file_size)?;
        Ok(Self {
            name: name.to_string(),
            catalog,
            files,
            indexes: IndexStore::new(),
            frees: HashMap::new(),
        })
    }
}

struct Inner {
    databases: HashMap<String, Database>,
}

pub struct Db {
    config: Config,
    token: InterruptToken,
    transient: TransientCache,
    inner: RwLock<Inner>,
}

/// What an operation needs to know about one visible index descriptor.
struct IndexMeta {
    slot: usize,
    name: String,
    key_pattern: Document,
    unique: bool,
    info: DiskLoc,
}

impl Db {
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.db_path)?;
        let mut inner = Inner {
            databases: HashMap::new(),
        };
        let transient = TransientCache::new();
        let token = InterruptToken::new();
        for name in discover_databases(&config)? {
            let mut database = Database::open(&config, &name)?;
            rebuild_indexes(&mut database, &token, &transient)?;
            inner.databases.insert(name, database);
        }
        Ok(Self {
            config,
            token,
            transient,
            inner: RwLock::new(inner),
        })
    }

    pub fn interrupt_token(&self) -> InterruptToken {
        self.token.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a collection. Non-capped collections defer extent allocation
    /// to the first insert; capped collections preallocate their whole ring.
    pub fn create_collection(&self, ns: &str, options: CollectionOptions) -> Result<()> {
        validate_client_ns(ns)?;
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;

        let rec_ofs = database
            .catalog
            .add_ns(ns, DiskLoc::NULL, options.capped)?;
        if options.capped {
            ensure!(
                options.size_bytes > 0,
                "capped collection '{}' needs a size",
                ns
            );
            let extent_size = options
                .extent_size
                .unwrap_or(self.config.initial_extent_size)
                .next_multiple_of(4);
            let Database { catalog, files, .. } = database;
            let rec = catalog.record_mut(rec_ofs)?;
            rec.set_max_docs(options.max_docs);
            let mut alloc = Allocator::new(files, &self.token, self.config.initial_extent_size);
            let mut total = 0usize;
            while total < options.size_bytes {
                let ext = alloc.alloc_linked_extent(rec, extent_size)?;
                alloc.seed_extent(rec, ext)?;
                total += extent_size;
            }
        }
        debug!(ns, capped = options.capped, "created collection");
        Ok(())
    }

    pub fn drop_collection(&self, ns: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            return Ok(false);
        };

        let transient = self.transient.get(ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes_being_built() as usize;
        let metas = index_metas(database, &transient, rec_ofs, n)?;
        let sys_ns = system_indexes_ns(&database.name);
        for meta in &metas {
            delete_record_in(database, &self.token, &sys_ns, meta.info)?;
        }
        database.indexes.drop_ns(ns);
        database.catalog.kill_ns(ns)?;
        // covers index sub-namespaces sharing the collection's prefix
        self.transient.clear_for_prefix(ns);
        debug!(ns, "dropped collection");
        Ok(true)
    }

    /// Renames within one database; overflow chains are rebuilt against the
    /// new record's own position.
    pub fn rename_collection(&self, from: &str, to: &str) -> Result<()> {
        validate_client_ns(to)?;
        ensure!(
            ns_to_database(from)? == ns_to_database(to)?,
            "rename must stay within one database: {} -> {}",
            from,
            to
        );
        let mut inner = self.inner.write();
        let database = inner.database_mut(from, &self.config)?;
        let Some(old_ofs) = database.catalog.details(from, &mut database.files)? else {
            bail!("namespace '{}' not found", from);
        };

        let rec = *database.catalog.record(old_ofs)?;
        let new_ofs = database.catalog.add_ns_record(to, &rec)?;
        database.catalog.copying_from(to, new_ofs, old_ofs)?;

        // index spec documents carry the namespace; rewrite them
        let transient = self.transient.get(from);
        let n = database.catalog.record(new_ofs)?.n_indexes_being_built() as usize;
        let metas = index_metas(database, &transient, new_ofs, n)?;
        let sys_ns = system_indexes_ns(&database.name);
        for meta in &metas {
            let spec = IndexSpec {
                name: meta.name.clone(),
                ns: to.to_string(),
                key_pattern: meta.key_pattern.clone(),
                unique: meta.unique,
            };
            delete_record_in(database, &self.token, &sys_ns, meta.info)?;
            let info_loc = insert_into(
                database,
                &self.token,
                &self.config,
                &self.transient,
                &sys_ns,
                &spec.to_info(),
            )?;
            let mut slot = database.catalog.idx_slot(new_ofs, meta.slot)?;
            slot.info = info_loc;
            database.catalog.set_idx_slot(new_ofs, meta.slot, slot)?;
        }

        database.catalog.kill_ns(from)?;
        database.indexes.rename_ns(from, to);
        self.transient.clear_for_prefix(from);
        self.transient.clear_for_prefix(to);
        debug!(from, to, "renamed collection");
        Ok(())
    }

    pub fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        match inner.databases.get(db) {
            Some(database) if database.catalog.allocated() => {
                database.catalog.list_names(true)
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn insert(&self, ns: &str, doc: &Document) -> Result<DiskLoc> {
        validate_client_ns(ns)?;
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        insert_into(
            database,
            &self.token,
            &self.config,
            &self.transient,
            ns,
            doc,
        )
    }

    /// Deletes matching documents; capped collections refuse.
    pub fn remove(&self, ns: &str, query: &Document, just_one: bool) -> Result<usize> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            return Ok(0);
        };
        ensure!(
            !database.catalog.record(rec_ofs)?.is_capped(),
            "can't remove from a capped collection: {}",
            ns
        );

        let transient = self.transient.get(ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes_being_built() as usize;
        let metas = index_metas(database, &transient, rec_ofs, n)?;
        let matcher = Matcher::new(query.clone());

        let spec = CollectionScanSpec::from_record(database.catalog.record(rec_ofs)?);
        let candidates: Vec<(DiskLoc, Document)> =
            scan_all(&database.files, &database.indexes, &self.token, spec)?
                .into_iter()
                .filter(|(_, doc)| matcher.matches(doc))
                .collect();

        let mut removed = 0usize;
        for (loc, doc) in candidates {
            for meta in &metas {
                let (keys, _) = extract_keys(&doc, &meta.key_pattern);
                database.indexes.remove(ns, &meta.name, &keys, loc);
            }
            {
                let Database {
                    catalog,
                    files,
                    frees,
                    ..
                } = database;
                let rec = catalog.record_mut(rec_ofs)?;
                let mut alloc =
                    Allocator::new(files, &self.token, self.config.initial_extent_size);
                alloc.delete_record(rec, loc)?;
                let count = frees.entry(ns.to_string()).or_insert(0);
                *count += 1;
                if *count >= FREES_PER_COMPACT {
                    alloc.compact(rec)?;
                    *count = 0;
                }
            }
            removed += 1;
            if just_one {
                break;
            }
        }
        if removed > 0 {
            transient.notify_of_write_op();
        }
        Ok(removed)
    }

    /// Replaces the first matching document. Growth beyond the record's
    /// allocation moves the document and bumps the padding factor; a fit
    /// shrinks it.
    pub fn update(&self, ns: &str, query: &Document, new_doc: &Document) -> Result<bool> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            return Ok(false);
        };

        let transient = self.transient.get(ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes_being_built() as usize;
        let metas = index_metas(database, &transient, rec_ofs, n)?;
        let matcher = Matcher::new(query.clone());

        let spec = CollectionScanSpec::from_record(database.catalog.record(rec_ofs)?);
        let target = scan_all(&database.files, &database.indexes, &self.token, spec)?
            .into_iter()
            .find(|(_, doc)| matcher.matches(doc));
        let Some((loc, old_doc)) = target else {
            return Ok(false);
        };

        let new_bytes = encode_document(new_doc);
        let allocated = database.files.record_header(loc)?.data_len() as usize;

        for meta in &metas {
            let (old_keys, _) = extract_keys(&old_doc, &meta.key_pattern);
            database.indexes.remove(ns, &meta.name, &old_keys, loc);
        }

        if new_bytes.len() <= allocated {
            let old_len = encode_document(&old_doc).len() as i64;
            database.files.write_record_data(loc, &new_bytes)?;
            let rec = database.catalog.record_mut(rec_ofs)?;
            rec.stats_add(0, new_bytes.len() as i64 - old_len);
            rec.padding_fits();
            for meta in &metas {
                let (keys, multikey) = extract_keys(new_doc, &meta.key_pattern);
                database.indexes.insert(ns, &meta.name, &keys, loc)?;
                if multikey {
                    database
                        .catalog
                        .record_mut(rec_ofs)?
                        .set_index_is_multikey(meta.slot);
                }
            }
        } else {
            // does not fit where it is: move it, and remember the growth
            {
                let Database { catalog, files, .. } = database;
                let rec = catalog.record_mut(rec_ofs)?;
                rec.padding_too_small();
                let mut alloc =
                    Allocator::new(files, &self.token, self.config.initial_extent_size);
                alloc.delete_record(rec, loc)?;
            }
            insert_into(
                database,
                &self.token,
                &self.config,
                &self.transient,
                ns,
                new_doc,
            )?;
        }
        transient.notify_of_write_op();
        Ok(true)
    }

    /// Runs the query through the competitive planner: candidate plans are
    /// raced, the winner is cached under the query's shape, and `$or`
    /// clauses run as sequential plan sets.
    pub fn find(
        &self,
        ns: &str,
        query: &Document,
        order: &Document,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read();
        let Some((database, rec_ofs)) = inner.resolve(ns) else {
            return Ok(Vec::new());
        };

        let transient = self.transient.get(ns);
        let source = plan_source(database, &transient, ns, rec_ofs)?;
        let ctx = QueryCtx {
            files: &database.files,
            indexes: &database.indexes,
            token: &self.token,
            transient: &transient,
        };
        let mut scanner =
            MultiPlanScanner::new(source, query.clone(), order.clone(), None, true)?;
        let is_or = scanner.is_or_query();

        let mut results: Vec<Document> = Vec::new();
        let mut need_sort = false;
        while scanner.may_run_more() {
            let clause_query = scanner.clause_query_preview();
            let wanted = if order.is_empty() && !is_or { limit } else { 0 };
            let run = scanner.run_op_once(&ctx, &|| {
                Box::new(FindOp::new(clause_query.clone(), wanted))
            })?;
            if run.plan.scan_and_order_required() {
                need_sort = true;
            }
            let op = run
                .op
                .into_any()
                .downcast::<FindOp>()
                .expect("factory produces FindOp");
            results.extend(op.into_results().into_iter().map(|(_, d)| d));
        }

        if !order.is_empty() && (need_sort || is_or) {
            sort_documents(&mut results, order);
        }
        if limit > 0 && results.len() > limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    pub fn find_one(&self, ns: &str, query: &Document) -> Result<Option<Document>> {
        Ok(self.find(ns, query, &Document::new(), 1)?.pop())
    }

    pub fn count(&self, ns: &str, query: &Document) -> Result<usize> {
        Ok(self.find(ns, query, &Document::new(), 0)?.len())
    }

    /// Same result as [`find`](Self::find), but through the cursor facade:
    /// best-guess plan per clause, no racing.
    pub fn find_via_cursor(
        &self,
        ns: &str,
        query: &Document,
        order: &Document,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read();
        let Some((database, rec_ofs)) = inner.resolve(ns) else {
            return Ok(Vec::new());
        };

        let transient = self.transient.get(ns);
        let source = plan_source(database, &transient, ns, rec_ofs)?;
        let ctx = QueryCtx {
            files: &database.files,
            indexes: &database.indexes,
            token: &self.token,
            transient: &transient,
        };
        let scanner = MultiPlanScanner::new(source, query.clone(), order.clone(), None, true)?;
        let mut cursor = MultiCursor::new(scanner, &ctx)?;

        let mut results = Vec::new();
        while cursor.ok() {
            let loc = cursor.curr_loc();
            if !cursor.getsetdup(loc) {
                let doc = cursor.current(&ctx)?;
                if cursor.matcher().matches(&doc) {
                    results.push(doc);
                }
            }
            cursor.advance(&ctx)?;
        }
        if !order.is_empty() {
            sort_documents(&mut results, order);
        }
        Ok(results)
    }

    /// Adds an index, storing its spec document in `<db>.system.indexes`
    /// and building the key store from a collection scan. Returns false if
    /// an index of that name already exists.
    pub fn ensure_index(
        &self,
        ns: &str,
        name: &str,
        key_pattern: &Document,
        unique: bool,
    ) -> Result<bool> {
        ensure!(!name.is_empty(), "index name must not be empty");
        ensure!(!key_pattern.is_empty(), "index key pattern must not be empty");
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let rec_ofs = match database.catalog.details(ns, &mut database.files)? {
            Some(o) => o,
            None => database.catalog.add_ns(ns, DiskLoc::NULL, false)?,
        };

        let transient = self.transient.get(ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes() as usize;
        let existing = index_metas(database, &transient, rec_ofs, n)?;
        if existing.iter().any(|m| m.name == name) {
            return Ok(false);
        }

        let slot = database.catalog.alloc_index_slot(ns, rec_ofs)?;
        let spec = IndexSpec {
            name: name.to_string(),
            ns: ns.to_string(),
            key_pattern: key_pattern.clone(),
            unique,
        };
        let sys_ns = system_indexes_ns(&database.name);
        let info_loc = insert_into(
            database,
            &self.token,
            &self.config,
            &self.transient,
            &sys_ns,
            &spec.to_info(),
        )?;
        database.catalog.set_idx_slot(
            rec_ofs,
            slot,
            IndexSlot {
                head: DiskLoc::NULL,
                info: info_loc,
            },
        )?;

        build_index(database, &self.token, ns, rec_ofs, slot, &spec)?;

        let rec = database.catalog.record_mut(rec_ofs)?;
        rec.set_n_indexes(rec.n_indexes() + 1);
        if spec.is_id_index() {
            rec.set_have_id_index();
        }
        transient.added_index();
        debug!(ns, name, "built index");
        Ok(true)
    }

    pub fn drop_index(&self, ns: &str, name: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            return Ok(false);
        };

        let transient = self.transient.get(ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes() as usize;
        let metas = index_metas(database, &transient, rec_ofs, n)?;
        let Some(meta) = metas.into_iter().find(|m| m.name == name) else {
            return Ok(false);
        };

        database.catalog.remove_index_slot(rec_ofs, meta.slot)?;
        let sys_ns = system_indexes_ns(&database.name);
        delete_record_in(database, &self.token, &sys_ns, meta.info)?;
        database.indexes.drop_index(ns, name);
        transient.deleted_index();
        Ok(true)
    }

    /// Registers an in-progress background index: visible to insert paths,
    /// not counted in `n_indexes` until finished.
    pub fn begin_background_index_build(
        &self,
        ns: &str,
        name: &str,
        key_pattern: &Document,
        unique: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            bail!("namespace '{}' not found", ns);
        };
        ensure!(
            database
                .catalog
                .record(rec_ofs)?
                .background_index_build_in_progress()
                == 0,
            "a background index build is already in progress on {}",
            ns
        );

        let slot = database.catalog.alloc_index_slot(ns, rec_ofs)?;
        let spec = IndexSpec {
            name: name.to_string(),
            ns: ns.to_string(),
            key_pattern: key_pattern.clone(),
            unique,
        };
        let sys_ns = system_indexes_ns(&database.name);
        let info_loc = insert_into(
            database,
            &self.token,
            &self.config,
            &self.transient,
            &sys_ns,
            &spec.to_info(),
        )?;
        database.catalog.set_idx_slot(
            rec_ofs,
            slot,
            IndexSlot {
                head: DiskLoc::NULL,
                info: info_loc,
            },
        )?;
        database.indexes.create(ns, name);
        database
            .catalog
            .record_mut(rec_ofs)?
            .set_background_index_build_in_progress(1);
        Ok(())
    }

    /// Backfills the in-progress index and promotes it into `n_indexes`.
    pub fn finish_background_index_build(&self, ns: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            bail!("namespace '{}' not found", ns);
        };
        ensure!(
            database
                .catalog
                .record(rec_ofs)?
                .background_index_build_in_progress()
                == 1,
            "no background index build in progress on {}",
            ns
        );

        let transient = self.transient.get(ns);
        let slot = database.catalog.record(rec_ofs)?.n_indexes() as usize;
        let slot_meta = database.catalog.idx_slot(rec_ofs, slot)?;
        let spec = transient_spec(database, &transient, slot_meta.info)?;
        build_index(database, &self.token, ns, rec_ofs, slot, &spec)?;

        let rec = database.catalog.record_mut(rec_ofs)?;
        rec.set_background_index_build_in_progress(0);
        rec.set_n_indexes(rec.n_indexes() + 1);
        transient.added_index();
        Ok(())
    }

    /// The union of indexed field names for a namespace, from the lazily
    /// computed transient cache.
    pub fn index_keys(&self, ns: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let Some((database, rec_ofs)) = inner.resolve(ns) else {
            return Ok(Vec::new());
        };
        let transient = self.transient.get(ns);
        let keys = transient.index_keys(|| {
            let n = database.catalog.record(rec_ofs)?.n_indexes() as usize;
            let mut keys = hashbrown::HashSet::new();
            for i in 0..n {
                let slot = database.catalog.idx_slot(rec_ofs, i)?;
                let spec = transient_spec(database, &transient, slot.info)?;
                for field in spec.key_fields() {
                    keys.insert(field.to_string());
                }
            }
            Ok(keys)
        })?;
        let mut out: Vec<String> = keys.into_iter().collect();
        out.sort();
        Ok(out)
    }

    /// Slot of the index named `name`, or None.
    pub fn find_index_by_name(&self, ns: &str, name: &str) -> Result<Option<usize>> {
        self.find_index_by(ns, |spec| spec.name == name)
    }

    pub fn find_index_by_key_pattern(
        &self,
        ns: &str,
        key_pattern: &Document,
    ) -> Result<Option<usize>> {
        self.find_index_by(ns, |spec| spec.key_pattern == *key_pattern)
    }

    pub fn find_id_index(&self, ns: &str) -> Result<Option<usize>> {
        self.find_index_by(ns, |spec| spec.is_id_index())
    }

    fn find_index_by(
        &self,
        ns: &str,
        pred: impl Fn(&IndexSpec) -> bool,
    ) -> Result<Option<usize>> {
        let inner = self.inner.read();
        let Some((database, rec_ofs)) = inner.resolve(ns) else {
            return Ok(None);
        };
        let transient = self.transient.get(ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes() as usize;
        for i in 0..n {
            let slot = database.catalog.idx_slot(rec_ofs, i)?;
            let spec = transient_spec(database, &transient, slot.info)?;
            if pred(&spec) {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Toggles the capped-delete guard used while cursors are active on a
    /// capped collection.
    pub fn set_capped_disallow_delete(&self, ns: &str, disallow: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let database = inner.database_mut(ns, &self.config)?;
        let Some(rec_ofs) = database.catalog.details(ns, &mut database.files)? else {
            bail!("namespace '{}' not found", ns);
        };
        let rec = database.catalog.record_mut(rec_ofs)?;
        if disallow {
            rec.capped_disallow_delete();
        } else {
            rec.capped_allow_delete();
        }
        Ok(())
    }

    /// Collection statistics: `(n_records, data_size, padding_factor)`.
    pub fn stats(&self, ns: &str) -> Result<Option<(i64, i64, f64)>> {
        let inner = self.inner.read();
        let Some((database, rec_ofs)) = inner.resolve(ns) else {
            return Ok(None);
        };
        let rec = database.catalog.record(rec_ofs)?;
        Ok(Some((rec.n_records(), rec.data_size(), rec.padding_factor())))
    }

    /// Number of plans currently cached for a namespace.
    pub fn cached_plans(&self, ns: &str) -> usize {
        self.transient.get(ns).n_cached_plans()
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        for database in inner.databases.values() {
            database.catalog.sync()?;
            database.files.sync_all()?;
        }
        Ok(())
    }
}

impl Inner {
    fn database_mut(&mut self, ns: &str, config: &Config) -> Result<&mut Database> {
        let db_name = ns_to_database(ns)?.to_string();
        if !self.databases.contains_key(&db_name) {
            let database = Database::open(config, &db_name)?;
            self.databases.insert(db_name.clone(), database);
        }
        Ok(self.databases.get_mut(&db_name).expect("just inserted"))
    }

    fn resolve(&self, ns: &str) -> Option<(&Database, usize)> {
        let db_name = ns_to_database(ns).ok()?;
        let database = self.databases.get(db_name)?;
        let rec_ofs = database.catalog.find_record(ns)?;
        Some((database, rec_ofs))
    }
}

fn system_indexes_ns(db_name: &str) -> String {
    format!("{}.system.indexes", db_name)
}

/// Client-facing name validation; internal callers (overflow records, the
/// system collections) bypass it.
fn validate_client_ns(ns: &str) -> Result<()> {
    let (db, coll) = match ns.find('.') {
        Some(i) => (&ns[..i], &ns[i + 1..]),
        None => bail!("namespace '{}' is missing a collection name", ns),
    };
    ensure!(!db.is_empty(), "namespace '{}' has an empty database", ns);
    ensure!(!coll.is_empty(), "namespace '{}' has an empty collection", ns);
    ensure!(
        !coll.contains('$'),
        "namespace '{}' contains the reserved character '$'",
        ns
    );
    Ok(())
}

fn discover_databases(config: &Config) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if config.directory_per_db {
        for entry in std::fs::read_dir(&config.db_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().join(format!("{}.ns", name)).exists() {
                    names.push(name);
                }
            }
        }
    } else {
        for entry in std::fs::read_dir(&config.db_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(name) = file_name.strip_suffix(".ns") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn rebuild_indexes(
    database: &mut Database,
    token: &InterruptToken,
    transients: &TransientCache,
) -> Result<()> {
    if !database.catalog.allocated() {
        return Ok(());
    }
    for ns in database.catalog.list_names(true)? {
        let Some(rec_ofs) = database.catalog.find_record(&ns) else {
            continue;
        };
        let transient = transients.get(&ns);
        let n = database.catalog.record(rec_ofs)?.n_indexes() as usize;
        for i in 0..n {
            let slot = database.catalog.idx_slot(rec_ofs, i)?;
            let spec = transient_spec(database, &transient, slot.info)?;
            build_index(database, token, &ns, rec_ofs, i, &spec)?;
        }
    }
    Ok(())
}

fn transient_spec(
    database: &Database,
    transient: &NsTransient,
    info: DiskLoc,
) -> Result<std::sync::Arc<IndexSpec>> {
    transient.index_spec(info, || {
        let data = database.files.record_data(info)?;
        IndexSpec::from_info(&decode_document(data)?)
    })
}

fn index_metas(
    database: &Database,
    transient: &NsTransient,
    rec_ofs: usize,
    n: usize,
) -> Result<Vec<IndexMeta>> {
    let mut metas = Vec::with_capacity(n);
    for i in 0..n {
        let slot = database.catalog.idx_slot(rec_ofs, i)?;
        let spec = transient_spec(database, transient, slot.info)?;
        metas.push(IndexMeta {
            slot: i,
            name: spec.name.clone(),
            key_pattern: spec.key_pattern.clone(),
            unique: spec.unique,
            info: slot.info,
        });
    }
    Ok(metas)
}

fn plan_source(
    database: &Database,
    transient: &NsTransient,
    ns: &str,
    rec_ofs: usize,
) -> Result<PlanSource> {
    let rec = database.catalog.record(rec_ofs)?;
    let n = rec.n_indexes() as usize;
    let scan_spec = CollectionScanSpec::from_record(rec);
    let multikey: Vec<bool> = (0..n).map(|i| rec.is_multikey(i)).collect();

    let mut indexes = Vec::with_capacity(n);
    for (i, multikey) in multikey.into_iter().enumerate() {
        let slot = database.catalog.idx_slot(rec_ofs, i)?;
        let spec = transient_spec(database, transient, slot.info)?;
        indexes.push(PlanIndex {
            slot: i,
            name: spec.name.clone(),
            key_pattern: spec.key_pattern.clone(),
            multikey,
        });
    }
    Ok(PlanSource {
        ns: ns.to_string(),
        indexes,
        scan_spec,
    })
}

/// Core insert: allocates (evicting through the capped ring if needed),
/// writes the payload, updates stats, and maintains every visible index.
fn insert_into(
    database: &mut Database,
    token: &InterruptToken,
    config: &Config,
    transients: &TransientCache,
    ns: &str,
    doc: &Document,
) -> Result<DiskLoc> {
    let transient = transients.get(ns);
    database.catalog.init()?;
    let rec_ofs = match database.catalog.details(ns, &mut database.files)? {
        Some(o) => o,
        None => database.catalog.add_ns(ns, DiskLoc::NULL, false)?,
    };

    let n_visible = database.catalog.record(rec_ofs)?.n_indexes_being_built() as usize;
    let metas = index_metas(database, &transient, rec_ofs, n_visible)?;

    for meta in &metas {
        if meta.unique {
            let (keys, _) = extract_keys(doc, &meta.key_pattern);
            ensure!(
                !database.indexes.would_conflict(ns, &meta.name, &keys),
                "duplicate key error: index {} on {}",
                meta.name,
                ns
            );
        }
    }

    let bytes = encode_document(doc);
    let len = (bytes.len() + RECORD_HEADER_SIZE) as i32;
    let loc = {
        let Database {
            catalog,
            files,
            indexes,
            ..
        } = database;
        let rec = catalog.record_mut(rec_ofs)?;
        let mut alloc = Allocator::new(files, token, config.initial_extent_size);
        let metas = &metas;
        let (loc, _extent_loc) = alloc.alloc(ns, rec, len, &mut |evicted, data| {
            let old = decode_document(data)?;
            for meta in metas {
                let (keys, _) = extract_keys(&old, &meta.key_pattern);
                indexes.remove(ns, &meta.name, &keys, evicted);
            }
            Ok(())
        })?;
        loc
    };

    database.files.write_record_data(loc, &bytes)?;
    database
        .catalog
        .record_mut(rec_ofs)?
        .stats_add(1, bytes.len() as i64);

    for meta in &metas {
        let (keys, multikey) = extract_keys(doc, &meta.key_pattern);
        database.indexes.insert(ns, &meta.name, &keys, loc)?;
        if multikey {
            database
                .catalog
                .record_mut(rec_ofs)?
                .set_index_is_multikey(meta.slot);
        }
    }

    transient.notify_of_write_op();
    Ok(loc)
}

/// Deletes one record belonging to `owner_ns` (used for index spec
/// documents in `system.indexes`).
fn delete_record_in(
    database: &mut Database,
    token: &InterruptToken,
    owner_ns: &str,
    loc: DiskLoc,
) -> Result<()> {
    let Some(rec_ofs) = database.catalog.find_record(owner_ns) else {
        return Ok(());
    };
    let Database { catalog, files, .. } = database;
    let rec = catalog.record_mut(rec_ofs)?;
    let mut alloc = Allocator::new(files, token, 0x2000);
    alloc.delete_record(rec, loc)?;
    Ok(())
}

/// Populates an index's key store from a full collection scan, recording
/// multikey insertions in the namespace record.
fn build_index(
    database: &mut Database,
    token: &InterruptToken,
    ns: &str,
    rec_ofs: usize,
    slot: usize,
    spec: &IndexSpec,
) -> Result<()> {
    database.indexes.create(ns, &spec.name);
    let scan_spec = CollectionScanSpec::from_record(database.catalog.record(rec_ofs)?);
    let docs = scan_all(&database.files, &database.indexes, token, scan_spec)?;
    let mut any_multikey = false;
    for (loc, doc) in docs {
        let (keys, multikey) = extract_keys(&doc, &spec.key_pattern);
        if spec.unique {
            ensure!(
                !database.indexes.would_conflict(ns, &spec.name, &keys),
                "duplicate key error building unique index {} on {}",
                spec.name,
                ns
            );
        }
        database.indexes.insert(ns, &spec.name, &keys, loc)?;
        any_multikey |= multikey;
    }
    if any_multikey {
        database
            .catalog
            .record_mut(rec_ofs)?
            .set_index_is_multikey(slot);
    }
    Ok(())
}

fn sort_documents(docs: &mut [Document], order: &Document) {
    docs.sort_by(|a, b| {
        for (field, dir) in order.iter() {
            let dir = match dir {
                Value::Int(n) if *n < 0 => -1,
                Value::Double(d) if *d < 0.0 => -1,
                _ => 1,
            };
            let va = a.get_path(field).unwrap_or(&Value::Null);
            let vb = b.get_path(field).unwrap_or(&Value::Null);
            let ord = va.compare(vb);
            if ord != std::cmp::Ordering::Equal {
                return if dir < 0 { ord.reverse() } else { ord };
            }
        }
        std::cmp::Ordering::Equal
    });
}
