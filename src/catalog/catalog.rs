//! The `.ns` catalog file facade.
//!
//! One catalog per database: a hash table of `(NsKey, NsRecord)` nodes in a
//! mapped file (`<dbpath>/<db>.ns`, or `<dbpath>/<db>/<db>.ns` under
//! directory-per-database). The catalog hands out *record offsets* — byte
//! positions of record areas within the mapping — never pointers; offsets
//! are re-resolved per operation.
//!
//! Overflow records for collections with more than ten indexes are ordinary
//! hash nodes under the reserved synthetic names `<ns>$extra` / `<ns>$extrb`,
//! wired to their owner through byte offsets relative to the owner's record.

use std::path::PathBuf;

use eyre::{bail, ensure, Result};
use tracing::debug;

use super::hashtable::NsHashTable;
use super::name::{is_extra_name, NsKey};
use super::record::{
    IndexSlot, NsRecord, BUCKETS, NS_RECORD_SIZE, N_INDEXES_BASE, N_INDEXES_EXTRA, N_INDEXES_MAX,
};
use crate::error::ErrorKind;
use crate::storage::{DataFiles, DiskLoc};

#[derive(Debug)]
pub struct NamespaceCatalog {
    dir: PathBuf,
    database: String,
    directory_per_db: bool,
    size: usize,
    ht: Option<NsHashTable>,
}

impl NamespaceCatalog {
    pub fn new(
        dir: impl Into<PathBuf>,
        database: &str,
        directory_per_db: bool,
        size: usize,
    ) -> Self {
        Self {
            dir: dir.into(),
            database: database.to_string(),
            directory_per_db,
            size,
            ht: None,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn path(&self) -> PathBuf {
        if self.directory_per_db {
            self.dir
                .join(&self.database)
                .join(format!("{}.ns", self.database))
        } else {
            self.dir.join(format!("{}.ns", self.database))
        }
    }

    /// True if the backing file is present; does not map it.
    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn allocated(&self) -> bool {
        self.ht.is_some()
    }

    /// Idempotent. Maps the existing file or creates a fresh one (creating
    /// the database directory first in directory-per-database mode).
    pub fn init(&mut self) -> Result<()> {
        if self.ht.is_some() {
            return Ok(());
        }
        let path = self.path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if self.directory_per_db && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            debug!(path = %path.display(), size = self.size, "creating namespace catalog");
            self.ht = Some(NsHashTable::create(&path, self.size, &self.database)?);
        } else {
            self.ht = Some(NsHashTable::open(&path, &self.database)?);
        }
        Ok(())
    }

    fn ht(&self) -> Result<&NsHashTable> {
        self.ht
            .as_ref()
            .ok_or_else(|| eyre::eyre!("namespace catalog not initialized"))
    }

    fn ht_mut(&mut self) -> Result<&mut NsHashTable> {
        self.ht
            .as_mut()
            .ok_or_else(|| eyre::eyre!("namespace catalog not initialized"))
    }

    /// Registers a fresh collection whose first extent lives at `loc`.
    /// Returns the record offset of the new entry.
    pub fn add_ns(&mut self, ns: &str, loc: DiskLoc, capped: bool) -> Result<usize> {
        let mut rec = zeroed_record();
        rec.init(loc, capped);
        self.add_ns_record(ns, &rec)
    }

    pub fn add_ns_record(&mut self, ns: &str, rec: &NsRecord) -> Result<usize> {
        self.init()?;
        if is_extra_name(ns) {
            bail!("namespace name '{}' is reserved for overflow records", ns);
        }
        let key = NsKey::new(ns)?;
        if self.ht()?.get(&key).is_some() {
            return Err(eyre::Report::new(ErrorKind::DuplicateNamespace(
                ns.to_string(),
            )));
        }
        use zerocopy::IntoBytes;
        if !self.ht_mut()?.put(&key, rec.as_bytes())? {
            return Err(eyre::Report::new(ErrorKind::CatalogFull));
        }
        let slot = self.ht()?.get(&key).expect("just inserted");
        Ok(self.ht()?.record_ofs(slot))
    }

    /// Looks up a namespace without running the migration hook. Internal
    /// callers that cannot touch data files use this.
    pub fn find_record(&self, ns: &str) -> Option<usize> {
        let ht = self.ht.as_ref()?;
        let key = NsKey::new(ns).ok()?;
        let slot = ht.get(&key)?;
        Some(ht.record_ofs(slot))
    }

    /// Resolves a namespace record, upgrading any legacy layout in place
    /// before returning it.
    pub fn details(&mut self, ns: &str, files: &mut DataFiles) -> Result<Option<usize>> {
        let Some(rec_ofs) = self.find_record(ns) else {
            return Ok(None);
        };
        self.check_migrate(rec_ofs, files)?;
        Ok(Some(rec_ofs))
    }

    pub fn record(&self, rec_ofs: usize) -> Result<&NsRecord> {
        self.ht()?.record_at(rec_ofs)
    }

    pub fn record_mut(&mut self, rec_ofs: usize) -> Result<&mut NsRecord> {
        self.ht_mut()?.record_at_mut(rec_ofs)
    }

    /// Tombstones the namespace along with its reserved overflow slots.
    pub fn kill_ns(&mut self, ns: &str) -> Result<()> {
        let Ok(key) = NsKey::new(ns) else {
            return Ok(());
        };
        let ht = self.ht_mut()?;
        ht.kill(&key);
        for i in 0..=1 {
            if let Ok(extra) = key.extra_name(i) {
                if let Ok(extra_key) = NsKey::new(&extra) {
                    ht.kill(&extra_key);
                }
            }
        }
        Ok(())
    }

    /// Live namespace names. With `only_collections`, names carrying `$`
    /// (index sub-namespaces and the reserved overflow keys) are dropped.
    pub fn list_names(&self, only_collections: bool) -> Result<Vec<String>> {
        let names = self.ht()?.live_names();
        Ok(if only_collections {
            names.into_iter().filter(|n| !n.contains('$')).collect()
        } else {
            names
        })
    }

    /// Inserts the synthetic `<ns>$extra<n>` node backing one overflow
    /// record and returns its record offset.
    pub fn new_extra(&mut self, ns: &str, n: usize) -> Result<usize> {
        let key = NsKey::new(ns)?;
        let extra_key = NsKey::new(&key.extra_name(n)?)?;
        ensure!(
            self.ht()?.get(&extra_key).is_none(),
            "overflow record {} already exists",
            extra_key.as_str()
        );
        if !self.ht_mut()?.put(&extra_key, &[0u8; NS_RECORD_SIZE])? {
            return Err(eyre::Report::new(ErrorKind::CatalogFull));
        }
        let slot = self.ht()?.get(&extra_key).expect("just inserted");
        let ofs = self.ht()?.record_ofs(slot);
        self.ht_mut()?.extra_at_mut(ofs)?.init();
        Ok(ofs)
    }

    /// Materializes the overflow record needed for index slot
    /// `n_indexes_so_far` and wires it into the owner's chain.
    pub fn alloc_extra(&mut self, ns: &str, rec_ofs: usize, n_indexes_so_far: usize) -> Result<usize> {
        let level = (n_indexes_so_far - N_INDEXES_BASE) / N_INDEXES_EXTRA;
        ensure!(
            level <= 1,
            "index slot {} would need a third overflow record",
            n_indexes_so_far
        );
        let extra_ofs = self.new_extra(ns, level)?;
        let rel = extra_ofs as i64 - rec_ofs as i64;
        if level == 0 {
            let rec = self.record_mut(rec_ofs)?;
            ensure!(rec.extra_offset() == 0, "overflow chain already rooted");
            rec.set_extra_offset(rel);
        } else {
            let first = self
                .extra_ofs(rec_ofs, 0)?
                .ok_or_else(|| eyre::eyre!("missing Extra"))?;
            let hd = self.ht_mut()?.extra_at_mut(first)?;
            ensure!(hd.next() == 0, "overflow chain already extended");
            hd.set_next(rel);
        }
        Ok(extra_ofs)
    }

    /// Absolute record offset of overflow record `level` (0 or 1), if
    /// materialized.
    pub fn extra_ofs(&self, rec_ofs: usize, level: usize) -> Result<Option<usize>> {
        let root = self.record(rec_ofs)?.extra_offset();
        if root == 0 {
            return Ok(None);
        }
        let first = (rec_ofs as i64 + root) as usize;
        match level {
            0 => Ok(Some(first)),
            1 => {
                let next = self.ht()?.extra_at(first)?.next();
                if next == 0 {
                    Ok(None)
                } else {
                    Ok(Some((rec_ofs as i64 + next) as usize))
                }
            }
            _ => bail!("overflow level {} out of range", level),
        }
    }

    /// Resolves index slot `i`: inline 0–9, first overflow 10–39, second
    /// overflow 40–69. A missing overflow at a required level means the
    /// catalog is corrupt.
    pub fn idx_slot(&self, rec_ofs: usize, i: usize) -> Result<IndexSlot> {
        if i < N_INDEXES_BASE {
            return Ok(*self.record(rec_ofs)?.inline_idx(i));
        }
        let rest = i - N_INDEXES_BASE;
        let level = rest / N_INDEXES_EXTRA;
        let extra = self
            .extra_ofs(rec_ofs, level)?
            .ok_or_else(|| eyre::eyre!("missing Extra"))?;
        Ok(*self.ht()?.extra_at(extra)?.slot(rest % N_INDEXES_EXTRA))
    }

    pub fn set_idx_slot(&mut self, rec_ofs: usize, i: usize, slot: IndexSlot) -> Result<()> {
        if i < N_INDEXES_BASE {
            *self.record_mut(rec_ofs)?.inline_idx_mut(i) = slot;
            return Ok(());
        }
        let rest = i - N_INDEXES_BASE;
        let level = rest / N_INDEXES_EXTRA;
        let extra = self
            .extra_ofs(rec_ofs, level)?
            .ok_or_else(|| eyre::eyre!("missing Extra"))?;
        *self.ht_mut()?.extra_at_mut(extra)?.slot_mut(rest % N_INDEXES_EXTRA) = slot;
        Ok(())
    }

    /// Uniform walk over the built index descriptors, in slot order.
    pub fn index_iter(&self, rec_ofs: usize) -> Result<IndexIterator<'_>> {
        let n = self.record(rec_ofs)?.n_indexes() as usize;
        Ok(IndexIterator {
            catalog: self,
            rec_ofs,
            i: 0,
            n,
        })
    }

    /// Claims the next free index slot, materializing an overflow record at
    /// the 10-slot and 40-slot boundaries. The caller fills the descriptor
    /// and bumps `n_indexes` (or the background-build flag) itself.
    pub fn alloc_index_slot(&mut self, ns: &str, rec_ofs: usize) -> Result<usize> {
        let so_far = self.record(rec_ofs)?.n_indexes_being_built() as usize;
        if so_far >= N_INDEXES_MAX {
            return Err(eyre::Report::new(ErrorKind::TooManyIndexes(ns.to_string())));
        }
        if so_far >= N_INDEXES_BASE {
            let level = (so_far - N_INDEXES_BASE) / N_INDEXES_EXTRA;
            if self.extra_ofs(rec_ofs, level)?.is_none() {
                self.alloc_extra(ns, rec_ofs, so_far)?;
            }
        }
        Ok(so_far)
    }

    /// Removes the descriptor at `i`, shifting later descriptors (and their
    /// multikey bits) down one slot.
    pub fn remove_index_slot(&mut self, rec_ofs: usize, i: usize) -> Result<()> {
        let n = self.record(rec_ofs)?.n_indexes() as usize;
        ensure!(i < n, "index slot {} out of range ({} indexes)", i, n);
        for j in i..n - 1 {
            let next = self.idx_slot(rec_ofs, j + 1)?;
            self.set_idx_slot(rec_ofs, j, next)?;
        }
        self.set_idx_slot(rec_ofs, n - 1, IndexSlot::EMPTY)?;

        let rec = self.record_mut(rec_ofs)?;
        let bits = rec.multikey_index_bits();
        let below = (1u64 << i) - 1;
        rec.set_multikey_index_bits((bits & below) | ((bits >> 1) & !below));
        rec.set_n_indexes(n as i32 - 1);
        rec.about_to_delete_an_index();
        Ok(())
    }

    /// One-shot upgrade of a legacy record layout. Old capped collections
    /// were written before the ring state existed: `cap_extent` is zeroed
    /// and deleted records still sit in size buckets. Chain every bucketed
    /// record onto the capped free list and establish the ring cursor.
    /// Running it again is a no-op since `cap_extent` is nonzero afterwards.
    pub fn check_migrate(&mut self, rec_ofs: usize, files: &mut DataFiles) -> Result<()> {
        let legacy = {
            let rec = self.record(rec_ofs)?;
            rec.is_capped() && rec.cap_extent() == DiskLoc::new(0, 0)
        };
        if !legacy {
            return Ok(());
        }
        debug!(database = %self.database, "migrating legacy capped namespace record");

        {
            let rec = self.record_mut(rec_ofs)?;
            rec.set_cap_first_new_record(DiskLoc::INVALID);
        }
        for b in 1..BUCKETS {
            let head = self.record(rec_ofs)?.deleted_list(b);
            if head.is_null() || !head.is_valid() {
                let rec = self.record_mut(rec_ofs)?;
                rec.set_deleted_list(b, DiskLoc::NULL);
                continue;
            }
            let mut tail = head;
            loop {
                let next = files.deleted(tail)?.next_deleted();
                if next.is_null() {
                    break;
                }
                tail = next;
            }
            let capped_head = self.record(rec_ofs)?.deleted_list(0);
            files.deleted_mut(tail)?.set_next_deleted(capped_head);
            let rec = self.record_mut(rec_ofs)?;
            rec.set_deleted_list(0, head);
            rec.set_deleted_list(b, DiskLoc::NULL);
        }
        let rec = self.record_mut(rec_ofs)?;
        let first = rec.first_extent();
        rec.set_cap_extent(first);
        Ok(())
    }

    /// Rebuilds the overflow chain of a record that was just copied under a
    /// new name: the copied relative offsets point into the old owner's
    /// neighborhood and are meaningless for the copy.
    pub fn copying_from(&mut self, new_ns: &str, new_rec_ofs: usize, old_rec_ofs: usize) -> Result<()> {
        let old_root = self.record(old_rec_ofs)?.extra_offset();
        self.record_mut(new_rec_ofs)?.set_extra_offset(0);
        if old_root == 0 {
            return Ok(());
        }

        let mut src_ofs = (old_rec_ofs as i64 + old_root) as usize;
        let mut n = N_INDEXES_BASE;
        loop {
            let src = *self.ht()?.extra_at(src_ofs)?;
            let dst_ofs = self.alloc_extra(new_ns, new_rec_ofs, n)?;
            self.ht_mut()?.extra_at_mut(dst_ofs)?.copy_slots_from(&src);
            if src.next() == 0 {
                break;
            }
            n += N_INDEXES_EXTRA;
            src_ofs = (old_rec_ofs as i64 + src.next()) as usize;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        match &self.ht {
            Some(ht) => ht.sync(),
            None => Ok(()),
        }
    }
}

pub struct IndexIterator<'a> {
    catalog: &'a NamespaceCatalog,
    rec_ofs: usize,
    i: usize,
    n: usize,
}

impl IndexIterator<'_> {
    /// Slot index of the descriptor `next` will return.
    pub fn pos(&self) -> usize {
        self.i
    }

    pub fn more(&self) -> bool {
        self.i < self.n
    }
}

impl Iterator for IndexIterator<'_> {
    type Item = Result<IndexSlot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.i >= self.n {
            return None;
        }
        let slot = self.catalog.idx_slot(self.rec_ofs, self.i);
        self.i += 1;
        Some(slot)
    }
}

fn zeroed_record() -> NsRecord {
    use zerocopy::FromBytes;
    NsRecord::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::hashtable::{CATALOG_HEADER_SIZE, NODE_SIZE};

    fn scratch() -> PathBuf {
        tempfile::tempdir().unwrap().keep()
    }

    fn small_catalog(dir: &PathBuf, nodes: usize) -> NamespaceCatalog {
        let size = CATALOG_HEADER_SIZE + nodes * NODE_SIZE;
        let mut cat = NamespaceCatalog::new(dir, "acme", false, size);
        cat.init().unwrap();
        cat
    }

    fn files(dir: &PathBuf) -> DataFiles {
        DataFiles::open(dir, "acme", 64 * 1024).unwrap()
    }

    #[test]
    fn init_is_idempotent_and_exists_does_not_map() {
        let dir = scratch();
        let mut cat = NamespaceCatalog::new(&dir, "acme", false, CATALOG_HEADER_SIZE + 8 * NODE_SIZE);
        assert!(!cat.exists());
        assert!(!cat.allocated());

        cat.init().unwrap();
        cat.init().unwrap();
        assert!(cat.exists());
        assert!(cat.allocated());

        let probe = NamespaceCatalog::new(&dir, "acme", false, 0);
        assert!(probe.exists());
        assert!(!probe.allocated());
    }

    #[test]
    fn directory_per_db_creates_the_subdirectory() {
        let dir = scratch();
        let mut cat = NamespaceCatalog::new(&dir, "acme", true, CATALOG_HEADER_SIZE + 8 * NODE_SIZE);
        cat.init().unwrap();
        assert!(dir.join("acme").join("acme.ns").exists());
    }

    #[test]
    fn add_then_get_then_kill() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        let mut df = files(&dir);

        let loc = DiskLoc::new(0, 128);
        cat.add_ns("acme.orders", loc, false).unwrap();

        let rec_ofs = cat.details("acme.orders", &mut df).unwrap().unwrap();
        assert_eq!(cat.record(rec_ofs).unwrap().first_extent(), loc);

        cat.kill_ns("acme.orders").unwrap();
        assert!(cat.details("acme.orders", &mut df).unwrap().is_none());
    }

    #[test]
    fn duplicate_namespace_is_a_user_error() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();

        let err = cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::DuplicateNamespace(_))
        ));
    }

    #[test]
    fn reserved_extra_names_are_rejected() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        let err = cat
            .add_ns("acme.orders$extra", DiskLoc::NULL, false)
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn full_catalog_reports_catalog_full() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 2);
        cat.add_ns("acme.a", DiskLoc::NULL, false).unwrap();
        cat.add_ns("acme.b", DiskLoc::NULL, false).unwrap();

        let err = cat.add_ns("acme.c", DiskLoc::NULL, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::CatalogFull)
        ));
    }

    #[test]
    fn list_names_filters_dollar_names() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let rec_ofs = cat.find_record("acme.orders").unwrap();
        // force an overflow record into the table
        cat.alloc_extra("acme.orders", rec_ofs, 10).unwrap();

        let all = cat.list_names(false).unwrap();
        assert!(all.iter().any(|n| n == "acme.orders$extra"));

        let colls = cat.list_names(true).unwrap();
        assert_eq!(colls, vec!["acme.orders"]);
    }

    #[test]
    fn eleventh_index_slot_materializes_overflow() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let rec_ofs = cat.find_record("acme.orders").unwrap();

        for i in 0..10 {
            let slot = cat.alloc_index_slot("acme.orders", rec_ofs).unwrap();
            assert_eq!(slot, i);
            let rec = cat.record_mut(rec_ofs).unwrap();
            rec.set_n_indexes(i as i32 + 1);
        }
        assert_eq!(cat.record(rec_ofs).unwrap().extra_offset(), 0);

        let slot = cat.alloc_index_slot("acme.orders", rec_ofs).unwrap();
        assert_eq!(slot, 10);
        assert_ne!(cat.record(rec_ofs).unwrap().extra_offset(), 0);
        assert!(cat.extra_ofs(rec_ofs, 0).unwrap().is_some());
        assert!(cat.extra_ofs(rec_ofs, 1).unwrap().is_none());
    }

    #[test]
    fn index_slots_round_trip_through_overflow() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 64);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let rec_ofs = cat.find_record("acme.orders").unwrap();

        // fill 45 slots, spanning both overflow records
        for i in 0..45 {
            let slot_no = cat.alloc_index_slot("acme.orders", rec_ofs).unwrap();
            assert_eq!(slot_no, i);
            let slot = IndexSlot {
                head: DiskLoc::NULL,
                info: DiskLoc::new(0, 1000 + i as i32),
            };
            cat.set_idx_slot(rec_ofs, slot_no, slot).unwrap();
            cat.record_mut(rec_ofs)
                .unwrap()
                .set_n_indexes(i as i32 + 1);
        }

        assert!(cat.extra_ofs(rec_ofs, 1).unwrap().is_some());
        for i in 0..45 {
            let slot = cat.idx_slot(rec_ofs, i).unwrap();
            assert_eq!(slot.info, DiskLoc::new(0, 1000 + i as i32));
        }

        let collected: Result<Vec<_>> = cat.index_iter(rec_ofs).unwrap().collect();
        assert_eq!(collected.unwrap().len(), 45);
    }

    #[test]
    fn sixty_fifth_index_is_rejected() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 64);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let rec_ofs = cat.find_record("acme.orders").unwrap();

        for i in 0..64 {
            let slot = cat.alloc_index_slot("acme.orders", rec_ofs).unwrap();
            assert_eq!(slot, i);
            cat.record_mut(rec_ofs)
                .unwrap()
                .set_n_indexes(i as i32 + 1);
        }

        let err = cat.alloc_index_slot("acme.orders", rec_ofs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::TooManyIndexes(_))
        ));
    }

    #[test]
    fn remove_index_slot_shifts_descriptors_and_multikey_bits() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let rec_ofs = cat.find_record("acme.orders").unwrap();

        for i in 0..3 {
            cat.alloc_index_slot("acme.orders", rec_ofs).unwrap();
            cat.set_idx_slot(
                rec_ofs,
                i,
                IndexSlot {
                    head: DiskLoc::NULL,
                    info: DiskLoc::new(0, 100 + i as i32),
                },
            )
            .unwrap();
            cat.record_mut(rec_ofs)
                .unwrap()
                .set_n_indexes(i as i32 + 1);
        }
        // slots 1 and 2 are multikey
        {
            let rec = cat.record_mut(rec_ofs).unwrap();
            rec.set_index_is_multikey(1);
            rec.set_index_is_multikey(2);
        }

        cat.remove_index_slot(rec_ofs, 1).unwrap();

        let rec = cat.record(rec_ofs).unwrap();
        assert_eq!(rec.n_indexes(), 2);
        assert!(!rec.is_multikey(0));
        assert!(rec.is_multikey(1)); // old slot 2 shifted down
        assert!(!rec.is_multikey(2));
        assert_eq!(
            cat.idx_slot(rec_ofs, 1).unwrap().info,
            DiskLoc::new(0, 102)
        );
    }

    #[test]
    fn kill_ns_removes_overflow_slots_too() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let rec_ofs = cat.find_record("acme.orders").unwrap();
        cat.alloc_extra("acme.orders", rec_ofs, 10).unwrap();

        cat.kill_ns("acme.orders").unwrap();

        assert!(cat.find_record("acme.orders").is_none());
        assert!(cat.find_record("acme.orders$extra").is_none());
    }

    #[test]
    fn check_migrate_upgrades_legacy_capped_layout_once() {
        use crate::storage::EXTENT_HEADER_SIZE;

        let dir = scratch();
        let mut cat = small_catalog(&dir, 32);
        let mut df = files(&dir);

        // two deleted records chained in bucket 3
        let ext = df.alloc_extent(1024).unwrap();
        let d1 = ext.plus(EXTENT_HEADER_SIZE as i32);
        let d2 = d1.plus(128);
        df.deleted_mut(d1).unwrap().init(128, ext.ofs());
        df.deleted_mut(d2).unwrap().init(128, ext.ofs());
        df.deleted_mut(d1).unwrap().set_next_deleted(d2);

        cat.add_ns("acme.events", ext, true).unwrap();
        let rec_ofs = cat.find_record("acme.events").unwrap();
        {
            // simulate the legacy layout: zeroed ring cursor, bucketed frees
            let rec = cat.record_mut(rec_ofs).unwrap();
            rec.set_cap_extent(DiskLoc::new(0, 0));
            rec.set_deleted_list(0, DiskLoc::NULL);
            rec.set_deleted_list(1, DiskLoc::NULL);
            rec.set_deleted_list(3, d1);
        }

        cat.details("acme.events", &mut df).unwrap().unwrap();

        let rec = cat.record(rec_ofs).unwrap();
        assert_eq!(rec.cap_extent(), ext);
        assert!(!rec.cap_first_new_record().is_valid());
        assert_eq!(rec.deleted_list(0), d1);
        assert!(rec.deleted_list(3).is_null());
        assert_eq!(df.deleted(d1).unwrap().next_deleted(), d2);

        // running the hook again is a no-op
        let before = *cat.record(rec_ofs).unwrap();
        cat.details("acme.events", &mut df).unwrap().unwrap();
        let after = cat.record(rec_ofs).unwrap();
        assert_eq!(before.deleted_list(0), after.deleted_list(0));
        assert_eq!(before.cap_extent(), after.cap_extent());
    }

    #[test]
    fn copying_from_rebuilds_the_overflow_chain() {
        let dir = scratch();
        let mut cat = small_catalog(&dir, 64);
        cat.add_ns("acme.orders", DiskLoc::NULL, false).unwrap();
        let old_ofs = cat.find_record("acme.orders").unwrap();

        // two overflow levels on the source
        cat.alloc_extra("acme.orders", old_ofs, 10).unwrap();
        cat.alloc_extra("acme.orders", old_ofs, 40).unwrap();
        cat.set_idx_slot(
            old_ofs,
            12,
            IndexSlot {
                head: DiskLoc::NULL,
                info: DiskLoc::new(0, 444),
            },
        )
        .unwrap();
        cat.set_idx_slot(
            old_ofs,
            41,
            IndexSlot {
                head: DiskLoc::NULL,
                info: DiskLoc::new(0, 555),
            },
        )
        .unwrap();

        // copy the record bytes under the new name, then fix up
        let rec = *cat.record(old_ofs).unwrap();
        let new_ofs = cat.add_ns_record("acme.renamed", &rec).unwrap();
        cat.copying_from("acme.renamed", new_ofs, old_ofs).unwrap();
        cat.kill_ns("acme.orders").unwrap();

        assert_ne!(cat.record(new_ofs).unwrap().extra_offset(), 0);
        assert_eq!(
            cat.idx_slot(new_ofs, 12).unwrap().info,
            DiskLoc::new(0, 444)
        );
        assert_eq!(
            cat.idx_slot(new_ofs, 41).unwrap().info,
            DiskLoc::new(0, 555)
        );
        assert!(cat.find_record("acme.renamed$extra").is_some());
        assert!(cat.find_record("acme.orders$extra").is_none());
    }
}
