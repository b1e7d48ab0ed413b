//! Cursors: the common iterator contract plus the two basic access paths,
//! collection scan and index scan.
//!
//! ## Capped scan order
//!
//! A capped collection that has wrapped holds documents from two passes:
//! the surviving tail of the previous pass (chain front of `cap_extent` up
//! to `cap_first_new_record`), the intermediate extents in ring order, and
//! the current pass's records (`cap_first_new_record` to the chain end of
//! `cap_extent`). A forward scan visits exactly that sequence so documents
//! appear oldest first; the reverse cursor mirrors it.
//!
//! Index cursors operate on a snapshot of the key store taken at
//! construction; `note_location`/`check_location` re-seek by key after a
//! yield.

use eyre::Result;
use hashbrown::HashSet;

use crate::catalog::NsRecord;
use crate::document::{decode_document, Document};
use crate::index::{IndexKey, IndexStore};
use crate::interrupt::InterruptToken;
use crate::storage::{DataFiles, DiskLoc, NULL_OFS};
use crate::transient::NsTransient;

/// Read-side context handed to every cursor and query-op call. Carries the
/// collection's transient entry so plan racing can consult and update the
/// plan cache mid-iteration.
pub struct QueryCtx<'a> {
    pub files: &'a DataFiles,
    pub indexes: &'a IndexStore,
    pub token: &'a InterruptToken,
    pub transient: &'a NsTransient,
}

pub trait Cursor {
    fn ok(&self) -> bool;
    fn advance(&mut self, ctx: &QueryCtx) -> Result<bool>;
    fn curr_loc(&self) -> DiskLoc;

    fn curr_key(&self) -> Option<&IndexKey> {
        None
    }

    fn current(&self, ctx: &QueryCtx) -> Result<Document> {
        decode_document(ctx.files.record_data(self.curr_loc())?)
    }

    fn note_location(&mut self) {}

    fn check_location(&mut self, _ctx: &QueryCtx) -> Result<()> {
        Ok(())
    }

    /// Records `loc` as seen; true when it was already seen (multikey
    /// cursors can surface the same document once per key).
    fn getsetdup(&mut self, _loc: DiskLoc) -> bool {
        false
    }

    /// Key pattern of the underlying index; empty for collection scans.
    /// Callers use it to decide whether a covered match suffices.
    fn index_key_pattern(&self) -> Document {
        Document::new()
    }
}

/// Snapshot of the namespace-record fields a collection scan needs. Taken
/// under the latch at plan time; cursors never touch the catalog again.
#[derive(Debug, Clone, Default)]
pub struct CollectionScanSpec {
    pub first_extent: DiskLoc,
    pub last_extent: DiskLoc,
    pub capped: bool,
    pub cap_extent: DiskLoc,
    pub cap_first_new_record: DiskLoc,
    pub cap_looped: bool,
}

impl CollectionScanSpec {
    pub fn from_record(rec: &NsRecord) -> Self {
        Self {
            first_extent: rec.first_extent(),
            last_extent: rec.last_extent(),
            capped: rec.is_capped(),
            cap_extent: rec.cap_extent(),
            cap_first_new_record: rec.cap_first_new_record(),
            cap_looped: rec.cap_looped(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanPhase {
    Plain,
    CapOld,
    CapRing(DiskLoc),
    CapNew,
    Done,
}

/// Collection scan in natural (or reverse natural) order, ring-aware for
/// capped collections.
pub struct BasicCursor {
    spec: CollectionScanSpec,
    reverse: bool,
    phase: ScanPhase,
    curr: DiskLoc,
}

impl BasicCursor {
    pub fn forward(spec: CollectionScanSpec, ctx: &QueryCtx) -> Result<Self> {
        Self::new(spec, false, ctx)
    }

    pub fn reverse(spec: CollectionScanSpec, ctx: &QueryCtx) -> Result<Self> {
        Self::new(spec, true, ctx)
    }

    fn new(spec: CollectionScanSpec, reverse: bool, ctx: &QueryCtx) -> Result<Self> {
        let mut cursor = Self {
            spec,
            reverse,
            phase: ScanPhase::Plain,
            curr: DiskLoc::NULL,
        };
        cursor.init(ctx)?;
        Ok(cursor)
    }

    fn init(&mut self, ctx: &QueryCtx) -> Result<()> {
        if self.spec.first_extent.is_null() {
            self.phase = ScanPhase::Done;
            return Ok(());
        }
        if !(self.spec.capped && self.spec.cap_looped) {
            self.phase = ScanPhase::Plain;
            self.curr = if self.reverse {
                ctx.files.last_record(self.spec.last_extent)?
            } else {
                ctx.files.first_record(self.spec.first_extent)?
            };
            if self.curr.is_null() {
                self.phase = ScanPhase::Done;
            }
            return Ok(());
        }
        if self.reverse {
            self.enter_cap_new_reverse(ctx)
        } else {
            self.enter_cap_old(ctx)
        }
    }

    fn ring_next(&self, ctx: &QueryCtx, ext: DiskLoc) -> Result<DiskLoc> {
        let next = ctx.files.extent(ext)?.xnext();
        Ok(if next.is_null() {
            self.spec.first_extent
        } else {
            next
        })
    }

    fn ring_prev(&self, ctx: &QueryCtx, ext: DiskLoc) -> Result<DiskLoc> {
        let prev = ctx.files.extent(ext)?.xprev();
        Ok(if prev.is_null() {
            self.spec.last_extent
        } else {
            prev
        })
    }

    fn within_next(&self, ctx: &QueryCtx, loc: DiskLoc) -> Result<DiskLoc> {
        let header = ctx.files.record_header(loc)?;
        Ok(if header.next_ofs() == NULL_OFS {
            DiskLoc::NULL
        } else {
            loc.with_ofs(header.next_ofs())
        })
    }

    fn within_prev(&self, ctx: &QueryCtx, loc: DiskLoc) -> Result<DiskLoc> {
        let header = ctx.files.record_header(loc)?;
        Ok(if header.prev_ofs() == NULL_OFS {
            DiskLoc::NULL
        } else {
            loc.with_ofs(header.prev_ofs())
        })
    }

    // forward ring phases

    fn enter_cap_old(&mut self, ctx: &QueryCtx) -> Result<()> {
        let first = ctx.files.extent(self.spec.cap_extent)?.first_record();
        if first.is_null() || first == self.spec.cap_first_new_record {
            return self.enter_ring_forward(ctx, self.ring_next(ctx, self.spec.cap_extent)?);
        }
        self.phase = ScanPhase::CapOld;
        self.curr = first;
        Ok(())
    }

    fn enter_ring_forward(&mut self, ctx: &QueryCtx, mut ext: DiskLoc) -> Result<()> {
        while ext != self.spec.cap_extent {
            let first = ctx.files.extent(ext)?.first_record();
            if !first.is_null() {
                self.phase = ScanPhase::CapRing(ext);
                self.curr = first;
                return Ok(());
            }
            ext = self.ring_next(ctx, ext)?;
        }
        self.enter_cap_new()
    }

    fn enter_cap_new(&mut self) -> Result<()> {
        let cfnr = self.spec.cap_first_new_record;
        if cfnr.is_null() || !cfnr.is_valid() {
            self.phase = ScanPhase::Done;
            self.curr = DiskLoc::NULL;
        } else {
            self.phase = ScanPhase::CapNew;
            self.curr = cfnr;
        }
        Ok(())
    }

    // reverse ring phases (mirror image)

    fn enter_cap_new_reverse(&mut self, ctx: &QueryCtx) -> Result<()> {
        let cfnr = self.spec.cap_first_new_record;
        let last = ctx.files.extent(self.spec.cap_extent)?.last_record();
        if cfnr.is_null() || !cfnr.is_valid() || last.is_null() {
            return self.enter_ring_reverse(ctx, self.ring_prev(ctx, self.spec.cap_extent)?);
        }
        self.phase = ScanPhase::CapNew;
        self.curr = last;
        Ok(())
    }

    fn enter_ring_reverse(&mut self, ctx: &QueryCtx, mut ext: DiskLoc) -> Result<()> {
        while ext != self.spec.cap_extent {
            let last = ctx.files.extent(ext)?.last_record();
            if !last.is_null() {
                self.phase = ScanPhase::CapRing(ext);
                self.curr = last;
                return Ok(());
            }
            ext = self.ring_prev(ctx, ext)?;
        }
        self.enter_cap_old_reverse(ctx)
    }

    fn enter_cap_old_reverse(&mut self, ctx: &QueryCtx) -> Result<()> {
        let cfnr = self.spec.cap_first_new_record;
        let boundary = if cfnr.is_null() || !cfnr.is_valid() {
            ctx.files.extent(self.spec.cap_extent)?.last_record()
        } else {
            self.within_prev(ctx, cfnr)?
        };
        if boundary.is_null() {
            self.phase = ScanPhase::Done;
            self.curr = DiskLoc::NULL;
        } else {
            self.phase = ScanPhase::CapOld;
            self.curr = boundary;
        }
        Ok(())
    }

    fn advance_forward(&mut self, ctx: &QueryCtx) -> Result<()> {
        match self.phase {
            ScanPhase::Plain => {
                self.curr = ctx.files.next_record(self.curr)?;
                if self.curr.is_null() {
                    self.phase = ScanPhase::Done;
                }
            }
            ScanPhase::CapOld => {
                let next = self.within_next(ctx, self.curr)?;
                if next.is_null() || next == self.spec.cap_first_new_record {
                    self.enter_ring_forward(ctx, self.ring_next(ctx, self.spec.cap_extent)?)?;
                } else {
                    self.curr = next;
                }
            }
            ScanPhase::CapRing(ext) => {
                let next = self.within_next(ctx, self.curr)?;
                if next.is_null() {
                    self.enter_ring_forward(ctx, self.ring_next(ctx, ext)?)?;
                } else {
                    self.curr = next;
                }
            }
            ScanPhase::CapNew => {
                let next = self.within_next(ctx, self.curr)?;
                if next.is_null() {
                    self.phase = ScanPhase::Done;
                    self.curr = DiskLoc::NULL;
                } else {
                    self.curr = next;
                }
            }
            ScanPhase::Done => {}
        }
        Ok(())
    }

    fn advance_reverse(&mut self, ctx: &QueryCtx) -> Result<()> {
        match self.phase {
            ScanPhase::Plain => {
                self.curr = ctx.files.prev_record(self.curr)?;
                if self.curr.is_null() {
                    self.phase = ScanPhase::Done;
                }
            }
            ScanPhase::CapNew => {
                if self.curr == self.spec.cap_first_new_record {
                    self.enter_ring_reverse(ctx, self.ring_prev(ctx, self.spec.cap_extent)?)?;
                } else {
                    let prev = self.within_prev(ctx, self.curr)?;
                    if prev.is_null() {
                        self.enter_ring_reverse(
                            ctx,
                            self.ring_prev(ctx, self.spec.cap_extent)?,
                        )?;
                    } else {
                        self.curr = prev;
                    }
                }
            }
            ScanPhase::CapRing(ext) => {
                let prev = self.within_prev(ctx, self.curr)?;
                if prev.is_null() {
                    self.enter_ring_reverse(ctx, self.ring_prev(ctx, ext)?)?;
                } else {
                    self.curr = prev;
                }
            }
            ScanPhase::CapOld => {
                let prev = self.within_prev(ctx, self.curr)?;
                if prev.is_null() {
                    self.phase = ScanPhase::Done;
                    self.curr = DiskLoc::NULL;
                } else {
                    self.curr = prev;
                }
            }
            ScanPhase::Done => {}
        }
        Ok(())
    }
}

impl Cursor for BasicCursor {
    fn ok(&self) -> bool {
        self.phase != ScanPhase::Done && !self.curr.is_null()
    }

    fn advance(&mut self, ctx: &QueryCtx) -> Result<bool> {
        if !self.ok() {
            return Ok(false);
        }
        if self.reverse {
            self.advance_reverse(ctx)?;
        } else {
            self.advance_forward(ctx)?;
        }
        Ok(self.ok())
    }

    fn curr_loc(&self) -> DiskLoc {
        self.curr
    }

    // note_location/check_location keep their defaults: a collection scan
    // resumes where it left off, and records cannot move under the latch
}

/// Index scan over a snapshot of one key store.
pub struct IndexCursor {
    ns: String,
    index_name: String,
    key_pattern: Document,
    multikey: bool,
    bounds: Vec<(IndexKey, IndexKey)>,
    end_inclusive: bool,
    reverse: bool,
    entries: Vec<(IndexKey, DiskLoc)>,
    pos: usize,
    dups: HashSet<DiskLoc>,
    noted: Option<IndexKey>,
}

impl IndexCursor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &QueryCtx,
        ns: &str,
        index_name: &str,
        key_pattern: Document,
        multikey: bool,
        bounds: Vec<(IndexKey, IndexKey)>,
        end_inclusive: bool,
        reverse: bool,
    ) -> Self {
        let entries = Self::materialize(ctx, ns, index_name, &bounds, end_inclusive, reverse);
        Self {
            ns: ns.to_string(),
            index_name: index_name.to_string(),
            key_pattern,
            multikey,
            bounds,
            end_inclusive,
            reverse,
            entries,
            pos: 0,
            dups: HashSet::new(),
            noted: None,
        }
    }

    fn materialize(
        ctx: &QueryCtx,
        ns: &str,
        index_name: &str,
        bounds: &[(IndexKey, IndexKey)],
        end_inclusive: bool,
        reverse: bool,
    ) -> Vec<(IndexKey, DiskLoc)> {
        let mut out = Vec::new();
        let mut ordered: Vec<&(IndexKey, IndexKey)> = bounds.iter().collect();
        if reverse {
            ordered.reverse();
        }
        for (start, end) in ordered {
            out.extend(ctx.indexes.range_scan(ns, index_name, start, end, end_inclusive, reverse));
        }
        out
    }
}

impl Cursor for IndexCursor {
    fn ok(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn advance(&mut self, _ctx: &QueryCtx) -> Result<bool> {
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
        Ok(self.ok())
    }

    fn curr_loc(&self) -> DiskLoc {
        self.entries[self.pos].1
    }

    fn curr_key(&self) -> Option<&IndexKey> {
        self.entries.get(self.pos).map(|(k, _)| k)
    }

    fn note_location(&mut self) {
        self.noted = self.curr_key().cloned();
    }

    fn check_location(&mut self, ctx: &QueryCtx) -> Result<()> {
        let Some(noted) = self.noted.take() else {
            return Ok(());
        };
        self.entries = Self::materialize(
            ctx,
            &self.ns,
            &self.index_name,
            &self.bounds,
            self.end_inclusive,
            self.reverse,
        );
        self.pos = self
            .entries
            .iter()
            .position(|(k, _)| {
                if self.reverse {
                    *k <= noted
                } else {
                    *k >= noted
                }
            })
            .unwrap_or(self.entries.len());
        Ok(())
    }

    fn getsetdup(&mut self, loc: DiskLoc) -> bool {
        if !self.multikey {
            return false;
        }
        !self.dups.insert(loc)
    }

    fn index_key_pattern(&self) -> Document {
        self.key_pattern.clone()
    }
}

/// Ring-order document walk used by maintenance paths and tests; equivalent
/// to draining a forward [`BasicCursor`].
pub fn scan_all(
    files: &DataFiles,
    indexes: &IndexStore,
    token: &InterruptToken,
    spec: CollectionScanSpec,
) -> Result<Vec<(DiskLoc, Document)>> {
    let transient = NsTransient::default();
    let ctx = QueryCtx {
        files,
        indexes,
        token,
        transient: &transient,
    };
    let mut cursor = BasicCursor::forward(spec, &ctx)?;
    let mut out = Vec::new();
    while cursor.ok() {
        out.push((cursor.curr_loc(), cursor.current(&ctx)?));
        cursor.advance(&ctx)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NS_RECORD_SIZE;
    use crate::doc;
    use crate::document::{encode_document, Value};
    use crate::storage::{Allocator, EXTENT_HEADER_SIZE, RECORD_HEADER_SIZE};
    use zerocopy::FromBytes;

    struct Fixture {
        files: DataFiles,
        indexes: IndexStore,
        token: InterruptToken,
        transient: NsTransient,
        rec: NsRecord,
    }

    impl Fixture {
        fn ctx(&self) -> QueryCtx<'_> {
            QueryCtx {
                files: &self.files,
                indexes: &self.indexes,
                token: &self.token,
                transient: &self.transient,
            }
        }

        fn insert(&mut self, n: i64) -> DiskLoc {
            // padded so every record quantizes to 128 bytes, matching the
            // extent sizing in the capped fixtures
            let doc = doc! { "n" => n, "pad" => "x".repeat(70) };
            let bytes = encode_document(&doc);
            let len = bytes.len() as i32 + RECORD_HEADER_SIZE as i32;
            let mut alloc = Allocator::new(&mut self.files, &self.token, 4096);
            let (loc, _) = alloc
                .alloc("acme.c", &mut self.rec, len, &mut |_, _| Ok(()))
                .unwrap();
            self.files.write_record_data(loc, &bytes).unwrap();
            self.rec.stats_add(1, bytes.len() as i64);
            loc
        }
    }

    fn fixture(capped: bool, n_extents: usize, extent_size: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap().keep();
        let mut files = DataFiles::open(&dir, "acme", 256 * 1024).unwrap();
        let token = InterruptToken::new();
        let mut rec = NsRecord::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        rec.init(DiskLoc::NULL, capped);
        if capped {
            let mut alloc = Allocator::new(&mut files, &token, extent_size);
            for _ in 0..n_extents {
                let ext = alloc.alloc_linked_extent(&mut rec, extent_size).unwrap();
                alloc.seed_extent(&mut rec, ext).unwrap();
            }
        }
        Fixture {
            files,
            indexes: IndexStore::new(),
            token,
            transient: NsTransient::default(),
            rec,
        }
    }

    fn drain(cursor: &mut dyn Cursor, ctx: &QueryCtx) -> Vec<i64> {
        let mut out = Vec::new();
        while cursor.ok() {
            let doc = cursor.current(ctx).unwrap();
            out.push(doc.get("n").unwrap().as_int().unwrap());
            cursor.advance(ctx).unwrap();
        }
        out
    }

    #[test]
    fn plain_scan_yields_insertion_order() {
        let mut fx = fixture(false, 0, 0);
        for n in 0..5 {
            fx.insert(n);
        }
        let spec = CollectionScanSpec::from_record(&fx.rec);

        let ctx = fx.ctx();
        let mut fwd = BasicCursor::forward(spec.clone(), &ctx).unwrap();
        assert_eq!(drain(&mut fwd, &ctx), vec![0, 1, 2, 3, 4]);

        let mut rev = BasicCursor::reverse(spec, &ctx).unwrap();
        assert_eq!(drain(&mut rev, &ctx), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn empty_collection_scan_is_immediately_done() {
        let fx = fixture(false, 0, 0);
        let ctx = fx.ctx();
        let cursor =
            BasicCursor::forward(CollectionScanSpec::from_record(&fx.rec), &ctx).unwrap();
        assert!(!cursor.ok());
    }

    #[test]
    fn capped_looped_scan_runs_oldest_first() {
        // one 128-byte record per extent; five inserts wrap a 3-extent ring
        let extent_size = EXTENT_HEADER_SIZE + 128 + 64;
        let mut fx = fixture(true, 3, extent_size);
        for n in 0..5 {
            fx.insert(n);
        }
        assert!(fx.rec.cap_looped());
        let spec = CollectionScanSpec::from_record(&fx.rec);

        let ctx = fx.ctx();
        let mut fwd = BasicCursor::forward(spec.clone(), &ctx).unwrap();
        assert_eq!(drain(&mut fwd, &ctx), vec![2, 3, 4]);

        let mut rev = BasicCursor::reverse(spec, &ctx).unwrap();
        assert_eq!(drain(&mut rev, &ctx), vec![4, 3, 2]);
    }

    #[test]
    fn capped_unlooped_scan_is_plain() {
        let extent_size = EXTENT_HEADER_SIZE + 3 * 192;
        let mut fx = fixture(true, 2, extent_size);
        for n in 0..3 {
            fx.insert(n);
        }
        assert!(!fx.rec.cap_looped());
        let spec = CollectionScanSpec::from_record(&fx.rec);

        let ctx = fx.ctx();
        let mut fwd = BasicCursor::forward(spec, &ctx).unwrap();
        assert_eq!(drain(&mut fwd, &ctx), vec![0, 1, 2]);
    }

    #[test]
    fn index_cursor_walks_bounds_in_order() {
        let mut fx = fixture(false, 0, 0);
        let locs: Vec<DiskLoc> = (0..5).map(|n| fx.insert(n)).collect();
        fx.indexes.create("acme.c", "n_1");
        for (n, loc) in locs.iter().enumerate() {
            fx.indexes
                .insert(
                    "acme.c",
                    "n_1",
                    &[IndexKey::single(Value::Int(n as i64))],
                    *loc,
                )
                .unwrap();
        }

        let ctx = fx.ctx();
        let bounds = vec![(
            IndexKey::single(Value::Int(1)),
            IndexKey::single(Value::Int(3)),
        )];
        let mut cursor = IndexCursor::new(
            &ctx,
            "acme.c",
            "n_1",
            doc! { "n" => 1 },
            false,
            bounds.clone(),
            true,
            false,
        );
        assert_eq!(drain(&mut cursor, &ctx), vec![1, 2, 3]);

        let mut rev = IndexCursor::new(
            &ctx,
            "acme.c",
            "n_1",
            doc! { "n" => 1 },
            false,
            bounds,
            true,
            true,
        );
        assert_eq!(drain(&mut rev, &ctx), vec![3, 2, 1]);
    }

    #[test]
    fn multikey_cursor_deduplicates_locations() {
        let mut fx = fixture(false, 0, 0);
        let loc = fx.insert(7);
        fx.indexes.create("acme.c", "tags_1");
        fx.indexes
            .insert(
                "acme.c",
                "tags_1",
                &[
                    IndexKey::single(Value::Str("a".into())),
                    IndexKey::single(Value::Str("b".into())),
                ],
                loc,
            )
            .unwrap();

        let ctx = fx.ctx();
        let bounds = vec![(
            IndexKey::single(Value::MinKey),
            IndexKey::single(Value::MaxKey),
        )];
        let mut cursor = IndexCursor::new(
            &ctx,
            "acme.c",
            "tags_1",
            doc! { "tags" => 1 },
            true,
            bounds,
            true,
            false,
        );

        let mut seen = 0;
        let mut dups = 0;
        while cursor.ok() {
            if cursor.getsetdup(cursor.curr_loc()) {
                dups += 1;
            } else {
                seen += 1;
            }
            cursor.advance(&ctx).unwrap();
        }
        assert_eq!(seen, 1);
        assert_eq!(dups, 1);
    }

    #[test]
    fn index_cursor_reseeks_after_yield() {
        let mut fx = fixture(false, 0, 0);
        let locs: Vec<DiskLoc> = (0..4).map(|n| fx.insert(n)).collect();
        fx.indexes.create("acme.c", "n_1");
        for (n, loc) in locs.iter().enumerate() {
            fx.indexes
                .insert(
                    "acme.c",
                    "n_1",
                    &[IndexKey::single(Value::Int(n as i64))],
                    *loc,
                )
                .unwrap();
        }

        let bounds = vec![(
            IndexKey::single(Value::MinKey),
            IndexKey::single(Value::MaxKey),
        )];
        let mut cursor = {
            let ctx = fx.ctx();
            let mut c = IndexCursor::new(
                &ctx,
                "acme.c",
                "n_1",
                doc! { "n" => 1 },
                false,
                bounds,
                true,
                false,
            );
            c.advance(&ctx).unwrap();
            c.note_location();
            c
        };

        // a writer sneaks in a new entry while the cursor is yielded
        let new_loc = fx.insert(99);
        fx.indexes
            .insert("acme.c", "n_1", &[IndexKey::single(Value::Int(99))], new_loc)
            .unwrap();

        let ctx = fx.ctx();
        cursor.check_location(&ctx).unwrap();
        assert_eq!(drain(&mut cursor, &ctx), vec![1, 2, 3, 99]);
    }
}
