//! Record allocation: bucketed free lists, capped-collection ring policy,
//! and adaptive padding.
//!
//! The allocator mutates two disjoint structures: the namespace record
//! (free-list heads, stats, ring cursor) living in the catalog mapping, and
//! the extents/records living in the data files. Both are passed in
//! explicitly, so the borrow checker keeps catalog and data file access
//! untangled.
//!
//! ## Non-capped allocation
//!
//! Deleted records hang off 19 size-bucket heads, LIFO. Allocation probes
//! the matching bucket upward with a bounded better-fit lookahead, splits
//! oversized regions, and grows the collection by one extent when nothing
//! fits. Adjacent free runs are merged by [`Allocator::compact`], invoked
//! periodically rather than on every free.
//!
//! ## Capped allocation
//!
//! A capped collection treats its extents as a ring. `deleted_list[0]`
//! chains every free region in ring order; `deleted_list[1]` remembers the
//! last free region of the extent preceding `cap_extent` (a scan shortcut).
//! The first pass through the ring consumes seeded extents without deleting;
//! once wrapped, the oldest records of `cap_extent` are deleted to make
//! room. Capped extents are allocated contiguously at creation, so ring
//! order coincides with disk order and a sort-and-merge compact preserves
//! the ring.

use eyre::{bail, ensure, Result};
use tracing::{debug, warn};

use crate::catalog::NsRecord;
use crate::config::MAX_EXTENT_SIZE;
use crate::document::encoded_len;
use crate::error::ErrorKind;
use crate::interrupt::InterruptToken;
use crate::storage::{DataFiles, DiskLoc, EXTENT_HEADER_SIZE, NULL_OFS};

/// Monotone size-class table for the deleted-record buckets.
pub const BUCKET_SIZES: [i32; 19] = [
    32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 0x4000, 0x8000, 0x10000, 0x20000, 0x40000,
    0x80000, 0x100000, 0x200000, 0x400000, 0x800000,
];

pub const MAX_BUCKET: usize = 18;

/// Smallest remainder worth splitting off as its own deleted record.
const MIN_SPLIT_SLACK: i32 = 24;

/// Bound on the looped-ring delete/retry cycle; exceeding it means the
/// collection cannot hold even one record of the requested size.
const MAX_CAP_PASSES: usize = 5000;

/// Bucket for an object of size `n`: the first class strictly larger.
pub fn bucket(n: i32) -> usize {
    for (i, &size) in BUCKET_SIZES.iter().enumerate() {
        if size > n {
            return i;
        }
    }
    MAX_BUCKET
}

/// Rounds an allocation up to its bucket boundary so freed records re-enter
/// the same size class they were carved for. Sizes beyond the table are
/// 4-byte aligned only.
pub fn quantize_alloc_space(n: i32) -> i32 {
    for &size in BUCKET_SIZES.iter() {
        if size >= n {
            return size;
        }
    }
    (n + 3) & !3
}

/// Where an unlink found the record: a bucket head or a predecessor record.
#[derive(Clone, Copy)]
enum FreePrev {
    Bucket(usize),
    Rec(DiskLoc),
}

pub struct Allocator<'a> {
    files: &'a mut DataFiles,
    token: &'a InterruptToken,
    initial_extent_size: usize,
}

impl<'a> Allocator<'a> {
    pub fn new(
        files: &'a mut DataFiles,
        token: &'a InterruptToken,
        initial_extent_size: usize,
    ) -> Self {
        Self {
            files,
            token,
            initial_extent_size,
        }
    }

    /// Allocates a record of at least `len_requested` bytes (header
    /// included), applying the collection's padding factor. On return the
    /// record header is initialized and linked into its extent's chain; the
    /// caller writes the payload and bumps the stats.
    ///
    /// `purge` is invoked with the location and payload of every document
    /// evicted by the capped ring so the caller can unindex it.
    pub fn alloc(
        &mut self,
        ns: &str,
        rec: &mut NsRecord,
        len_requested: i32,
        purge: &mut dyn FnMut(DiskLoc, &[u8]) -> Result<()>,
    ) -> Result<(DiskLoc, DiskLoc)> {
        self.token.check()?;
        ensure!(len_requested > 0, "allocation length must be positive");

        let padded = (len_requested as f64 * rec.padding_factor()) as i32;
        let len = quantize_alloc_space((padded + 3) & !3);

        let (loc, grew) = if rec.is_capped() {
            (self.cap_alloc(ns, rec, len, purge)?, false)
        } else {
            match self.std_alloc(rec, len)? {
                loc if !loc.is_null() => (loc, false),
                _ => {
                    self.grow_collection(ns, rec, len)?;
                    let loc = self.std_alloc(rec, len)?;
                    if loc.is_null() {
                        warn!(ns, len, "allocation failed after extent growth");
                        return Err(eyre::Report::new(ErrorKind::ExtentAllocFailed {
                            ns: ns.to_string(),
                            requested: len as usize,
                        }));
                    }
                    (loc, true)
                }
            }
        };

        let (region_len, extent_ofs) = {
            let d = self.files.deleted(loc)?;
            (d.len_with_headers(), d.extent_ofs())
        };
        let left = region_len - len;

        // grab from the front; split the tail off for further use when the
        // remainder is worth tracking
        let split = left >= MIN_SPLIT_SLACK && (rec.is_capped() || left >= (len >> 3));
        if split {
            let tail = loc.plus(len);
            self.files.deleted_mut(tail)?.init(left, extent_ofs);
            self.add_deleted_rec(rec, tail)?;
        } else if !grew && !rec.is_capped() {
            rec.padding_fits();
        }
        let final_len = if split { len } else { region_len };

        let extent_loc = loc.with_ofs(extent_ofs);
        self.files.record_header_mut(loc)?.init(final_len, extent_ofs);
        self.link_record(loc, extent_loc)?;

        if rec.is_capped() && rec.cap_first_new_record().is_valid()
            && rec.cap_first_new_record().is_null()
        {
            rec.set_cap_first_new_record(loc);
        }

        Ok((loc, extent_loc))
    }

    /// Unlinks a live record, returns its payload, and pushes the region
    /// onto the free lists. Stats are adjusted by the document's encoded
    /// length.
    pub fn delete_record(&mut self, rec: &mut NsRecord, loc: DiskLoc) -> Result<Vec<u8>> {
        let data = self.files.record_data(loc)?.to_vec();
        let doc_len = encoded_len(&data).unwrap_or(data.len());

        let header = *self.files.record_header(loc)?;
        let extent_loc = header.extent_loc(loc);

        // splice out of the extent's record chain
        if header.prev_ofs() != NULL_OFS {
            self.files
                .record_header_mut(loc.with_ofs(header.prev_ofs()))?
                .set_next_ofs(header.next_ofs());
        } else {
            let first = if header.next_ofs() == NULL_OFS {
                DiskLoc::NULL
            } else {
                loc.with_ofs(header.next_ofs())
            };
            self.files.extent_mut(extent_loc)?.set_first_record(first);
        }
        if header.next_ofs() != NULL_OFS {
            self.files
                .record_header_mut(loc.with_ofs(header.next_ofs()))?
                .set_prev_ofs(header.prev_ofs());
        } else {
            let last = if header.prev_ofs() == NULL_OFS {
                DiskLoc::NULL
            } else {
                loc.with_ofs(header.prev_ofs())
            };
            self.files.extent_mut(extent_loc)?.set_last_record(last);
        }

        self.files
            .deleted_mut(loc)?
            .init(header.len_with_headers(), extent_loc.ofs());
        self.add_deleted_rec(rec, loc)?;
        rec.stats_add(-1, -(doc_len as i64));
        Ok(data)
    }

    /// Adds a freed region to the deleted chains: LIFO at its bucket head,
    /// or appended in ring order for capped collections.
    pub fn add_deleted_rec(&mut self, rec: &mut NsRecord, loc: DiskLoc) -> Result<()> {
        if rec.is_capped() {
            self.files.deleted_mut(loc)?.set_next_deleted(DiskLoc::NULL);
            let head = rec.deleted_list(0);
            if head.is_null() {
                rec.set_deleted_list(0, loc);
            } else {
                let mut i = head;
                loop {
                    let next = self.files.deleted(i)?.next_deleted();
                    if next.is_null() {
                        break;
                    }
                    i = next;
                }
                self.files.deleted_mut(i)?.set_next_deleted(loc);
            }
        } else {
            let len = self.files.deleted(loc)?.len_with_headers();
            let b = bucket(len);
            let old_head = rec.deleted_list(b);
            rec.set_deleted_list(b, loc);
            self.files.deleted_mut(loc)?.set_next_deleted(old_head);
        }
        Ok(())
    }

    /// Best-fit probe through the bucket chains. Returns null when nothing
    /// fits; never grows.
    fn std_alloc(&mut self, rec: &mut NsRecord, len: i32) -> Result<DiskLoc> {
        let mut b = bucket(len);
        let mut cur = rec.deleted_list(b);
        let mut prev = FreePrev::Bucket(b);
        let mut best: Option<(DiskLoc, FreePrev, i32)> = None;
        // look a little further for a tighter fit once one is found
        let mut extra = 5;
        let mut chain = 0;

        loop {
            if cur.is_null() {
                if best.is_some() {
                    break;
                }
                b += 1;
                if b > MAX_BUCKET {
                    return Ok(DiskLoc::NULL);
                }
                cur = rec.deleted_list(b);
                prev = FreePrev::Bucket(b);
                continue;
            }
            ensure!(
                cur.a() >= 0 && cur.a() < 100_000,
                "corrupted free-list pointer {:?}",
                cur
            );
            let d = self.files.deleted(cur)?;
            let dlen = d.len_with_headers();
            let next = d.next_deleted();

            if dlen >= len && best.map_or(true, |(_, _, bl)| dlen < bl) {
                best = Some((cur, prev, dlen));
            }
            if best.is_some() {
                extra -= 1;
                if extra <= 0 {
                    break;
                }
            }
            chain += 1;
            if chain > 30 && b < MAX_BUCKET {
                // chain too long; force on to the next bucket for a big chunk
                chain = 0;
                cur = DiskLoc::NULL;
            } else {
                prev = FreePrev::Rec(cur);
                cur = next;
            }
        }

        let Some((loc, prev, _)) = best else {
            return Ok(DiskLoc::NULL);
        };
        self.unlink_free(rec, loc, prev)
    }

    fn unlink_free(&mut self, rec: &mut NsRecord, loc: DiskLoc, prev: FreePrev) -> Result<DiskLoc> {
        let next = self.files.deleted(loc)?.next_deleted();
        match prev {
            FreePrev::Bucket(i) => rec.set_deleted_list(i, next),
            FreePrev::Rec(p) => self.files.deleted_mut(p)?.set_next_deleted(next),
        }
        self.files.deleted_mut(loc)?.set_next_deleted(DiskLoc::NULL);
        Ok(loc)
    }

    /// Allocates, links, and seeds one more extent for a non-capped
    /// collection. Size follows the previous extent (×1.2), bounded below
    /// by the request and above by the maximum extent size.
    fn grow_collection(&mut self, ns: &str, rec: &mut NsRecord, min_len: i32) -> Result<()> {
        let needed = min_len as usize + EXTENT_HEADER_SIZE;
        let mut size = match rec.last_extent_size() {
            0 => self.initial_extent_size,
            prev => (prev as f64 * 1.2) as usize,
        };
        size = size.clamp(needed, MAX_EXTENT_SIZE.max(needed));
        if needed > MAX_EXTENT_SIZE {
            return Err(eyre::Report::new(ErrorKind::ExtentAllocFailed {
                ns: ns.to_string(),
                requested: needed,
            }));
        }
        let size = size.next_multiple_of(4);
        debug!(ns, size, "growing collection by one extent");

        let ext_loc = self.alloc_linked_extent(rec, size)?;
        let seed = self.files.extent(ext_loc)?.data_start();
        let capacity = self.files.extent(ext_loc)?.capacity();
        self.files.deleted_mut(seed)?.init(capacity, ext_loc.ofs());
        self.add_deleted_rec(rec, seed)
    }

    /// Carves one extent and links it at the tail of the collection's
    /// extent chain. Used both by growth and by capped preallocation.
    pub fn alloc_linked_extent(&mut self, rec: &mut NsRecord, size: usize) -> Result<DiskLoc> {
        let ext_loc = self.files.alloc_extent(size)?;
        let old_last = rec.last_extent();
        if old_last.is_null() {
            rec.set_first_extent(ext_loc);
            rec.set_last_extent(ext_loc);
            if rec.is_capped() {
                rec.set_cap_extent(ext_loc);
            }
        } else {
            self.files.extent_mut(old_last)?.set_xnext(ext_loc);
            self.files.extent_mut(ext_loc)?.set_xprev(old_last);
            rec.set_last_extent(ext_loc);
        }
        rec.set_last_extent_size(size as i32);
        Ok(ext_loc)
    }

    /// Seeds a freshly created extent's whole capacity as one deleted
    /// record.
    pub fn seed_extent(&mut self, rec: &mut NsRecord, ext_loc: DiskLoc) -> Result<()> {
        let seed = self.files.extent(ext_loc)?.data_start();
        let capacity = self.files.extent(ext_loc)?.capacity();
        self.files.deleted_mut(seed)?.init(capacity, ext_loc.ofs());
        self.add_deleted_rec(rec, seed)
    }

    /// Capped allocation: consume `cap_extent`'s free space, deleting the
    /// oldest records (or advancing the ring) until the request fits.
    fn cap_alloc(
        &mut self,
        ns: &str,
        rec: &mut NsRecord,
        len: i32,
        purge: &mut dyn FnMut(DiskLoc, &[u8]) -> Result<()>,
    ) -> Result<DiskLoc> {
        ensure!(len < 0x1800_0000, "capped record too large: {}", len);

        let mut passes = 0usize;
        loop {
            self.token.check()?;

            let over_max =
                rec.max_docs() > 0 && rec.n_records() >= rec.max_docs() as i64;
            if !over_max {
                let loc = self.cap_pick_free(rec, len)?;
                if !loc.is_null() {
                    return Ok(loc);
                }
            }

            if !rec.cap_first_new_record().is_valid() {
                // first pass through the ring: no deleting yet
                self.advance_cap_extent(rec)?;
                if rec.cap_extent() == rec.first_extent() {
                    // wrapped; from here on the ring overwrites itself
                    rec.set_cap_first_new_record(DiskLoc::NULL);
                }
                continue;
            }

            if !rec.capped_may_delete() {
                return Err(eyre::Report::new(ErrorKind::CappedFull));
            }

            let oldest = self.files.extent(rec.cap_extent())?.first_record();
            if oldest.is_null() || oldest == rec.cap_first_new_record() {
                // extent empty, or holding only records from the current
                // pass; eating those would clobber fresh data
                self.advance_cap_extent(rec)?;
            } else {
                let data = self.delete_record(rec, oldest)?;
                purge(oldest, &data)?;
                self.compact(rec)?;
            }

            passes += 1;
            if passes >= MAX_CAP_PASSES {
                warn!(ns, len, "capped allocator could not make room");
                bail!(
                    "capped collection {} cannot accommodate a {} byte record",
                    ns,
                    len
                );
            }
        }
    }

    /// Free region inside `cap_extent` large enough to hold `len` plus a
    /// residual deleted record (each capped extent keeps at least one free
    /// region so the ring never loses track of its tail).
    fn cap_pick_free(&mut self, rec: &mut NsRecord, len: i32) -> Result<DiskLoc> {
        let (mut prev, mut cur) = self.first_deleted_in_cap_extent(rec)?;

        while !cur.is_null() && self.files.in_extent(cur, rec.cap_extent())? {
            let d = self.files.deleted(cur)?;
            if d.len_with_headers() >= len + MIN_SPLIT_SLACK {
                let p = match prev {
                    Some(p) => FreePrev::Rec(p),
                    None => FreePrev::Bucket(0),
                };
                return self.unlink_free(rec, cur, p);
            }
            prev = Some(cur);
            cur = d.next_deleted();
        }
        Ok(DiskLoc::NULL)
    }

    /// First chain entry inside `cap_extent`, with its predecessor for
    /// unlinking. `deleted_list[1]` short-circuits the scan when it still
    /// points just before the cap extent's entries; otherwise the chain is
    /// scanned from its head.
    fn first_deleted_in_cap_extent(
        &self,
        rec: &NsRecord,
    ) -> Result<(Option<DiskLoc>, DiskLoc)> {
        let marker = rec.deleted_list(1);
        let (mut prev, mut i) = if marker.is_valid() && !marker.is_null() {
            (Some(marker), self.files.deleted(marker)?.next_deleted())
        } else {
            (None, rec.deleted_list(0))
        };
        while !i.is_null() && !self.files.in_extent(i, rec.cap_extent())? {
            prev = Some(i);
            i = self.files.deleted(i)?.next_deleted();
        }
        Ok((prev, i))
    }

    /// Moves `cap_extent` one step around the ring, recomputing the
    /// previous-extent marker and conservatively resetting the
    /// first-new-record cursor for the new extent.
    pub fn advance_cap_extent(&mut self, rec: &mut NsRecord) -> Result<()> {
        // marker: last free region belonging to an extent before the new
        // cap extent; null when the new cap extent is the first
        if rec.cap_extent() == rec.last_extent() {
            rec.set_deleted_list(1, DiskLoc::NULL);
        } else {
            let mut i = rec.deleted_list(0);
            let mut last_before = DiskLoc::NULL;
            while !i.is_null() {
                if self.files.in_extent(i, rec.cap_extent())? {
                    last_before = i;
                }
                i = self.files.deleted(i)?.next_deleted();
            }
            rec.set_deleted_list(1, last_before);
        }

        let next = self.files.extent(rec.cap_extent())?.xnext();
        let new_cap = if next.is_null() {
            rec.first_extent()
        } else {
            next
        };
        rec.set_cap_extent(new_cap);

        if rec.cap_first_new_record().is_valid() {
            // looped ring: no record inserted into the new extent yet
            rec.set_cap_first_new_record(DiskLoc::NULL);
        }
        Ok(())
    }

    /// Merges adjacent free runs. Rebuilds the deleted chains from a sorted
    /// sweep: ring order for capped collections (which equals disk order),
    /// bucket LIFO otherwise.
    pub fn compact(&mut self, rec: &mut NsRecord) -> Result<()> {
        let mut free: Vec<DiskLoc> = Vec::new();
        if rec.is_capped() {
            let mut i = rec.deleted_list(0);
            while !i.is_null() {
                free.push(i);
                i = self.files.deleted(i)?.next_deleted();
            }
            rec.set_deleted_list(0, DiskLoc::NULL);
            rec.set_deleted_list(1, DiskLoc::NULL);
        } else {
            for b in 0..BUCKET_SIZES.len() {
                let mut i = rec.deleted_list(b);
                while !i.is_null() {
                    free.push(i);
                    i = self.files.deleted(i)?.next_deleted();
                }
                rec.set_deleted_list(b, DiskLoc::NULL);
            }
        }
        if free.is_empty() {
            return Ok(());
        }

        free.sort_by_key(|l| (l.a(), l.ofs()));
        let mut merged: Vec<DiskLoc> = Vec::with_capacity(free.len());
        let mut run = free[0];
        for &next in &free[1..] {
            let run_len = self.files.deleted(run)?.len_with_headers();
            let same_extent = self.files.deleted(run)?.extent_ofs()
                == self.files.deleted(next)?.extent_ofs();
            if next.a() == run.a() && run.ofs() + run_len == next.ofs() && same_extent {
                let next_len = self.files.deleted(next)?.len_with_headers();
                let ext = self.files.deleted(run)?.extent_ofs();
                self.files.deleted_mut(run)?.init(run_len + next_len, ext);
            } else {
                merged.push(run);
                run = next;
            }
        }
        merged.push(run);

        for loc in merged {
            self.add_deleted_rec(rec, loc)?;
        }
        Ok(())
    }

    fn link_record(&mut self, loc: DiskLoc, extent_loc: DiskLoc) -> Result<()> {
        let last = self.files.extent(extent_loc)?.last_record();
        if last.is_null() {
            let ext = self.files.extent_mut(extent_loc)?;
            ext.set_first_record(loc);
            ext.set_last_record(loc);
        } else {
            self.files.record_header_mut(last)?.set_next_ofs(loc.ofs());
            self.files.record_header_mut(loc)?.set_prev_ofs(last.ofs());
            self.files.extent_mut(extent_loc)?.set_last_record(loc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NS_RECORD_SIZE;
    use zerocopy::FromBytes;

    #[test]
    fn bucket_boundaries_are_strict() {
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(31), 0);
        assert_eq!(bucket(32), 1);
        assert_eq!(bucket(100), 2);
        assert_eq!(bucket(0x7f_ffff), 18);
        assert_eq!(bucket(0x80_0000), 18);
        assert_eq!(bucket(i32::MAX), 18);
    }

    #[test]
    fn bucket_table_is_monotone() {
        for w in BUCKET_SIZES.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert_eq!(BUCKET_SIZES.len(), 19);
    }

    #[test]
    fn quantize_rounds_up_to_bucket_boundary() {
        assert_eq!(quantize_alloc_space(16), 32);
        assert_eq!(quantize_alloc_space(32), 32);
        assert_eq!(quantize_alloc_space(33), 64);
        assert_eq!(quantize_alloc_space(116), 128);
        assert_eq!(quantize_alloc_space(0x80_0001), 0x80_0004);
    }

    fn setup() -> (DataFiles, InterruptToken, NsRecord) {
        let dir = tempfile::tempdir().unwrap().keep();
        let files = DataFiles::open(&dir, "acme", 256 * 1024).unwrap();
        let rec = NsRecord::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        (files, InterruptToken::new(), rec)
    }

    fn no_purge() -> impl FnMut(DiskLoc, &[u8]) -> Result<()> {
        |_, _| Ok(())
    }

    #[test]
    fn first_alloc_grows_and_splits_the_seed() {
        let (mut files, token, mut rec) = setup();
        rec.init(DiskLoc::NULL, false);
        let mut alloc = Allocator::new(&mut files, &token, 8192);

        let (loc, ext_loc) = alloc
            .alloc("acme.orders", &mut rec, 116, &mut no_purge())
            .unwrap();

        assert!(!loc.is_null());
        assert_eq!(rec.last_extent_size(), 8192);
        assert_eq!(rec.first_extent(), ext_loc);
        // 116 quantizes to 128
        assert_eq!(files.record_header(loc).unwrap().len_with_headers(), 128);
        // remainder of the seeded extent is back on a free list
        let remainder_len = 8192 - EXTENT_HEADER_SIZE as i32 - 128;
        let b = bucket(remainder_len);
        assert!(!rec.deleted_list(b).is_null());
        // seeding + splitting leave the padding factor alone
        assert_eq!(rec.padding_factor(), 1.0);
    }

    #[test]
    fn freed_record_is_reused_lifo() {
        let (mut files, token, mut rec) = setup();
        rec.init(DiskLoc::NULL, false);
        let mut alloc = Allocator::new(&mut files, &token, 8192);

        let (a, _) = alloc
            .alloc("acme.orders", &mut rec, 100, &mut no_purge())
            .unwrap();
        let (_b, _) = alloc
            .alloc("acme.orders", &mut rec, 100, &mut no_purge())
            .unwrap();
        rec.stats_add(2, 200);

        alloc.delete_record(&mut rec, a).unwrap();
        let (c, _) = alloc
            .alloc("acme.orders", &mut rec, 100, &mut no_purge())
            .unwrap();

        assert_eq!(c, a);
    }

    #[test]
    fn whole_record_reuse_decreases_padding_toward_floor() {
        let (mut files, token, mut rec) = setup();
        rec.init(DiskLoc::NULL, false);
        let mut alloc = Allocator::new(&mut files, &token, 8192);

        // a freed 128-byte record is reused whole (no split possible)
        let (a, _) = alloc
            .alloc("acme.orders", &mut rec, 120, &mut no_purge())
            .unwrap();
        alloc.delete_record(&mut rec, a).unwrap();
        rec.padding_too_small();
        assert!((rec.padding_factor() - 1.6).abs() < 1e-9);

        // 76 * 1.6 = 121.6 -> 124 aligned -> 128 quantized: exact whole fit
        let (b, _) = alloc
            .alloc("acme.orders", &mut rec, 76, &mut no_purge())
            .unwrap();
        assert_eq!(b, a);
        assert!((rec.padding_factor() - 1.59).abs() < 1e-9);
    }

    #[test]
    fn compact_merges_adjacent_free_runs() {
        let (mut files, token, mut rec) = setup();
        rec.init(DiskLoc::NULL, false);
        let mut alloc = Allocator::new(&mut files, &token, 8192);

        // three adjacent 128-byte records
        let (a, _) = alloc
            .alloc("acme.orders", &mut rec, 116, &mut no_purge())
            .unwrap();
        let (b, _) = alloc
            .alloc("acme.orders", &mut rec, 116, &mut no_purge())
            .unwrap();
        let (c, _) = alloc
            .alloc("acme.orders", &mut rec, 116, &mut no_purge())
            .unwrap();
        assert_eq!(b, a.plus(128));
        assert_eq!(c, b.plus(128));

        rec.stats_add(3, 300);
        alloc.delete_record(&mut rec, a).unwrap();
        alloc.delete_record(&mut rec, b).unwrap();
        alloc.compact(&mut rec).unwrap();

        // a 256-byte run exists where a and b were
        let merged = rec.deleted_list(bucket(256));
        assert_eq!(merged, a);
        assert_eq!(files.deleted(a).unwrap().len_with_headers(), 256);
    }

    fn setup_capped(n_extents: usize, extent_size: usize) -> (DataFiles, InterruptToken, NsRecord) {
        let dir = tempfile::tempdir().unwrap().keep();
        let mut files = DataFiles::open(&dir, "acme", 256 * 1024).unwrap();
        let token = InterruptToken::new();
        let mut rec = NsRecord::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        rec.init(DiskLoc::NULL, true);
        {
            let mut alloc = Allocator::new(&mut files, &token, extent_size);
            for _ in 0..n_extents {
                let ext = alloc.alloc_linked_extent(&mut rec, extent_size).unwrap();
                alloc.seed_extent(&mut rec, ext).unwrap();
            }
        }
        (files, token, rec)
    }

    fn forward_docs(files: &DataFiles, rec: &NsRecord) -> Vec<DiskLoc> {
        let mut out = Vec::new();
        let mut loc = files.first_record(rec.first_extent()).unwrap();
        while !loc.is_null() {
            out.push(loc);
            loc = files.next_record(loc).unwrap();
        }
        out
    }

    #[test]
    fn capped_ring_overwrites_oldest() {
        // room for one 128-byte record (plus residual) per extent
        let extent_size = EXTENT_HEADER_SIZE + 128 + 64;
        let (mut files, token, mut rec) = setup_capped(3, extent_size);
        let mut alloc = Allocator::new(&mut files, &token, extent_size);

        let mut evicted: Vec<DiskLoc> = Vec::new();
        let mut locs = Vec::new();
        for _ in 0..5 {
            let (loc, _) = {
                let mut purge = |l: DiskLoc, _d: &[u8]| {
                    evicted.push(l);
                    Ok(())
                };
                alloc.alloc("acme.events", &mut rec, 116, &mut purge).unwrap()
            };
            rec.stats_add(1, 100);
            locs.push(loc);
        }

        // A and B were overwritten; C, D, E remain (ring-order iteration is
        // the cursor layer's business; here the surviving set is checked)
        assert_eq!(evicted, vec![locs[0], locs[1]]);
        let mut live = forward_docs(&files, &rec);
        live.sort_by_key(|l| (l.a(), l.ofs()));
        let mut expect = vec![locs[2], locs[3], locs[4]];
        expect.sort_by_key(|l| (l.a(), l.ofs()));
        assert_eq!(live, expect);
        assert!(rec.cap_looped());
        assert_eq!(rec.n_records(), 3);
    }

    #[test]
    fn capped_max_docs_evicts_before_insert() {
        let extent_size = EXTENT_HEADER_SIZE + 4 * 192;
        let (mut files, token, mut rec) = setup_capped(2, extent_size);
        rec.set_max_docs(3);
        let mut alloc = Allocator::new(&mut files, &token, extent_size);

        let mut locs = Vec::new();
        for _ in 0..4 {
            let (loc, _) = alloc
                .alloc("acme.events", &mut rec, 116, &mut no_purge())
                .unwrap();
            rec.stats_add(1, 100);
            locs.push(loc);
        }

        assert_eq!(rec.n_records(), 3);
        let live = forward_docs(&files, &rec);
        assert_eq!(live, vec![locs[1], locs[2], locs[3]]);
    }

    #[test]
    fn capped_disallow_delete_fails_with_capped_full() {
        let extent_size = EXTENT_HEADER_SIZE + 128 + 64;
        let (mut files, token, mut rec) = setup_capped(2, extent_size);
        let mut alloc = Allocator::new(&mut files, &token, extent_size);

        // fill the ring so the next insert would need a delete
        for _ in 0..2 {
            alloc
                .alloc("acme.events", &mut rec, 116, &mut no_purge())
                .unwrap();
            rec.stats_add(1, 100);
        }
        rec.capped_disallow_delete();

        let err = alloc
            .alloc("acme.events", &mut rec, 116, &mut no_purge())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::CappedFull)
        ));
    }

    #[test]
    fn capped_total_bytes_never_exceed_extent_capacity() {
        let extent_size = EXTENT_HEADER_SIZE + 512;
        let (mut files, token, mut rec) = setup_capped(3, extent_size);
        let mut alloc = Allocator::new(&mut files, &token, extent_size);

        for _ in 0..40 {
            alloc
                .alloc("acme.events", &mut rec, 116, &mut no_purge())
                .unwrap();
            rec.stats_add(1, 100);
        }

        let mut total = 0i64;
        for loc in forward_docs(&files, &rec) {
            total += files.record_header(loc).unwrap().len_with_headers() as i64;
        }
        assert!(total <= 3 * 512);
    }

    #[test]
    fn interrupted_token_aborts_allocation() {
        let (mut files, token, mut rec) = setup();
        rec.init(DiskLoc::NULL, false);
        token.interrupt();
        let mut alloc = Allocator::new(&mut files, &token, 8192);

        let err = alloc
            .alloc("acme.orders", &mut rec, 100, &mut no_purge())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::Interrupted(_))
        ));
    }
}
