//! The persistent per-collection metadata record and its overflow extension.
//!
//! `NsRecord` is the fixed 496-byte value half of a catalog hash node. It is
//! only ever manipulated in place inside the mapped `.ns` file; every
//! multi-byte field is a little-endian zerocopy wrapper so the struct can be
//! reinterpreted from raw mapping bytes on any platform.
//!
//! Collections with more than ten indexes chain one or two `NsExtra`
//! records, each contributing thirty more descriptor slots. The chain is
//! expressed as byte offsets *relative to the owning `NsRecord`* within the
//! mapping; resolving them therefore lives on the catalog, which can see the
//! whole file. After a rename the offsets are stale and must be rebuilt
//! (`NamespaceCatalog::copying_from`).

use zerocopy::little_endian::{F64, I32, I64, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::DiskLoc;

/// Number of free-list size buckets.
pub const BUCKETS: usize = 19;
/// Inline index descriptor slots in the base record.
pub const N_INDEXES_BASE: usize = 10;
/// Descriptor slots per overflow record.
pub const N_INDEXES_EXTRA: usize = 30;
/// Logical cap on indexes per collection (bounded by the multikey bitmap).
pub const N_INDEXES_MAX: usize = 64;

const _: () = assert!(N_INDEXES_MAX <= N_INDEXES_BASE + 2 * N_INDEXES_EXTRA);
const _: () = assert!(N_INDEXES_MAX <= 64);

pub const NS_RECORD_SIZE: usize = 496;

/// One index descriptor: the root of the index tree (reserved) and the
/// location of the index spec document.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct IndexSlot {
    pub head: DiskLoc,
    pub info: DiskLoc,
}

impl IndexSlot {
    pub const EMPTY: IndexSlot = IndexSlot {
        head: DiskLoc::NULL,
        info: DiskLoc::NULL,
    };

    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }
}

/// Namespace flag bits.
pub const FLAG_HAVE_ID_INDEX: i32 = 1 << 0;
pub const FLAG_CAPPED_DISALLOW_DELETE: i32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NsRecord {
    first_extent: DiskLoc,
    last_extent: DiskLoc,
    /// Free-list heads, one per size bucket. Capped collections repurpose
    /// slot 0 (all deleted records) and slot 1 (last record of the extent
    /// preceding `cap_extent`; invalid until first computed).
    deleted_list: [DiskLoc; BUCKETS],
    data_size: I64,
    n_records: I64,
    last_extent_size: I32,
    n_indexes: I32,
    indexes: [IndexSlot; N_INDEXES_BASE],
    capped: I32,
    max_docs: I32,
    padding_factor: F64,
    flags: I32,
    cap_extent: DiskLoc,
    cap_first_new_record: DiskLoc,
    data_file_version: U16,
    index_file_version: U16,
    multikey_index_bits: U64,
    reserved_a: U64,
    /// Byte offset of the first overflow record relative to this record's
    /// own position in the mapping; 0 when there is none.
    extra_offset: I64,
    background_index_build_in_progress: I32,
    reserved: [u8; 76],
}

const _: () = assert!(std::mem::size_of::<NsRecord>() == NS_RECORD_SIZE);

impl NsRecord {
    /// A zeroed record with null locations, ready for [`NsRecord::init`].
    /// In-file records are reinterpreted from mapping bytes; this exists
    /// for callers that stage a record off-mapping first.
    pub fn empty() -> Self {
        Self::new_bytes()
    }

    /// Resets the record for a fresh collection whose first extent is at
    /// `loc`.
    pub fn init(&mut self, loc: DiskLoc, capped: bool) {
        *self = Self::new_bytes();
        self.first_extent = loc;
        self.last_extent = loc;
        self.cap_extent = loc;
        self.padding_factor = F64::new(1.0);
        self.capped = I32::new(capped as i32);
        if capped {
            self.cap_first_new_record = DiskLoc::INVALID;
            self.deleted_list[1] = DiskLoc::INVALID;
        }
    }

    fn new_bytes() -> Self {
        let mut rec = Self::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        for slot in rec.deleted_list.iter_mut() {
            *slot = DiskLoc::NULL;
        }
        for idx in rec.indexes.iter_mut() {
            idx.clear();
        }
        rec.first_extent = DiskLoc::NULL;
        rec.last_extent = DiskLoc::NULL;
        rec.cap_extent = DiskLoc::NULL;
        rec.cap_first_new_record = DiskLoc::NULL;
        rec
    }

    le_accessors! {
        data_size: i64,
        n_records: i64,
        last_extent_size: i32,
        n_indexes: i32,
        capped: i32,
        max_docs: i32,
        padding_factor: f64,
        flags: i32,
        data_file_version: u16,
        index_file_version: u16,
        multikey_index_bits: u64,
        extra_offset: i64,
        background_index_build_in_progress: i32,
    }

    pub fn first_extent(&self) -> DiskLoc {
        self.first_extent
    }

    pub fn set_first_extent(&mut self, loc: DiskLoc) {
        self.first_extent = loc;
    }

    pub fn last_extent(&self) -> DiskLoc {
        self.last_extent
    }

    pub fn set_last_extent(&mut self, loc: DiskLoc) {
        self.last_extent = loc;
    }

    pub fn deleted_list(&self, bucket: usize) -> DiskLoc {
        self.deleted_list[bucket]
    }

    pub fn set_deleted_list(&mut self, bucket: usize, loc: DiskLoc) {
        self.deleted_list[bucket] = loc;
    }

    pub fn cap_extent(&self) -> DiskLoc {
        self.cap_extent
    }

    pub fn set_cap_extent(&mut self, loc: DiskLoc) {
        self.cap_extent = loc;
    }

    pub fn cap_first_new_record(&self) -> DiskLoc {
        self.cap_first_new_record
    }

    pub fn set_cap_first_new_record(&mut self, loc: DiskLoc) {
        self.cap_first_new_record = loc;
    }

    pub fn is_capped(&self) -> bool {
        self.capped.get() != 0
    }

    /// A capped collection has looped once its first-new-record marker has
    /// been computed.
    pub fn cap_looped(&self) -> bool {
        self.is_capped() && self.cap_first_new_record.is_valid()
    }

    pub fn inline_idx(&self, i: usize) -> &IndexSlot {
        &self.indexes[i]
    }

    pub fn inline_idx_mut(&mut self, i: usize) -> &mut IndexSlot {
        &mut self.indexes[i]
    }

    /// Indexes visible to insert paths: built ones plus an in-progress
    /// background build, which occupies slot `n_indexes` until it completes.
    pub fn n_indexes_being_built(&self) -> i32 {
        self.n_indexes.get() + self.background_index_build_in_progress.get()
    }

    pub fn have_id_index(&self) -> bool {
        self.flags.get() & FLAG_HAVE_ID_INDEX != 0
    }

    pub fn set_have_id_index(&mut self) {
        self.flags = I32::new(self.flags.get() | FLAG_HAVE_ID_INDEX);
    }

    pub fn about_to_delete_an_index(&mut self) {
        self.flags = I32::new(self.flags.get() & !FLAG_HAVE_ID_INDEX);
    }

    pub fn capped_disallow_delete(&mut self) {
        self.flags = I32::new(self.flags.get() | FLAG_CAPPED_DISALLOW_DELETE);
    }

    pub fn capped_allow_delete(&mut self) {
        self.flags = I32::new(self.flags.get() & !FLAG_CAPPED_DISALLOW_DELETE);
    }

    pub fn capped_may_delete(&self) -> bool {
        self.flags.get() & FLAG_CAPPED_DISALLOW_DELETE == 0
    }

    pub fn is_multikey(&self, i: usize) -> bool {
        debug_assert!(i < N_INDEXES_MAX);
        self.multikey_index_bits.get() & (1u64 << i) != 0
    }

    pub fn set_index_is_multikey(&mut self, i: usize) {
        debug_assert!(i < N_INDEXES_MAX);
        self.multikey_index_bits = U64::new(self.multikey_index_bits.get() | (1u64 << i));
    }

    /// Only legal when the index at `i` is being dropped.
    pub fn clear_index_is_multikey(&mut self, i: usize) {
        debug_assert!(i < N_INDEXES_MAX);
        self.multikey_index_bits = U64::new(self.multikey_index_bits.get() & !(1u64 << i));
    }

    pub fn padding_fits(&mut self) {
        let x = self.padding_factor.get() - 0.01;
        if x >= 1.0 {
            self.padding_factor = F64::new(x);
        }
    }

    pub fn padding_too_small(&mut self) {
        let x = self.padding_factor.get() + 0.6;
        if x <= 2.0 {
            self.padding_factor = F64::new(x);
        }
    }

    pub fn stats_add(&mut self, records: i64, bytes: i64) {
        self.n_records = I64::new(self.n_records.get() + records);
        self.data_size = I64::new(self.data_size.get() + bytes);
    }
}

/// Overflow record: thirty more descriptor slots and a link to the next
/// overflow, expressed relative to the *owning namespace record*.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NsExtra {
    next: I64,
    slots: [IndexSlot; N_INDEXES_EXTRA],
    reserved2: U64,
}

const _: () = assert!(std::mem::size_of::<NsExtra>() == NS_RECORD_SIZE);

impl NsExtra {
    pub fn init(&mut self) {
        self.next = I64::new(0);
        for slot in self.slots.iter_mut() {
            slot.clear();
        }
        self.reserved2 = U64::new(0);
    }

    le_accessors! {
        next: i64,
    }

    pub fn slot(&self, i: usize) -> &IndexSlot {
        &self.slots[i]
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut IndexSlot {
        &mut self.slots[i]
    }

    /// Copies descriptor slots from `src`, dropping its chain link (the
    /// copy's link is re-established against the new owner).
    pub fn copy_slots_from(&mut self, src: &NsExtra) {
        self.slots = src.slots;
        self.next = I64::new(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_extra_are_496_bytes() {
        assert_eq!(std::mem::size_of::<NsRecord>(), 496);
        assert_eq!(std::mem::size_of::<NsExtra>(), 496);
        assert_eq!(std::mem::size_of::<IndexSlot>(), 16);
    }

    fn fresh(capped: bool) -> NsRecord {
        let mut rec = NsRecord::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        rec.init(DiskLoc::new(0, 128), capped);
        rec
    }

    #[test]
    fn init_resets_free_lists_and_padding() {
        let rec = fresh(false);
        assert_eq!(rec.first_extent(), DiskLoc::new(0, 128));
        assert_eq!(rec.last_extent(), DiskLoc::new(0, 128));
        assert_eq!(rec.padding_factor(), 1.0);
        assert_eq!(rec.n_indexes(), 0);
        assert!(!rec.is_capped());
        for b in 0..BUCKETS {
            assert!(rec.deleted_list(b).is_null());
        }
    }

    #[test]
    fn capped_init_marks_unlooped_state() {
        let rec = fresh(true);
        assert!(rec.is_capped());
        assert!(!rec.cap_looped());
        assert!(!rec.cap_first_new_record().is_valid());
        assert!(!rec.deleted_list(1).is_valid());
    }

    #[test]
    fn padding_factor_is_clamped() {
        let mut rec = fresh(false);

        for _ in 0..200 {
            rec.padding_fits();
        }
        assert_eq!(rec.padding_factor(), 1.0);

        rec.padding_too_small();
        assert!((rec.padding_factor() - 1.6).abs() < 1e-9);
        rec.padding_too_small();
        // 1.6 + 0.6 would exceed the ceiling; unchanged
        assert!((rec.padding_factor() - 1.6).abs() < 1e-9);

        for _ in 0..30 {
            rec.padding_fits();
        }
        assert!((rec.padding_factor() - 1.3).abs() < 1e-9);
    }

    #[test]
    fn multikey_bits_are_per_slot() {
        let mut rec = fresh(false);
        rec.set_index_is_multikey(0);
        rec.set_index_is_multikey(63);

        assert!(rec.is_multikey(0));
        assert!(rec.is_multikey(63));
        assert!(!rec.is_multikey(5));

        rec.clear_index_is_multikey(0);
        assert!(!rec.is_multikey(0));
        assert_eq!(rec.multikey_index_bits().count_ones(), 1);
    }

    #[test]
    fn flags_cover_id_index_and_capped_delete() {
        let mut rec = fresh(true);
        assert!(!rec.have_id_index());
        assert!(rec.capped_may_delete());

        rec.set_have_id_index();
        rec.capped_disallow_delete();
        assert!(rec.have_id_index());
        assert!(!rec.capped_may_delete());

        rec.about_to_delete_an_index();
        assert!(!rec.have_id_index());
        // the capped flag is untouched
        assert!(!rec.capped_may_delete());
        rec.capped_allow_delete();
        assert!(rec.capped_may_delete());
    }

    #[test]
    fn background_build_extends_visible_count() {
        let mut rec = fresh(false);
        rec.set_n_indexes(3);
        assert_eq!(rec.n_indexes_being_built(), 3);
        rec.set_background_index_build_in_progress(1);
        assert_eq!(rec.n_indexes_being_built(), 4);
    }

    #[test]
    fn extra_copy_drops_the_chain_link() {
        let mut a = NsExtra::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        a.init();
        a.set_next(9920);
        a.slot_mut(3).info = DiskLoc::new(0, 777);

        let mut b = NsExtra::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        b.init();
        b.copy_slots_from(&a);

        assert_eq!(b.next(), 0);
        assert_eq!(b.slot(3).info, DiskLoc::new(0, 777));
    }
}
