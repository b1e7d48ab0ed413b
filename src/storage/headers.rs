//! On-disk header definitions for data files, extents, and records.
//!
//! All headers are `#[repr(C)]` zerocopy structs with little-endian fields
//! and compile-time size assertions, so they can be read and written in
//! place inside a mapping without serialization code.
//!
//! - **Data file header** (128 bytes): magic, format version, file number,
//!   file length, used length (the bump pointer for extent allocation).
//! - **Extent header** (64 bytes): magic, own location, chain links, length,
//!   first/last record offsets.
//! - **Record header** (16 bytes): allocated length incl. header, offset of
//!   the owning extent, prev/next record offsets within the file.
//! - **Deleted record header** (16 bytes): the same region reinterpreted
//!   once the record is on a free list; the `next_deleted` link replaces the
//!   record chain links.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{DiskLoc, NULL_OFS};

pub const FILE_HEADER_SIZE: usize = 128;
pub const EXTENT_HEADER_SIZE: usize = 64;
pub const RECORD_HEADER_SIZE: usize = 16;

pub const DATA_FILE_MAGIC: &[u8; 16] = b"mangrove data\x00\x00\x00";
pub const EXTENT_MAGIC: u32 = 0x4147_4e4d;
pub const DATA_FILE_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DataFileHeader {
    magic: [u8; 16],
    version: U32,
    file_no: U32,
    file_length: U64,
    used_length: U64,
    reserved: [u8; 88],
}

const _: () = assert!(std::mem::size_of::<DataFileHeader>() == FILE_HEADER_SIZE);

impl DataFileHeader {
    pub fn init(&mut self, file_no: u32, file_length: u64) {
        self.magic = *DATA_FILE_MAGIC;
        self.version = U32::new(DATA_FILE_VERSION);
        self.file_no = U32::new(file_no);
        self.file_length = U64::new(file_length);
        self.used_length = U64::new(FILE_HEADER_SIZE as u64);
        self.reserved = [0u8; 88];
    }

    pub fn check(&self) -> Result<()> {
        ensure!(&self.magic == DATA_FILE_MAGIC, "invalid data file magic");
        ensure!(
            self.version.get() == DATA_FILE_VERSION,
            "unsupported data file version {}",
            self.version.get()
        );
        Ok(())
    }

    le_accessors! {
        version: u32,
        file_no: u32,
        file_length: u64,
        used_length: u64,
    }

    pub fn unused(&self) -> u64 {
        self.file_length.get() - self.used_length.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ExtentHeader {
    magic: U32,
    length: I32,
    my_loc: DiskLoc,
    xnext: DiskLoc,
    xprev: DiskLoc,
    first_record: DiskLoc,
    last_record: DiskLoc,
    reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<ExtentHeader>() == EXTENT_HEADER_SIZE);

impl ExtentHeader {
    pub fn init(&mut self, my_loc: DiskLoc, length: i32) {
        self.magic = U32::new(EXTENT_MAGIC);
        self.length = I32::new(length);
        self.my_loc = my_loc;
        self.xnext = DiskLoc::NULL;
        self.xprev = DiskLoc::NULL;
        self.first_record = DiskLoc::NULL;
        self.last_record = DiskLoc::NULL;
        self.reserved = [0u8; 16];
    }

    pub fn check(&self) -> Result<()> {
        ensure!(
            self.magic.get() == EXTENT_MAGIC,
            "bad extent magic {:#x} at {:?}",
            self.magic.get(),
            self.my_loc
        );
        Ok(())
    }

    le_accessors! {
        length: i32,
    }

    pub fn my_loc(&self) -> DiskLoc {
        self.my_loc
    }

    pub fn xnext(&self) -> DiskLoc {
        self.xnext
    }

    pub fn set_xnext(&mut self, loc: DiskLoc) {
        self.xnext = loc;
    }

    pub fn xprev(&self) -> DiskLoc {
        self.xprev
    }

    pub fn set_xprev(&mut self, loc: DiskLoc) {
        self.xprev = loc;
    }

    pub fn first_record(&self) -> DiskLoc {
        self.first_record
    }

    pub fn set_first_record(&mut self, loc: DiskLoc) {
        self.first_record = loc;
    }

    pub fn last_record(&self) -> DiskLoc {
        self.last_record
    }

    pub fn set_last_record(&mut self, loc: DiskLoc) {
        self.last_record = loc;
    }

    /// Bytes available for records.
    pub fn capacity(&self) -> i32 {
        self.length.get() - EXTENT_HEADER_SIZE as i32
    }

    /// Location of the first byte of record space.
    pub fn data_start(&self) -> DiskLoc {
        self.my_loc.plus(EXTENT_HEADER_SIZE as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.first_record.is_null()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    len_with_headers: I32,
    extent_ofs: I32,
    next_ofs: I32,
    prev_ofs: I32,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

impl RecordHeader {
    pub fn init(&mut self, len_with_headers: i32, extent_ofs: i32) {
        self.len_with_headers = I32::new(len_with_headers);
        self.extent_ofs = I32::new(extent_ofs);
        self.next_ofs = I32::new(NULL_OFS);
        self.prev_ofs = I32::new(NULL_OFS);
    }

    le_accessors! {
        len_with_headers: i32,
        extent_ofs: i32,
        next_ofs: i32,
        prev_ofs: i32,
    }

    pub fn data_len(&self) -> i32 {
        self.len_with_headers.get() - RECORD_HEADER_SIZE as i32
    }

    /// Location of the owning extent, given this record's own location.
    pub fn extent_loc(&self, my_loc: DiskLoc) -> DiskLoc {
        my_loc.with_ofs(self.extent_ofs.get())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeletedRecordHeader {
    len_with_headers: I32,
    extent_ofs: I32,
    next_deleted: DiskLoc,
}

const _: () = assert!(std::mem::size_of::<DeletedRecordHeader>() == RECORD_HEADER_SIZE);

impl DeletedRecordHeader {
    pub fn init(&mut self, len_with_headers: i32, extent_ofs: i32) {
        self.len_with_headers = I32::new(len_with_headers);
        self.extent_ofs = I32::new(extent_ofs);
        self.next_deleted = DiskLoc::NULL;
    }

    le_accessors! {
        len_with_headers: i32,
        extent_ofs: i32,
    }

    pub fn next_deleted(&self) -> DiskLoc {
        self.next_deleted
    }

    pub fn set_next_deleted(&mut self, loc: DiskLoc) {
        self.next_deleted = loc;
    }

    pub fn extent_loc(&self, my_loc: DiskLoc) -> DiskLoc {
        my_loc.with_ofs(self.extent_ofs.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_are_pinned() {
        assert_eq!(std::mem::size_of::<DataFileHeader>(), 128);
        assert_eq!(std::mem::size_of::<ExtentHeader>(), 64);
        assert_eq!(std::mem::size_of::<RecordHeader>(), 16);
        assert_eq!(std::mem::size_of::<DeletedRecordHeader>(), 16);
    }

    #[test]
    fn data_file_header_init_and_check() {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        let header = DataFileHeader::mut_from_bytes(&mut bytes).unwrap();
        header.init(3, 1 << 20);

        assert!(header.check().is_ok());
        assert_eq!(header.file_no(), 3);
        assert_eq!(header.used_length(), FILE_HEADER_SIZE as u64);
        assert_eq!(header.unused(), (1 << 20) - FILE_HEADER_SIZE as u64);
    }

    #[test]
    fn extent_capacity_excludes_header() {
        let mut bytes = [0u8; EXTENT_HEADER_SIZE];
        let ext = ExtentHeader::mut_from_bytes(&mut bytes).unwrap();
        ext.init(DiskLoc::new(0, 128), 4096);

        assert!(ext.check().is_ok());
        assert_eq!(ext.capacity(), 4096 - 64);
        assert_eq!(ext.data_start(), DiskLoc::new(0, 192));
        assert!(ext.is_empty());
    }

    #[test]
    fn bad_extent_magic_is_detected() {
        let bytes = [0u8; EXTENT_HEADER_SIZE];
        let ext = ExtentHeader::ref_from_bytes(&bytes).unwrap();
        assert!(ext.check().is_err());
    }

    #[test]
    fn record_header_chain_defaults_to_none() {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        let rec = RecordHeader::mut_from_bytes(&mut bytes).unwrap();
        rec.init(256, 128);

        assert_eq!(rec.len_with_headers(), 256);
        assert_eq!(rec.data_len(), 240);
        assert_eq!(rec.next_ofs(), NULL_OFS);
        assert_eq!(rec.prev_ofs(), NULL_OFS);
        assert_eq!(rec.extent_loc(DiskLoc::new(1, 500)), DiskLoc::new(1, 128));
    }

    #[test]
    fn deleted_view_shares_the_record_prefix() {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        {
            let rec = RecordHeader::mut_from_bytes(&mut bytes).unwrap();
            rec.init(512, 64);
        }
        let del = DeletedRecordHeader::ref_from_bytes(&bytes).unwrap();
        assert_eq!(del.len_with_headers(), 512);
        assert_eq!(del.extent_ofs(), 64);
    }
}
