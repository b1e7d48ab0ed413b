//! # Storage Layer
//!
//! Memory-mapped data files for one database, carved into extents that hold
//! document records. The layer has four pieces:
//!
//! - [`mmap`]: a growable byte-addressed mapping over one file
//! - [`headers`]: zerocopy structs for the file, extent, and record headers
//! - [`files`]: the per-database file set, disk-location resolution, and
//!   extent allocation
//! - [`alloc`]: the record allocator (bucketed free lists, capped ring,
//!   adaptive padding)
//!
//! ## Disk locations
//!
//! A [`DiskLoc`] is a typed `(file number, byte offset)` pair. It is the only
//! currency for referring to on-disk structures; raw pointers into a mapping
//! are never retained across calls, so file growth (which remaps) cannot
//! invalidate anything a caller holds.
//!
//! ```text
//! <db>.0, <db>.1, ...          data files
//! +-----------+--------------------------------------------+
//! | header    | extent | extent | extent |    (unused)     |
//! | (128 B)   +--------------------------------------------+
//! |           | ext hdr (64 B) | record | record | ...     |
//! +-----------+--------------------------------------------+
//! ```
//!
//! Records within an extent are doubly linked through offsets in their
//! headers; extents are doubly linked through `DiskLoc`s; deleted records
//! form singly linked free lists rooted in the namespace record.

pub mod alloc;
mod files;
mod headers;
mod mmap;

pub use alloc::{bucket, quantize_alloc_space, Allocator, BUCKET_SIZES, MAX_BUCKET};
pub use files::DataFiles;
pub use headers::{
    DataFileHeader, DeletedRecordHeader, ExtentHeader, RecordHeader, DATA_FILE_MAGIC,
    EXTENT_HEADER_SIZE, EXTENT_MAGIC, FILE_HEADER_SIZE, RECORD_HEADER_SIZE,
};
pub use mmap::MmapFile;

use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Offset sentinel for record chains within a file.
pub const NULL_OFS: i32 = -1;

/// A typed disk location: file number within the database, byte offset
/// within the file.
///
/// Two sentinel states exist: *null* (`a == -1`) for "no location", and
/// *invalid* (`a == -2`) for "not yet computed" (used by the capped
/// collection cursor state).
#[repr(C)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
pub struct DiskLoc {
    a: I32,
    ofs: I32,
}

impl DiskLoc {
    pub const NULL: DiskLoc = DiskLoc {
        a: I32::new(-1),
        ofs: I32::new(0),
    };

    pub const INVALID: DiskLoc = DiskLoc {
        a: I32::new(-2),
        ofs: I32::new(0),
    };

    pub fn new(a: i32, ofs: i32) -> Self {
        Self {
            a: I32::new(a),
            ofs: I32::new(ofs),
        }
    }

    #[inline]
    pub fn a(&self) -> i32 {
        self.a.get()
    }

    #[inline]
    pub fn ofs(&self) -> i32 {
        self.ofs.get()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.a.get() == -1
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.a.get() != -2
    }

    /// A location `delta` bytes further into the same file.
    pub fn plus(&self, delta: i32) -> DiskLoc {
        debug_assert!(!self.is_null());
        DiskLoc::new(self.a.get(), self.ofs.get() + delta)
    }

    /// A location at `ofs` in the same file.
    pub fn with_ofs(&self, ofs: i32) -> DiskLoc {
        DiskLoc::new(self.a.get(), ofs)
    }
}

impl std::fmt::Debug for DiskLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "DiskLoc(null)")
        } else if !self.is_valid() {
            write!(f, "DiskLoc(invalid)")
        } else {
            write!(f, "DiskLoc({}:{:#x})", self.a.get(), self.ofs.get())
        }
    }
}
