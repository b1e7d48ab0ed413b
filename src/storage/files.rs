//! Per-database data file set and extent allocation.
//!
//! A database owns a numbered sequence of files (`<db>.0`, `<db>.1`, …).
//! Extents are carved off the tail of the newest file by bumping the
//! header's used length; when the file cannot hold the next extent a new
//! file is created. Disk locations resolve against this set: `loc.a()`
//! selects the file, `loc.ofs()` the byte offset inside it.

use std::path::PathBuf;

use eyre::{ensure, eyre, Result};
use tracing::debug;
use zerocopy::FromBytes;

use super::headers::{
    DataFileHeader, DeletedRecordHeader, ExtentHeader, RecordHeader, EXTENT_HEADER_SIZE,
    FILE_HEADER_SIZE, RECORD_HEADER_SIZE,
};
use super::{DiskLoc, MmapFile, NULL_OFS};

/// Smallest sensible extent: header plus one minimal record.
pub const MIN_EXTENT_SIZE: usize = EXTENT_HEADER_SIZE + RECORD_HEADER_SIZE + 16;

#[derive(Debug)]
pub struct DataFiles {
    dir: PathBuf,
    db: String,
    files: Vec<MmapFile>,
    initial_file_size: usize,
}

impl DataFiles {
    /// Opens any existing files for `db` under `dir`. Files are created
    /// lazily by the first extent allocation.
    pub fn open(dir: impl Into<PathBuf>, db: &str, initial_file_size: usize) -> Result<Self> {
        let dir = dir.into();
        let mut files = Vec::new();
        for n in 0.. {
            let path = dir.join(format!("{}.{}", db, n));
            if !path.exists() {
                break;
            }
            let file = MmapFile::open(&path)?;
            let header = DataFileHeader::ref_from_bytes(file.slice(0, FILE_HEADER_SIZE)?)
                .map_err(|e| eyre!("failed to read header of '{}': {:?}", path.display(), e))?;
            header.check()?;
            ensure!(
                header.file_no() == n,
                "data file '{}' carries file number {}",
                path.display(),
                header.file_no()
            );
            files.push(file);
        }
        Ok(Self {
            dir,
            db: db.to_string(),
            files,
            initial_file_size,
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn n_files(&self) -> usize {
        self.files.len()
    }

    fn file(&self, a: i32) -> Result<&MmapFile> {
        ensure!(
            a >= 0 && (a as usize) < self.files.len(),
            "disk location references unknown file {}",
            a
        );
        Ok(&self.files[a as usize])
    }

    fn file_mut(&mut self, a: i32) -> Result<&mut MmapFile> {
        ensure!(
            a >= 0 && (a as usize) < self.files.len(),
            "disk location references unknown file {}",
            a
        );
        Ok(&mut self.files[a as usize])
    }

    fn create_file(&mut self, min_capacity: usize) -> Result<i32> {
        let n = self.files.len() as u32;
        let len = self
            .initial_file_size
            .max(min_capacity + FILE_HEADER_SIZE)
            .next_multiple_of(4096);
        ensure!(
            len <= i32::MAX as usize,
            "data file length {} exceeds the addressable range",
            len
        );
        let path = self.dir.join(format!("{}.{}", self.db, n));
        debug!(file = %path.display(), len, "creating data file");
        let mut file = MmapFile::create(&path, len)?;
        let header = DataFileHeader::mut_from_bytes(file.slice_mut(0, FILE_HEADER_SIZE)?)
            .map_err(|e| eyre!("failed to init header of '{}': {:?}", path.display(), e))?;
        header.init(n, len as u64);
        self.files.push(file);
        Ok(n as i32)
    }

    /// Carves a fresh extent of exactly `size` bytes (header included) and
    /// initializes its header. The extent is not yet linked to any chain.
    pub fn alloc_extent(&mut self, size: usize) -> Result<DiskLoc> {
        ensure!(size >= MIN_EXTENT_SIZE, "extent size {} too small", size);
        ensure!(size % 4 == 0, "extent size {} not 4-byte aligned", size);

        let a = match self.files.last().map(|_| self.files.len() as i32 - 1) {
            Some(last) => {
                let header = self.header(last)?;
                if header.unused() >= size as u64 {
                    last
                } else {
                    self.create_file(size)?
                }
            }
            None => self.create_file(size)?,
        };

        let ofs = {
            let header = self.header_mut(a)?;
            let ofs = header.used_length();
            header.set_used_length(ofs + size as u64);
            ofs as i32
        };

        let loc = DiskLoc::new(a, ofs);
        let ext = self.extent_uninit_mut(loc, size)?;
        ext.init(loc, size as i32);
        Ok(loc)
    }

    fn header(&self, a: i32) -> Result<&DataFileHeader> {
        let bytes = self.file(a)?.slice(0, FILE_HEADER_SIZE)?;
        DataFileHeader::ref_from_bytes(bytes)
            .map_err(|e| eyre!("failed to parse data file header: {:?}", e))
    }

    fn header_mut(&mut self, a: i32) -> Result<&mut DataFileHeader> {
        let bytes = self.file_mut(a)?.slice_mut(0, FILE_HEADER_SIZE)?;
        DataFileHeader::mut_from_bytes(bytes)
            .map_err(|e| eyre!("failed to parse data file header: {:?}", e))
    }

    fn extent_uninit_mut(&mut self, loc: DiskLoc, size: usize) -> Result<&mut ExtentHeader> {
        ensure!(
            size >= EXTENT_HEADER_SIZE,
            "extent at {:?} shorter than its header",
            loc
        );
        let bytes = self
            .file_mut(loc.a())?
            .slice_mut(loc.ofs() as usize, EXTENT_HEADER_SIZE)?;
        ExtentHeader::mut_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map extent header at {:?}: {:?}", loc, e))
    }

    pub fn extent(&self, loc: DiskLoc) -> Result<&ExtentHeader> {
        let bytes = self
            .file(loc.a())?
            .slice(loc.ofs() as usize, EXTENT_HEADER_SIZE)?;
        let ext = ExtentHeader::ref_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map extent header at {:?}: {:?}", loc, e))?;
        ext.check()?;
        Ok(ext)
    }

    pub fn extent_mut(&mut self, loc: DiskLoc) -> Result<&mut ExtentHeader> {
        let bytes = self
            .file_mut(loc.a())?
            .slice_mut(loc.ofs() as usize, EXTENT_HEADER_SIZE)?;
        let ext = ExtentHeader::mut_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map extent header at {:?}: {:?}", loc, e))?;
        ext.check()?;
        Ok(ext)
    }

    pub fn record_header(&self, loc: DiskLoc) -> Result<&RecordHeader> {
        let bytes = self
            .file(loc.a())?
            .slice(loc.ofs() as usize, RECORD_HEADER_SIZE)?;
        RecordHeader::ref_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map record header at {:?}: {:?}", loc, e))
    }

    pub fn record_header_mut(&mut self, loc: DiskLoc) -> Result<&mut RecordHeader> {
        let bytes = self
            .file_mut(loc.a())?
            .slice_mut(loc.ofs() as usize, RECORD_HEADER_SIZE)?;
        RecordHeader::mut_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map record header at {:?}: {:?}", loc, e))
    }

    pub fn deleted(&self, loc: DiskLoc) -> Result<&DeletedRecordHeader> {
        let bytes = self
            .file(loc.a())?
            .slice(loc.ofs() as usize, RECORD_HEADER_SIZE)?;
        DeletedRecordHeader::ref_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map deleted record at {:?}: {:?}", loc, e))
    }

    pub fn deleted_mut(&mut self, loc: DiskLoc) -> Result<&mut DeletedRecordHeader> {
        let bytes = self
            .file_mut(loc.a())?
            .slice_mut(loc.ofs() as usize, RECORD_HEADER_SIZE)?;
        DeletedRecordHeader::mut_from_bytes(bytes)
            .map_err(|e| eyre!("failed to map deleted record at {:?}: {:?}", loc, e))
    }

    /// The record's payload bytes (allocated length; a decoded document may
    /// not use the padded tail).
    pub fn record_data(&self, loc: DiskLoc) -> Result<&[u8]> {
        let len = self.record_header(loc)?.data_len();
        ensure!(len >= 0, "corrupted record length at {:?}", loc);
        self.file(loc.a())?
            .slice(loc.ofs() as usize + RECORD_HEADER_SIZE, len as usize)
    }

    pub fn write_record_data(&mut self, loc: DiskLoc, data: &[u8]) -> Result<()> {
        let len = self.record_header(loc)?.data_len();
        ensure!(
            data.len() <= len as usize,
            "document of {} bytes does not fit record of {} at {:?}",
            data.len(),
            len,
            loc
        );
        self.file_mut(loc.a())?
            .slice_mut(loc.ofs() as usize + RECORD_HEADER_SIZE, data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    /// First record at or after `extent_loc` in chain order, skipping empty
    /// extents.
    pub fn first_record(&self, mut extent_loc: DiskLoc) -> Result<DiskLoc> {
        while !extent_loc.is_null() {
            let ext = self.extent(extent_loc)?;
            if !ext.first_record().is_null() {
                return Ok(ext.first_record());
            }
            extent_loc = ext.xnext();
        }
        Ok(DiskLoc::NULL)
    }

    /// Last record at or before `extent_loc` in chain order, skipping empty
    /// extents.
    pub fn last_record(&self, mut extent_loc: DiskLoc) -> Result<DiskLoc> {
        while !extent_loc.is_null() {
            let ext = self.extent(extent_loc)?;
            if !ext.last_record().is_null() {
                return Ok(ext.last_record());
            }
            extent_loc = ext.xprev();
        }
        Ok(DiskLoc::NULL)
    }

    /// Successor of `loc` in collection order, crossing extent boundaries.
    pub fn next_record(&self, loc: DiskLoc) -> Result<DiskLoc> {
        let header = self.record_header(loc)?;
        if header.next_ofs() != NULL_OFS {
            return Ok(loc.with_ofs(header.next_ofs()));
        }
        let ext = self.extent(header.extent_loc(loc))?;
        self.first_record(ext.xnext())
    }

    /// Predecessor of `loc` in collection order, crossing extent boundaries.
    pub fn prev_record(&self, loc: DiskLoc) -> Result<DiskLoc> {
        let header = self.record_header(loc)?;
        if header.prev_ofs() != NULL_OFS {
            return Ok(loc.with_ofs(header.prev_ofs()));
        }
        let ext = self.extent(header.extent_loc(loc))?;
        self.last_record(ext.xprev())
    }

    /// True when `loc` falls inside the extent at `extent_loc`.
    pub fn in_extent(&self, loc: DiskLoc, extent_loc: DiskLoc) -> Result<bool> {
        if loc.is_null() || loc.a() != extent_loc.a() {
            return Ok(false);
        }
        let ext = self.extent(extent_loc)?;
        Ok(loc.ofs() >= extent_loc.ofs() && loc.ofs() < extent_loc.ofs() + ext.length())
    }

    pub fn sync_all(&self) -> Result<()> {
        for file in &self.files {
            file.sync()?;
        }
        Ok(())
    }
}
