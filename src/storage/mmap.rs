//! Growable byte-addressed memory-mapped file.
//!
//! Unlike a page cache, the storage here is extent-oriented: callers address
//! arbitrary byte ranges (an extent header, a record, a hash-table node), so
//! the mapping exposes range slices rather than fixed pages.
//!
//! ## Safety model
//!
//! A mapping becomes invalid when the file is grown and remapped. Rust's
//! borrow checker enforces the discipline at compile time: `slice()` borrows
//! `&self`, `slice_mut()` and `grow()` borrow `&mut self`, so no slice can be
//! live across a remap.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

#[derive(Debug)]
pub struct MmapFile {
    file: File,
    mmap: MmapMut,
    len: usize,
}

impl MmapFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as usize;

        ensure!(
            len > 0,
            "cannot open empty database file '{}'",
            path.display()
        );

        // SAFETY: map_mut is unsafe because an externally modified file would
        // produce undefined behavior through the mapping. This is safe here:
        // 1. Database files are owned by this process for its lifetime
        // 2. The mapping's lifetime is tied to MmapFile
        // 3. All access goes through slice()/slice_mut(), which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self { file, mmap, len })
    }

    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let path = path.as_ref();

        ensure!(len > 0, "initial file length must be nonzero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        file.set_len(len as u64)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), len))?;

        // SAFETY: same argument as in open(); additionally the file was just
        // created with truncate, so no other mapping of it can exist.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self { file, mmap, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slice(&self, ofs: usize, len: usize) -> Result<&[u8]> {
        ensure!(
            ofs + len <= self.len,
            "range {}..{} out of bounds (file length {})",
            ofs,
            ofs + len,
            self.len
        );
        Ok(&self.mmap[ofs..ofs + len])
    }

    pub fn slice_mut(&mut self, ofs: usize, len: usize) -> Result<&mut [u8]> {
        ensure!(
            ofs + len <= self.len,
            "range {}..{} out of bounds (file length {})",
            ofs,
            ofs + len,
            self.len
        );
        Ok(&mut self.mmap[ofs..ofs + len])
    }

    pub fn grow(&mut self, new_len: usize) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mapping before grow")?;

        self.file
            .set_len(new_len as u64)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_len))?;

        // SAFETY: grow() holds &mut self, so the borrow checker guarantees no
        // outstanding slices into the old mapping; the old mapping is dropped
        // on assignment after the file has been extended.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.len = new_len;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mapping to disk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = tempfile::tempdir().unwrap();
        dir.keep().join(name)
    }

    #[test]
    fn create_writes_and_reads_back() {
        let path = scratch("a.db");
        let mut f = MmapFile::create(&path, 4096).unwrap();

        f.slice_mut(100, 4).unwrap().copy_from_slice(b"abcd");
        assert_eq!(f.slice(100, 4).unwrap(), b"abcd");
        assert_eq!(f.len(), 4096);
    }

    #[test]
    fn reopen_preserves_contents() {
        let path = scratch("b.db");
        {
            let mut f = MmapFile::create(&path, 1024).unwrap();
            f.slice_mut(0, 5).unwrap().copy_from_slice(b"hello");
            f.sync().unwrap();
        }
        let f = MmapFile::open(&path).unwrap();
        assert_eq!(f.slice(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn grow_preserves_existing_bytes() {
        let path = scratch("c.db");
        let mut f = MmapFile::create(&path, 512).unwrap();
        f.slice_mut(0, 3).unwrap().copy_from_slice(b"xyz");

        f.grow(2048).unwrap();

        assert_eq!(f.len(), 2048);
        assert_eq!(f.slice(0, 3).unwrap(), b"xyz");
        assert_eq!(f.slice(512, 4).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let path = scratch("d.db");
        let f = MmapFile::create(&path, 256).unwrap();
        assert!(f.slice(250, 10).is_err());
    }
}
