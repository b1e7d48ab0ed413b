//! Open-addressed hash table embedded in the mapped `.ns` file.
//!
//! The file is a 128-byte header followed by a fixed array of nodes, each a
//! `(hash, key, record)` triple of 4 + 128 + 496 bytes. Linear probing; a
//! zero hash terminates a probe chain, so `kill` both zeroes the hash and
//! writes the `0x7F` tombstone into the key. The table never rehashes: when
//! every slot is in use, inserts fail and the caller surfaces
//! [`ErrorKind::CatalogFull`](crate::error::ErrorKind).

use std::path::Path;

use eyre::{ensure, eyre, Result};
use tracing::warn;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::name::NsKey;
use super::record::{NsExtra, NsRecord, NS_RECORD_SIZE};
use crate::catalog::name::MAX_NS_LEN;
use crate::storage::MmapFile;

pub const CATALOG_HEADER_SIZE: usize = 128;
pub const NODE_SIZE: usize = 4 + MAX_NS_LEN + NS_RECORD_SIZE;
pub const CATALOG_MAGIC: &[u8; 16] = b"mangrove ns\x00\x00\x00\x00\x00";
pub const CATALOG_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CatalogHeader {
    magic: [u8; 16],
    version: U32,
    reserved0: U32,
    n_nodes: U64,
    reserved: [u8; 96],
}

const _: () = assert!(std::mem::size_of::<CatalogHeader>() == CATALOG_HEADER_SIZE);

/// Probe outcome: the slot the key lives in, or the slot it should be
/// inserted into; `None` when the table is full.
struct Probe {
    found: bool,
    slot: Option<usize>,
}

#[derive(Debug)]
pub struct NsHashTable {
    file: MmapFile,
    n_nodes: usize,
    name: String,
}

impl NsHashTable {
    pub fn create(path: &Path, size: usize, name: &str) -> Result<Self> {
        ensure!(
            size > CATALOG_HEADER_SIZE + NODE_SIZE,
            "catalog file size {} cannot hold a single node",
            size
        );
        let mut file = MmapFile::create(path, size)?;
        let header =
            CatalogHeader::mut_from_bytes(file.slice_mut(0, CATALOG_HEADER_SIZE)?)
                .map_err(|e| eyre!("failed to map catalog header: {:?}", e))?;
        header.magic = *CATALOG_MAGIC;
        header.version = U32::new(CATALOG_VERSION);
        let n_nodes = (size - CATALOG_HEADER_SIZE) / NODE_SIZE;
        header.n_nodes = U64::new(n_nodes as u64);
        Ok(Self {
            file,
            n_nodes,
            name: name.to_string(),
        })
    }

    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let file = MmapFile::open(path)?;
        let header = CatalogHeader::ref_from_bytes(file.slice(0, CATALOG_HEADER_SIZE)?)
            .map_err(|e| eyre!("failed to map catalog header: {:?}", e))?;
        ensure!(
            &header.magic == CATALOG_MAGIC,
            "'{}' is not a namespace catalog file",
            path.display()
        );
        ensure!(
            header.version.get() == CATALOG_VERSION,
            "unsupported catalog version {}",
            header.version.get()
        );
        let n_nodes = header.n_nodes.get() as usize;
        ensure!(
            CATALOG_HEADER_SIZE + n_nodes * NODE_SIZE <= file.len(),
            "catalog header claims {} nodes but the file holds fewer",
            n_nodes
        );
        Ok(Self {
            file,
            n_nodes,
            name: name.to_string(),
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    fn node_ofs(&self, slot: usize) -> usize {
        CATALOG_HEADER_SIZE + slot * NODE_SIZE
    }

    fn hash_at(&self, slot: usize) -> i32 {
        let ofs = self.node_ofs(slot);
        let bytes = self.file.slice(ofs, 4).expect("slot in bounds");
        i32::from_le_bytes(bytes.try_into().unwrap())
    }

    fn set_hash_at(&mut self, slot: usize, hash: i32) {
        let ofs = self.node_ofs(slot);
        self.file
            .slice_mut(ofs, 4)
            .expect("slot in bounds")
            .copy_from_slice(&hash.to_le_bytes());
    }

    pub fn key_at(&self, slot: usize) -> &NsKey {
        let ofs = self.node_ofs(slot) + 4;
        NsKey::ref_from_bytes(self.file.slice(ofs, MAX_NS_LEN).expect("slot in bounds"))
            .expect("key layout")
    }

    fn key_at_mut(&mut self, slot: usize) -> &mut NsKey {
        let ofs = self.node_ofs(slot) + 4;
        NsKey::mut_from_bytes(
            self.file
                .slice_mut(ofs, MAX_NS_LEN)
                .expect("slot in bounds"),
        )
        .expect("key layout")
    }

    /// Byte offset of the record area of `slot` within the mapping. Offsets
    /// are the stable currency for record references; they survive nothing —
    /// re-resolve after any structural change.
    pub fn record_ofs(&self, slot: usize) -> usize {
        self.node_ofs(slot) + 4 + MAX_NS_LEN
    }

    pub fn record_at(&self, record_ofs: usize) -> Result<&NsRecord> {
        NsRecord::ref_from_bytes(self.file.slice(record_ofs, NS_RECORD_SIZE)?)
            .map_err(|e| eyre!("failed to map namespace record: {:?}", e))
    }

    pub fn record_at_mut(&mut self, record_ofs: usize) -> Result<&mut NsRecord> {
        NsRecord::mut_from_bytes(self.file.slice_mut(record_ofs, NS_RECORD_SIZE)?)
            .map_err(|e| eyre!("failed to map namespace record: {:?}", e))
    }

    /// The record area of an overflow slot, viewed as an `NsExtra`.
    pub fn extra_at(&self, record_ofs: usize) -> Result<&NsExtra> {
        NsExtra::ref_from_bytes(self.file.slice(record_ofs, NS_RECORD_SIZE)?)
            .map_err(|e| eyre!("failed to map overflow record: {:?}", e))
    }

    pub fn extra_at_mut(&mut self, record_ofs: usize) -> Result<&mut NsExtra> {
        NsExtra::mut_from_bytes(self.file.slice_mut(record_ofs, NS_RECORD_SIZE)?)
            .map_err(|e| eyre!("failed to map overflow record: {:?}", e))
    }

    fn probe(&self, key: &NsKey) -> Probe {
        let hash = key.hash();
        let mut i = (hash as u32 as usize) % self.n_nodes;
        let start = i;
        let mut chain = 0usize;
        let first_unused: Option<usize> = None;
        loop {
            let h = self.hash_at(i);
            if h == 0 {
                // end of the chain
                return Probe {
                    found: false,
                    slot: Some(first_unused.unwrap_or(i)),
                };
            }
            if h == hash && self.key_at(i) == key {
                if chain >= 200 {
                    warn!(table = %self.name, chain, "hashtable long chain");
                }
                return Probe {
                    found: true,
                    slot: Some(i),
                };
            }
            chain += 1;
            i += 1;
            if i == self.n_nodes {
                i = 0;
            }
            if i == start {
                warn!(table = %self.name, "hashtable is full, no more namespaces fit");
                return Probe {
                    found: false,
                    slot: first_unused,
                };
            }
        }
    }

    /// Slot of `key` if present.
    pub fn get(&self, key: &NsKey) -> Option<usize> {
        let probe = self.probe(key);
        probe.found.then(|| probe.slot.unwrap())
    }

    /// Inserts or overwrites; `Ok(false)` means the table is full.
    pub fn put(&mut self, key: &NsKey, value: &[u8]) -> Result<bool> {
        ensure!(
            value.len() == NS_RECORD_SIZE,
            "record value must be {} bytes, got {}",
            NS_RECORD_SIZE,
            value.len()
        );
        let probe = self.probe(key);
        let Some(slot) = probe.slot else {
            return Ok(false);
        };
        if !probe.found {
            *self.key_at_mut(slot) = *key;
            self.set_hash_at(slot, key.hash());
        }
        let ofs = self.record_ofs(slot);
        self.file
            .slice_mut(ofs, NS_RECORD_SIZE)?
            .copy_from_slice(value);
        Ok(true)
    }

    /// Tombstones the slot: zero hash ends probe chains, `0x7F` in the key
    /// marks the node for offline inspection.
    pub fn kill(&mut self, key: &NsKey) {
        let probe = self.probe(key);
        if let (true, Some(slot)) = (probe.found, probe.slot) {
            self.key_at_mut(slot).kill();
            self.set_hash_at(slot, 0);
        }
    }

    /// Names of live slots, in table order.
    pub fn live_names(&self) -> Vec<String> {
        (0..self.n_nodes)
            .filter(|&i| self.hash_at(i) != 0)
            .map(|i| self.key_at(i).as_str().to_string())
            .collect()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::record::NS_RECORD_SIZE;
    use crate::storage::DiskLoc;

    fn table(n_hint: usize) -> NsHashTable {
        let dir = tempfile::tempdir().unwrap().keep();
        let size = CATALOG_HEADER_SIZE + n_hint * NODE_SIZE;
        NsHashTable::create(&dir.join("t.ns"), size, "test").unwrap()
    }

    fn sample_record() -> NsRecord {
        let mut rec = NsRecord::read_from_bytes(&[0u8; NS_RECORD_SIZE]).unwrap();
        rec.init(DiskLoc::new(0, 128), false);
        rec
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut ht = table(64);
        let key = NsKey::new("acme.orders").unwrap();
        let rec = sample_record();

        assert!(ht.put(&key, rec.as_bytes()).unwrap());

        let slot = ht.get(&key).unwrap();
        let stored = ht.record_at(ht.record_ofs(slot)).unwrap();
        assert_eq!(stored.first_extent(), DiskLoc::new(0, 128));
        assert_eq!(ht.key_at(slot).hash(), key.hash());
    }

    #[test]
    fn get_of_absent_key_is_none() {
        let ht = table(64);
        assert!(ht.get(&NsKey::new("acme.none").unwrap()).is_none());
    }

    #[test]
    fn kill_tombstones_the_slot() {
        let mut ht = table(64);
        let key = NsKey::new("acme.orders").unwrap();
        let rec = sample_record();
        ht.put(&key, rec.as_bytes()).unwrap();

        let slot = ht.get(&key).unwrap();
        ht.kill(&key);

        assert!(ht.get(&key).is_none());
        assert!(ht.key_at(slot).is_killed());
        assert_eq!(ht.hash_at(slot), 0);
    }

    #[test]
    fn killed_slot_is_reusable() {
        let mut ht = table(4);
        let key = NsKey::new("acme.orders").unwrap();
        let rec = sample_record();

        ht.put(&key, rec.as_bytes()).unwrap();
        ht.kill(&key);
        assert!(ht.put(&key, rec.as_bytes()).unwrap());
        assert!(ht.get(&key).is_some());
    }

    #[test]
    fn full_table_refuses_inserts() {
        let mut ht = table(2);
        let rec = sample_record();

        let mut stored = 0;
        for i in 0..4 {
            let key = NsKey::new(&format!("acme.c{}", i)).unwrap();
            if ht.put(&key, rec.as_bytes()).unwrap() {
                stored += 1;
            }
        }
        assert_eq!(stored, 2);
    }

    #[test]
    fn live_names_skips_killed_slots() {
        let mut ht = table(16);
        let rec = sample_record();
        for name in ["acme.a", "acme.b", "acme.c"] {
            ht.put(&NsKey::new(name).unwrap(), rec.as_bytes()).unwrap();
        }
        ht.kill(&NsKey::new("acme.b").unwrap());

        let mut names = ht.live_names();
        names.sort();
        assert_eq!(names, vec!["acme.a", "acme.c"]);
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap().keep();
        let path = dir.join("t.ns");
        let size = CATALOG_HEADER_SIZE + 32 * NODE_SIZE;
        let key = NsKey::new("acme.orders").unwrap();
        {
            let mut ht = NsHashTable::create(&path, size, "test").unwrap();
            ht.put(&key, sample_record().as_bytes()).unwrap();
            ht.sync().unwrap();
        }
        let ht = NsHashTable::open(&path, "test").unwrap();
        assert!(ht.get(&key).is_some());
        assert_eq!(ht.n_nodes(), 32);
    }
}
