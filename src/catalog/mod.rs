//! # Namespace Catalog
//!
//! The on-disk directory of collections. Each database has a `.ns` file: a
//! fixed-capacity hash table mapping 128-byte namespace keys to 496-byte
//! namespace records, memory-mapped for the life of the process.
//!
//! ```text
//! <db>.ns
//! +----------+-----------------------------------------------+
//! | header   | node | node | node | ...                      |
//! | (128 B)  +-----------------------------------------------+
//! |          | hash (4 B) | NsKey (128 B) | NsRecord (496 B) |
//! +----------+-----------------------------------------------+
//! ```
//!
//! The namespace record carries everything the engine needs to know about a
//! collection's physical layout: the extent chain, the 19 deleted-record
//! bucket heads, capped-collection ring state, the adaptive padding factor,
//! and up to ten inline index descriptors. Collections with more indexes
//! overflow into reserved sibling nodes (`<ns>$extra`, `<ns>$extrb`) linked
//! by record-relative byte offsets.
//!
//! - [`name`]: namespace strings, the fixed hash key, the Horner hash
//! - [`record`]: `NsRecord` / `NsExtra` layouts and field semantics
//! - [`hashtable`]: the mapped open-addressing table
//! - [`catalog`]: the `NamespaceCatalog` facade (init, lookup with
//!   migration, overflow management, rename fixup)

pub mod catalog;
pub mod hashtable;
pub mod name;
pub mod record;

pub use catalog::{IndexIterator, NamespaceCatalog};
pub use name::{is_extra_name, ns_to_database, NamespaceString, NsKey, MAX_DB_LEN, MAX_NS_LEN};
pub use record::{
    IndexSlot, NsExtra, NsRecord, BUCKETS, FLAG_CAPPED_DISALLOW_DELETE, FLAG_HAVE_ID_INDEX,
    NS_RECORD_SIZE, N_INDEXES_BASE, N_INDEXES_EXTRA, N_INDEXES_MAX,
};
