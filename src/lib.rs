//! # Mangrove - Document Storage Engine Core
//!
//! Mangrove is the core of an embedded document-oriented storage engine:
//! a namespace catalog over memory-mapped files, an adaptive record
//! allocator, and a query planner that picks indexes by racing candidate
//! plans against each other.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mangrove::{doc, Config, Db};
//!
//! let db = Db::open(Config::new("./data"))?;
//!
//! db.insert("acme.orders", &doc! { "sku" => "w-11", "qty" => 3 })?;
//! db.ensure_index("acme.orders", "sku_1", &doc! { "sku" => 1 }, false)?;
//!
//! let hits = db.find("acme.orders", &doc! { "sku" => "w-11" }, &doc! {}, 0)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Db facade                   │
//! ├──────────────────────────────────────────┤
//! │  Query planner (plan sets, racing,       │
//! │  plan cache, $or decomposition)          │
//! ├───────────────────┬──────────────────────┤
//! │ Transient cache   │  Index key stores    │
//! ├───────────────────┴──────────────────────┤
//! │  Namespace catalog (.ns hash table)      │
//! ├──────────────────────────────────────────┤
//! │  Record allocator (buckets, capped ring) │
//! ├──────────────────────────────────────────┤
//! │  Extents over memory-mapped data files   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! data_dir/
//! ├── acme.ns         # namespace catalog for database "acme"
//! ├── acme.0          # data file 0: extents of records
//! ├── acme.1          # data file 1, created on demand
//! └── ...             # (per-database subdirectories when configured)
//! ```
//!
//! ## Module Overview
//!
//! - [`catalog`]: the `.ns` hash table, namespace records, overflow chains
//! - [`storage`]: mapped files, extents, the record allocator
//! - [`document`]: the document value model, encoding, matcher
//! - [`index`]: transient ordered key stores for built indexes
//! - [`transient`]: per-namespace derived state and the plan cache
//! - [`query`]: field ranges, query patterns, plan sets, racing, cursors
//! - [`db`]: the facade tying it together under one latch

#[macro_use]
mod macros;

pub mod catalog;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod index;
pub mod interrupt;
pub mod query;
pub mod storage;
pub mod transient;

pub use config::Config;
pub use db::{CollectionOptions, Db};
pub use document::{Document, Value};
pub use error::ErrorKind;
pub use interrupt::InterruptToken;
pub use storage::DiskLoc;
