//! # Query-Plan Selection
//!
//! Chooses among candidate index accesses by racing them and caching
//! winners keyed by normalized query shape.
//!
//! ```text
//! query ──► FieldRangeSet ──► PlanSet (candidates) ──► Runner (race)
//!              │                   ▲                       │
//!              ▼                   │ pre-recorded          ▼ winner
//!         QueryPattern ───────► plan cache ◄────── register_self
//! ```
//!
//! `$or` queries are decomposed by the [`scanner::MultiPlanScanner`]: one
//! plan set per clause, earlier clauses folded into `$nor` so documents are
//! yielded at most once. The [`scanner::MultiCursor`] facade presents the
//! whole pipeline as an ordinary cursor.

pub mod cursor;
pub mod pattern;
pub mod plan;
pub mod plan_set;
pub mod ranges;
pub mod scanner;

pub use cursor::{scan_all, BasicCursor, CollectionScanSpec, Cursor, IndexCursor, QueryCtx};
pub use pattern::QueryPattern;
pub use plan::{PlanIndex, QueryPlan};
pub use plan_set::{FindOp, OpFactory, PlanSet, PlanSource, QueryOp, RunResult};
pub use ranges::{FieldRange, FieldRangeSet};
pub use scanner::{MultiCursor, MultiPlanScanner};
