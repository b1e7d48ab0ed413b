//! A single query-access candidate: one index (or the collection scan),
//! a direction, and derived key bounds.
//!
//! The constructor analyzes the index's key pattern against the query's
//! field ranges and the requested order, deriving the flags the plan set
//! races on:
//!
//! - `optimal`: no other plan can beat this one; the race is unnecessary
//! - `exact_key_match`: index keys alone resolve the match, no document
//!   fetch needed
//! - `scan_and_order_required`: an in-memory sort must follow the scan
//! - `unhelpful`: the index neither narrows the scan nor provides the order

use hashbrown::HashSet;
use smallvec::SmallVec;

use eyre::Result;

use crate::document::{Document, Value};
use crate::index::IndexKey;
use crate::transient::NsTransient;

use super::cursor::{BasicCursor, CollectionScanSpec, Cursor, IndexCursor, QueryCtx};
use super::pattern::QueryPattern;
use super::ranges::FieldRangeSet;

/// What the plan set knows about one candidate index.
#[derive(Debug, Clone)]
pub struct PlanIndex {
    pub slot: usize,
    pub name: String,
    pub key_pattern: Document,
    pub multikey: bool,
}

#[derive(Clone)]
pub struct QueryPlan {
    ns: String,
    index: Option<PlanIndex>,
    direction: i32,
    index_bounds: Vec<(IndexKey, IndexKey)>,
    end_key_inclusive: bool,
    optimal: bool,
    exact_key_match: bool,
    scan_and_order_required: bool,
    unhelpful: bool,
    special: String,
    scan_spec: CollectionScanSpec,
    query: Document,
    pattern: QueryPattern,
}

impl QueryPlan {
    pub fn new(
        ns: &str,
        index: Option<PlanIndex>,
        ranges: &FieldRangeSet,
        order: &Document,
        scan_spec: CollectionScanSpec,
    ) -> Self {
        let pattern = QueryPattern::new(ranges, order);
        match index {
            None => Self::new_collection_scan(ns, ranges, order, scan_spec, pattern),
            Some(index) => Self::new_index_plan(ns, index, ranges, order, scan_spec, pattern),
        }
    }

    fn new_collection_scan(
        ns: &str,
        ranges: &FieldRangeSet,
        order: &Document,
        scan_spec: CollectionScanSpec,
        pattern: QueryPattern,
    ) -> Self {
        let natural = natural_direction(order);
        let scan_and_order_required = !order.is_empty() && natural.is_none();
        Self {
            ns: ns.to_string(),
            index: None,
            direction: natural.unwrap_or(1),
            index_bounds: Vec::new(),
            end_key_inclusive: true,
            optimal: ranges.n_nontrivial_ranges() == 0 && !scan_and_order_required,
            exact_key_match: false,
            scan_and_order_required,
            unhelpful: false,
            special: String::new(),
            scan_spec,
            query: ranges.query().clone(),
            pattern,
        }
    }

    fn new_index_plan(
        ns: &str,
        index: PlanIndex,
        ranges: &FieldRangeSet,
        order: &Document,
        scan_spec: CollectionScanSpec,
        pattern: QueryPattern,
    ) -> Self {
        let key_fields: Vec<(String, i32)> = index
            .key_pattern
            .iter()
            .map(|(name, dir)| (name.to_string(), direction_of(dir)))
            .collect();

        // can the index provide the requested order?
        let mut direction = 0i32;
        let mut scan_and_order_required = !order.is_empty();
        'order_check: {
            if order.is_empty() {
                break 'order_check;
            }
            let mut ki = 0;
            for (o_name, o_dir) in order.iter() {
                let o_dir = direction_of(o_dir);
                loop {
                    if ki >= key_fields.len() {
                        break 'order_check;
                    }
                    let (k_name, k_dir) = &key_fields[ki];
                    let k_dir = *k_dir;
                    ki += 1;
                    if k_name == o_name {
                        let d = if o_dir == k_dir { 1 } else { -1 };
                        if direction == 0 {
                            direction = d;
                        } else if direction != d {
                            break 'order_check;
                        }
                        break;
                    }
                    // an equality-pinned prefix field does not disturb order
                    if !ranges.range(k_name).equality() {
                        break 'order_check;
                    }
                }
            }
            scan_and_order_required = false;
        }
        if scan_and_order_required {
            direction = 0;
        }

        // optimality and exactness
        let mut optimal_count = 0i32;
        let mut awaiting_last_optimal_field = true;
        let mut exact_count = 0usize;
        let mut order_fields_unindexed: HashSet<&str> = order.field_names().collect();
        for (field, _) in &key_fields {
            let fb = ranges.range(field);
            if awaiting_last_optimal_field {
                if fb.nontrivial() {
                    optimal_count += 1;
                }
                if !fb.equality() {
                    awaiting_last_optimal_field = false;
                }
            } else if fb.nontrivial() {
                optimal_count = -1;
            }
            if fb.equality() && scalar_bound(&fb.max().value) {
                exact_count += 1;
            }
            order_fields_unindexed.remove(field.as_str());
        }

        let n_nontrivial = ranges.n_nontrivial_ranges();
        let optimal = !scan_and_order_required && optimal_count == n_nontrivial as i32;
        let n_query_fields = ranges
            .query()
            .field_names()
            .filter(|f| !f.starts_with('$'))
            .count();
        let exact_key_match = exact_count == n_nontrivial
            && order_fields_unindexed.is_empty()
            && exact_count == key_fields.len()
            && exact_count == n_query_fields;

        let unhelpful = (scan_and_order_required || order.is_empty())
            && !ranges.range(key_fields[0].0.as_str()).nontrivial();

        // bounds: one pair per leading-field interval, remaining fields
        // filled from their own range ends
        let rest_min: SmallVec<[Value; 2]> = key_fields[1..]
            .iter()
            .map(|(f, _)| ranges.range(f).min().value.clone())
            .collect();
        let rest_max: SmallVec<[Value; 2]> = key_fields[1..]
            .iter()
            .map(|(f, _)| ranges.range(f).max().value.clone())
            .collect();
        let mut end_key_inclusive = key_fields
            .iter()
            .all(|(f, _)| ranges.range(f).max().inclusive);
        let lead = ranges.range(key_fields[0].0.as_str());
        if lead.intervals().len() > 1 {
            // point unions close each interval on both sides
            end_key_inclusive = true;
        }
        let index_bounds = lead
            .intervals()
            .iter()
            .map(|iv| {
                let mut lo: SmallVec<[Value; 2]> = SmallVec::new();
                lo.push(iv.lower.value.clone());
                lo.extend(rest_min.iter().cloned());
                let mut hi: SmallVec<[Value; 2]> = SmallVec::new();
                hi.push(iv.upper.value.clone());
                hi.extend(rest_max.iter().cloned());
                (IndexKey(lo), IndexKey(hi))
            })
            .collect();

        Self {
            ns: ns.to_string(),
            index: Some(index),
            direction: if direction == 0 { 1 } else { direction },
            index_bounds,
            end_key_inclusive,
            optimal,
            exact_key_match,
            scan_and_order_required,
            unhelpful,
            special: String::new(),
            scan_spec,
            query: ranges.query().clone(),
            pattern,
        }
    }

    /// Single-index plan with caller-supplied bounds (the `min`/`max` path).
    pub fn with_bounds(
        ns: &str,
        index: PlanIndex,
        ranges: &FieldRangeSet,
        order: &Document,
        scan_spec: CollectionScanSpec,
        start: IndexKey,
        end: IndexKey,
    ) -> Self {
        let mut plan = Self::new_index_plan(
            ns,
            index,
            ranges,
            order,
            scan_spec,
            QueryPattern::new(ranges, order),
        );
        plan.index_bounds = vec![(start, end)];
        plan.end_key_inclusive = false;
        plan
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn is_collection_scan(&self) -> bool {
        self.index.is_none()
    }

    pub fn index(&self) -> Option<&PlanIndex> {
        self.index.as_ref()
    }

    /// The cached-plan identity: the index key pattern, or `{$natural: 1}`
    /// for the collection scan.
    pub fn index_key(&self) -> Document {
        match &self.index {
            Some(idx) => idx.key_pattern.clone(),
            None => {
                let mut d = Document::new();
                d.set("$natural", self.direction as i64);
                d
            }
        }
    }

    pub fn query(&self) -> &Document {
        &self.query
    }

    pub fn pattern(&self) -> &QueryPattern {
        &self.pattern
    }

    pub fn direction(&self) -> i32 {
        self.direction
    }

    pub fn optimal(&self) -> bool {
        self.optimal
    }

    pub fn exact_key_match(&self) -> bool {
        self.exact_key_match
    }

    pub fn scan_and_order_required(&self) -> bool {
        self.scan_and_order_required
    }

    pub fn unhelpful(&self) -> bool {
        self.unhelpful
    }

    pub fn special(&self) -> &str {
        &self.special
    }

    pub fn index_bounds(&self) -> &[(IndexKey, IndexKey)] {
        &self.index_bounds
    }

    pub fn start_key(&self) -> IndexKey {
        let bound = if self.direction >= 0 {
            self.index_bounds.first().map(|(s, _)| s.clone())
        } else {
            self.index_bounds.last().map(|(_, e)| e.clone())
        };
        bound.unwrap_or_else(|| IndexKey(SmallVec::new()))
    }

    pub fn end_key(&self) -> IndexKey {
        let bound = if self.direction >= 0 {
            self.index_bounds.last().map(|(_, e)| e.clone())
        } else {
            self.index_bounds.first().map(|(s, _)| s.clone())
        };
        bound.unwrap_or_else(|| IndexKey(SmallVec::new()))
    }

    pub fn end_key_inclusive(&self) -> bool {
        self.end_key_inclusive
    }

    pub fn new_cursor(&self, ctx: &QueryCtx) -> Result<Box<dyn Cursor>> {
        self.cursor_with_direction(ctx, self.direction)
    }

    pub fn new_reverse_cursor(&self, ctx: &QueryCtx) -> Result<Box<dyn Cursor>> {
        self.cursor_with_direction(ctx, -self.direction)
    }

    fn cursor_with_direction(&self, ctx: &QueryCtx, direction: i32) -> Result<Box<dyn Cursor>> {
        match &self.index {
            None => Ok(Box::new(if direction < 0 {
                BasicCursor::reverse(self.scan_spec.clone(), ctx)?
            } else {
                BasicCursor::forward(self.scan_spec.clone(), ctx)?
            })),
            Some(idx) => Ok(Box::new(IndexCursor::new(
                ctx,
                &self.ns,
                &idx.name,
                idx.key_pattern.clone(),
                idx.multikey,
                self.index_bounds.clone(),
                self.end_key_inclusive,
                direction < 0,
            ))),
        }
    }

    /// Records this plan as the winner for its query shape.
    pub fn register_self(&self, n_scanned: u64, transient: &NsTransient) {
        transient.register_index_for_pattern(self.pattern.clone(), self.index_key(), n_scanned);
    }
}

impl std::fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPlan")
            .field("index", &self.index_key())
            .field("direction", &self.direction)
            .field("optimal", &self.optimal)
            .field("exact_key_match", &self.exact_key_match)
            .field("scan_and_order_required", &self.scan_and_order_required)
            .field("unhelpful", &self.unhelpful)
            .finish()
    }
}

fn direction_of(v: &Value) -> i32 {
    match v {
        Value::Int(n) if *n < 0 => -1,
        Value::Double(d) if *d < 0.0 => -1,
        _ => 1,
    }
}

/// `Some(±1)` when the order is a bare `$natural` hint.
fn natural_direction(order: &Document) -> Option<i32> {
    if order.is_empty() {
        return None;
    }
    if order.len() == 1 {
        if let Some(v) = order.get("$natural") {
            return Some(direction_of(v));
        }
    }
    None
}

/// Equality on documents or arrays cannot guarantee an exact key match;
/// scalars can.
fn scalar_bound(v: &Value) -> bool {
    !matches!(v, Value::Doc(_) | Value::Array(_))
}
