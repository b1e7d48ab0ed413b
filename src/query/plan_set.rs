//! Candidate enumeration and the competitive runner.
//!
//! A [`PlanSet`] holds every access path worth trying for one
//! disjunction-free query: a hinted plan, a `min`/`max`-derived plan, a
//! pre-recorded winner plus the collection-scan baseline, or the full slate
//! of overlapping indexes with the scan as fallback. An `optimal` plan
//! short-circuits enumeration entirely.
//!
//! The [`Runner`](PlanSet::run_op) races one fresh [`QueryOp`] per plan —
//! ops come from a factory rather than a polymorphic clone — advancing them
//! round-robin until the first completes. The winner is recorded in the
//! plan cache under the query's normalized pattern. A candidate that fails
//! retires quietly; only if every candidate fails does the first captured
//! error surface.

use eyre::{bail, Result};
use smallvec::SmallVec;
use tracing::debug;

use crate::document::matcher::Matcher;
use crate::document::{Document, Value};
use crate::error::ErrorKind;
use crate::index::IndexKey;
use crate::storage::DiskLoc;

use super::cursor::{CollectionScanSpec, Cursor, QueryCtx};
use super::pattern::QueryPattern;
use super::plan::{PlanIndex, QueryPlan};
use super::ranges::FieldRangeSet;

/// Everything the plan set needs to know about the collection, snapshotted
/// under the latch.
#[derive(Debug, Clone, Default)]
pub struct PlanSource {
    pub ns: String,
    pub indexes: Vec<PlanIndex>,
    pub scan_spec: CollectionScanSpec,
}

/// One query operation being raced. Each plan gets a fresh op from the
/// factory; the runner drives `init` once and `next` repeatedly until the
/// op reports completion (or stops, or errors).
pub trait QueryOp {
    fn init(&mut self, plan: &QueryPlan, ctx: &QueryCtx) -> Result<()>;
    fn next(&mut self, ctx: &QueryCtx) -> Result<()>;
    fn complete(&self) -> bool;

    fn stop_requested(&self) -> bool {
        false
    }

    /// Whether this op's winner should be recorded in the plan cache.
    fn may_record_plan(&self) -> bool {
        true
    }

    fn nscanned(&self) -> u64;

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

pub type OpFactory<'f> = dyn Fn() -> Box<dyn QueryOp> + 'f;

/// The winning op together with the plan that produced it.
pub struct RunResult {
    pub op: Box<dyn QueryOp>,
    pub plan: QueryPlan,
}

impl std::fmt::Debug for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunResult")
            .field("op", &"<dyn QueryOp>")
            .finish()
    }
}

#[derive(Debug)]
pub struct PlanSet {
    plans: Vec<QueryPlan>,
    may_record_plan: bool,
    using_prerecorded_plan: bool,
    old_n_scanned: u64,
    best_guess_only: bool,
}

impl PlanSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &PlanSource,
        query: &Document,
        order: &Document,
        hint: Option<&Value>,
        honor_recorded_plan: bool,
        min: Option<&Document>,
        max: Option<&Document>,
        ctx: &QueryCtx,
    ) -> Result<Self> {
        let ranges = FieldRangeSet::new(&source.ns, query);
        let mut set = Self {
            plans: Vec::new(),
            may_record_plan: false,
            using_prerecorded_plan: false,
            old_n_scanned: 0,
            best_guess_only: false,
        };

        if let Some(hint) = hint {
            set.add_hint_plan(source, hint, &ranges, order)?;
            return Ok(set);
        }

        if min.is_some() || max.is_some() {
            set.add_min_max_plan(source, &ranges, order, min, max)?;
            return Ok(set);
        }

        if honor_recorded_plan {
            let pattern = QueryPattern::new(&ranges, order);
            if let Some((index_key, old_n_scanned)) = ctx.transient.index_for_pattern(&pattern) {
                if set.add_recorded_plan(source, &index_key, &ranges, order) {
                    debug!(ns = %source.ns, ?index_key, "using pre-recorded plan");
                    set.using_prerecorded_plan = true;
                    set.old_n_scanned = old_n_scanned;
                    set.may_record_plan = true;
                    return Ok(set);
                }
            }
        }

        set.add_other_plans(source, &ranges, order);
        Ok(set)
    }

    fn add_hint_plan(
        &mut self,
        source: &PlanSource,
        hint: &Value,
        ranges: &FieldRangeSet,
        order: &Document,
    ) -> Result<()> {
        let index = match hint {
            Value::Str(name) => source.indexes.iter().find(|i| i.name == *name).cloned(),
            Value::Doc(pattern) if pattern.get("$natural").is_some() => {
                self.plans.push(QueryPlan::new(
                    &source.ns,
                    None,
                    ranges,
                    order,
                    source.scan_spec.clone(),
                ));
                return Ok(());
            }
            Value::Doc(pattern) => source
                .indexes
                .iter()
                .find(|i| i.key_pattern == *pattern)
                .cloned(),
            _ => None,
        };
        let Some(index) = index else {
            return Err(eyre::Report::new(ErrorKind::BadHint(format!("{:?}", hint))));
        };
        self.plans.push(QueryPlan::new(
            &source.ns,
            Some(index),
            ranges,
            order,
            source.scan_spec.clone(),
        ));
        Ok(())
    }

    fn add_min_max_plan(
        &mut self,
        source: &PlanSource,
        ranges: &FieldRangeSet,
        order: &Document,
        min: Option<&Document>,
        max: Option<&Document>,
    ) -> Result<()> {
        let probe = min.or(max).expect("caller checked");
        let index = source
            .indexes
            .iter()
            .find(|i| {
                i.key_pattern.len() == probe.len()
                    && i.key_pattern.field_names().eq(probe.field_names())
            })
            .cloned()
            .ok_or_else(|| {
                eyre::Report::new(ErrorKind::BadHint(format!(
                    "no index matching min/max fields {:?}",
                    probe.field_names().collect::<Vec<_>>()
                )))
            })?;

        let start = bound_key(&index.key_pattern, min, Value::MinKey);
        let end = bound_key(&index.key_pattern, max, Value::MaxKey);
        self.plans.push(QueryPlan::with_bounds(
            &source.ns,
            index,
            ranges,
            order,
            source.scan_spec.clone(),
            start,
            end,
        ));
        Ok(())
    }

    /// Installs the recorded winner plus the collection-scan baseline, so a
    /// regressed recording still loses the race to the scan.
    fn add_recorded_plan(
        &mut self,
        source: &PlanSource,
        index_key: &Document,
        ranges: &FieldRangeSet,
        order: &Document,
    ) -> bool {
        if index_key.get("$natural").is_some() {
            self.plans.push(QueryPlan::new(
                &source.ns,
                None,
                ranges,
                order,
                source.scan_spec.clone(),
            ));
            return true;
        }
        let Some(index) = source
            .indexes
            .iter()
            .find(|i| i.key_pattern == *index_key)
            .cloned()
        else {
            return false;
        };
        self.plans.push(QueryPlan::new(
            &source.ns,
            Some(index),
            ranges,
            order,
            source.scan_spec.clone(),
        ));
        self.plans.push(QueryPlan::new(
            &source.ns,
            None,
            ranges,
            order,
            source.scan_spec.clone(),
        ));
        true
    }

    fn add_other_plans(&mut self, source: &PlanSource, ranges: &FieldRangeSet, order: &Document) {
        let scan = QueryPlan::new(&source.ns, None, ranges, order, source.scan_spec.clone());
        if scan.optimal() {
            self.plans.push(scan);
            return;
        }

        for index in &source.indexes {
            let plan = QueryPlan::new(
                &source.ns,
                Some(index.clone()),
                ranges,
                order,
                source.scan_spec.clone(),
            );
            if plan.optimal() {
                self.plans = vec![plan];
                return;
            }
            if !plan.unhelpful() {
                self.plans.push(plan);
            }
        }
        self.plans.push(scan);
        self.may_record_plan = self.plans.len() > 1;
    }

    pub fn n_plans(&self) -> usize {
        self.plans.len()
    }

    pub fn plans(&self) -> &[QueryPlan] {
        &self.plans
    }

    pub fn using_prerecorded_plan(&self) -> bool {
        self.using_prerecorded_plan
    }

    pub fn old_n_scanned(&self) -> u64 {
        self.old_n_scanned
    }

    pub fn set_best_guess_only(&mut self) {
        self.best_guess_only = true;
    }

    /// The plan to run when racing is not wanted: the first plan that
    /// avoids an in-memory sort, or the first plan outright.
    pub fn best_guess(&self) -> &QueryPlan {
        self.plans
            .iter()
            .find(|p| !p.scan_and_order_required())
            .unwrap_or(&self.plans[0])
    }

    /// Races one op per candidate; the first to complete wins and records
    /// itself in the plan cache.
    pub fn run_op(&self, ctx: &QueryCtx, factory: &OpFactory) -> Result<RunResult> {
        struct Raced {
            op: Box<dyn QueryOp>,
            plan_idx: usize,
            error: Option<String>,
            retired: bool,
        }

        let candidates: SmallVec<[usize; 4]> = if self.best_guess_only {
            let best = self
                .plans
                .iter()
                .enumerate()
                .find(|(_, p)| !p.scan_and_order_required())
                .map(|(i, _)| i)
                .unwrap_or(0);
            SmallVec::from_iter([best])
        } else {
            (0..self.plans.len()).collect()
        };

        let mut raced: Vec<Raced> = candidates
            .iter()
            .map(|&plan_idx| Raced {
                op: factory(),
                plan_idx,
                error: None,
                retired: false,
            })
            .collect();

        let mut winner: Option<usize> = None;
        for (i, r) in raced.iter_mut().enumerate() {
            match r.op.init(&self.plans[r.plan_idx], ctx) {
                Ok(()) => {
                    if r.op.complete() {
                        winner = Some(i);
                        break;
                    }
                }
                Err(e) => {
                    r.error = Some(e.to_string());
                    r.retired = true;
                }
            }
        }

        while winner.is_none() {
            ctx.token.check()?;
            let mut progressed = false;
            for i in 0..raced.len() {
                if raced[i].retired {
                    continue;
                }
                progressed = true;
                if let Err(e) = raced[i].op.next(ctx) {
                    raced[i].error = Some(e.to_string());
                    raced[i].retired = true;
                    continue;
                }
                if raced[i].op.complete() || raced[i].op.stop_requested() {
                    winner = Some(i);
                    break;
                }
            }
            if winner.is_none() && !progressed {
                let msg = raced
                    .iter()
                    .find_map(|r| r.error.clone())
                    .unwrap_or_else(|| "no query plan produced a result".to_string());
                bail!("{}", msg);
            }
        }

        let winner = winner.expect("loop exits with a winner");
        let plan_idx = raced[winner].plan_idx;
        let plan = self.plans[plan_idx].clone();
        let op = raced.swap_remove(winner).op;

        if self.may_record_plan && op.may_record_plan() && op.complete() {
            plan.register_self(op.nscanned(), ctx.transient);
        }
        if plan.optimal() {
            // other candidates are simply dropped; an optimal winner never
            // needs their progress
            debug!(ns = %plan.ns(), "optimal plan won the race");
        }
        Ok(RunResult { op, plan })
    }
}

fn bound_key(key_pattern: &Document, bound: Option<&Document>, fill: Value) -> IndexKey {
    let values = key_pattern
        .field_names()
        .map(|f| {
            bound
                .and_then(|b| b.get(f))
                .cloned()
                .unwrap_or_else(|| fill.clone())
        })
        .collect();
    IndexKey(values)
}

/// The standard document-fetching op: walks the plan's cursor, re-tests
/// candidates with the clause matcher, and accumulates matching documents
/// up to `num_wanted`.
pub struct FindOp {
    matcher: Matcher,
    num_wanted: usize,
    cursor: Option<Box<dyn Cursor>>,
    results: Vec<(DiskLoc, Document)>,
    n_scanned: u64,
    complete: bool,
}

impl FindOp {
    pub fn new(query: Document, num_wanted: usize) -> Self {
        Self {
            matcher: Matcher::new(query),
            num_wanted,
            cursor: None,
            results: Vec::new(),
            n_scanned: 0,
            complete: false,
        }
    }

    pub fn results(&self) -> &[(DiskLoc, Document)] {
        &self.results
    }

    pub fn into_results(self) -> Vec<(DiskLoc, Document)> {
        self.results
    }
}

impl QueryOp for FindOp {
    fn init(&mut self, plan: &QueryPlan, ctx: &QueryCtx) -> Result<()> {
        let cursor = plan.new_cursor(ctx)?;
        if !cursor.ok() {
            self.complete = true;
        }
        self.cursor = Some(cursor);
        Ok(())
    }

    fn next(&mut self, ctx: &QueryCtx) -> Result<()> {
        let Some(cursor) = self.cursor.as_mut() else {
            self.complete = true;
            return Ok(());
        };
        if !cursor.ok() {
            self.complete = true;
            return Ok(());
        }
        self.n_scanned += 1;
        let loc = cursor.curr_loc();
        if !cursor.getsetdup(loc) {
            let doc = cursor.current(ctx)?;
            if self.matcher.matches(&doc) {
                self.results.push((loc, doc));
                if self.num_wanted > 0 && self.results.len() >= self.num_wanted {
                    self.complete = true;
                    return Ok(());
                }
            }
        }
        if !cursor.advance(ctx)? {
            self.complete = true;
        }
        Ok(())
    }

    fn complete(&self) -> bool {
        self.complete
    }

    fn nscanned(&self) -> u64 {
        self.n_scanned
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
