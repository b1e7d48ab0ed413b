//! Disjunction handling: one plan set per `$or` clause, processed in
//! sequence, plus the cursor facade that stitches the clauses together.
//!
//! Clause *i* runs a rewritten query: the *i*-th `$or` clause becomes the
//! positive filter, and every earlier clause is appended to the query's
//! `$nor` list. A document matching several clauses is therefore yielded
//! exactly once — by the first clause that reaches it — at the cost of a
//! negative filter that grows with the clause index. Each clause's winning
//! plan is cached independently under the rewritten query's pattern.

use eyre::{ensure, Result};
use hashbrown::HashSet;

use crate::document::matcher::Matcher;
use crate::document::{Document, Value};
use crate::index::IndexKey;
use crate::storage::DiskLoc;

use super::cursor::{Cursor, QueryCtx};
use super::plan_set::{OpFactory, PlanSet, PlanSource, QueryOp, RunResult};
use super::plan::QueryPlan;

pub struct MultiPlanScanner {
    source: PlanSource,
    query: Document,
    order: Document,
    hint: Option<Value>,
    honor_recorded_plan: bool,
    best_guess_only: bool,
    or_clauses: Vec<Document>,
    i: usize,
    current: Option<PlanSet>,
}

impl MultiPlanScanner {
    pub fn new(
        source: PlanSource,
        query: Document,
        order: Document,
        hint: Option<Value>,
        honor_recorded_plan: bool,
    ) -> Result<Self> {
        let mut or_clauses = Vec::new();
        if let Some(or) = query.get("$or") {
            let clauses = or
                .as_array()
                .ok_or_else(|| eyre::eyre!("$or requires an array"))?;
            ensure!(!clauses.is_empty(), "$or requires a nonempty array");
            for clause in clauses {
                let doc = clause
                    .as_doc()
                    .ok_or_else(|| eyre::eyre!("$or elements must be documents"))?;
                or_clauses.push(doc.clone());
            }
        }
        Ok(Self {
            source,
            query,
            order,
            hint,
            honor_recorded_plan,
            best_guess_only: false,
            or_clauses,
            i: 0,
            current: None,
        })
    }

    pub fn is_or_query(&self) -> bool {
        !self.or_clauses.is_empty()
    }

    pub fn n_clauses(&self) -> usize {
        self.or_clauses.len().max(1)
    }

    pub fn may_run_more(&self) -> bool {
        self.i < self.n_clauses()
    }

    pub fn set_best_guess_only(&mut self) {
        self.best_guess_only = true;
    }

    /// Only meaningful for plain queries; an `$or` query runs one plan set
    /// per clause.
    pub fn using_prerecorded_plan(&self) -> bool {
        !self.is_or_query()
            && self
                .current
                .as_ref()
                .map(|s| s.using_prerecorded_plan())
                .unwrap_or(false)
    }

    /// The query the next clause will run: clause `i` positive, clauses
    /// `0..i` folded into `$nor`.
    fn next_clause_query(&self) -> Document {
        if !self.is_or_query() {
            return self.query.clone();
        }
        let mut rewritten = Document::new();
        let mut nor: Vec<Value> = Vec::new();
        for (name, value) in self.query.iter() {
            match name {
                "$nor" => {
                    if let Some(existing) = value.as_array() {
                        nor.extend(existing.iter().cloned());
                    }
                }
                "$or" => {
                    rewritten.set(
                        "$or",
                        vec![Value::Doc(self.or_clauses[self.i].clone())],
                    );
                }
                _ => rewritten.set(name, value.clone()),
            }
        }
        nor.extend(
            self.or_clauses[..self.i]
                .iter()
                .map(|c| Value::Doc(c.clone())),
        );
        if !nor.is_empty() {
            rewritten.set("$nor", nor);
        }
        rewritten
    }

    /// Runs the next clause's plan set to completion and advances the
    /// clause counter.
    pub fn run_op_once(&mut self, ctx: &QueryCtx, factory: &OpFactory) -> Result<RunResult> {
        ensure!(self.may_run_more(), "no more clauses to run");
        let clause_query = self.next_clause_query();
        self.i += 1;

        let mut set = PlanSet::new(
            &self.source,
            &clause_query,
            &self.order,
            self.hint.as_ref(),
            self.honor_recorded_plan,
            None,
            None,
            ctx,
        )?;
        if self.best_guess_only {
            set.set_best_guess_only();
        }
        let result = set.run_op(ctx, factory);
        self.current = Some(set);
        result
    }

    /// Drives every remaining clause; the last clause's winner is returned.
    /// Callers that aggregate across clauses drive `run_op_once` themselves
    /// (each clause gets a fresh op from the factory).
    pub fn run_op(&mut self, ctx: &QueryCtx, factory: &OpFactory) -> Result<RunResult> {
        let mut result = self.run_op_once(ctx, factory)?;
        while self.may_run_more() {
            result = self.run_op_once(ctx, factory)?;
        }
        Ok(result)
    }

    /// The clause query the scanner would run next; exposed for callers
    /// that need the clause's matcher.
    pub fn clause_query_preview(&self) -> Document {
        self.next_clause_query()
    }
}

/// A query op that selects a plan without consuming it: it completes at
/// `init`, so the best-guess plan wins immediately and the caller builds a
/// cursor from the winning plan.
#[derive(Default)]
struct CursorOp {
    complete: bool,
}

impl QueryOp for CursorOp {
    fn init(&mut self, _plan: &QueryPlan, _ctx: &QueryCtx) -> Result<()> {
        self.complete = true;
        Ok(())
    }

    fn next(&mut self, _ctx: &QueryCtx) -> Result<()> {
        Ok(())
    }

    fn complete(&self) -> bool {
        self.complete
    }

    fn may_record_plan(&self) -> bool {
        false
    }

    fn nscanned(&self) -> u64 {
        0
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

/// Cursor facade over the multi-plan scanner: forward iteration across all
/// clauses, switching per-clause cursors transparently. The matcher for the
/// current clause rides along; index coverage is not always exact, so
/// callers re-test documents against it.
pub struct MultiCursor {
    scanner: MultiPlanScanner,
    cursor: Option<Box<dyn Cursor>>,
    matcher: Matcher,
    seen: HashSet<DiskLoc>,
}

impl MultiCursor {
    pub fn new(mut scanner: MultiPlanScanner, ctx: &QueryCtx) -> Result<Self> {
        scanner.set_best_guess_only();
        let mut mc = Self {
            matcher: Matcher::new(scanner.query.clone()),
            scanner,
            cursor: None,
            seen: HashSet::new(),
        };
        if mc.scanner.may_run_more() {
            mc.next_clause(ctx)?;
            while !mc.ok() && mc.scanner.may_run_more() {
                mc.next_clause(ctx)?;
            }
        }
        Ok(mc)
    }

    fn next_clause(&mut self, ctx: &QueryCtx) -> Result<()> {
        let clause_query = self.scanner.clause_query_preview();
        let RunResult { plan, .. } = self
            .scanner
            .run_op_once(ctx, &|| Box::new(CursorOp::default()))?;
        self.cursor = Some(plan.new_cursor(ctx)?);
        self.matcher = Matcher::new(clause_query);
        Ok(())
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }
}

impl Cursor for MultiCursor {
    fn ok(&self) -> bool {
        self.cursor.as_ref().map(|c| c.ok()).unwrap_or(false)
    }

    fn advance(&mut self, ctx: &QueryCtx) -> Result<bool> {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.advance(ctx)?;
        }
        while !self.ok() && self.scanner.may_run_more() {
            self.next_clause(ctx)?;
        }
        Ok(self.ok())
    }

    fn curr_loc(&self) -> DiskLoc {
        self.cursor.as_ref().expect("cursor is ok").curr_loc()
    }

    fn curr_key(&self) -> Option<&IndexKey> {
        self.cursor.as_ref().and_then(|c| c.curr_key())
    }

    fn note_location(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.note_location();
        }
    }

    fn check_location(&mut self, ctx: &QueryCtx) -> Result<()> {
        let had_cursor = match self.cursor.as_mut() {
            Some(cursor) => {
                cursor.check_location(ctx)?;
                true
            }
            None => false,
        };
        if had_cursor && !self.ok() {
            self.advance(ctx)?;
        }
        Ok(())
    }

    fn getsetdup(&mut self, loc: DiskLoc) -> bool {
        let inner = self
            .cursor
            .as_mut()
            .map(|c| c.getsetdup(loc))
            .unwrap_or(false);
        // clause switches reset per-cursor state; the facade keeps its own
        // memory so update-style callers never see a location twice
        inner || !self.seen.insert(loc)
    }

    fn index_key_pattern(&self) -> Document {
        self.cursor
            .as_ref()
            .map(|c| c.index_key_pattern())
            .unwrap_or_default()
    }
}
