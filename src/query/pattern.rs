//! Normalized query shapes.
//!
//! Two queries with the same constrained fields, the same *kinds* of
//! constraints, and the same sort have the same [`QueryPattern`], regardless
//! of the constants involved: `{a: 1, b: {$gt: 2}}` and `{a: 9, b: {$gt: 0}}`
//! normalize identically. The pattern is the plan-cache key, so a plan that
//! won for one instantiation is reused for every query of the same shape.

use std::collections::BTreeMap;

use crate::document::{Document, Value};

use super::ranges::FieldRangeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternField {
    Equality,
    LowerBound,
    UpperBound,
    UpperAndLowerBound,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryPattern {
    fields: BTreeMap<String, PatternField>,
    sort: Vec<(String, i8)>,
}

impl QueryPattern {
    pub fn new(ranges: &FieldRangeSet, order: &Document) -> Self {
        let mut fields = BTreeMap::new();
        for field in ranges.nontrivial_fields() {
            let range = ranges.range(field);
            let kind = if range.equality() {
                PatternField::Equality
            } else {
                match (range.has_lower_bound(), range.has_upper_bound()) {
                    (true, true) => PatternField::UpperAndLowerBound,
                    (true, false) => PatternField::LowerBound,
                    (false, true) => PatternField::UpperBound,
                    // point unions and the like still pin both ends
                    (false, false) => PatternField::UpperAndLowerBound,
                }
            };
            fields.insert(field.to_string(), kind);
        }

        let sort = order
            .iter()
            .map(|(name, dir)| {
                let d = match dir {
                    Value::Int(n) if *n < 0 => -1i8,
                    Value::Double(d) if *d < 0.0 => -1i8,
                    _ => 1i8,
                };
                (name.to_string(), d)
            })
            .collect();

        Self { fields, sort }
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }
}
