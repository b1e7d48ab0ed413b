//! Per-field interval analysis of a query filter.
//!
//! A [`FieldRangeSet`] maps each constrained field to a list of disjoint,
//! sorted intervals derived from the filter: an equality pins a point, the
//! comparison operators tighten bounds, `$in` contributes a union of points.
//! Operators the analysis cannot bound (`$ne`, unrecognized specs) leave the
//! field universal; the matcher re-tests documents, so ranges only ever need
//! to be conservative over-approximations.

use hashbrown::HashMap;
use smallvec::{smallvec, SmallVec};

use crate::document::{Document, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: Value,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInterval {
    pub lower: Bound,
    pub upper: Bound,
}

impl FieldInterval {
    fn universal() -> Self {
        Self {
            lower: Bound {
                value: Value::MinKey,
                inclusive: true,
            },
            upper: Bound {
                value: Value::MaxKey,
                inclusive: true,
            },
        }
    }

    fn point(v: Value) -> Self {
        Self {
            lower: Bound {
                value: v.clone(),
                inclusive: true,
            },
            upper: Bound {
                value: v,
                inclusive: true,
            },
        }
    }

    pub fn is_point(&self) -> bool {
        self.lower.inclusive
            && self.upper.inclusive
            && self.lower.value.compare(&self.upper.value) == std::cmp::Ordering::Equal
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRange {
    intervals: SmallVec<[FieldInterval; 1]>,
}

impl FieldRange {
    fn universal() -> Self {
        Self {
            intervals: smallvec![FieldInterval::universal()],
        }
    }

    /// The full key space: nothing is known about the field.
    pub fn universal_range(&self) -> bool {
        self.intervals.len() == 1
            && self.intervals[0].lower.value == Value::MinKey
            && self.intervals[0].upper.value == Value::MaxKey
    }

    /// A single pinned point.
    pub fn equality(&self) -> bool {
        self.intervals.len() == 1 && self.intervals[0].is_point()
    }

    pub fn nontrivial(&self) -> bool {
        !self.universal_range()
    }

    pub fn intervals(&self) -> &[FieldInterval] {
        &self.intervals
    }

    pub fn min(&self) -> &Bound {
        &self.intervals.first().expect("non-empty range").lower
    }

    pub fn max(&self) -> &Bound {
        &self.intervals.last().expect("non-empty range").upper
    }

    pub fn has_lower_bound(&self) -> bool {
        self.min().value != Value::MinKey
    }

    pub fn has_upper_bound(&self) -> bool {
        self.max().value != Value::MaxKey
    }

    fn from_condition(condition: &Value) -> Self {
        if let Some(ops) = operator_doc(condition) {
            let mut lower = Bound {
                value: Value::MinKey,
                inclusive: true,
            };
            let mut upper = Bound {
                value: Value::MaxKey,
                inclusive: true,
            };
            let mut points: Option<Vec<Value>> = None;
            for (op, operand) in ops.iter() {
                match op {
                    "$gt" => {
                        lower = Bound {
                            value: operand.clone(),
                            inclusive: false,
                        }
                    }
                    "$gte" => {
                        lower = Bound {
                            value: operand.clone(),
                            inclusive: true,
                        }
                    }
                    "$lt" => {
                        upper = Bound {
                            value: operand.clone(),
                            inclusive: false,
                        }
                    }
                    "$lte" => {
                        upper = Bound {
                            value: operand.clone(),
                            inclusive: true,
                        }
                    }
                    "$in" => {
                        if let Some(choices) = operand.as_array() {
                            points = Some(choices.to_vec());
                        }
                    }
                    // $ne and friends cannot narrow an index range
                    _ => return Self::universal(),
                }
            }
            if let Some(mut points) = points {
                points.sort_by(|a, b| a.compare(b));
                points.dedup_by(|a, b| a.compare(b) == std::cmp::Ordering::Equal);
                return Self {
                    intervals: points.into_iter().map(FieldInterval::point).collect(),
                };
            }
            // a contradictory interval is kept as-is; the scan layer treats
            // an inverted range as selecting nothing
            let interval = FieldInterval { lower, upper };
            return Self {
                intervals: smallvec![interval],
            };
        }
        Self {
            intervals: smallvec![FieldInterval::point(condition.clone())],
        }
    }
}

/// A condition whose first field starts with `$` is an operator spec.
fn operator_doc(condition: &Value) -> Option<&Document> {
    let doc = condition.as_doc()?;
    match doc.first_field() {
        Some((name, _)) if name.starts_with('$') => Some(doc),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct FieldRangeSet {
    ns: String,
    query: Document,
    ranges: HashMap<String, FieldRange>,
    universal: FieldRange,
}

impl FieldRangeSet {
    pub fn new(ns: &str, query: &Document) -> Self {
        let mut ranges = HashMap::new();
        for (name, condition) in query.iter() {
            if name == "$or" {
                // a one-clause $or is a plain conjunction; the disjunction
                // scanner rewrites queries into exactly this shape
                if let Some([clause]) = condition.as_array() {
                    if let Some(clause) = clause.as_doc() {
                        for (name, condition) in clause.iter() {
                            if !name.starts_with('$') {
                                ranges.insert(
                                    name.to_string(),
                                    FieldRange::from_condition(condition),
                                );
                            }
                        }
                    }
                }
                continue;
            }
            if name.starts_with('$') {
                continue;
            }
            ranges.insert(name.to_string(), FieldRange::from_condition(condition));
        }
        Self {
            ns: ns.to_string(),
            query: query.clone(),
            ranges,
            universal: FieldRange::universal(),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn query(&self) -> &Document {
        &self.query
    }

    pub fn range(&self, field: &str) -> &FieldRange {
        self.ranges.get(field).unwrap_or(&self.universal)
    }

    pub fn n_nontrivial_ranges(&self) -> usize {
        self.ranges.values().filter(|r| r.nontrivial()).count()
    }

    pub fn nontrivial_fields(&self) -> impl Iterator<Item = &str> {
        self.ranges
            .iter()
            .filter(|(_, r)| r.nontrivial())
            .map(|(k, _)| k.as_str())
    }

    /// True when some indexed field could narrow this query.
    pub fn matches_index_field(&self, key_pattern: &Document) -> bool {
        key_pattern
            .iter()
            .any(|(field, _)| self.range(field).nontrivial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn equality_produces_a_point() {
        let set = FieldRangeSet::new("acme.orders", &doc! { "a" => 4 });
        let r = set.range("a");
        assert!(r.equality());
        assert!(r.nontrivial());
        assert_eq!(r.min().value, Value::Int(4));
        assert_eq!(r.max().value, Value::Int(4));
    }

    #[test]
    fn unconstrained_field_is_universal() {
        let set = FieldRangeSet::new("acme.orders", &doc! { "a" => 4 });
        let r = set.range("zzz");
        assert!(r.universal_range());
        assert!(!r.equality());
        assert_eq!(set.n_nontrivial_ranges(), 1);
    }

    #[test]
    fn comparison_operators_combine() {
        let set = FieldRangeSet::new(
            "acme.orders",
            &doc! { "n" => doc! { "$gte" => 3, "$lt" => 9 } },
        );
        let r = set.range("n");
        assert!(!r.equality());
        assert!(r.nontrivial());
        assert_eq!(r.min().value, Value::Int(3));
        assert!(r.min().inclusive);
        assert_eq!(r.max().value, Value::Int(9));
        assert!(!r.max().inclusive);
        assert!(r.has_lower_bound());
        assert!(r.has_upper_bound());
    }

    #[test]
    fn in_builds_sorted_point_union() {
        let set = FieldRangeSet::new(
            "acme.orders",
            &doc! { "n" => doc! { "$in" => vec![Value::Int(7), Value::Int(2), Value::Int(7)] } },
        );
        let r = set.range("n");
        assert_eq!(r.intervals().len(), 2);
        assert_eq!(r.intervals()[0].lower.value, Value::Int(2));
        assert_eq!(r.intervals()[1].lower.value, Value::Int(7));
        assert!(r.intervals().iter().all(|i| i.is_point()));
    }

    #[test]
    fn ne_leaves_the_field_universal() {
        let set = FieldRangeSet::new("acme.orders", &doc! { "n" => doc! { "$ne" => 4 } });
        assert!(set.range("n").universal_range());
        assert_eq!(set.n_nontrivial_ranges(), 0);
    }

    #[test]
    fn multi_clause_or_and_nor_are_skipped() {
        let set = FieldRangeSet::new(
            "acme.orders",
            &doc! {
                "$or" => vec![Value::Doc(doc! { "a" => 1 }), Value::Doc(doc! { "c" => 2 })],
                "$nor" => vec![Value::Doc(doc! { "d" => 3 })],
                "b" => 2,
            },
        );
        assert_eq!(set.n_nontrivial_ranges(), 1);
        assert!(set.range("b").equality());
        assert!(set.range("a").universal_range());
    }

    #[test]
    fn single_clause_or_contributes_ranges() {
        // the rewritten per-clause query shape: {$or: [clause], $nor: [...]}
        let set = FieldRangeSet::new(
            "acme.orders",
            &doc! {
                "live" => true,
                "$or" => vec![Value::Doc(doc! { "a" => doc! { "$gt" => 5 } })],
                "$nor" => vec![Value::Doc(doc! { "b" => 2 })],
            },
        );
        assert_eq!(set.n_nontrivial_ranges(), 2);
        assert!(set.range("a").has_lower_bound());
        assert!(set.range("live").equality());
        assert!(set.range("b").universal_range());
    }

    #[test]
    fn matches_index_field_checks_pattern_overlap() {
        let set = FieldRangeSet::new("acme.orders", &doc! { "a" => 1 });
        assert!(set.matches_index_field(&doc! { "a" => 1 }));
        assert!(set.matches_index_field(&doc! { "b" => 1, "a" => 1 }));
        assert!(!set.matches_index_field(&doc! { "b" => 1 }));
    }
}
