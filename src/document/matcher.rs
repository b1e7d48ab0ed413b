//! Filter evaluation against documents.
//!
//! Supports field equality (including array containment, so a filter
//! `{tags: "red"}` matches a document whose `tags` array holds `"red"`),
//! the comparison operators `$gt`/`$gte`/`$lt`/`$lte`/`$ne`/`$in`, and the
//! top-level logical connectives `$or` and `$nor`. Index scans are not always
//! exact, so cursor consumers re-test candidate documents through a
//! [`Matcher`] carried alongside the cursor.

use std::cmp::Ordering;

use super::{Document, Value};

/// A compiled filter. Compilation is trivial today (the filter document is
/// walked on every match), but the type is the seam where covered-index
/// matching keys in: when `key_pattern` covers the filter, match against the
/// index key and skip fetching the document.
#[derive(Debug, Clone)]
pub struct Matcher {
    filter: Document,
}

impl Matcher {
    pub fn new(filter: Document) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn matches(&self, doc: &Document) -> bool {
        matches(doc, &self.filter)
    }

    /// True when every field the filter constrains appears in `key_pattern`,
    /// so the filter can be evaluated against index keys alone.
    pub fn covered_by(&self, key_pattern: &Document) -> bool {
        self.filter.iter().all(|(name, _)| {
            !name.starts_with('$') && key_pattern.get(name).is_some()
        }) && self.filter.get("$or").is_none()
            && self.filter.get("$nor").is_none()
    }
}

pub fn matches(doc: &Document, filter: &Document) -> bool {
    for (name, condition) in filter.iter() {
        match name {
            "$or" => {
                let Some(clauses) = condition.as_array() else {
                    return false;
                };
                if !clauses
                    .iter()
                    .filter_map(|c| c.as_doc())
                    .any(|clause| matches(doc, clause))
                {
                    return false;
                }
            }
            "$nor" => {
                let Some(clauses) = condition.as_array() else {
                    return false;
                };
                if clauses
                    .iter()
                    .filter_map(|c| c.as_doc())
                    .any(|clause| matches(doc, clause))
                {
                    return false;
                }
            }
            _ => {
                let field = doc.get_path(name);
                if !field_matches(field, condition) {
                    return false;
                }
            }
        }
    }
    true
}

fn field_matches(field: Option<&Value>, condition: &Value) -> bool {
    if let Some(ops) = operator_doc(condition) {
        return ops.iter().all(|(op, operand)| {
            apply_operator(field, op, operand)
        });
    }
    match field {
        Some(value) => value_eq(value, condition),
        None => matches!(condition, Value::Null),
    }
}

/// A condition document whose first field starts with `$` is an operator
/// spec rather than a literal sub-document to compare against.
fn operator_doc(condition: &Value) -> Option<&Document> {
    let doc = condition.as_doc()?;
    match doc.first_field() {
        Some((name, _)) if name.starts_with('$') => Some(doc),
        _ => None,
    }
}

fn apply_operator(field: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$ne" => !field.map(|v| value_eq(v, operand)).unwrap_or(false),
        "$in" => {
            let Some(choices) = operand.as_array() else {
                return false;
            };
            field
                .map(|v| choices.iter().any(|c| value_eq(v, c)))
                .unwrap_or(false)
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let Some(value) = field else { return false };
            compare_op(value, op, operand)
        }
        _ => false,
    }
}

fn compare_op(value: &Value, op: &str, operand: &Value) -> bool {
    let check = |v: &Value| {
        if v.canonical_type() != operand.canonical_type() {
            return false;
        }
        let ord = v.compare(operand);
        match op {
            "$gt" => ord == Ordering::Greater,
            "$gte" => ord != Ordering::Less,
            "$lt" => ord == Ordering::Less,
            "$lte" => ord != Ordering::Greater,
            _ => false,
        }
    };
    match value {
        Value::Array(elems) => elems.iter().any(check),
        single => check(single),
    }
}

/// Equality with array-containment semantics: an array field equals a
/// non-array operand when any element does.
fn value_eq(value: &Value, operand: &Value) -> bool {
    if value.compare(operand) == Ordering::Equal
        && value.canonical_type() == operand.canonical_type()
    {
        return true;
    }
    match (value, operand) {
        (Value::Array(elems), other) if !matches!(other, Value::Array(_)) => {
            elems.iter().any(|e| value_eq(e, other))
        }
        _ => false,
    }
}
