//! # Document Model
//!
//! An insertion-ordered document value type used for stored documents, query
//! filters, sort orders, and index key patterns. Field order is significant
//! (a key pattern `{a: 1, b: -1}` is not `{b: -1, a: 1}`), so fields live in
//! a plain vector rather than a map.
//!
//! ## Value ordering
//!
//! Values of different types are ordered by a canonical type rank so index
//! keys have a total order across types:
//!
//! ```text
//! MinKey < Null < numbers < strings < documents < arrays < booleans < MaxKey
//! ```
//!
//! Integers and doubles compare numerically against each other. `MinKey` and
//! `MaxKey` exist to express open index bounds.

mod encode;
pub mod matcher;

pub use encode::{decode_document, encode_document, encoded_len};

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    MinKey,
    Null,
    Int(i64),
    Double(f64),
    Str(String),
    Doc(Document),
    Array(Vec<Value>),
    Bool(bool),
    MaxKey,
}

impl Value {
    /// Rank used for cross-type comparisons.
    pub fn canonical_type(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Null => 1,
            Value::Int(_) | Value::Double(_) => 2,
            Value::Str(_) => 3,
            Value::Doc(_) => 4,
            Value::Array(_) => 5,
            Value::Bool(_) => 6,
            Value::MaxKey => 7,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_doc(&self) -> Option<&Document> {
        match self {
            Value::Doc(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Total order over values; the basis of index key comparison.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (ta, tb) = (self.canonical_type(), other.canonical_type());
        if ta != tb {
            return ta.cmp(&tb);
        }
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Double(b)) => cmp_f64(*a as f64, *b),
            (Value::Double(a), Value::Int(b)) => cmp_f64(*a, *b as f64),
            (Value::Double(a), Value::Double(b)) => cmp_f64(*a, *b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Doc(a), Value::Doc(b)) => a.compare(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Doc(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Appends a field, replacing an existing one with the same name in
    /// place (field order of the first occurrence wins).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Resolves a dotted path (`a.b.c`) through nested documents.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let value = current.get(part)?;
            if parts.peek().is_none() {
                return Some(value);
            }
            current = value.as_doc()?;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn first_field(&self) -> Option<(&str, &Value)> {
        self.fields.first().map(|(k, v)| (k.as_str(), v))
    }

    /// Field-order-sensitive comparison (used for key pattern equality and
    /// array-of-document ordering).
    pub fn compare(&self, other: &Document) -> Ordering {
        for ((ka, va), (kb, vb)) in self.fields.iter().zip(other.fields.iter()) {
            let ord = ka.cmp(kb);
            if ord != Ordering::Equal {
                return ord;
            }
            let ord = va.compare(vb);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {:?}", k, v)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.set(k, v);
        }
        doc
    }
}

/// Builds a [`Document`] with fields in the written order.
///
/// ```ignore
/// let filter = doc! { "a" => 1, "b" => doc! { "$gt" => 5 } };
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::document::Document::new() };
    ( $($key:expr => $val:expr),+ $(,)? ) => {{
        let mut d = $crate::document::Document::new();
        $( d.set($key, $val); )+
        d
    }};
}
