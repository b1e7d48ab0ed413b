//! # Index Access Layer
//!
//! Ordered key stores for built indexes. Descriptors and spec documents are
//! durable (catalog slots and `<db>.system.indexes` records); the key stores
//! themselves are transient and rebuilt from a collection scan on database
//! open, which keeps the core free of on-disk tree management.
//!
//! Keys are vectors of document values in key-pattern field order, compared
//! with the canonical cross-type ordering. A document with an array in an
//! indexed field contributes one key per element — a *multikey* insertion,
//! which the caller records in the namespace record's multikey bitmap so
//! cursors know to deduplicate.

use std::collections::BTreeMap;
use std::ops::Bound as RangeBound;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::document::{Document, Value};
use crate::storage::DiskLoc;

/// An index key: the indexed values in key-pattern order.
#[derive(Debug, Clone)]
pub struct IndexKey(pub SmallVec<[Value; 2]>);

impl IndexKey {
    pub fn single(v: Value) -> Self {
        Self(SmallVec::from_iter([v]))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.compare(b);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A compiled index spec, parsed once from the descriptor's `info` document
/// and cached in the transient layer.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub ns: String,
    pub key_pattern: Document,
    pub unique: bool,
}

impl IndexSpec {
    pub fn from_info(info: &Document) -> Result<Self> {
        let name = info
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre::eyre!("index spec missing 'name'"))?
            .to_string();
        let ns = info
            .get("ns")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre::eyre!("index spec missing 'ns'"))?
            .to_string();
        let key_pattern = info
            .get("key")
            .and_then(Value::as_doc)
            .ok_or_else(|| eyre::eyre!("index spec missing 'key'"))?
            .clone();
        ensure!(!key_pattern.is_empty(), "index key pattern is empty");
        let unique = matches!(info.get("unique"), Some(Value::Bool(true)));
        Ok(Self {
            name,
            ns,
            key_pattern,
            unique,
        })
    }

    pub fn to_info(&self) -> Document {
        let mut doc = Document::new();
        doc.set("name", self.name.as_str());
        doc.set("ns", self.ns.as_str());
        doc.set("key", self.key_pattern.clone());
        if self.unique {
            doc.set("unique", true);
        }
        doc
    }

    pub fn is_id_index(&self) -> bool {
        self.key_pattern.len() == 1 && self.key_pattern.get("_id").is_some()
    }

    /// All field names this index contributes to the transient index-key
    /// set, including non-leading compound components.
    pub fn key_fields(&self) -> impl Iterator<Item = &str> {
        self.key_pattern.field_names()
    }
}

/// Keys a document contributes to an index with `key_pattern`. The second
/// element reports whether the insertion is multikey.
pub fn extract_keys(doc: &Document, key_pattern: &Document) -> (Vec<IndexKey>, bool) {
    let values: Vec<&str> = key_pattern.field_names().collect();
    let mut base: SmallVec<[Value; 2]> = SmallVec::new();
    let mut array_at: Option<(usize, Vec<Value>)> = None;

    for (i, field) in values.iter().enumerate() {
        match doc.get_path(field) {
            Some(Value::Array(elems)) if array_at.is_none() => {
                array_at = Some((i, elems.clone()));
                base.push(Value::Null); // placeholder
            }
            Some(v) => base.push(v.clone()),
            None => base.push(Value::Null),
        }
    }

    match array_at {
        Some((i, elems)) if !elems.is_empty() => {
            let keys = elems
                .into_iter()
                .map(|e| {
                    let mut k = base.clone();
                    k[i] = e;
                    IndexKey(k)
                })
                .collect();
            (keys, true)
        }
        Some((i, _empty)) => {
            base[i] = Value::Null;
            (vec![IndexKey(base)], true)
        }
        None => (vec![IndexKey(base)], false),
    }
}

type Entries = BTreeMap<IndexKey, SmallVec<[DiskLoc; 1]>>;

/// All key stores of one database, keyed by `(namespace, index name)`.
#[derive(Debug, Default)]
pub struct IndexStore {
    trees: HashMap<(String, String), Entries>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, ns: &str, name: &str) {
        self.trees
            .entry((ns.to_string(), name.to_string()))
            .or_default();
    }

    pub fn drop_index(&mut self, ns: &str, name: &str) {
        self.trees.remove(&(ns.to_string(), name.to_string()));
    }

    pub fn drop_ns(&mut self, ns: &str) {
        self.trees.retain(|(tree_ns, _), _| tree_ns != ns);
    }

    pub fn rename_ns(&mut self, old: &str, new: &str) {
        let moved: Vec<_> = self
            .trees
            .extract_if(|(tree_ns, _), _| tree_ns == old)
            .collect();
        for ((_, name), entries) in moved {
            self.trees.insert((new.to_string(), name), entries);
        }
    }

    fn tree(&self, ns: &str, name: &str) -> Option<&Entries> {
        self.trees.get(&(ns.to_string(), name.to_string()))
    }

    pub fn insert(&mut self, ns: &str, name: &str, keys: &[IndexKey], loc: DiskLoc) -> Result<()> {
        let tree = self
            .trees
            .get_mut(&(ns.to_string(), name.to_string()))
            .ok_or_else(|| eyre::eyre!("no key store for index {} on {}", name, ns))?;
        for key in keys {
            let locs = tree.entry(key.clone()).or_default();
            if !locs.contains(&loc) {
                locs.push(loc);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, ns: &str, name: &str, keys: &[IndexKey], loc: DiskLoc) {
        if let Some(tree) = self.trees.get_mut(&(ns.to_string(), name.to_string())) {
            for key in keys {
                if let Some(locs) = tree.get_mut(key) {
                    locs.retain(|l| *l != loc);
                    if locs.is_empty() {
                        tree.remove(key);
                    }
                }
            }
        }
    }

    /// True when `keys` would collide with an existing entry (unique-index
    /// enforcement).
    pub fn would_conflict(&self, ns: &str, name: &str, keys: &[IndexKey]) -> bool {
        match self.tree(ns, name) {
            Some(tree) => keys.iter().any(|k| tree.contains_key(k)),
            None => false,
        }
    }

    /// Entries in `[start, end]` (end inclusive or exclusive), in key order;
    /// reversed when `reverse` is set. Materialized: index cursors operate
    /// on a snapshot.
    pub fn range_scan(
        &self,
        ns: &str,
        name: &str,
        start: &IndexKey,
        end: &IndexKey,
        end_inclusive: bool,
        reverse: bool,
    ) -> Vec<(IndexKey, DiskLoc)> {
        let Some(tree) = self.tree(ns, name) else {
            return Vec::new();
        };
        if start > end {
            // contradictory bounds select nothing
            return Vec::new();
        }
        let upper = if end_inclusive {
            RangeBound::Included(end.clone())
        } else {
            RangeBound::Excluded(end.clone())
        };
        let mut out: Vec<(IndexKey, DiskLoc)> = tree
            .range((RangeBound::Included(start.clone()), upper))
            .flat_map(|(k, locs)| locs.iter().map(move |l| (k.clone(), *l)))
            .collect();
        if reverse {
            out.reverse();
        }
        out
    }

    pub fn n_entries(&self, ns: &str, name: &str) -> usize {
        self.tree(ns, name)
            .map(|t| t.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn index_key_orders_across_types() {
        let a = IndexKey::single(Value::Int(5));
        let b = IndexKey::single(Value::Str("x".into()));
        assert!(a < b);
        assert_eq!(
            IndexKey::single(Value::Int(2)),
            IndexKey::single(Value::Double(2.0))
        );
    }

    #[test]
    fn spec_round_trips_through_info_document() {
        let spec = IndexSpec {
            name: "a_1".into(),
            ns: "acme.orders".into(),
            key_pattern: doc! { "a" => 1 },
            unique: true,
        };
        let parsed = IndexSpec::from_info(&spec.to_info()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn id_index_is_recognized_by_pattern() {
        let spec = IndexSpec {
            name: "_id_".into(),
            ns: "acme.orders".into(),
            key_pattern: doc! { "_id" => 1 },
            unique: true,
        };
        assert!(spec.is_id_index());

        let other = IndexSpec {
            name: "a_1".into(),
            ns: "acme.orders".into(),
            key_pattern: doc! { "a" => 1 },
            unique: false,
        };
        assert!(!other.is_id_index());
    }

    #[test]
    fn extract_keys_scalar_and_missing() {
        let (keys, multikey) =
            extract_keys(&doc! { "a" => 3, "b" => "x" }, &doc! { "a" => 1, "b" => 1 });
        assert!(!multikey);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0.as_slice(), &[Value::Int(3), Value::Str("x".into())]);

        let (keys, _) = extract_keys(&doc! { "a" => 3 }, &doc! { "missing" => 1 });
        assert_eq!(keys[0].0.as_slice(), &[Value::Null]);
    }

    #[test]
    fn extract_keys_expands_arrays() {
        let d = doc! { "tags" => vec![Value::Str("x".into()), Value::Str("y".into())], "n" => 1 };
        let (keys, multikey) = extract_keys(&d, &doc! { "tags" => 1, "n" => 1 });
        assert!(multikey);
        assert_eq!(keys.len(), 2);
        assert_eq!(
            keys[0].0.as_slice(),
            &[Value::Str("x".into()), Value::Int(1)]
        );
        assert_eq!(
            keys[1].0.as_slice(),
            &[Value::Str("y".into()), Value::Int(1)]
        );
    }

    #[test]
    fn insert_scan_remove_round_trip() {
        let mut store = IndexStore::new();
        store.create("acme.orders", "a_1");
        let l1 = DiskLoc::new(0, 100);
        let l2 = DiskLoc::new(0, 200);

        store
            .insert("acme.orders", "a_1", &[IndexKey::single(Value::Int(1))], l1)
            .unwrap();
        store
            .insert("acme.orders", "a_1", &[IndexKey::single(Value::Int(2))], l2)
            .unwrap();

        let all = store.range_scan(
            "acme.orders",
            "a_1",
            &IndexKey::single(Value::MinKey),
            &IndexKey::single(Value::MaxKey),
            true,
            false,
        );
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1, l1);

        let rev = store.range_scan(
            "acme.orders",
            "a_1",
            &IndexKey::single(Value::MinKey),
            &IndexKey::single(Value::MaxKey),
            true,
            true,
        );
        assert_eq!(rev[0].1, l2);

        store.remove("acme.orders", "a_1", &[IndexKey::single(Value::Int(1))], l1);
        assert_eq!(store.n_entries("acme.orders", "a_1"), 1);
    }

    #[test]
    fn unique_conflict_detection() {
        let mut store = IndexStore::new();
        store.create("acme.orders", "a_1");
        let key = IndexKey::single(Value::Int(7));
        store
            .insert("acme.orders", "a_1", &[key.clone()], DiskLoc::new(0, 100))
            .unwrap();

        assert!(store.would_conflict("acme.orders", "a_1", &[key]));
        assert!(!store.would_conflict(
            "acme.orders",
            "a_1",
            &[IndexKey::single(Value::Int(8))]
        ));
    }

    #[test]
    fn rename_moves_every_tree() {
        let mut store = IndexStore::new();
        store.create("acme.orders", "a_1");
        store.create("acme.orders", "b_1");
        store
            .insert(
                "acme.orders",
                "a_1",
                &[IndexKey::single(Value::Int(1))],
                DiskLoc::new(0, 100),
            )
            .unwrap();

        store.rename_ns("acme.orders", "acme.renamed");

        assert_eq!(store.n_entries("acme.renamed", "a_1"), 1);
        assert_eq!(store.n_entries("acme.orders", "a_1"), 0);
    }
}
