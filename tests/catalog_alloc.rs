//! # Catalog and Allocator Integration Tests
//!
//! End-to-end behavior of the namespace catalog and the record allocator
//! through the public `Db` facade: stats accounting, the capped ring,
//! the capped-delete guard, and overflow index slots across a rename.

use mangrove::{doc, CollectionOptions, Config, Db, Document, ErrorKind, Value};

fn open_db() -> Db {
    let dir = tempfile::tempdir().unwrap().keep();
    let config = Config::builder(dir)
        .ns_size_mb(1)
        .initial_extent_size(0x2000)
        .data_file_size(1024 * 1024)
        .build();
    Db::open(config).unwrap()
}

/// A document whose encoding is exactly `size` bytes.
fn doc_of_size(tag: &str, size: usize) -> Document {
    // {"tag": tag, "pad": "x" * n} encodes to 24 + tag.len() + n bytes
    let overhead = 24 + tag.len();
    assert!(size > overhead, "size {} too small", size);
    doc! { "tag" => tag, "pad" => "x".repeat(size - overhead) }
}

#[test]
fn document_sizer_is_exact() {
    use mangrove::document::encode_document;
    assert_eq!(encode_document(&doc_of_size("A", 100)).len(), 100);
    assert_eq!(encode_document(&doc_of_size("ev", 112)).len(), 112);
}

/// Ten 100-byte inserts: record counts and data size track the documents,
/// and the padding factor stays floored at 1.0.
#[test]
fn stats_track_inserts_and_padding_stays_floored() {
    let db = open_db();
    db.create_collection("acme.orders", CollectionOptions::default())
        .unwrap();

    for i in 0..10 {
        db.insert("acme.orders", &doc_of_size(&format!("d{}", i), 100))
            .unwrap();
    }

    let (n_records, data_size, padding) = db.stats("acme.orders").unwrap().unwrap();
    assert_eq!(n_records, 10);
    assert_eq!(data_size, 1000);
    assert_eq!(padding, 1.0);
}

/// A capped collection sized for three records receives five; a forward
/// scan yields exactly the last three, oldest first.
#[test]
fn capped_ring_keeps_the_newest_three() {
    let db = open_db();
    db.create_collection(
        "acme.events",
        CollectionOptions {
            capped: true,
            size_bytes: 3 * 256,
            extent_size: Some(256),
            max_docs: 0,
        },
    )
    .unwrap();

    for tag in ["A", "B", "C", "D", "E"] {
        // each record quantizes to 128 bytes: one per 256-byte extent
        db.insert("acme.events", &doc_of_size(tag, 100)).unwrap();
    }

    let docs = db.find("acme.events", &doc! {}, &doc! {}, 0).unwrap();
    let tags: Vec<&str> = docs
        .iter()
        .map(|d| d.get("tag").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(tags, vec!["C", "D", "E"]);

    let (n_records, _, _) = db.stats("acme.events").unwrap().unwrap();
    assert_eq!(n_records, 3);
}

/// `max_docs = 3` with four inserts retains exactly the last three.
#[test]
fn capped_max_docs_bounds_the_count() {
    let db = open_db();
    db.create_collection(
        "acme.events",
        CollectionOptions {
            capped: true,
            size_bytes: 4096,
            extent_size: Some(4096),
            max_docs: 3,
        },
    )
    .unwrap();

    for tag in ["A", "B", "C", "D"] {
        db.insert("acme.events", &doc_of_size(tag, 100)).unwrap();
    }

    let docs = db.find("acme.events", &doc! {}, &doc! {}, 0).unwrap();
    let tags: Vec<&str> = docs
        .iter()
        .map(|d| d.get("tag").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(tags, vec!["B", "C", "D"]);
}

/// With the capped-delete guard set (cursors active), an allocation that
/// would have to evict fails with `CappedFull` instead of clobbering data.
#[test]
fn capped_disallow_delete_surfaces_capped_full() {
    let db = open_db();
    db.create_collection(
        "acme.events",
        CollectionOptions {
            capped: true,
            size_bytes: 2 * 256,
            extent_size: Some(256),
            max_docs: 0,
        },
    )
    .unwrap();

    db.insert("acme.events", &doc_of_size("A", 100)).unwrap();
    db.insert("acme.events", &doc_of_size("B", 100)).unwrap();

    db.set_capped_disallow_delete("acme.events", true).unwrap();
    let err = db
        .insert("acme.events", &doc_of_size("C", 100))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ErrorKind>(),
        Some(&ErrorKind::CappedFull)
    );

    // data under the cursor is intact, and clearing the guard resumes
    db.set_capped_disallow_delete("acme.events", false).unwrap();
    db.insert("acme.events", &doc_of_size("C", 100)).unwrap();
    let docs = db.find("acme.events", &doc! {}, &doc! {}, 0).unwrap();
    assert_eq!(docs.len(), 2);
}

/// Removing from a capped collection is refused outright.
#[test]
fn capped_collections_refuse_remove() {
    let db = open_db();
    db.create_collection("acme.events", CollectionOptions::capped(4096))
        .unwrap();
    db.insert("acme.events", &doc_of_size("A", 100)).unwrap();

    let err = db.remove("acme.events", &doc! {}, false).unwrap_err();
    assert!(err.to_string().contains("capped"));
}

/// The eleventh index lands in an overflow record, and a rename re-resolves
/// the overflow chain against the new namespace record.
#[test]
fn overflow_index_slots_survive_rename() {
    let db = open_db();
    db.insert("acme.orders", &doc! { "f0" => 1 }).unwrap();

    for i in 0..12 {
        let field = format!("f{}", i);
        let created = db
            .ensure_index(
                "acme.orders",
                &format!("{}_1", field),
                &doc! { field.as_str() => 1 },
                false,
            )
            .unwrap();
        assert!(created);
    }

    // slots 10 and 11 resolve through the overflow record
    assert_eq!(
        db.find_index_by_name("acme.orders", "f11_1").unwrap(),
        Some(11)
    );

    db.rename_collection("acme.orders", "acme.renamed").unwrap();

    assert_eq!(
        db.find_index_by_name("acme.renamed", "f11_1").unwrap(),
        Some(11)
    );
    assert_eq!(db.find_index_by_name("acme.renamed", "f0_1").unwrap(), Some(0));
    assert!(db.find_index_by_name("acme.orders", "f0_1").unwrap().is_none());

    // data still reachable through the renamed namespace
    let docs = db
        .find("acme.renamed", &doc! { "f0" => 1 }, &doc! {}, 0)
        .unwrap();
    assert_eq!(docs.len(), 1);
}

/// Index slot count is hard-capped at 64.
#[test]
fn sixty_fifth_index_is_rejected_through_the_facade() {
    let db = open_db();
    db.insert("acme.wide", &doc! { "x" => 1 }).unwrap();

    for i in 0..64 {
        let field = format!("f{}", i);
        db.ensure_index(
            "acme.wide",
            &format!("{}_1", field),
            &doc! { field.as_str() => 1 },
            false,
        )
        .unwrap();
    }

    let err = db
        .ensure_index("acme.wide", "one_too_many", &doc! { "z" => 1 }, false)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ErrorKind>(),
        Some(ErrorKind::TooManyIndexes(_))
    ));
}

/// Names reserved for overflow records are rejected at the catalog door.
#[test]
fn reserved_and_oversized_names_are_user_errors() {
    let db = open_db();

    let err = db
        .create_collection("acme.orders$extra", CollectionOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("reserved"));

    let long = format!("acme.{}", "c".repeat(130));
    let err = db.insert(&long, &doc! { "a" => 1 }).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ErrorKind>(),
        Some(ErrorKind::NameTooLong { .. })
    ));
}

/// Dropping a collection tombstones the namespace and its transient state;
/// recreating it starts clean.
#[test]
fn drop_collection_resets_everything() {
    let db = open_db();
    db.ensure_index("acme.orders", "a_1", &doc! { "a" => 1 }, false)
        .unwrap();
    db.insert("acme.orders", &doc! { "a" => 1 }).unwrap();

    assert!(db.drop_collection("acme.orders").unwrap());
    assert!(!db.drop_collection("acme.orders").unwrap());
    assert!(db
        .find("acme.orders", &doc! {}, &doc! {}, 0)
        .unwrap()
        .is_empty());

    db.insert("acme.orders", &doc! { "a" => Value::Int(2) }).unwrap();
    let (n_records, _, _) = db.stats("acme.orders").unwrap().unwrap();
    assert_eq!(n_records, 1);
    assert!(db.index_keys("acme.orders").unwrap().is_empty());
}
