// Asset service tests

use super::*;
use crate::archive::Archive;
use crate::collections::{
    create_collection, CreateCollection, RawMetadata, SchemaProperty,
};
use crate::constants::{ROOT_ASSET_COLLECTION_ID, ROOT_DATABASE_COLLECTION_ID};
use crate::error::ArcaError;
use crate::events::ChangeEvent;
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;

fn open_test_archive() -> (TempDir, Archive) {
    let tmp = TempDir::new().unwrap();
    let archive = Archive::open(tmp.path(), None).unwrap();
    (tmp, archive)
}

fn raw(entries: &[(&str, &[&str])]) -> RawMetadata {
    entries
        .iter()
        .map(|(key, values)| {
            (
                key.to_string(),
                values
                    .iter()
                    .map(|v| serde_json::Value::String(v.to_string()))
                    .collect(),
            )
        })
        .collect()
}

fn values(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------
// Create + update metadata
// ---------------------------------------------------------------

#[test]
fn test_create_then_update_replaces_metadata() {
    let (_tmp, archive) = open_test_archive();

    let collection = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Docs".to_string(),
            schema: vec![
                SchemaProperty::free_text("a", "A"),
                SchemaProperty::free_text("b", "B").required(true),
                SchemaProperty::free_text("c", "C").repeated(true),
            ],
            ..Default::default()
        },
    )
    .unwrap();

    let events: Rc<RefCell<Vec<ChangeEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    archive.events().subscribe(move |event| {
        if matches!(event, ChangeEvent::Assets(_)) {
            sink.borrow_mut().push(event.clone());
        }
    });

    let asset = create_asset(
        &archive,
        &collection.id,
        CreateAsset {
            metadata: raw(&[
                ("b", &["1"]),
                ("a", &["2"]),
                ("c", &["3", "4"]),
                ("unknown", &["x"]),
            ]),
            ..Default::default()
        },
    )
    .unwrap();

    // Unknown keys dropped; every schema property present
    assert_eq!(asset.metadata.len(), 3);
    assert_eq!(asset.metadata.get("a").unwrap(), &values(&["2"]));
    assert_eq!(asset.metadata.get("b").unwrap(), &values(&["1"]));
    assert_eq!(asset.metadata.get("c").unwrap(), &values(&["3", "4"]));

    {
        let seen = events.borrow();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            ChangeEvent::Assets(change) => {
                assert_eq!(change.created.len(), 1);
                assert_eq!(change.created[0].id, asset.id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    // Update replaces the record wholesale
    let updated = update_asset(
        &archive,
        &asset.id,
        UpdateAsset {
            metadata: Some(raw(&[("b", &["Replace"])])),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(updated.metadata.get("a").unwrap().is_empty());
    assert_eq!(updated.metadata.get("b").unwrap(), &values(&["Replace"]));
    assert!(updated.metadata.get("c").unwrap().is_empty());

    let seen = events.borrow();
    assert_eq!(seen.len(), 2);
    match &seen[1] {
        ChangeEvent::Assets(change) => {
            assert_eq!(change.updated.len(), 1);
            assert_eq!(change.updated[0].id, asset.id);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_create_requires_required_property() {
    let (_tmp, archive) = open_test_archive();

    let collection = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Docs".to_string(),
            schema: vec![SchemaProperty::free_text("b", "B").required(true)],
            ..Default::default()
        },
    )
    .unwrap();

    let err = create_asset(
        &archive,
        &collection.id,
        CreateAsset {
            metadata: RawMetadata::new(),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, ArcaError::Validation(errors) if errors.contains_key("b")));
}

#[test]
fn test_create_and_list_then_delete() {
    let (_tmp, archive) = open_test_archive();

    let collection = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Docs".to_string(),
            schema: vec![SchemaProperty::free_text("t", "T")],
            ..Default::default()
        },
    )
    .unwrap();

    let asset = create_asset(
        &archive,
        &collection.id,
        CreateAsset {
            metadata: raw(&[("t", &["hello"])]),
            ..Default::default()
        },
    )
    .unwrap();

    let listed = list_assets(archive.conn(), &collection.id, crate::PageRange::all()).unwrap();
    assert_eq!(listed.total, 1);
    assert_eq!(listed.items[0].id, asset.id);

    delete_assets(&archive, &[asset.id.clone()]).unwrap();
    let listed = list_assets(archive.conn(), &collection.id, crate::PageRange::all()).unwrap();
    assert_eq!(listed.total, 0);
    assert!(matches!(
        get_asset(archive.conn(), &asset.id),
        Err(ArcaError::DoesNotExist(_))
    ));
}

// ---------------------------------------------------------------
// Pagination boundaries
// ---------------------------------------------------------------

#[test]
fn test_pagination_boundaries() {
    let (_tmp, archive) = open_test_archive();

    let collection = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Docs".to_string(),
            schema: vec![SchemaProperty::free_text("t", "T")],
            ..Default::default()
        },
    )
    .unwrap();
    for i in 0..5 {
        create_asset(
            &archive,
            &collection.id,
            CreateAsset {
                metadata: raw(&[("t", &[format!("item {}", i).as_str()])]),
                ..Default::default()
            },
        )
        .unwrap();
    }

    // limit = 0: empty items, correct total
    let empty = list_assets(archive.conn(), &collection.id, crate::PageRange::new(0, 0)).unwrap();
    assert_eq!(empty.total, 5);
    assert!(empty.items.is_empty());

    // offset beyond total: empty
    let beyond =
        list_assets(archive.conn(), &collection.id, crate::PageRange::new(10, 10)).unwrap();
    assert_eq!(beyond.total, 5);
    assert!(beyond.items.is_empty());

    // limit above the cap is clamped
    let clamped = crate::PageRange::new(0, 5000);
    assert_eq!(clamped.limit, crate::constants::MAX_PAGE_LIMIT);

    // plain page
    let page = list_assets(archive.conn(), &collection.id, crate::PageRange::new(3, 10)).unwrap();
    assert_eq!(page.items.len(), 2);
}

// ---------------------------------------------------------------
// Referential integrity on delete
// ---------------------------------------------------------------

struct ReferenceFixture {
    database_id: String,
    collection_id: String,
}

fn reference_fixture(archive: &Archive, required: bool, repeated: bool) -> ReferenceFixture {
    let database = create_collection(
        archive,
        ROOT_DATABASE_COLLECTION_ID,
        CreateCollection {
            title: "Terms".to_string(),
            schema: vec![SchemaProperty::free_text("name", "Name")],
            ..Default::default()
        },
    )
    .unwrap();
    let collection = create_collection(
        archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Records".to_string(),
            schema: vec![SchemaProperty::db_reference("r", "Reference", &database.id)
                .required(required)
                .repeated(repeated)],
            ..Default::default()
        },
    )
    .unwrap();
    ReferenceFixture {
        database_id: database.id,
        collection_id: collection.id,
    }
}

fn create_term(archive: &Archive, fixture: &ReferenceFixture, name: &str) -> String {
    create_asset(
        archive,
        &fixture.database_id,
        CreateAsset {
            metadata: raw(&[("name", &[name])]),
            ..Default::default()
        },
    )
    .unwrap()
    .id
}

#[test]
fn test_delete_blocked_by_required_reference() {
    let (_tmp, archive) = open_test_archive();
    let fixture = reference_fixture(&archive, true, false);

    let term = create_term(&archive, &fixture, "term");
    let record = create_asset(
        &archive,
        &fixture.collection_id,
        CreateAsset {
            metadata: raw(&[("r", &[term.as_str()])]),
            ..Default::default()
        },
    )
    .unwrap();

    let err = delete_assets(&archive, &[term.clone()]).unwrap_err();
    match err {
        ArcaError::ReferentialIntegrity(blockers) => {
            assert_eq!(blockers.len(), 1);
            assert_eq!(blockers[0].asset_id, record.id);
        }
        other => panic!("expected ReferentialIntegrity, got {}", other),
    }

    // The referenced record must still exist
    assert_eq!(
        list_assets(archive.conn(), &fixture.database_id, crate::PageRange::all())
            .unwrap()
            .total,
        1
    );
}

#[test]
fn test_delete_trims_required_repeated_reference() {
    let (_tmp, archive) = open_test_archive();
    let fixture = reference_fixture(&archive, true, true);

    let t1 = create_term(&archive, &fixture, "first");
    let t2 = create_term(&archive, &fixture, "second");
    let record = create_asset(
        &archive,
        &fixture.collection_id,
        CreateAsset {
            metadata: raw(&[("r", &[t1.as_str(), t2.as_str()])]),
            ..Default::default()
        },
    )
    .unwrap();

    // One value remains: the delete trims the reference
    delete_assets(&archive, &[t1.clone()]).unwrap();
    let after = get_asset(archive.conn(), &record.id).unwrap();
    assert_eq!(after.metadata.get("r").unwrap(), &vec![t2.clone()]);

    // Deleting the last value is refused
    let err = delete_assets(&archive, &[t2.clone()]).unwrap_err();
    assert!(matches!(err, ArcaError::ReferentialIntegrity(_)));
}

#[test]
fn test_delete_both_required_repeated_references_at_once_fails() {
    let (_tmp, archive) = open_test_archive();
    let fixture = reference_fixture(&archive, true, true);

    let t1 = create_term(&archive, &fixture, "first");
    let t2 = create_term(&archive, &fixture, "second");
    create_asset(
        &archive,
        &fixture.collection_id,
        CreateAsset {
            metadata: raw(&[("r", &[t1.as_str(), t2.as_str()])]),
            ..Default::default()
        },
    )
    .unwrap();

    let err = delete_assets(&archive, &[t1, t2]).unwrap_err();
    assert!(matches!(err, ArcaError::ReferentialIntegrity(_)));
    assert_eq!(
        list_assets(archive.conn(), &fixture.database_id, crate::PageRange::all())
            .unwrap()
            .total,
        2
    );
}

#[test]
fn test_delete_strips_optional_reference() {
    let (_tmp, archive) = open_test_archive();
    let fixture = reference_fixture(&archive, false, false);

    let term = create_term(&archive, &fixture, "term");
    let record = create_asset(
        &archive,
        &fixture.collection_id,
        CreateAsset {
            metadata: raw(&[("r", &[term.as_str()])]),
            ..Default::default()
        },
    )
    .unwrap();

    delete_assets(&archive, &[term]).unwrap();
    let after = get_asset(archive.conn(), &record.id).unwrap();
    assert!(after.metadata.get("r").unwrap().is_empty());
}

// ---------------------------------------------------------------
// Moves
// ---------------------------------------------------------------

#[test]
fn test_move_between_same_type_collections() {
    let (_tmp, archive) = open_test_archive();

    let source = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Source".to_string(),
            schema: vec![SchemaProperty::free_text("t", "T")],
            ..Default::default()
        },
    )
    .unwrap();
    let destination = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Destination".to_string(),
            schema: vec![SchemaProperty::free_text("t", "T")],
            ..Default::default()
        },
    )
    .unwrap();

    let asset = create_asset(
        &archive,
        &source.id,
        CreateAsset {
            metadata: raw(&[("t", &["x"])]),
            ..Default::default()
        },
    )
    .unwrap();

    move_assets(&archive, &[asset.id.clone()], &destination.id).unwrap();
    let moved = get_asset(archive.conn(), &asset.id).unwrap();
    assert_eq!(moved.collection_id, destination.id);
    assert_eq!(moved.metadata.get("t").unwrap(), &values(&["x"]));
}

#[test]
fn test_move_rejected_across_types_and_on_schema_mismatch() {
    let (_tmp, archive) = open_test_archive();

    let assets_collection = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Docs".to_string(),
            schema: vec![SchemaProperty::free_text("t", "T")],
            ..Default::default()
        },
    )
    .unwrap();
    let database = create_collection(
        &archive,
        ROOT_DATABASE_COLLECTION_ID,
        CreateCollection {
            title: "Terms".to_string(),
            schema: vec![SchemaProperty::free_text("t", "T")],
            ..Default::default()
        },
    )
    .unwrap();
    let strict = create_collection(
        &archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Strict".to_string(),
            schema: vec![SchemaProperty::free_text("must", "Must").required(true)],
            ..Default::default()
        },
    )
    .unwrap();

    let asset = create_asset(
        &archive,
        &assets_collection.id,
        CreateAsset {
            metadata: raw(&[("t", &["x"])]),
            ..Default::default()
        },
    )
    .unwrap();

    // Across types
    let err = move_assets(&archive, &[asset.id.clone()], &database.id).unwrap_err();
    assert!(matches!(err, ArcaError::MoveRejected(list) if list.len() == 1));

    // Destination schema rejects the metadata
    let err = move_assets(&archive, &[asset.id.clone()], &strict.id).unwrap_err();
    match err {
        ArcaError::MoveRejected(list) => {
            assert_eq!(list[0].asset_id, asset.id);
            assert!(list[0].errors.contains_key("must"));
        }
        other => panic!("expected MoveRejected, got {}", other),
    }

    // Nothing moved
    assert_eq!(
        get_asset(archive.conn(), &asset.id).unwrap().collection_id,
        assets_collection.id
    );
}
