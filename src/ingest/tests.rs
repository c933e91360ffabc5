// Ingest engine tests

use super::*;
use crate::archive::Archive;
use crate::assets::{self, AccessControl, CreateAsset};
use crate::bundle;
use crate::collections::{create_collection, CreateCollection, RawMetadata, SchemaProperty};
use crate::constants::ROOT_ASSET_COLLECTION_ID;
use crate::events::ChangeEvent;
use std::cell::RefCell;
use std::io::Write as IoWrite;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

fn open_test_archive() -> (TempDir, Archive) {
    let tmp = TempDir::new().unwrap();
    let archive = Archive::open(tmp.path().join("archive").as_path(), None).unwrap();
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

fn write_test_png(path: &Path) {
    let img = image::ImageBuffer::from_fn(32, 32, |x, _| image::Rgb([(x * 8) as u8, 0, 0]));
    img.save(path).unwrap();
}

fn write_test_jpg(path: &Path) {
    let img = image::ImageBuffer::from_fn(32, 32, |_, y| image::Rgb([0, (y * 8) as u8, 0]));
    img.save(path).unwrap();
}

/// Target collection with one required free-text property labelled
/// "property", plus the spreadsheet next to two media files.
fn spreadsheet_fixture(tmp: &TempDir, archive: &Archive) -> (String, std::path::PathBuf) {
    let collection = create_collection(
        archive,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Imports".to_string(),
            schema: vec![SchemaProperty {
                id: "p".to_string(),
                label: "property".to_string(),
                visible: true,
                required: true,
                repeated: false,
                kind: crate::collections::PropertyKind::FreeText,
            }],
            ..Default::default()
        },
    )
    .unwrap();

    let source_dir = tmp.path().join("source");
    std::fs::create_dir_all(&source_dir).unwrap();
    let sheet = source_dir.join("rows.csv");
    let mut file = std::fs::File::create(&sheet).unwrap();
    writeln!(file, "property,files").unwrap();
    writeln!(file, "value1,a.png").unwrap();
    writeln!(file, "value2,b.jpg").unwrap();
    drop(file);
    write_test_png(&source_dir.join("a.png"));
    write_test_jpg(&source_dir.join("b.jpg"));

    (collection.id, sheet)
}

// ---------------------------------------------------------------
// Spreadsheet ingest end to end
// ---------------------------------------------------------------

#[test]
fn test_spreadsheet_ingest_and_commit() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();
    let stop = AtomicBool::new(false);
    run_session(&archive, &session_id, &stop).unwrap();

    let state = get_session(&archive, &session_id).unwrap();
    assert_eq!(state.phase, IngestPhase::Completed);
    assert!(state.valid);
    assert_eq!(state.assets.len(), 2);
    for staged in &state.assets {
        assert_eq!(staged.phase, IngestPhase::Completed);
        assert_eq!(staged.files.len(), 1);
        assert!(staged.files[0].media_id.is_some(), "media staged for each row");
        assert!(staged.validation_errors.is_none());
    }
    // Locators carry sheet name and row index
    let locators: Vec<&str> = state.assets.iter().map(|a| a.locator.as_str()).collect();
    assert!(locators.contains(&"rows,0"));
    assert!(locators.contains(&"rows,1"));

    let created = commit_session(&archive, &session_id).unwrap();
    assert_eq!(created.len(), 2);

    let listed =
        assets::list_assets(archive.conn(), &collection_id, crate::PageRange::all()).unwrap();
    assert_eq!(listed.total, 2);
    let mut values: Vec<String> = listed
        .items
        .iter()
        .map(|a| a.metadata.get("p").unwrap()[0].clone())
        .collect();
    values.sort();
    assert_eq!(values, vec!["value1".to_string(), "value2".to_string()]);
    for asset in &listed.items {
        assert_eq!(asset.media.len(), 1);
    }

    // The session row is gone
    assert!(matches!(
        get_session(&archive, &session_id),
        Err(crate::ArcaError::DoesNotExist(_))
    ));
}

#[test]
fn test_ingest_records_file_errors_and_continues() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    // Remove one media file so its row records an IO error
    std::fs::remove_file(tmp.path().join("source").join("b.jpg")).unwrap();

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();
    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();

    let state = get_session(&archive, &session_id).unwrap();
    assert_eq!(state.phase, IngestPhase::Completed);

    let errored: Vec<&StagedFile> = state
        .assets
        .iter()
        .flat_map(|a| a.files.iter())
        .filter(|f| f.error.is_some())
        .collect();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].error.as_deref(), Some("IO_ERROR"));
}

#[test]
fn test_invalid_rows_mark_session_invalid() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, _sheet) = spreadsheet_fixture(&tmp, &archive);

    // A sheet with a blank required value
    let bad_sheet = tmp.path().join("source").join("bad.csv");
    let mut file = std::fs::File::create(&bad_sheet).unwrap();
    writeln!(file, "property").unwrap();
    writeln!(file, " ").unwrap();
    drop(file);

    let session_id = create_session(&archive, &bad_sheet, &collection_id).unwrap();
    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();

    let state = get_session(&archive, &session_id).unwrap();
    assert!(!state.valid);
    assert_eq!(state.assets.len(), 1);
    let errors = state.assets[0].validation_errors.as_ref().unwrap();
    assert!(errors.contains_key("p"));
}

#[test]
fn test_unreadable_source_ends_in_error() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, _) = spreadsheet_fixture(&tmp, &archive);

    let missing = tmp.path().join("nope.csv");
    let session_id = create_session(&archive, &missing, &collection_id).unwrap();
    assert!(run_session(&archive, &session_id, &AtomicBool::new(false)).is_err());

    let state = get_session(&archive, &session_id).unwrap();
    assert_eq!(state.phase, IngestPhase::Error);
}

// ---------------------------------------------------------------
// Interruption and resume
// ---------------------------------------------------------------

#[test]
fn test_stopped_run_resumes_to_same_terminal_state() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();

    // First run observes the stop flag at the first check point: metadata is
    // staged but no file is processed.
    let stop = AtomicBool::new(true);
    run_session(&archive, &session_id, &stop).unwrap();

    let interrupted = get_session(&archive, &session_id).unwrap();
    assert_eq!(interrupted.phase, IngestPhase::ReadFiles);
    assert_eq!(interrupted.assets.len(), 2);
    assert!(interrupted
        .assets
        .iter()
        .all(|a| a.files[0].media_id.is_none() && a.files[0].error.is_none()));

    // Second run finishes the remaining work
    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();
    let finished = get_session(&archive, &session_id).unwrap();
    assert_eq!(finished.phase, IngestPhase::Completed);
    assert!(finished
        .assets
        .iter()
        .all(|a| a.phase == IngestPhase::Completed && a.files[0].media_id.is_some()));
}

#[test]
fn test_completed_session_run_is_a_no_op() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();
    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();
    let first = get_session(&archive, &session_id).unwrap();

    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();
    let second = get_session(&archive, &session_id).unwrap();
    assert_eq!(first.assets.len(), second.assets.len());
    assert_eq!(second.phase, IngestPhase::Completed);
}

#[test]
fn test_reopening_the_archive_resumes_interrupted_sessions() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("archive");

    let session_id;
    {
        let archive = Archive::open(&root, None).unwrap();
        let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);
        session_id = create_session(&archive, &sheet, &collection_id).unwrap();
        // Interrupted mid-run: metadata staged, no file processed
        run_session(&archive, &session_id, &AtomicBool::new(true)).unwrap();
        assert_eq!(
            get_session(&archive, &session_id).unwrap().phase,
            IngestPhase::ReadFiles
        );
    }

    // Reopening runs the session to the same terminal state an
    // uninterrupted run would have reached
    let reopened = Archive::open(&root, None).unwrap();
    let state = get_session(&reopened, &session_id).unwrap();
    assert_eq!(state.phase, IngestPhase::Completed);
    assert!(state.valid);
    assert!(state
        .assets
        .iter()
        .all(|a| a.files[0].media_id.is_some()));
}

#[test]
fn test_resume_sessions_picks_up_incomplete_work() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();
    run_session(&archive, &session_id, &AtomicBool::new(true)).unwrap();
    assert_eq!(
        get_session(&archive, &session_id).unwrap().phase,
        IngestPhase::ReadFiles
    );

    resume_sessions(&archive).unwrap();
    assert_eq!(
        get_session(&archive, &session_id).unwrap().phase,
        IngestPhase::Completed
    );
}

// ---------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------

#[test]
fn test_cancel_deletes_session_and_its_media() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();
    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();

    let media_count = archive
        .unit_of_work(|conn| crate::db::schema::count_all_media(conn))
        .unwrap();
    assert_eq!(media_count, 2);

    cancel_session(&archive, &session_id).unwrap();

    assert!(matches!(
        get_session(&archive, &session_id),
        Err(crate::ArcaError::DoesNotExist(_))
    ));
    assert_eq!(
        archive
            .unit_of_work(|conn| crate::db::schema::count_all_media(conn))
            .unwrap(),
        0
    );
    let blobs: Vec<_> = std::fs::read_dir(archive.blob_dir()).unwrap().collect();
    assert!(blobs.is_empty());
}

// ---------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------

#[test]
fn test_progress_events_are_ordered_and_monotone() {
    let (tmp, archive) = open_test_archive();
    let (collection_id, sheet) = spreadsheet_fixture(&tmp, &archive);

    let statuses: Rc<RefCell<Vec<crate::IngestStatus>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&statuses);
    archive.events().subscribe(move |event| {
        if let ChangeEvent::Ingest(status) = event {
            sink.borrow_mut().push(status.clone());
        }
    });

    let session_id = create_session(&archive, &sheet, &collection_id).unwrap();
    run_session(&archive, &session_id, &AtomicBool::new(false)).unwrap();

    let seen = statuses.borrow();
    assert_eq!(seen.first().unwrap().phase, "READ_METADATA");
    assert_eq!(seen.last().unwrap().phase, "COMPLETED");
    assert_eq!(seen.last().unwrap().files_read, 2);

    let mut last_read = 0;
    for status in seen.iter() {
        assert!(status.files_read >= last_read, "files_read went backwards");
        last_read = status.files_read;
    }
}

// ---------------------------------------------------------------
// Bundle round-trip via bootstrap
// ---------------------------------------------------------------

#[test]
fn test_export_then_bootstrap_round_trip() {
    let (tmp, source) = open_test_archive();

    let collection = create_collection(
        &source,
        ROOT_ASSET_COLLECTION_ID,
        CreateCollection {
            title: "Photographs".to_string(),
            schema: vec![
                SchemaProperty::free_text("title", "Title").required(true),
                SchemaProperty::free_text("note", "Note"),
            ],
            ..Default::default()
        },
    )
    .unwrap();

    let image_path = tmp.path().join("photo.png");
    write_test_png(&image_path);
    let media =
        crate::media::put(&source, crate::media::MediaSource::Path(&image_path)).unwrap();

    let with_media = assets::create_asset(
        &source,
        &collection.id,
        CreateAsset {
            metadata: raw(&[("title", &["First"]), ("note", &["kept"])]),
            media: vec![media.id.clone()],
            access_control: AccessControl::MetadataOnly,
            ..Default::default()
        },
    )
    .unwrap();
    let plain = assets::create_asset(
        &source,
        &collection.id,
        CreateAsset {
            metadata: raw(&[("title", &["Second"])]),
            ..Default::default()
        },
    )
    .unwrap();

    let bundle_path = tmp.path().join("export.danapack");
    bundle::export_archive(&source, &bundle_path).unwrap();

    let mirror_root = tmp.path().join("mirror");
    let mirror = bootstrap_from_bundle(&bundle_path, &mirror_root).unwrap();

    assert_eq!(mirror.id(), source.id());

    // Same collections by id, parent, schema
    let source_collections =
        crate::collections::list_collections(source.conn()).unwrap();
    let mirror_collections =
        crate::collections::list_collections(mirror.conn()).unwrap();
    assert_eq!(source_collections.len(), mirror_collections.len());
    for original in &source_collections {
        let copy = mirror_collections
            .iter()
            .find(|c| c.id == original.id)
            .expect("collection preserved by id");
        assert_eq!(copy.parent_id, original.parent_id);
        assert_eq!(copy.schema, original.schema);
    }

    // Same assets by id, metadata, access control, media count
    for original_id in [&with_media.id, &plain.id] {
        let original = assets::get_asset(source.conn(), original_id).unwrap();
        let copy = assets::get_asset(mirror.conn(), original_id).unwrap();
        assert_eq!(copy.metadata, original.metadata);
        assert_eq!(copy.access_control, original.access_control);
        assert_eq!(copy.media.len(), original.media.len());
    }
}
