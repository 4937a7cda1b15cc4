//! Purpose: Exercise standalone-document imports and exports against an in-memory directory.
//! Role: Covers kind ordering, skip accounting, notices, and fault propagation between roles.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dsmigrate::api::{ErrorKind, ExportMessage, MemoryDirectory, Transfer, TransferObserver};
use dsmigrate::core::codec::{CodecConfig, RecordReader};
use dsmigrate::core::counter::Counter;
use dsmigrate::core::kind::RecordKind;
use dsmigrate::core::record::{Object, ObjectType, Record};
use dsmigrate::notice::Notice;
use serde_json::{Value, json};

#[derive(Default)]
struct Recorder {
    notices: Mutex<Vec<Notice>>,
    finished: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    fn notice_kinds(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .map(|notice| notice.kind.clone())
            .collect()
    }
}

impl TransferObserver for Recorder {
    fn on_notice(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }

    fn on_finish(&self, counter: &Counter) {
        self.finished.lock().unwrap().push(counter.summary_lines());
    }
}

fn write_doc(dir: &Path, name: &str, value: Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    path
}

fn model_files(dir: &Path) -> Vec<PathBuf> {
    vec![
        write_doc(
            dir,
            "relations.json",
            json!({"relations": [{
                "subject": {"type": "user", "key": "alice"},
                "relation": "viewer",
                "object": {"type": "doc", "key": "readme"}
            }]}),
        ),
        write_doc(
            dir,
            "objects.json",
            json!({"objects": [
                {"type": "user", "key": "alice"},
                {"type": "doc", "key": "readme", "displayName": "Read me"}
            ]}),
        ),
        write_doc(
            dir,
            "relation_types.json",
            json!({"relation_types": [{"objectType": "doc", "name": "viewer", "permissions": ["read"]}]}),
        ),
        write_doc(dir, "permissions.json", json!({"permissions": [{"name": "read"}]})),
        write_doc(
            dir,
            "object_types.json",
            json!({"object_types": [{"name": "user"}, {"name": "doc"}]}),
        ),
    ]
}

fn seed_types(dir: &MemoryDirectory) {
    for name in ["user", "doc"] {
        dir.insert(Record::ObjectType(ObjectType {
            name: name.to_string(),
            ..ObjectType::default()
        }))
        .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn import_replays_model_kinds_before_data() {
    let temp = tempfile::tempdir().unwrap();
    let files = model_files(temp.path());
    let target = MemoryDirectory::new();

    let transfer = Transfer::new();
    transfer.import(&target, &files).await.unwrap();

    assert_eq!(target.count(RecordKind::ObjectType), 2);
    assert_eq!(target.count(RecordKind::Permission), 1);
    assert_eq!(target.count(RecordKind::RelationType), 1);
    assert_eq!(target.count(RecordKind::Object), 2);
    assert_eq!(target.count(RecordKind::Relation), 1);
    assert_eq!(transfer.counter().objects().count(), 2);
    assert_eq!(transfer.counter().relations().count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn records_with_unknown_fields_are_skipped_and_reported() {
    let temp = tempfile::tempdir().unwrap();
    let file = write_doc(
        temp.path(),
        "objects.json",
        json!({"objects": [
            {"type": "user", "key": "alice"},
            {"type": "user", "key": "bob", "colour": "blue"},
            {"type": "user", "key": "carol"}
        ]}),
    );
    let target = MemoryDirectory::new();
    seed_types(&target);

    let recorder = Arc::new(Recorder::default());
    let transfer = Transfer::new().with_observer(recorder.clone());
    transfer.import(&target, &[file]).await.unwrap();

    assert_eq!(
        target
            .records(RecordKind::Object)
            .iter()
            .map(Record::label)
            .collect::<Vec<_>>(),
        vec!["user:alice", "user:carol"]
    );
    assert_eq!(transfer.counter().objects().count(), 2);
    assert_eq!(transfer.counter().objects().skipped(), 1);
    let finished = recorder.finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    assert!(finished[0][RecordKind::Object.index()].contains("WARNING"));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_record_files_are_skipped_with_a_notice() {
    let temp = tempfile::tempdir().unwrap();
    let bare = write_doc(temp.path(), "bare.json", json!([{"type": "user", "key": "a"}]));
    let widgets = write_doc(temp.path(), "widgets.json", json!({"widgets": []}));
    let good = write_doc(
        temp.path(),
        "objects.json",
        json!({"objects": [{"type": "user", "key": "a"}]}),
    );
    let target = MemoryDirectory::new();
    seed_types(&target);

    let recorder = Arc::new(Recorder::default());
    Transfer::new()
        .with_observer(recorder.clone())
        .import(&target, &[bare.clone(), widgets, good])
        .await
        .unwrap();

    assert_eq!(target.count(RecordKind::Object), 1);
    assert_eq!(recorder.notice_kinds(), vec!["skipped_file", "skipped_file"]);
    let notices = recorder.notices.lock().unwrap();
    assert_eq!(notices[0].source, bare.display().to_string());
    assert!(notices[0].details.contains_key("hint"));
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_key_document_is_skipped_before_anything_is_sent() {
    let temp = tempfile::tempdir().unwrap();
    let mixed = temp.path().join("mixed.json");
    fs::write(
        &mixed,
        r#"{"objects": [{"type": "user", "key": "a"}], "relations": []}"#,
    )
    .unwrap();
    let good = write_doc(
        temp.path(),
        "objects.json",
        json!({"objects": [{"type": "user", "key": "b"}]}),
    );
    let target = MemoryDirectory::new();
    seed_types(&target);

    let recorder = Arc::new(Recorder::default());
    let transfer = Transfer::new().with_observer(recorder.clone());
    transfer.import(&target, &[mixed.clone(), good]).await.unwrap();

    assert_eq!(
        target
            .records(RecordKind::Object)
            .iter()
            .map(Record::label)
            .collect::<Vec<_>>(),
        vec!["user:b"]
    );
    assert_eq!(transfer.counter().objects().count(), 1);
    assert_eq!(recorder.notice_kinds(), vec!["skipped_file"]);
    let notices = recorder.notices.lock().unwrap();
    assert_eq!(notices[0].source, mixed.display().to_string());
    assert_eq!(
        notices[0].details.get("reason"),
        Some(&json!("document has more than one root key"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn counts_start_fresh_for_each_operation() {
    let temp = tempfile::tempdir().unwrap();
    let file = write_doc(
        temp.path(),
        "objects.json",
        json!({"objects": [{"type": "user", "key": "a"}, {"type": "user", "key": "b"}]}),
    );
    let recorder = Arc::new(Recorder::default());
    let transfer = Transfer::new().with_observer(recorder.clone());
    for _ in 0..2 {
        let target = MemoryDirectory::new();
        seed_types(&target);
        transfer.import(&target, &[file.clone()]).await.unwrap();
        assert_eq!(transfer.counter().objects().count(), 2);
    }
    let finished = recorder.finished.lock().unwrap();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[0], finished[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_import_file_is_fatal_before_any_write() {
    let temp = tempfile::tempdir().unwrap();
    let good = write_doc(
        temp.path(),
        "object_types.json",
        json!({"object_types": [{"name": "user"}]}),
    );
    let target = MemoryDirectory::new();
    let err = Transfer::new()
        .import(&target, &[good, temp.path().join("missing.json")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(target.count(RecordKind::ObjectType), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_rejection_stops_a_large_import() {
    let temp = tempfile::tempdir().unwrap();
    let objects: Vec<Value> = (0..5_000)
        .map(|i| json!({"type": "user", "key": format!("u{i:05}")}))
        .collect();
    let file = write_doc(temp.path(), "objects.json", json!({ "objects": objects }));
    let target = MemoryDirectory::new();
    seed_types(&target);
    target.reject("user:u00100");

    let recorder = Arc::new(Recorder::default());
    let err = Transfer::new()
        .with_observer(recorder.clone())
        .import(&target, &[file])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Service);
    assert_eq!(target.count(RecordKind::Object), 100);
    assert_eq!(recorder.finished.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_record_is_a_format_error() {
    let temp = tempfile::tempdir().unwrap();
    let file = write_doc(
        temp.path(),
        "objects.json",
        json!({"objects": [{"type": "user", "key": "a"}, 42]}),
    );
    let target = MemoryDirectory::new();
    seed_types(&target);

    let err = Transfer::new().import(&target, &[file.clone()]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert_eq!(err.path(), Some(&file));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_sender_aborts_the_import_instead_of_finishing_it() {
    let temp = tempfile::tempdir().unwrap();
    let file = write_doc(
        temp.path(),
        "objects.json",
        json!({"objects": [{"type": "user", "key": "a"}, 42, {"type": "user", "key": "c"}]}),
    );
    let target = MemoryDirectory::new();
    seed_types(&target);

    let err = Transfer::new().import(&target, &[file]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);

    // The directory task may still be winding down after the receiver returns.
    for _ in 0..200 {
        if target.aborted_imports() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(target.aborted_imports(), 1);
    assert_eq!(
        target
            .records(RecordKind::Object)
            .iter()
            .map(Record::label)
            .collect::<Vec<_>>(),
        vec!["user:a"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn export_writes_objects_and_relations_documents() {
    let temp = tempfile::tempdir().unwrap();
    let source = MemoryDirectory::new();
    Transfer::new()
        .import(&source, &model_files(temp.path()))
        .await
        .unwrap();
    source.push_export(ExportMessage::Unknown("audit".to_string()));

    let objects = temp.path().join("out-objects.json");
    let relations = temp.path().join("out-relations.json");
    let recorder = Arc::new(Recorder::default());
    let transfer = Transfer::new().with_observer(recorder.clone());
    transfer.export(&source, &objects, &relations).await.unwrap();

    let mut reader = RecordReader::open_path(&objects, CodecConfig::default()).unwrap();
    assert_eq!(reader.kind(), RecordKind::Object);
    let mut keys = Vec::new();
    while let Some(record) = reader.next_record() {
        match record.unwrap() {
            Record::Object(Object { key, .. }) => keys.push(key),
            other => panic!("unexpected record {other:?}"),
        }
    }
    assert_eq!(keys, vec!["readme", "alice"]);

    let reader = RecordReader::open_path(&relations, CodecConfig::default()).unwrap();
    assert_eq!(reader.kind(), RecordKind::Relation);
    assert_eq!(transfer.counter().relations().count(), 1);
    assert_eq!(recorder.notice_kinds(), vec!["unknown_message"]);
}
