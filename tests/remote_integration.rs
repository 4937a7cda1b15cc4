//! Purpose: Exercise `RemoteDirectory` against a scripted HTTP peer.
//! Role: Covers routes, auth header, envelopes, status mapping, and the import and export streams.
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};

use dsmigrate::api::{
    Directory, ErrorKind, ExportMessage, ExportOptions, PageRequest, RemoteDirectory, Transfer,
    TransferObserver,
};
use dsmigrate::core::counter::Counter;
use dsmigrate::core::kind::RecordKind;
use dsmigrate::core::record::Permission;

struct Scripted {
    url: String,
    requests: mpsc::Receiver<Seen>,
    handle: JoinHandle<()>,
}

/// One request as the peer saw it: head, a blank line, then the decoded body.
struct Seen {
    text: String,
    /// False when the connection closed before the body ended.
    complete: bool,
}

/// Read a chunked body into `body`; false when the client hung up before the last chunk.
fn read_chunked(reader: &mut impl BufRead, body: &mut Vec<u8>) -> bool {
    loop {
        let mut size_line = String::new();
        match reader.read_line(&mut size_line) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            return false;
        };
        let mut chunk = vec![0u8; size + 2];
        if reader.read_exact(&mut chunk).is_err() {
            return false;
        }
        if size == 0 {
            return true;
        }
        body.extend_from_slice(&chunk[..size]);
    }
}

/// Answer one connection per scripted response, recording each request's head and body.
///
/// A request whose body never finishes gets no response.
fn scripted(responses: Vec<(u16, &'static str, &'static str)>) -> Scripted {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, requests) = mpsc::channel();
    let handle = thread::spawn(move || {
        for (status, content_type, body) in responses {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut head = String::new();
            let mut length = 0usize;
            let mut chunked = false;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    length = value.trim().parse().unwrap();
                }
                if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
                    chunked = true;
                }
                head.push_str(&line);
            }
            let mut request_body = Vec::new();
            let complete = if chunked {
                read_chunked(&mut reader, &mut request_body)
            } else {
                request_body.resize(length, 0);
                reader.read_exact(&mut request_body).is_ok()
            };
            head.push_str("\r\n");
            head.push_str(&String::from_utf8_lossy(&request_body));
            tx.send(Seen {
                text: head,
                complete,
            })
            .unwrap();
            if !complete {
                continue;
            }

            let response = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        }
    });
    Scripted {
        url,
        requests,
        handle,
    }
}

#[derive(Default)]
struct Recorder {
    finished: Mutex<Vec<Vec<String>>>,
}

impl TransferObserver for Recorder {
    fn on_finish(&self, counter: &Counter) {
        self.finished.lock().unwrap().push(counter.summary_lines());
    }
}

const JSON: &str = "application/json";

#[test]
fn get_uses_versioned_route_and_bearer_token() {
    let server = scripted(vec![(
        200,
        JSON,
        r#"{"result": {"name": "user", "displayName": "User", "hash": "h1"}}"#,
    )]);
    let dir = RemoteDirectory::new(&server.url).unwrap().with_token("secret");
    let object_type = dir.get_object_type("user").unwrap();
    assert_eq!(object_type.display_name, "User");
    assert_eq!(object_type.hash, "h1");

    let request = server.requests.recv().unwrap().text;
    assert!(request.starts_with("GET /api/v1/object_types/user HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    server.handle.join().unwrap();
}

#[test]
fn set_posts_wrapped_entity_and_returns_stored_copy() {
    let server = scripted(vec![(
        200,
        JSON,
        r#"{"result": {"name": "read", "hash": "h2"}}"#,
    )]);
    let dir = RemoteDirectory::new(&server.url).unwrap();
    let stored = dir
        .set_permission(Permission {
            name: "read".to_string(),
            ..Permission::default()
        })
        .unwrap();
    assert_eq!(stored.hash, "h2");

    let request = server.requests.recv().unwrap().text;
    assert!(request.starts_with("POST /api/v1/permissions HTTP/1.1"));
    assert!(request.ends_with(r#"{"permission":{"name":"read"}}"#));
    server.handle.join().unwrap();
}

#[test]
fn error_envelope_maps_to_error_kind() {
    let server = scripted(vec![
        (
            404,
            JSON,
            r#"{"error": {"kind": "NotFound", "message": "relation type `doc#owner` not found"}}"#,
        ),
        (502, "text/plain", "bad gateway"),
    ]);
    let dir = RemoteDirectory::new(&server.url).unwrap();

    let err = dir.get_relation_type("doc", "owner").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.message(), Some("relation type `doc#owner` not found"));
    let request = server.requests.recv().unwrap().text;
    assert!(request.starts_with("GET /api/v1/object_types/doc/relation_types/owner HTTP/1.1"));

    let err = dir.get_permission("read").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Service);
    server.handle.join().unwrap();
}

#[test]
fn list_sends_page_parameters() {
    let server = scripted(vec![(
        200,
        JSON,
        r#"{"results": [{"objectType": "doc", "name": "viewer"}], "page": {"next_token": "t2"}}"#,
    )]);
    let dir = RemoteDirectory::new(&server.url).unwrap();
    let page = dir
        .list_relation_types("doc", &PageRequest::next("t1"))
        .unwrap();
    assert_eq!(page.results.len(), 1);
    assert_eq!(page.next_token, "t2");

    let request = server.requests.recv().unwrap().text;
    let request_line = request.lines().next().unwrap();
    assert!(request_line.starts_with("GET /api/v1/object_types/doc/relation_types?"));
    assert!(request_line.contains("page.token=t1"));
    server.handle.join().unwrap();
}

#[test]
fn export_streams_jsonl_messages() {
    let server = scripted(vec![(
        200,
        "application/jsonl",
        concat!(
            "{\"object_type\": {\"name\": \"user\"}}\n",
            "\n",
            "{\"audit\": {\"at\": \"now\"}}\n",
            "{\"object\": {\"type\": \"user\", \"key\": \"alice\", \"colour\": \"blue\"}}\n",
            "{\"object\": {\"type\": \"user\", \"key\": \"bob\"}}\n",
        ),
    )]);
    let dir = RemoteDirectory::new(&server.url).unwrap();
    let mut stream = dir.export(&ExportOptions::all()).unwrap();

    let mut seen = Vec::new();
    while let Some(message) = stream.messages.blocking_recv() {
        seen.push(match message {
            Ok(ExportMessage::Unknown(tag)) => format!("unknown {tag}"),
            Ok(message) => message
                .into_record()
                .map(|record| record.label())
                .unwrap_or_default(),
            Err(err) => format!("error {:?}", err.kind()),
        });
    }
    assert_eq!(seen, vec!["user", "unknown audit", "error Schema", "user:bob"]);

    let request = server.requests.recv().unwrap().text;
    assert!(request.starts_with("GET /api/v1/export?kinds="));
    server.handle.join().unwrap();
}

#[test]
fn unreachable_directory_is_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let dir = RemoteDirectory::new(url).unwrap();
    let err = dir.get_object_type("user").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

fn write_objects(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("objects.json");
    fs::write(&path, body).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn import_streams_jsonl_and_reads_acknowledgements() {
    let server = scripted(vec![(
        200,
        "application/jsonl",
        "{\"kind\": \"object\"}\n{\"kind\": \"object\"}\n",
    )]);
    let temp = tempfile::tempdir().unwrap();
    let file = write_objects(
        temp.path(),
        r#"{"objects": [{"type": "user", "key": "alice"}, {"type": "user", "key": "bob"}]}"#,
    );
    let dir = RemoteDirectory::new(&server.url).unwrap();

    let transfer = Transfer::new();
    transfer.import(&dir, &[file]).await.unwrap();
    assert_eq!(transfer.counter().objects().count(), 2);

    let seen = server.requests.recv().unwrap();
    assert!(seen.complete);
    assert!(seen.text.starts_with("POST /api/v1/import HTTP/1.1"));
    let (_, body) = seen.text.split_once("\r\n\r\n").unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"alice\""));
    assert!(lines[1].contains("\"bob\""));
    server.handle.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn import_error_acknowledgement_fails_the_transfer() {
    let server = scripted(vec![(
        200,
        "application/jsonl",
        concat!(
            "{\"kind\": \"object\"}\n",
            "{\"error\": {\"kind\": \"Conflict\", \"message\": \"object user:bob rejected\"}}\n",
        ),
    )]);
    let temp = tempfile::tempdir().unwrap();
    let file = write_objects(
        temp.path(),
        r#"{"objects": [{"type": "user", "key": "alice"}, {"type": "user", "key": "bob"}]}"#,
    );
    let dir = RemoteDirectory::new(&server.url).unwrap();

    let err = Transfer::new().import(&dir, &[file]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Service);
    assert_eq!(err.message(), Some("object user:bob rejected"));
    assert!(server.requests.recv().unwrap().complete);
    server.handle.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_import_never_finishes_the_request_body() {
    let server = scripted(vec![(200, "application/jsonl", "")]);
    let temp = tempfile::tempdir().unwrap();
    let file = write_objects(
        temp.path(),
        r#"{"objects": [{"type": "user", "key": "alice"}, 42, {"type": "user", "key": "carol"}]}"#,
    );
    let dir = RemoteDirectory::new(&server.url).unwrap();

    let err = Transfer::new().import(&dir, &[file]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);

    let seen = server.requests.recv().unwrap();
    assert!(!seen.complete);
    assert!(!seen.text.contains("carol"));
    server.handle.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_skips_exported_records_with_unknown_fields() {
    let server = scripted(vec![(
        200,
        "application/jsonl",
        concat!(
            "{\"object_type\": {\"name\": \"user\"}}\n",
            "{\"object\": {\"type\": \"user\", \"key\": \"alice\", \"colour\": \"blue\"}}\n",
            "{\"object\": {\"type\": \"user\", \"key\": \"bob\"}}\n",
            "{\"relation\": {\"subject\": {\"type\": \"user\", \"key\": \"bob\"}, ",
            "\"relation\": \"viewer\", \"object\": {\"type\": \"doc\", \"key\": \"readme\"}}}\n",
        ),
    )]);
    let temp = tempfile::tempdir().unwrap();
    let dir = RemoteDirectory::new(&server.url).unwrap();

    let recorder = Arc::new(Recorder::default());
    let transfer = Transfer::new().with_observer(recorder.clone());
    transfer
        .backup(&dir, temp.path().join("backup.tar.gz"))
        .await
        .unwrap();

    assert_eq!(transfer.counter().object_types().count(), 1);
    assert_eq!(transfer.counter().objects().count(), 1);
    assert_eq!(transfer.counter().objects().skipped(), 1);
    assert_eq!(transfer.counter().relations().count(), 1);
    let finished = recorder.finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    assert!(finished[0][RecordKind::Object.index()].contains("WARNING"));
    assert!(!finished[0][RecordKind::Relation.index()].contains("WARNING"));

    let request = server.requests.recv().unwrap().text;
    assert!(request.starts_with("GET /api/v1/export?kinds="));
    server.handle.join().unwrap();
}
