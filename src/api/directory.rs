//! Purpose: Define the directory service boundary used by transfers and the manifest compiler.
//! Exports: `Directory`, `ExportOptions`, `ExportMessage`, `ExportStream`, `ImportStream`,
//! `ImportAbort`, `ImportRequest`, `ImportAck`, `Opcode`, `PageRequest`, `Page`, `STREAM_BUFFER`.
//! Role: Seam between transfer logic and a concrete service (HTTP remote or in-memory).
//! Invariants: Unary reads report a missing entity as `ErrorKind::NotFound`.
//! Invariants: Every import request the service accepts yields exactly one acknowledgement.
//! Invariants: A stream error ends the stream, except a schema mismatch on a single export item.
//! Invariants: An import whose sender stopped early is flagged aborted before `requests` closes.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::error::{Error, ErrorKind};
use crate::core::kind::RecordKind;
use crate::core::record::{Object, ObjectType, Permission, Record, Relation, RelationType};

/// Capacity of the bounded channels carrying stream items.
pub const STREAM_BUFFER: usize = 256;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportOptions {
    pub kinds: Vec<RecordKind>,
}

impl ExportOptions {
    pub fn all() -> Self {
        Self {
            kinds: RecordKind::ALL.to_vec(),
        }
    }

    pub fn data() -> Self {
        Self {
            kinds: RecordKind::DATA.to_vec(),
        }
    }

    pub fn includes(&self, kind: RecordKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// One item of an export stream. Tags this client does not know arrive as `Unknown`.
#[derive(Clone, Debug, PartialEq)]
pub enum ExportMessage {
    ObjectType(ObjectType),
    Permission(Permission),
    RelationType(RelationType),
    Object(Object),
    Relation(Relation),
    Unknown(String),
}

impl ExportMessage {
    /// Decode a single-key envelope such as `{"object": {...}}`.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(map) = value else {
            return Err(Error::new(ErrorKind::Format)
                .with_message("export message must be a JSON object"));
        };
        if map.len() != 1 {
            return Err(Error::new(ErrorKind::Format)
                .with_message(format!("export message must have one key, found {}", map.len())));
        }
        let Some((tag, body)) = map.into_iter().next() else {
            return Err(Error::new(ErrorKind::Format).with_message("empty export message"));
        };
        let Some(kind) = kind_from_tag(&tag) else {
            return Ok(ExportMessage::Unknown(tag));
        };
        Record::decode(kind, body).map(ExportMessage::from)
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        match self {
            ExportMessage::Unknown(tag) => {
                let mut map = serde_json::Map::new();
                map.insert(tag.clone(), Value::Object(serde_json::Map::new()));
                Ok(Value::Object(map))
            }
            other => {
                let Some(record) = other.clone().into_record() else {
                    return Err(Error::new(ErrorKind::Internal).with_message("unreachable tag"));
                };
                serde_json::to_value(&record).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to encode export message")
                        .with_source(err)
                })
            }
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            ExportMessage::ObjectType(inner) => Some(Record::ObjectType(inner)),
            ExportMessage::Permission(inner) => Some(Record::Permission(inner)),
            ExportMessage::RelationType(inner) => Some(Record::RelationType(inner)),
            ExportMessage::Object(inner) => Some(Record::Object(inner)),
            ExportMessage::Relation(inner) => Some(Record::Relation(inner)),
            ExportMessage::Unknown(_) => None,
        }
    }
}

impl From<Record> for ExportMessage {
    fn from(record: Record) -> Self {
        match record {
            Record::ObjectType(inner) => ExportMessage::ObjectType(inner),
            Record::Permission(inner) => ExportMessage::Permission(inner),
            Record::RelationType(inner) => ExportMessage::RelationType(inner),
            Record::Object(inner) => ExportMessage::Object(inner),
            Record::Relation(inner) => ExportMessage::Relation(inner),
        }
    }
}

fn kind_from_tag(tag: &str) -> Option<RecordKind> {
    match tag {
        "object_type" => Some(RecordKind::ObjectType),
        "permission" => Some(RecordKind::Permission),
        "relation_type" => Some(RecordKind::RelationType),
        "object" => Some(RecordKind::Object),
        "relation" => Some(RecordKind::Relation),
        _ => None,
    }
}

/// Receiving half of a server-streamed export.
pub struct ExportStream {
    pub messages: mpsc::Receiver<Result<ExportMessage, Error>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Set,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub opcode: Opcode,
    #[serde(flatten)]
    pub record: Record,
}

impl ImportRequest {
    pub fn set(record: Record) -> Self {
        Self {
            opcode: Opcode::Set,
            record,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImportAck {
    pub kind: RecordKind,
}

/// Shared flag telling the directory that a closed request channel means abort, not done.
#[derive(Clone, Debug, Default)]
pub struct ImportAbort(Arc<AtomicBool>);

impl ImportAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Both halves of a bidirectional import. Dropping `requests` closes the send side;
/// call `abort.abort()` first when the close is not a normal end of input.
pub struct ImportStream {
    pub requests: mpsc::Sender<ImportRequest>,
    pub acks: mpsc::Receiver<Result<ImportAck, Error>>,
    pub abort: ImportAbort,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageRequest {
    pub token: String,
    pub size: u32,
}

impl PageRequest {
    pub fn first() -> Self {
        Self {
            token: String::new(),
            size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn next(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    /// Empty on the last page.
    #[serde(default)]
    pub next_token: String,
}

/// A directory service holding the authorization model and its data.
///
/// Unary calls block; streaming calls return channel halves and require a tokio runtime.
pub trait Directory: Send + Sync {
    fn get_object_type(&self, name: &str) -> Result<ObjectType, Error>;
    fn set_object_type(&self, object_type: ObjectType) -> Result<ObjectType, Error>;

    fn get_permission(&self, name: &str) -> Result<Permission, Error>;
    fn set_permission(&self, permission: Permission) -> Result<Permission, Error>;

    fn get_relation_type(&self, object_type: &str, name: &str) -> Result<RelationType, Error>;
    fn set_relation_type(&self, relation_type: RelationType) -> Result<RelationType, Error>;

    fn list_object_types(&self, page: &PageRequest) -> Result<Page<ObjectType>, Error>;
    fn list_relation_types(
        &self,
        object_type: &str,
        page: &PageRequest,
    ) -> Result<Page<RelationType>, Error>;

    fn export(&self, options: &ExportOptions) -> Result<ExportStream, Error>;
    fn import(&self) -> Result<ImportStream, Error>;
}

#[cfg(test)]
mod tests {
    use super::{ExportMessage, ImportRequest};
    use crate::core::error::ErrorKind;
    use crate::core::record::{Object, Record};
    use serde_json::json;

    #[test]
    fn unknown_tag_is_kept_not_rejected() {
        let message = ExportMessage::from_value(json!({"audit_event": {"id": 1}})).expect("decode");
        assert_eq!(message, ExportMessage::Unknown("audit_event".to_string()));
        assert!(message.into_record().is_none());
    }

    #[test]
    fn known_tag_decodes_record() {
        let message =
            ExportMessage::from_value(json!({"object": {"type": "user", "key": "alice"}}))
                .expect("decode");
        let ExportMessage::Object(object) = message else {
            panic!("expected object");
        };
        assert_eq!(object.key, "alice");
    }

    #[test]
    fn unknown_field_inside_known_tag_is_schema_error() {
        let err = ExportMessage::from_value(json!({"permission": {"name": "read", "scope": 1}}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn import_request_carries_opcode_beside_record() {
        let request = ImportRequest::set(Record::Object(Object {
            object_type: "user".to_string(),
            key: "alice".to_string(),
            ..Object::default()
        }));
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(
            value,
            json!({"opcode": "set", "object": {"type": "user", "key": "alice"}})
        );
        let back: ImportRequest = serde_json::from_value(value).expect("decode");
        assert_eq!(back, request);
    }
}
