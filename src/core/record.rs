//! Purpose: Define the five record shapes carried by archives and import/export streams.
//! Exports: `ObjectType`, `Permission`, `RelationType`, `Object`, `Relation`, `ObjectRef`, `Record`.
//! Role: Typed payloads; the transfer core treats each as an atomic unit.
//! Invariants: Field names are camelCase on the wire; unknown fields are rejected, never dropped.
//! Invariants: `Record::decode` reports unknown fields as `ErrorKind::Schema`, other shape errors as `Format`.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{Error, ErrorKind};
use super::kind::RecordKind;

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectType {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_subject: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ordinal: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Permission {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelationType {
    pub object_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ordinal: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Object {
    #[serde(rename = "type")]
    pub object_type: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectRef {
    #[serde(rename = "type")]
    pub object_type: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Relation {
    pub subject: ObjectRef,
    pub relation: String,
    pub object: ObjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl ObjectRef {
    pub fn new(object_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            key: key.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Record {
    ObjectType(ObjectType),
    Permission(Permission),
    RelationType(RelationType),
    Object(Object),
    Relation(Relation),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::ObjectType(_) => RecordKind::ObjectType,
            Record::Permission(_) => RecordKind::Permission,
            Record::RelationType(_) => RecordKind::RelationType,
            Record::Object(_) => RecordKind::Object,
            Record::Relation(_) => RecordKind::Relation,
        }
    }

    /// Decode one JSON value as a record of `kind`.
    pub fn decode(kind: RecordKind, value: Value) -> Result<Self, Error> {
        let decoded = match kind {
            RecordKind::ObjectType => serde_json::from_value(value).map(Record::ObjectType),
            RecordKind::Permission => serde_json::from_value(value).map(Record::Permission),
            RecordKind::RelationType => serde_json::from_value(value).map(Record::RelationType),
            RecordKind::Object => serde_json::from_value(value).map(Record::Object),
            RecordKind::Relation => serde_json::from_value(value).map(Record::Relation),
        };
        decoded.map_err(|err| classify_decode_error(kind, err))
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        let encoded = match self {
            Record::ObjectType(inner) => serde_json::to_value(inner),
            Record::Permission(inner) => serde_json::to_value(inner),
            Record::RelationType(inner) => serde_json::to_value(inner),
            Record::Object(inner) => serde_json::to_value(inner),
            Record::Relation(inner) => serde_json::to_value(inner),
        };
        encoded.map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode record")
                .with_record(self.kind())
                .with_source(err)
        })
    }

    /// Short identity used in diagnostics, e.g. `doc:readme` or `doc#viewer`.
    pub fn label(&self) -> String {
        match self {
            Record::ObjectType(inner) => inner.name.clone(),
            Record::Permission(inner) => inner.name.clone(),
            Record::RelationType(inner) => format!("{}#{}", inner.object_type, inner.name),
            Record::Object(inner) => format!("{}:{}", inner.object_type, inner.key),
            Record::Relation(inner) => format!(
                "{}:{}#{}@{}:{}",
                inner.object.object_type,
                inner.object.key,
                inner.relation,
                inner.subject.object_type,
                inner.subject.key
            ),
        }
    }
}

fn classify_decode_error(kind: RecordKind, err: serde_json::Error) -> Error {
    let text = err.to_string();
    let error_kind = if text.starts_with("unknown field") {
        ErrorKind::Schema
    } else {
        ErrorKind::Format
    };
    Error::new(error_kind)
        .with_message(text)
        .with_record(kind)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{Object, ObjectRef, Record, Relation};
    use crate::core::error::ErrorKind;
    use crate::core::kind::RecordKind;
    use serde_json::json;

    #[test]
    fn decode_accepts_camel_case_fields() {
        let value = json!({
            "objectType": "doc",
            "name": "viewer",
            "displayName": "doc:viewer",
            "unions": ["editor"]
        });
        let record = Record::decode(RecordKind::RelationType, value).expect("decode");
        let Record::RelationType(relation_type) = record else {
            panic!("expected relation type");
        };
        assert_eq!(relation_type.object_type, "doc");
        assert_eq!(relation_type.unions, vec!["editor".to_string()]);
        assert!(relation_type.permissions.is_empty());
    }

    #[test]
    fn unknown_field_is_schema_error() {
        let value = json!({"type": "user", "key": "alice", "colour": "blue"});
        let err = Record::decode(RecordKind::Object, value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert_eq!(err.record(), Some(RecordKind::Object));
    }

    #[test]
    fn missing_field_is_format_error() {
        let value = json!({"type": "user"});
        let err = Record::decode(RecordKind::Object, value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn encode_omits_empty_fields() {
        let record = Record::Object(Object {
            object_type: "user".to_string(),
            key: "alice".to_string(),
            ..Object::default()
        });
        let value = record.to_value().expect("encode");
        assert_eq!(value, json!({"type": "user", "key": "alice"}));
    }

    #[test]
    fn relation_label_reads_object_first() {
        let record = Record::Relation(Relation {
            subject: ObjectRef::new("user", "alice"),
            relation: "viewer".to_string(),
            object: ObjectRef::new("doc", "readme"),
            ..Relation::default()
        });
        assert_eq!(record.label(), "doc:readme#viewer@user:alice");
    }
}
