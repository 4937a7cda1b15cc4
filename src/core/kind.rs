//! Purpose: Name the five record kinds moved between a directory and local files.
//! Exports: `RecordKind`.
//! Role: Single source of truth for root keys, archive member names, and replay order.
//! Invariants: `RecordKind::ALL` is replay order: types, permissions, relation types, objects, relations.
//! Invariants: Root keys and member names are part of the on-disk format and never change.
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    ObjectType,
    Permission,
    RelationType,
    Object,
    Relation,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::ObjectType,
        RecordKind::Permission,
        RecordKind::RelationType,
        RecordKind::Object,
        RecordKind::Relation,
    ];

    /// Kinds carried by a data-only export.
    pub const DATA: [RecordKind; 2] = [RecordKind::Object, RecordKind::Relation];

    pub fn root_key(self) -> &'static str {
        match self {
            RecordKind::ObjectType => "object_types",
            RecordKind::Permission => "permissions",
            RecordKind::RelationType => "relation_types",
            RecordKind::Object => "objects",
            RecordKind::Relation => "relations",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::ObjectType => "object_types.json",
            RecordKind::Permission => "permissions.json",
            RecordKind::RelationType => "relation_types.json",
            RecordKind::Object => "objects.json",
            RecordKind::Relation => "relations.json",
        }
    }

    /// Human label used in progress and summary rows.
    pub fn label(self) -> &'static str {
        match self {
            RecordKind::ObjectType => "object types",
            RecordKind::Permission => "permissions",
            RecordKind::RelationType => "relation types",
            RecordKind::Object => "objects",
            RecordKind::Relation => "relations",
        }
    }

    pub fn index(self) -> usize {
        match self {
            RecordKind::ObjectType => 0,
            RecordKind::Permission => 1,
            RecordKind::RelationType => 2,
            RecordKind::Object => 3,
            RecordKind::Relation => 4,
        }
    }

    pub fn from_root_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.root_key() == key)
    }

    /// Match an archive member name, ignoring any leading `./` or directory prefix.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        Self::ALL.into_iter().find(|kind| kind.file_name() == base)
    }
}
