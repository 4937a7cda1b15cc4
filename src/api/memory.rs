//! Purpose: Provide an in-process directory that honors the same contract as the remote service.
//! Exports: `MemoryDirectory`.
//! Role: Test fake for backups, restores, imports, and manifest loads; never used by the CLI.
//! Invariants: Writes are validated against already-stored model entities, like the real service.
//! Invariants: Union members are only checked on unary sets; imports may reference later ones.
//! Invariants: Every successful set assigns a fresh hash; a stale non-empty hash is rejected.
//! Invariants: An import error is acknowledged once and then ends the import stream.
//! Invariants: An aborted import keeps the records already applied and is counted, not acked.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use super::directory::{
    Directory, ExportMessage, ExportOptions, ExportStream, ImportAbort, ImportAck, ImportRequest,
    ImportStream,
    Page, PageRequest, STREAM_BUFFER,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::kind::RecordKind;
use crate::core::record::{Object, ObjectType, Permission, Record, Relation, RelationType};

type RelationKey = (String, String, String, String, String);

#[derive(Default)]
struct Store {
    object_types: BTreeMap<String, ObjectType>,
    permissions: BTreeMap<String, Permission>,
    relation_types: BTreeMap<(String, String), RelationType>,
    objects: BTreeMap<(String, String), Object>,
    relations: BTreeMap<RelationKey, Relation>,
    extra_exports: Vec<ExportMessage>,
    rejected: BTreeSet<String>,
    calls: Vec<String>,
    aborted_imports: u64,
    revision: u64,
}

#[derive(Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<Store>>,
}

fn service_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Service).with_message(message)
}

fn not_found(what: &str, name: &str) -> Error {
    Error::new(ErrorKind::NotFound).with_message(format!("{what} `{name}` not found"))
}

fn check_hash(current: Option<&str>, requested: &str, label: &str) -> Result<(), Error> {
    match current {
        Some(current) if !requested.is_empty() && current != requested => Err(service_error(
            format!("hash mismatch for `{label}`: the entity changed since it was read"),
        )),
        _ => Ok(()),
    }
}

/// Resolve a union member against its owning object type: `rel` or `type#rel`.
fn union_target<'a>(object_type: &'a str, member: &'a str) -> (&'a str, &'a str) {
    match member.split_once('#') {
        Some((other, relation)) => (other, relation),
        None => (object_type, member),
    }
}

impl Store {
    fn next_hash(&mut self) -> String {
        self.revision += 1;
        format!("{:016x}", self.revision)
    }

    fn apply(&mut self, record: Record) -> Result<Record, Error> {
        let label = record.label();
        if self.rejected.contains(&label) {
            return Err(service_error(format!("`{label}` rejected by directory"))
                .with_record(record.kind()));
        }
        // Imports overwrite; hashes from another directory mean nothing here.
        match record {
            Record::ObjectType(mut inner) => {
                inner.hash.clear();
                self.put_object_type(inner).map(Record::ObjectType)
            }
            Record::Permission(mut inner) => {
                inner.hash.clear();
                self.put_permission(inner).map(Record::Permission)
            }
            Record::RelationType(mut inner) => {
                inner.hash.clear();
                self.put_relation_type(inner, false).map(Record::RelationType)
            }
            Record::Object(inner) => self.put_object(inner).map(Record::Object),
            Record::Relation(inner) => self.put_relation(inner).map(Record::Relation),
        }
    }

    fn put_object_type(&mut self, mut object_type: ObjectType) -> Result<ObjectType, Error> {
        if object_type.name.is_empty() {
            return Err(service_error("object type name must not be empty"));
        }
        let current = self.object_types.get(&object_type.name).map(|v| v.hash.as_str());
        check_hash(current, &object_type.hash, &object_type.name)?;
        object_type.hash = self.next_hash();
        self.object_types
            .insert(object_type.name.clone(), object_type.clone());
        Ok(object_type)
    }

    fn put_permission(&mut self, mut permission: Permission) -> Result<Permission, Error> {
        if permission.name.is_empty() {
            return Err(service_error("permission name must not be empty"));
        }
        let current = self.permissions.get(&permission.name).map(|v| v.hash.as_str());
        check_hash(current, &permission.hash, &permission.name)?;
        permission.hash = self.next_hash();
        self.permissions
            .insert(permission.name.clone(), permission.clone());
        Ok(permission)
    }

    /// Bulk imports replay relation types in stored order, so union members may arrive later.
    fn put_relation_type(
        &mut self,
        mut relation_type: RelationType,
        check_unions: bool,
    ) -> Result<RelationType, Error> {
        let label = format!("{}#{}", relation_type.object_type, relation_type.name);
        if relation_type.name.is_empty() {
            return Err(service_error("relation type name must not be empty"));
        }
        if !self.object_types.contains_key(&relation_type.object_type) {
            return Err(service_error(format!(
                "relation type `{label}` refers to unknown object type `{}`",
                relation_type.object_type
            )));
        }
        for member in relation_type.unions.iter().filter(|_| check_unions) {
            let (other, relation) = union_target(&relation_type.object_type, member);
            let key = (other.to_string(), relation.to_string());
            if !self.relation_types.contains_key(&key) {
                return Err(service_error(format!(
                    "relation type `{label}` unions unknown relation `{other}#{relation}`"
                )));
            }
        }
        for permission in &relation_type.permissions {
            if !self.permissions.contains_key(permission) {
                return Err(service_error(format!(
                    "relation type `{label}` grants unknown permission `{permission}`"
                )));
            }
        }
        let key = (relation_type.object_type.clone(), relation_type.name.clone());
        let current = self.relation_types.get(&key).map(|v| v.hash.as_str());
        check_hash(current, &relation_type.hash, &label)?;
        relation_type.hash = self.next_hash();
        self.relation_types.insert(key, relation_type.clone());
        Ok(relation_type)
    }

    fn put_object(&mut self, mut object: Object) -> Result<Object, Error> {
        if !self.object_types.contains_key(&object.object_type) {
            return Err(service_error(format!(
                "object `{}:{}` has unknown type",
                object.object_type, object.key
            ))
            .with_record(RecordKind::Object));
        }
        if object.key.is_empty() {
            return Err(service_error("object key must not be empty").with_record(RecordKind::Object));
        }
        object.hash = self.next_hash();
        self.objects.insert(
            (object.object_type.clone(), object.key.clone()),
            object.clone(),
        );
        Ok(object)
    }

    fn put_relation(&mut self, mut relation: Relation) -> Result<Relation, Error> {
        let relation_key = (
            relation.object.object_type.clone(),
            relation.relation.clone(),
        );
        if !self.relation_types.contains_key(&relation_key) {
            return Err(service_error(format!(
                "relation `{}#{}` is not defined",
                relation_key.0, relation_key.1
            ))
            .with_record(RecordKind::Relation));
        }
        if !self.object_types.contains_key(&relation.subject.object_type) {
            return Err(service_error(format!(
                "relation subject has unknown type `{}`",
                relation.subject.object_type
            ))
            .with_record(RecordKind::Relation));
        }
        relation.hash = self.next_hash();
        let key = (
            relation.object.object_type.clone(),
            relation.object.key.clone(),
            relation.relation.clone(),
            relation.subject.object_type.clone(),
            relation.subject.key.clone(),
        );
        self.relations.insert(key, relation.clone());
        Ok(relation)
    }

    fn snapshot(&self, options: &ExportOptions) -> Vec<ExportMessage> {
        let mut out = Vec::new();
        for kind in RecordKind::ALL {
            if !options.includes(kind) {
                continue;
            }
            match kind {
                RecordKind::ObjectType => out.extend(
                    self.object_types
                        .values()
                        .cloned()
                        .map(ExportMessage::ObjectType),
                ),
                RecordKind::Permission => out.extend(
                    self.permissions
                        .values()
                        .cloned()
                        .map(ExportMessage::Permission),
                ),
                RecordKind::RelationType => out.extend(
                    self.relation_types
                        .values()
                        .cloned()
                        .map(ExportMessage::RelationType),
                ),
                RecordKind::Object => {
                    out.extend(self.objects.values().cloned().map(ExportMessage::Object))
                }
                RecordKind::Relation => {
                    out.extend(self.relations.values().cloned().map(ExportMessage::Relation))
                }
            }
        }
        out
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: &PageRequest) -> Result<Page<T>, Error> {
    let start = if page.token.is_empty() {
        0
    } else {
        page.token.parse::<usize>().map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid page token `{}`", page.token))
                .with_source(err)
        })?
    };
    let size = page.size.max(1) as usize;
    let end = (start + size).min(items.len());
    let results = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    let next_token = if end < items.len() {
        end.to_string()
    } else {
        String::new()
    };
    Ok(Page {
        results,
        next_token,
    })
}

fn runtime() -> Result<Handle, Error> {
    Handle::try_current().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("streaming calls require a tokio runtime")
            .with_source(err)
    })
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record as an import would, applying the same validation.
    pub fn insert(&self, record: Record) -> Result<(), Error> {
        self.lock().apply(record).map(|_| ())
    }

    /// Make every later write of the record with this label fail.
    pub fn reject(&self, label: impl Into<String>) {
        self.lock().rejected.insert(label.into());
    }

    /// Append a message to every later export, after the stored records.
    pub fn push_export(&self, message: ExportMessage) {
        self.lock().extra_exports.push(message);
    }

    /// Unary set calls in the order they were made, e.g. `set_relation_type doc#editor`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Imports whose sender closed the request side after flagging an abort.
    pub fn aborted_imports(&self) -> u64 {
        self.lock().aborted_imports
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        let store = self.lock();
        match kind {
            RecordKind::ObjectType => store.object_types.len(),
            RecordKind::Permission => store.permissions.len(),
            RecordKind::RelationType => store.relation_types.len(),
            RecordKind::Object => store.objects.len(),
            RecordKind::Relation => store.relations.len(),
        }
    }

    pub fn records(&self, kind: RecordKind) -> Vec<Record> {
        let options = ExportOptions { kinds: vec![kind] };
        self.lock()
            .snapshot(&options)
            .into_iter()
            .filter_map(ExportMessage::into_record)
            .collect()
    }

    fn record_call(store: &mut Store, call: String) {
        debug!(call = %call, "memory directory call");
        store.calls.push(call);
    }
}

impl Directory for MemoryDirectory {
    fn get_object_type(&self, name: &str) -> Result<ObjectType, Error> {
        self.lock()
            .object_types
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("object type", name))
    }

    fn set_object_type(&self, object_type: ObjectType) -> Result<ObjectType, Error> {
        let mut store = self.lock();
        Self::record_call(&mut store, format!("set_object_type {}", object_type.name));
        store.put_object_type(object_type)
    }

    fn get_permission(&self, name: &str) -> Result<Permission, Error> {
        self.lock()
            .permissions
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("permission", name))
    }

    fn set_permission(&self, permission: Permission) -> Result<Permission, Error> {
        let mut store = self.lock();
        Self::record_call(&mut store, format!("set_permission {}", permission.name));
        store.put_permission(permission)
    }

    fn get_relation_type(&self, object_type: &str, name: &str) -> Result<RelationType, Error> {
        self.lock()
            .relation_types
            .get(&(object_type.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("relation type", &format!("{object_type}#{name}")))
    }

    fn set_relation_type(&self, relation_type: RelationType) -> Result<RelationType, Error> {
        let mut store = self.lock();
        Self::record_call(
            &mut store,
            format!(
                "set_relation_type {}#{}",
                relation_type.object_type, relation_type.name
            ),
        );
        store.put_relation_type(relation_type, true)
    }

    fn list_object_types(&self, page: &PageRequest) -> Result<Page<ObjectType>, Error> {
        let items: Vec<ObjectType> = self.lock().object_types.values().cloned().collect();
        paginate(items, page)
    }

    fn list_relation_types(
        &self,
        object_type: &str,
        page: &PageRequest,
    ) -> Result<Page<RelationType>, Error> {
        let items: Vec<RelationType> = self
            .lock()
            .relation_types
            .values()
            .filter(|relation_type| relation_type.object_type == object_type)
            .cloned()
            .collect();
        paginate(items, page)
    }

    fn export(&self, options: &ExportOptions) -> Result<ExportStream, Error> {
        let handle = runtime()?;
        let snapshot = {
            let store = self.lock();
            let mut snapshot = store.snapshot(options);
            snapshot.extend(store.extra_exports.iter().cloned());
            snapshot
        };
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        handle.spawn(async move {
            for message in snapshot {
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        });
        Ok(ExportStream { messages: rx })
    }

    fn import(&self) -> Result<ImportStream, Error> {
        let handle = runtime()?;
        let (request_tx, mut request_rx) = mpsc::channel::<ImportRequest>(STREAM_BUFFER);
        let (ack_tx, ack_rx) = mpsc::channel(STREAM_BUFFER);
        let abort = ImportAbort::new();
        let directory = self.clone();
        let aborted = abort.clone();
        handle.spawn(async move {
            loop {
                let Some(request) = request_rx.recv().await else {
                    if aborted.is_aborted() {
                        debug!("import aborted by sender");
                        directory.lock().aborted_imports += 1;
                    }
                    break;
                };
                let kind = request.record.kind();
                let applied = directory.insert(request.record);
                match applied {
                    // Keep reading after the ack side goes away so the close is still observed.
                    Ok(()) => {
                        let _ = ack_tx.send(Ok(ImportAck { kind })).await;
                    }
                    Err(err) => {
                        let _ = ack_tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });
        Ok(ImportStream {
            requests: request_tx,
            acks: ack_rx,
            abort,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryDirectory;
    use crate::api::directory::{Directory, PageRequest};
    use crate::core::error::ErrorKind;
    use crate::core::record::{ObjectType, Permission, RelationType};

    fn object_type(name: &str) -> ObjectType {
        ObjectType {
            name: name.to_string(),
            ..ObjectType::default()
        }
    }

    #[test]
    fn get_missing_is_not_found() {
        let dir = MemoryDirectory::new();
        let err = dir.get_object_type("user").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn stale_hash_is_rejected() {
        let dir = MemoryDirectory::new();
        let first = dir.set_object_type(object_type("user")).expect("set");
        let second = dir
            .set_object_type(ObjectType {
                hash: first.hash.clone(),
                ..object_type("user")
            })
            .expect("set with current hash");
        assert_ne!(first.hash, second.hash);

        let err = dir
            .set_object_type(ObjectType {
                hash: first.hash,
                ..object_type("user")
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Service);
    }

    #[test]
    fn relation_type_requires_its_dependencies() {
        let dir = MemoryDirectory::new();
        dir.set_object_type(object_type("doc")).expect("set");
        let editor = RelationType {
            object_type: "doc".to_string(),
            name: "editor".to_string(),
            unions: vec!["viewer".to_string()],
            ..RelationType::default()
        };
        assert_eq!(
            dir.set_relation_type(editor.clone()).unwrap_err().kind(),
            ErrorKind::Service
        );

        dir.set_relation_type(RelationType {
            object_type: "doc".to_string(),
            name: "viewer".to_string(),
            ..RelationType::default()
        })
        .expect("viewer");
        dir.set_relation_type(editor).expect("editor after viewer");

        let granted = RelationType {
            object_type: "doc".to_string(),
            name: "owner".to_string(),
            permissions: vec!["delete".to_string()],
            ..RelationType::default()
        };
        assert!(dir.set_relation_type(granted.clone()).is_err());
        dir.set_permission(Permission {
            name: "delete".to_string(),
            ..Permission::default()
        })
        .expect("permission");
        dir.set_relation_type(granted).expect("owner");
    }

    #[test]
    fn listing_pages_until_token_is_empty() {
        let dir = MemoryDirectory::new();
        for name in ["a", "b", "c"] {
            dir.set_object_type(object_type(name)).expect("set");
        }
        let mut page = PageRequest {
            token: String::new(),
            size: 2,
        };
        let mut names = Vec::new();
        loop {
            let result = dir.list_object_types(&page).expect("list");
            names.extend(result.results.into_iter().map(|t| t.name));
            if result.next_token.is_empty() {
                break;
            }
            page.token = result.next_token;
        }
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn streaming_outside_runtime_is_an_error() {
        let dir = MemoryDirectory::new();
        let err = dir.import().err().expect("error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
