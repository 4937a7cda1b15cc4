//! Purpose: Compile a declarative authorization manifest into ordered directory writes, and back.
//! Exports: `Manifest`, `RelationSpec`, `Plan`, `Step`, `plan`, `load`, `save`.
//! Role: Model bootstrap for the `load` and `save` commands.
//! Invariants: Object types, then permissions, then base relation types precede any union.
//! Invariants: A union relation type is written only after every relation it names exists.
//! Invariants: Cycles and undefined union references fail planning, before any write.
//! Invariants: Every write reads the current entity first and carries its hash (get-then-set).
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::directory::{Directory, PageRequest};
use crate::core::counter::Counter;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{ObjectType, Permission, RelationType};

/// Relations and permissions declared for one relation of an object type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationSpec {
    /// `relation` on the same object type, or `type#relation` on another.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub union: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// Object type name to relation name to relation spec.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Manifest {
    pub object_types: BTreeMap<String, BTreeMap<String, RelationSpec>>,
}

type RawManifest = Option<BTreeMap<String, Option<BTreeMap<String, Option<RelationSpec>>>>>;

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let raw: RawManifest = serde_yaml::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Format)
                .with_message(format!("invalid manifest: {err}"))
                .with_hint("Relations accept only `union` and `permissions` lists.")
                .with_source(err)
        })?;
        let object_types = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(name, relations)| {
                let relations = relations
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(relation, spec)| (relation, spec.unwrap_or_default()))
                    .collect();
                (name, relations)
            })
            .collect();
        Ok(Self { object_types })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message("failed to read manifest")
                .with_path(path)
                .with_source(err)
        })?;
        Self::parse(&text).map_err(|err| err.with_path(path))
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode manifest")
                .with_source(err)
        })
    }

    /// Write the manifest, readable only by the owner on unix.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        use std::io::Write;

        let path = path.as_ref();
        let text = self.to_yaml()?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let write_err = |err: std::io::Error| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write manifest")
                .with_path(path)
                .with_source(err)
        };
        let mut file = options.open(path).map_err(write_err)?;
        file.write_all(text.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)
    }

    pub fn is_empty(&self) -> bool {
        self.object_types.is_empty()
    }
}

/// One directory write produced by planning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    ObjectType {
        name: String,
    },
    Permission {
        name: String,
    },
    RelationType {
        object_type: String,
        name: String,
        unions: Vec<String>,
        permissions: Vec<String>,
    },
}

impl Step {
    pub fn describe(&self) -> String {
        match self {
            Step::ObjectType { name } => format!("object type {name}"),
            Step::Permission { name } => format!("permission {name}"),
            Step::RelationType {
                object_type,
                name,
                unions,
                permissions,
            } => format!(
                "relation type {object_type}#{name} (unions: [{}], permissions: [{}])",
                unions.join(", "),
                permissions.join(", ")
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

type RelationKey = (String, String);

fn union_key(object_type: &str, member: &str) -> RelationKey {
    match member.split_once('#') {
        Some((other, relation)) => (other.to_string(), relation.to_string()),
        None => (object_type.to_string(), member.to_string()),
    }
}

fn dependency_error(message: String) -> Error {
    Error::new(ErrorKind::Dependency)
        .with_message(message)
        .with_hint("Every union member must name a relation defined in the manifest, without cycles.")
}

/// Order the manifest's writes so each union relation type follows everything it names.
pub fn plan(manifest: &Manifest) -> Result<Plan, Error> {
    let mut steps = Vec::new();

    for name in manifest.object_types.keys() {
        steps.push(Step::ObjectType { name: name.clone() });
    }

    let mut seen = HashSet::new();
    for relations in manifest.object_types.values() {
        for spec in relations.values() {
            for permission in &spec.permissions {
                if seen.insert(permission.as_str()) {
                    steps.push(Step::Permission {
                        name: permission.clone(),
                    });
                }
            }
        }
    }

    let mut defined: BTreeSet<RelationKey> = BTreeSet::new();
    let mut pending: BTreeMap<RelationKey, &RelationSpec> = BTreeMap::new();
    for (object_type, relations) in &manifest.object_types {
        for (name, spec) in relations {
            let key = (object_type.clone(), name.clone());
            defined.insert(key.clone());
            if spec.union.is_empty() {
                steps.push(Step::RelationType {
                    object_type: object_type.clone(),
                    name: name.clone(),
                    unions: Vec::new(),
                    permissions: spec.permissions.clone(),
                });
            } else {
                pending.insert(key, spec);
            }
        }
    }

    // Kahn's algorithm over union entries; base relations are already satisfied.
    let mut waiting_on: BTreeMap<&RelationKey, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<RelationKey, Vec<&RelationKey>> = BTreeMap::new();
    let mut undefined = Vec::new();
    for (key, spec) in &pending {
        let mut count = 0;
        for member in &spec.union {
            let target = union_key(&key.0, member);
            if !defined.contains(&target) {
                undefined.push(format!("{}#{} -> {}#{}", key.0, key.1, target.0, target.1));
            } else if pending.contains_key(&target) {
                count += 1;
                dependents.entry(target).or_default().push(key);
            }
        }
        waiting_on.insert(key, count);
    }
    if !undefined.is_empty() {
        return Err(dependency_error(format!(
            "union references undefined relations: {}",
            undefined.join(", ")
        )));
    }

    let mut ready: VecDeque<&RelationKey> = waiting_on
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(key, _)| *key)
        .collect();
    let mut ordered: Vec<&RelationKey> = Vec::with_capacity(pending.len());
    while let Some(key) = ready.pop_front() {
        ordered.push(key);
        if let Some(next) = dependents.get(key) {
            for &dependent in next {
                if let Some(count) = waiting_on.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }
    }
    if ordered.len() < pending.len() {
        let stuck: Vec<String> = waiting_on
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(key, _)| format!("{}#{}", key.0, key.1))
            .collect();
        return Err(dependency_error(format!(
            "union relations form a cycle: {}",
            stuck.join(", ")
        )));
    }

    for key in &ordered {
        if let Some(spec) = pending.get(*key) {
            steps.push(Step::RelationType {
                object_type: key.0.clone(),
                name: key.1.clone(),
                unions: spec.union.clone(),
                permissions: Vec::new(),
            });
        }
    }
    for key in &ordered {
        if let Some(spec) = pending.get(*key).filter(|spec| !spec.permissions.is_empty()) {
            steps.push(Step::RelationType {
                object_type: key.0.clone(),
                name: key.1.clone(),
                unions: spec.union.clone(),
                permissions: spec.permissions.clone(),
            });
        }
    }

    Ok(Plan { steps })
}

fn missing_ok<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn step_error(step: &Step, err: Error) -> Error {
    Error::new(err.kind())
        .with_message(format!("failed to set {}", step.describe()))
        .with_source(err)
}

fn apply<D: Directory>(dir: &D, step: &Step) -> Result<(), Error> {
    match step {
        Step::ObjectType { name } => {
            let hash = missing_ok(dir.get_object_type(name))?
                .map(|current| current.hash)
                .unwrap_or_default();
            dir.set_object_type(ObjectType {
                name: name.clone(),
                display_name: name.clone(),
                hash,
                ..ObjectType::default()
            })?;
        }
        Step::Permission { name } => {
            let hash = missing_ok(dir.get_permission(name))?
                .map(|current| current.hash)
                .unwrap_or_default();
            dir.set_permission(Permission {
                name: name.clone(),
                display_name: name.clone(),
                hash,
                ..Permission::default()
            })?;
        }
        Step::RelationType {
            object_type,
            name,
            unions,
            permissions,
        } => {
            let hash = missing_ok(dir.get_relation_type(object_type, name))?
                .map(|current| current.hash)
                .unwrap_or_default();
            dir.set_relation_type(RelationType {
                object_type: object_type.clone(),
                name: name.clone(),
                display_name: format!("{object_type}:{name}"),
                unions: unions.clone(),
                permissions: permissions.clone(),
                hash,
                ..RelationType::default()
            })?;
        }
    }
    Ok(())
}

/// Plan the manifest, then apply each write in order, counting writes per kind.
pub fn load<D: Directory>(dir: &D, manifest: &Manifest, counter: &Counter) -> Result<Plan, Error> {
    let plan = plan(manifest)?;
    debug!(steps = plan.steps.len(), "manifest planned");
    for step in &plan.steps {
        apply(dir, step).map_err(|err| step_error(step, err))?;
        let item = match step {
            Step::ObjectType { .. } => counter.object_types(),
            Step::Permission { .. } => counter.permissions(),
            Step::RelationType { .. } => counter.relation_types(),
        };
        item.increment();
        debug!(step = %step.describe(), "manifest step applied");
    }
    info!(steps = plan.steps.len(), "manifest loaded");
    Ok(plan)
}

/// Read the directory's model back into manifest form.
pub fn save<D: Directory>(dir: &D) -> Result<Manifest, Error> {
    let mut manifest = Manifest::default();
    let mut page = PageRequest::first();
    loop {
        let object_types = dir.list_object_types(&page)?;
        for object_type in object_types.results {
            let relations = manifest
                .object_types
                .entry(object_type.name.clone())
                .or_default();
            let mut relation_page = PageRequest::first();
            loop {
                let relation_types = dir.list_relation_types(&object_type.name, &relation_page)?;
                for relation_type in relation_types.results {
                    relations.insert(
                        relation_type.name,
                        RelationSpec {
                            union: relation_type.unions,
                            permissions: relation_type.permissions,
                        },
                    );
                }
                if relation_types.next_token.is_empty() {
                    break;
                }
                relation_page = PageRequest::next(relation_types.next_token);
            }
        }
        if object_types.next_token.is_empty() {
            break;
        }
        page = PageRequest::next(object_types.next_token);
    }
    info!(object_types = manifest.object_types.len(), "manifest saved");
    Ok(manifest)
}
