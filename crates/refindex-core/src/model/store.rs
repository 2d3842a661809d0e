use super::entity::{Entity, EntityId, LinkedFile};
use crate::error::{RefIndexError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Read access to the records being indexed.
pub trait RecordStore: Send + Sync {
    /// Snapshot of every record.
    fn entities(&self) -> Vec<Entity>;

    /// Directory relative file links are resolved against.
    fn base_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Resolve a linked file to an existing local path.
    fn resolve_file(&self, file: &LinkedFile) -> Option<PathBuf> {
        if file.is_online() {
            return None;
        }
        let link = Path::new(&file.link);
        let path = if link.is_absolute() {
            link.to_path_buf()
        } else {
            self.base_dir()?.join(link)
        };
        path.is_file().then_some(path)
    }
}

/// Record store held in memory, optionally loaded from a JSON array.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<EntityId, Entity>>,
    base_dir: Option<PathBuf>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Load `[{"id": ..., "fields": {...}}, ...]`; relative links resolve
    /// against the file's directory.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| RefIndexError::io_with_path(e, path))?;
        let entities: Vec<Entity> = serde_json::from_str(&contents).map_err(|e| {
            RefIndexError::Json {
                message: format!("Failed to parse {}: {}", path.display(), e),
                source: Some(e),
            }
        })?;

        let mut store = Self::new();
        if let Some(parent) = path.parent() {
            store.base_dir = Some(parent.to_path_buf());
        }
        for entity in entities {
            store.insert(normalize(entity));
        }
        Ok(store)
    }

    pub fn insert(&self, entity: Entity) -> Option<Entity> {
        match self.records.write() {
            Ok(mut records) => records.insert(entity.id.clone(), entity),
            Err(poisoned) => poisoned.into_inner().insert(entity.id.clone(), entity),
        }
    }

    pub fn remove(&self, id: &EntityId) -> Option<Entity> {
        match self.records.write() {
            Ok(mut records) => records.remove(id),
            Err(poisoned) => poisoned.into_inner().remove(id),
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        match self.records.read() {
            Ok(records) => records.get(id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(id).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        match self.records.read() {
            Ok(records) => records.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(entity: Entity) -> Entity {
    let Entity { id, fields } = entity;
    let mut normalized = Entity::new(id);
    for (name, value) in fields {
        normalized.set_field(&name, value);
    }
    normalized
}

impl RecordStore for InMemoryRecordStore {
    fn entities(&self) -> Vec<Entity> {
        match self.records.read() {
            Ok(records) => records.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    fn base_dir(&self) -> Option<PathBuf> {
        self.base_dir.clone()
    }
}
