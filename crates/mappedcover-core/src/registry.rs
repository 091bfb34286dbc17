//! Entity registry interface.
//!
//! The host keeps a registry of entities and the areas devices live in.
//! Setup and unload only need a handful of operations, captured by
//! [`EntityRegistry`]. [`InMemoryEntityRegistry`] backs tests and the CLI.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A registered mapped entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Unique id, `{entry_id}_{source_id}`
    pub entity_id: String,
    pub entry_id: String,
    pub source_id: String,
    pub name: String,
    pub area: Option<String>,
}

/// Registry-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// An entity with the given id already exists.
    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    /// An entity with the given id was not found.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// A generic error message.
    #[error("Registry error: {0}")]
    Other(String),
}

/// Operations setup and unload need from the host registry.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    /// Entities created for a config entry.
    async fn entities_for_entry(&self, entry_id: &str) -> Vec<RegistryEntry>;

    /// Add an entity. Fails if the id is taken.
    async fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError>;

    /// Remove an entity, returning it if it existed.
    async fn remove(&self, entity_id: &str) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Display name of a source device, if it has one.
    async fn device_name(&self, device_id: &str) -> Option<String>;

    /// Area a source device is assigned to.
    async fn area_of(&self, device_id: &str) -> Option<String>;

    /// Assign an entity to an area.
    async fn assign_area(&self, entity_id: &str, area: Option<String>)
        -> Result<(), RegistryError>;
}

/// Registry held in memory.
#[derive(Debug, Default)]
pub struct InMemoryEntityRegistry {
    entities: DashMap<String, RegistryEntry>,
    device_areas: DashMap<String, String>,
    device_names: DashMap<String, String>,
}

impl InMemoryEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a source device in an area.
    pub fn set_device_area(&self, device_id: impl Into<String>, area: impl Into<String>) {
        self.device_areas.insert(device_id.into(), area.into());
    }

    pub fn set_device_name(&self, device_id: impl Into<String>, name: impl Into<String>) {
        self.device_names.insert(device_id.into(), name.into());
    }

    pub fn get(&self, entity_id: &str) -> Option<RegistryEntry> {
        self.entities.get(entity_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl EntityRegistry for InMemoryEntityRegistry {
    async fn entities_for_entry(&self, entry_id: &str) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .entities
            .iter()
            .filter(|e| e.entry_id == entry_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        entries
    }

    async fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        match self.entities.entry(entry.entity_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyExists(entry.entity_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    async fn remove(&self, entity_id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.entities.remove(entity_id).map(|(_, e)| e))
    }

    async fn device_name(&self, device_id: &str) -> Option<String> {
        self.device_names.get(device_id).map(|n| n.value().clone())
    }

    async fn area_of(&self, device_id: &str) -> Option<String> {
        self.device_areas.get(device_id).map(|a| a.value().clone())
    }

    async fn assign_area(
        &self,
        entity_id: &str,
        area: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut entity = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| RegistryError::NotFound(entity_id.to_string()))?;
        entity.area = area;
        Ok(())
    }
}
