//! Entry setup and unload.
//!
//! A config entry maps one or more source covers. Loading an entry creates
//! one command dispatcher (sharing the entry's throttle interval) and one
//! [`MappedCover`] per source, registering each with the host registry.
//! Throttles are per physical device across all entries, so two entries
//! mapping the same source still space their commands.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use mappedcover_commands::{CommandDispatcher, SharedThrottles};
use mappedcover_core::{
    ConfigError, ControllerSettings, EntityRegistry, EntryConfig, NormalizedValue, RegistryEntry,
    RegistryError,
};
use mappedcover_devices::{SharedCoverService, SharedStateFeed};

use crate::controller::Targets;
use crate::entity::{CoverParams, MappedCover, RunStats};

/// Platform errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Invalid entry: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Entry not loaded: {0}")]
    NotLoaded(String),
}

/// Point-in-time view of a mapped cover.
#[derive(Debug, Clone, Serialize)]
pub struct CoverSnapshot {
    pub unique_id: String,
    pub name: String,
    pub available: bool,
    pub position: Option<NormalizedValue>,
    pub tilt_position: Option<NormalizedValue>,
    pub is_closed: bool,
    pub is_opening: bool,
    pub is_closing: bool,
    pub targets: Targets,
    pub stats: RunStats,
}

impl From<&MappedCover> for CoverSnapshot {
    fn from(cover: &MappedCover) -> Self {
        Self {
            unique_id: cover.unique_id().to_string(),
            name: cover.name().to_string(),
            available: cover.available(),
            position: cover.current_position(),
            tilt_position: cover.current_tilt_position(),
            is_closed: cover.is_closed(),
            is_opening: cover.is_opening(),
            is_closing: cover.is_closing(),
            targets: cover.targets(),
            stats: cover.stats(),
        }
    }
}

struct LoadedEntry {
    dispatcher: Arc<CommandDispatcher>,
    covers: Vec<MappedCover>,
}

/// Loads and unloads config entries.
pub struct MappedCoverPlatform {
    registry: Arc<dyn EntityRegistry>,
    service: SharedCoverService,
    feed: SharedStateFeed,
    settings: ControllerSettings,
    throttles: SharedThrottles,
    entries: DashMap<String, LoadedEntry>,
}

impl MappedCoverPlatform {
    pub fn new(
        registry: Arc<dyn EntityRegistry>,
        service: SharedCoverService,
        feed: SharedStateFeed,
    ) -> Self {
        Self {
            registry,
            service,
            feed,
            settings: ControllerSettings::default(),
            throttles: SharedThrottles::default(),
            entries: DashMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load an entry. Reloading an entry unloads its previous covers first.
    pub async fn setup_entry(&self, entry: &EntryConfig) -> Result<Vec<MappedCover>, PlatformError> {
        entry.validate()?;

        if self.entries.contains_key(&entry.id) {
            self.unload_entry(&entry.id).await?;
        }

        // Stale entities from a previous run of this entry
        for stale in self.registry.entities_for_entry(&entry.id).await {
            tracing::debug!(
                category = "platform",
                entry = %entry.id,
                entity = %stale.entity_id,
                "Removing stale entity"
            );
            self.registry.remove(&stale.entity_id).await?;
        }

        let dispatcher = Arc::new(
            CommandDispatcher::new(self.service.clone(), self.feed.clone(), entry.throttle())
                .with_throttles(self.throttles.clone()),
        );

        let mut covers = Vec::with_capacity(entry.covers.len());
        for source_id in &entry.covers {
            let source_name = self.registry.device_name(source_id).await;
            let params = CoverParams::from_entry(entry, source_id.clone(), self.settings)?
                .with_source_name(source_name);
            let cover = MappedCover::new(params, dispatcher.clone());

            self.registry
                .register(RegistryEntry {
                    entity_id: cover.unique_id().to_string(),
                    entry_id: entry.id.clone(),
                    source_id: source_id.clone(),
                    name: cover.name().to_string(),
                    area: None,
                })
                .await?;

            if let Some(area) = self.registry.area_of(source_id).await {
                self.registry.assign_area(cover.unique_id(), Some(area)).await?;
            }

            covers.push(cover);
        }

        tracing::info!(
            category = "platform",
            entry = %entry.id,
            covers = covers.len(),
            throttle_ms = entry.throttle_ms,
            "Entry loaded"
        );

        self.entries.insert(
            entry.id.clone(),
            LoadedEntry {
                dispatcher,
                covers: covers.clone(),
            },
        );
        Ok(covers)
    }

    /// Unload an entry, removing its entities and stopping their runs.
    pub async fn unload_entry(&self, entry_id: &str) -> Result<(), PlatformError> {
        let (_, loaded) = self
            .entries
            .remove(entry_id)
            .ok_or_else(|| PlatformError::NotLoaded(entry_id.to_string()))?;

        for cover in &loaded.covers {
            cover.shutdown().await;
            self.registry.remove(cover.unique_id()).await?;
        }

        tracing::info!(category = "platform", entry = %entry_id, "Entry unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, entry_id: &str) -> bool {
        self.entries.contains_key(entry_id)
    }

    pub fn entry_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn covers(&self, entry_id: &str) -> Vec<MappedCover> {
        self.entries
            .get(entry_id)
            .map(|e| e.covers.clone())
            .unwrap_or_default()
    }

    /// Find a cover by unique id.
    pub fn cover(&self, unique_id: &str) -> Option<MappedCover> {
        self.entries.iter().find_map(|e| {
            e.covers
                .iter()
                .find(|c| c.unique_id() == unique_id)
                .cloned()
        })
    }

    /// Shared dispatcher of a loaded entry.
    pub fn dispatcher(&self, entry_id: &str) -> Option<Arc<CommandDispatcher>> {
        self.entries.get(entry_id).map(|e| e.dispatcher.clone())
    }

    pub fn snapshots(&self, entry_id: &str) -> Vec<CoverSnapshot> {
        self.covers(entry_id).iter().map(CoverSnapshot::from).collect()
    }

    /// Unload every entry.
    pub async fn shutdown(&self) -> Result<(), PlatformError> {
        for entry_id in self.entry_ids() {
            self.unload_entry(&entry_id).await?;
        }
        Ok(())
    }
}
