//! Tracking Store Contract
//!
//! The production-tracking service is external. The engine reads one
//! snapshot per run through `TrackingStore::fetch` and writes statuses back
//! one entity at a time. `SnapshotStore` serves the same contract from a JSON
//! file for offline runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{tracking_fields, DeliveryConfig};
use crate::entity::{get_field, render_value, set_field, Entity, EntityLink, EntityType};

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Failed to access tracking snapshot {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Invalid tracking data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Entity not found: {0}")]
    NotFound(EntityLink),

    #[error("Tracking snapshot has no Project")]
    MissingProject,

    #[error("Tracking store error: {0}")]
    Store(String),
}

pub trait TrackingStore {
    /// Every entity of a type, restricted to the given field projection
    fn fetch(&self, entity_type: EntityType, fields: &[String]) -> Result<Vec<Entity>, TrackingError>;

    fn current_value(&self, entity: EntityLink, field: &str) -> Result<Option<Value>, TrackingError>;

    fn update(&mut self, entity: EntityLink, field: &str, value: Value) -> Result<(), TrackingError>;
}

/// Entities read for one planning run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingSnapshot {
    pub project: Entity,
    #[serde(default)]
    pub shots: Vec<Entity>,
    #[serde(default)]
    pub assets: Vec<Entity>,
    #[serde(default)]
    pub versions: Vec<Entity>,
    #[serde(default)]
    pub published_files: Vec<Entity>,
}

impl TrackingSnapshot {
    pub fn new(project: Entity) -> Self {
        Self { project, shots: vec![], assets: vec![], versions: vec![], published_files: vec![] }
    }

    /// Fetch everything a run needs. Only Versions waiting for delivery are kept.
    pub fn load(store: &dyn TrackingStore, config: &DeliveryConfig) -> Result<Self, TrackingError> {
        let fetch = |entity_type| store.fetch(entity_type, &config.required_fields(entity_type));

        let project = fetch(EntityType::Project)?
            .into_iter()
            .next()
            .ok_or(TrackingError::MissingProject)?;

        let versions: Vec<Entity> = fetch(EntityType::Version)?
            .into_iter()
            .filter(|version| {
                version.text(&config.version_status_field).as_deref()
                    == Some(config.version_delivery_status.as_str())
            })
            .collect();

        let snapshot = Self {
            project,
            shots: fetch(EntityType::Shot)?,
            assets: fetch(EntityType::Asset)?,
            versions,
            published_files: fetch(EntityType::PublishedFile)?,
        };
        info!(
            "Loaded {} versions to deliver ({} shots, {} assets)",
            snapshot.versions.len(),
            snapshot.shots.len(),
            snapshot.assets.len()
        );
        Ok(snapshot)
    }

    pub fn find(&self, link: EntityLink) -> Option<&Entity> {
        let pool = match link.entity_type {
            EntityType::Project => return Some(&self.project).filter(|p| p.id == link.id),
            EntityType::Shot => &self.shots,
            EntityType::Asset => &self.assets,
            EntityType::Version => &self.versions,
            EntityType::PublishedFile => &self.published_files,
        };
        pool.iter().find(|entity| entity.id == link.id)
    }

    /// Shot or Asset a Version belongs to
    pub fn owner_of(&self, version: &Entity) -> Option<&Entity> {
        let link = version.get(tracking_fields::ENTITY).and_then(EntityLink::from_value)?;
        match link.entity_type {
            EntityType::Shot | EntityType::Asset => self.find(link),
            _ => None,
        }
    }

    /// First published file linked to a Version
    pub fn published_file_of(&self, version: &Entity) -> Option<&Entity> {
        let first = match version.get(tracking_fields::PUBLISHED_FILES)? {
            Value::Array(items) => items.first()?,
            other => other,
        };
        let link = EntityLink::from_value(first)?;
        self.find(link)
    }

    fn find_mut(&mut self, link: EntityLink) -> Option<&mut Entity> {
        let pool = match link.entity_type {
            EntityType::Project => return Some(&mut self.project).filter(|p| p.id == link.id),
            EntityType::Shot => &mut self.shots,
            EntityType::Asset => &mut self.assets,
            EntityType::Version => &mut self.versions,
            EntityType::PublishedFile => &mut self.published_files,
        };
        pool.iter_mut().find(|entity| entity.id == link.id)
    }
}

/// `TrackingStore` over a JSON snapshot held in memory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshot: TrackingSnapshot,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn new(snapshot: TrackingSnapshot) -> Self {
        Self { snapshot, path: None }
    }

    pub fn load(path: &Path) -> Result<Self, TrackingError> {
        let text = fs::read_to_string(path).map_err(|e| TrackingError::Io(path.to_path_buf(), e))?;
        let snapshot = serde_json::from_str(&text)?;
        debug!("Loaded tracking snapshot from {}", path.display());
        Ok(Self { snapshot, path: Some(path.to_path_buf()) })
    }

    /// Write the snapshot back to the file it was loaded from
    pub fn save(&self) -> Result<(), TrackingError> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), TrackingError> {
        let text = serde_json::to_string_pretty(&self.snapshot)?;
        fs::write(path, text).map_err(|e| TrackingError::Io(path.to_path_buf(), e))
    }

    pub fn snapshot(&self) -> &TrackingSnapshot {
        &self.snapshot
    }
}

fn project(entity: &Entity, fields: &[String]) -> Entity {
    let mut projected = Entity::new(entity.entity_type, entity.id);
    for field in fields {
        if let Some(value) = get_field(&entity.fields, field) {
            set_field(&mut projected.fields, field, value.clone());
        }
    }
    projected
}

impl TrackingStore for SnapshotStore {
    fn fetch(&self, entity_type: EntityType, fields: &[String]) -> Result<Vec<Entity>, TrackingError> {
        let pool: Vec<&Entity> = match entity_type {
            EntityType::Project => vec![&self.snapshot.project],
            EntityType::Shot => self.snapshot.shots.iter().collect(),
            EntityType::Asset => self.snapshot.assets.iter().collect(),
            EntityType::Version => self.snapshot.versions.iter().collect(),
            EntityType::PublishedFile => self.snapshot.published_files.iter().collect(),
        };
        Ok(pool.into_iter().map(|entity| project(entity, fields)).collect())
    }

    fn current_value(&self, entity: EntityLink, field: &str) -> Result<Option<Value>, TrackingError> {
        let found = self.snapshot.find(entity).ok_or(TrackingError::NotFound(entity))?;
        Ok(found.get(field).filter(|v| !v.is_null()).cloned())
    }

    fn update(&mut self, entity: EntityLink, field: &str, value: Value) -> Result<(), TrackingError> {
        let found = self.snapshot.find_mut(entity).ok_or(TrackingError::NotFound(entity))?;
        debug!(
            "Updating {} {}: {} -> {}",
            entity,
            field,
            found.get(field).and_then(render_value).unwrap_or_default(),
            value
        );
        set_field(&mut found.fields, field, value);
        Ok(())
    }
}
