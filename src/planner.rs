//! Delivery Planner
//!
//! Turns a tracking snapshot into a `DeliveryBatch`: which Versions ship,
//! through which output profiles, to which paths, with which slate and CSV
//! text. Planning never touches the filesystem; the caller lists existing
//! delivery folders and passes their names in with the request.
//!
//! A failure while planning one sub-output is recorded on that sub-output
//! only. The rest of the unit and the rest of the batch still plan.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{tracking_fields, ConfigError, DeliveryConfig};
use crate::entity::{get_field, render_value, Entity, EntityLink, EntityType, Fields};
use crate::expression::{ExpressionContext, ExpressionError, FileContext};
use crate::formats::{format_fields, FootageFormat};
use crate::hashing::compute_plan_hash;
use crate::outputs::{choose_transfer, match_previews, match_sequence, OutputProfile, SourceEncoding, TransferMode};
use crate::overrides::{apply_overrides, OverrideScope};
use crate::templates::{PathTemplate, TemplateError, TemplateRegistry};
use crate::tracking::TrackingSnapshot;
use crate::validation::{RuleScope, ValidationResult, Validator};
use crate::versioning::{
    check_overwrite, parse_delivery_folders, resolve_version, DeliveryVersion, OverwriteRisk, VersionError,
};
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to resolve delivery folder: {0}")]
    DeliveryFolder(#[source] TemplateError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("Invalid unit state transition {from} -> {to}")]
    InvalidTransition { from: UnitState, to: UnitState },

    #[error("Failed to hash plan: {0}")]
    Hash(#[from] serde_json::Error),
}

/// Why a sub-output could not be planned
#[derive(Debug, Error)]
enum SubOutputError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("CSV column \"{column}\": {source}")]
    Csv {
        column: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    MissingSource(&'static str),

    #[error("Frame range {first}-{last} holds no frames")]
    EmptyFrameRange { first: i64, last: i64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    ReadinessChecked,
    Skipped,
    Planned,
    Executed,
    StatusCommitted,
}

impl UnitState {
    pub fn advance(self, next: UnitState) -> Result<UnitState, PlanError> {
        use UnitState::*;
        match (self, next) {
            (Pending, ReadinessChecked)
            | (ReadinessChecked, Skipped)
            | (ReadinessChecked, Planned)
            | (Planned, Executed)
            | (Executed, StatusCommitted) => Ok(next),
            _ => Err(PlanError::InvalidTransition { from: self, to: next }),
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Pending => "pending",
            UnitState::ReadinessChecked => "readiness_checked",
            UnitState::Skipped => "skipped",
            UnitState::Planned => "planned",
            UnitState::Executed => "executed",
            UnitState::StatusCommitted => "status_committed",
        };
        f.write_str(name)
    }
}

/// Outcome of planning one sub-output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Planned<T> {
    NotRequested,
    Skipped { reason: String },
    Failed { error: String },
    Ready(T),
}

impl<T> Planned<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            Planned::Ready(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Planned::Ready(_))
    }
}

/// Source media read from the Version and its published file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceMedia {
    pub sequence_path: Option<PathBuf>,
    pub movie_path: Option<PathBuf>,
    pub first_frame: Option<i64>,
    pub last_frame: Option<i64>,
    pub frame_rate: Option<f64>,
    pub version_number: Option<i64>,
    #[serde(default)]
    pub frames_have_slate: bool,
    #[serde(default)]
    pub movie_has_slate: bool,
    #[serde(default)]
    pub encoding: Option<SourceEncoding>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlateField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlateData {
    pub version_name: String,
    pub submission_note: String,
    pub submission_note_short: String,
    /// Operator note replacing the submission note on preview slates
    pub new_submission_note: Option<String>,
    pub submitting_for: String,
    pub shot_name: String,
    pub shot_types: String,
    pub vfx_scope_of_work: String,
    pub show: String,
    pub episode: Option<String>,
    pub scene: Option<String>,
    pub sequence_name: Option<String>,
    pub vendor: String,
    pub input_has_slate: bool,
    pub extra_fields: Vec<SlateField>,
}

/// One manifest row, values in column order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsvRow {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequencePlan {
    pub profile: OutputProfile,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub first_frame: i64,
    pub last_frame: i64,
    pub frame_rate: f64,
    pub transfer: TransferMode,
    pub remove_alpha: bool,
    pub colorspace: Option<String>,
    pub writer_settings: Map<String, Value>,
    /// Rendered in front of the first frame when set
    pub slate: Option<SlateData>,
    pub csv_row: CsvRow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewRender {
    pub profile: OutputProfile,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub first_frame: i64,
    pub last_frame: i64,
    pub frame_rate: f64,
    pub colorspace_idt: Option<String>,
    pub colorspace_odt: Option<String>,
    pub writer_settings: Map<String, Value>,
    pub slate: SlateData,
    pub csv_row: CsvRow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewPlan {
    pub renders: Vec<PreviewRender>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtraKind {
    Lut,
    Attachment,
}

/// A file shipped next to the unit's outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraTransfer {
    pub kind: ExtraKind,
    /// Local path or URL
    pub source: String,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverableUnit {
    pub owner: Entity,
    pub version: Entity,
    pub published_file: Option<Entity>,
    pub media: SourceMedia,
    /// Episode whose folder the unit delivers into, with per-episode folders
    #[serde(default)]
    pub episode: Option<String>,
    /// Template field mapping, overrides applied
    pub fields: Fields,
    pub sequence_ready: bool,
    pub preview_ready: bool,
    pub state: UnitState,
    pub sequence: Planned<SequencePlan>,
    pub preview: Planned<PreviewPlan>,
    pub extras: Vec<ExtraTransfer>,
}

impl DeliverableUnit {
    pub fn owner_link(&self) -> EntityLink {
        self.owner.link()
    }

    pub fn version_link(&self) -> EntityLink {
        self.version.link()
    }

    pub fn name(&self) -> String {
        self.version.text(tracking_fields::CODE).unwrap_or_else(|| self.version.link().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PlanWarning {
    NoMatchingOutputProfile { version: EntityLink, value: Option<String> },
    OverwriteRisk(OverwriteRisk),
    Validation { version: EntityLink, scope: RuleScope, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPlan {
    pub path: PathBuf,
    pub columns: Vec<String>,
}

/// One delivery folder of a batch, with its own version and manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderPlan {
    /// Set when the folder template is per episode
    pub episode: Option<String>,
    pub delivery_version: DeliveryVersion,
    pub path: PathBuf,
    pub manifest: ManifestPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub batch_date: NaiveDate,
    /// Drives `<date.*>` fields
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub existing_delivery_folders: Vec<String>,
    /// Existing folder names per episode, where episodes list separately
    #[serde(default)]
    pub episode_delivery_folders: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub manual_version: Option<String>,
    /// Manual destination. Delivery folders land directly inside it.
    #[serde(default)]
    pub destination_root: Option<PathBuf>,
    #[serde(default)]
    pub preview_submission_note: Option<String>,
}

impl PlanRequest {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            batch_date: timestamp.date(),
            timestamp,
            existing_delivery_folders: vec![],
            episode_delivery_folders: BTreeMap::new(),
            manual_version: None,
            destination_root: None,
            preview_submission_note: None,
        }
    }

    fn existing_folders(&self, episode: Option<&str>) -> &[String] {
        episode
            .and_then(|episode| self.episode_delivery_folders.get(episode))
            .unwrap_or(&self.existing_delivery_folders)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryBatch {
    pub id: String,
    pub plan_hash: String,
    pub engine_version: String,
    pub delivery_date: NaiveDate,
    /// One folder per episode when the folder template holds `{Episode}`,
    /// otherwise exactly one
    pub folders: Vec<FolderPlan>,
    pub units: Vec<DeliverableUnit>,
    pub warnings: Vec<PlanWarning>,
}

impl DeliveryBatch {
    pub fn folder_of(&self, unit: &DeliverableUnit) -> Option<&FolderPlan> {
        self.folders.iter().find(|folder| folder.episode == unit.episode)
    }

    pub fn units_in<'b>(&'b self, folder: &'b FolderPlan) -> impl Iterator<Item = &'b DeliverableUnit> + 'b {
        self.units.iter().filter(move |unit| unit.episode == folder.episode)
    }
}

/// Entity namespaces of one unit, overrides applied
struct UnitEntities {
    project: Fields,
    owner: Entity,
    version: Entity,
    published_file: Option<Entity>,
}

/// A Version resolved against the snapshot, before it has a folder
enum UnitSource {
    /// No Shot or Asset to deliver under, already skipped
    Orphan(DeliverableUnit),
    Linked(UnitEntities, Fields),
}

/// Maps rendered template paths into one delivery folder
struct Placement {
    root: PathBuf,
    /// Folder as the template renders it
    rendered: PathBuf,
    folder: PathBuf,
}

impl Placement {
    fn place(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.rendered) {
            Ok(rest) if rest.as_os_str().is_empty() => self.folder.clone(),
            Ok(rest) => self.folder.join(rest),
            Err(_) => self.root.join(path),
        }
    }
}

const EPISODE_KEY: &str = "Episode";

pub struct DeliveryPlanner<'a> {
    config: &'a DeliveryConfig,
    registry: TemplateRegistry,
    validator: Validator,
}

impl<'a> DeliveryPlanner<'a> {
    pub fn new(config: &'a DeliveryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            config,
            registry: config.template_registry()?,
            validator: Validator::new(),
        })
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    fn root(&self, request: &PlanRequest) -> PathBuf {
        request
            .destination_root
            .clone()
            .unwrap_or_else(|| self.config.delivery_root.clone())
    }

    fn folder_template(&self) -> Result<&PathTemplate, ConfigError> {
        self.registry
            .get("delivery_folder")
            .ok_or_else(|| ConfigError::MissingTemplate("delivery_folder".to_string()))
    }

    /// Whether each episode gets its own delivery folder and version
    pub fn per_episode_folders(&self) -> bool {
        self.registry
            .get("delivery_folder")
            .map_or(false, |template| template.keys().contains(&EPISODE_KEY))
    }

    /// Fields shared by every unit before versioning
    pub fn base_fields(&self, snapshot: &TrackingSnapshot, request: &PlanRequest) -> Fields {
        let mut fields = self.config.base_fields.clone();
        let project = snapshot.project.namespace();
        for (key, source) in self.registry.entity_sourced_keys() {
            if let Some(("project", path)) = source.split_once('.') {
                if let Some(value) = get_field(&project, path).filter(|v| !v.is_null()) {
                    fields.insert(key.to_string(), value.clone());
                }
            }
        }
        fields.insert(
            "delivery_date".to_string(),
            Value::from(request.batch_date.format("%Y-%m-%d").to_string()),
        );
        fields
    }

    /// Directory whose children are the existing delivery folders. A manual
    /// destination is listed as is.
    pub fn listing_dir(&self, snapshot: &TrackingSnapshot, request: &PlanRequest, episode: Option<&str>) -> PathBuf {
        if let Some(manual) = &request.destination_root {
            return manual.clone();
        }
        let root = self.root(request);
        let mut fields = self.base_fields(snapshot, request);
        if let Some(episode) = episode {
            fields.insert(EPISODE_KEY.to_string(), Value::from(episode));
        }
        let parent = self
            .registry
            .get("delivery_folder")
            .and_then(|template| template.parent())
            .and_then(|parent| parent.render(&fields, self.registry.keys()).ok());
        match parent {
            Some(parent) => root.join(parent),
            None => root,
        }
    }

    /// Episodes the snapshot's Versions deliver into, in planning order
    pub fn episodes(&self, snapshot: &TrackingSnapshot, request: &PlanRequest) -> Result<Vec<String>, PlanError> {
        let base = self.base_fields(snapshot, request);
        let mut episodes: Vec<String> = vec![];
        for version in sorted_versions(snapshot) {
            if let UnitSource::Linked(_, fields) = self.resolve_unit(snapshot, version, &base, request)? {
                if let Some(episode) = fields.get(EPISODE_KEY).and_then(render_value) {
                    if !episodes.contains(&episode) {
                        episodes.push(episode);
                    }
                }
            }
        }
        Ok(episodes)
    }

    pub fn plan(&self, snapshot: &TrackingSnapshot, request: &PlanRequest) -> Result<DeliveryBatch, PlanError> {
        let base = self.base_fields(snapshot, request);
        let per_episode = self.per_episode_folders();

        let mut units: Vec<Option<DeliverableUnit>> = vec![];
        let mut sources: Vec<Option<(UnitEntities, Fields)>> = vec![];
        for version in sorted_versions(snapshot) {
            match self.resolve_unit(snapshot, version, &base, request)? {
                UnitSource::Orphan(unit) => {
                    units.push(Some(unit));
                    sources.push(None);
                }
                UnitSource::Linked(entities, fields) => {
                    units.push(None);
                    sources.push(Some((entities, fields)));
                }
            }
        }

        let mut groups: Vec<(Option<String>, Vec<usize>)> = vec![];
        if !per_episode {
            groups.push((None, vec![]));
        }
        for (index, source) in sources.iter().enumerate() {
            let fields = match source {
                Some((_, fields)) => fields,
                None => continue,
            };
            let episode = if per_episode {
                fields.get(EPISODE_KEY).and_then(render_value)
            } else {
                None
            };
            match groups.iter_mut().find(|(group, _)| *group == episode) {
                Some((_, members)) => members.push(index),
                None => groups.push((episode, vec![index])),
            }
        }

        let mut warnings = vec![];
        let mut folders = vec![];
        for (episode, members) in groups {
            let folder = match self.plan_folder(&base, episode.as_deref(), request, &mut warnings) {
                Ok(folder) => Ok(folder),
                Err(PlanError::DeliveryFolder(e)) if per_episode => {
                    warn!("No delivery folder for episode {}: {}", episode.as_deref().unwrap_or("(none)"), e);
                    Err(format!("Failed to resolve delivery folder: {}", e))
                }
                Err(e) => return Err(e),
            };

            let mut delivers = false;
            for index in members {
                let (entities, mut fields) = match sources[index].take() {
                    Some(source) => source,
                    None => continue,
                };
                let placement = match &folder {
                    Ok((plan, placement)) => {
                        fields.insert("delivery_version".to_string(), version_value(&plan.delivery_version));
                        Ok(placement)
                    }
                    Err(error) => Err(error.as_str()),
                };
                let unit = self.plan_unit(entities, fields, episode.clone(), placement, request, &mut warnings)?;
                delivers |= unit.sequence.is_ready() || unit.preview.is_ready();
                units[index] = Some(unit);
            }

            if let Ok((plan, _)) = folder {
                if delivers || !per_episode {
                    folders.push(plan);
                } else {
                    debug!("Episode {:?} has nothing to deliver, no folder", plan.episode);
                }
            }
        }

        let mut batch = DeliveryBatch {
            id: String::new(),
            plan_hash: String::new(),
            engine_version: ENGINE_VERSION.to_string(),
            delivery_date: request.batch_date,
            folders,
            units: units.into_iter().flatten().collect(),
            warnings,
        };
        batch.plan_hash = compute_plan_hash(&batch)?;
        batch.id = Uuid::new_v5(&Uuid::NAMESPACE_OID, batch.plan_hash.as_bytes()).to_string();

        let ready = batch
            .units
            .iter()
            .filter(|u| u.sequence.is_ready() || u.preview.is_ready())
            .count();
        info!(
            "Planned {} of {} units into {} folders ({} warnings)",
            ready,
            batch.units.len(),
            batch.folders.len(),
            batch.warnings.len()
        );
        Ok(batch)
    }

    /// Version, path and manifest of one delivery folder
    fn plan_folder(
        &self,
        base: &Fields,
        episode: Option<&str>,
        request: &PlanRequest,
        warnings: &mut Vec<PlanWarning>,
    ) -> Result<(FolderPlan, Placement), PlanError> {
        let config = self.config;
        let existing_names = request.existing_folders(episode);
        let existing = parse_delivery_folders(existing_names, self.folder_template()?, &self.registry, episode);
        let delivery_version = resolve_version(
            request.batch_date,
            &existing,
            config.continuous_versioning,
            request.manual_version.as_deref(),
        )?;

        let mut fields = base.clone();
        if let Some(episode) = episode {
            fields.insert(EPISODE_KEY.to_string(), Value::from(episode));
        }
        fields.insert("delivery_version".to_string(), version_value(&delivery_version));

        let rendered = self
            .registry
            .resolve("delivery_folder", &fields)
            .map_err(PlanError::DeliveryFolder)?;
        let folder_name = rendered
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = self.root(request);
        let folder = match &request.destination_root {
            Some(manual) => manual.join(&folder_name),
            None => root.join(&rendered),
        };
        info!("Planning delivery {} into {}", delivery_version.tag, folder.display());

        if let Some(risk) = check_overwrite(
            &folder_name,
            existing_names,
            &delivery_version,
            request.destination_root.is_some(),
        ) {
            warn!("Overwrite risk in {}: {}", risk.folder, risk.reason);
            warnings.push(PlanWarning::OverwriteRisk(risk));
        }

        let placement = Placement { root, rendered, folder: folder.clone() };
        let manifest = ManifestPlan {
            path: placement.place(
                &self
                    .registry
                    .resolve("csv_submission_form", &fields)
                    .map_err(PlanError::DeliveryFolder)?,
            ),
            columns: config.default_csv.iter().map(|c| c.name.clone()).collect(),
        };

        let plan = FolderPlan {
            episode: episode.map(str::to_string),
            delivery_version,
            path: folder,
            manifest,
        };
        Ok((plan, placement))
    }

    /// Owner, Version and published file of `version` with overrides applied.
    /// Replace values see the project, and the owner and Version once those
    /// are overridden.
    fn resolve_unit(
        &self,
        snapshot: &TrackingSnapshot,
        version: &Entity,
        base: &Fields,
        request: &PlanRequest,
    ) -> Result<UnitSource, PlanError> {
        let overrides = &self.config.version_overrides;
        let project = snapshot.project.namespace();
        let scope = OverrideScope { project: Some(&project), ..OverrideScope::new(request.timestamp) };

        let owner = snapshot.owner_of(version).map(|owner| Entity {
            fields: apply_overrides(owner.entity_type, &owner.fields, overrides, &scope),
            ..owner.clone()
        });
        let owner_ns = owner.as_ref().map(Entity::namespace);
        let version_scope = OverrideScope { shot: owner_ns.as_ref(), ..scope };
        let version = Entity {
            fields: apply_overrides(EntityType::Version, &version.fields, overrides, &version_scope),
            ..version.clone()
        };
        let version_ns = version.namespace();
        let file_scope = OverrideScope { version: Some(&version_ns), ..version_scope };
        let published_file = snapshot.published_file_of(&version).map(|pf| Entity {
            fields: apply_overrides(EntityType::PublishedFile, &pf.fields, overrides, &file_scope),
            ..pf.clone()
        });

        let owner = match owner {
            Some(owner) => owner,
            None => {
                warn!("{} has no Shot or Asset in the snapshot, skipping", version.link());
                let state = UnitState::Pending
                    .advance(UnitState::ReadinessChecked)?
                    .advance(UnitState::Skipped)?;
                let reason = "Version is not linked to a Shot or Asset".to_string();
                return Ok(UnitSource::Orphan(DeliverableUnit {
                    owner: Entity::new(EntityType::Shot, 0),
                    media: self.source_media(&version, published_file.as_ref()),
                    version,
                    published_file,
                    episode: None,
                    fields: base.clone(),
                    sequence_ready: false,
                    preview_ready: false,
                    state,
                    sequence: Planned::Skipped { reason: reason.clone() },
                    preview: Planned::Skipped { reason },
                    extras: vec![],
                }));
            }
        };

        let entities = UnitEntities { project, owner, version, published_file };
        let fields = self.unit_fields(base, &entities);
        Ok(UnitSource::Linked(entities, fields))
    }

    /// Readiness, then every requested sub-output. Without a folder the
    /// requested sub-outputs fail with `folder`'s error.
    fn plan_unit(
        &self,
        entities: UnitEntities,
        fields: Fields,
        episode: Option<String>,
        folder: Result<&Placement, &str>,
        request: &PlanRequest,
        warnings: &mut Vec<PlanWarning>,
    ) -> Result<DeliverableUnit, PlanError> {
        let config = self.config;
        let media = self.source_media(&entities.version, entities.published_file.as_ref());

        let state = UnitState::Pending.advance(UnitState::ReadinessChecked)?;
        let sequence_ready = self.sequence_ready(&entities.owner);
        let preview_ready = entities.version.text(&config.version_status_field).as_deref()
            == Some(config.version_delivery_status.as_str());

        let mut unit = DeliverableUnit {
            owner: entities.owner.clone(),
            version: entities.version.clone(),
            published_file: entities.published_file.clone(),
            media,
            episode,
            fields,
            sequence_ready,
            preview_ready,
            state,
            sequence: Planned::NotRequested,
            preview: Planned::NotRequested,
            extras: vec![],
        };

        if !sequence_ready && !preview_ready {
            debug!("{} is not ready for delivery", unit.name());
            unit.state = unit.state.advance(UnitState::Skipped)?;
            return Ok(unit);
        }

        let placement = match folder {
            Ok(placement) => placement,
            Err(error) => {
                if sequence_ready {
                    unit.sequence = Planned::Failed { error: error.to_string() };
                }
                if preview_ready {
                    unit.preview = Planned::Failed { error: error.to_string() };
                }
                unit.state = unit.state.advance(UnitState::Planned)?;
                return Ok(unit);
            }
        };

        if sequence_ready {
            unit.sequence = self.plan_sequence(&unit, &entities, placement, request, warnings);
        }
        if preview_ready {
            unit.preview = self.plan_preview(&unit, &entities, placement, request, warnings);
        }
        if unit.sequence.is_ready() || unit.preview.is_ready() {
            unit.extras = self.plan_extras(&unit, &entities, placement);
        }

        debug!(
            "{}: sequence {}, preview {}",
            unit.name(),
            outcome_name(&unit.sequence),
            outcome_name(&unit.preview)
        );
        unit.state = unit.state.advance(UnitState::Planned)?;
        Ok(unit)
    }

    fn sequence_ready(&self, owner: &Entity) -> bool {
        let (field, status) = match owner.entity_type {
            EntityType::Shot => (self.config.shot_status_field.as_str(), self.config.shot_delivery_status.as_str()),
            EntityType::Asset => match self.config.asset_readiness() {
                Some(readiness) => readiness,
                None => return false,
            },
            _ => return false,
        };
        owner.text(field).as_deref() == Some(status)
    }

    fn source_media(&self, version: &Entity, published_file: Option<&Entity>) -> SourceMedia {
        use tracking_fields::*;

        let int = |entity: &Entity, field: &str| entity.get(field).and_then(Value::as_i64);
        let flag = |field: &str| version.get(field).and_then(Value::as_bool).unwrap_or(false);
        let path = |text: Option<String>| text.filter(|t| !t.is_empty()).map(PathBuf::from);

        SourceMedia {
            sequence_path: path(published_file.and_then(|pf| pf.text(PUBLISHED_PATH))),
            movie_path: path(version.text(PATH_TO_MOVIE)),
            first_frame: int(version, FIRST_FRAME),
            last_frame: int(version, LAST_FRAME),
            frame_rate: version.get(FRAME_RATE).and_then(Value::as_f64),
            version_number: published_file.and_then(|pf| int(pf, PUBLISHED_VERSION_NUMBER)),
            frames_have_slate: flag(FRAMES_HAVE_SLATE),
            movie_has_slate: flag(MOVIE_HAS_SLATE),
            encoding: self
                .config
                .source_encoding_field
                .as_deref()
                .and_then(|field| published_file?.get(field).cloned())
                .and_then(|value| serde_json::from_value(value).ok()),
        }
    }

    /// Template field mapping for one unit
    fn unit_fields(&self, base: &Fields, entities: &UnitEntities) -> Fields {
        use tracking_fields::*;

        let mut fields = base.clone();
        let owner = &entities.owner;
        fields.extend(self.footage_fields(owner));
        let mut insert = |key: &str, value: Option<Value>| {
            if let Some(value) = value.filter(|v| !v.is_null()) {
                fields.insert(key.to_string(), value);
            }
        };

        let owner_key = match owner.entity_type {
            EntityType::Asset => "Asset",
            _ => "Shot",
        };
        insert(owner_key, owner.get(CODE).cloned());
        if owner.entity_type == EntityType::Shot {
            insert("Sequence", owner.text(SEQUENCE).map(Value::from));
            if let Some(field) = &self.config.episode_field {
                insert("Episode", owner.text(field).map(Value::from));
            }
        }

        let task = entities
            .published_file
            .as_ref()
            .and_then(|pf| pf.text("task.name"))
            .or_else(|| entities.version.text(&format!("{}.name", TASK)));
        insert("task_name", task.map(Value::from));
        insert(
            "version",
            entities
                .published_file
                .as_ref()
                .and_then(|pf| pf.get(PUBLISHED_VERSION_NUMBER).cloned()),
        );

        let owner_ns = owner.namespace();
        let version_ns = entities.version.namespace();
        let published_ns = entities.published_file.as_ref().map(Entity::namespace);
        for (key, source) in self.registry.entity_sourced_keys() {
            let (namespace, path) = match source.split_once('.') {
                Some(split) => split,
                None => continue,
            };
            let value = match namespace {
                "project" => get_field(&entities.project, path),
                "shot" => get_field(&owner_ns, path),
                "version" => get_field(&version_ns, path),
                "published_file" => published_ns.as_ref().and_then(|ns| get_field(ns, path)),
                _ => None,
            };
            insert(key, value.cloned());
        }

        fields
    }

    /// Size and aspect ratio fields from the owner's footage formats
    fn footage_fields(&self, owner: &Entity) -> Fields {
        let formats: Option<Vec<FootageFormat>> = self
            .config
            .footage_formats_field
            .as_deref()
            .and_then(|field| owner.get(field))
            .and_then(Value::as_array)
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| FootageFormat::from_record(record, &self.config.footage_format_fields))
                    .collect()
            });
        format_fields(formats.as_deref())
    }

    fn validate(
        &self,
        unit: &DeliverableUnit,
        scope: RuleScope,
        warnings: &mut Vec<PlanWarning>,
    ) -> Result<(), SubOutputError> {
        let mode = self.config.validation_failure_mode;
        let result: ValidationResult = self.validator.validate(&unit.media, scope, mode);
        if !result.valid {
            return Err(SubOutputError::Validation(result.summary()));
        }
        if !result.violations.is_empty() {
            let message = result.summary();
            warn!("{} {:?} validation: {}", unit.name(), scope, message);
            warnings.push(PlanWarning::Validation { version: unit.version_link(), scope, message });
        }
        Ok(())
    }

    fn plan_sequence(
        &self,
        unit: &DeliverableUnit,
        entities: &UnitEntities,
        placement: &Placement,
        request: &PlanRequest,
        warnings: &mut Vec<PlanWarning>,
    ) -> Planned<SequencePlan> {
        let config = self.config;
        let match_field = &config.delivery_sequence_outputs_field;
        let profile = match match_sequence(&unit.version.fields, match_field, &config.sequence_outputs) {
            Some(profile) => profile,
            None => {
                let value = unit.version.text(match_field);
                info!(
                    "No sequence output matches \"{}\" for {}, skipping sequence",
                    value.as_deref().unwrap_or_default(),
                    unit.name()
                );
                warnings.push(PlanWarning::NoMatchingOutputProfile { version: unit.version_link(), value });
                return Planned::Skipped { reason: "no matching sequence output".to_string() };
            }
        };

        match self.build_sequence(unit, entities, profile, placement, request, warnings) {
            Ok(plan) => Planned::Ready(plan),
            Err(e) => {
                warn!("Sequence for {} failed to plan: {}", unit.name(), e);
                Planned::Failed { error: e.to_string() }
            }
        }
    }

    fn build_sequence(
        &self,
        unit: &DeliverableUnit,
        entities: &UnitEntities,
        profile: &OutputProfile,
        placement: &Placement,
        request: &PlanRequest,
        warnings: &mut Vec<PlanWarning>,
    ) -> Result<SequencePlan, SubOutputError> {
        let config = self.config;
        self.validate(unit, RuleScope::Sequence, warnings)?;

        let media = &unit.media;
        let source = media.sequence_path.clone().ok_or(SubOutputError::MissingSource("no published frames"))?;
        let (first, last) = frame_range(media, media.frames_have_slate)?;

        let mut fields = unit.fields.clone();
        fields.insert("delivery_sequence_extension".to_string(), Value::from(profile.extension.clone()));
        let template = match unit.owner.entity_type {
            EntityType::Asset => "delivery_asset_sequence",
            _ => "delivery_shot_sequence",
        };
        let destination = placement.place(&self.registry.resolve(template, &fields)?);

        let file = FileContext {
            folder: destination.parent().map(Path::to_path_buf).unwrap_or_default(),
            path: destination.clone(),
            codec: profile.sequence_codec(),
            bit_depth: profile.sequence_bit_depth(),
            has_slate: config.add_slate_to_sequence,
            first_frame: Some(first),
            last_frame: Some(last),
        };
        let csv_row = self.csv_row(entities, &fields, &file, request)?;
        let slate = if config.add_slate_to_sequence {
            Some(self.slate(entities, &fields, &file, request, media.frames_have_slate, false))
        } else {
            None
        };

        Ok(SequencePlan {
            transfer: choose_transfer(profile, media.encoding.as_ref(), config.remove_alpha_from_sequence),
            profile: profile.clone(),
            source,
            destination,
            first_frame: first,
            last_frame: last,
            frame_rate: media.frame_rate.unwrap_or_default(),
            remove_alpha: config.remove_alpha_from_sequence,
            colorspace: config.sequence_colorspace.clone(),
            writer_settings: profile.writer_settings(),
            slate,
            csv_row,
        })
    }

    fn plan_preview(
        &self,
        unit: &DeliverableUnit,
        entities: &UnitEntities,
        placement: &Placement,
        request: &PlanRequest,
        warnings: &mut Vec<PlanWarning>,
    ) -> Planned<PreviewPlan> {
        let profiles = match_previews(&self.config.preview_outputs);
        if profiles.is_empty() {
            return Planned::Skipped { reason: "no preview outputs enabled".to_string() };
        }
        if let Err(e) = self.validate(unit, RuleScope::Preview, warnings) {
            warn!("Preview for {} failed to plan: {}", unit.name(), e);
            return Planned::Failed { error: e.to_string() };
        }

        let mut renders = vec![];
        for profile in profiles {
            match self.build_preview(unit, entities, profile, placement, request) {
                Ok(render) => renders.push(render),
                Err(e) => {
                    warn!("Preview \"{}\" for {} failed to plan: {}", profile.name, unit.name(), e);
                    return Planned::Failed { error: e.to_string() };
                }
            }
        }
        Planned::Ready(PreviewPlan { renders })
    }

    fn build_preview(
        &self,
        unit: &DeliverableUnit,
        entities: &UnitEntities,
        profile: &OutputProfile,
        placement: &Placement,
        request: &PlanRequest,
    ) -> Result<PreviewRender, SubOutputError> {
        let config = self.config;
        let media = &unit.media;
        let source = media.movie_path.clone().ok_or(SubOutputError::MissingSource("no movie to preview"))?;
        let (first, last) = frame_range(media, media.movie_has_slate)?;

        let mut fields = unit.fields.clone();
        fields.insert("delivery_preview_extension".to_string(), Value::from(profile.extension.clone()));
        let template = match unit.owner.entity_type {
            EntityType::Asset => "delivery_asset_preview",
            _ => "delivery_shot_preview",
        };
        let destination = placement.place(&self.registry.resolve(template, &fields)?);

        let file = FileContext {
            folder: destination.parent().map(Path::to_path_buf).unwrap_or_default(),
            path: destination.clone(),
            codec: profile.preview_codec(),
            bit_depth: profile.preview_bit_depth(),
            has_slate: true,
            first_frame: Some(first),
            last_frame: Some(last),
        };

        Ok(PreviewRender {
            csv_row: self.csv_row(entities, &fields, &file, request)?,
            slate: self.slate(entities, &fields, &file, request, media.movie_has_slate, true),
            profile: profile.clone(),
            source,
            destination,
            first_frame: first,
            last_frame: last,
            frame_rate: media.frame_rate.unwrap_or_default(),
            colorspace_idt: config.preview_colorspace_idt.clone(),
            colorspace_odt: config.preview_colorspace_odt.clone(),
            writer_settings: profile.writer_settings(),
        })
    }

    fn context<'c>(
        &self,
        entities: &'c UnitEntities,
        namespaces: &'c (Fields, Fields),
        fields: &'c Fields,
        file: &'c FileContext,
        request: &PlanRequest,
    ) -> ExpressionContext<'c> {
        ExpressionContext::new(request.timestamp)
            .with_fields(fields)
            .with_project(&entities.project)
            .with_shot(&namespaces.0)
            .with_version(&namespaces.1)
            .with_file(file)
    }

    /// Every CSV column is required; the first failure fails the sub-output
    fn csv_row(
        &self,
        entities: &UnitEntities,
        fields: &Fields,
        file: &FileContext,
        request: &PlanRequest,
    ) -> Result<CsvRow, SubOutputError> {
        let namespaces = (entities.owner.namespace(), entities.version.namespace());
        let ctx = self.context(entities, &namespaces, fields, file, request);

        let mut values = vec![];
        for column in &self.config.default_csv {
            let value = column.expression().evaluate(&ctx).map_err(|source| SubOutputError::Csv {
                column: column.name.clone(),
                source,
            })?;
            values.push(value);
        }
        Ok(CsvRow { values })
    }

    fn slate(
        &self,
        entities: &UnitEntities,
        fields: &Fields,
        file: &FileContext,
        request: &PlanRequest,
        input_has_slate: bool,
        preview: bool,
    ) -> SlateData {
        use tracking_fields::*;

        let config = self.config;
        let owner = &entities.owner;
        let version = &entities.version;
        let text = |entity: &Entity, field: &str| entity.text(field).unwrap_or_default();

        let sequence_name = owner.text(SEQUENCE);
        let mut episode = fields.get("Episode").and_then(render_value);
        let mut scene = None;
        if episode.is_none() {
            if let Some((ep, sc)) = sequence_name.as_deref().and_then(|name| name.split_once('_')) {
                if !sc.contains('_') {
                    episode = Some(ep.to_string());
                    scene = Some(sc.to_string());
                }
            }
        }

        let namespaces = (owner.namespace(), version.namespace());
        let ctx = self.context(entities, &namespaces, fields, file, request);
        let extra_fields = config
            .slate_extra_fields
            .iter()
            .map(|field| SlateField {
                name: field.name.clone(),
                value: field.expression().evaluate_optional(&ctx),
            })
            .collect();

        let new_submission_note = if preview && config.override_preview_submission_note {
            request.preview_submission_note.clone()
        } else {
            None
        };

        SlateData {
            version_name: text(version, CODE),
            submission_note: text(version, &config.submission_note_field),
            submission_note_short: text(version, &config.short_submission_note_field),
            new_submission_note,
            submitting_for: text(version, &config.submitting_for_field),
            shot_name: text(owner, CODE),
            shot_types: fields.get("task_name").and_then(render_value).unwrap_or_default(),
            vfx_scope_of_work: text(owner, &config.vfx_scope_of_work_field),
            show: get_field(&entities.project, &config.show_name_field)
                .and_then(render_value)
                .unwrap_or_default(),
            episode,
            scene,
            sequence_name,
            vendor: fields
                .get("vnd")
                .and_then(render_value)
                .or_else(|| get_field(&entities.project, VENDOR_ID).and_then(render_value))
                .unwrap_or_default(),
            input_has_slate,
            extra_fields,
        }
    }

    fn plan_extras(
        &self,
        unit: &DeliverableUnit,
        entities: &UnitEntities,
        placement: &Placement,
    ) -> Vec<ExtraTransfer> {
        let mut extras = vec![];

        let has_lut_templates =
            self.registry.contains("input_shot_lut") && self.registry.contains("delivery_shot_lut");
        if unit.owner.entity_type == EntityType::Shot && has_lut_templates {
            let source = self.registry.resolve("input_shot_lut", &unit.fields);
            let destination = self.registry.resolve("delivery_shot_lut", &unit.fields);
            match (source, destination) {
                (Ok(source), Ok(destination)) => extras.push(ExtraTransfer {
                    kind: ExtraKind::Lut,
                    source: source.to_string_lossy().into_owned(),
                    destination: placement.place(&destination),
                }),
                (Err(e), _) | (_, Err(e)) => warn!("No LUT delivered for {}: {}", unit.name(), e),
            }
        }

        if self.config.csv_uses_attachment() {
            if let Some(extra) = self.attachment(entities, &placement.folder) {
                extras.push(extra);
            }
        }

        extras
    }

    /// Version attachment, when it is a local file or an upload
    fn attachment(&self, entities: &UnitEntities, delivery_folder: &Path) -> Option<ExtraTransfer> {
        let attachment = entities.version.get(&self.config.attachment_field)?.as_object()?;
        let link_type = attachment.get("link_type").and_then(Value::as_str)?;
        let source = match link_type {
            "local" => attachment.get("local_path").and_then(render_value)?,
            "upload" => attachment.get("url").and_then(render_value)?,
            other => {
                debug!("Attachment link type \"{}\" is not delivered", other);
                return None;
            }
        };
        let name = attachment
            .get("name")
            .and_then(render_value)
            .or_else(|| {
                Path::new(&source)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })?;
        debug!("Delivering attachment \"{}\"", name);
        Some(ExtraTransfer {
            kind: ExtraKind::Attachment,
            source,
            destination: delivery_folder.join(name),
        })
    }
}

/// Frames to deliver, skipping a slate frame already in the source.
/// An empty range fails whatever the validation mode.
fn frame_range(media: &SourceMedia, skip_slate: bool) -> Result<(i64, i64), SubOutputError> {
    let (first, last) = match (media.first_frame, media.last_frame) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(SubOutputError::MissingSource("no frame range")),
    };
    let start = if skip_slate { first.checked_add(1) } else { Some(first) };
    match start {
        Some(start) if start <= last => Ok((start, last)),
        _ => Err(SubOutputError::EmptyFrameRange { first, last }),
    }
}

fn version_value(version: &DeliveryVersion) -> Value {
    match version.number {
        Some(number) => Value::from(number),
        None => Value::from(version.tag.clone()),
    }
}

/// Shots before Assets, then by sequence, owner and Version code
fn sorted_versions(snapshot: &TrackingSnapshot) -> Vec<&Entity> {
    let mut versions: Vec<&Entity> = snapshot.versions.iter().collect();
    versions.sort_by_key(|version| {
        let owner = snapshot.owner_of(version);
        (
            owner.map(|o| o.entity_type),
            owner.and_then(|o| o.text(tracking_fields::SEQUENCE)),
            owner.and_then(|o| o.text(tracking_fields::CODE)),
            version.text(tracking_fields::CODE),
            version.id,
        )
    });
    versions
}

fn outcome_name<T>(planned: &Planned<T>) -> &'static str {
    match planned {
        Planned::NotRequested => "not requested",
        Planned::Skipped { .. } => "skipped",
        Planned::Failed { .. } => "failed",
        Planned::Ready(_) => "ready",
    }
}
