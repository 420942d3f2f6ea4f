//! Delivery Pipeline - Single Entry Point
//!
//! Plan, execute, write the manifests, commit statuses. Statuses are only
//! committed from execution outcomes, never from the plan.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, DeliveryConfig};
use crate::execution::{execute_batch, DeliveryExecutor, ExecutionReport, Outcome};
use crate::manifest::{delivered_rows, write_manifest, ManifestError};
use crate::planner::{DeliveryBatch, DeliveryPlanner, FolderPlan, PlanError, PlanRequest, UnitState};
use crate::status::{CommitSummary, StatusCommitter, StatusPolicy};
use crate::tracking::{TrackingError, TrackingSnapshot, TrackingStore};
use crate::versioning::list_folder_names;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Delivery folder {0} already exists, another run claimed this version")]
    VersionCollision(PathBuf),

    #[error("Failed to access {0}: {1}")]
    Io(PathBuf, #[source] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything that happened to one batch after planning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub batch_id: String,
    pub plan_hash: String,
    pub folders: Vec<FolderPlan>,
    pub execution: ExecutionReport,
    pub manifest_rows: usize,
    pub commits: CommitSummary,
}

impl DeliveryReport {
    pub fn has_failures(&self) -> bool {
        self.execution.has_failures() || !self.commits.failed().is_empty()
    }
}

/// The delivery pipeline - single entry point for planning and delivering
pub struct DeliveryPipeline {
    config: DeliveryConfig,
}

impl DeliveryPipeline {
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        Ok(Self::new(DeliveryConfig::load(path)?))
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn planner(&self) -> Result<DeliveryPlanner<'_>, PipelineError> {
        Ok(DeliveryPlanner::new(&self.config)?)
    }

    /// Read the tracking snapshot for one run
    pub fn snapshot(&self, store: &dyn TrackingStore) -> Result<TrackingSnapshot, PipelineError> {
        Ok(TrackingSnapshot::load(store, &self.config)?)
    }

    /// Fill in the existing delivery folders from disk unless the caller
    /// already listed them. Per-episode folders are listed per episode.
    pub fn prepare_request(
        &self,
        snapshot: &TrackingSnapshot,
        mut request: PlanRequest,
    ) -> Result<PlanRequest, PipelineError> {
        let planner = self.planner()?;
        if request.existing_delivery_folders.is_empty() {
            let dir = planner.listing_dir(snapshot, &request, None);
            request.existing_delivery_folders = list_folders(&dir)?;
        }
        if planner.per_episode_folders() {
            for episode in planner.episodes(snapshot, &request)? {
                if request.episode_delivery_folders.contains_key(&episode) {
                    continue;
                }
                let dir = planner.listing_dir(snapshot, &request, Some(&episode));
                let names = list_folders(&dir)?;
                request.episode_delivery_folders.insert(episode, names);
            }
        }
        Ok(request)
    }

    /// Plan a batch. Never touches the delivery tree beyond listing it.
    pub fn plan(&self, snapshot: &TrackingSnapshot, request: PlanRequest) -> Result<DeliveryBatch, PipelineError> {
        let request = self.prepare_request(snapshot, request)?;
        Ok(self.planner()?.plan(snapshot, &request)?)
    }

    /// Execute a planned batch and commit the resulting statuses
    pub fn deliver(
        &self,
        batch: &mut DeliveryBatch,
        executor: &dyn DeliveryExecutor,
        store: &mut dyn TrackingStore,
    ) -> Result<DeliveryReport, PipelineError> {
        self.claim_delivery_folders(batch)?;

        let mut execution = execute_batch(batch, executor);
        advance(batch, UnitState::Planned, UnitState::Executed)?;

        let mut manifest_rows = 0;
        let mut manifest_errors = vec![];
        for folder in &batch.folders {
            let rows = delivered_rows(batch, &execution, folder);
            if rows.is_empty() {
                continue;
            }
            match write_manifest(&folder.manifest, &rows) {
                Ok(count) => manifest_rows += count,
                Err(e) => {
                    error!("Failed to write manifest: {}", e);
                    manifest_errors.push(e.to_string());
                }
            }
        }
        if !manifest_errors.is_empty() {
            execution.manifest = Outcome::Failed { error: manifest_errors.join("; ") };
        } else if manifest_rows > 0 {
            execution.manifest = Outcome::Succeeded;
        }

        let policy = StatusPolicy::from_config(&self.config);
        let commits = StatusCommitter::new(policy, store).commit(&execution);
        advance(batch, UnitState::Executed, UnitState::StatusCommitted)?;

        info!(
            "Delivery {} complete: {} units delivered into {} folders, {} statuses written",
            batch.id,
            execution.delivered(),
            batch.folders.len(),
            commits.written()
        );

        Ok(DeliveryReport {
            batch_id: batch.id.clone(),
            plan_hash: batch.plan_hash.clone(),
            folders: batch.folders.clone(),
            execution,
            manifest_rows,
            commits,
        })
    }

    /// Create every delivery folder of the batch. Folders created before a
    /// failing claim are removed again.
    fn claim_delivery_folders(&self, batch: &DeliveryBatch) -> Result<(), PipelineError> {
        let mut created = vec![];
        for folder in &batch.folders {
            match claim_folder(folder) {
                Ok(true) => created.push(&folder.path),
                Ok(false) => {}
                Err(e) => {
                    for path in created {
                        if let Err(e) = fs::remove_dir(path) {
                            warn!("Failed to release delivery folder {}: {}", path.display(), e);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Create one delivery folder. A resolved version must create it
/// exclusively; a manual version may reuse an existing one. Returns whether
/// the folder was created by this call.
fn claim_folder(folder: &FolderPlan) -> Result<bool, PipelineError> {
    let path = &folder.path;
    let io_error = |e| PipelineError::Io(path.clone(), e);

    if folder.delivery_version.is_manual() {
        let existed = path.is_dir();
        fs::create_dir_all(path).map_err(io_error)?;
        return Ok(!existed);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::Io(parent.to_path_buf(), e))?;
    }
    match fs::create_dir(path) {
        Ok(()) => {
            debug!("Created delivery folder {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!("Delivery folder {} appeared after planning", path.display());
            Err(PipelineError::VersionCollision(path.clone()))
        }
        Err(e) => Err(io_error(e)),
    }
}

fn list_folders(dir: &Path) -> Result<Vec<String>, PipelineError> {
    let names = list_folder_names(dir).map_err(|e| PipelineError::Io(dir.to_path_buf(), e))?;
    debug!("Found {} existing delivery folders in {}", names.len(), dir.display());
    Ok(names)
}

fn advance(batch: &mut DeliveryBatch, from: UnitState, to: UnitState) -> Result<(), PlanError> {
    for unit in batch.units.iter_mut().filter(|u| u.state == from) {
        unit.state = unit.state.advance(to)?;
    }
    Ok(())
}
