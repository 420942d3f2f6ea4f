//! VFX Delivery Core - Delivery Resolution Engine
//!
//! Decides what ships, where it lands and what it is called, then hands the
//! file work to an executor and commits statuses from the outcomes.
//!
//! # Guarantees
//! 1. Same snapshot, config and date produce the same plan, byte for byte
//! 2. Statuses follow execution outcomes, never the plan
//! 3. A failed sub-output never blocks its siblings
//! 4. A Shot is written at most once per run

pub mod entity;
pub mod expression;
pub mod templates;
pub mod formats;
pub mod versioning;
pub mod outputs;
pub mod overrides;
pub mod config;
pub mod validation;
pub mod tracking;
pub mod planner;
pub mod execution;
pub mod manifest;
pub mod status;
pub mod hashing;
pub mod pipeline;

pub use config::{ConfigError, DeliveryConfig};
pub use entity::{Entity, EntityLink, EntityType};
pub use execution::{CommandRenderer, DeliveryExecutor, ExecutionReport, FsExecutor, Outcome};
pub use expression::{Expression, ExpressionContext, ExpressionError};
pub use hashing::{canonical_json, compute_plan_hash};
pub use pipeline::{DeliveryPipeline, DeliveryReport, PipelineError};
pub use planner::{DeliverableUnit, DeliveryBatch, DeliveryPlanner, FolderPlan, PlanRequest, Planned, UnitState};
pub use status::{CommitSummary, StatusPolicy};
pub use templates::{TemplateError, TemplateRegistry};
pub use tracking::{SnapshotStore, TrackingSnapshot, TrackingStore};
pub use versioning::{resolve_version, DeliveryVersion, VersionError};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
