//! Status Transition Engine
//!
//! Statuses are committed only after execution outcomes are known. A Shot is
//! written at most once per run no matter how many of its Versions shipped,
//! and every write is preceded by a read so re-running a commit is a no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use crate::config::DeliveryConfig;
use crate::entity::{render_value, EntityLink, EntityType};
use crate::execution::ExecutionReport;
use crate::tracking::TrackingStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPolicy {
    pub version_status_field: String,
    pub shot_status_field: String,
    pub asset_status_field: Option<String>,
    pub version_delivered: String,
    pub version_preview_delivered: String,
    pub shot_delivered: String,
}

impl StatusPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            version_status_field: config.version_status_field.clone(),
            shot_status_field: config.shot_status_field.clone(),
            asset_status_field: config.asset_status_field.clone(),
            version_delivered: config.version_delivered_status.clone(),
            version_preview_delivered: config.version_preview_delivered_status.clone(),
            shot_delivered: config.shot_delivered_status.clone(),
        }
    }

    /// A delivered sequence takes precedence over a delivered preview
    pub fn compute_version_status(&self, sequence_delivered: bool, preview_delivered: bool) -> Option<&str> {
        if sequence_delivered {
            Some(&self.version_delivered)
        } else if preview_delivered {
            Some(&self.version_preview_delivered)
        } else {
            None
        }
    }

    pub fn compute_shot_status(&self, any_version_delivered: bool) -> Option<&str> {
        any_version_delivered.then_some(self.shot_delivered.as_str())
    }

    fn owner_status_field(&self, owner: EntityLink) -> Option<&str> {
        match owner.entity_type {
            EntityType::Shot => Some(&self.shot_status_field),
            EntityType::Asset => self.asset_status_field.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum CommitAction {
    Written,
    /// Current value already matched
    Unchanged,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitRecord {
    pub entity: EntityLink,
    pub field: String,
    pub value: String,
    #[serde(flatten)]
    pub action: CommitAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitSummary {
    pub records: Vec<CommitRecord>,
}

impl CommitSummary {
    pub fn written(&self) -> usize {
        self.records.iter().filter(|r| r.action == CommitAction::Written).count()
    }

    pub fn failed(&self) -> Vec<&CommitRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.action, CommitAction::Failed { .. }))
            .collect()
    }

    pub fn writes_to(&self, entity: EntityLink) -> usize {
        self.records
            .iter()
            .filter(|r| r.entity == entity && r.action == CommitAction::Written)
            .count()
    }
}

/// Issues status writes for one execution report
pub struct StatusCommitter<'a> {
    policy: StatusPolicy,
    store: &'a mut dyn TrackingStore,
}

impl<'a> StatusCommitter<'a> {
    pub fn new(policy: StatusPolicy, store: &'a mut dyn TrackingStore) -> Self {
        Self { policy, store }
    }

    pub fn commit(&mut self, report: &ExecutionReport) -> CommitSummary {
        let mut summary = CommitSummary::default();
        let mut owners: BTreeMap<EntityLink, bool> = BTreeMap::new();

        for unit in &report.units {
            let sequence = unit.sequence.succeeded();
            let preview = unit.preview.succeeded();

            if let Some(status) = self.policy.compute_version_status(sequence, preview) {
                let field = self.policy.version_status_field.clone();
                let status = status.to_string();
                summary.records.push(self.write(unit.version, &field, &status));
            }
            *owners.entry(unit.owner).or_default() |= sequence || preview;
        }

        for (owner, delivered) in owners {
            let status = match self.policy.compute_shot_status(delivered) {
                Some(status) => status.to_string(),
                None => continue,
            };
            let field = match self.policy.owner_status_field(owner) {
                Some(field) => field.to_string(),
                None => continue,
            };
            summary.records.push(self.write(owner, &field, &status));
        }

        info!(
            "Committed {} status changes ({} failed)",
            summary.written(),
            summary.failed().len()
        );
        summary
    }

    fn write(&mut self, entity: EntityLink, field: &str, value: &str) -> CommitRecord {
        let record = |action| CommitRecord {
            entity,
            field: field.to_string(),
            value: value.to_string(),
            action,
        };

        match self.store.current_value(entity, field) {
            Ok(current) if current.as_ref().and_then(render_value).as_deref() == Some(value) => {
                debug!("{} {} already {}", entity, field, value);
                return record(CommitAction::Unchanged);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read {} {}: {}", entity, field, e);
                return record(CommitAction::Failed { error: e.to_string() });
            }
        }

        match self.store.update(entity, field, Value::from(value)) {
            Ok(()) => {
                info!("Set {} {} to {}", entity, field, value);
                record(CommitAction::Written)
            }
            Err(e) => {
                error!("Failed to update {} {}: {}", entity, field, e);
                record(CommitAction::Failed { error: e.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::execution::{Outcome, UnitOutcome};
    use crate::tracking::{SnapshotStore, TrackingSnapshot};
    use serde_json::json;

    fn policy() -> StatusPolicy {
        StatusPolicy {
            version_status_field: "sg_status_list".into(),
            shot_status_field: "sg_status_list".into(),
            asset_status_field: None,
            version_delivered: "dlvd".into(),
            version_preview_delivered: "pdlvd".into(),
            shot_delivered: "sdlvd".into(),
        }
    }

    fn store() -> SnapshotStore {
        let mut snapshot = TrackingSnapshot::new(Entity::new(EntityType::Project, 1));
        snapshot.shots.push(Entity::new(EntityType::Shot, 10).with_field("sg_status_list", "rfd"));
        for id in [20, 21, 22] {
            snapshot.versions.push(Entity::new(EntityType::Version, id).with_field("sg_status_list", "dlvr"));
        }
        SnapshotStore::new(snapshot)
    }

    fn unit(version: u64, sequence: Outcome, preview: Outcome) -> UnitOutcome {
        UnitOutcome {
            version: EntityLink::new(EntityType::Version, version),
            owner: EntityLink::new(EntityType::Shot, 10),
            sequence,
            preview,
            extras: vec![],
        }
    }

    fn failed() -> Outcome {
        Outcome::Failed { error: "render crashed".into() }
    }

    #[test]
    fn test_version_status_precedence() {
        let policy = policy();
        assert_eq!(policy.compute_version_status(true, true), Some("dlvd"));
        assert_eq!(policy.compute_version_status(true, false), Some("dlvd"));
        assert_eq!(policy.compute_version_status(false, true), Some("pdlvd"));
        assert_eq!(policy.compute_version_status(false, false), None);
        assert_eq!(policy.compute_shot_status(true), Some("sdlvd"));
        assert_eq!(policy.compute_shot_status(false), None);
    }

    #[test]
    fn test_shot_written_once_for_many_versions() {
        let mut store = store();
        let report = ExecutionReport::for_units(vec![
            unit(20, Outcome::Succeeded, Outcome::Succeeded),
            unit(21, Outcome::NotAttempted, Outcome::Succeeded),
            unit(22, failed(), failed()),
        ]);

        let summary = StatusCommitter::new(policy(), &mut store).commit(&report);
        let shot = EntityLink::new(EntityType::Shot, 10);
        assert_eq!(summary.writes_to(shot), 1);
        assert_eq!(summary.written(), 3);

        let value = |id| store.current_value(EntityLink::new(EntityType::Version, id), "sg_status_list").unwrap();
        assert_eq!(value(20), Some(json!("dlvd")));
        assert_eq!(value(21), Some(json!("pdlvd")));
        assert_eq!(value(22), Some(json!("dlvr")));
        assert_eq!(store.current_value(shot, "sg_status_list").unwrap(), Some(json!("sdlvd")));
    }

    #[test]
    fn test_recommit_is_idempotent() {
        let mut store = store();
        let report = ExecutionReport::for_units(vec![unit(20, Outcome::Succeeded, Outcome::NotAttempted)]);
        StatusCommitter::new(policy(), &mut store).commit(&report);
        let again = StatusCommitter::new(policy(), &mut store).commit(&report);
        assert_eq!(again.written(), 0);
        assert!(again.records.iter().all(|r| r.action == CommitAction::Unchanged));
    }

    #[test]
    fn test_nothing_delivered_writes_nothing() {
        let mut store = store();
        let report = ExecutionReport::for_units(vec![unit(20, failed(), Outcome::NotAttempted)]);
        let summary = StatusCommitter::new(policy(), &mut store).commit(&report);
        assert!(summary.records.is_empty());
    }

    #[test]
    fn test_write_failure_is_recorded() {
        let mut store = store();
        let mut missing = unit(20, Outcome::Succeeded, Outcome::NotAttempted);
        missing.version = EntityLink::new(EntityType::Version, 99);
        let summary = StatusCommitter::new(policy(), &mut store).commit(&ExecutionReport::for_units(vec![missing]));
        assert_eq!(summary.failed().len(), 1);
        assert_eq!(summary.writes_to(EntityLink::new(EntityType::Shot, 10)), 1);
    }
}
