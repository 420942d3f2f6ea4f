//! Execution Handoff
//!
//! The planner decides; an executor performs. `execute_batch` walks a batch
//! and records one outcome per sub-output, so a failed preview never stops
//! the sequence of the same unit or any other unit.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::entity::EntityLink;
use crate::expression::find_frame_pattern;
use crate::outputs::TransferMode;
use crate::planner::{DeliverableUnit, DeliveryBatch, ExtraTransfer, Planned, PreviewRender, SequencePlan, UnitState};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Source frame missing: {0}")]
    MissingFrame(PathBuf),

    #[error("No frames to transfer in range {first}-{last}")]
    EmptyFrameRange { first: i64, last: i64 },

    #[error("Cannot fetch {0}: only local files are delivered")]
    UnsupportedSource(String),

    #[error("{tool} failed with exit code {exit_code}: {message}")]
    CommandFailed { tool: String, exit_code: i32, message: String },

    #[error("Render failed: {0}")]
    Render(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ExecutionError + '_ {
    move |source| ExecutionError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum Outcome {
    #[default]
    NotAttempted,
    Succeeded,
    Failed { error: String },
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        *self == Outcome::Succeeded
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    fn from_result(result: Result<(), ExecutionError>) -> Self {
        match result {
            Ok(()) => Outcome::Succeeded,
            Err(e) => Outcome::Failed { error: e.to_string() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitOutcome {
    pub version: EntityLink,
    pub owner: EntityLink,
    pub sequence: Outcome,
    /// Succeeded only when every preview render succeeded
    pub preview: Outcome,
    pub extras: Vec<Outcome>,
}

impl UnitOutcome {
    pub fn delivered(&self) -> bool {
        self.sequence.succeeded() || self.preview.succeeded()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionReport {
    pub batch_id: String,
    pub units: Vec<UnitOutcome>,
    pub manifest: Outcome,
}

impl ExecutionReport {
    pub fn for_units(units: Vec<UnitOutcome>) -> Self {
        Self { units, ..Default::default() }
    }

    pub fn delivered(&self) -> usize {
        self.units.iter().filter(|u| u.delivered()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.manifest.is_failure()
            || self
                .units
                .iter()
                .any(|u| u.sequence.is_failure() || u.preview.is_failure() || u.extras.iter().any(Outcome::is_failure))
    }
}

/// Performs the file work of a plan
pub trait DeliveryExecutor {
    fn deliver_sequence(&self, unit: &DeliverableUnit, plan: &SequencePlan) -> Result<(), ExecutionError>;
    fn deliver_preview(&self, unit: &DeliverableUnit, render: &PreviewRender) -> Result<(), ExecutionError>;
    fn deliver_extra(&self, extra: &ExtraTransfer) -> Result<(), ExecutionError>;
}

/// Run every planned sub-output of a batch
pub fn execute_batch(batch: &DeliveryBatch, executor: &dyn DeliveryExecutor) -> ExecutionReport {
    let mut report = ExecutionReport { batch_id: batch.id.clone(), ..Default::default() };

    for unit in batch.units.iter().filter(|u| u.state == UnitState::Planned) {
        let sequence = match &unit.sequence {
            Planned::Ready(plan) => {
                let outcome = Outcome::from_result(executor.deliver_sequence(unit, plan));
                log_outcome(unit, "sequence", &outcome);
                outcome
            }
            _ => Outcome::NotAttempted,
        };

        let preview = match &unit.preview {
            Planned::Ready(plan) => {
                let errors: Vec<String> = plan
                    .renders
                    .iter()
                    .filter_map(|render| executor.deliver_preview(unit, render).err())
                    .map(|e| e.to_string())
                    .collect();
                let outcome = if errors.is_empty() {
                    Outcome::Succeeded
                } else {
                    Outcome::Failed { error: errors.join("; ") }
                };
                log_outcome(unit, "preview", &outcome);
                outcome
            }
            _ => Outcome::NotAttempted,
        };

        let extras = unit
            .extras
            .iter()
            .map(|extra| {
                let outcome = Outcome::from_result(executor.deliver_extra(extra));
                if let Outcome::Failed { error } = &outcome {
                    warn!("Failed to deliver {:?} for {}: {}", extra.kind, unit.name(), error);
                }
                outcome
            })
            .collect();

        report.units.push(UnitOutcome {
            version: unit.version_link(),
            owner: unit.owner_link(),
            sequence,
            preview,
            extras,
        });
    }

    info!("Delivered {} of {} units", report.delivered(), report.units.len());
    report
}

fn log_outcome(unit: &DeliverableUnit, what: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Failed { error: e } => error!("Failed to deliver {} {}: {}", unit.name(), what, e),
        _ => info!("Delivered {} {}", unit.name(), what),
    }
}

/// Work handed to the rendering engine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "job")]
pub enum RenderJob<'a> {
    /// Re-encode the sequence, slate included when planned
    Transcode { plan: &'a SequencePlan },
    /// Only the slate frame, in front of linked frames
    SequenceSlate { plan: &'a SequencePlan },
    Preview { render: &'a PreviewRender },
}

pub trait RenderBackend {
    fn render(&self, job: &RenderJob<'_>) -> Result<(), ExecutionError>;
}

/// Runs an external program with the JSON job as its last argument
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: vec![] }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl RenderBackend for CommandRenderer {
    fn render(&self, job: &RenderJob<'_>) -> Result<(), ExecutionError> {
        let payload = serde_json::to_string(job).map_err(|e| ExecutionError::Render(e.to_string()))?;
        let tool = self.program.display().to_string();
        debug!("Running: {} {}", tool, self.args.join(" "));

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&payload)
            .output()
            .map_err(|e| ExecutionError::Render(format!("Failed to run {}: {}", tool, e)))?;

        if !output.status.success() {
            return Err(ExecutionError::CommandFailed {
                tool,
                exit_code: output.status.code().unwrap_or(-1),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Filesystem executor: links or copies frames, delegates rendering
pub struct FsExecutor<R: RenderBackend> {
    renderer: R,
}

impl<R: RenderBackend> FsExecutor<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }
}

impl<R: RenderBackend> DeliveryExecutor for FsExecutor<R> {
    fn deliver_sequence(&self, unit: &DeliverableUnit, plan: &SequencePlan) -> Result<(), ExecutionError> {
        check_range(plan.first_frame, plan.last_frame)?;
        create_parent(&plan.destination)?;

        match plan.transfer {
            TransferMode::Transcode => self.renderer.render(&RenderJob::Transcode { plan }),
            TransferMode::LinkOrCopy => {
                for frame in plan.first_frame..=plan.last_frame {
                    let source = frame_path(&plan.source, frame);
                    if !source.exists() {
                        return Err(ExecutionError::MissingFrame(source));
                    }
                    link_or_copy(&source, &frame_path(&plan.destination, frame))?;
                }
                debug!(
                    "Linked {} frames for {}",
                    plan.last_frame - plan.first_frame + 1,
                    unit.name()
                );
                if plan.slate.is_some() {
                    self.renderer.render(&RenderJob::SequenceSlate { plan })?;
                }
                Ok(())
            }
        }
    }

    fn deliver_preview(&self, _unit: &DeliverableUnit, render: &PreviewRender) -> Result<(), ExecutionError> {
        check_range(render.first_frame, render.last_frame)?;
        create_parent(&render.destination)?;
        self.renderer.render(&RenderJob::Preview { render })
    }

    fn deliver_extra(&self, extra: &ExtraTransfer) -> Result<(), ExecutionError> {
        if extra.source.contains("://") {
            return Err(ExecutionError::UnsupportedSource(extra.source.clone()));
        }
        let source = Path::new(&extra.source);
        create_parent(&extra.destination)?;
        fs::copy(source, &extra.destination).map_err(io_error(source))?;
        Ok(())
    }
}

fn check_range(first: i64, last: i64) -> Result<(), ExecutionError> {
    if first > last {
        return Err(ExecutionError::EmptyFrameRange { first, last });
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<(), ExecutionError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).map_err(io_error(parent)),
        _ => Ok(()),
    }
}

/// Substitute a `%0Nd` frame pattern with a concrete frame number
pub fn frame_path(pattern: &Path, frame: i64) -> PathBuf {
    let text = pattern.to_string_lossy();
    match find_frame_pattern(&text) {
        Some((start, end)) => {
            let width = text[start + 1..end - 1].parse::<usize>().unwrap_or(0);
            PathBuf::from(format!("{}{:0width$}{}", &text[..start], frame, &text[end..], width = width))
        }
        None => pattern.to_path_buf(),
    }
}

/// Symlink where the platform supports it, byte copy otherwise.
/// An existing destination is replaced.
pub fn link_or_copy(source: &Path, destination: &Path) -> Result<(), ExecutionError> {
    if destination.symlink_metadata().is_ok() {
        fs::remove_file(destination).map_err(io_error(destination))?;
    }

    #[cfg(unix)]
    {
        match std::os::unix::fs::symlink(source, destination) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Symlink {} failed ({}), copying", destination.display(), e),
        }
    }

    fs::copy(source, destination).map_err(io_error(destination))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::DeliveryConfig;
    use crate::planner::tests::{config, snapshot, timestamp};
    use crate::planner::{DeliveryPlanner, PlanRequest};
    use serde_json::json;
    use std::cell::RefCell;

    /// Records jobs, failing previews whose destination contains `fail_on`
    #[derive(Default)]
    struct RecordingRenderer {
        jobs: RefCell<Vec<String>>,
        fail_on: Option<String>,
    }

    impl RenderBackend for RecordingRenderer {
        fn render(&self, job: &RenderJob<'_>) -> Result<(), ExecutionError> {
            let (kind, target) = match job {
                RenderJob::Transcode { plan } => ("transcode", plan.destination.clone()),
                RenderJob::SequenceSlate { plan } => ("slate", plan.destination.clone()),
                RenderJob::Preview { render } => ("preview", render.destination.clone()),
            };
            let target = target.display().to_string();
            self.jobs.borrow_mut().push(format!("{} {}", kind, target));
            match &self.fail_on {
                Some(pattern) if target.contains(pattern.as_str()) => Err(ExecutionError::Render("boom".into())),
                _ => Ok(()),
            }
        }
    }

    fn batch(root: &Path) -> DeliveryBatch {
        batch_with(root, config())
    }

    fn batch_with(root: &Path, config: DeliveryConfig) -> DeliveryBatch {
        let planner = DeliveryPlanner::new(&config).unwrap();
        let mut request = PlanRequest::new(timestamp());
        request.destination_root = Some(root.to_path_buf());
        planner.plan(&snapshot(), &request).unwrap()
    }

    #[test]
    fn test_frame_path() {
        assert_eq!(frame_path(Path::new("/a/shot.%04d.exr"), 1001), PathBuf::from("/a/shot.1001.exr"));
        assert_eq!(frame_path(Path::new("/a/shot.%06d.exr"), 7), PathBuf::from("/a/shot.000007.exr"));
        assert_eq!(frame_path(Path::new("/a/movie.mov"), 7), PathBuf::from("/a/movie.mov"));
    }

    #[test]
    fn test_link_or_copy_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.exr");
        let destination = dir.path().join("dst.exr");
        fs::write(&source, b"frame").unwrap();
        fs::write(&destination, b"old").unwrap();
        link_or_copy(&source, &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"frame");
    }

    #[test]
    fn test_failed_preview_does_not_block_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch(dir.path());
        let renderer = RecordingRenderer { fail_on: Some("010_Comp_v000.mov".into()), ..Default::default() };
        let executor = FsExecutor::new(renderer);

        let report = execute_batch(&batch, &executor);
        assert_eq!(report.batch_id, batch.id);
        let first = &report.units[0];
        assert!(first.sequence.succeeded());
        assert!(first.preview.is_failure());
        assert!(report.units[1].preview.succeeded());
        assert!(report.has_failures());
        assert_eq!(report.delivered(), 2);
    }

    #[test]
    fn test_linked_frames_are_copied_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = batch(&dir.path().join("out"));
        let source_dir = dir.path().join("publish");
        fs::create_dir_all(&source_dir).unwrap();

        let unit = &mut batch.units[0];
        let plan = match &mut unit.sequence {
            Planned::Ready(plan) => plan,
            other => panic!("sequence not ready: {:?}", other),
        };
        plan.transfer = TransferMode::LinkOrCopy;
        plan.source = source_dir.join("comp.%04d.exr");
        plan.first_frame = 1;
        plan.last_frame = 3;
        plan.slate = None;
        for frame in 1..=3 {
            fs::write(frame_path(&plan.source, frame), format!("f{}", frame)).unwrap();
        }

        let executor = FsExecutor::new(RecordingRenderer::default());
        let result = executor.deliver_sequence(unit, unit.sequence.ready().unwrap());
        assert!(result.is_ok());
        let destination = &unit.sequence.ready().unwrap().destination;
        assert_eq!(fs::read_to_string(frame_path(destination, 2)).unwrap(), "f2");
        assert!(executor.renderer.jobs.borrow().is_empty());
    }

    #[test]
    fn test_missing_frame_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = batch(dir.path());
        if let Planned::Ready(plan) = &mut batch.units[0].sequence {
            plan.transfer = TransferMode::LinkOrCopy;
            plan.source = dir.path().join("missing.%04d.exr");
        }
        let report = execute_batch(&batch, &FsExecutor::new(RecordingRenderer::default()));
        assert!(report.units[0].sequence.is_failure());
    }

    #[test]
    fn test_inverted_range_is_not_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = batch(dir.path());
        let source = dir.path().join("comp.%04d.exr");
        if let Planned::Ready(plan) = &mut batch.units[0].sequence {
            plan.transfer = TransferMode::LinkOrCopy;
            plan.source = source.clone();
            plan.first_frame = 1010;
            plan.last_frame = 1001;
        }
        fs::write(frame_path(&source, 1001), b"frame").unwrap();

        let report = execute_batch(&batch, &FsExecutor::new(RecordingRenderer::default()));
        assert!(matches!(&report.units[0].sequence, Outcome::Failed { error } if error.contains("1010-1001")));
        assert!(!report.units[0].sequence.succeeded());
    }

    #[test]
    fn test_inverted_preview_range_is_not_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = batch(dir.path());
        if let Planned::Ready(plan) = &mut batch.units[1].preview {
            plan.renders[0].first_frame = 1010;
            plan.renders[0].last_frame = 1001;
        }

        let executor = FsExecutor::new(RecordingRenderer::default());
        let report = execute_batch(&batch, &executor);
        assert!(matches!(&report.units[1].preview, Outcome::Failed { error } if error.contains("1010-1001")));
        assert!(!executor.renderer.jobs.borrow().iter().any(|job| job.contains("020_Comp_v005")));
        assert!(report.units[0].preview.succeeded());
    }

    #[test]
    fn test_failed_render_fails_only_its_unit() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = sample_config();
        raw["preview_outputs"] = json!([
            {"name": "h264", "extension": "mov", "settings": {"mov64_codec": "h264"}},
            {"name": "proxy", "extension": "mp4", "settings": {"mov64_codec": "h264"}}
        ]);
        let batch = batch_with(dir.path(), DeliveryConfig::from_value(raw).unwrap());
        assert_eq!(batch.units[1].preview.ready().unwrap().renders.len(), 2);

        let renderer = RecordingRenderer { fail_on: Some("020_Comp_v005.mp4".into()), ..Default::default() };
        let executor = FsExecutor::new(renderer);
        let report = execute_batch(&batch, &executor);

        assert!(matches!(&report.units[1].preview, Outcome::Failed { error } if error.contains("boom")));
        assert!(!report.units[1].delivered());
        assert!(report.units[0].sequence.succeeded());
        assert!(report.units[0].preview.succeeded());
        assert_eq!(report.delivered(), 1);

        let jobs = executor.renderer.jobs.borrow();
        assert!(jobs.iter().any(|job| job.ends_with("020_Comp_v005.mov")));
        assert!(jobs.iter().any(|job| job.ends_with("010_Comp_v000.mp4")));
    }

    #[test]
    fn test_remote_extras_are_rejected() {
        let executor = FsExecutor::new(RecordingRenderer::default());
        let extra = ExtraTransfer {
            kind: crate::planner::ExtraKind::Attachment,
            source: "https://example.com/notes.pdf".into(),
            destination: PathBuf::from("/tmp/notes.pdf"),
        };
        assert!(matches!(executor.deliver_extra(&extra), Err(ExecutionError::UnsupportedSource(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_renderer_exit_status() {
        let render = |program: &str| {
            let dir = tempfile::tempdir().unwrap();
            let batch = batch(dir.path());
            let plan = batch.units[0].sequence.ready().unwrap().clone();
            CommandRenderer::new(program).render(&RenderJob::Transcode { plan: &plan })
        };
        assert!(render("true").is_ok());
        assert!(matches!(render("false"), Err(ExecutionError::CommandFailed { exit_code: 1, .. })));
    }
}
