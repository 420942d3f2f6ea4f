//! Contract Invariant Tests
//!
//! End-to-end runs over a JSON tracking snapshot and a temporary delivery
//! tree. These tests verify the guarantees listed in the crate docs.

use chrono::NaiveDate;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

use vfxdelivery_core::{
    canonical_json,
    config::ConfigError,
    execution::{ExecutionError, FsExecutor, RenderBackend, RenderJob},
    DeliveryConfig, DeliveryPipeline, Entity, EntityLink, EntityType, PipelineError, PlanRequest, Planned,
    SnapshotStore, TrackingSnapshot, TrackingStore, UnitState,
};

/// Writes preview movies, failing those whose path contains `fail_on`
struct TouchRenderer {
    fail_on: Option<&'static str>,
}

impl TouchRenderer {
    fn failing(&self, path: &Path) -> bool {
        self.fail_on.map_or(false, |pattern| path.to_string_lossy().contains(pattern))
    }
}

impl RenderBackend for TouchRenderer {
    fn render(&self, job: &RenderJob<'_>) -> Result<(), ExecutionError> {
        match job {
            RenderJob::Preview { render } if self.failing(&render.destination) => {
                Err(ExecutionError::Render("encoder crashed".into()))
            }
            RenderJob::Preview { render } => fs::write(&render.destination, b"mov").map_err(|source| ExecutionError::Io {
                path: render.destination.clone(),
                source,
            }),
            RenderJob::Transcode { .. } | RenderJob::SequenceSlate { .. } => Ok(()),
        }
    }
}

fn raw_config(root: &Path) -> Value {
    json!({
        "shot_delivery_status": "rfd",
        "version_delivery_status": "dlvr",
        "version_delivered_status": "dlvd",
        "version_preview_delivered_status": "pdlvd",
        "shot_delivered_status": "sdlvd",
        "source_encoding_field": "sg_encoding",
        "sequence_outputs": [
            {"name": "wip", "status": "WIP", "extension": "jpg"},
            {"name": "final", "status": "TECH CHECKED", "extension": "exr",
             "settings": {"compression": "zip1"}}
        ],
        "preview_outputs": [
            {"name": "h264", "extension": "mov", "settings": {"mov64_codec": "h264"}}
        ],
        "version_overrides": [
            {"entity_type": "PublishedFile", "match": {"task.name": "v000"},
             "replace": {"task.name": "Comp", "version_number": 0}}
        ],
        "default_csv": {
            "Version": "<version.code>",
            "File": "<file.name>",
            "Frames": "<file.name_ranged>"
        },
        "delivery_root": root,
        "templates": {
            "keys": {
                "delivery_version": {"type": "int", "format": "03"},
                "delivery_date": {"type": "date", "format": "%Y%m%d"},
                "version": {"type": "int", "format": "03"},
                "SEQ": {"type": "sequence", "format": "04"},
                "prj": {"entity_field": "project.sg_short_name"}
            },
            "paths": {
                "delivery_folder": {"definition": "{delivery_date}_{prj}_v{delivery_version}"},
                "delivery_shot_sequence": {"definition": "{delivery_date}_{prj}_v{delivery_version}/{Shot}/{Shot}_{task_name}_v{version}/{Shot}_{task_name}_v{version}.{SEQ}.{delivery_sequence_extension}"},
                "delivery_shot_preview": {"definition": "{delivery_date}_{prj}_v{delivery_version}/{Shot}/{Shot}_{task_name}_v{version}.{delivery_preview_extension}"},
                "delivery_asset_sequence": {"definition": "{delivery_date}_{prj}_v{delivery_version}/{Asset}/{Asset}_{task_name}_v{version}.{SEQ}.{delivery_sequence_extension}"},
                "delivery_asset_preview": {"definition": "{delivery_date}_{prj}_v{delivery_version}/{Asset}/{Asset}_{task_name}_v{version}.{delivery_preview_extension}"},
                "csv_submission_form": {"definition": "{delivery_date}_{prj}_v{delivery_version}/{prj}_submission_v{delivery_version}.csv"}
            }
        }
    })
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    pipeline: DeliveryPipeline,
    store: SnapshotStore,
}

impl Fixture {
    fn new() -> Self {
        Self::with(|_| {}, |_| {})
    }

    /// Fixture with the raw configuration and snapshot adjusted first
    fn with(configure: impl FnOnce(&mut Value), populate: impl FnOnce(&mut TrackingSnapshot)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("deliveries");
        let publish = dir.path().join("publish");
        fs::create_dir_all(&publish).unwrap();
        for frame in 1001..=1003 {
            fs::write(publish.join(format!("comp.{}.exr", frame)), format!("frame {}", frame)).unwrap();
        }

        let mut snapshot = TrackingSnapshot::new(
            Entity::new(EntityType::Project, 1)
                .with_field("name", "The Show")
                .with_field("sg_short_name", "ABC"),
        );
        snapshot.shots.push(shot(10, "010", "rfd"));
        snapshot.shots.push(shot(11, "020", "ip"));
        snapshot.published_files.push(
            Entity::new(EntityType::PublishedFile, 30)
                .with_field("version_number", 3)
                .with_field("task", json!({"type": "Task", "id": 2, "name": "v000"}))
                .with_field("path", json!({"local_path": publish.join("comp.%04d.exr")}))
                .with_field("sg_encoding", json!({"extension": "exr", "settings": {"compression": "zip1"}})),
        );
        snapshot.published_files.push(
            Entity::new(EntityType::PublishedFile, 31)
                .with_field("version_number", 5)
                .with_field("task", json!({"type": "Task", "id": 3, "name": "Comp"}))
                .with_field("path", json!({"local_path": publish.join("other.%04d.exr")})),
        );
        snapshot.versions.push(version(20, 10, 30, "010_comp_v003", "TECH CHECKED"));
        snapshot.versions.push(version(21, 11, 31, "020_comp_v005", "WIP"));
        populate(&mut snapshot);

        let snapshot_path = dir.path().join("snapshot.json");
        SnapshotStore::new(snapshot).save_to(&snapshot_path).unwrap();

        let mut raw = raw_config(&root);
        configure(&mut raw);
        let config = DeliveryConfig::from_value(raw).unwrap();
        Self {
            pipeline: DeliveryPipeline::new(config),
            store: SnapshotStore::load(&snapshot_path).unwrap(),
            root,
            _dir: dir,
        }
    }

    fn request(&self) -> PlanRequest {
        let timestamp = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(12, 0, 0).unwrap();
        PlanRequest::new(timestamp)
    }

    fn status(&self, entity_type: EntityType, id: u64) -> Option<Value> {
        self.store.current_value(EntityLink::new(entity_type, id), "sg_status_list").unwrap()
    }
}

fn shot(id: u64, code: &str, status: &str) -> Entity {
    Entity::new(EntityType::Shot, id)
        .with_field("code", code)
        .with_field("sg_status_list", status)
}

fn version(id: u64, shot: u64, published_file: u64, code: &str, outputs: &str) -> Entity {
    Entity::new(EntityType::Version, id)
        .with_field("code", code)
        .with_field("entity", json!({"type": "Shot", "id": shot}))
        .with_field("published_files", json!([{"type": "PublishedFile", "id": published_file}]))
        .with_field("sg_status_list", "dlvr")
        .with_field("sg_delivery_sequence_outputs", outputs)
        .with_field("sg_first_frame", 1001)
        .with_field("sg_last_frame", 1003)
        .with_field("sg_uploaded_movie_frame_rate", 24.0)
        .with_field("sg_path_to_movie", format!("/review/{}.mov", code))
}

#[test]
fn invariant_full_delivery() {
    let mut fx = Fixture::new();
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    assert_eq!(batch.folders[0].delivery_version.tag, "v001");

    let executor = FsExecutor::new(TouchRenderer { fail_on: None });
    let report = fx.pipeline.deliver(&mut batch, &executor, &mut fx.store).unwrap();
    assert!(!report.has_failures());
    assert!(batch.units.iter().all(|u| u.state == UnitState::StatusCommitted));

    let folder = fx.root.join("20240309_ABC_v001");
    let frame = folder.join("010/010_Comp_v000/010_Comp_v000.1002.exr");
    assert_eq!(fs::read_to_string(frame).unwrap(), "frame 1002");
    assert!(folder.join("010/010_Comp_v000.mov").is_file());
    assert!(folder.join("020/020_Comp_v005.mov").is_file());

    let manifest = fs::read_to_string(folder.join("ABC_submission_v001.csv")).unwrap();
    let lines: Vec<&str> = manifest.lines().collect();
    assert_eq!(lines[0], "Version,File,Frames");
    assert_eq!(lines[1], "010_comp_v003,010_Comp_v000.%04d.exr,010_Comp_v000.[1001-1003].exr");
    assert_eq!(lines.len(), 4);

    assert_eq!(fx.status(EntityType::Version, 20), Some(json!("dlvd")));
    assert_eq!(fx.status(EntityType::Version, 21), Some(json!("pdlvd")));
    assert_eq!(fx.status(EntityType::Shot, 10), Some(json!("sdlvd")));
    assert_eq!(report.commits.writes_to(EntityLink::new(EntityType::Shot, 10)), 1);
}

#[test]
fn invariant_statuses_follow_outcomes() {
    let mut fx = Fixture::new();
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();

    // Every preview fails; the linked sequence still ships
    let executor = FsExecutor::new(TouchRenderer { fail_on: Some(".mov") });
    let report = fx.pipeline.deliver(&mut batch, &executor, &mut fx.store).unwrap();
    assert!(report.has_failures());
    assert_eq!(report.manifest_rows, 1);

    assert_eq!(fx.status(EntityType::Version, 20), Some(json!("dlvd")));
    assert_eq!(fx.status(EntityType::Version, 21), Some(json!("dlvr")));
    assert_eq!(fx.status(EntityType::Shot, 10), Some(json!("sdlvd")));
    assert_eq!(fx.status(EntityType::Shot, 11), Some(json!("ip")));
}

#[test]
fn invariant_same_day_runs_bump_version() {
    let mut fx = Fixture::new();
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    let executor = FsExecutor::new(TouchRenderer { fail_on: None });
    fx.pipeline.deliver(&mut batch, &executor, &mut fx.store).unwrap();

    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    assert!(snapshot.versions.is_empty());
    let next = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    assert_eq!(next.folders[0].delivery_version.tag, "v002");
}

#[test]
fn invariant_resolved_version_is_claimed_once() {
    let mut fx = Fixture::new();
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    fs::create_dir_all(&batch.folders[0].path).unwrap();

    let executor = FsExecutor::new(TouchRenderer { fail_on: None });
    let result = fx.pipeline.deliver(&mut batch, &executor, &mut fx.store);
    assert!(matches!(result, Err(PipelineError::VersionCollision(_))));
    assert_eq!(fx.status(EntityType::Version, 20), Some(json!("dlvr")));
}

#[test]
fn invariant_one_failed_render_leaves_the_batch_running() {
    let mut fx = Fixture::with(
        |raw| {
            raw["preview_outputs"] = json!([
                {"name": "h264", "extension": "mov", "settings": {"mov64_codec": "h264"}},
                {"name": "proxy", "extension": "mp4", "settings": {"mov64_codec": "h264"}}
            ])
        },
        |_| {},
    );
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();

    let executor = FsExecutor::new(TouchRenderer { fail_on: Some("020_Comp_v005.mp4") });
    let report = fx.pipeline.deliver(&mut batch, &executor, &mut fx.store).unwrap();
    assert!(report.has_failures());
    assert_eq!(report.manifest_rows, 3);

    let folder = fx.root.join("20240309_ABC_v001");
    assert!(folder.join("010/010_Comp_v000.mp4").is_file());
    assert!(folder.join("020/020_Comp_v005.mov").is_file());
    assert_eq!(fx.status(EntityType::Version, 20), Some(json!("dlvd")));
    assert_eq!(fx.status(EntityType::Version, 21), Some(json!("dlvr")));
}

#[test]
fn invariant_empty_frame_range_is_never_delivered() {
    let mut fx = Fixture::with(
        |raw| raw["validation_failure_mode"] = json!("warn"),
        |snapshot| {
            snapshot.versions[0] = snapshot.versions[0]
                .clone()
                .with_field("sg_first_frame", 1003)
                .with_field("sg_last_frame", 1001);
        },
    );
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    assert!(matches!(batch.units[0].sequence, Planned::Failed { .. }));
    assert!(matches!(batch.units[0].preview, Planned::Failed { .. }));

    let executor = FsExecutor::new(TouchRenderer { fail_on: None });
    let report = fx.pipeline.deliver(&mut batch, &executor, &mut fx.store).unwrap();
    assert_eq!(report.manifest_rows, 1);
    assert!(!fx.root.join("20240309_ABC_v001/010").exists());
    assert_eq!(fx.status(EntityType::Version, 20), Some(json!("dlvr")));
    assert_eq!(fx.status(EntityType::Shot, 10), Some(json!("rfd")));
    assert_eq!(fx.status(EntityType::Version, 21), Some(json!("pdlvd")));
}

#[test]
fn invariant_each_episode_is_versioned_separately() {
    let mut fx = Fixture::with(
        |raw| {
            raw["episode_field"] = json!("sg_episode");
            for (_, template) in raw["templates"]["paths"].as_object_mut().unwrap() {
                let definition = format!("{{Episode}}/{}", template["definition"].as_str().unwrap());
                template["definition"] = json!(definition);
            }
        },
        |snapshot| {
            snapshot.shots[0] = snapshot.shots[0].clone().with_field("sg_episode", "EP01");
            snapshot.shots[1] = snapshot.shots[1].clone().with_field("sg_episode", "EP02");
        },
    );
    fs::create_dir_all(fx.root.join("EP02/20240309_ABC_v001")).unwrap();

    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let mut batch = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    let folders: Vec<(Option<&str>, &str)> = batch
        .folders
        .iter()
        .map(|f| (f.episode.as_deref(), f.delivery_version.tag.as_str()))
        .collect();
    assert_eq!(folders, vec![(Some("EP01"), "v001"), (Some("EP02"), "v002")]);

    let executor = FsExecutor::new(TouchRenderer { fail_on: None });
    let report = fx.pipeline.deliver(&mut batch, &executor, &mut fx.store).unwrap();
    assert!(!report.has_failures());
    assert!(fx.root.join("EP01/20240309_ABC_v001/010/010_Comp_v000.mov").is_file());
    assert!(fx.root.join("EP01/20240309_ABC_v001/ABC_submission_v001.csv").is_file());
    assert!(fx.root.join("EP02/20240309_ABC_v002/020/020_Comp_v005.mov").is_file());
    assert!(fx.root.join("EP02/20240309_ABC_v002/ABC_submission_v002.csv").is_file());
}

#[test]
fn invariant_plan_is_deterministic() {
    let fx = Fixture::new();
    let snapshot = fx.pipeline.snapshot(&fx.store).unwrap();
    let a = fx.pipeline.plan(&snapshot, fx.request()).unwrap();
    let b = fx.pipeline.plan(&snapshot, fx.request()).unwrap();

    assert_eq!(a.id, b.id);
    assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    assert!(matches!(a.units[0].sequence, Planned::Ready(_)));
}

#[test]
fn invariant_canonical_json_deterministic() {
    let obj1 = json!({"z": 1, "a": 2, "m": {"b": 1, "a": 2}});
    let obj2 = json!({"a": 2, "m": {"a": 2, "b": 1}, "z": 1});

    // Must be identical despite different input ordering
    assert_eq!(canonical_json(&obj1).unwrap(), canonical_json(&obj2).unwrap());
}

#[test]
fn invariant_bad_configuration_is_fatal() {
    let root = PathBuf::from("/deliveries");

    let mut raw = raw_config(&root);
    raw["slate_extra_fields"] = json!({
        "A": "<shot.a>", "B": "<shot.b>", "C": "<shot.c>", "D": "<shot.d>",
        "E": "<shot.e>", "F": "<shot.f>", "G": "<shot.g>"
    });
    assert!(matches!(
        DeliveryConfig::from_value(raw),
        Err(ConfigError::TooManySlateFields { count: 7, max: 6 })
    ));

    let mut raw = raw_config(&root);
    raw["sequence_outputs"][1]["status"] = json!("WIP");
    assert!(matches!(
        DeliveryConfig::from_value(raw),
        Err(ConfigError::DuplicateSequenceStatus(_))
    ));

    let mut raw = raw_config(&root);
    raw["version_overrides"] = json!([{"entity_type": "Sequence", "match": {}, "replace": {}}]);
    assert!(matches!(
        DeliveryConfig::from_value(raw),
        Err(ConfigError::MalformedOverride { index: 0, .. })
    ));
}
