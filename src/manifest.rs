//! CSV Submission Manifest
//!
//! One manifest per delivery folder, one row per delivered file. Rows
//! already present in the manifest are kept and re-aligned to the configured
//! columns by header name, so running a second batch into the same delivery
//! folder appends instead of replacing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::execution::ExecutionReport;
use crate::planner::{CsvRow, DeliveryBatch, FolderPlan, ManifestPlan};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to access manifest {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Invalid CSV in {0}: {1}")]
    Csv(PathBuf, #[source] csv::Error),
}

/// Rows for every sub-output delivered into `folder`, in batch order
pub fn delivered_rows(batch: &DeliveryBatch, report: &ExecutionReport, folder: &FolderPlan) -> Vec<CsvRow> {
    let mut rows = vec![];
    for unit in batch.units_in(folder) {
        let outcome = match report.units.iter().find(|o| o.version == unit.version_link()) {
            Some(outcome) => outcome,
            None => continue,
        };
        if let (Some(plan), true) = (unit.sequence.ready(), outcome.sequence.succeeded()) {
            rows.push(plan.csv_row.clone());
        }
        if let (Some(plan), true) = (unit.preview.ready(), outcome.preview.succeeded()) {
            rows.extend(plan.renders.iter().map(|render| render.csv_row.clone()));
        }
    }
    rows
}

/// Existing rows keyed by header name. A missing file has no rows.
pub fn read_existing(path: &Path) -> Result<Vec<HashMap<String, String>>, ManifestError> {
    if !path.is_file() {
        return Ok(vec![]);
    }
    let csv_error = |e| ManifestError::Csv(path.to_path_buf(), e);
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path).map_err(csv_error)?;
    let header: Vec<String> = reader.headers().map_err(csv_error)?.iter().map(str::to_string).collect();

    let mut rows: Vec<HashMap<String, String>> = vec![];
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        rows.push(header.iter().cloned().zip(record.iter().map(str::to_string)).collect());
    }
    debug!("Read {} existing rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Write the manifest: header, existing rows, then new rows
pub fn write_manifest(plan: &ManifestPlan, rows: &[CsvRow]) -> Result<usize, ManifestError> {
    let path = &plan.path;
    let existing = read_existing(path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ManifestError::Io(parent.to_path_buf(), e))?;
    }

    let csv_error = |e| ManifestError::Csv(path.clone(), e);
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer.write_record(&plan.columns).map_err(csv_error)?;

    for row in &existing {
        let aligned = plan
            .columns
            .iter()
            .map(|column| row.get(column).map(String::as_str).unwrap_or_default());
        writer.write_record(aligned).map_err(csv_error)?;
    }
    for row in rows {
        writer
            .write_record(row.values.iter().map(|value| sanitize(value)))
            .map_err(csv_error)?;
    }
    writer.flush().map_err(|e| ManifestError::Io(path.clone(), e))?;

    info!(
        "Wrote {} rows to {} ({} kept)",
        rows.len(),
        path.display(),
        existing.len()
    );
    Ok(existing.len() + rows.len())
}

/// Strip control characters other than line breaks and tabs
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Outcome, UnitOutcome};
    use crate::planner::tests::{config, snapshot, timestamp};
    use crate::planner::{DeliveryPlanner, PlanRequest};

    fn plan(dir: &Path) -> ManifestPlan {
        ManifestPlan {
            path: dir.join("ABC_submission_v001.csv"),
            columns: vec!["Version".into(), "File".into()],
        }
    }

    fn row(values: &[&str]) -> CsvRow {
        CsvRow { values: values.iter().map(|v| v.to_string()).collect() }
    }

    #[test]
    fn test_sanitize_keeps_line_breaks() {
        assert_eq!(sanitize("a\u{7}b\tc\nd\u{0}"), "ab\tc\nd");
    }

    #[test]
    fn test_write_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        assert_eq!(write_manifest(&plan, &[row(&["v1", "a.exr"])]).unwrap(), 1);
        assert_eq!(write_manifest(&plan, &[row(&["v2", "b.mov"])]).unwrap(), 2);

        let text = fs::read_to_string(&plan.path).unwrap();
        assert_eq!(text, "Version,File\nv1,a.exr\nv2,b.mov\n");
    }

    #[test]
    fn test_existing_rows_realigned_by_header() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        fs::write(&plan.path, "File,Notes,Version\nold.exr,x,v0\n").unwrap();

        write_manifest(&plan, &[row(&["v1", "new, quoted.exr"])]).unwrap();
        let text = fs::read_to_string(&plan.path).unwrap();
        assert_eq!(text, "Version,File\nv0,old.exr\nv1,\"new, quoted.exr\"\n");
    }

    #[test]
    fn test_only_delivered_outputs_get_rows() {
        let config = config();
        let planner = DeliveryPlanner::new(&config).unwrap();
        let batch = planner.plan(&snapshot(), &PlanRequest::new(timestamp())).unwrap();

        let report = ExecutionReport::for_units(vec![
            UnitOutcome {
                version: batch.units[0].version_link(),
                owner: batch.units[0].owner_link(),
                sequence: Outcome::Succeeded,
                preview: Outcome::Failed { error: "render".into() },
                extras: vec![],
            },
            UnitOutcome {
                version: batch.units[1].version_link(),
                owner: batch.units[1].owner_link(),
                sequence: Outcome::NotAttempted,
                preview: Outcome::Succeeded,
                extras: vec![],
            },
        ]);

        let rows = delivered_rows(&batch, &report, &batch.folders[0]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[1], "010_Comp_v000.%04d.exr");
        assert_eq!(rows[1].values[1], "020_Comp_v005.mov");
    }
}
