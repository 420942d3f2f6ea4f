//! Version Resolver
//!
//! The delivery folder tree is the only version counter. Resolution is a pure
//! function over a snapshot of folder names; listing the folders is the one
//! read-only I/O step. Listing and creating the next folder is a critical
//! section the host must serialize across concurrent runs.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::entity::render_value;
use crate::templates::TemplateRegistry;
use crate::templates::PathTemplate;

pub const VERSION_PREFIX: &str = "v";
pub const VERSION_WIDTH: usize = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("Delivery folder \"{0}\" holds the highest possible version number")]
    Overflow(String),
}

/// An existing delivery folder, parsed from its name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryFolder {
    pub name: String,
    /// `None` when the folder template carries no date
    pub date: Option<NaiveDate>,
    pub version: u32,
}

impl DeliveryFolder {
    pub fn new(name: &str, date: Option<NaiveDate>, version: u32) -> Self {
        Self { name: name.to_string(), date, version }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VersionSource {
    /// Next free number from the folder tree
    Resolved,
    /// Operator-supplied tag, used verbatim
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryVersion {
    pub tag: String,
    pub number: Option<u32>,
    pub source: VersionSource,
}

impl DeliveryVersion {
    pub fn resolved(number: u32) -> Self {
        Self { tag: format_tag(number), number: Some(number), source: VersionSource::Resolved }
    }

    pub fn manual(tag: &str) -> Self {
        Self { tag: tag.to_string(), number: parse_tag(tag), source: VersionSource::Manual }
    }

    pub fn is_manual(&self) -> bool {
        self.source == VersionSource::Manual
    }
}

/// `3` -> `v003`
pub fn format_tag(number: u32) -> String {
    format!("{}{:0width$}", VERSION_PREFIX, number, width = VERSION_WIDTH)
}

/// Accepts `v003`, `003` and `3`
pub fn parse_tag(tag: &str) -> Option<u32> {
    let digits = tag.strip_prefix(VERSION_PREFIX).unwrap_or(tag);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Next delivery version for a batch.
///
/// A manual override wins without any collision check. Otherwise the highest
/// existing version is bumped, counting only folders of `batch_date` unless
/// versioning is continuous. Undated folders count in both modes.
pub fn resolve_version(
    batch_date: NaiveDate,
    existing: &[DeliveryFolder],
    continuous: bool,
    manual_override: Option<&str>,
) -> Result<DeliveryVersion, VersionError> {
    if let Some(tag) = manual_override {
        debug!("Using manual delivery version {}", tag);
        return Ok(DeliveryVersion::manual(tag));
    }

    let highest = existing
        .iter()
        .filter(|folder| continuous || folder.date.map_or(true, |date| date == batch_date))
        .max_by_key(|folder| folder.version);

    debug!(
        "Highest existing delivery version is {} ({} mode)",
        highest.map_or(0, |folder| folder.version),
        if continuous { "continuous" } else { "date" }
    );
    match highest {
        Some(folder) => folder
            .version
            .checked_add(1)
            .map(DeliveryVersion::resolved)
            .ok_or_else(|| VersionError::Overflow(folder.name.clone())),
        None => Ok(DeliveryVersion::resolved(1)),
    }
}

/// Parse listed folder names with the delivery folder's last path component.
/// Names that do not parse are skipped, and so are names carrying an
/// `Episode` other than `episode`.
pub fn parse_delivery_folders(
    names: &[String],
    template: &PathTemplate,
    registry: &TemplateRegistry,
    episode: Option<&str>,
) -> Vec<DeliveryFolder> {
    let leaf = template.leaf();
    let mut folders = vec![];

    for name in names {
        let fields = match registry.extract(&leaf, name) {
            Some(fields) => fields,
            None => {
                debug!("Skipping folder \"{}\": does not match {}", name, leaf.definition);
                continue;
            }
        };
        let folder_episode = fields.get("Episode").and_then(render_value);
        if let (Some(episode), Some(other)) = (episode, folder_episode.as_deref()) {
            if episode != other {
                debug!("Skipping folder \"{}\": belongs to episode {}", name, other);
                continue;
            }
        }
        let version = match fields
            .get("delivery_version")
            .and_then(render_value)
            .and_then(|v| parse_tag(&v))
        {
            Some(version) => version,
            None => {
                debug!("Skipping folder \"{}\": no delivery version", name);
                continue;
            }
        };
        let date = fields
            .get("delivery_date")
            .and_then(render_value)
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

        folders.push(DeliveryFolder::new(name, date, version));
    }

    folders
}

/// Names of the directories under `dir`, sorted. A missing directory has none.
pub fn list_folder_names(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Raised when a manual version or destination lands on delivered files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverwriteRisk {
    pub folder: String,
    pub reason: String,
}

pub fn check_overwrite(
    folder_name: &str,
    existing_names: &[String],
    version: &DeliveryVersion,
    manual_destination: bool,
) -> Option<OverwriteRisk> {
    if !version.is_manual() && !manual_destination {
        return None;
    }
    if !existing_names.iter().any(|n| n == folder_name) {
        return None;
    }
    let reason = if version.is_manual() {
        format!("manual version {} already delivered", version.tag)
    } else {
        "manual destination already holds this delivery".to_string()
    };
    Some(OverwriteRisk { folder: folder_name.to_string(), reason })
}
