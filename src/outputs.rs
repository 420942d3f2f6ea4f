//! Output Profile Matcher
//!
//! Sequence profiles are keyed by a status value and at most one applies.
//! Preview profiles are switched on or off and every enabled one applies.
//! The two policies are deliberately separate functions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::entity::{get_field, render_value, Fields};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputProfile {
    #[serde(default)]
    pub name: String,
    pub extension: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Match value for sequence profiles
    #[serde(default, alias = "match_value")]
    pub status: Option<String>,
    #[serde(default = "default_enabled", alias = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool { true }

impl OutputProfile {
    pub fn new(name: &str, extension: &str) -> Self {
        Self {
            name: name.to_string(),
            extension: extension.to_string(),
            settings: Map::new(),
            status: None,
            enabled: true,
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Settings handed to the renderer's writer
    pub fn writer_settings(&self) -> Map<String, Value> {
        let mut settings = self.settings.clone();
        settings.insert("file_type".to_string(), Value::from(self.extension.clone()));
        settings
    }

    /// Codec of an image sequence output
    pub fn sequence_codec(&self) -> Option<String> {
        self.settings.get("compression").and_then(render_value)
    }

    pub fn sequence_bit_depth(&self) -> Option<String> {
        ["bit_depth", "data_type", "datatype"]
            .iter()
            .find_map(|key| self.settings.get(*key).and_then(render_value))
    }

    pub fn preview_codec(&self) -> Option<String> {
        ["codec", "mov64_codec"]
            .iter()
            .find_map(|key| self.settings.get(*key).and_then(render_value))
    }

    /// First `NN-bit` mention across string settings, e.g. `"10-bit"`
    pub fn preview_bit_depth(&self) -> Option<String> {
        self.settings
            .values()
            .filter_map(Value::as_str)
            .find_map(find_bit_depth)
    }
}

/// Digits directly followed by `bit`, `-bit` or ` bit`
fn find_bit_depth(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let bytes = lower.as_bytes();
    let mut start = 0;

    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let mut rest = end;
        while rest < bytes.len() && bytes[rest] == b' ' {
            rest += 1;
        }
        if rest < bytes.len() && bytes[rest] == b'-' {
            rest += 1;
        }
        if lower[rest..].starts_with("bit") {
            return Some(format!("{}-bit", &lower[start..end]));
        }
        start = end;
    }
    None
}

/// First sequence profile whose status equals the version's match field
pub fn match_sequence<'a>(
    version_fields: &Fields,
    match_field: &str,
    profiles: &'a [OutputProfile],
) -> Option<&'a OutputProfile> {
    let value = get_field(version_fields, match_field).and_then(render_value)?;
    let found = profiles
        .iter()
        .find(|profile| profile.status.as_deref() == Some(value.as_str()));
    if found.is_none() {
        debug!("No sequence output configured for \"{}\"", value);
    }
    found
}

/// Every enabled preview profile, in declared order
pub fn match_previews(profiles: &[OutputProfile]) -> Vec<&OutputProfile> {
    profiles.iter().filter(|profile| profile.enabled).collect()
}

/// Status values claimed by more than one sequence profile
pub fn duplicate_statuses(profiles: &[OutputProfile]) -> Vec<String> {
    let mut seen: Vec<&str> = vec![];
    let mut duplicates = vec![];
    for status in profiles.iter().filter_map(|p| p.status.as_deref()) {
        if seen.contains(&status) {
            if !duplicates.iter().any(|d| d == status) {
                duplicates.push(status.to_string());
            }
        } else {
            seen.push(status);
        }
    }
    duplicates
}

/// Encoding of the published source frames, when known
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceEncoding {
    pub extension: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub has_alpha: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Frames already match the profile, link or copy them as they are
    LinkOrCopy,
    Transcode,
}

/// Decide whether source frames can be shipped untouched
pub fn choose_transfer(
    profile: &OutputProfile,
    source: Option<&SourceEncoding>,
    remove_alpha: bool,
) -> TransferMode {
    let source = match source {
        Some(source) => source,
        None => return TransferMode::Transcode,
    };
    if !source.extension.eq_ignore_ascii_case(&profile.extension) {
        return TransferMode::Transcode;
    }
    if remove_alpha && source.has_alpha {
        return TransferMode::Transcode;
    }
    let matches = profile
        .settings
        .iter()
        .all(|(key, value)| source.settings.get(key) == Some(value));
    if matches {
        TransferMode::LinkOrCopy
    } else {
        TransferMode::Transcode
    }
}
