//! Delivery Configuration
//!
//! One JSON document declares templates, output profiles, overrides, status
//! names and text fields. Everything is checked when the document loads so
//! that a bad configuration never reaches the planner.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::entity::{EntityType, Fields};
use crate::expression::{Expression, ExpressionError};
use crate::formats::FootageFormatFields;
use crate::outputs::{duplicate_statuses, OutputProfile};
use crate::overrides::VersionOverride;
use crate::templates::{TemplateDefinition, TemplateError, TemplateKey, TemplateRegistry};
use crate::validation::FailureMode;
use crate::ENGINE_VERSION;

pub const MAX_SLATE_EXTRA_FIELDS: usize = 6;

/// Templates every configuration must declare
pub const REQUIRED_TEMPLATES: &[&str] = &[
    "delivery_folder",
    "delivery_shot_sequence",
    "delivery_shot_preview",
    "delivery_asset_sequence",
    "delivery_asset_preview",
    "csv_submission_form",
];

/// Fixed tracking field names read for every unit
pub mod tracking_fields {
    pub const CODE: &str = "code";
    pub const ENTITY: &str = "entity";
    pub const TASK: &str = "sg_task";
    pub const FIRST_FRAME: &str = "sg_first_frame";
    pub const LAST_FRAME: &str = "sg_last_frame";
    pub const FRAME_RATE: &str = "sg_uploaded_movie_frame_rate";
    pub const PATH_TO_MOVIE: &str = "sg_path_to_movie";
    pub const FRAMES_HAVE_SLATE: &str = "sg_frames_have_slate";
    pub const MOVIE_HAS_SLATE: &str = "sg_movie_has_slate";
    pub const PUBLISHED_FILES: &str = "published_files";
    pub const PUBLISHED_PATH: &str = "path.local_path";
    pub const PUBLISHED_VERSION_NUMBER: &str = "version_number";
    pub const SEQUENCE: &str = "sg_sequence";
    pub const SHORT_NAME: &str = "sg_short_name";
    pub const VENDOR_ID: &str = "sg_vendorid";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration requires engine >= {required}, current is {current}")]
    EngineVersionMismatch { required: String, current: String },

    #[error("Invalid engine version requirement: {0}")]
    InvalidEngineVersion(String),

    #[error("At most {max} slate extra fields are supported, got {count}")]
    TooManySlateFields { count: usize, max: usize },

    #[error("Sequence output status \"{0}\" is declared more than once")]
    DuplicateSequenceStatus(String),

    #[error("Sequence output \"{0}\" has no status to match")]
    MissingMatchValue(String),

    #[error("Malformed version override #{index}: {reason}")]
    MalformedOverride { index: usize, reason: String },

    #[error("Invalid expression for \"{name}\": {source}")]
    InvalidExpression {
        name: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Missing template: {0}")]
    MissingTemplate(String),

    #[error(transparent)]
    InvalidTemplate(#[from] TemplateError),
}

/// A named text field, kept in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedExpression {
    pub name: String,
    pub text: String,
}

impl NamedExpression {
    pub fn new(name: &str, text: &str) -> Self {
        Self { name: name.to_string(), text: text.to_string() }
    }

    pub fn expression(&self) -> Expression {
        Expression::parse(&self.text)
    }
}

/// (De)serializes `Vec<NamedExpression>` as a JSON object without losing
/// the declared column order.
mod ordered {
    use super::*;

    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<NamedExpression>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of field names to expression text")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, value)) = map.next_entry::<String, Value>()? {
                let text = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(de::Error::custom(format!(
                            "value of \"{}\" must be text, got {}",
                            name, other
                        )))
                    }
                };
                out.push(NamedExpression { name, text });
            }
            Ok(out)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NamedExpression>, D::Error> {
        d.deserialize_map(OrderedVisitor)
    }

    pub fn serialize<S: Serializer>(fields: &[NamedExpression], s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(fields.len()))?;
        for field in fields {
            map.serialize_entry(&field.name, &field.text)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default)]
    pub paths: BTreeMap<String, TemplateDefinition>,
    #[serde(default)]
    pub keys: BTreeMap<String, TemplateKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_engine_min_version")]
    pub engine_min_version: String,

    // Field names
    #[serde(default = "default_status_field")]
    pub shot_status_field: String,
    #[serde(default = "default_status_field")]
    pub version_status_field: String,
    #[serde(default = "default_show_name_field")]
    pub show_name_field: String,
    #[serde(default = "default_scope_of_work_field")]
    pub vfx_scope_of_work_field: String,
    #[serde(default = "default_submitting_for_field")]
    pub submitting_for_field: String,
    #[serde(default = "default_submission_note_field")]
    pub submission_note_field: String,
    #[serde(default = "default_short_submission_note_field")]
    pub short_submission_note_field: String,
    #[serde(default = "default_attachment_field")]
    pub attachment_field: String,
    #[serde(default = "default_sequence_outputs_field")]
    pub delivery_sequence_outputs_field: String,
    /// Shot field path holding the episode code
    #[serde(default)]
    pub episode_field: Option<String>,
    /// PublishedFile field describing the source frames' encoding
    #[serde(default)]
    pub source_encoding_field: Option<String>,
    /// Shot/Asset field holding the linked footage format records
    #[serde(default)]
    pub footage_formats_field: Option<String>,
    #[serde(default)]
    pub footage_format_fields: FootageFormatFields,

    // Statuses
    pub shot_delivery_status: String,
    pub version_delivery_status: String,
    pub version_delivered_status: String,
    pub version_preview_delivered_status: String,
    pub shot_delivered_status: String,
    #[serde(default)]
    pub asset_status_field: Option<String>,
    #[serde(default)]
    pub asset_delivery_status: Option<String>,

    #[serde(default)]
    pub preview_colorspace_idt: Option<String>,
    #[serde(default)]
    pub preview_colorspace_odt: Option<String>,
    #[serde(default)]
    pub sequence_colorspace: Option<String>,

    // Flags
    #[serde(default)]
    pub add_slate_to_sequence: bool,
    #[serde(default)]
    pub override_preview_submission_note: bool,
    #[serde(default)]
    pub continuous_versioning: bool,
    #[serde(default = "default_true")]
    pub remove_alpha_from_sequence: bool,

    #[serde(default, alias = "delivery_sequence_outputs")]
    pub sequence_outputs: Vec<OutputProfile>,
    #[serde(default, alias = "delivery_preview_outputs")]
    pub preview_outputs: Vec<OutputProfile>,
    #[serde(default)]
    pub version_overrides: Vec<VersionOverride>,

    #[serde(default, with = "ordered")]
    pub default_csv: Vec<NamedExpression>,
    #[serde(default, with = "ordered")]
    pub slate_extra_fields: Vec<NamedExpression>,

    #[serde(default)]
    pub templates: TemplatesConfig,
    /// Literal template fields shared by every unit
    #[serde(default)]
    pub base_fields: Fields,
    #[serde(default)]
    pub delivery_root: PathBuf,
    #[serde(default)]
    pub validation_failure_mode: FailureMode,
}

fn default_engine_min_version() -> String { "1.0.0".to_string() }
fn default_status_field() -> String { "sg_status_list".to_string() }
fn default_show_name_field() -> String { "name".to_string() }
fn default_scope_of_work_field() -> String { "sg_vfx_scope_of_work".to_string() }
fn default_submitting_for_field() -> String { "sg_submitting_for".to_string() }
fn default_submission_note_field() -> String { "sg_submission_notes".to_string() }
fn default_short_submission_note_field() -> String { "sg_short_submission_note".to_string() }
fn default_attachment_field() -> String { "sg_attachment".to_string() }
fn default_sequence_outputs_field() -> String { "sg_delivery_sequence_outputs".to_string() }
fn default_true() -> bool { true }

impl DeliveryConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading delivery configuration from {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> Result<Self, ConfigError> {
        let raw_overrides = value
            .as_object_mut()
            .and_then(|obj| obj.remove("version_overrides"))
            .unwrap_or(Value::Array(vec![]));
        let version_overrides = parse_overrides(raw_overrides)?;

        let mut config: DeliveryConfig = serde_json::from_value(value)?;
        config.version_overrides = version_overrides;
        config.validate()?;
        Ok(config)
    }

    /// Load-time checks. Any failure here is fatal before planning starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_engine_version()?;

        if self.slate_extra_fields.len() > MAX_SLATE_EXTRA_FIELDS {
            return Err(ConfigError::TooManySlateFields {
                count: self.slate_extra_fields.len(),
                max: MAX_SLATE_EXTRA_FIELDS,
            });
        }

        for profile in &self.sequence_outputs {
            if profile.status.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingMatchValue(profile.name.clone()));
            }
        }
        if let Some(status) = duplicate_statuses(&self.sequence_outputs).into_iter().next() {
            return Err(ConfigError::DuplicateSequenceStatus(status));
        }

        for (index, rule) in self.version_overrides.iter().enumerate() {
            rule.validate()
                .map_err(|e| ConfigError::MalformedOverride { index, reason: e.to_string() })?;
        }

        for field in self.default_csv.iter().chain(&self.slate_extra_fields) {
            field.expression().validate().map_err(|source| ConfigError::InvalidExpression {
                name: field.name.clone(),
                source,
            })?;
        }

        let registry = self.template_registry()?;
        for name in REQUIRED_TEMPLATES {
            if !registry.contains(name) {
                return Err(ConfigError::MissingTemplate(name.to_string()));
            }
        }

        debug!(
            "Configuration valid: {} sequence outputs, {} preview outputs, {} overrides, {} csv columns",
            self.sequence_outputs.len(),
            self.preview_outputs.len(),
            self.version_overrides.len(),
            self.default_csv.len()
        );
        Ok(())
    }

    fn check_engine_version(&self) -> Result<(), ConfigError> {
        let engine = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| ConfigError::InvalidEngineVersion(ENGINE_VERSION.to_string()))?;
        let required = semver::Version::parse(&self.engine_min_version)
            .map_err(|_| ConfigError::InvalidEngineVersion(self.engine_min_version.clone()))?;

        if engine < required {
            return Err(ConfigError::EngineVersionMismatch {
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            });
        }
        Ok(())
    }

    pub fn template_registry(&self) -> Result<TemplateRegistry, ConfigError> {
        Ok(TemplateRegistry::from_config(&self.templates.paths, &self.templates.keys)?)
    }

    /// Status field used for asset sequence readiness, when configured
    pub fn asset_readiness(&self) -> Option<(&str, &str)> {
        match (&self.asset_status_field, &self.asset_delivery_status) {
            (Some(field), Some(status)) => Some((field.as_str(), status.as_str())),
            _ => None,
        }
    }

    /// Field projection to fetch for an entity type.
    ///
    /// Covers the fixed tracking fields, configured field names and every
    /// field referenced by a text field or template key.
    pub fn required_fields(&self, entity_type: EntityType) -> Vec<String> {
        use tracking_fields::*;

        let mut fields: Vec<String> = match entity_type {
            EntityType::Project => vec![
                "name".into(),
                SHORT_NAME.into(),
                VENDOR_ID.into(),
                self.show_name_field.clone(),
            ],
            EntityType::Shot => {
                let mut fields = vec![
                    CODE.to_string(),
                    "description".into(),
                    SEQUENCE.into(),
                    self.shot_status_field.clone(),
                    self.vfx_scope_of_work_field.clone(),
                ];
                fields.extend(self.episode_field.clone());
                fields.extend(self.footage_formats_field.clone());
                fields
            }
            EntityType::Asset => {
                let mut fields = vec![
                    CODE.to_string(),
                    "description".into(),
                    self.vfx_scope_of_work_field.clone(),
                ];
                fields.extend(self.asset_status_field.clone());
                fields.extend(self.footage_formats_field.clone());
                fields
            }
            EntityType::Version => vec![
                CODE.into(),
                ENTITY.into(),
                TASK.into(),
                FIRST_FRAME.into(),
                LAST_FRAME.into(),
                FRAME_RATE.into(),
                PATH_TO_MOVIE.into(),
                FRAMES_HAVE_SLATE.into(),
                MOVIE_HAS_SLATE.into(),
                PUBLISHED_FILES.into(),
                self.version_status_field.clone(),
                self.submitting_for_field.clone(),
                self.submission_note_field.clone(),
                self.short_submission_note_field.clone(),
                self.attachment_field.clone(),
                self.delivery_sequence_outputs_field.clone(),
            ],
            EntityType::PublishedFile => {
                let mut fields = vec!["path".to_string(), PUBLISHED_VERSION_NUMBER.into(), "task".into()];
                fields.extend(self.source_encoding_field.clone());
                fields
            }
        };

        let namespace = match entity_type {
            EntityType::Project => Some("project"),
            EntityType::Shot | EntityType::Asset => Some("shot"),
            EntityType::Version => Some("version"),
            EntityType::PublishedFile => Some("published_file"),
        };
        if let Some(namespace) = namespace {
            for field in self.default_csv.iter().chain(&self.slate_extra_fields) {
                for (ns, path) in field.expression().entity_refs() {
                    if ns == namespace {
                        fields.push(path);
                    }
                }
            }
            for key in self.templates.keys.values() {
                if let Some((ns, path)) = key.entity_field.as_deref().and_then(|f| f.split_once('.')) {
                    if ns == namespace {
                        fields.push(path.to_string());
                    }
                }
            }
        }

        let mut seen = vec![];
        fields.retain(|f| {
            let keep = !f.is_empty() && !seen.contains(f);
            if keep {
                seen.push(f.clone());
            }
            keep
        });
        fields
    }

    /// True when a CSV column references the Version attachment field
    pub fn csv_uses_attachment(&self) -> bool {
        self.default_csv.iter().any(|column| {
            column
                .expression()
                .entity_refs()
                .iter()
                .any(|(ns, field)| ns == "version" && field == &self.attachment_field)
        })
    }
}

fn parse_overrides(raw: Value) -> Result<Vec<VersionOverride>, ConfigError> {
    let items = match raw {
        Value::Array(items) => items,
        Value::Null => return Ok(vec![]),
        other => {
            return Err(ConfigError::MalformedOverride {
                index: 0,
                reason: format!("expected a list of overrides, got {}", other),
            })
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item)
                .map_err(|e| ConfigError::MalformedOverride { index, reason: e.to_string() })
        })
        .collect()
}
