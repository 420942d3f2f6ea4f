//! Template System - Path Naming Contracts
//!
//! A path template is literal text with `{key}` references. Resolution is
//! pure string formatting: the same fields always produce the same path.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;

use crate::entity::{get_field, render_value, Fields};

pub type TemplateName = String;

/// Marker in a required-field list accepting additional fields
pub const ANY_FIELD: &str = "*";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    UnknownTemplate(String),

    #[error("Template \"{template}\" is missing required field \"{field}\"")]
    MissingField { template: String, field: String },

    #[error("Invalid value for field \"{field}\": {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid template definition \"{0}\": {1}")]
    InvalidDefinition(String, String),
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum KeyKind {
    #[default]
    Str,
    Int {
        /// Zero padding width, `"03"` style
        format: Option<String>,
    },
    Date {
        format: String,
    },
    Sequence {
        format: String,
    },
}

fn default_date_format() -> String { "%Y%m%d".to_string() }
fn default_frame_padding() -> String { "04".to_string() }

/// Declared key type plus where its value comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawTemplateKey")]
pub struct TemplateKey {
    #[serde(flatten)]
    pub kind: KeyKind,
    #[serde(default)]
    pub default: Option<Value>,
    /// `project.sg_short_name` style source for the planner
    #[serde(default)]
    pub entity_field: Option<String>,
}

/// Key as written in configuration. `type` is optional and defaults to `str`.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTemplateKey {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    entity_field: Option<String>,
}

impl TryFrom<RawTemplateKey> for TemplateKey {
    type Error = String;

    fn try_from(raw: RawTemplateKey) -> Result<Self, Self::Error> {
        let kind = match raw.kind.as_deref().unwrap_or("str") {
            "str" => KeyKind::Str,
            "int" => KeyKind::Int { format: raw.format },
            "date" => KeyKind::Date { format: raw.format.unwrap_or_else(default_date_format) },
            "sequence" => KeyKind::Sequence { format: raw.format.unwrap_or_else(default_frame_padding) },
            other => return Err(format!("unknown key type \"{}\"", other)),
        };
        Ok(Self { kind, default: raw.default, entity_field: raw.entity_field })
    }
}

impl TemplateKey {
    fn width(format: &Option<String>) -> usize {
        format.as_deref().and_then(|f| f.parse().ok()).unwrap_or(0)
    }

    /// A sequence key with no frame renders the printf frame pattern
    fn fallback(&self) -> Option<String> {
        match &self.kind {
            KeyKind::Sequence { format } => Some(format!("%{}d", format)),
            _ => None,
        }
    }

    pub fn render(&self, name: &str, value: &Value) -> Result<String, TemplateError> {
        let invalid = |reason: &str| TemplateError::InvalidValue {
            field: name.to_string(),
            reason: reason.to_string(),
        };

        match &self.kind {
            KeyKind::Str => render_value(value).ok_or_else(|| invalid("empty value")),
            KeyKind::Int { format } => {
                let number = as_integer(value).ok_or_else(|| invalid("expected an integer"))?;
                Ok(format!("{:0width$}", number, width = Self::width(format)))
            }
            KeyKind::Date { format } => {
                let text = render_value(value).ok_or_else(|| invalid("empty date"))?;
                let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map_err(|_| invalid("expected an ISO date"))?;
                Ok(date.format(format).to_string())
            }
            KeyKind::Sequence { format } => match as_integer(value) {
                Some(frame) => {
                    let width = format.parse::<usize>().unwrap_or(0);
                    Ok(format!("{:0width$}", frame, width = width))
                }
                None => Ok(format!("%{}d", format)),
            },
        }
    }

    /// Inverse of `render`, `None` when `text` cannot be this key
    pub fn parse(&self, text: &str) -> Option<Value> {
        if text.is_empty() || text.contains('/') {
            return None;
        }
        match &self.kind {
            KeyKind::Str => Some(Value::from(text)),
            KeyKind::Int { .. } | KeyKind::Sequence { .. } => {
                if !text.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                text.parse::<u64>().ok().map(Value::from)
            }
            KeyKind::Date { format } => NaiveDate::parse_from_str(text, format)
                .ok()
                .map(|d| Value::from(d.format("%Y-%m-%d").to_string())),
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim_start_matches('v').parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Key(String),
}

fn parse_definition(name: &str, definition: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = vec![];
    let mut literal = String::new();
    let mut chars = definition.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '{' => {
                let rest = &definition[idx + 1..];
                let close = rest.find('}').ok_or_else(|| {
                    TemplateError::InvalidDefinition(name.to_string(), "unclosed '{'".to_string())
                })?;
                let key = &rest[..close];
                if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(TemplateError::InvalidDefinition(
                        name.to_string(),
                        format!("invalid key \"{}\"", key),
                    ));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Key(key.to_string()));
                while let Some(&(i, _)) = chars.peek() {
                    if i > idx + close + 1 {
                        break;
                    }
                    chars.next();
                }
            }
            '}' => {
                return Err(TemplateError::InvalidDefinition(name.to_string(), "stray '}'".to_string()));
            }
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Template declaration as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateDefinition {
    pub definition: String,
    #[serde(default)]
    pub required: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    pub name: TemplateName,
    pub definition: String,
    required: Vec<String>,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn new(name: &str, definition: &str) -> Result<Self, TemplateError> {
        let segments = parse_definition(name, definition)?;
        let mut required = vec![];
        for segment in &segments {
            if let Segment::Key(key) = segment {
                if !required.contains(key) {
                    required.push(key.clone());
                }
            }
        }
        required.push(ANY_FIELD.to_string());
        Ok(Self { name: name.to_string(), definition: definition.to_string(), required, segments })
    }

    pub fn from_definition(name: &str, def: &TemplateDefinition) -> Result<Self, TemplateError> {
        let mut template = Self::new(name, &def.definition)?;
        if let Some(required) = &def.required {
            for key in template.keys() {
                if !required.contains(&key.to_string()) && !required.iter().any(|r| r == ANY_FIELD) {
                    return Err(TemplateError::InvalidDefinition(
                        name.to_string(),
                        format!("key \"{}\" is not declared as required", key),
                    ));
                }
            }
            template.required = required.clone();
        }
        Ok(template)
    }

    /// Keys referenced by the definition, in order of first appearance
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = vec![];
        for segment in &self.segments {
            if let Segment::Key(key) = segment {
                if !keys.contains(&key.as_str()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    pub fn accepts_additional(&self) -> bool {
        self.required.iter().any(|r| r == ANY_FIELD)
    }

    pub fn render(&self, fields: &Fields, keys: &HashMap<String, TemplateKey>) -> Result<String, TemplateError> {
        let default_key = TemplateKey::default();
        let lookup = |field: &str| -> Option<Value> {
            get_field(fields, field)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| keys.get(field).and_then(|k| k.default.clone()))
        };

        for field in self.required.iter().filter(|f| f.as_str() != ANY_FIELD) {
            let key = keys.get(field).unwrap_or(&default_key);
            if lookup(field).is_none() && key.fallback().is_none() {
                return Err(TemplateError::MissingField {
                    template: self.name.clone(),
                    field: field.clone(),
                });
            }
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Key(name) => {
                    let key = keys.get(name).unwrap_or(&default_key);
                    match lookup(name) {
                        Some(value) => out.push_str(&key.render(name, &value)?),
                        None => match key.fallback() {
                            Some(pattern) => out.push_str(&pattern),
                            None => {
                                return Err(TemplateError::MissingField {
                                    template: self.name.clone(),
                                    field: name.clone(),
                                })
                            }
                        },
                    }
                }
            }
        }
        Ok(out)
    }

    /// Template covering every path component but the last
    pub fn parent(&self) -> Option<PathTemplate> {
        let cut = self.definition.rfind('/')?;
        PathTemplate::new(&format!("{}:parent", self.name), &self.definition[..cut]).ok()
    }

    /// Template for the last path component alone
    pub fn leaf(&self) -> PathTemplate {
        let start = self.definition.rfind('/').map(|i| i + 1).unwrap_or(0);
        PathTemplate::new(&format!("{}:leaf", self.name), &self.definition[start..])
            .unwrap_or_else(|_| self.clone())
    }

    /// Read field values back out of a rendered path
    pub fn extract(&self, text: &str, keys: &HashMap<String, TemplateKey>) -> Option<Fields> {
        let mut fields = Fields::new();
        if match_segments(&self.segments, text, keys, &mut fields) {
            Some(fields)
        } else {
            None
        }
    }
}

fn match_segments(
    segments: &[Segment],
    text: &str,
    keys: &HashMap<String, TemplateKey>,
    fields: &mut Fields,
) -> bool {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return text.is_empty(),
    };

    match first {
        Segment::Literal(literal) => match text.strip_prefix(literal.as_str()) {
            Some(remaining) => match_segments(rest, remaining, keys, fields),
            None => false,
        },
        Segment::Key(name) => {
            let default_key = TemplateKey::default();
            let key = keys.get(name).unwrap_or(&default_key);
            let boundaries: Vec<usize> = text
                .char_indices()
                .map(|(i, _)| i)
                .skip(1)
                .chain(std::iter::once(text.len()))
                .collect();

            for end in boundaries {
                let candidate = &text[..end];
                let value = match key.parse(candidate) {
                    Some(value) => value,
                    None => continue,
                };
                if let Some(previous) = fields.get(name) {
                    if previous != &value {
                        continue;
                    }
                }
                let mut attempt = fields.clone();
                attempt.insert(name.clone(), value);
                if match_segments(rest, &text[end..], keys, &mut attempt) {
                    *fields = attempt;
                    return true;
                }
            }
            false
        }
    }
}

/// Template registry - named path templates and their key declarations
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<TemplateName, PathTemplate>,
    keys: HashMap<String, TemplateKey>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self { templates: HashMap::new(), keys: HashMap::new() }
    }

    pub fn from_config(
        paths: &BTreeMap<String, TemplateDefinition>,
        keys: &BTreeMap<String, TemplateKey>,
    ) -> Result<Self, TemplateError> {
        let mut registry = Self::new();
        for (name, key) in keys {
            registry.register_key(name, key.clone());
        }
        for (name, def) in paths {
            registry.register(PathTemplate::from_definition(name, def)?);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&PathTemplate> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn list(&self) -> Vec<&PathTemplate> {
        let mut templates: Vec<_> = self.templates.values().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    pub fn register(&mut self, template: PathTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn register_key(&mut self, name: &str, key: TemplateKey) {
        self.keys.insert(name.to_string(), key);
    }

    pub fn keys(&self) -> &HashMap<String, TemplateKey> {
        &self.keys
    }

    /// Keys that declare an entity field source, sorted by name
    pub fn entity_sourced_keys(&self) -> Vec<(&str, &str)> {
        let mut sourced: Vec<(&str, &str)> = self
            .keys
            .iter()
            .filter_map(|(name, key)| key.entity_field.as_deref().map(|f| (name.as_str(), f)))
            .collect();
        sourced.sort();
        sourced
    }

    pub fn resolve(&self, name: &str, fields: &Fields) -> Result<PathBuf, TemplateError> {
        let template = self
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;
        Ok(PathBuf::from(template.render(fields, &self.keys)?))
    }

    pub fn extract(&self, template: &PathTemplate, text: &str) -> Option<Fields> {
        template.extract(text, &self.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        registry.register_key("delivery_version", TemplateKey {
            kind: KeyKind::Int { format: Some("03".into()) },
            ..Default::default()
        });
        registry.register_key("delivery_date", TemplateKey {
            kind: KeyKind::Date { format: "%Y%m%d".into() },
            ..Default::default()
        });
        registry.register_key("SEQ", TemplateKey {
            kind: KeyKind::Sequence { format: "04".into() },
            ..Default::default()
        });
        registry.register(PathTemplate::new("delivery_folder", "{delivery_date}_{prj}_v{delivery_version}").unwrap());
        registry.register(
            PathTemplate::new(
                "delivery_shot_sequence",
                "{delivery_date}_{prj}_v{delivery_version}/{Shot}/{prj}_{Shot}_{task_name}_v{version}.{SEQ}.exr",
            )
            .unwrap(),
        );
        registry
    }

    fn fields() -> Fields {
        [
            ("prj", json!("ABC")),
            ("Shot", json!("010")),
            ("task_name", json!("Comp")),
            ("version", json!(3)),
            ("delivery_version", json!(2)),
            ("delivery_date", json!("2024-03-09")),
            ("unused", json!("ignored")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_resolve_typed_keys() {
        let path = registry().resolve("delivery_shot_sequence", &fields()).unwrap();
        assert_eq!(
            path,
            PathBuf::from("20240309_ABC_v002/010/ABC_010_Comp_v3.%04d.exr")
        );
    }

    #[test]
    fn test_missing_field_is_named() {
        let mut f = fields();
        f.remove("task_name");
        let err = registry().resolve("delivery_shot_sequence", &f).unwrap_err();
        assert_eq!(err, TemplateError::MissingField {
            template: "delivery_shot_sequence".into(),
            field: "task_name".into(),
        });
    }

    #[test]
    fn test_declared_required_fields_are_checked() {
        let def = TemplateDefinition {
            definition: "{prj}/{Shot}".into(),
            required: Some(vec!["context".into(), "prj".into(), "Shot".into(), "*".into()]),
        };
        let template = PathTemplate::from_definition("t", &def).unwrap();
        let err = template.render(&fields(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingField { field, .. } if field == "context"));
    }

    #[test]
    fn test_unknown_template() {
        assert!(matches!(
            registry().resolve("nope", &fields()),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(PathTemplate::new("t", "{prj").is_err());
        assert!(PathTemplate::new("t", "prj}").is_err());
        assert!(PathTemplate::new("t", "{p r j}").is_err());
    }

    #[test]
    fn test_extract_inverts_render() {
        let registry = registry();
        let template = registry.get("delivery_folder").unwrap();
        let extracted = registry.extract(template, "20240309_ABC_v007").unwrap();
        assert_eq!(extracted["delivery_version"], json!(7));
        assert_eq!(extracted["delivery_date"], json!("2024-03-09"));
        assert_eq!(extracted["prj"], json!("ABC"));
        assert!(registry.extract(template, "notes").is_none());
        assert!(registry.extract(template, "20240309_ABC_vXYZ").is_none());
    }

    #[test]
    fn test_key_type_defaults_to_str() {
        let key: TemplateKey = serde_json::from_value(json!({"entity_field": "project.sg_short_name"})).unwrap();
        assert_eq!(key.kind, KeyKind::Str);
        assert_eq!(key.entity_field.as_deref(), Some("project.sg_short_name"));

        let key: TemplateKey = serde_json::from_value(json!({"type": "sequence"})).unwrap();
        assert_eq!(key.kind, KeyKind::Sequence { format: "04".into() });
        let key: TemplateKey = serde_json::from_value(json!({"type": "int", "format": "03"})).unwrap();
        assert_eq!(key.kind, KeyKind::Int { format: Some("03".into()) });

        assert!(serde_json::from_value::<TemplateKey>(json!({"type": "float"})).is_err());
        assert!(serde_json::from_value::<TemplateKey>(json!({"type": "str", "padding": 3})).is_err());
    }

    #[test]
    fn test_parent_and_leaf() {
        let template = PathTemplate::new("d", "{Episode}/{delivery_date}_v{delivery_version}").unwrap();
        assert_eq!(template.parent().unwrap().definition, "{Episode}");
        assert_eq!(template.leaf().definition, "{delivery_date}_v{delivery_version}");
        assert!(PathTemplate::new("d", "{prj}_v{delivery_version}").unwrap().parent().is_none());
    }
}
