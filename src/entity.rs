//! Entity Model - Read-only Tracking Snapshots
//!
//! Entities are fetched once per planning run and never mutated in place.
//! Field paths are dot separated (`sg_task.name`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field name to value mapping. Ordered so that serialized plans are stable.
pub type Fields = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Project,
    Shot,
    Asset,
    Version,
    PublishedFile,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "Project",
            EntityType::Shot => "Shot",
            EntityType::Asset => "Asset",
            EntityType::Version => "Version",
            EntityType::PublishedFile => "PublishedFile",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Project" => Ok(EntityType::Project),
            "Shot" => Ok(EntityType::Shot),
            "Asset" => Ok(EntityType::Asset),
            "Version" => Ok(EntityType::Version),
            "PublishedFile" => Ok(EntityType::PublishedFile),
            other => Err(format!("Unknown entity type: {}", other)),
        }
    }
}

/// Type + id reference to a tracking record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityLink {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: u64,
}

impl EntityLink {
    pub fn new(entity_type: EntityType, id: u64) -> Self {
        Self { entity_type, id }
    }

    /// Read a link stored as `{"type": "Shot", "id": 12, ...}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let entity_type = obj.get("type")?.as_str()?.parse().ok()?;
        let id = obj.get("id")?.as_u64()?;
        Some(Self { entity_type, id })
    }
}

impl fmt::Display for EntityLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: u64,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(entity_type: EntityType, id: u64) -> Self {
        Self { entity_type, id, fields: Fields::new() }
    }

    pub fn with_field(mut self, path: &str, value: impl Into<Value>) -> Self {
        set_field(&mut self.fields, path, value.into());
        self
    }

    pub fn link(&self) -> EntityLink {
        EntityLink::new(self.entity_type, self.id)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_field(&self.fields, path)
    }

    /// Rendered string value, `None` when absent or empty.
    pub fn text(&self, path: &str) -> Option<String> {
        self.get(path).and_then(render_value).filter(|text| !text.is_empty())
    }

    /// Fields plus `id` and `type`, the namespace expressions see.
    pub fn namespace(&self) -> Fields {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::from(self.id));
        fields.insert("type".to_string(), Value::from(self.entity_type.as_str()));
        fields
    }
}

/// Look up a dot separated field path.
///
/// A literal key wins over traversal, so flat projections like `task.name`
/// and nested link objects both resolve. Arrays of objects descend into
/// their first element.
pub fn get_field<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    if let Some(value) = fields.get(path) {
        return Some(value);
    }

    let mut parts = path.split('.');
    let head = parts.next()?;
    let mut current = fields.get(head)?;

    for key in parts {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.first()?.as_object()?.get(key)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Set a dot separated field path.
///
/// Existing literal keys and undotted paths are written flat; otherwise the
/// nested objects are created on the way down.
pub fn set_field(fields: &mut Fields, path: &str, value: Value) {
    if fields.contains_key(path) || !path.contains('.') {
        fields.insert(path.to_string(), value);
        return;
    }

    let mut keys = path.split('.');
    let head = match keys.next() {
        Some(head) => head,
        None => return,
    };
    let rest: Vec<&str> = keys.collect();

    let slot = fields
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if !slot.is_object() {
        *slot = Value::Object(Default::default());
    }

    let mut current = slot;
    for (i, key) in rest.iter().enumerate() {
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        if i == rest.len() - 1 {
            map.insert(key.to_string(), value);
            return;
        }
        let next = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !next.is_object() {
            *next = Value::Object(Default::default());
        }
        current = next;
    }
}

/// Render a scalar as text. Arrays use their first element and links
/// render their `name` (or `code`). Null and empty arrays render as `None`.
///
/// Attachments render their file name only for uploaded or local files;
/// web links and other attachment kinds render as empty text.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.first().and_then(render_value),
        Value::Object(map) if map.contains_key("link_type") => {
            match map.get("link_type").and_then(Value::as_str) {
                Some("upload") | Some("local") => map.get("name").and_then(render_value),
                _ => Some(String::new()),
            }
        }
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("code"))
            .and_then(render_value)
            .or_else(|| Some(value.to_string())),
    }
}
