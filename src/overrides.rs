//! Field Override Engine
//!
//! Declarative match/replace rules that rewrite entity metadata before any
//! path or text field is resolved. Rules fold in declared order and the last
//! write wins per field.
//!
//! Text replace values are field expressions evaluated against the entity
//! being overridden (`{code}_fix`, `<project.sg_short_name>`). A value that
//! fails to evaluate is written as an empty string.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::{get_field, set_field, EntityType, Fields};
use crate::expression::{Expression, ExpressionContext, ExpressionError};

/// Entity types an override may target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverrideTarget {
    Shot,
    Version,
    PublishedFile,
}

impl OverrideTarget {
    pub fn entity_type(&self) -> EntityType {
        match self {
            OverrideTarget::Shot => EntityType::Shot,
            OverrideTarget::Version => EntityType::Version,
            OverrideTarget::PublishedFile => EntityType::PublishedFile,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VersionOverride {
    pub entity_type: OverrideTarget,
    #[serde(rename = "match", default)]
    pub match_fields: Fields,
    #[serde(default)]
    pub replace: Fields,
}

impl VersionOverride {
    /// Every match pair equals the current value. An empty match always applies.
    pub fn matches(&self, fields: &Fields) -> bool {
        self.match_fields
            .iter()
            .all(|(path, expected)| get_field(fields, path) == Some(expected))
    }

    /// Load-time check of the text replace values. There is no file to
    /// reference while overriding.
    pub fn validate(&self) -> Result<(), ExpressionError> {
        for value in self.replace.values() {
            if let Value::String(text) = value {
                let expression = Expression::parse(text);
                expression.validate()?;
                if let Some((_, field)) = expression.entity_refs().into_iter().find(|(ns, _)| ns == "file") {
                    return Err(ExpressionError::MissingContext {
                        namespace: "file".to_string(),
                        reference: format!("file.{}", field),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Entities a replace value can reference besides the overridden one
#[derive(Debug, Clone, Copy)]
pub struct OverrideScope<'a> {
    pub timestamp: NaiveDateTime,
    pub project: Option<&'a Fields>,
    /// Owning Shot or Asset, when the overridden entity is not the owner
    pub shot: Option<&'a Fields>,
    /// Version a published file belongs to
    pub version: Option<&'a Fields>,
}

impl<'a> OverrideScope<'a> {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self { timestamp, project: None, shot: None, version: None }
    }

    fn context<'c>(&self, entity_type: EntityType, fields: &'c Fields) -> ExpressionContext<'c>
    where
        'a: 'c,
    {
        let mut ctx = ExpressionContext::new(self.timestamp).with_fields(fields);
        if let Some(project) = self.project {
            ctx = ctx.with_project(project);
        }
        let (shot, version) = match entity_type {
            EntityType::Shot | EntityType::Asset => (Some(fields), None),
            EntityType::Version => (self.shot, Some(fields)),
            _ => (self.shot, self.version),
        };
        if let Some(shot) = shot {
            ctx = ctx.with_shot(shot);
        }
        if let Some(version) = version {
            ctx = ctx.with_version(version);
        }
        ctx
    }
}

fn replace_value(value: &Value, ctx: &ExpressionContext<'_>, path: &str) -> Value {
    let text = match value {
        Value::String(text) => text,
        other => return other.clone(),
    };
    match Expression::parse(text).evaluate(ctx) {
        Ok(rendered) => Value::from(rendered),
        Err(e) => {
            warn!("Override value for \"{}\" rendered empty: {}", path, e);
            Value::from("")
        }
    }
}

/// Apply every matching override for `entity_type` to a copy of `fields`.
///
/// Replace values of one rule are evaluated against the fields as they were
/// before that rule applied.
pub fn apply_overrides(
    entity_type: EntityType,
    fields: &Fields,
    overrides: &[VersionOverride],
    scope: &OverrideScope<'_>,
) -> Fields {
    let mut working = fields.clone();

    for (index, rule) in overrides.iter().enumerate() {
        if rule.entity_type.entity_type() != entity_type || !rule.matches(&working) {
            continue;
        }
        debug!("Applying {} override #{}", entity_type, index);
        let current = working.clone();
        let ctx = scope.context(entity_type, &current);
        for (path, value) in &rule.replace {
            set_field(&mut working, path, replace_value(value, &ctx, path));
        }
    }

    working
}
