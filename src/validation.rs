//! Validation System - Rule/Policy Separation
//!
//! Rules inspect a unit's source media and produce structured violations.
//! Policy maps violations to actions for the sub-output being planned.

use serde::{Deserialize, Serialize};

use crate::planner::SourceMedia;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Block,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

/// Sub-output a rule guards
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Sequence,
    Preview,
}

const BOTH: &[RuleScope] = &[RuleScope::Sequence, RuleScope::Preview];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub scope: RuleScope,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn success(scope: RuleScope) -> Self {
        Self { valid: true, scope, violations: vec![] }
    }

    pub fn failure(scope: RuleScope, violations: Vec<ValidationViolation>) -> Self {
        Self { valid: false, scope, violations }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    /// `rule: message` pairs joined for error reporting
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn scopes(&self) -> &'static [RuleScope];
    fn validate(&self, media: &SourceMedia) -> Vec<ValidationViolation>;
}

fn violation(rule: &str, message: &str, expected: Option<String>, actual: Option<String>, fix: &str) -> ValidationViolation {
    ValidationViolation {
        rule: rule.to_string(),
        severity: ViolationSeverity::Error,
        message: message.to_string(),
        expected,
        actual,
        remediation: vec![fix.to_string()],
    }
}

// --- Concrete Rules ---

pub struct FrameRangeRule;

impl ValidationRule for FrameRangeRule {
    fn name(&self) -> &'static str { "frame_range" }

    fn scopes(&self) -> &'static [RuleScope] { BOTH }

    fn validate(&self, media: &SourceMedia) -> Vec<ValidationViolation> {
        match (media.first_frame, media.last_frame) {
            (Some(first), Some(last)) if first <= last => vec![],
            (Some(first), Some(last)) => vec![violation(
                self.name(),
                "First frame is after last frame",
                Some("first <= last".to_string()),
                Some(format!("{}-{}", first, last)),
                "Fix the frame range on the Version",
            )],
            _ => vec![violation(
                self.name(),
                "Frame range is not set",
                None,
                None,
                "Set the first and last frame on the Version",
            )],
        }
    }
}

pub struct FrameRateRule;

impl ValidationRule for FrameRateRule {
    fn name(&self) -> &'static str { "frame_rate" }

    fn scopes(&self) -> &'static [RuleScope] { BOTH }

    fn validate(&self, media: &SourceMedia) -> Vec<ValidationViolation> {
        match media.frame_rate {
            Some(fps) if fps > 0.0 => vec![],
            other => vec![violation(
                self.name(),
                "Frame rate is not set",
                Some("a positive frame rate".to_string()),
                other.map(|f| f.to_string()),
                "Set the uploaded movie frame rate on the Version",
            )],
        }
    }
}

pub struct PreviewMovieRule;

impl ValidationRule for PreviewMovieRule {
    fn name(&self) -> &'static str { "preview_movie" }

    fn scopes(&self) -> &'static [RuleScope] { &[RuleScope::Preview] }

    fn validate(&self, media: &SourceMedia) -> Vec<ValidationViolation> {
        if media.movie_path.is_some() {
            return vec![];
        }
        vec![violation(
            self.name(),
            "Version has no movie to build a preview from",
            None,
            None,
            "Set the path to movie on the Version",
        )]
    }
}

pub struct SequencePathRule;

impl ValidationRule for SequencePathRule {
    fn name(&self) -> &'static str { "sequence_path" }

    fn scopes(&self) -> &'static [RuleScope] { &[RuleScope::Sequence] }

    fn validate(&self, media: &SourceMedia) -> Vec<ValidationViolation> {
        let path = match &media.sequence_path {
            Some(path) => path,
            None => {
                return vec![violation(
                    self.name(),
                    "Version has no published frames",
                    None,
                    None,
                    "Link a published image sequence to the Version",
                )]
            }
        };
        let is_movie = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("mov"));
        if is_movie {
            return vec![violation(
                self.name(),
                "Published file is a movie, not an image sequence",
                Some("an image sequence".to_string()),
                Some(path.display().to_string()),
                "Publish the frames as an image sequence",
            )];
        }
        vec![]
    }
}

pub struct VersionNumberRule;

impl ValidationRule for VersionNumberRule {
    fn name(&self) -> &'static str { "version_number" }

    fn scopes(&self) -> &'static [RuleScope] { BOTH }

    fn validate(&self, media: &SourceMedia) -> Vec<ValidationViolation> {
        match media.version_number {
            Some(n) if n >= 0 => vec![],
            other => vec![violation(
                self.name(),
                "Published file has no version number",
                None,
                other.map(|n| n.to_string()),
                "Link a published file to the Version",
            )],
        }
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(FrameRangeRule),
                Box::new(FrameRateRule),
                Box::new(PreviewMovieRule),
                Box::new(SequencePathRule),
                Box::new(VersionNumberRule),
            ],
        }
    }

    pub fn validate(&self, media: &SourceMedia, scope: RuleScope, mode: FailureMode) -> ValidationResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .filter(|rule| rule.scopes().contains(&scope))
            .flat_map(|rule| rule.validate(media))
            .collect();

        match mode {
            FailureMode::Block => {
                // Warnings don't block
                let errors: Vec<_> = violations
                    .into_iter()
                    .filter(|v| v.severity == ViolationSeverity::Error)
                    .collect();
                if errors.is_empty() {
                    ValidationResult::success(scope)
                } else {
                    ValidationResult::failure(scope, errors)
                }
            }
            FailureMode::Warn => {
                // Never block, just record
                ValidationResult { valid: true, scope, violations }
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
