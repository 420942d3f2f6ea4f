//! Field Expression Evaluator
//!
//! Text fields (slate captions, CSV columns) mix three notations:
//!
//! - `<entity.field>` references a field on the project, shot or version
//!   (plus the `file` and `date` namespaces)
//! - `{field}` and `[_{field}]` substitute from the template field mapping,
//!   the bracketed form vanishing entirely when the field is empty
//! - any other `[...]` group belongs to the renderer (Nuke TCL) and is
//!   emitted untouched apart from notations nested inside it
//!
//! Text is tokenized once, left to right, and every token renders on its own
//! so one notation can never corrupt another.

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::entity::{get_field, render_value, Fields};

/// Fields the `file` namespace knows about
pub const FILE_FIELDS: &[&str] = &["name", "name_ranged", "codec", "compression", "bit_depth", "folder"];

/// Namespaces accepted inside `<...>`
pub const NAMESPACES: &[&str] = &["file", "date", "project", "shot", "version"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Failed to resolve template field: \"{0}\"")]
    UnresolvedField(String),

    #[error("Unknown namespace \"{0}\" in field reference")]
    UnknownNamespace(String),

    #[error("No {namespace} context supplied for resolving \"{reference}\"")]
    MissingContext { namespace: String, reference: String },

    #[error("Failed to convert date to format \"{0}\"")]
    InvalidDateFormat(String),
}

impl ExpressionError {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, ExpressionError::UnresolvedField(_) | ExpressionError::MissingContext { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    EntityRef { namespace: String, field: String },
    Placeholder(String),
    Optional { prefix: String, name: String, suffix: String },
    Opaque(Vec<Token>),
}

/// File being delivered, for the `file` namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileContext {
    pub path: PathBuf,
    pub folder: PathBuf,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub bit_depth: Option<String>,
    #[serde(default)]
    pub has_slate: bool,
    #[serde(default)]
    pub first_frame: Option<i64>,
    #[serde(default)]
    pub last_frame: Option<i64>,
}

impl FileContext {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name with its `%0Nd` frame pattern replaced by `[first-last]`.
    pub fn name_ranged(&self) -> String {
        let name = self.file_name();
        let (first, last) = match (self.first_frame, self.last_frame) {
            (Some(first), Some(last)) => (first, last),
            _ => return name,
        };
        let first = if self.has_slate { first - 1 } else { first };

        match find_frame_pattern(&name) {
            Some((start, end)) => format!("{}[{}-{}]{}", &name[..start], first, last, &name[end..]),
            None => name,
        }
    }
}

/// Locate a printf frame pattern such as `%04d`
pub(crate) fn find_frame_pattern(name: &str) -> Option<(usize, usize)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'd' && j > i + 1 && bytes[i + 1] == b'0' {
                return Some((i, j + 1));
            }
        }
        i += 1;
    }
    None
}

/// Namespace an expression evaluates against. Built once per unit.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionContext<'a> {
    timestamp: NaiveDateTime,
    fields: Option<&'a Fields>,
    project: Option<&'a Fields>,
    shot: Option<&'a Fields>,
    version: Option<&'a Fields>,
    file: Option<&'a FileContext>,
}

impl<'a> ExpressionContext<'a> {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self { timestamp, fields: None, project: None, shot: None, version: None, file: None }
    }

    pub fn with_fields(mut self, fields: &'a Fields) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_project(mut self, project: &'a Fields) -> Self {
        self.project = Some(project);
        self
    }

    /// The owning Shot or Asset
    pub fn with_shot(mut self, shot: &'a Fields) -> Self {
        self.shot = Some(shot);
        self
    }

    pub fn with_version(mut self, version: &'a Fields) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_file(mut self, file: &'a FileContext) -> Self {
        self.file = Some(file);
        self
    }
}

/// A tokenized text field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    tokens: Vec<Token>,
}

impl Expression {
    pub fn parse(text: &str) -> Self {
        Self { source: text.to_string(), tokens: tokenize(text) }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Every `<namespace.field>` reference, nested ones included
    pub fn entity_refs(&self) -> Vec<(String, String)> {
        let mut refs = vec![];
        collect_refs(&self.tokens, &mut refs);
        refs
    }

    /// Static checks run when configuration loads
    pub fn validate(&self) -> Result<(), ExpressionError> {
        for (namespace, field) in self.entity_refs() {
            if !NAMESPACES.contains(&namespace.as_str()) {
                return Err(ExpressionError::UnknownNamespace(namespace));
            }
            if namespace == "file" && !FILE_FIELDS.contains(&field.as_str()) {
                return Err(ExpressionError::UnresolvedField(format!("file.{}", field)));
            }
            if namespace == "date" {
                check_date_format(&field)?;
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, ctx: &ExpressionContext<'_>) -> Result<String, ExpressionError> {
        render_tokens(&self.tokens, ctx)
    }

    /// Evaluate, rendering any failure as an empty string
    pub fn evaluate_optional(&self, ctx: &ExpressionContext<'_>) -> String {
        match self.evaluate(ctx) {
            Ok(text) => text,
            Err(e) => {
                warn!("Optional field \"{}\" rendered empty: {}", self.source, e);
                String::new()
            }
        }
    }
}

/// Evaluate `text` against `ctx`.
pub fn evaluate(text: &str, ctx: &ExpressionContext<'_>) -> Result<String, ExpressionError> {
    Expression::parse(text).evaluate(ctx)
}

fn collect_refs(tokens: &[Token], out: &mut Vec<(String, String)>) {
    for token in tokens {
        match token {
            Token::EntityRef { namespace, field } => out.push((namespace.clone(), field.clone())),
            Token::Opaque(inner) => collect_refs(inner, out),
            _ => {}
        }
    }
}

// --- Tokenizer ---

pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = vec![];
    let mut literal = String::new();
    let mut i = 0;

    while i < text.len() {
        let rest = &text[i..];
        let c = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };

        let matched = match c {
            '<' => scan_entity_ref(rest),
            '{' => scan_placeholder(rest).map(|(name, len)| (Token::Placeholder(name), len)),
            '[' => scan_bracket(rest),
            _ => None,
        };

        match matched {
            Some((token, len)) => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(token);
                i += len;
            }
            None => {
                literal.push(c);
                i += c.len_utf8();
            }
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

fn is_ref_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '%'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// `<namespace.field>`
fn scan_entity_ref(rest: &str) -> Option<(Token, usize)> {
    let close = rest.find('>')?;
    let body = &rest[1..close];
    if body.is_empty() || !body.chars().all(is_ref_char) {
        return None;
    }
    let (namespace, field) = body.split_once('.')?;
    if namespace.is_empty() || field.is_empty() {
        return None;
    }
    Some((
        Token::EntityRef { namespace: namespace.to_string(), field: field.to_string() },
        close + 1,
    ))
}

/// `{name}`
fn scan_placeholder(rest: &str) -> Option<(String, usize)> {
    let close = rest.find('}')?;
    let body = &rest[1..close];
    if body.is_empty() || !body.chars().all(is_ident_char) {
        return None;
    }
    Some((body.to_string(), close + 1))
}

/// `[...]`, either the optional placeholder form or an opaque group
fn scan_bracket(rest: &str) -> Option<(Token, usize)> {
    let mut depth = 0usize;
    let mut close = None;
    for (idx, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close?;
    let inner = &rest[1..close];

    let token = match scan_optional(inner) {
        Some(optional) => optional,
        None => Token::Opaque(tokenize(inner)),
    };
    Some((token, close + 1))
}

fn scan_optional(inner: &str) -> Option<Token> {
    let open = inner.find('{')?;
    let (name, len) = scan_placeholder(&inner[open..])?;
    let prefix = &inner[..open];
    let suffix = &inner[open + len..];

    let plain = |s: &str| !s.chars().any(|c| c.is_whitespace() || "[]{}<>".contains(c));
    if !plain(prefix) || !plain(suffix) {
        return None;
    }
    Some(Token::Optional { prefix: prefix.to_string(), name, suffix: suffix.to_string() })
}

// --- Rendering ---

fn render_tokens(tokens: &[Token], ctx: &ExpressionContext<'_>) -> Result<String, ExpressionError> {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Literal(text) => out.push_str(text),
            Token::EntityRef { namespace, field } => out.push_str(&resolve_ref(namespace, field, ctx)?),
            Token::Placeholder(name) => {
                let value = lookup_placeholder(name, ctx)
                    .ok_or_else(|| ExpressionError::UnresolvedField(name.clone()))?;
                out.push_str(&value);
            }
            Token::Optional { prefix, name, suffix } => {
                if let Some(value) = lookup_placeholder(name, ctx).filter(|v| !v.is_empty()) {
                    out.push_str(prefix);
                    out.push_str(&value);
                    out.push_str(suffix);
                }
            }
            Token::Opaque(inner) => {
                out.push('[');
                out.push_str(&render_tokens(inner, ctx)?);
                out.push(']');
            }
        }
    }
    Ok(out)
}

fn lookup_placeholder(name: &str, ctx: &ExpressionContext<'_>) -> Option<String> {
    ctx.fields.and_then(|fields| get_field(fields, name)).and_then(render_value)
}

fn resolve_ref(namespace: &str, field: &str, ctx: &ExpressionContext<'_>) -> Result<String, ExpressionError> {
    let reference = format!("{}.{}", namespace, field);
    let missing = || ExpressionError::MissingContext {
        namespace: namespace.to_string(),
        reference: reference.clone(),
    };

    match namespace {
        "date" => format_date(ctx.timestamp, field),
        "file" => {
            let file = ctx.file.ok_or_else(missing)?;
            resolve_file_field(file, field).ok_or_else(|| ExpressionError::UnresolvedField(reference.clone()))
        }
        "project" | "shot" | "version" => {
            let fields = match namespace {
                "project" => ctx.project,
                "shot" => ctx.shot,
                _ => ctx.version,
            }
            .ok_or_else(missing)?;

            match get_field(fields, field) {
                Some(value) => {
                    let text = render_value(value);
                    if text.is_none() {
                        warn!("Template field value \"{}\" is empty", reference);
                    }
                    Ok(text.unwrap_or_default())
                }
                None => Err(ExpressionError::UnresolvedField(reference.clone())),
            }
        }
        other => Err(ExpressionError::UnknownNamespace(other.to_string())),
    }
}

fn resolve_file_field(file: &FileContext, field: &str) -> Option<String> {
    match field {
        "name" => Some(file.file_name()),
        "name_ranged" => Some(file.name_ranged()),
        "codec" | "compression" => Some(file.codec.clone().unwrap_or_default()),
        "bit_depth" => Some(file.bit_depth.clone().unwrap_or_default()),
        "folder" => Some(
            file.folder
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        _ => None,
    }
}

fn check_date_format(format: &str) -> Result<Vec<Item<'_>>, ExpressionError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(ExpressionError::InvalidDateFormat(format.to_string()));
    }
    Ok(items)
}

fn format_date(timestamp: NaiveDateTime, format: &str) -> Result<String, ExpressionError> {
    let items = check_date_format(format)?;
    let mut out = String::new();
    write!(out, "{}", timestamp.format_with_items(items.iter()))
        .map_err(|_| ExpressionError::InvalidDateFormat(format.to_string()))?;
    Ok(out)
}
