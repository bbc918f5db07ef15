//! Metadata providers: pull identifier values, titles and landing pages out of
//! schema-specific content.
//!
//! Providers are pure functions of their input. The identifier kind is
//! normalized to upper case; titles and landing pages are returned as written.

use serde::{Deserialize, Serialize};

use crate::error::{IgsnError, Result};
use crate::types::normalize_identifier;
use crate::xml::XmlDocument;

/// What a provider extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Identifier,
    Title,
    LandingPage,
}

impl MetadataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Title => "title",
            Self::LandingPage => "landing_page",
        }
    }
}

impl std::fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider strategy declared by a schema descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderRef {
    /// One value per non-empty line of plain text.
    Line,
    /// Values selected by a path over the parsed XML document.
    Xpath {
        path: String,
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl ProviderRef {
    pub fn build(&self, kind: MetadataKind) -> Box<dyn MetadataProvider> {
        match self {
            Self::Line => Box::new(LineProvider::new(kind)),
            Self::Xpath { path, prefix } => {
                Box::new(XPathProvider::new(kind, path.clone(), prefix.clone()))
            }
        }
    }
}

pub trait MetadataProvider: Send + Sync {
    /// First value, or `NotFound` when the content has none.
    fn get(&self, content: &str) -> Result<String>;

    /// Every value in document order.
    fn get_all(&self, content: &str) -> Result<Vec<String>>;
}

fn normalize(kind: MetadataKind, value: &str) -> String {
    match kind {
        MetadataKind::Identifier => normalize_identifier(value),
        MetadataKind::Title | MetadataKind::LandingPage => value.trim().to_string(),
    }
}

// ─── Line provider ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LineProvider {
    kind: MetadataKind,
}

impl LineProvider {
    pub fn new(kind: MetadataKind) -> Self {
        Self { kind }
    }

    pub fn identifiers() -> Self {
        Self::new(MetadataKind::Identifier)
    }

    /// Value at `position` among the non-empty lines. Positions outside
    /// `[0, len)`, negative ones included, are `NotFound`.
    pub fn get_at(&self, content: &str, position: i64) -> Result<String> {
        let lines = self.lines(content);
        usize::try_from(position)
            .ok()
            .and_then(|i| lines.into_iter().nth(i))
            .ok_or_else(|| IgsnError::not_found("line", position.to_string()))
    }

    fn lines(&self, content: &str) -> Vec<String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| normalize(self.kind, line))
            .collect()
    }
}

impl MetadataProvider for LineProvider {
    fn get(&self, content: &str) -> Result<String> {
        self.get_at(content, 0)
    }

    fn get_all(&self, content: &str) -> Result<Vec<String>> {
        Ok(self.lines(content))
    }
}

// ─── Path provider ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct XPathProvider {
    kind: MetadataKind,
    path: String,
    prefix: Option<String>,
}

impl XPathProvider {
    pub fn new(kind: MetadataKind, path: String, prefix: Option<String>) -> Self {
        Self { kind, path, prefix }
    }

    pub fn select(&self, doc: &XmlDocument) -> Vec<String> {
        doc.select_values(&self.path)
            .into_iter()
            .filter(|v| !v.trim().is_empty())
            .map(|v| {
                let value = normalize(self.kind, &v);
                match &self.prefix {
                    Some(prefix) => format!("{prefix}{value}"),
                    None => value,
                }
            })
            .collect()
    }

    pub fn first(&self, doc: &XmlDocument) -> Result<String> {
        self.select(doc)
            .into_iter()
            .next()
            .ok_or_else(|| IgsnError::not_found("path match", self.path.clone()))
    }

    fn parse(content: &str) -> Result<XmlDocument> {
        XmlDocument::parse_str(content).map_err(|e| IgsnError::ValidationFailed(e.to_string()))
    }
}

impl MetadataProvider for XPathProvider {
    fn get(&self, content: &str) -> Result<String> {
        self.first(&Self::parse(content)?)
    }

    fn get_all(&self, content: &str) -> Result<Vec<String>> {
        Ok(self.select(&Self::parse(content)?))
    }
}
