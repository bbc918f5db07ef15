//! Metadata transformation between schemas.
//!
//! Transforms are declared per source schema and resolved through the
//! [`SchemaRegistry`]; there is no multi-hop chaining. A transform either
//! produces a complete output [`Version`] or fails with
//! [`IgsnError::TransformFailed`]. When the target schema declares a
//! validator the output is validated before it is returned.

pub mod builtin;
pub mod stylesheet;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

pub use builtin::BuiltinTransform;
pub use stylesheet::Stylesheet;

use crate::error::{IgsnError, Result};
use crate::schema::SchemaRegistry;
use crate::types::Version;
use crate::validator::ContentValidator;
use crate::xml::XmlDocument;

/// Strategy resolved from a schema descriptor at load time.
#[derive(Debug, Clone)]
pub enum TransformerRef {
    Builtin(BuiltinTransform),
    Stylesheet(Arc<Stylesheet>),
}

/// Parameters passed to every transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformParams {
    pub registrant_name: Option<String>,
    pub event_type: Option<String>,
    /// Defaults to the input version's creation time, keeping output stable.
    pub timestamp: Option<DateTime<Utc>>,
}

impl TransformParams {
    pub fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "registrant_name" => self.registrant_name.clone(),
            "event_type" => self.event_type.clone(),
            "timestamp" => self
                .timestamp
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            _ => None,
        }
    }

    fn with_default_timestamp(&self, input: &Version) -> Self {
        let mut params = self.clone();
        params.timestamp.get_or_insert(input.created_at);
        params
    }
}

pub struct MetadataTransformer {
    registry: Arc<SchemaRegistry>,
    validator: Arc<ContentValidator>,
}

impl MetadataTransformer {
    pub fn new(registry: Arc<SchemaRegistry>, validator: Arc<ContentValidator>) -> Self {
        Self {
            registry,
            validator,
        }
    }

    /// Produce a new current version of `input`'s record in `target`.
    pub fn transform(
        &self,
        input: &Version,
        target: &str,
        params: &TransformParams,
    ) -> Result<Version> {
        if !self.registry.supports(&input.schema) {
            return Err(IgsnError::SchemaNotSupported(input.schema.clone()));
        }
        if !self.registry.supports(target) {
            return Err(IgsnError::SchemaNotSupported(target.to_string()));
        }
        let transformer = self.registry.resolve_transform(&input.schema, target)?;
        let failed = |reason: String| IgsnError::TransformFailed {
            from: input.schema.clone(),
            to: target.to_string(),
            reason,
        };

        let doc = XmlDocument::parse(&input.content).map_err(|e| failed(e.to_string()))?;
        let params = params.with_default_timestamp(input);
        let content = match &transformer {
            TransformerRef::Builtin(builtin) => builtin.apply(input, &doc, &params),
            TransformerRef::Stylesheet(sheet) => sheet
                .apply(&doc, &params)
                .map(|out| out.to_xml_string().into_bytes()),
        }
        .map_err(failed)?;

        self.validator
            .validate(target, &content)
            .map_err(|e| match e {
                IgsnError::ValidationFailed(msg) => {
                    failed(format!("output does not validate: {msg}"))
                }
                other => other,
            })?;

        debug!(
            from = %input.schema,
            to = %target,
            record_id = %input.record_id,
            bytes = content.len(),
            "Transformed version"
        );
        Ok(Version::new(input.record_id, target, content, input.request_id))
    }
}
