//! Content validation against a schema's declared validator.
//!
//! XML content is checked against the compiled XSD, JSON content against the
//! compiled JSON Schema. Compiled validators are cached per schema id for the
//! life of the validator.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{IgsnError, Result};
use crate::schema::xsd::XsdSchema;
use crate::schema::{Schema, SchemaKind, SchemaRegistry};
use crate::xml::XmlDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Xml,
    Json,
    Unknown,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xml => "XML",
            Self::Json => "JSON",
            Self::Unknown => "unrecognized content",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sniff the content type from the first significant byte.
pub fn detect_content_type(content: &[u8]) -> ContentType {
    let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
    match content.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'<') => ContentType::Xml,
        Some(b'{') | Some(b'[') => ContentType::Json,
        _ => ContentType::Unknown,
    }
}

pub struct ContentValidator {
    registry: Arc<SchemaRegistry>,
    xsd_cache: RwLock<HashMap<String, Arc<XsdSchema>>>,
    json_cache: RwLock<HashMap<String, Arc<jsonschema::Validator>>>,
}

impl ContentValidator {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            xsd_cache: RwLock::new(HashMap::new()),
            json_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Validate `content` against schema `schema_id`.
    ///
    /// Unknown schemas are `SchemaNotSupported`, never a pass. Schemas without
    /// a declared validator accept any well-formed content.
    pub fn validate(&self, schema_id: &str, content: &[u8]) -> Result<()> {
        let schema = self
            .registry
            .get(schema_id)
            .map_err(|_| IgsnError::SchemaNotSupported(schema_id.to_string()))?;
        if content.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(IgsnError::ValidationFailed("content is empty".to_string()));
        }

        let expected = match schema.kind {
            SchemaKind::Xml => ContentType::Xml,
            SchemaKind::Json => ContentType::Json,
            SchemaKind::Text => ContentType::Unknown,
        };
        let found = detect_content_type(content);
        if expected != ContentType::Unknown && found != ContentType::Unknown && found != expected {
            return Err(IgsnError::ValidationFailed(format!(
                "expected {expected}, found {found}"
            )));
        }

        match schema.kind {
            SchemaKind::Xml => {
                let doc = XmlDocument::parse(content)
                    .map_err(|e| IgsnError::ValidationFailed(e.to_string()))?;
                if let Some(xsd) = self.xsd_for(&schema)? {
                    xsd.validate(&doc).map_err(IgsnError::ValidationFailed)?;
                }
            }
            SchemaKind::Json => {
                let value: serde_json::Value = serde_json::from_slice(content)
                    .map_err(|e| IgsnError::ValidationFailed(format!("malformed JSON: {e}")))?;
                if let Some(validator) = self.json_for(&schema)? {
                    if let Some(error) = validator.iter_errors(&value).next() {
                        return Err(IgsnError::ValidationFailed(format!(
                            "{}: {}",
                            error.instance_path, error
                        )));
                    }
                }
            }
            SchemaKind::Text => {
                std::str::from_utf8(content).map_err(|e| {
                    IgsnError::ValidationFailed(format!("content is not UTF-8: {e}"))
                })?;
            }
        }
        debug!(schema = %schema_id, bytes = content.len(), "Content validated");
        Ok(())
    }

    fn xsd_for(&self, schema: &Schema) -> Result<Option<Arc<XsdSchema>>> {
        let Some(path) = schema.local_schema_location.as_ref().filter(|_| schema.has_validator())
        else {
            return Ok(None);
        };
        if let Some(hit) = read_cache(&self.xsd_cache)?.get(&schema.id) {
            return Ok(Some(hit.clone()));
        }
        let compiled = Arc::new(XsdSchema::from_file(path).map_err(|e| {
            IgsnError::Configuration(format!("cannot compile XSD for '{}': {e}", schema.id))
        })?);
        write_cache(&self.xsd_cache)?.insert(schema.id.clone(), compiled.clone());
        debug!(schema = %schema.id, path = %path.display(), "Compiled XML schema");
        Ok(Some(compiled))
    }

    fn json_for(&self, schema: &Schema) -> Result<Option<Arc<jsonschema::Validator>>> {
        let Some(path) = schema.local_schema_location.as_ref().filter(|_| schema.has_validator())
        else {
            return Ok(None);
        };
        if let Some(hit) = read_cache(&self.json_cache)?.get(&schema.id) {
            return Ok(Some(hit.clone()));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            IgsnError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let document: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            IgsnError::Configuration(format!("invalid JSON Schema for '{}': {e}", schema.id))
        })?;
        let compiled = Arc::new(jsonschema::validator_for(&document).map_err(|e| {
            IgsnError::Configuration(format!("cannot compile JSON Schema for '{}': {e}", schema.id))
        })?);
        write_cache(&self.json_cache)?.insert(schema.id.clone(), compiled.clone());
        debug!(schema = %schema.id, path = %path.display(), "Compiled JSON schema");
        Ok(Some(compiled))
    }
}

fn read_cache<T>(
    lock: &RwLock<HashMap<String, T>>,
) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, T>>> {
    lock.read()
        .map_err(|_| IgsnError::Internal(anyhow::anyhow!("validator cache lock poisoned")))
}

fn write_cache<T>(
    lock: &RwLock<HashMap<String, T>>,
) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, T>>> {
    lock.write()
        .map_err(|_| IgsnError::Internal(anyhow::anyhow!("validator cache lock poisoned")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bundled_schemas_dir;

    fn validator() -> ContentValidator {
        let registry = SchemaRegistry::load(&bundled_schemas_dir()).unwrap();
        ContentValidator::new(Arc::new(registry))
    }

    #[test]
    fn detects_content_type() {
        assert_eq!(detect_content_type(b"\xEF\xBB\xBF  <a/>"), ContentType::Xml);
        assert_eq!(detect_content_type(b"\n{\"a\":1}"), ContentType::Json);
        assert_eq!(detect_content_type(b"[1]"), ContentType::Json);
        assert_eq!(detect_content_type(b"10273/XX"), ContentType::Unknown);
        assert_eq!(detect_content_type(b""), ContentType::Unknown);
    }

    #[test]
    fn unknown_schema_is_not_supported() {
        let err = validator().validate("no-such-schema", b"<x/>").unwrap_err();
        assert!(matches!(err, IgsnError::SchemaNotSupported(id) if id == "no-such-schema"));
    }

    #[test]
    fn empty_content_fails() {
        let err = validator().validate("ardc-igsn-desc-1.0", b"  \n").unwrap_err();
        assert!(matches!(err, IgsnError::ValidationFailed(_)));
    }

    #[test]
    fn malformed_xml_reports_parser_message() {
        let err = validator()
            .validate("ardc-igsn-desc-1.0", b"<resources><resource>")
            .unwrap_err();
        match err {
            IgsnError::ValidationFailed(msg) => assert!(msg.contains("malformed XML"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn xsd_violation_is_reported() {
        let err = validator()
            .validate(
                "ardc-igsn-desc-1.0",
                br#"<resources xmlns="https://identifiers.ardc.edu.au/schemas/ardc-igsn-desc"><bogus/></resources>"#,
            )
            .unwrap_err();
        match err {
            IgsnError::ValidationFailed(msg) => assert!(msg.contains("bogus"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn json_schema_failure_has_instance_path() {
        let err = validator()
            .validate("ardc-igsn-jsonld", br#"{"@context": {}, "@type": "Thing", "name": 5}"#)
            .unwrap_err();
        assert!(matches!(err, IgsnError::ValidationFailed(_)));
    }

    #[test]
    fn content_of_the_wrong_kind_is_named() {
        let v = validator();
        let err = v.validate("ardc-igsn-desc-1.0", br#"{"a": 1}"#).unwrap_err();
        assert!(
            matches!(err, IgsnError::ValidationFailed(ref m) if m == "expected XML, found JSON"),
            "{err}"
        );
        let err = v.validate("ardc-igsn-jsonld", b"<a/>").unwrap_err();
        assert!(
            matches!(err, IgsnError::ValidationFailed(ref m) if m == "expected JSON, found XML"),
            "{err}"
        );
    }

    #[test]
    fn text_schema_accepts_plain_lines() {
        validator()
            .validate("igsn-list", b"12073/XXAA1234567\n12703/XXAB12345")
            .unwrap();
    }
}
