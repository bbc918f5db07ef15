//! Compiled-in structural mappings from the ARDC descriptive schema.

use chrono::SecondsFormat;
use serde_json::{json, Map, Value};

use super::TransformParams;
use crate::types::{normalize_identifier, Version};
use crate::xml::{XmlDocument, XmlElement};

pub const REGISTRATION_METADATA_NAMESPACE: &str =
    "https://igsn.org/schemas/registration-metadata/1.1";

const DEFAULT_EVENT: &str = "submitted";

/// Names used in schema descriptors (`transforms: {type: builtin, name: ...}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTransform {
    /// ARDC descriptive metadata to the registrar's registration metadata.
    ArdcToRegistrationMetadata,
    /// ARDC descriptive metadata to schema.org JSON-LD.
    ArdcToJsonLd,
}

impl BuiltinTransform {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ardc-to-registration-metadata" => Some(Self::ArdcToRegistrationMetadata),
            "ardc-to-jsonld" => Some(Self::ArdcToJsonLd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ArdcToRegistrationMetadata => "ardc-to-registration-metadata",
            Self::ArdcToJsonLd => "ardc-to-jsonld",
        }
    }

    pub fn apply(
        &self,
        input: &Version,
        doc: &XmlDocument,
        params: &TransformParams,
    ) -> Result<Vec<u8>, String> {
        match self {
            Self::ArdcToRegistrationMetadata => {
                registration_metadata(input, doc, params).map(|d| d.to_xml_string().into_bytes())
            }
            Self::ArdcToJsonLd => {
                let value = json_ld(doc)?;
                serde_json::to_vec_pretty(&value).map_err(|e| e.to_string())
            }
        }
    }
}

fn first_resource(doc: &XmlDocument) -> Result<&XmlElement, String> {
    if doc.root.local_name() == "resource" {
        return Ok(&doc.root);
    }
    doc.root
        .child("resource")
        .ok_or_else(|| format!("<{}> contains no resource", doc.root.name))
}

fn child_text(resource: &XmlElement, name: &str) -> Option<String> {
    resource
        .child(name)
        .map(|e| e.text().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn registration_metadata(
    input: &Version,
    doc: &XmlDocument,
    params: &TransformParams,
) -> Result<XmlDocument, String> {
    let resource = first_resource(doc)?;
    let identifier = child_text(resource, "resourceIdentifier")
        .map(|v| normalize_identifier(&v))
        .ok_or("resource has no resourceIdentifier")?;
    let registrant = params
        .registrant_name
        .clone()
        .ok_or("registrant_name parameter is required")?;
    let event = params.event_type.as_deref().unwrap_or(DEFAULT_EVENT);
    let timestamp = params
        .timestamp
        .unwrap_or(input.created_at)
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    let root = XmlElement::new("sample")
        .with_attribute("xmlns", REGISTRATION_METADATA_NAMESPACE)
        .with_child(
            XmlElement::new("sampleNumber")
                .with_attribute("identifierType", "igsn")
                .with_text(identifier),
        )
        .with_child(
            XmlElement::new("registrant")
                .with_child(XmlElement::new("registrantName").with_text(registrant)),
        )
        .with_child(
            XmlElement::new("log").with_child(
                XmlElement::new("logElement")
                    .with_attribute("event", event)
                    .with_attribute("timeStamp", timestamp),
            ),
        );
    Ok(XmlDocument::new(root))
}

fn json_ld(doc: &XmlDocument) -> Result<Value, String> {
    let resource = first_resource(doc)?;
    let identifier = child_text(resource, "resourceIdentifier")
        .map(|v| normalize_identifier(&v))
        .ok_or("resource has no resourceIdentifier")?;
    let title = child_text(resource, "resourceTitle").ok_or("resource has no resourceTitle")?;

    let mut out = Map::new();
    out.insert("@context".into(), json!({ "@vocab": "https://schema.org/" }));
    out.insert("@id".into(), json!(format!("https://igsn.org/{identifier}")));
    out.insert("@type".into(), json!("Thing"));
    out.insert(
        "identifier".into(),
        json!({
            "@type": "PropertyValue",
            "propertyID": "IGSN",
            "value": identifier,
        }),
    );
    out.insert("name".into(), json!(title));
    if let Some(url) = child_text(resource, "landingPage") {
        out.insert("url".into(), json!(url));
    }
    if let Some(object_type) = resource.attribute("registeredObjectType") {
        out.insert("additionalType".into(), json!(object_type));
    }
    let resource_types: Vec<String> = resource
        .select("resourceTypes/resourceType")
        .into_iter()
        .map(|e| e.text().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if !resource_types.is_empty() {
        out.insert("keywords".into(), json!(resource_types));
    }
    if let Some(description) = child_text(resource, "purpose") {
        out.insert("description".into(), json!(description));
    }
    Ok(Value::Object(out))
}
