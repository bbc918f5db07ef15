//! Schema registry: loads schema descriptors from the schema file store and
//! answers lookups for validators, transforms and providers.
//!
//! Descriptors live in `schemas.yaml` inside the schemas directory; every
//! path in a descriptor is relative to that directory. The registry is
//! read-only after load and shared behind an `Arc`.

pub mod xsd;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IgsnError, Result};
use crate::provider::{MetadataKind, ProviderRef};
use crate::transform::{BuiltinTransform, Stylesheet, TransformerRef};

pub const DESCRIPTOR_FILE: &str = "schemas.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// Validated with an XML Schema when `local_schema_location` is set.
    Xml,
    /// Validated with a JSON Schema when `local_schema_location` is set.
    Json,
    /// Plain text, one identifier per line.
    Text,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub id: String,
    pub kind: SchemaKind,
    pub namespace: Option<String>,
    pub schema_location: Option<String>,
    /// Absolute path of the validator document, if the schema declares one.
    pub local_schema_location: Option<PathBuf>,
    pub transforms: BTreeMap<String, TransformerRef>,
    pub providers: BTreeMap<MetadataKind, ProviderRef>,
}

impl Schema {
    pub fn has_validator(&self) -> bool {
        self.local_schema_location.is_some() && self.kind != SchemaKind::Text
    }
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    schemas: Vec<SchemaDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SchemaDescriptor {
    id: String,
    kind: SchemaKind,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    schema_location: Option<String>,
    #[serde(default)]
    local_schema_location: Option<PathBuf>,
    #[serde(default)]
    transforms: BTreeMap<String, TransformDescriptor>,
    #[serde(default)]
    providers: BTreeMap<MetadataKind, ProviderRef>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TransformDescriptor {
    Builtin { name: String },
    Stylesheet { path: PathBuf },
}

/// A descriptor that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSchema {
    pub id: String,
    pub reason: String,
}

/// Result of a tolerant load: the usable registry plus what was left out.
#[derive(Debug)]
pub struct PartialLoad {
    pub registry: SchemaRegistry,
    pub rejected: Vec<RejectedSchema>,
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    base_dir: PathBuf,
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Load every descriptor, failing on the first broken one.
    pub fn load(dir: &Path) -> Result<Self> {
        let PartialLoad { registry, rejected } = Self::load_partial(dir)?;
        if let Some(first) = rejected.into_iter().next() {
            return Err(IgsnError::Configuration(format!(
                "schema '{}': {}",
                first.id, first.reason
            )));
        }
        Ok(registry)
    }

    /// Load every well-formed descriptor and report the rest. A missing or
    /// unparseable descriptor file is still an error.
    pub fn load_partial(dir: &Path) -> Result<PartialLoad> {
        let file = dir.join(DESCRIPTOR_FILE);
        let text = std::fs::read_to_string(&file).map_err(|e| {
            IgsnError::Configuration(format!("cannot read {}: {e}", file.display()))
        })?;
        Self::from_yaml(&text, dir)
    }

    /// Build from descriptor YAML with paths resolved against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<PartialLoad> {
        let descriptors: DescriptorFile = serde_yaml::from_str(text)
            .map_err(|e| IgsnError::Configuration(format!("invalid schema descriptors: {e}")))?;

        let known: BTreeSet<&str> = descriptors.schemas.iter().map(|d| d.id.as_str()).collect();
        let mut registry = SchemaRegistry {
            base_dir: base_dir.to_path_buf(),
            schemas: BTreeMap::new(),
        };
        let mut rejected = Vec::new();

        for descriptor in &descriptors.schemas {
            if registry.schemas.contains_key(&descriptor.id) {
                rejected.push(RejectedSchema {
                    id: descriptor.id.clone(),
                    reason: "duplicate schema id".to_string(),
                });
                continue;
            }
            match build_schema(descriptor, base_dir, &known) {
                Ok(schema) => {
                    registry
                        .schemas
                        .insert(schema.id.clone(), Arc::new(schema));
                }
                Err(reason) => {
                    warn!(schema = %descriptor.id, %reason, "Rejected schema descriptor");
                    rejected.push(RejectedSchema {
                        id: descriptor.id.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            dir = %base_dir.display(),
            loaded = registry.schemas.len(),
            rejected = rejected.len(),
            "Schema registry loaded"
        );
        Ok(PartialLoad { registry, rejected })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn get(&self, id: &str) -> Result<Arc<Schema>> {
        self.schemas
            .get(id)
            .cloned()
            .ok_or_else(|| IgsnError::not_found("schema", id))
    }

    pub fn supports(&self, id: &str) -> bool {
        self.schemas.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn resolve_transform(&self, from: &str, to: &str) -> Result<TransformerRef> {
        self.get(from)?
            .transforms
            .get(to)
            .cloned()
            .ok_or_else(|| IgsnError::TransformerNotFound {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    pub fn resolve_provider(&self, schema: &str, kind: MetadataKind) -> Result<ProviderRef> {
        self.get(schema)?
            .providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| IgsnError::not_found("provider", format!("{schema}/{kind}")))
    }
}

fn build_schema(
    descriptor: &SchemaDescriptor,
    base_dir: &Path,
    known: &BTreeSet<&str>,
) -> std::result::Result<Schema, String> {
    let local_schema_location = match &descriptor.local_schema_location {
        Some(relative) => {
            let path = base_dir.join(relative);
            if !path.is_file() {
                return Err(format!("local schema file {} does not exist", path.display()));
            }
            Some(path)
        }
        None => None,
    };

    let mut transforms = BTreeMap::new();
    for (target, transform) in &descriptor.transforms {
        if !known.contains(target.as_str()) {
            return Err(format!("transform target '{target}' is not a declared schema"));
        }
        let resolved = match transform {
            TransformDescriptor::Builtin { name } => TransformerRef::Builtin(
                BuiltinTransform::from_name(name)
                    .ok_or_else(|| format!("unknown builtin transformer '{name}'"))?,
            ),
            TransformDescriptor::Stylesheet { path } => {
                let sheet = Stylesheet::from_file(&base_dir.join(path)).map_err(|e| e.to_string())?;
                TransformerRef::Stylesheet(Arc::new(sheet))
            }
        };
        transforms.insert(target.clone(), resolved);
    }

    for (kind, provider) in &descriptor.providers {
        if let ProviderRef::Xpath { path, .. } = provider {
            if !path.starts_with('/') {
                return Err(format!("{kind} provider path '{path}' must be absolute"));
            }
        }
    }

    Ok(Schema {
        id: descriptor.id.clone(),
        kind: descriptor.kind,
        namespace: descriptor.namespace.clone(),
        schema_location: descriptor.schema_location.clone(),
        local_schema_location,
        transforms,
        providers: descriptor.providers.clone(),
    })
}

/// Schemas shipped with the crate.
pub fn bundled_schemas_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("resources/schemas")
}
