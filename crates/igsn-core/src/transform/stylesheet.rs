//! Declarative mapping stylesheets.
//!
//! A stylesheet is a YAML document describing the output root element and an
//! ordered list of rules. Each rule emits zero or more child elements whose
//! text comes from a path over the input, a transform parameter, or a literal:
//!
//! ```yaml
//! root: oai_dc:dc
//! namespaces:
//!   oai_dc: http://www.openarchives.org/OAI/2.0/oai_dc/
//!   dc: http://purl.org/dc/elements/1.1/
//! rules:
//!   - element: dc:identifier
//!     select: /resources/resource/resourceIdentifier
//!     required: true
//!   - element: dc:publisher
//!     param: registrant_name
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::TransformParams;
use crate::error::{IgsnError, Result};
use crate::xml::{XmlDocument, XmlElement};

#[derive(Debug, Clone, Deserialize)]
pub struct Stylesheet {
    pub root: String,
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub element: String,
    #[serde(default)]
    pub select: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl Stylesheet {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IgsnError::Configuration(format!("cannot read stylesheet {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text).map_err(|e| match e {
            IgsnError::Configuration(msg) => {
                IgsnError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let sheet: Stylesheet = serde_yaml::from_str(text)
            .map_err(|e| IgsnError::Configuration(format!("invalid stylesheet: {e}")))?;
        sheet.check()?;
        Ok(sheet)
    }

    fn check(&self) -> Result<()> {
        self.check_prefix(&self.root)?;
        for rule in &self.rules {
            self.check_prefix(&rule.element)?;
            let sources = [&rule.select, &rule.param, &rule.value]
                .iter()
                .filter(|s| s.is_some())
                .count();
            if sources != 1 {
                return Err(IgsnError::Configuration(format!(
                    "rule for <{}> must have exactly one of select, param or value",
                    rule.element
                )));
            }
        }
        Ok(())
    }

    fn check_prefix(&self, name: &str) -> Result<()> {
        match name.split_once(':') {
            Some((prefix, _)) if !self.namespaces.contains_key(prefix) => {
                Err(IgsnError::Configuration(format!(
                    "element <{name}> uses undeclared prefix '{prefix}'"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply the rules to `input`. Fails without partial output.
    pub fn apply(
        &self,
        input: &XmlDocument,
        params: &TransformParams,
    ) -> std::result::Result<XmlDocument, String> {
        let mut root = XmlElement::new(self.root.as_str());
        for (prefix, uri) in &self.namespaces {
            root = root.with_attribute(format!("xmlns:{prefix}"), uri.as_str());
        }
        for (name, value) in &self.attributes {
            root = root.with_attribute(name.as_str(), value.as_str());
        }

        for rule in &self.rules {
            let values = self.values_for(rule, input, params);
            if values.is_empty() && rule.required {
                return Err(format!("no value for required element <{}>", rule.element));
            }
            for value in values {
                let text = match &rule.prefix {
                    Some(prefix) => format!("{prefix}{value}"),
                    None => value,
                };
                root.push_child(XmlElement::new(rule.element.as_str()).with_text(text));
            }
        }
        Ok(XmlDocument::new(root))
    }

    fn values_for(&self, rule: &Rule, input: &XmlDocument, params: &TransformParams) -> Vec<String> {
        let values = if let Some(path) = &rule.select {
            input.select_values(path)
        } else if let Some(name) = &rule.param {
            params.lookup(name).into_iter().collect()
        } else {
            rule.value.iter().cloned().collect()
        };
        values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }
}
