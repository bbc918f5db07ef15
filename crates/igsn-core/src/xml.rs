//! Minimal XML document model built on `quick-xml`.
//!
//! Validators, providers and transformers all work on this tree. Parsing
//! resolves element namespaces; serialization is deterministic so that the
//! same tree always produces the same bytes.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting `parse_str` accepts. Tree walks are recursive.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("content is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("malformed XML: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `dc:title`.
    pub name: String,
    /// Resolved namespace URI, if any.
    pub namespace: Option<String>,
    /// Attributes in document order, including `xmlns` declarations.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(p, _)| p)
    }

    /// Look up an attribute by qualified name, falling back to local name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(k, _)| !is_namespace_decl(k) && local_part(k) == name)
            })
            .map(|(_, v)| v.as_str())
    }

    /// Attributes that are not namespace declarations.
    pub fn plain_attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .filter(|(k, _)| !is_namespace_decl(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn push_child(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.child_elements()
            .find(|e| e.local_name() == local_name)
    }

    pub fn has_text(&self) -> bool {
        self.children.iter().any(|c| match c {
            XmlNode::Text(t) => !t.trim().is_empty(),
            XmlNode::Element(_) => false,
        })
    }

    /// Concatenated text of this element and all descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    /// Evaluate a relative path (`a/b`, `a//c`, `*`) against this element.
    pub fn select(&self, path: &str) -> Vec<&XmlElement> {
        let steps = parse_steps(path);
        evaluate(vec![self], &steps)
    }

    fn descendants<'a>(&'a self, out: &mut Vec<&'a XmlElement>) {
        for child in self.child_elements() {
            out.push(child);
            child.descendants(out);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    pub root: XmlElement,
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self { root }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, XmlError> {
        let text = std::str::from_utf8(bytes).map_err(|e| XmlError::Encoding(e.to_string()))?;
        Self::parse_str(text)
    }

    pub fn parse_str(text: &str) -> Result<Self, XmlError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut scopes: Vec<Vec<(String, String)>> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                XmlError::Malformed(format!("{e} (at byte {})", reader.buffer_position()))
            })?;
            match event {
                Event::Start(start) => {
                    if stack.len() >= MAX_DEPTH {
                        return Err(too_deep());
                    }
                    let element = open_element(&start, &mut scopes)?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    if stack.len() >= MAX_DEPTH {
                        return Err(too_deep());
                    }
                    let element = open_element(&start, &mut scopes)?;
                    scopes.pop();
                    attach(element, &mut stack, &mut root)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        XmlError::Malformed("closing tag without matching opening tag".into())
                    })?;
                    scopes.pop();
                    attach(element, &mut stack, &mut root)?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| XmlError::Malformed(e.to_string()))?;
                    push_text(&mut stack, &text)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| XmlError::Encoding(e.to_string()))?;
                    push_text(&mut stack, &text)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(XmlError::Malformed(format!(
                "unexpected end of document: element <{}> is not closed",
                open.name
            )));
        }
        root.map(Self::new)
            .ok_or_else(|| XmlError::Malformed("document has no root element".into()))
    }

    /// Evaluate an absolute (`/a/b`), descendant (`//b`) or root-relative path.
    pub fn select(&self, path: &str) -> Vec<&XmlElement> {
        let steps = parse_steps(path);
        let Some((first, rest)) = steps.split_first() else {
            return vec![&self.root];
        };
        let mut candidates = vec![&self.root];
        if first.axis == Axis::Descendant {
            self.root.descendants(&mut candidates);
        }
        let context: Vec<&XmlElement> = candidates
            .into_iter()
            .filter(|e| first.matches(e))
            .collect();
        evaluate(context, rest)
    }

    /// Text values for a path; a trailing `@name` step selects attribute values.
    pub fn select_values(&self, path: &str) -> Vec<String> {
        match path.rsplit_once('/') {
            Some((elements, attr)) if attr.starts_with('@') => {
                let attr = &attr[1..];
                let elements = if elements.is_empty() || elements == "/" {
                    vec![&self.root]
                } else {
                    self.select(elements)
                };
                elements
                    .into_iter()
                    .filter_map(|e| e.attribute(attr).map(str::to_string))
                    .collect()
            }
            _ => self
                .select(path)
                .into_iter()
                .map(|e| e.text().trim().to_string())
                .collect(),
        }
    }

    /// One document per child element of the root, each keeping the root's
    /// name and attributes. Documents with a single child are returned as-is.
    pub fn split_root_children(&self) -> Vec<XmlDocument> {
        let children: Vec<&XmlElement> = self.root.child_elements().collect();
        if children.len() <= 1 {
            return vec![self.clone()];
        }
        children
            .into_iter()
            .map(|child| {
                let mut root = XmlElement {
                    name: self.root.name.clone(),
                    namespace: self.root.namespace.clone(),
                    attributes: self.root.attributes.clone(),
                    children: Vec::new(),
                };
                root.push_child(child.clone());
                XmlDocument::new(root)
            })
            .collect()
    }

    pub fn to_xml_string(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        write_element(&self.root, 0, &mut out);
        out.push('\n');
        out
    }
}

// ─── Parsing helpers ──────────────────────────────────────────

fn too_deep() -> XmlError {
    XmlError::Malformed(format!("elements nest deeper than {MAX_DEPTH} levels"))
}

fn open_element(
    start: &BytesStart<'_>,
    scopes: &mut Vec<Vec<(String, String)>>,
) -> Result<XmlElement, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    let mut declared = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Malformed(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            declared.push((String::new(), value.clone()));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.push((prefix.to_string(), value.clone()));
        }
        attributes.push((key, value));
    }
    scopes.push(declared);

    let prefix = name.split_once(':').map(|(p, _)| p).unwrap_or("");
    let namespace = resolve_prefix(scopes, prefix);
    if namespace.is_none() && !prefix.is_empty() {
        return Err(XmlError::Malformed(format!(
            "namespace prefix '{prefix}' on element <{name}> is not bound"
        )));
    }

    Ok(XmlElement {
        name,
        namespace,
        attributes,
        children: Vec::new(),
    })
}

fn resolve_prefix(scopes: &[Vec<(String, String)>], prefix: &str) -> Option<String> {
    if prefix == "xml" {
        return Some(XML_NAMESPACE.to_string());
    }
    scopes
        .iter()
        .rev()
        .flat_map(|scope| scope.iter())
        .find(|(p, _)| p == prefix)
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty())
}

fn attach(
    element: XmlElement,
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.push_child(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(XmlError::Malformed(format!(
            "multiple root elements: <{}> follows the document element",
            element.name
        )));
    }
    *root = Some(element);
    Ok(())
}

fn push_text(stack: &mut [XmlElement], text: &str) -> Result<(), XmlError> {
    let Some(parent) = stack.last_mut() else {
        if text.trim().is_empty() {
            return Ok(());
        }
        return Err(XmlError::Malformed(
            "text content outside the document element".into(),
        ));
    };
    if let Some(XmlNode::Text(existing)) = parent.children.last_mut() {
        existing.push_str(text);
    } else {
        parent.children.push(XmlNode::Text(text.to_string()));
    }
    Ok(())
}

fn collect_text(element: &XmlElement, out: &mut String) {
    for child in &element.children {
        match child {
            XmlNode::Text(t) => out.push_str(t),
            XmlNode::Element(e) => collect_text(e, out),
        }
    }
}

fn local_part(name: &str) -> &str {
    name.split_once(':').map(|(_, l)| l).unwrap_or(name)
}

fn is_namespace_decl(key: &str) -> bool {
    key == "xmlns" || key.starts_with("xmlns:")
}

// ─── Path evaluation ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone)]
struct Step<'p> {
    axis: Axis,
    name: &'p str,
}

impl Step<'_> {
    fn matches(&self, element: &XmlElement) -> bool {
        self.name == "*" || element.local_name() == local_part(self.name)
    }
}

fn parse_steps(path: &str) -> Vec<Step<'_>> {
    let mut steps = Vec::new();
    let mut rest = path.trim();
    while !rest.is_empty() {
        let axis = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            Axis::Descendant
        } else {
            rest = rest.strip_prefix('/').unwrap_or(rest);
            Axis::Child
        };
        let end = rest.find('/').unwrap_or(rest.len());
        let name = &rest[..end];
        if !name.is_empty() {
            steps.push(Step { axis, name });
        }
        rest = &rest[end..];
    }
    steps
}

fn evaluate<'a>(mut context: Vec<&'a XmlElement>, steps: &[Step<'_>]) -> Vec<&'a XmlElement> {
    for step in steps {
        let mut next: Vec<&'a XmlElement> = Vec::new();
        for element in &context {
            let mut candidates = Vec::new();
            match step.axis {
                Axis::Child => candidates.extend(element.child_elements()),
                Axis::Descendant => element.descendants(&mut candidates),
            }
            for candidate in candidates {
                if step.matches(candidate) && !next.iter().any(|e| std::ptr::eq(*e, candidate)) {
                    next.push(candidate);
                }
            }
        }
        context = next;
    }
    context
}

// ─── Serialization ────────────────────────────────────────────

fn write_element(element: &XmlElement, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    out.push_str(&indent);
    write_open_tag(element, out);

    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');

    let mixed = element
        .children
        .iter()
        .any(|c| matches!(c, XmlNode::Text(_)));
    if mixed {
        write_inline_children(element, out);
    } else {
        for child in element.child_elements() {
            out.push('\n');
            write_element(child, depth + 1, out);
        }
        out.push('\n');
        out.push_str(&indent);
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

fn write_inline_children(element: &XmlElement, out: &mut String) {
    for child in &element.children {
        match child {
            XmlNode::Text(t) => out.push_str(&escape(t.as_str())),
            XmlNode::Element(e) => {
                write_open_tag(e, out);
                if e.children.is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    write_inline_children(e, out);
                    out.push_str("</");
                    out.push_str(&e.name);
                    out.push('>');
                }
            }
        }
    }
}

fn write_open_tag(element: &XmlElement, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for (key, value) in &element.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<resources xmlns="https://identifiers.ardc.edu.au/schemas/ardc-igsn-desc">
  <resource registeredObjectType="http://example.org/PhysicalSample">
    <resourceIdentifier identifierType="IGSN">10273/XXAA001</resourceIdentifier>
    <resourceTitle>Basalt &amp; friends</resourceTitle>
  </resource>
  <resource registeredObjectType="http://example.org/PhysicalSample">
    <resourceIdentifier identifierType="IGSN">10273/XXAA002</resourceIdentifier>
    <resourceTitle>Granite</resourceTitle>
  </resource>
</resources>"#;

    #[test]
    fn parses_and_resolves_default_namespace() {
        let doc = XmlDocument::parse_str(SAMPLE).unwrap();
        assert_eq!(doc.root.local_name(), "resources");
        assert_eq!(
            doc.root.namespace.as_deref(),
            Some("https://identifiers.ardc.edu.au/schemas/ardc-igsn-desc")
        );
        let first = doc.root.child_elements().next().unwrap();
        assert_eq!(
            first.namespace.as_deref(),
            Some("https://identifiers.ardc.edu.au/schemas/ardc-igsn-desc")
        );
    }

    #[test]
    fn selects_absolute_and_descendant_paths() {
        let doc = XmlDocument::parse_str(SAMPLE).unwrap();
        assert_eq!(
            doc.select_values("/resources/resource/resourceIdentifier"),
            vec!["10273/XXAA001", "10273/XXAA002"]
        );
        assert_eq!(doc.select("//resourceTitle").len(), 2);
        assert_eq!(
            doc.select_values("/resources/resource/resourceIdentifier/@identifierType"),
            vec!["IGSN", "IGSN"]
        );
        assert!(doc.select("/other/resource").is_empty());
    }

    #[test]
    fn unescapes_text() {
        let doc = XmlDocument::parse_str(SAMPLE).unwrap();
        assert_eq!(doc.select_values("//resourceTitle")[0], "Basalt & friends");
    }

    #[test]
    fn rejects_unclosed_document() {
        let err = XmlDocument::parse_str("<a><b></b>").unwrap_err();
        assert!(err.to_string().contains("not closed"), "{err}");
    }

    #[test]
    fn rejects_mismatched_tags() {
        assert!(XmlDocument::parse_str("<a><b></a></b>").is_err());
    }

    #[test]
    fn rejects_unbound_prefix() {
        let err = XmlDocument::parse_str("<x:a/>").unwrap_err();
        assert!(err.to_string().contains("not bound"));
    }

    #[test]
    fn rejects_empty_and_text_only() {
        assert!(XmlDocument::parse_str("").is_err());
        assert!(XmlDocument::parse_str("just text").is_err());
    }

    #[test]
    fn serialization_is_stable() {
        let doc = XmlDocument::parse_str(SAMPLE).unwrap();
        let once = doc.to_xml_string();
        let twice = XmlDocument::parse_str(&once).unwrap().to_xml_string();
        assert_eq!(once, twice);
        assert!(once.contains("Basalt &amp; friends"));
    }

    #[test]
    fn splits_root_children() {
        let doc = XmlDocument::parse_str(SAMPLE).unwrap();
        let parts = doc.split_root_children();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1].select_values("/resources/resource/resourceIdentifier"),
            vec!["10273/XXAA002"]
        );
        assert_eq!(parts[0].root.attributes, doc.root.attributes);
    }

    #[test]
    fn builds_elements() {
        let doc = XmlDocument::new(
            XmlElement::new("sample")
                .with_attribute("xmlns", "urn:test")
                .with_child(XmlElement::new("sampleNumber").with_text("A<1>")),
        );
        assert_eq!(
            doc.to_xml_string(),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<sample xmlns=\"urn:test\">\n  <sampleNumber>A&lt;1&gt;</sampleNumber>\n</sample>\n"
        );
    }

    fn nested(depth: usize) -> String {
        format!("{}{}", "<a>".repeat(depth), "</a>".repeat(depth))
    }

    #[test]
    fn rejects_excessive_nesting() {
        let doc = XmlDocument::parse_str(&nested(MAX_DEPTH)).unwrap();
        assert_eq!(doc.to_xml_string().matches("<a>").count(), MAX_DEPTH - 1);

        let err = XmlDocument::parse_str(&nested(MAX_DEPTH + 1)).unwrap_err();
        assert!(matches!(err, XmlError::Malformed(ref m) if m.contains("deeper")), "{err}");

        let err = XmlDocument::parse_str(&nested(200_000)).unwrap_err();
        assert!(matches!(err, XmlError::Malformed(_)));
    }
}
