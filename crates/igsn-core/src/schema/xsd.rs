//! XML Schema subset: compile an XSD document once, validate many instances.
//!
//! Supported constructs: global and local elements, element refs, named and
//! anonymous complex/simple types, `sequence`/`choice`/`all` with occurrence
//! bounds, `any`, attributes (`use="required"`, `anyAttribute`),
//! `simpleContent` and `complexContent` derivation, `mixed` content,
//! `list`/`union` simple types and the `enumeration`, `pattern`,
//! `length`, `minLength` and `maxLength` facets. Other facets are parsed and
//! not enforced. Content models are matched greedily without backtracking,
//! which is exact for deterministic (UPA-conforming) schemas.
//!
//! Error messages follow the `cvc-*` wording of the common Java validators
//! so that operators can search for them.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use thiserror::Error;

use crate::xml::{XmlDocument, XmlElement, XmlError};

const MAX_DERIVATION_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum XsdError {
    #[error("cannot read schema {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("schema document is not well-formed: {0}")]
    Xml(#[from] XmlError),

    #[error("unsupported schema construct: {0}")]
    Unsupported(String),

    #[error("invalid pattern facet '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

type MaxOccurs = Option<u32>;

#[derive(Debug, Clone)]
struct Particle {
    term: Term,
    min: u32,
    max: MaxOccurs,
}

#[derive(Debug, Clone)]
enum Term {
    Element(Box<ElementDecl>),
    Ref(String),
    Sequence(Vec<Particle>),
    Choice(Vec<Particle>),
    All(Vec<Particle>),
    Any,
}

#[derive(Debug, Clone)]
struct ElementDecl {
    name: String,
    type_ref: TypeRef,
}

#[derive(Debug, Clone)]
enum TypeRef {
    Named(String),
    Complex(Box<ComplexType>),
    Simple(Box<SimpleType>),
    AnyType,
}

#[derive(Debug, Clone, Default)]
struct ComplexType {
    /// `complexContent/extension` base, resolved at validation time.
    base: Option<String>,
    mixed: bool,
    content: Content,
    attributes: Vec<AttributeDecl>,
    any_attribute: bool,
}

#[derive(Debug, Clone, Default)]
enum Content {
    #[default]
    Empty,
    Elements(Particle),
    Simple(TypeRef),
}

#[derive(Debug, Clone)]
struct AttributeDecl {
    name: String,
    type_ref: TypeRef,
    required: bool,
}

#[derive(Debug, Clone)]
enum SimpleType {
    Restriction { base: TypeRef, facets: Facets },
    List(TypeRef),
    Union(Vec<TypeRef>),
}

#[derive(Debug, Clone, Default)]
struct Facets {
    enumeration: Vec<String>,
    patterns: Vec<(String, Regex)>,
    min_length: Option<usize>,
    max_length: Option<usize>,
}

/// A compiled schema. Immutable and cheap to share behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct XsdSchema {
    target_namespace: Option<String>,
    elements: HashMap<String, ElementDecl>,
    complex_types: HashMap<String, ComplexType>,
    simple_types: HashMap<String, SimpleType>,
}

impl XsdSchema {
    /// Read and compile a schema file, following `xs:include` relative to it.
    pub fn from_file(path: &Path) -> Result<Self, XsdError> {
        let mut schema = Self::default();
        schema.include_file(path, 0)?;
        Ok(schema)
    }

    pub fn compile(doc: &XmlDocument) -> Result<Self, XsdError> {
        let mut schema = Self::default();
        schema.compile_into(doc, None, 0)?;
        Ok(schema)
    }

    pub fn target_namespace(&self) -> Option<&str> {
        self.target_namespace.as_deref()
    }

    fn include_file(&mut self, path: &Path, depth: usize) -> Result<(), XsdError> {
        let bytes = std::fs::read(path).map_err(|source| XsdError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let doc = XmlDocument::parse(&bytes)?;
        self.compile_into(&doc, path.parent(), depth)
    }

    fn compile_into(
        &mut self,
        doc: &XmlDocument,
        base_dir: Option<&Path>,
        depth: usize,
    ) -> Result<(), XsdError> {
        let root = &doc.root;
        if root.local_name() != "schema" {
            return Err(XsdError::Unsupported(format!(
                "document element is <{}>, expected <schema>",
                root.name
            )));
        }
        if depth == 0 {
            self.target_namespace = root.attribute("targetNamespace").map(str::to_string);
        }

        for child in root.child_elements() {
            match child.local_name() {
                "element" => {
                    let decl = compile_element(child)?;
                    self.elements.insert(decl.name.clone(), decl);
                }
                "complexType" => {
                    let name = required_attr(child, "name")?;
                    self.complex_types
                        .insert(name.to_string(), compile_complex(child)?);
                }
                "simpleType" => {
                    let name = required_attr(child, "name")?;
                    self.simple_types
                        .insert(name.to_string(), compile_simple(child)?);
                }
                "include" => {
                    let (Some(dir), Some(location)) = (base_dir, child.attribute("schemaLocation"))
                    else {
                        continue;
                    };
                    if depth >= MAX_DERIVATION_DEPTH {
                        return Err(XsdError::Unsupported(format!(
                            "include nesting too deep at {location}"
                        )));
                    }
                    self.include_file(&dir.join(location), depth + 1)?;
                }
                "annotation" | "import" | "attribute" | "notation" => {}
                other => {
                    return Err(XsdError::Unsupported(format!(
                        "top-level <{other}> is not supported"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Validate an instance document. The error is a single human-readable
    /// message prefixed with the path of the offending element.
    pub fn validate(&self, doc: &XmlDocument) -> Result<(), String> {
        let root = &doc.root;
        let decl = self
            .elements
            .get(root.local_name())
            .filter(|_| root.namespace.as_deref() == self.target_namespace.as_deref())
            .ok_or_else(|| {
                format!(
                    "cvc-elt.1.a: Cannot find the declaration of element '{}'.",
                    root.name
                )
            })?;
        self.validate_element(root, &decl.type_ref, &format!("/{}", root.local_name()))
    }

    // ─── Type resolution ──────────────────────────────────────

    fn resolve<'a>(&'a self, type_ref: &'a TypeRef) -> Result<Resolved<'a>, String> {
        match type_ref {
            TypeRef::AnyType => Ok(Resolved::AnyType),
            TypeRef::Complex(ct) => Ok(Resolved::Complex(ct)),
            TypeRef::Simple(st) => Ok(Resolved::Simple(st)),
            TypeRef::Named(qname) => self.resolve_named(qname),
        }
    }

    fn resolve_named<'a>(&'a self, qname: &'a str) -> Result<Resolved<'a>, String> {
        let (prefix, local) = match qname.split_once(':') {
            Some((p, l)) => (Some(p), l),
            None => (None, qname),
        };
        let builtin_prefix = matches!(prefix, Some("xs") | Some("xsd"));
        if !builtin_prefix {
            if let Some(ct) = self.complex_types.get(local) {
                return Ok(Resolved::Complex(ct));
            }
            if let Some(st) = self.simple_types.get(local) {
                return Ok(Resolved::Simple(st));
            }
        }
        if local == "anyType" {
            return Ok(Resolved::AnyType);
        }
        if is_builtin(local) {
            return Ok(Resolved::Builtin(local));
        }
        Err(format!(
            "src-resolve: Cannot resolve the name '{qname}' to a(n) 'type definition' component."
        ))
    }

    fn effective<'a>(&'a self, ct: &'a ComplexType, depth: usize) -> Result<Effective<'a>, String> {
        let mut eff = Effective::default();
        if let Some(base) = &ct.base {
            if depth >= MAX_DERIVATION_DEPTH {
                return Err(format!("type derivation from '{base}' is too deep"));
            }
            match self.resolve_named(base)? {
                Resolved::Complex(base_type) => eff = self.effective(base_type, depth + 1)?,
                Resolved::AnyType => eff.any_content = true,
                _ => {
                    return Err(format!(
                        "complexContent base '{base}' is not a complex type"
                    ))
                }
            }
        }
        match &ct.content {
            Content::Empty => {}
            Content::Elements(p) => eff.particles.push(p),
            Content::Simple(t) => eff.simple = Some(t),
        }
        eff.attributes.extend(ct.attributes.iter());
        eff.any_attribute |= ct.any_attribute;
        eff.mixed |= ct.mixed;
        Ok(eff)
    }

    // ─── Instance validation ──────────────────────────────────

    fn validate_element(
        &self,
        el: &XmlElement,
        type_ref: &TypeRef,
        path: &str,
    ) -> Result<(), String> {
        match self.resolve(type_ref).map_err(|m| format!("{path}: {m}"))? {
            Resolved::AnyType => Ok(()),
            Resolved::Complex(ct) => self.validate_complex(el, ct, path),
            simple => {
                if el.child_elements().next().is_some() {
                    return Err(format!(
                        "{path}: cvc-type.3.1.2: Element '{}' is a simple type, so it must have no element information item [children].",
                        el.name
                    ));
                }
                self.check_resolved(simple, &el.text())
                    .map_err(|m| format!("{path}: {m}"))
            }
        }
    }

    fn validate_complex(&self, el: &XmlElement, ct: &ComplexType, path: &str) -> Result<(), String> {
        let eff = self.effective(ct, 0).map_err(|m| format!("{path}: {m}"))?;
        if eff.any_content {
            return Ok(());
        }

        for decl in &eff.attributes {
            match el.attribute(&decl.name) {
                None if decl.required => {
                    return Err(format!(
                        "{path}: cvc-complex-type.4: Attribute '{}' must appear on element '{}'.",
                        decl.name, el.name
                    ))
                }
                None => {}
                Some(value) => self
                    .check_simple(&decl.type_ref, value)
                    .map_err(|m| format!("{path}/@{}: {m}", decl.name))?,
            }
        }
        if !eff.any_attribute {
            for (key, _) in el.plain_attributes() {
                if matches!(key.split_once(':'), Some(("xsi", _)) | Some(("xml", _))) {
                    continue;
                }
                let local = key.split_once(':').map(|(_, l)| l).unwrap_or(key);
                if !eff.attributes.iter().any(|d| d.name == local) {
                    return Err(format!(
                        "{path}: cvc-complex-type.3.2.2: Attribute '{key}' is not allowed to appear in element '{}'.",
                        el.name
                    ));
                }
            }
        }

        let children: Vec<&XmlElement> = el.child_elements().collect();

        if let Some(simple) = eff.simple {
            if !children.is_empty() {
                return Err(format!(
                    "{path}: cvc-complex-type.2.2: Element '{}' must have no element [children], and the value must be valid.",
                    el.name
                ));
            }
            return self
                .check_simple(simple, &el.text())
                .map_err(|m| format!("{path}: {m}"));
        }

        if eff.particles.is_empty() {
            if !children.is_empty() || (el.has_text() && !eff.mixed) {
                return Err(format!(
                    "{path}: cvc-complex-type.2.1: Element '{}' must have no character or element information item [children], because the type's content type is empty.",
                    el.name
                ));
            }
            return Ok(());
        }

        if el.has_text() && !eff.mixed {
            return Err(format!(
                "{path}: cvc-complex-type.2.3: Element '{}' cannot have character [children], because the type's content type is element-only.",
                el.name
            ));
        }

        match self.match_sequence(eff.particles.iter().copied(), &children, 0, path) {
            Ok((pos, open)) => match children.get(pos) {
                None => Ok(()),
                Some(extra) => Err(format!("{path}: {}", unexpected(extra, &open))),
            },
            Err(MatchError::Mismatch { at, expected }) => match children.get(at) {
                Some(child) => Err(format!("{path}: {}", unexpected(child, &expected))),
                None => Err(format!(
                    "{path}: cvc-complex-type.2.4.b: The content of element '{}' is not complete. One of '{{{}}}' is expected.",
                    el.name,
                    expected.join(", ")
                )),
            },
            Err(MatchError::Invalid(message)) => Err(message),
        }
    }

    // ─── Content model matching ───────────────────────────────

    fn match_sequence<'p>(
        &self,
        items: impl IntoIterator<Item = &'p Particle>,
        children: &[&XmlElement],
        pos: usize,
        path: &str,
    ) -> MatchResult {
        let mut cur = pos;
        let mut open: Vec<String> = Vec::new();
        for item in items {
            match self.match_occurs(item, children, cur, path) {
                Ok((next, item_open)) => {
                    if next > cur {
                        open = item_open;
                    } else {
                        merge(&mut open, item_open);
                    }
                    cur = next;
                }
                Err(MatchError::Mismatch { at, expected }) => {
                    let mut all = if at == cur { open } else { Vec::new() };
                    merge(&mut all, expected);
                    return Err(MatchError::Mismatch { at, expected: all });
                }
                Err(invalid) => return Err(invalid),
            }
        }
        Ok((cur, open))
    }

    fn match_occurs(
        &self,
        particle: &Particle,
        children: &[&XmlElement],
        pos: usize,
        path: &str,
    ) -> MatchResult {
        let mut count = 0u32;
        let mut cur = pos;
        let mut open = Vec::new();
        loop {
            if particle.max.is_some_and(|max| count >= max) {
                break;
            }
            match self.match_term(&particle.term, children, cur, path) {
                Ok((next, term_open)) => {
                    count += 1;
                    let advanced = next > cur;
                    cur = next;
                    open = term_open;
                    if !advanced {
                        count = count.max(particle.min);
                        break;
                    }
                }
                Err(MatchError::Mismatch { at, .. }) if count >= particle.min && at == cur => break,
                Err(e) => return Err(e),
            }
        }
        if particle.max.map_or(true, |max| count < max) {
            merge(&mut open, self.first_names(&particle.term));
        }
        Ok((cur, open))
    }

    fn match_term(
        &self,
        term: &Term,
        children: &[&XmlElement],
        pos: usize,
        path: &str,
    ) -> MatchResult {
        match term {
            Term::Element(decl) => self.match_element(&decl.name, &decl.type_ref, children, pos, path),
            Term::Ref(name) => {
                let decl = self.elements.get(name).ok_or_else(|| {
                    MatchError::Invalid(format!(
                        "{path}: src-resolve: Cannot resolve the name '{name}' to a(n) 'element declaration' component."
                    ))
                })?;
                self.match_element(&decl.name, &decl.type_ref, children, pos, path)
            }
            Term::Any => {
                if pos < children.len() {
                    Ok((pos + 1, Vec::new()))
                } else {
                    Err(MatchError::Mismatch {
                        at: pos,
                        expected: Vec::new(),
                    })
                }
            }
            Term::Sequence(items) => self.match_sequence(items.iter(), children, pos, path),
            Term::Choice(items) => {
                let mut expected = Vec::new();
                let mut empty_match: Option<Vec<String>> = None;
                for item in items {
                    match self.match_occurs(item, children, pos, path) {
                        Ok((next, open)) if next > pos => return Ok((next, open)),
                        Ok((_, open)) => merge(empty_match.get_or_insert_with(Vec::new), open),
                        Err(MatchError::Mismatch { at, expected: e }) if at == pos => {
                            merge(&mut expected, e)
                        }
                        Err(e) => return Err(e),
                    }
                }
                match empty_match {
                    Some(mut open) => {
                        merge(&mut open, expected);
                        Ok((pos, open))
                    }
                    None => Err(MatchError::Mismatch { at: pos, expected }),
                }
            }
            Term::All(items) => {
                let mut matched = vec![false; items.len()];
                let mut cur = pos;
                'children: while cur < children.len() {
                    for (i, item) in items.iter().enumerate() {
                        if matched[i] {
                            continue;
                        }
                        match self.match_occurs(item, children, cur, path) {
                            Ok((next, _)) if next > cur => {
                                matched[i] = true;
                                cur = next;
                                continue 'children;
                            }
                            Ok(_) => {}
                            Err(MatchError::Mismatch { at, .. }) if at == cur => {}
                            Err(e) => return Err(e),
                        }
                    }
                    break;
                }
                let mut missing = Vec::new();
                let mut open = Vec::new();
                for (item, done) in items.iter().zip(&matched) {
                    if *done {
                        continue;
                    }
                    if !self.nullable(item) {
                        merge(&mut missing, self.first_names(&item.term));
                    }
                    merge(&mut open, self.first_names(&item.term));
                }
                if !missing.is_empty() {
                    return Err(MatchError::Mismatch {
                        at: cur,
                        expected: missing,
                    });
                }
                Ok((cur, open))
            }
        }
    }

    fn match_element(
        &self,
        name: &str,
        type_ref: &TypeRef,
        children: &[&XmlElement],
        pos: usize,
        path: &str,
    ) -> MatchResult {
        match children.get(pos) {
            Some(child) if child.local_name() == name => {
                self.validate_element(child, type_ref, &format!("{path}/{name}"))
                    .map_err(MatchError::Invalid)?;
                Ok((pos + 1, Vec::new()))
            }
            _ => Err(MatchError::Mismatch {
                at: pos,
                expected: vec![name.to_string()],
            }),
        }
    }

    fn first_names(&self, term: &Term) -> Vec<String> {
        match term {
            Term::Element(decl) => vec![decl.name.clone()],
            Term::Ref(name) => vec![name.clone()],
            Term::Any => Vec::new(),
            Term::Sequence(items) => {
                let mut names = Vec::new();
                for item in items {
                    merge(&mut names, self.first_names(&item.term));
                    if !self.nullable(item) {
                        break;
                    }
                }
                names
            }
            Term::Choice(items) | Term::All(items) => {
                let mut names = Vec::new();
                for item in items {
                    merge(&mut names, self.first_names(&item.term));
                }
                names
            }
        }
    }

    fn nullable(&self, particle: &Particle) -> bool {
        if particle.min == 0 {
            return true;
        }
        match &particle.term {
            Term::Element(_) | Term::Ref(_) | Term::Any => false,
            Term::Sequence(items) | Term::All(items) => items.iter().all(|p| self.nullable(p)),
            Term::Choice(items) => items.iter().any(|p| self.nullable(p)),
        }
    }

    // ─── Simple values ────────────────────────────────────────

    fn check_simple(&self, type_ref: &TypeRef, value: &str) -> Result<(), String> {
        let resolved = self.resolve(type_ref)?;
        self.check_resolved(resolved, value)
    }

    fn check_resolved(&self, resolved: Resolved<'_>, value: &str) -> Result<(), String> {
        match resolved {
            Resolved::AnyType => Ok(()),
            Resolved::Builtin(name) => check_builtin(name, value),
            Resolved::Complex(ct) => match &ct.content {
                Content::Simple(inner) => self.check_simple(inner, value),
                _ => Err(format!("value '{value}' cannot be checked against a complex type")),
            },
            Resolved::Simple(SimpleType::Restriction { base, facets }) => {
                self.check_simple(base, value)?;
                facets.check(value.trim())
            }
            Resolved::Simple(SimpleType::List(item)) => value
                .split_whitespace()
                .try_for_each(|token| self.check_simple(item, token)),
            Resolved::Simple(SimpleType::Union(members)) => {
                if members.iter().any(|m| self.check_simple(m, value).is_ok()) {
                    Ok(())
                } else {
                    Err(format!(
                        "cvc-datatype-valid.1.2.3: '{value}' is not a valid value of union type."
                    ))
                }
            }
        }
    }
}

enum Resolved<'a> {
    AnyType,
    Builtin(&'a str),
    Simple(&'a SimpleType),
    Complex(&'a ComplexType),
}

#[derive(Default)]
struct Effective<'a> {
    particles: Vec<&'a Particle>,
    attributes: Vec<&'a AttributeDecl>,
    simple: Option<&'a TypeRef>,
    any_attribute: bool,
    any_content: bool,
    mixed: bool,
}

enum MatchError {
    Mismatch { at: usize, expected: Vec<String> },
    Invalid(String),
}

type MatchResult = Result<(usize, Vec<String>), MatchError>;

fn merge(into: &mut Vec<String>, names: Vec<String>) {
    for name in names {
        if !into.contains(&name) {
            into.push(name);
        }
    }
}

fn unexpected(child: &XmlElement, expected: &[String]) -> String {
    if expected.is_empty() {
        format!(
            "cvc-complex-type.2.4.d: Invalid content was found starting with element '{}'. No child element is expected at this point.",
            child.name
        )
    } else {
        format!(
            "cvc-complex-type.2.4.a: Invalid content was found starting with element '{}'. One of '{{{}}}' is expected.",
            child.name,
            expected.join(", ")
        )
    }
}

impl Facets {
    fn check(&self, value: &str) -> Result<(), String> {
        if !self.enumeration.is_empty() && !self.enumeration.iter().any(|e| e == value) {
            return Err(format!(
                "cvc-enumeration-valid: Value '{value}' is not facet-valid with respect to enumeration '[{}]'. It must be a value from the enumeration.",
                self.enumeration.join(", ")
            ));
        }
        for (source, regex) in &self.patterns {
            if !regex.is_match(value) {
                return Err(format!(
                    "cvc-pattern-valid: Value '{value}' is not facet-valid with respect to pattern '{source}'."
                ));
            }
        }
        let length = value.chars().count();
        if let Some(min) = self.min_length.filter(|min| length < *min) {
            return Err(format!(
                "cvc-minLength-valid: Value '{value}' with length = '{length}' is not facet-valid with respect to minLength '{min}'."
            ));
        }
        if let Some(max) = self.max_length.filter(|max| length > *max) {
            return Err(format!(
                "cvc-maxLength-valid: Value '{value}' with length = '{length}' is not facet-valid with respect to maxLength '{max}'."
            ));
        }
        Ok(())
    }
}

// ─── Compilation ──────────────────────────────────────────────

fn required_attr<'a>(el: &'a XmlElement, name: &str) -> Result<&'a str, XsdError> {
    el.attribute(name).ok_or_else(|| {
        XsdError::Unsupported(format!("<{}> without '{name}' attribute", el.name))
    })
}

fn local_part(qname: &str) -> &str {
    qname.split_once(':').map(|(_, l)| l).unwrap_or(qname)
}

fn parse_occurs(el: &XmlElement) -> Result<(u32, MaxOccurs), XsdError> {
    let invalid = |attr: &str, value: &str| {
        XsdError::Unsupported(format!("{attr}='{value}' on <{}>", el.name))
    };
    let min = match el.attribute("minOccurs") {
        Some(v) => v.trim().parse().map_err(|_| invalid("minOccurs", v))?,
        None => 1,
    };
    let max = match el.attribute("maxOccurs") {
        Some("unbounded") => None,
        Some(v) => Some(v.trim().parse().map_err(|_| invalid("maxOccurs", v))?),
        None => Some(1),
    };
    Ok((min, max))
}

fn compile_element(el: &XmlElement) -> Result<ElementDecl, XsdError> {
    let name = required_attr(el, "name")?.to_string();
    let type_ref = if let Some(named) = el.attribute("type") {
        TypeRef::Named(named.to_string())
    } else if let Some(ct) = el.child("complexType") {
        TypeRef::Complex(Box::new(compile_complex(ct)?))
    } else if let Some(st) = el.child("simpleType") {
        TypeRef::Simple(Box::new(compile_simple(st)?))
    } else {
        TypeRef::AnyType
    };
    Ok(ElementDecl { name, type_ref })
}

fn compile_particle(el: &XmlElement) -> Result<Option<Particle>, XsdError> {
    let term = match el.local_name() {
        "element" => match el.attribute("ref") {
            Some(r) => Term::Ref(local_part(r).to_string()),
            None => Term::Element(Box::new(compile_element(el)?)),
        },
        "sequence" => Term::Sequence(compile_particles(el)?),
        "choice" => Term::Choice(compile_particles(el)?),
        "all" => Term::All(compile_particles(el)?),
        "any" => Term::Any,
        "annotation" => return Ok(None),
        other => {
            return Err(XsdError::Unsupported(format!(
                "<{other}> inside a content model"
            )))
        }
    };
    let (min, max) = parse_occurs(el)?;
    Ok(Some(Particle { term, min, max }))
}

fn compile_particles(el: &XmlElement) -> Result<Vec<Particle>, XsdError> {
    let mut particles = Vec::new();
    for child in el.child_elements() {
        if let Some(p) = compile_particle(child)? {
            particles.push(p);
        }
    }
    Ok(particles)
}

fn compile_attribute(el: &XmlElement) -> Result<AttributeDecl, XsdError> {
    let required = el.attribute("use") == Some("required");
    if let Some(r) = el.attribute("ref") {
        return Ok(AttributeDecl {
            name: local_part(r).to_string(),
            type_ref: TypeRef::AnyType,
            required,
        });
    }
    let name = required_attr(el, "name")?.to_string();
    let type_ref = if let Some(named) = el.attribute("type") {
        TypeRef::Named(named.to_string())
    } else if let Some(st) = el.child("simpleType") {
        TypeRef::Simple(Box::new(compile_simple(st)?))
    } else {
        TypeRef::Named("xs:string".to_string())
    };
    Ok(AttributeDecl {
        name,
        type_ref,
        required,
    })
}

fn compile_complex(el: &XmlElement) -> Result<ComplexType, XsdError> {
    let mut ty = ComplexType {
        mixed: el.attribute("mixed") == Some("true"),
        ..Default::default()
    };
    for child in el.child_elements() {
        match child.local_name() {
            "sequence" | "choice" | "all" => {
                if let Some(p) = compile_particle(child)? {
                    ty.content = Content::Elements(p);
                }
            }
            "attribute" => ty.attributes.push(compile_attribute(child)?),
            "anyAttribute" => ty.any_attribute = true,
            "simpleContent" => compile_simple_content(child, &mut ty)?,
            "complexContent" => compile_complex_content(child, &mut ty)?,
            "annotation" => {}
            other => {
                return Err(XsdError::Unsupported(format!(
                    "<{other}> inside complexType"
                )))
            }
        }
    }
    Ok(ty)
}

fn derivation(el: &XmlElement) -> Result<&XmlElement, XsdError> {
    el.child_elements()
        .find(|c| matches!(c.local_name(), "extension" | "restriction"))
        .ok_or_else(|| XsdError::Unsupported(format!("<{}> without derivation", el.name)))
}

fn compile_derived_members(derived: &XmlElement, ty: &mut ComplexType) -> Result<(), XsdError> {
    for member in derived.child_elements() {
        match member.local_name() {
            "attribute" => ty.attributes.push(compile_attribute(member)?),
            "anyAttribute" => ty.any_attribute = true,
            "sequence" | "choice" | "all" => {
                if let Some(p) = compile_particle(member)? {
                    ty.content = Content::Elements(p);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn compile_simple_content(el: &XmlElement, ty: &mut ComplexType) -> Result<(), XsdError> {
    let derived = derivation(el)?;
    let base = TypeRef::Named(required_attr(derived, "base")?.to_string());
    let facets = compile_facets(derived)?;
    ty.content = if derived.local_name() == "restriction" {
        Content::Simple(TypeRef::Simple(Box::new(SimpleType::Restriction { base, facets })))
    } else {
        Content::Simple(base)
    };
    compile_derived_members(derived, ty)
}

fn compile_complex_content(el: &XmlElement, ty: &mut ComplexType) -> Result<(), XsdError> {
    if el.attribute("mixed") == Some("true") {
        ty.mixed = true;
    }
    let derived = derivation(el)?;
    let base = required_attr(derived, "base")?;
    if derived.local_name() == "extension" {
        ty.base = Some(base.to_string());
    }
    compile_derived_members(derived, ty)
}

fn compile_simple(el: &XmlElement) -> Result<SimpleType, XsdError> {
    if let Some(restriction) = el.child("restriction") {
        let base = match restriction.attribute("base") {
            Some(b) => TypeRef::Named(b.to_string()),
            None => match restriction.child("simpleType") {
                Some(inline) => TypeRef::Simple(Box::new(compile_simple(inline)?)),
                None => TypeRef::Named("xs:anySimpleType".to_string()),
            },
        };
        return Ok(SimpleType::Restriction {
            base,
            facets: compile_facets(restriction)?,
        });
    }
    if let Some(list) = el.child("list") {
        let item = match list.attribute("itemType") {
            Some(t) => TypeRef::Named(t.to_string()),
            None => match list.child("simpleType") {
                Some(inline) => TypeRef::Simple(Box::new(compile_simple(inline)?)),
                None => TypeRef::Named("xs:string".to_string()),
            },
        };
        return Ok(SimpleType::List(item));
    }
    if let Some(union) = el.child("union") {
        let mut members: Vec<TypeRef> = union
            .attribute("memberTypes")
            .unwrap_or("")
            .split_whitespace()
            .map(|t| TypeRef::Named(t.to_string()))
            .collect();
        for inline in union.child_elements().filter(|c| c.local_name() == "simpleType") {
            members.push(TypeRef::Simple(Box::new(compile_simple(inline)?)));
        }
        return Ok(SimpleType::Union(members));
    }
    Err(XsdError::Unsupported(format!(
        "<{}> without restriction, list or union",
        el.name
    )))
}

fn compile_facets(el: &XmlElement) -> Result<Facets, XsdError> {
    let mut facets = Facets::default();
    for facet in el.child_elements() {
        let Some(value) = facet.attribute("value") else {
            continue;
        };
        let as_len = || {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| XsdError::Unsupported(format!("{}='{value}'", facet.name)))
        };
        match facet.local_name() {
            "enumeration" => facets.enumeration.push(value.to_string()),
            "pattern" => {
                let regex = Regex::new(&format!("^(?:{value})$")).map_err(|e| XsdError::Pattern {
                    pattern: value.to_string(),
                    reason: e.to_string(),
                })?;
                facets.patterns.push((value.to_string(), regex));
            }
            "minLength" => facets.min_length = Some(as_len()?),
            "maxLength" => facets.max_length = Some(as_len()?),
            "length" => {
                let length = as_len()?;
                facets.min_length = Some(length);
                facets.max_length = Some(length);
            }
            other => return Err(XsdError::Unsupported(format!("facet <{other}>"))),
        }
    }
    Ok(facets)
}

// ─── Builtin datatypes ────────────────────────────────────────

fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "anySimpleType"
            | "string"
            | "normalizedString"
            | "token"
            | "language"
            | "Name"
            | "NCName"
            | "NMTOKEN"
            | "NMTOKENS"
            | "ID"
            | "IDREF"
            | "QName"
            | "anyURI"
            | "boolean"
            | "decimal"
            | "integer"
            | "int"
            | "long"
            | "short"
            | "nonNegativeInteger"
            | "positiveInteger"
            | "double"
            | "float"
            | "date"
            | "dateTime"
            | "gYear"
    )
}

fn check_builtin(name: &str, raw: &str) -> Result<(), String> {
    let v = raw.trim();
    let ok = match name {
        "anySimpleType" | "string" | "normalizedString" | "token" | "anyURI" | "NMTOKENS" => true,
        "language" | "Name" | "NCName" | "NMTOKEN" | "ID" | "IDREF" | "QName" => {
            !v.is_empty() && !v.contains(char::is_whitespace)
        }
        "boolean" => matches!(v, "true" | "false" | "1" | "0"),
        "decimal" => is_decimal(v),
        "integer" | "int" | "long" | "short" => is_integer(v),
        "nonNegativeInteger" => v.parse::<i128>().is_ok_and(|n| n >= 0),
        "positiveInteger" => v.parse::<i128>().is_ok_and(|n| n > 0),
        "double" | "float" => matches!(v, "INF" | "-INF" | "NaN") || v.parse::<f64>().is_ok(),
        "date" => NaiveDate::parse_from_str(strip_timezone(v), "%Y-%m-%d").is_ok(),
        "dateTime" => {
            NaiveDateTime::parse_from_str(strip_timezone(v), "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        }
        "gYear" => {
            let year = strip_timezone(v);
            year.trim_start_matches('-').len() >= 4 && is_integer(year)
        }
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "cvc-datatype-valid.1.2.1: '{raw}' is not a valid value for '{name}'."
        ))
    }
}

fn is_integer(v: &str) -> bool {
    let digits = v.strip_prefix(['+', '-']).unwrap_or(v);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_decimal(v: &str) -> bool {
    let unsigned = v.strip_prefix(['+', '-']).unwrap_or(v);
    let (int, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    (!int.is_empty() || !frac.is_empty())
        && int.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}

fn strip_timezone(v: &str) -> &str {
    if let Some(stripped) = v.strip_suffix('Z') {
        return stripped;
    }
    let bytes = v.as_bytes();
    let n = bytes.len();
    if n > 6 && matches!(bytes[n - 6], b'+' | b'-') && bytes[n - 3] == b':' {
        return &v[..n - 6];
    }
    v
}
