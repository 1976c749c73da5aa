//! Declaration reader for RelaxNG grammars in XML syntax.
//!
//! Patterns are kept as a tree whose `ref`s name entries of the define
//! table; walks over the tree carry a visited set so recursive definitions
//! terminate.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::entity::{EntityResolver, LocalEntityResolver, ReadSession};
use crate::error::{ContentModelError, Result};
use crate::model::{
    merge_particles, AttributeInfo, ChildParticle, DeclId, ElementInfo, GrammarKind,
    NativeGrammar,
};
use crate::provider::GrammarSource;

pub const RNG_NAMESPACE: &str = "http://relaxng.org/ns/structure/1.0";
const ANNOTATIONS_NAMESPACE: &str = "http://relaxng.org/ns/compatibility/annotations/1.0";

/// Key under which an overridden `start` is recorded while reading includes.
const START: &str = "#start";

#[derive(Debug, Clone)]
enum Pattern {
    Element(DeclId),
    Attribute(usize),
    Ref(String),
    Choice(Vec<Pattern>),
    Group(Vec<Pattern>),
    Optional(Box<Pattern>),
    OneOrMore(Box<Pattern>),
    Mixed(Box<Pattern>),
    Text,
    Data,
    Value(String),
    Empty,
    NotAllowed,
}

#[derive(Debug)]
struct RngElement {
    /// `None` for name classes such as `anyName`.
    name: Option<String>,
    namespace: Option<String>,
    content: Pattern,
    documentation: Option<String>,
}

#[derive(Debug)]
struct RngAttribute {
    name: Option<String>,
    namespace: Option<String>,
    content: Pattern,
    default: Option<String>,
    documentation: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ContentFlags {
    elements: bool,
    text: bool,
    data: bool,
    mixed: bool,
}

#[derive(Debug, Default)]
pub struct RelaxNgGrammar {
    elements: Vec<RngElement>,
    attributes: Vec<RngAttribute>,
    defines: HashMap<String, Pattern>,
    start: Option<Pattern>,
    files: Vec<PathBuf>,
}

impl RelaxNgGrammar {
    /// Returns `Ok(None)` if the main grammar is malformed.
    pub fn read(
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>> {
        let text = source.read_text()?;
        let mut grammar = RelaxNgGrammar::default();
        let mut session = ReadSession::new(entities, cancel);
        session.enter(source);

        let loaded = grammar.load(&text, source.uri(), &HashSet::new(), &mut session);
        grammar.files = session.into_files();
        match loaded {
            Ok(()) => Ok(Some(grammar)),
            Err(ContentModelError::Dom { uri, details }) => {
                warn!(
                    uri = uri.as_deref().unwrap_or_default(),
                    details = %details,
                    "Cannot read RelaxNG grammar"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn parse(text: &str, uri: &str) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut session = ReadSession::new(&LocalEntityResolver, &cancel);
        let mut grammar = RelaxNgGrammar::default();
        grammar.load(text, uri, &HashSet::new(), &mut session)?;
        grammar.files = session.into_files();
        Ok(grammar)
    }

    fn load(
        &mut self,
        text: &str,
        uri: &str,
        overridden: &HashSet<String>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let malformed = |details: String| ContentModelError::Dom {
            uri: Some(uri.to_string()),
            details,
        };
        let document = roxmltree::Document::parse(text).map_err(|e| malformed(e.to_string()))?;
        let root = document.root_element();
        if root.tag_name().namespace() != Some(RNG_NAMESPACE) {
            return Err(malformed("root element is not a RelaxNG pattern".to_string()));
        }

        if root.tag_name().name() == "grammar" {
            self.read_grammar_content(root, uri, overridden, session)
        } else {
            session.check()?;
            let pattern = self.read_pattern(root);
            self.start = Some(pattern);
            Ok(())
        }
    }

    fn read_grammar_content(
        &mut self,
        node: roxmltree::Node<'_, '_>,
        uri: &str,
        overridden: &HashSet<String>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        for child in rng_children(node) {
            session.check()?;
            match child.tag_name().name() {
                "start" => {
                    if !overridden.contains(START) {
                        let pattern = self.read_group(child);
                        self.start = Some(match self.start.take() {
                            Some(existing) => combine(existing, pattern, child.attribute("combine")),
                            None => pattern,
                        });
                    }
                }
                "define" => {
                    let Some(name) = child.attribute("name") else { continue };
                    if overridden.contains(name) {
                        continue;
                    }
                    let pattern = self.read_group(child);
                    let pattern = match self.defines.remove(name) {
                        Some(existing) => combine(existing, pattern, child.attribute("combine")),
                        None => pattern,
                    };
                    self.defines.insert(name.to_string(), pattern);
                }
                "div" => self.read_grammar_content(child, uri, overridden, session)?,
                "include" => self.include(child, uri, overridden, session)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Read the include's own definitions first; they replace those of the
    /// included grammar.
    fn include(
        &mut self,
        node: roxmltree::Node<'_, '_>,
        base_uri: &str,
        overridden: &HashSet<String>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let mut replaced = overridden.clone();
        for child in rng_children(node) {
            match child.tag_name().name() {
                "start" => {
                    replaced.insert(START.to_string());
                }
                "define" => {
                    if let Some(name) = child.attribute("name") {
                        replaced.insert(name.to_string());
                    }
                }
                _ => {}
            }
        }
        self.read_grammar_content(node, base_uri, overridden, session)?;

        let Some(href) = node.attribute("href") else {
            return Ok(());
        };
        let Some(nested) = session.open(Some(base_uri), None, Some(href))? else {
            return Ok(());
        };
        match self.load(&nested.text, &nested.uri, &replaced, session) {
            Err(e) if e.aborts_read() => Err(e),
            Err(e) => {
                warn!(location = %nested.uri, error = %e, "Skipping included grammar");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn read_group(&mut self, node: roxmltree::Node<'_, '_>) -> Pattern {
        let patterns: Vec<_> = rng_children(node).map(|c| self.read_pattern(c)).collect();
        group(patterns)
    }

    fn read_pattern(&mut self, node: roxmltree::Node<'_, '_>) -> Pattern {
        match node.tag_name().name() {
            "element" => {
                let (name, namespace, content_nodes) = name_class(node, true);
                let content = group(content_nodes.map(|c| self.read_pattern(c)).collect());
                self.elements.push(RngElement {
                    name,
                    namespace,
                    content,
                    documentation: annotation_documentation(node),
                });
                Pattern::Element(self.elements.len() - 1)
            }
            "attribute" => {
                let (name, namespace, content_nodes) = name_class(node, false);
                let patterns: Vec<_> = content_nodes.map(|c| self.read_pattern(c)).collect();
                let content = if patterns.is_empty() {
                    Pattern::Text
                } else {
                    group(patterns)
                };
                self.attributes.push(RngAttribute {
                    name,
                    namespace,
                    content,
                    default: node
                        .attribute((ANNOTATIONS_NAMESPACE, "defaultValue"))
                        .map(str::to_string),
                    documentation: annotation_documentation(node),
                });
                Pattern::Attribute(self.attributes.len() - 1)
            }
            "group" | "interleave" => self.read_group(node),
            "choice" => Pattern::Choice(rng_children(node).map(|c| self.read_pattern(c)).collect()),
            "optional" | "zeroOrMore" => Pattern::Optional(Box::new(self.read_group(node))),
            "oneOrMore" => Pattern::OneOrMore(Box::new(self.read_group(node))),
            "mixed" => Pattern::Mixed(Box::new(self.read_group(node))),
            "ref" | "parentRef" => node
                .attribute("name")
                .map(|name| Pattern::Ref(name.to_string()))
                .unwrap_or(Pattern::NotAllowed),
            "text" => Pattern::Text,
            "data" | "list" => Pattern::Data,
            "value" => Pattern::Value(node.text().unwrap_or_default().trim().to_string()),
            "empty" => Pattern::Empty,
            "externalRef" => {
                debug!(href = node.attribute("href").unwrap_or_default(), "externalRef is not followed");
                Pattern::NotAllowed
            }
            _ => Pattern::NotAllowed,
        }
    }

    fn collect_elements(
        &self,
        pattern: &Pattern,
        required: bool,
        visited: &mut HashSet<String>,
        out: &mut Vec<ChildParticle>,
    ) {
        match pattern {
            Pattern::Element(id) => {
                if self.elements[*id].name.is_some() {
                    out.push(ChildParticle {
                        element: *id,
                        required,
                    });
                }
            }
            Pattern::Ref(name) => {
                if visited.insert(name.clone()) {
                    if let Some(define) = self.defines.get(name) {
                        self.collect_elements(define, required, visited, out);
                    }
                    visited.remove(name);
                }
            }
            Pattern::Choice(items) => {
                let required = required && items.len() == 1;
                for item in items {
                    self.collect_elements(item, required, visited, out);
                }
            }
            Pattern::Group(items) => {
                for item in items {
                    self.collect_elements(item, required, visited, out);
                }
            }
            Pattern::Optional(inner) => self.collect_elements(inner, false, visited, out),
            Pattern::OneOrMore(inner) | Pattern::Mixed(inner) => {
                self.collect_elements(inner, required, visited, out)
            }
            _ => {}
        }
    }

    fn collect_attributes(
        &self,
        pattern: &Pattern,
        required: bool,
        visited: &mut HashSet<String>,
        out: &mut Vec<(usize, bool)>,
    ) {
        match pattern {
            Pattern::Attribute(index) => {
                if self.attributes[*index].name.is_some() && !out.iter().any(|(i, _)| i == index) {
                    out.push((*index, required));
                }
            }
            Pattern::Ref(name) => {
                if visited.insert(name.clone()) {
                    if let Some(define) = self.defines.get(name) {
                        self.collect_attributes(define, required, visited, out);
                    }
                    visited.remove(name);
                }
            }
            Pattern::Choice(items) => {
                let required = required && items.len() == 1;
                for item in items {
                    self.collect_attributes(item, required, visited, out);
                }
            }
            Pattern::Group(items) => {
                for item in items {
                    self.collect_attributes(item, required, visited, out);
                }
            }
            Pattern::Optional(inner) => self.collect_attributes(inner, false, visited, out),
            Pattern::OneOrMore(inner) | Pattern::Mixed(inner) => {
                self.collect_attributes(inner, required, visited, out)
            }
            _ => {}
        }
    }

    /// What an element's content may hold, not looking inside child
    /// elements or attributes.
    fn content_flags(&self, pattern: &Pattern, visited: &mut HashSet<String>, flags: &mut ContentFlags) {
        match pattern {
            Pattern::Element(_) => flags.elements = true,
            Pattern::Text => flags.text = true,
            Pattern::Data | Pattern::Value(_) => flags.data = true,
            Pattern::Mixed(inner) => {
                flags.mixed = true;
                flags.text = true;
                self.content_flags(inner, visited, flags);
            }
            Pattern::Ref(name) => {
                if visited.insert(name.clone()) {
                    if let Some(define) = self.defines.get(name) {
                        self.content_flags(define, visited, flags);
                    }
                    visited.remove(name);
                }
            }
            Pattern::Choice(items) | Pattern::Group(items) => {
                for item in items {
                    self.content_flags(item, visited, flags);
                }
            }
            Pattern::Optional(inner) | Pattern::OneOrMore(inner) => {
                self.content_flags(inner, visited, flags)
            }
            Pattern::Attribute(_) | Pattern::Empty | Pattern::NotAllowed => {}
        }
    }

    fn values(&self, pattern: &Pattern, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        match pattern {
            Pattern::Value(value) => {
                if !out.contains(value) {
                    out.push(value.clone());
                }
            }
            Pattern::Choice(items) => {
                for item in items {
                    self.values(item, visited, out);
                }
            }
            Pattern::Ref(name) => {
                if visited.insert(name.clone()) {
                    if let Some(define) = self.defines.get(name) {
                        self.values(define, visited, out);
                    }
                    visited.remove(name);
                }
            }
            _ => {}
        }
    }
}

impl NativeGrammar for RelaxNgGrammar {
    fn kind(&self) -> GrammarKind {
        GrammarKind::RelaxNg
    }

    fn target_namespaces(&self) -> Vec<String> {
        let mut namespaces = Vec::new();
        for namespace in self.elements.iter().filter_map(|e| e.namespace.as_ref()) {
            if !namespaces.contains(namespace) {
                namespaces.push(namespace.clone());
            }
        }
        namespaces
    }

    fn element_count(&self) -> usize {
        self.elements.len()
    }

    fn top_level_elements(&self) -> Vec<DeclId> {
        let mut out = Vec::new();
        if let Some(start) = &self.start {
            self.collect_elements(start, false, &mut HashSet::new(), &mut out);
        }
        merge_particles(out).into_iter().map(|p| p.element).collect()
    }

    fn element(&self, id: DeclId) -> ElementInfo {
        let element = &self.elements[id];
        let mut flags = ContentFlags::default();
        self.content_flags(&element.content, &mut HashSet::new(), &mut flags);
        let mut enumeration = Vec::new();
        self.values(&element.content, &mut HashSet::new(), &mut enumeration);

        ElementInfo {
            local_name: element.name.clone().unwrap_or_default(),
            namespace: element.namespace.clone(),
            is_empty: !flags.elements && !flags.text && !flags.data,
            is_mixed: flags.mixed || (flags.text && flags.elements),
            is_string_type: (flags.text || flags.data) && !flags.elements,
            is_nillable: false,
            enumeration,
        }
    }

    fn child_particles(&self, id: DeclId) -> Vec<ChildParticle> {
        let mut out = Vec::new();
        self.collect_elements(&self.elements[id].content, true, &mut HashSet::new(), &mut out);
        merge_particles(out)
    }

    fn attributes(&self, id: DeclId) -> Vec<AttributeInfo> {
        let mut found = Vec::new();
        self.collect_attributes(&self.elements[id].content, true, &mut HashSet::new(), &mut found);
        found
            .into_iter()
            .map(|(index, required)| {
                let attribute = &self.attributes[index];
                let mut enumeration = Vec::new();
                self.values(&attribute.content, &mut HashSet::new(), &mut enumeration);
                AttributeInfo {
                    local_name: attribute.name.clone().unwrap_or_default(),
                    namespace: attribute.namespace.clone(),
                    default_value: attribute.default.clone(),
                    enumeration,
                    required,
                    documentation: attribute.documentation.clone(),
                    value_documentation: Vec::new(),
                }
            })
            .collect()
    }

    fn element_documentation(&self, id: DeclId) -> Option<String> {
        self.elements.get(id).and_then(|e| e.documentation.clone())
    }

    fn source_files(&self) -> Vec<PathBuf> {
        self.files.clone()
    }
}

fn combine(existing: Pattern, added: Pattern, method: Option<&str>) -> Pattern {
    match method {
        Some("interleave") => Pattern::Group(vec![existing, added]),
        _ => Pattern::Choice(vec![existing, added]),
    }
}

fn group(mut patterns: Vec<Pattern>) -> Pattern {
    match patterns.len() {
        0 => Pattern::Empty,
        1 => patterns.remove(0),
        _ => Pattern::Group(patterns),
    }
}

fn rng_children<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().namespace() == Some(RNG_NAMESPACE))
}

/// Name and namespace of an element or attribute pattern, and the child
/// nodes that make up its content. Attributes only take an `ns` set on
/// themselves.
fn name_class<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    inherit_ns: bool,
) -> (
    Option<String>,
    Option<String>,
    impl Iterator<Item = roxmltree::Node<'a, 'input>>,
) {
    let inherited = if inherit_ns {
        node.ancestors().find_map(|n| n.attribute("ns"))
    } else {
        node.attribute("ns")
    }
        .filter(|ns| !ns.is_empty())
        .map(str::to_string);

    let (raw_name, skip) = match node.attribute("name") {
        Some(name) => (Some(name.to_string()), 0),
        None => {
            let name = rng_children(node)
                .next()
                .filter(|c| c.tag_name().name() == "name")
                .and_then(|c| c.text())
                .map(|t| t.trim().to_string());
            (name, 1)
        }
    };

    let (name, namespace) = match raw_name {
        Some(raw) => match raw.split_once(':') {
            Some((prefix, local)) => (
                Some(local.to_string()),
                node.lookup_namespace_uri(Some(prefix)).map(str::to_string),
            ),
            None => (Some(raw), inherited),
        },
        None => (None, inherited),
    };

    (name, namespace, rng_children(node).skip(skip))
}

fn annotation_documentation(node: roxmltree::Node<'_, '_>) -> Option<String> {
    let text = node
        .children()
        .filter(|c| {
            c.is_element()
                && c.tag_name().namespace() == Some(ANNOTATIONS_NAMESPACE)
                && c.tag_name().name() == "documentation"
        })
        .filter_map(|c| c.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}
