//! Declaration reader for W3C XML Schema.
//!
//! Only the parts of a schema that shape a content model are kept: element
//! declarations, complex type particles, attributes and simple type
//! enumerations. References (`ref`, `type`, `base`, group references) are
//! stored by name and resolved when a declaration is first queried.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::warn;

use crate::cancel::CancellationToken;
use crate::entity::{EntityResolver, LocalEntityResolver, ReadSession};
use crate::error::{ContentModelError, Result};
use crate::model::{
    merge_particles, AttributeInfo, ChildParticle, DeclId, ElementInfo, GrammarKind,
    NativeGrammar,
};
use crate::provider::GrammarSource;

pub const XS_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";

/// Built-in types whose values are strings.
const STRING_TYPES: &[&str] = &[
    "string",
    "normalizedString",
    "token",
    "language",
    "Name",
    "NCName",
    "NMTOKEN",
    "anyURI",
];

/// Guard for reference chains in broken schemas.
const MAX_DEPTH: usize = 32;

type QName = (Option<String>, String);

#[derive(Debug, Clone)]
enum TypeRef {
    Named(QName),
    Complex(usize),
    Simple(usize),
    Any,
}

#[derive(Debug)]
struct XsdElement {
    name: String,
    namespace: Option<String>,
    type_ref: TypeRef,
    nillable: bool,
    documentation: Option<String>,
}

#[derive(Debug, Clone)]
enum ElementTarget {
    Local(DeclId),
    Ref(QName),
}

#[derive(Debug, Clone)]
enum Particle {
    Element { target: ElementTarget, min: u32 },
    Sequence { items: Vec<Particle>, min: u32 },
    Choice { items: Vec<Particle>, min: u32 },
    Group { name: QName, min: u32 },
}

#[derive(Debug, Clone)]
struct AttributeDef {
    name: String,
    namespace: Option<String>,
    type_ref: Option<TypeRef>,
    default: Option<String>,
    required: bool,
    documentation: Option<String>,
}

#[derive(Debug, Clone)]
enum AttributeUse {
    Local(AttributeDef),
    Ref {
        name: QName,
        required: bool,
        default: Option<String>,
    },
    Group(QName),
}

#[derive(Debug, Default)]
struct ComplexType {
    mixed: bool,
    content: Option<Particle>,
    attributes: Vec<AttributeUse>,
    /// Base of a complex content extension.
    base: Option<QName>,
    simple_content: bool,
    simple_base: Option<TypeRef>,
}

#[derive(Debug, Default)]
struct SimpleType {
    base: Option<TypeRef>,
    enumeration: Vec<(String, Option<String>)>,
}

/// Per schema document settings.
struct SchemaContext {
    target_namespace: Option<String>,
    elements_qualified: bool,
    attributes_qualified: bool,
    /// Included without a target namespace: unqualified references take
    /// the including schema's namespace.
    chameleon: bool,
}

#[derive(Debug, Default)]
pub struct XsdGrammar {
    target_namespaces: Vec<String>,
    elements: Vec<XsdElement>,
    global_elements: Vec<DeclId>,
    global_index: HashMap<QName, DeclId>,
    complex_types: Vec<ComplexType>,
    named_complex: HashMap<QName, usize>,
    simple_types: Vec<SimpleType>,
    named_simple: HashMap<QName, usize>,
    groups: HashMap<QName, Particle>,
    attribute_groups: HashMap<QName, Vec<AttributeUse>>,
    global_attributes: HashMap<QName, AttributeDef>,
    files: Vec<PathBuf>,
}

impl XsdGrammar {
    /// Read the schema and the schemas it includes or imports.
    ///
    /// Returns `Ok(None)` if the main schema is malformed.
    pub fn read(
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>> {
        let text = source.read_text()?;
        let mut grammar = XsdGrammar::default();
        let mut session = ReadSession::new(entities, cancel);
        session.enter(source);

        let loaded = grammar.load(&text, source.uri(), None, &mut session);
        grammar.files = session.into_files();
        match loaded {
            Ok(()) => Ok(Some(grammar)),
            Err(ContentModelError::Dom { uri, details }) => {
                warn!(
                    uri = uri.as_deref().unwrap_or_default(),
                    details = %details,
                    "Cannot read XML Schema"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Parse schema text directly, for tests and in-memory grammars.
    /// Only local schemas are followed.
    pub fn parse(text: &str, uri: &str) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut session = ReadSession::new(&LocalEntityResolver, &cancel);
        let mut grammar = XsdGrammar::default();
        grammar.load(text, uri, None, &mut session)?;
        grammar.files = session.into_files();
        Ok(grammar)
    }

    fn load(
        &mut self,
        text: &str,
        uri: &str,
        chameleon_namespace: Option<&str>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let malformed = |details: String| ContentModelError::Dom {
            uri: Some(uri.to_string()),
            details,
        };
        let document = roxmltree::Document::parse(text).map_err(|e| malformed(e.to_string()))?;
        let root = document.root_element();
        if root.tag_name().namespace() != Some(XS_NAMESPACE) || root.tag_name().name() != "schema"
        {
            return Err(malformed("root element is not xs:schema".to_string()));
        }

        let own_namespace = root.attribute("targetNamespace").map(str::to_string);
        let chameleon = own_namespace.is_none() && chameleon_namespace.is_some();
        let target_namespace = own_namespace.or_else(|| chameleon_namespace.map(str::to_string));
        if let Some(ns) = &target_namespace
            && !self.target_namespaces.contains(ns)
        {
            self.target_namespaces.push(ns.clone());
        }

        let ctx = SchemaContext {
            target_namespace,
            elements_qualified: root.attribute("elementFormDefault") == Some("qualified"),
            attributes_qualified: root.attribute("attributeFormDefault") == Some("qualified"),
            chameleon,
        };

        for child in xs_children(root) {
            session.check()?;
            match child.tag_name().name() {
                "element" => {
                    let id = self.read_element(child, &ctx, true);
                    let name = (ctx.target_namespace.clone(), self.elements[id].name.clone());
                    self.global_index.entry(name).or_insert(id);
                    self.global_elements.push(id);
                }
                "complexType" => {
                    let index = self.read_complex_type(child, &ctx);
                    if let Some(name) = child.attribute("name") {
                        self.named_complex
                            .insert((ctx.target_namespace.clone(), name.to_string()), index);
                    }
                }
                "simpleType" => {
                    let index = self.read_simple_type(child, &ctx);
                    if let Some(name) = child.attribute("name") {
                        self.named_simple
                            .insert((ctx.target_namespace.clone(), name.to_string()), index);
                    }
                }
                "group" => {
                    if let Some(name) = child.attribute("name")
                        && let Some(particle) =
                            xs_children(child).find_map(|c| self.read_particle(c, &ctx))
                    {
                        self.groups
                            .insert((ctx.target_namespace.clone(), name.to_string()), particle);
                    }
                }
                "attributeGroup" => {
                    if let Some(name) = child.attribute("name") {
                        let uses = xs_children(child)
                            .filter_map(|c| self.read_attribute_use(c, &ctx, false))
                            .collect();
                        self.attribute_groups
                            .insert((ctx.target_namespace.clone(), name.to_string()), uses);
                    }
                }
                "attribute" => {
                    if let Some(AttributeUse::Local(def)) = self.read_attribute_use(child, &ctx, true)
                    {
                        self.global_attributes
                            .insert((ctx.target_namespace.clone(), def.name.clone()), def);
                    }
                }
                "include" | "redefine" | "override" => {
                    let namespace = ctx.target_namespace.clone();
                    self.follow(child, uri, None, namespace.as_deref(), session)?;
                }
                "import" => {
                    let namespace = child.attribute("namespace");
                    self.follow(child, uri, namespace, None, session)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Load an included or imported schema. An import without a
    /// schemaLocation may still be mapped by its namespace. Failures that
    /// do not abandon the read only lose that schema's declarations.
    fn follow(
        &mut self,
        node: roxmltree::Node<'_, '_>,
        base_uri: &str,
        imported_namespace: Option<&str>,
        chameleon_namespace: Option<&str>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let location = node.attribute("schemaLocation");
        if location.is_none() && imported_namespace.is_none() {
            return Ok(());
        }
        let Some(nested) = session.open(Some(base_uri), imported_namespace, location)? else {
            return Ok(());
        };
        match self.load(&nested.text, &nested.uri, chameleon_namespace, session) {
            Err(e) if e.aborts_read() => Err(e),
            Err(e) => {
                warn!(location = %nested.uri, error = %e, "Skipping referenced schema");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn read_element(&mut self, node: roxmltree::Node<'_, '_>, ctx: &SchemaContext, global: bool) -> DeclId {
        let qualified = match node.attribute("form") {
            Some(form) => form == "qualified",
            None => ctx.elements_qualified,
        };
        let namespace = if global || qualified {
            ctx.target_namespace.clone()
        } else {
            None
        };

        let type_ref = if let Some(type_name) = node.attribute("type") {
            TypeRef::Named(resolve_qname(node, type_name, ctx))
        } else if let Some(complex) = xs_child(node, "complexType") {
            TypeRef::Complex(self.read_complex_type(complex, ctx))
        } else if let Some(simple) = xs_child(node, "simpleType") {
            TypeRef::Simple(self.read_simple_type(simple, ctx))
        } else {
            TypeRef::Any
        };

        let id = self.elements.len();
        self.elements.push(XsdElement {
            name: node.attribute("name").unwrap_or_default().to_string(),
            namespace,
            type_ref,
            nillable: node.attribute("nillable") == Some("true"),
            documentation: annotation_documentation(node),
        });
        id
    }

    fn read_complex_type(&mut self, node: roxmltree::Node<'_, '_>, ctx: &SchemaContext) -> usize {
        let mut complex = ComplexType {
            mixed: node.attribute("mixed") == Some("true"),
            ..ComplexType::default()
        };
        self.read_type_body(node, ctx, &mut complex);
        self.complex_types.push(complex);
        self.complex_types.len() - 1
    }

    fn read_type_body(
        &mut self,
        node: roxmltree::Node<'_, '_>,
        ctx: &SchemaContext,
        complex: &mut ComplexType,
    ) {
        for child in xs_children(node) {
            match child.tag_name().name() {
                "sequence" | "choice" | "all" | "group" => {
                    if let Some(particle) = self.read_particle(child, ctx) {
                        complex.content = Some(particle);
                    }
                }
                "attribute" | "attributeGroup" => {
                    if let Some(attribute) = self.read_attribute_use(child, ctx, false) {
                        complex.attributes.push(attribute);
                    }
                }
                "complexContent" => {
                    complex.mixed |= child.attribute("mixed") == Some("true");
                    if let Some(derivation) = xs_children(child).next() {
                        if derivation.tag_name().name() == "extension" {
                            complex.base = derivation
                                .attribute("base")
                                .map(|b| resolve_qname(derivation, b, ctx));
                        }
                        self.read_type_body(derivation, ctx, complex);
                    }
                }
                "simpleContent" => {
                    complex.simple_content = true;
                    if let Some(derivation) = xs_children(child).next() {
                        complex.simple_base = derivation
                            .attribute("base")
                            .map(|b| TypeRef::Named(resolve_qname(derivation, b, ctx)));
                        self.read_type_body(derivation, ctx, complex);
                    }
                }
                _ => {}
            }
        }
    }

    fn read_particle(&mut self, node: roxmltree::Node<'_, '_>, ctx: &SchemaContext) -> Option<Particle> {
        if node.attribute("maxOccurs") == Some("0") {
            return None;
        }
        let min = node
            .attribute("minOccurs")
            .and_then(|m| m.parse().ok())
            .unwrap_or(1);

        match node.tag_name().name() {
            "element" => {
                let target = match node.attribute("ref") {
                    Some(name) => ElementTarget::Ref(resolve_qname(node, name, ctx)),
                    None => ElementTarget::Local(self.read_element(node, ctx, false)),
                };
                Some(Particle::Element { target, min })
            }
            "sequence" | "all" => Some(Particle::Sequence {
                items: xs_children(node)
                    .filter_map(|c| self.read_particle(c, ctx))
                    .collect(),
                min,
            }),
            "choice" => Some(Particle::Choice {
                items: xs_children(node)
                    .filter_map(|c| self.read_particle(c, ctx))
                    .collect(),
                min,
            }),
            "group" => node.attribute("ref").map(|name| Particle::Group {
                name: resolve_qname(node, name, ctx),
                min,
            }),
            _ => None,
        }
    }

    fn read_attribute_use(
        &mut self,
        node: roxmltree::Node<'_, '_>,
        ctx: &SchemaContext,
        global: bool,
    ) -> Option<AttributeUse> {
        match node.tag_name().name() {
            "attribute" => {
                let usage = node.attribute("use");
                if usage == Some("prohibited") {
                    return None;
                }
                let required = usage == Some("required");
                let default = node
                    .attribute("default")
                    .or_else(|| node.attribute("fixed"))
                    .map(str::to_string);

                if let Some(name) = node.attribute("ref") {
                    return Some(AttributeUse::Ref {
                        name: resolve_qname(node, name, ctx),
                        required,
                        default,
                    });
                }

                let qualified = match node.attribute("form") {
                    Some(form) => form == "qualified",
                    None => ctx.attributes_qualified,
                };
                let type_ref = match node.attribute("type") {
                    Some(name) => Some(TypeRef::Named(resolve_qname(node, name, ctx))),
                    None => xs_child(node, "simpleType")
                        .map(|simple| TypeRef::Simple(self.read_simple_type(simple, ctx))),
                };
                Some(AttributeUse::Local(AttributeDef {
                    name: node.attribute("name")?.to_string(),
                    namespace: if global || qualified {
                        ctx.target_namespace.clone()
                    } else {
                        None
                    },
                    type_ref,
                    default,
                    required,
                    documentation: annotation_documentation(node),
                }))
            }
            "attributeGroup" => node
                .attribute("ref")
                .map(|name| AttributeUse::Group(resolve_qname(node, name, ctx))),
            _ => None,
        }
    }

    fn read_simple_type(&mut self, node: roxmltree::Node<'_, '_>, ctx: &SchemaContext) -> usize {
        let mut simple = SimpleType::default();
        if let Some(restriction) = xs_child(node, "restriction") {
            simple.base = match restriction.attribute("base") {
                Some(base) => Some(TypeRef::Named(resolve_qname(restriction, base, ctx))),
                None => xs_child(restriction, "simpleType")
                    .map(|inner| TypeRef::Simple(self.read_simple_type(inner, ctx))),
            };
            simple.enumeration = xs_children(restriction)
                .filter(|c| c.tag_name().name() == "enumeration")
                .filter_map(|c| {
                    let value = c.attribute("value")?.to_string();
                    Some((value, annotation_documentation(c)))
                })
                .collect();
        }
        self.simple_types.push(simple);
        self.simple_types.len() - 1
    }

    fn complex_type(&self, type_ref: &TypeRef) -> Option<&ComplexType> {
        match type_ref {
            TypeRef::Complex(index) => self.complex_types.get(*index),
            TypeRef::Named(name) => self
                .named_complex
                .get(name)
                .and_then(|index| self.complex_types.get(*index)),
            TypeRef::Simple(_) | TypeRef::Any => None,
        }
    }

    fn simple_type(&self, type_ref: &TypeRef) -> Option<&SimpleType> {
        match type_ref {
            TypeRef::Simple(index) => self.simple_types.get(*index),
            TypeRef::Named(name) => self
                .named_simple
                .get(name)
                .and_then(|index| self.simple_types.get(*index)),
            TypeRef::Complex(_) | TypeRef::Any => None,
        }
    }

    /// A complex type followed by the types it extends, most derived first.
    fn type_chain<'a>(&'a self, complex: &'a ComplexType) -> Vec<&'a ComplexType> {
        let mut chain = vec![complex];
        let mut current = complex;
        while let Some(base) = &current.base {
            match self.complex_type(&TypeRef::Named(base.clone())) {
                Some(next) if chain.len() < MAX_DEPTH => {
                    chain.push(next);
                    current = next;
                }
                _ => break,
            }
        }
        chain
    }

    fn is_string_type(&self, type_ref: &TypeRef, depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        if let TypeRef::Named((Some(ns), local)) = type_ref
            && ns == XS_NAMESPACE
        {
            return STRING_TYPES.contains(&local.as_str());
        }
        self.simple_type(type_ref)
            .and_then(|simple| simple.base.as_ref())
            .is_some_and(|base| self.is_string_type(base, depth + 1))
    }

    fn enumeration(&self, type_ref: &TypeRef, depth: usize) -> Vec<(String, Option<String>)> {
        if depth > MAX_DEPTH {
            return Vec::new();
        }
        match self.simple_type(type_ref) {
            Some(simple) if !simple.enumeration.is_empty() => simple.enumeration.clone(),
            Some(simple) => simple
                .base
                .as_ref()
                .map(|base| self.enumeration(base, depth + 1))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn resolve_target(&self, target: &ElementTarget) -> Option<DeclId> {
        match target {
            ElementTarget::Local(id) => Some(*id),
            ElementTarget::Ref(name) => self.global_index.get(name).copied(),
        }
    }

    fn collect_particles(
        &self,
        particle: &Particle,
        required: bool,
        visited_groups: &mut HashSet<QName>,
        out: &mut Vec<ChildParticle>,
    ) {
        match particle {
            Particle::Element { target, min } => {
                if let Some(element) = self.resolve_target(target) {
                    out.push(ChildParticle {
                        element,
                        required: required && *min > 0,
                    });
                }
            }
            Particle::Sequence { items, min } => {
                for item in items {
                    self.collect_particles(item, required && *min > 0, visited_groups, out);
                }
            }
            Particle::Choice { items, min } => {
                let required = required && *min > 0 && items.len() == 1;
                for item in items {
                    self.collect_particles(item, required, visited_groups, out);
                }
            }
            Particle::Group { name, min } => {
                if visited_groups.insert(name.clone()) {
                    if let Some(group) = self.groups.get(name) {
                        self.collect_particles(group, required && *min > 0, visited_groups, out);
                    }
                    visited_groups.remove(name);
                }
            }
        }
    }

    fn collect_attributes(
        &self,
        uses: &[AttributeUse],
        visited_groups: &mut HashSet<QName>,
        out: &mut Vec<AttributeInfo>,
    ) {
        for attribute in uses {
            let info = match attribute {
                AttributeUse::Local(def) => self.attribute_info(def, def.required, def.default.clone()),
                AttributeUse::Ref {
                    name,
                    required,
                    default,
                } => match self.global_attributes.get(name) {
                    Some(def) => {
                        self.attribute_info(def, *required, default.clone().or(def.default.clone()))
                    }
                    None => continue,
                },
                AttributeUse::Group(name) => {
                    if visited_groups.insert(name.clone()) {
                        if let Some(group) = self.attribute_groups.get(name) {
                            self.collect_attributes(group, visited_groups, out);
                        }
                        visited_groups.remove(name);
                    }
                    continue;
                }
            };
            out.retain(|a| !(a.local_name == info.local_name && a.namespace == info.namespace));
            out.push(info);
        }
    }

    fn attribute_info(&self, def: &AttributeDef, required: bool, default: Option<String>) -> AttributeInfo {
        let enumeration = def
            .type_ref
            .as_ref()
            .map(|t| self.enumeration(t, 0))
            .unwrap_or_default();
        AttributeInfo {
            local_name: def.name.clone(),
            namespace: def.namespace.clone(),
            default_value: default,
            value_documentation: enumeration
                .iter()
                .filter_map(|(value, doc)| doc.clone().map(|doc| (value.clone(), doc)))
                .collect(),
            enumeration: enumeration.into_iter().map(|(value, _)| value).collect(),
            required,
            documentation: def.documentation.clone(),
        }
    }
}

impl NativeGrammar for XsdGrammar {
    fn kind(&self) -> GrammarKind {
        GrammarKind::Xsd
    }

    fn target_namespaces(&self) -> Vec<String> {
        self.target_namespaces.clone()
    }

    fn element_count(&self) -> usize {
        self.elements.len()
    }

    fn top_level_elements(&self) -> Vec<DeclId> {
        self.global_elements.clone()
    }

    fn element(&self, id: DeclId) -> ElementInfo {
        let element = &self.elements[id];
        let mut info = ElementInfo {
            local_name: element.name.clone(),
            namespace: element.namespace.clone(),
            is_nillable: element.nillable,
            ..ElementInfo::default()
        };

        match self.complex_type(&element.type_ref) {
            Some(complex) => {
                let chain = self.type_chain(complex);
                info.is_mixed = chain.iter().any(|t| t.mixed);
                let simple_base = chain.iter().find_map(|t| t.simple_base.as_ref());
                let has_content = chain.iter().any(|t| t.content.is_some());
                info.is_empty = !info.is_mixed && !has_content && simple_base.is_none();
                if let Some(base) = simple_base {
                    info.is_string_type = self.is_string_type(base, 0);
                    info.enumeration = self.enumeration(base, 0).into_iter().map(|(v, _)| v).collect();
                }
            }
            None => {
                info.is_string_type = self.is_string_type(&element.type_ref, 0);
                info.enumeration = self
                    .enumeration(&element.type_ref, 0)
                    .into_iter()
                    .map(|(v, _)| v)
                    .collect();
            }
        }
        info
    }

    fn child_particles(&self, id: DeclId) -> Vec<ChildParticle> {
        let Some(complex) = self.complex_type(&self.elements[id].type_ref) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut visited_groups = HashSet::new();
        for current in self.type_chain(complex).into_iter().rev() {
            if let Some(content) = &current.content {
                self.collect_particles(content, true, &mut visited_groups, &mut out);
            }
        }
        merge_particles(out)
    }

    fn attributes(&self, id: DeclId) -> Vec<AttributeInfo> {
        let Some(complex) = self.complex_type(&self.elements[id].type_ref) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut visited_groups = HashSet::new();
        for current in self.type_chain(complex).into_iter().rev() {
            self.collect_attributes(&current.attributes, &mut visited_groups, &mut out);
        }
        out
    }

    fn element_documentation(&self, id: DeclId) -> Option<String> {
        self.elements.get(id).and_then(|e| e.documentation.clone())
    }

    fn source_files(&self) -> Vec<PathBuf> {
        self.files.clone()
    }
}

fn xs_children<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().namespace() == Some(XS_NAMESPACE))
}

fn xs_child<'a, 'input>(node: roxmltree::Node<'a, 'input>, name: &str) -> Option<roxmltree::Node<'a, 'input>> {
    xs_children(node).find(|c| c.tag_name().name() == name)
}

/// Resolve a `prefix:local` reference with the namespaces in scope at `node`.
fn resolve_qname(node: roxmltree::Node<'_, '_>, value: &str, ctx: &SchemaContext) -> QName {
    let (prefix, local) = match value.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, value),
    };
    let namespace = node.lookup_namespace_uri(prefix).map(str::to_string);
    let namespace = match namespace {
        None if ctx.chameleon => ctx.target_namespace.clone(),
        other => other,
    };
    (namespace, local.to_string())
}

fn annotation_documentation(node: roxmltree::Node<'_, '_>) -> Option<String> {
    let annotation = xs_child(node, "annotation")?;
    let text = xs_children(annotation)
        .filter(|c| c.tag_name().name() == "documentation")
        .map(|doc| {
            doc.descendants()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri;
    use std::fs;
    use tempfile::TempDir;

    /// Serves imports by namespace and includes by system id from memory.
    struct InMemory {
        schemas: Vec<(&'static str, &'static str)>,
    }

    impl EntityResolver for InMemory {
        fn resolve_entity(
            &self,
            _base_uri: Option<&str>,
            public_id: Option<&str>,
            system_id: Option<&str>,
        ) -> Result<Option<GrammarSource>> {
            let key = system_id.or(public_id).unwrap_or_default();
            if key == "pending.xsd" {
                return Err(ContentModelError::Downloading {
                    uri: format!("http://example.com/{key}"),
                });
            }
            Ok(self
                .schemas
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(name, text)| GrammarSource::Inline {
                    uri: format!("http://example.com/{name}"),
                    text: text.to_string(),
                }))
        }
    }

    const PURCHASE: &str = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           xmlns:po="urn:po" targetNamespace="urn:po" elementFormDefault="qualified">
  <xs:element name="order" type="po:OrderType">
    <xs:annotation><xs:documentation>A purchase order.</xs:documentation></xs:annotation>
  </xs:element>
  <xs:element name="comment" type="xs:string"/>
  <xs:complexType name="BaseType">
    <xs:sequence>
      <xs:element name="id" type="xs:token"/>
    </xs:sequence>
    <xs:attribute name="version" type="xs:string" default="1"/>
  </xs:complexType>
  <xs:complexType name="OrderType">
    <xs:complexContent>
      <xs:extension base="po:BaseType">
        <xs:sequence>
          <xs:element ref="po:comment" minOccurs="0"/>
          <xs:choice>
            <xs:element name="pickup" type="xs:string"/>
            <xs:element name="ship" nillable="true">
              <xs:complexType/>
            </xs:element>
          </xs:choice>
          <xs:group ref="po:Lines"/>
        </xs:sequence>
        <xs:attribute name="status" use="required">
          <xs:simpleType>
            <xs:restriction base="xs:string">
              <xs:enumeration value="open">
                <xs:annotation><xs:documentation>Not shipped yet.</xs:documentation></xs:annotation>
              </xs:enumeration>
              <xs:enumeration value="closed"/>
            </xs:restriction>
          </xs:simpleType>
        </xs:attribute>
        <xs:attributeGroup ref="po:Audit"/>
      </xs:extension>
    </xs:complexContent>
  </xs:complexType>
  <xs:group name="Lines">
    <xs:sequence>
      <xs:element name="line" maxOccurs="unbounded" type="po:Color"/>
    </xs:sequence>
  </xs:group>
  <xs:simpleType name="Color">
    <xs:restriction base="xs:string">
      <xs:enumeration value="red"/>
      <xs:enumeration value="blue"/>
    </xs:restriction>
  </xs:simpleType>
  <xs:attributeGroup name="Audit">
    <xs:attribute name="author" type="xs:string"/>
  </xs:attributeGroup>
</xs:schema>"#;

    fn names(grammar: &XsdGrammar, particles: &[ChildParticle]) -> Vec<(String, bool)> {
        particles
            .iter()
            .map(|p| (grammar.elements[p.element].name.clone(), p.required))
            .collect()
    }

    #[test]
    fn test_extension_content_and_particles() {
        let grammar = XsdGrammar::parse(PURCHASE, "file:///po.xsd").unwrap();
        let order = grammar.global_index[&(Some("urn:po".to_string()), "order".to_string())];

        let children = grammar.child_particles(order);
        assert_eq!(
            names(&grammar, &children),
            vec![
                ("id".to_string(), true),
                ("comment".to_string(), false),
                ("pickup".to_string(), false),
                ("ship".to_string(), false),
                ("line".to_string(), true),
            ]
        );
        assert_eq!(grammar.top_level_elements().len(), 2);
        assert_eq!(grammar.target_namespaces(), vec!["urn:po".to_string()]);
    }

    #[test]
    fn test_element_info() {
        let grammar = XsdGrammar::parse(PURCHASE, "file:///po.xsd").unwrap();
        let order = grammar.global_index[&(Some("urn:po".to_string()), "order".to_string())];
        let comment = grammar.global_index[&(Some("urn:po".to_string()), "comment".to_string())];

        let info = grammar.element(order);
        assert_eq!(info.namespace.as_deref(), Some("urn:po"));
        assert!(!info.is_empty);
        assert!(!info.is_string_type);
        assert_eq!(grammar.element_documentation(order).as_deref(), Some("A purchase order."));

        assert!(grammar.element(comment).is_string_type);

        let ship = grammar.elements.iter().position(|e| e.name == "ship").unwrap();
        let ship_info = grammar.element(ship);
        assert!(ship_info.is_empty);
        assert!(ship_info.is_nillable);

        let line = grammar.elements.iter().position(|e| e.name == "line").unwrap();
        assert_eq!(grammar.element(line).enumeration, vec!["red", "blue"]);
    }

    #[test]
    fn test_attributes_from_base_groups_and_inline_types() {
        let grammar = XsdGrammar::parse(PURCHASE, "file:///po.xsd").unwrap();
        let order = grammar.global_index[&(Some("urn:po".to_string()), "order".to_string())];

        let attributes = grammar.attributes(order);
        let names: Vec<_> = attributes.iter().map(|a| a.local_name.as_str()).collect();
        assert_eq!(names, vec!["version", "status", "author"]);

        let version = &attributes[0];
        assert_eq!(version.default_value.as_deref(), Some("1"));
        assert!(!version.required);

        let status = &attributes[1];
        assert!(status.required);
        assert_eq!(status.enumeration, vec!["open", "closed"]);
        assert_eq!(
            status.value_documentation,
            vec![("open".to_string(), "Not shipped yet.".to_string())]
        );
    }

    #[test]
    fn test_unqualified_local_elements() {
        let schema = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema" targetNamespace="urn:a">
  <xs:element name="root">
    <xs:complexType><xs:sequence><xs:element name="child"/></xs:sequence></xs:complexType>
  </xs:element>
</xs:schema>"#;
        let grammar = XsdGrammar::parse(schema, "file:///a.xsd").unwrap();
        let child = grammar.elements.iter().position(|e| e.name == "child").unwrap();
        assert_eq!(grammar.element(child).namespace, None);
        assert_eq!(grammar.element(grammar.global_elements[0]).namespace.as_deref(), Some("urn:a"));
    }

    #[test]
    fn test_recursive_groups_terminate() {
        let schema = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:group name="g"><xs:sequence><xs:element name="a"/><xs:group ref="g"/></xs:sequence></xs:group>
  <xs:element name="root"><xs:complexType><xs:group ref="g"/></xs:complexType></xs:element>
</xs:schema>"#;
        let grammar = XsdGrammar::parse(schema, "file:///g.xsd").unwrap();
        let root = grammar.global_elements[0];
        assert_eq!(grammar.child_particles(root).len(), 1);
    }

    #[test]
    fn test_include_and_import_local_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("types.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="shared" type="xs:string"/>
</xs:schema>"#,
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("other.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema" targetNamespace="urn:other">
  <xs:element name="foreign"/>
</xs:schema>"#,
        )
        .unwrap();
        let main = temp_dir.path().join("main.xsd");
        fs::write(
            &main,
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema" xmlns:m="urn:main"
           xmlns:o="urn:other" targetNamespace="urn:main">
  <xs:include schemaLocation="types.xsd"/>
  <xs:import namespace="urn:other" schemaLocation="other.xsd"/>
  <xs:import namespace="urn:remote" schemaLocation="http://example.com/remote.xsd"/>
  <xs:element name="root">
    <xs:complexType><xs:sequence>
      <xs:element ref="m:shared"/><xs:element ref="o:foreign"/>
    </xs:sequence></xs:complexType>
  </xs:element>
</xs:schema>"#,
        )
        .unwrap();

        let source = GrammarSource::from_uri(&uri::from_file_path(&main).unwrap()).unwrap();
        let grammar = XsdGrammar::read(&source, &LocalEntityResolver, &CancellationToken::new())
            .unwrap()
            .unwrap();

        assert_eq!(grammar.source_files().len(), 3);
        assert!(grammar.files.contains(&main));
        assert_eq!(
            grammar.target_namespaces(),
            vec!["urn:main".to_string(), "urn:other".to_string()]
        );

        let root = grammar.global_index[&(Some("urn:main".to_string()), "root".to_string())];
        let children = grammar.child_particles(root);
        let found: Vec<_> = children
            .iter()
            .map(|p| {
                let e = &grammar.elements[p.element];
                (e.name.as_str(), e.namespace.as_deref())
            })
            .collect();
        assert_eq!(found, vec![("shared", Some("urn:main")), ("foreign", Some("urn:other"))]);
    }

    #[test]
    fn test_malformed_schema_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.xsd");
        fs::write(&path, "<xs:schema xmlns:xs=\"http://www.w3.org/2001/XMLSchema\">").unwrap();
        let source = GrammarSource::from_uri(path.to_str().unwrap()).unwrap();

        assert!(XsdGrammar::read(&source, &LocalEntityResolver, &CancellationToken::new()).unwrap().is_none());

        fs::write(&path, "<schema/>").unwrap();
        assert!(XsdGrammar::read(&source, &LocalEntityResolver, &CancellationToken::new()).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_read() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = GrammarSource::Inline {
            uri: "file:///po.xsd".to_string(),
            text: PURCHASE.to_string(),
        };
        assert!(matches!(
            XsdGrammar::read(&source, &LocalEntityResolver, &cancel),
            Err(ContentModelError::Cancelled)
        ));
    }

    #[test]
    fn test_nested_references_go_through_entity_resolver() {
        let resolver = InMemory {
            schemas: vec![
                (
                    "urn:other",
                    r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema" targetNamespace="urn:other">
  <xs:element name="foreign"/>
</xs:schema>"#,
                ),
                (
                    "types.xsd",
                    r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="shared" type="xs:string"/>
</xs:schema>"#,
                ),
            ],
        };
        let source = GrammarSource::Inline {
            uri: "http://example.com/main.xsd".to_string(),
            text: r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema" targetNamespace="urn:main">
  <xs:include schemaLocation="types.xsd"/>
  <xs:import namespace="urn:other"/>
  <xs:import namespace="urn:unknown"/>
</xs:schema>"#
                .to_string(),
        };

        let grammar = XsdGrammar::read(&source, &resolver, &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert!(grammar
            .global_index
            .contains_key(&(Some("urn:main".to_string()), "shared".to_string())));
        assert!(grammar
            .global_index
            .contains_key(&(Some("urn:other".to_string()), "foreign".to_string())));
        assert!(grammar.source_files().is_empty());
    }

    #[test]
    fn test_pending_download_abandons_read() {
        let resolver = InMemory { schemas: Vec::new() };
        let source = GrammarSource::Inline {
            uri: "http://example.com/main.xsd".to_string(),
            text: r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="pending.xsd"/>
</xs:schema>"#
                .to_string(),
        };

        assert!(matches!(
            XsdGrammar::read(&source, &resolver, &CancellationToken::new()),
            Err(ContentModelError::Downloading { .. })
        ));
    }
}
