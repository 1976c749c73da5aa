use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use super::documentation::DocumentationRequest;
use super::grammar::{AttributeInfo, ChildParticle, DeclId, ElementInfo, GrammarKind, NativeGrammar};
use crate::dom::{DomElement, NodeId, XmlDocument};
use crate::freshness::FilesChangedTracker;

/// Memoized views of one native element declaration.
#[derive(Debug, Default)]
struct Slot {
    info: OnceLock<ElementInfo>,
    children: OnceLock<Vec<ChildParticle>>,
    attributes: OnceLock<Vec<AttributeInfo>>,
}

/// Format-agnostic view of one parsed grammar.
///
/// Declarations live in an arena indexed by the native grammar's [`DeclId`];
/// each per-declaration collection is computed at most once. Children are
/// stored as indices, so self-referencing content models are safe.
pub struct ContentModelDocument {
    uri: Option<String>,
    grammar: Arc<dyn NativeGrammar>,
    slots: Vec<Slot>,
    roots: OnceLock<Vec<DeclId>>,
    namespaces: OnceLock<Vec<String>>,
    tracker: FilesChangedTracker,
    dirty: AtomicBool,
}

impl ContentModelDocument {
    /// `uri` is `None` for grammars embedded in an XML document.
    pub fn new(uri: Option<String>, grammar: Arc<dyn NativeGrammar>) -> Self {
        let slots = (0..grammar.element_count()).map(|_| Slot::default()).collect();
        let tracker = FilesChangedTracker::from_files(grammar.source_files());
        Self {
            uri,
            grammar,
            slots,
            roots: OnceLock::new(),
            namespaces: OnceLock::new(),
            tracker,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn kind(&self) -> GrammarKind {
        self.grammar.kind()
    }

    pub fn grammar(&self) -> &Arc<dyn NativeGrammar> {
        &self.grammar
    }

    pub fn namespaces(&self) -> &[String] {
        self.namespaces.get_or_init(|| self.grammar.target_namespaces())
    }

    /// Dirty documents must not be served from a cache.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) || self.tracker.is_dirty()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn source_files(&self) -> impl Iterator<Item = &Path> {
        self.tracker.files()
    }

    /// Root element declarations.
    pub fn elements(self: &Arc<Self>) -> Vec<ElementDeclaration> {
        self.roots
            .get_or_init(|| self.grammar.top_level_elements())
            .iter()
            .map(|id| self.declaration(*id))
            .collect()
    }

    pub fn element(self: &Arc<Self>, id: DeclId) -> Option<ElementDeclaration> {
        (id < self.slots.len()).then(|| self.declaration(id))
    }

    /// Root declaration with the given name.
    pub fn find_element(
        self: &Arc<Self>,
        name: &str,
        namespace: Option<&str>,
    ) -> Option<ElementDeclaration> {
        self.roots
            .get_or_init(|| self.grammar.top_level_elements())
            .iter()
            .find(|id| self.name_matches(**id, name, namespace))
            .map(|id| self.declaration(*id))
    }

    /// Declaration of `node`, found by walking from the outermost ancestor
    /// in `namespace` down to `node`, each step a child lookup of the
    /// previous one. Returns `None` as soon as a step has no declaration.
    ///
    /// Without a namespace every ancestor takes part and names match by
    /// local name only. With one, unqualified elements nested under an
    /// element of that namespace are kept, since local declarations are
    /// unqualified unless the schema says otherwise.
    pub fn find_cm_element(
        self: &Arc<Self>,
        document: &XmlDocument,
        node: NodeId,
        namespace: Option<&str>,
    ) -> Option<ElementDeclaration> {
        let scoped = namespace.filter(|_| self.kind() != GrammarKind::Dtd);
        let mut path: Vec<&DomElement> = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let element = document.element(id)?;
            if let Some(ns) = scoped
                && element.namespace_uri.as_deref().is_some_and(|own| own != ns)
            {
                break;
            }
            path.push(element);
            current = element.parent;
        }
        if scoped.is_some() {
            // The outermost step must be qualified.
            while path.last().is_some_and(|e| e.namespace_uri.is_none()) {
                path.pop();
            }
        }

        let mut declaration: Option<ElementDeclaration> = None;
        for element in path.into_iter().rev() {
            let name = self.dom_name(element);
            declaration = match declaration {
                None => self.find_element(&name, namespace),
                Some(parent) => parent.find_element(&name, namespace),
            };
            declaration.as_ref()?;
        }
        declaration
    }

    fn declaration(self: &Arc<Self>, id: DeclId) -> ElementDeclaration {
        ElementDeclaration {
            document: self.clone(),
            id,
        }
    }

    /// DTDs are not namespace aware; their names include the prefix.
    fn dom_name(&self, element: &DomElement) -> String {
        match self.kind() {
            GrammarKind::Dtd => element.qualified_name(),
            _ => element.local_name.clone(),
        }
    }

    fn name_matches(&self, id: DeclId, name: &str, namespace: Option<&str>) -> bool {
        let info = self.info(id);
        if info.local_name != name {
            return false;
        }
        match self.kind() {
            GrammarKind::Dtd => true,
            _ => {
                namespace.is_none()
                    || info.namespace.is_none()
                    || info.namespace.as_deref() == namespace
            }
        }
    }

    fn info(&self, id: DeclId) -> &ElementInfo {
        self.slots[id].info.get_or_init(|| self.grammar.element(id))
    }

    fn children(&self, id: DeclId) -> &[ChildParticle] {
        self.slots[id]
            .children
            .get_or_init(|| self.grammar.child_particles(id))
    }

    fn attribute_infos(&self, id: DeclId) -> &[AttributeInfo] {
        self.slots[id]
            .attributes
            .get_or_init(|| self.grammar.attributes(id))
    }
}

impl fmt::Debug for ContentModelDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentModelDocument")
            .field("uri", &self.uri)
            .field("kind", &self.grammar.kind())
            .field("elements", &self.slots.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Handle on one element declaration of a [`ContentModelDocument`].
#[derive(Clone)]
pub struct ElementDeclaration {
    document: Arc<ContentModelDocument>,
    id: DeclId,
}

impl ElementDeclaration {
    pub fn id(&self) -> DeclId {
        self.id
    }

    pub fn document(&self) -> &Arc<ContentModelDocument> {
        &self.document
    }

    pub fn local_name(&self) -> &str {
        &self.document.info(self.id).local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.document.info(self.id).namespace.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.document.info(self.id).is_empty
    }

    pub fn is_mixed_content(&self) -> bool {
        self.document.info(self.id).is_mixed
    }

    pub fn is_string_type(&self) -> bool {
        self.document.info(self.id).is_string_type
    }

    pub fn is_nillable(&self) -> bool {
        self.document.info(self.id).is_nillable
    }

    pub fn enumeration_values(&self) -> &[String] {
        &self.document.info(self.id).enumeration
    }

    /// Possible children, in declaration order.
    pub fn elements(&self) -> Vec<ElementDeclaration> {
        self.document
            .children(self.id)
            .iter()
            .map(|p| self.document.declaration(p.element))
            .collect()
    }

    pub fn required_elements(&self) -> Vec<ElementDeclaration> {
        self.filtered_children(true)
    }

    pub fn optional_elements(&self) -> Vec<ElementDeclaration> {
        self.filtered_children(false)
    }

    /// Direct child with the given name. Never searches deeper.
    pub fn find_element(&self, name: &str, namespace: Option<&str>) -> Option<ElementDeclaration> {
        self.document
            .children(self.id)
            .iter()
            .find(|p| self.document.name_matches(p.element, name, namespace))
            .map(|p| self.document.declaration(p.element))
    }

    pub fn attributes(&self) -> Vec<AttributeDeclaration> {
        (0..self.document.attribute_infos(self.id).len())
            .map(|index| AttributeDeclaration {
                document: self.document.clone(),
                owner: self.id,
                index,
            })
            .collect()
    }

    pub fn find_attribute(&self, name: &str, namespace: Option<&str>) -> Option<AttributeDeclaration> {
        self.document
            .attribute_infos(self.id)
            .iter()
            .position(|a| a.local_name == name && a.namespace.as_deref() == namespace)
            .map(|index| AttributeDeclaration {
                document: self.document.clone(),
                owner: self.id,
                index,
            })
    }

    pub fn documentation(&self, request: &DocumentationRequest) -> Option<String> {
        let text = self.document.grammar.element_documentation(self.id);
        request.render(text.as_deref(), self.document.uri())
    }

    fn filtered_children(&self, required: bool) -> Vec<ElementDeclaration> {
        self.document
            .children(self.id)
            .iter()
            .filter(|p| p.required == required)
            .map(|p| self.document.declaration(p.element))
            .collect()
    }
}

impl PartialEq for ElementDeclaration {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.document, &other.document) && self.id == other.id
    }
}

impl fmt::Debug for ElementDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementDeclaration")
            .field("name", &self.local_name())
            .field("namespace", &self.namespace())
            .field("id", &self.id)
            .finish()
    }
}

/// Handle on one attribute of an element declaration.
#[derive(Clone)]
pub struct AttributeDeclaration {
    document: Arc<ContentModelDocument>,
    owner: DeclId,
    index: usize,
}

impl AttributeDeclaration {
    fn info(&self) -> &AttributeInfo {
        &self.document.attribute_infos(self.owner)[self.index]
    }

    pub fn local_name(&self) -> &str {
        &self.info().local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.info().namespace.as_deref()
    }

    pub fn default_value(&self) -> Option<&str> {
        self.info().default_value.as_deref()
    }

    pub fn enumeration_values(&self) -> &[String] {
        &self.info().enumeration
    }

    pub fn is_required(&self) -> bool {
        self.info().required
    }

    pub fn owner(&self) -> ElementDeclaration {
        self.document.declaration(self.owner)
    }

    pub fn documentation(&self, request: &DocumentationRequest) -> Option<String> {
        request.render(self.info().documentation.as_deref(), self.document.uri())
    }

    /// Documentation of one enumeration value.
    pub fn value_documentation(&self, value: &str, request: &DocumentationRequest) -> Option<String> {
        let text = self
            .info()
            .value_documentation
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, doc)| doc.as_str());
        text.and_then(|text| request.render(Some(text), self.document.uri()))
    }
}

impl fmt::Debug for AttributeDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDeclaration")
            .field("name", &self.local_name())
            .field("owner", &self.owner)
            .finish()
    }
}
