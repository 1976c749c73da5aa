//! Read-only XML document tree consumed by the content model layer.
//!
//! The tree is built once from `roxmltree` output into an owned arena so that
//! documents can be shared between concurrent requests. Besides elements and
//! attributes it keeps the grammar bindings the providers look at: the
//! DOCTYPE, prolog processing instructions and the `xsi:` location hints.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ContentModelError, Result};

pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

static ATTRIBUTE_REGEX: OnceLock<Regex> = OnceLock::new();

/// `name = "value"` pairs, used for start tags and pseudo-attributes.
fn attribute_regex() -> &'static Regex {
    ATTRIBUTE_REGEX.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w:.\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile attribute regex")
    })
}

/// Index of an element in its owning [`XmlDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomAttribute {
    pub local_name: String,
    pub prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub value: String,
    /// Range of the whole `name="value"` text.
    pub range: Range<usize>,
    /// Range of the value, quotes excluded.
    pub value_range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomElement {
    pub local_name: String,
    pub prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub attributes: Vec<DomAttribute>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub range: Range<usize>,
}

impl DomElement {
    pub fn attribute(&self, local_name: &str) -> Option<&DomAttribute> {
        self.attributes
            .iter()
            .find(|a| a.namespace_uri.is_none() && a.local_name == local_name)
    }

    pub fn attribute_ns(&self, namespace_uri: &str, local_name: &str) -> Option<&DomAttribute> {
        self.attributes.iter().find(|a| {
            a.namespace_uri.as_deref() == Some(namespace_uri) && a.local_name == local_name
        })
    }

    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.local_name),
            None => self.local_name.clone(),
        }
    }
}

/// `<!DOCTYPE name PUBLIC "..." "..." [ internal subset ]>`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentType {
    pub name: String,
    pub public_id: Option<String>,
    pub public_id_range: Option<Range<usize>>,
    pub system_id: Option<String>,
    pub system_id_range: Option<Range<usize>>,
    pub internal_subset: Option<String>,
    pub range: Range<usize>,
}

impl DocumentType {
    pub fn has_external_id(&self) -> bool {
        self.public_id.is_some() || self.system_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingInstruction {
    pub target: String,
    pub data: Option<String>,
    pub range: Range<usize>,
}

impl ProcessingInstruction {
    /// Value of a pseudo-attribute such as `href` in `<?xml-model href="a.rng"?>`.
    pub fn pseudo_attribute(&self, name: &str) -> Option<String> {
        let data = self.data.as_deref()?;
        attribute_regex()
            .captures_iter(data)
            .find(|caps| &caps[1] == name)
            .and_then(|caps| caps.get(2).or_else(|| caps.get(3)))
            .map(|m| m.as_str().to_string())
    }
}

/// One `namespace location` pair of `xsi:schemaLocation`.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaLocationHint {
    pub namespace_uri: String,
    pub location: String,
    pub range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoNamespaceSchemaLocation {
    pub location: String,
    pub range: Range<usize>,
}

/// An immutable, parsed XML document.
#[derive(Debug, Clone)]
pub struct XmlDocument {
    uri: Option<String>,
    text: String,
    elements: Vec<DomElement>,
    root: Option<NodeId>,
    doctype: Option<DocumentType>,
    instructions: Vec<ProcessingInstruction>,
    line_starts: Vec<usize>,
}

impl XmlDocument {
    /// Parse `text`, remembering `uri` as the document location.
    pub fn parse(uri: Option<&str>, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let options = roxmltree::ParsingOptions {
            allow_dtd: true,
            ..roxmltree::ParsingOptions::default()
        };

        let (elements, root, instructions) = {
            let document = roxmltree::Document::parse_with_options(&text, options).map_err(
                |e| ContentModelError::Dom {
                    uri: uri.map(str::to_string),
                    details: e.to_string(),
                },
            )?;

            let mut elements = Vec::new();
            let root = build_element(document.root_element(), None, &text, &mut elements);

            let instructions = document
                .root()
                .children()
                .filter_map(|node| {
                    let pi = node.pi()?;
                    Some(ProcessingInstruction {
                        target: pi.target.to_string(),
                        data: pi.value.map(str::to_string),
                        range: node.range(),
                    })
                })
                .collect::<Vec<_>>();

            (elements, Some(root), instructions)
        };

        let prolog_end = root
            .map(|id| elements[id.0].range.start)
            .unwrap_or(text.len());
        let doctype = scan_doctype(&text[..prolog_end]);
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();

        Ok(Self {
            uri: uri.map(str::to_string),
            text,
            elements,
            root,
            doctype,
            instructions,
            line_starts,
        })
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root_element(&self) -> Option<NodeId> {
        self.root
    }

    /// `None` for an id that belongs to another document.
    pub fn element(&self, id: NodeId) -> Option<&DomElement> {
        self.elements.get(id.0)
    }

    pub fn parent_element(&self, id: NodeId) -> Option<NodeId> {
        self.element(id).and_then(|e| e.parent)
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.element(id)
            .into_iter()
            .flat_map(|e| e.children.iter().copied())
    }

    /// All elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.elements.len()).map(NodeId)
    }

    /// First element, in document order, with the given local name.
    pub fn find_element(&self, local_name: &str) -> Option<NodeId> {
        self.elements()
            .find(|id| self.elements[id.0].local_name == local_name)
    }

    /// Namespace of the root element.
    pub fn namespace_uri(&self) -> Option<&str> {
        self.root
            .and_then(|id| self.elements[id.0].namespace_uri.as_deref())
    }

    pub fn doctype(&self) -> Option<&DocumentType> {
        self.doctype.as_ref()
    }

    pub fn processing_instructions(&self) -> &[ProcessingInstruction] {
        &self.instructions
    }

    pub fn xml_model_instructions(&self) -> impl Iterator<Item = &ProcessingInstruction> {
        self.instructions
            .iter()
            .filter(|pi| pi.target == "xml-model")
    }

    /// True if the DOCTYPE references an external DTD.
    pub fn has_dtd(&self) -> bool {
        self.doctype
            .as_ref()
            .is_some_and(DocumentType::has_external_id)
    }

    pub fn has_internal_subset(&self) -> bool {
        self.doctype
            .as_ref()
            .and_then(|d| d.internal_subset.as_deref())
            .is_some_and(|subset| !subset.trim().is_empty())
    }

    pub fn schema_location(&self) -> Vec<SchemaLocationHint> {
        let Some(attr) = self.root_xsi_attribute("schemaLocation") else {
            return Vec::new();
        };

        let mut tokens = Vec::new();
        let mut start = None;
        for (i, c) in attr.value.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    tokens.push((s, i));
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            tokens.push((s, attr.value.len()));
        }

        tokens
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| {
                let (ns_start, ns_end) = pair[0];
                let (loc_start, loc_end) = pair[1];
                SchemaLocationHint {
                    namespace_uri: attr.value[ns_start..ns_end].to_string(),
                    location: attr.value[loc_start..loc_end].to_string(),
                    range: attr.value_range.start + loc_start..attr.value_range.start + loc_end,
                }
            })
            .collect()
    }

    pub fn schema_location_hint(&self, namespace_uri: &str) -> Option<SchemaLocationHint> {
        self.schema_location()
            .into_iter()
            .find(|hint| hint.namespace_uri == namespace_uri)
    }

    pub fn no_namespace_schema_location(&self) -> Option<NoNamespaceSchemaLocation> {
        let attr = self.root_xsi_attribute("noNamespaceSchemaLocation")?;
        let location = attr.value.trim();
        if location.is_empty() {
            return None;
        }
        Some(NoNamespaceSchemaLocation {
            location: location.to_string(),
            range: attr.value_range.clone(),
        })
    }

    pub fn has_schema_location(&self) -> bool {
        self.root_xsi_attribute("schemaLocation").is_some()
    }

    pub fn has_no_namespace_schema_location(&self) -> bool {
        self.root_xsi_attribute("noNamespaceSchemaLocation").is_some()
    }

    /// False when the document declares no grammar at all, which consumers
    /// report as the "no grammar" state.
    pub fn has_grammar(&self) -> bool {
        self.doctype.is_some()
            || self.has_schema_location()
            || self.has_no_namespace_schema_location()
            || self.xml_model_instructions().next().is_some()
    }

    pub fn offset_to_position(&self, offset: usize) -> Position {
        let offset = offset.min(self.text.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let line_start = self.line_starts[line];
        let character = self
            .text
            .get(line_start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(offset - line_start);
        Position {
            line: line as u32,
            character: character as u32,
        }
    }

    fn root_xsi_attribute(&self, local_name: &str) -> Option<&DomAttribute> {
        let root = self.root?;
        self.elements[root.0].attribute_ns(XSI_NAMESPACE, local_name)
    }
}

fn build_element(
    node: roxmltree::Node<'_, '_>,
    parent: Option<NodeId>,
    text: &str,
    elements: &mut Vec<DomElement>,
) -> NodeId {
    let range = node.range();
    let start_tag = start_tag_text(text, range.start);
    let prefix = start_tag
        .get(1..)
        .and_then(|tag| {
            let qname_end = tag
                .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
                .unwrap_or(tag.len());
            tag[..qname_end].split_once(':').map(|(p, _)| p.to_string())
        });

    let source_attributes = attribute_regex()
        .captures_iter(start_tag)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let value = caps.get(2).or_else(|| caps.get(3))?;
            Some((
                caps[1].to_string(),
                range.start + whole.start()..range.start + whole.end(),
                range.start + value.start()..range.start + value.end(),
            ))
        })
        .collect::<Vec<_>>();

    let attributes = node
        .attributes()
        .map(|attr| {
            let located = source_attributes.iter().find(|(qname, _, _)| {
                qname == attr.name() || qname.rsplit_once(':').map(|(_, l)| l) == Some(attr.name())
            });
            let (attr_range, value_range) = located
                .map(|(_, r, v)| (r.clone(), v.clone()))
                .unwrap_or((range.start..range.start, range.start..range.start));
            let prefix = located
                .and_then(|(qname, _, _)| qname.split_once(':'))
                .map(|(p, _)| p.to_string());
            DomAttribute {
                local_name: attr.name().to_string(),
                prefix,
                namespace_uri: attr.namespace().map(str::to_string),
                value: attr.value().to_string(),
                range: attr_range,
                value_range,
            }
        })
        .collect();

    let id = NodeId(elements.len());
    elements.push(DomElement {
        local_name: node.tag_name().name().to_string(),
        prefix,
        namespace_uri: node.tag_name().namespace().map(str::to_string),
        attributes,
        parent,
        children: Vec::new(),
        range,
    });

    for child in node.children().filter(|n| n.is_element()) {
        let child_id = build_element(child, Some(id), text, elements);
        elements[id.0].children.push(child_id);
    }
    id
}

/// Text of the start tag beginning at `start`, up to and including `>`.
fn start_tag_text(text: &str, start: usize) -> &str {
    let rest = &text[start..];
    let mut quote = None;
    for (i, c) in rest.char_indices() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            ('>', None) => return &rest[..=i],
            _ => {}
        }
    }
    rest
}

/// Scan a DOCTYPE declaration out of the document prolog.
fn scan_doctype(prolog: &str) -> Option<DocumentType> {
    let start = prolog.find("<!DOCTYPE")?;
    let mut scanner = Scanner {
        text: prolog,
        pos: start + "<!DOCTYPE".len(),
    };

    scanner.skip_whitespace();
    let name = scanner.read_name();
    scanner.skip_whitespace();

    let mut doctype = DocumentType {
        name,
        ..DocumentType::default()
    };

    if scanner.eat("PUBLIC") {
        scanner.skip_whitespace();
        if let Some((value, range)) = scanner.read_quoted() {
            doctype.public_id = Some(value);
            doctype.public_id_range = Some(range);
        }
        scanner.skip_whitespace();
        if let Some((value, range)) = scanner.read_quoted() {
            doctype.system_id = Some(value);
            doctype.system_id_range = Some(range);
        }
    } else if scanner.eat("SYSTEM") {
        scanner.skip_whitespace();
        if let Some((value, range)) = scanner.read_quoted() {
            doctype.system_id = Some(value);
            doctype.system_id_range = Some(range);
        }
    }

    scanner.skip_whitespace();
    if scanner.eat("[") {
        let subset_start = scanner.pos;
        let subset_end = scanner.skip_internal_subset();
        doctype.internal_subset = Some(prolog[subset_start..subset_end].to_string());
    }

    let end = prolog[scanner.pos..]
        .find('>')
        .map(|i| scanner.pos + i + 1)
        .unwrap_or(prolog.len());
    doctype.range = start..end;
    Some(doctype)
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl Scanner<'_> {
    fn rest(&self) -> &str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn read_name(&mut self) -> String {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '[' || c == '>')
            .unwrap_or(rest.len());
        let name = rest[..end].to_string();
        self.pos += end;
        name
    }

    fn read_quoted(&mut self) -> Option<(String, Range<usize>)> {
        let quote = self.rest().chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let value_start = self.pos + 1;
        let len = self.text[value_start..].find(quote)?;
        let value_end = value_start + len;
        self.pos = value_end + 1;
        Some((
            self.text[value_start..value_end].to_string(),
            value_start..value_end,
        ))
    }

    /// Advance past the closing `]` of the internal subset, skipping quoted
    /// literals and comments. Returns the offset of the `]`.
    fn skip_internal_subset(&mut self) -> usize {
        while let Some(c) = self.rest().chars().next() {
            if self.rest().starts_with("<!--") {
                self.pos = self.rest()[4..]
                    .find("-->")
                    .map(|i| self.pos + 4 + i + 3)
                    .unwrap_or(self.text.len());
                continue;
            }
            match c {
                '"' | '\'' => {
                    if self.read_quoted().is_none() {
                        self.pos = self.text.len();
                    }
                }
                ']' => {
                    let end = self.pos;
                    self.pos += 1;
                    return end;
                }
                _ => self.pos += c.len_utf8(),
            }
        }
        self.text.len()
    }
}
