//! Declaration reader for DTDs.
//!
//! Element content specs are kept as text and parsed when an element's
//! children are first asked for. Parameter entities are expanded textually;
//! external parameter entities are read through the entity resolver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::cancel::CancellationToken;
use crate::entity::{EntityResolver, LocalEntityResolver, ReadSession};
use crate::error::Result;
use crate::model::{
    merge_particles, AttributeInfo, ChildParticle, DeclId, ElementInfo, GrammarKind,
    NativeGrammar,
};
use crate::provider::GrammarSource;

/// Nesting limit for parameter entity expansion.
const MAX_ENTITY_DEPTH: usize = 16;

static ENTITY_REFERENCE_REGEX: OnceLock<Regex> = OnceLock::new();

fn entity_reference_regex() -> &'static Regex {
    ENTITY_REFERENCE_REGEX.get_or_init(|| {
        Regex::new(r"%([A-Za-z_:][\w.\-:]*);").expect("Failed to compile entity reference regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occurrence {
    One,
    Optional,
    ZeroOrMore,
    OneOrMore,
}

impl Occurrence {
    fn is_required(self) -> bool {
        matches!(self, Occurrence::One | Occurrence::OneOrMore)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ContentParticle {
    Name(String, Occurrence),
    Sequence(Vec<ContentParticle>, Occurrence),
    Choice(Vec<ContentParticle>, Occurrence),
}

#[derive(Debug, Clone, PartialEq)]
enum ContentSpec {
    Empty,
    Any,
    /// `(#PCDATA | a | b)*`; the names may be empty.
    Mixed(Vec<String>),
    Children(ContentParticle),
    Invalid,
}

#[derive(Debug, Clone)]
struct DtdElement {
    name: String,
    content: String,
    documentation: Option<String>,
}

#[derive(Debug, Clone)]
struct DtdAttribute {
    name: String,
    enumeration: Vec<String>,
    required: bool,
    default: Option<String>,
    documentation: Option<String>,
}

#[derive(Debug, Default)]
pub struct DtdGrammar {
    elements: Vec<DtdElement>,
    index: HashMap<String, DeclId>,
    attlists: HashMap<String, Vec<DtdAttribute>>,
    files: Vec<PathBuf>,
}

impl DtdGrammar {
    /// Read a DTD file. Returns `Ok(None)` when the text holds no
    /// declarations but does hold something else.
    pub fn read(
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>> {
        let text = source.read_text()?;
        let mut grammar = DtdGrammar::default();
        let mut session = ReadSession::new(entities, cancel);
        session.enter(source);

        let mut parser = DtdParser::new(&mut grammar);
        parser.parse(&text, Some(source.uri()), &mut session)?;
        let empty = parser.declarations == 0 && parser.unrecognized;
        grammar.files = session.into_files();
        if empty {
            warn!(uri = source.uri(), "No DTD declarations found");
            return Ok(None);
        }
        Ok(Some(grammar))
    }

    /// Parse DTD text such as an internal subset. `base_uri` locates
    /// external parameter entities, which are read when they are local.
    pub fn parse(text: &str, base_uri: Option<&str>, cancel: &CancellationToken) -> Result<Self> {
        let mut session = ReadSession::new(&LocalEntityResolver, cancel);
        let mut grammar = DtdGrammar::default();
        DtdParser::new(&mut grammar).parse(text, base_uri, &mut session)?;
        grammar.files = session.into_files();
        Ok(grammar)
    }

    fn content_spec(&self, id: DeclId) -> ContentSpec {
        parse_content_spec(&self.elements[id].content)
    }

    fn collect(&self, particle: &ContentParticle, required: bool, out: &mut Vec<ChildParticle>) {
        match particle {
            ContentParticle::Name(name, occurrence) => {
                if let Some(id) = self.index.get(name) {
                    out.push(ChildParticle {
                        element: *id,
                        required: required && occurrence.is_required(),
                    });
                }
            }
            ContentParticle::Sequence(items, occurrence) => {
                for item in items {
                    self.collect(item, required && occurrence.is_required(), out);
                }
            }
            ContentParticle::Choice(items, occurrence) => {
                let required = required && occurrence.is_required() && items.len() == 1;
                for item in items {
                    self.collect(item, required, out);
                }
            }
        }
    }
}

impl NativeGrammar for DtdGrammar {
    fn kind(&self) -> GrammarKind {
        GrammarKind::Dtd
    }

    fn target_namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    fn element_count(&self) -> usize {
        self.elements.len()
    }

    fn top_level_elements(&self) -> Vec<DeclId> {
        (0..self.elements.len()).collect()
    }

    fn element(&self, id: DeclId) -> ElementInfo {
        let spec = self.content_spec(id);
        ElementInfo {
            local_name: self.elements[id].name.clone(),
            namespace: None,
            is_empty: spec == ContentSpec::Empty,
            is_mixed: matches!(spec, ContentSpec::Mixed(_)),
            is_string_type: matches!(&spec, ContentSpec::Mixed(names) if names.is_empty()),
            is_nillable: false,
            enumeration: Vec::new(),
        }
    }

    fn child_particles(&self, id: DeclId) -> Vec<ChildParticle> {
        let optional = |names: &mut dyn Iterator<Item = DeclId>| -> Vec<ChildParticle> {
            names
                .map(|element| ChildParticle {
                    element,
                    required: false,
                })
                .collect()
        };
        match self.content_spec(id) {
            ContentSpec::Empty | ContentSpec::Invalid => Vec::new(),
            ContentSpec::Any => optional(&mut (0..self.elements.len())),
            ContentSpec::Mixed(names) => merge_particles(optional(
                &mut names.iter().filter_map(|n| self.index.get(n).copied()),
            )),
            ContentSpec::Children(particle) => {
                let mut out = Vec::new();
                self.collect(&particle, true, &mut out);
                merge_particles(out)
            }
        }
    }

    fn attributes(&self, id: DeclId) -> Vec<AttributeInfo> {
        self.attlists
            .get(&self.elements[id].name)
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|a| AttributeInfo {
                        local_name: a.name.clone(),
                        namespace: None,
                        default_value: a.default.clone(),
                        enumeration: a.enumeration.clone(),
                        required: a.required,
                        documentation: a.documentation.clone(),
                        value_documentation: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn element_documentation(&self, id: DeclId) -> Option<String> {
        self.elements.get(id).and_then(|e| e.documentation.clone())
    }

    fn source_files(&self) -> Vec<PathBuf> {
        self.files.clone()
    }
}

struct DtdParser<'g> {
    grammar: &'g mut DtdGrammar,
    entities: HashMap<String, String>,
    pending_comment: Option<String>,
    depth: usize,
    declarations: usize,
    unrecognized: bool,
}

impl<'g> DtdParser<'g> {
    fn new(grammar: &'g mut DtdGrammar) -> Self {
        Self {
            grammar,
            entities: HashMap::new(),
            pending_comment: None,
            depth: 0,
            declarations: 0,
            unrecognized: false,
        }
    }

    fn parse(
        &mut self,
        text: &str,
        base_uri: Option<&str>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let mut rest = text;
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                return Ok(());
            }

            if let Some(after) = rest.strip_prefix("<!--") {
                let end = after.find("-->").unwrap_or(after.len());
                let comment = after[..end].trim();
                self.pending_comment = (!comment.is_empty()).then(|| comment.to_string());
                rest = after.get(end + 3..).unwrap_or_default();
            } else if rest.starts_with("<?") {
                rest = rest.find("?>").map(|i| &rest[i + 2..]).unwrap_or_default();
            } else if rest.starts_with("<![") {
                // Conditional sections are not evaluated.
                rest = rest.find("]]>").map(|i| &rest[i + 3..]).unwrap_or_default();
            } else if let Some(after) = rest.strip_prefix("<!") {
                session.check()?;
                let end = declaration_end(after);
                self.declaration(&after[..end], base_uri, session)?;
                rest = after.get(end + 1..).unwrap_or_default();
            } else if let Some(after) = rest.strip_prefix('%') {
                let end = after.find(';').unwrap_or(after.len());
                let name = &after[..end];
                if let Some(value) = self.entities.get(name).cloned()
                    && self.depth < MAX_ENTITY_DEPTH
                {
                    self.depth += 1;
                    self.parse(&value, base_uri, session)?;
                    self.depth -= 1;
                }
                rest = after.get(end + 1..).unwrap_or_default();
            } else {
                self.unrecognized = true;
                let first = rest.chars().next().map(char::len_utf8).unwrap_or(1);
                let skip = rest[first..]
                    .find(['<', '%'])
                    .map(|i| i + first)
                    .unwrap_or(rest.len());
                rest = &rest[skip..];
            }
        }
    }

    fn declaration(
        &mut self,
        declaration: &str,
        base_uri: Option<&str>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let (keyword, body) = declaration
            .split_once(char::is_whitespace)
            .unwrap_or((declaration, ""));
        let comment = self.pending_comment.take();
        self.declarations += 1;

        match keyword {
            "ENTITY" => self.entity(body, base_uri, session)?,
            "ELEMENT" => {
                let body = self.expand(body);
                let body = body.trim();
                let (name, content) = body
                    .split_once(|c: char| c.is_whitespace() || c == '(')
                    .map(|(name, _)| (name, body[name.len()..].trim()))
                    .unwrap_or((body, ""));
                if name.is_empty() || self.grammar.index.contains_key(name) {
                    return Ok(());
                }
                let id = self.grammar.elements.len();
                self.grammar.elements.push(DtdElement {
                    name: name.to_string(),
                    content: content.to_string(),
                    documentation: comment,
                });
                self.grammar.index.insert(name.to_string(), id);
            }
            "ATTLIST" => {
                let body = self.expand(body);
                self.attlist(&body, comment);
            }
            _ => {}
        }
        Ok(())
    }

    fn entity(
        &mut self,
        body: &str,
        base_uri: Option<&str>,
        session: &mut ReadSession<'_>,
    ) -> Result<()> {
        let Some(body) = body.trim_start().strip_prefix('%') else {
            return Ok(());
        };
        let tokens = tokenize(body);
        let Some(Token::Name(name)) = tokens.first() else {
            return Ok(());
        };
        if self.entities.contains_key(name) {
            return Ok(());
        }

        let (public_id, system_id) = match &tokens[1..] {
            [Token::Literal(value), ..] => {
                self.entities.insert(name.clone(), value.clone());
                return Ok(());
            }
            [Token::Name(keyword), Token::Literal(system)] if keyword == "SYSTEM" => {
                (None, system.as_str())
            }
            [Token::Name(keyword), Token::Literal(public), Token::Literal(system)]
                if keyword == "PUBLIC" =>
            {
                (Some(public.as_str()), system.as_str())
            }
            _ => return Ok(()),
        };
        if let Some(nested) = session.open(base_uri, public_id, Some(system_id))? {
            self.entities.insert(name.clone(), nested.text);
        }
        Ok(())
    }

    /// Replace parameter entity references inside a declaration.
    fn expand(&self, body: &str) -> String {
        let mut text = body.to_string();
        for _ in 0..MAX_ENTITY_DEPTH {
            if !text.contains('%') {
                break;
            }
            let expanded = entity_reference_regex()
                .replace_all(&text, |caps: &regex::Captures<'_>| {
                    self.entities
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_default()
                })
                .into_owned();
            if expanded == text {
                break;
            }
            text = expanded;
        }
        text
    }

    fn attlist(&mut self, body: &str, documentation: Option<String>) {
        let mut tokens = tokenize(body).into_iter();
        let Some(Token::Name(element)) = tokens.next() else {
            return;
        };

        let mut attributes = Vec::new();
        while let Some(Token::Name(name)) = tokens.next() {
            let enumeration = match tokens.next() {
                Some(Token::Group(values)) => values,
                Some(Token::Name(kind)) if kind == "NOTATION" => match tokens.next() {
                    Some(Token::Group(values)) => values,
                    _ => Vec::new(),
                },
                Some(Token::Name(_)) => Vec::new(),
                _ => break,
            };

            let (required, default) = match tokens.next() {
                Some(Token::Name(keyword)) if keyword == "#REQUIRED" => (true, None),
                Some(Token::Name(keyword)) if keyword == "#FIXED" => match tokens.next() {
                    Some(Token::Literal(value)) => (false, Some(value)),
                    _ => (false, None),
                },
                Some(Token::Literal(value)) => (false, Some(value)),
                _ => (false, None),
            };

            attributes.push(DtdAttribute {
                name,
                enumeration,
                required,
                default,
                documentation: documentation.clone(),
            });
        }

        let existing = self.grammar.attlists.entry(element).or_default();
        for attribute in attributes {
            if !existing.iter().any(|a| a.name == attribute.name) {
                existing.push(attribute);
            }
        }
    }
}

/// Offset of the `>` closing a markup declaration, skipping quoted text.
fn declaration_end(text: &str) -> usize {
    let mut quote = None;
    for (i, c) in text.char_indices() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            ('>', None) => return i,
            _ => {}
        }
    }
    text.len()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Group(Vec<String>),
    Literal(String),
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = text.trim_start();
    while let Some(c) = rest.chars().next() {
        match c {
            '(' => {
                let end = rest.find(')').unwrap_or(rest.len());
                let values = rest[1..end]
                    .split('|')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                tokens.push(Token::Group(values));
                rest = rest.get(end + 1..).unwrap_or_default();
            }
            '"' | '\'' => {
                let end = rest[1..].find(c).map(|i| i + 1).unwrap_or(rest.len());
                tokens.push(Token::Literal(rest[1..end].to_string()));
                rest = rest.get(end + 1..).unwrap_or_default();
            }
            _ => {
                let end = rest
                    .find(|ch: char| ch.is_whitespace() || ch == '(' || ch == '"' || ch == '\'')
                    .unwrap_or(rest.len());
                tokens.push(Token::Name(rest[..end].to_string()));
                rest = &rest[end..];
            }
        }
        rest = rest.trim_start();
    }
    tokens
}

fn parse_content_spec(spec: &str) -> ContentSpec {
    let spec = spec.trim();
    match spec {
        "EMPTY" => return ContentSpec::Empty,
        "ANY" => return ContentSpec::Any,
        _ => {}
    }
    if spec.contains("#PCDATA") {
        let inner = spec
            .trim_start_matches('(')
            .split(')')
            .next()
            .unwrap_or_default();
        let names = inner
            .split('|')
            .map(str::trim)
            .filter(|n| !n.is_empty() && *n != "#PCDATA")
            .map(str::to_string)
            .collect();
        return ContentSpec::Mixed(names);
    }

    let mut parser = ContentParser { text: spec, pos: 0 };
    match parser.particle() {
        Some(particle) => ContentSpec::Children(particle),
        None => ContentSpec::Invalid,
    }
}

struct ContentParser<'a> {
    text: &'a str,
    pos: usize,
}

impl ContentParser<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn occurrence(&mut self) -> Occurrence {
        let occurrence = match self.peek() {
            Some('?') => Occurrence::Optional,
            Some('*') => Occurrence::ZeroOrMore,
            Some('+') => Occurrence::OneOrMore,
            _ => return Occurrence::One,
        };
        self.pos += 1;
        occurrence
    }

    fn particle(&mut self) -> Option<ContentParticle> {
        self.skip_whitespace();
        if self.peek() == Some('(') {
            self.pos += 1;
            let mut items = Vec::new();
            let mut is_choice = false;
            loop {
                items.push(self.particle()?);
                self.skip_whitespace();
                match self.peek()? {
                    ',' => self.pos += 1,
                    '|' => {
                        is_choice = true;
                        self.pos += 1;
                    }
                    ')' => {
                        self.pos += 1;
                        break;
                    }
                    _ => return None,
                }
            }
            let occurrence = self.occurrence();
            Some(if is_choice {
                ContentParticle::Choice(items, occurrence)
            } else {
                ContentParticle::Sequence(items, occurrence)
            })
        } else {
            let rest = &self.text[self.pos..];
            let end = rest
                .find(|c: char| c.is_whitespace() || ",|()?*+".contains(c))
                .unwrap_or(rest.len());
            if end == 0 {
                return None;
            }
            let name = rest[..end].to_string();
            self.pos += end;
            Some(ContentParticle::Name(name, self.occurrence()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContentModelError;
    use crate::uri;
    use std::fs;
    use tempfile::TempDir;

    const NOTE: &str = r#"<!-- A note with a heading. -->
<!ELEMENT note (to+, from, heading?, (body | summary), attachment*)>
<!ELEMENT to (#PCDATA)>
<!ELEMENT from (#PCDATA)>
<!ELEMENT heading (#PCDATA)>
<!ELEMENT body (#PCDATA | em)*>
<!ELEMENT summary (#PCDATA)>
<!ELEMENT em (#PCDATA)>
<!ELEMENT attachment EMPTY>
<!-- Note attributes. -->
<!ATTLIST note
    priority (low | normal | high) "normal"
    id ID #REQUIRED
    lang CDATA #FIXED "en"
    label CDATA #IMPLIED>
"#;

    fn id(grammar: &DtdGrammar, name: &str) -> DeclId {
        grammar.index[name]
    }

    fn children(grammar: &DtdGrammar, name: &str) -> Vec<(String, bool)> {
        grammar
            .child_particles(id(grammar, name))
            .into_iter()
            .map(|p| (grammar.elements[p.element].name.clone(), p.required))
            .collect()
    }

    #[test]
    fn test_content_model_particles() {
        let grammar = DtdGrammar::parse(NOTE, None, &CancellationToken::new()).unwrap();
        assert_eq!(grammar.top_level_elements().len(), 8);
        assert_eq!(
            children(&grammar, "note"),
            vec![
                ("to".to_string(), true),
                ("from".to_string(), true),
                ("heading".to_string(), false),
                ("body".to_string(), false),
                ("summary".to_string(), false),
                ("attachment".to_string(), false),
            ]
        );
        assert_eq!(children(&grammar, "body"), vec![("em".to_string(), false)]);
        assert!(children(&grammar, "attachment").is_empty());
    }

    #[test]
    fn test_element_flags_and_documentation() {
        let grammar = DtdGrammar::parse(NOTE, None, &CancellationToken::new()).unwrap();

        let note = grammar.element(id(&grammar, "note"));
        assert!(!note.is_empty && !note.is_mixed);
        assert_eq!(
            grammar.element_documentation(id(&grammar, "note")).as_deref(),
            Some("A note with a heading.")
        );

        assert!(grammar.element(id(&grammar, "attachment")).is_empty);
        let body = grammar.element(id(&grammar, "body"));
        assert!(body.is_mixed && !body.is_string_type);
        assert!(grammar.element(id(&grammar, "to")).is_string_type);
        assert!(grammar.element_documentation(id(&grammar, "to")).is_none());
    }

    #[test]
    fn test_attlist() {
        let grammar = DtdGrammar::parse(NOTE, None, &CancellationToken::new()).unwrap();
        let attributes = grammar.attributes(id(&grammar, "note"));

        let summary: Vec<_> = attributes
            .iter()
            .map(|a| (a.local_name.as_str(), a.required, a.default_value.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("priority", false, Some("normal")),
                ("id", true, None),
                ("lang", false, Some("en")),
                ("label", false, None),
            ]
        );
        assert_eq!(attributes[0].enumeration, vec!["low", "normal", "high"]);
        assert_eq!(attributes[0].documentation.as_deref(), Some("Note attributes."));
    }

    #[test]
    fn test_any_content_and_parameter_entities() {
        let dtd = r#"<!ENTITY % inline "b | i">
<!ENTITY % inline "ignored">
<!ENTITY % decls "<!ELEMENT i (#PCDATA)>">
<!ELEMENT doc ANY>
<!ELEMENT p (%inline;)*>
<!ELEMENT b (#PCDATA)>
%decls;"#;
        let grammar = DtdGrammar::parse(dtd, None, &CancellationToken::new()).unwrap();

        assert!(grammar.index.contains_key("i"));
        assert_eq!(
            children(&grammar, "p"),
            vec![("b".to_string(), false), ("i".to_string(), false)]
        );
        assert_eq!(children(&grammar, "doc").len(), 4);
        assert!(children(&grammar, "doc").iter().all(|(_, required)| !required));
    }

    #[test]
    fn test_external_parameter_entity() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("common.ent"), "<!ELEMENT shared EMPTY>").unwrap();
        let main = temp_dir.path().join("main.dtd");
        fs::write(
            &main,
            r#"<!ENTITY % common SYSTEM "common.ent">
%common;
<!ELEMENT root (shared)>"#,
        )
        .unwrap();

        let source = GrammarSource::from_uri(&uri::from_file_path(&main).unwrap()).unwrap();
        let grammar = DtdGrammar::read(&source, &LocalEntityResolver, &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(children(&grammar, "root"), vec![("shared".to_string(), true)]);
        assert_eq!(grammar.source_files().len(), 2);
    }

    #[test]
    fn test_not_a_dtd() {
        let source = GrammarSource::Inline {
            uri: "file:///not.dtd".to_string(),
            text: "this is not a dtd".to_string(),
        };
        let read = DtdGrammar::read(&source, &LocalEntityResolver, &CancellationToken::new());
        assert!(read.unwrap().is_none());

        let empty = GrammarSource::Inline {
            uri: "file:///empty.dtd".to_string(),
            text: "<!-- nothing yet -->".to_string(),
        };
        let read = DtdGrammar::read(&empty, &LocalEntityResolver, &CancellationToken::new());
        assert!(read.unwrap().is_some());
    }

    /// Maps public ids the way a catalog would.
    struct ByPublicId;

    impl EntityResolver for ByPublicId {
        fn resolve_entity(
            &self,
            _base_uri: Option<&str>,
            public_id: Option<&str>,
            _system_id: Option<&str>,
        ) -> Result<Option<GrammarSource>> {
            match public_id {
                Some("-//Test//ENTITIES Common//EN") => Ok(Some(GrammarSource::Inline {
                    uri: "http://example.com/common.ent".to_string(),
                    text: "<!ELEMENT shared EMPTY>".to_string(),
                })),
                Some("-//Test//ENTITIES Pending//EN") => Err(ContentModelError::Downloading {
                    uri: "http://example.com/pending.ent".to_string(),
                }),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn test_parameter_entity_by_public_id() {
        let source = GrammarSource::Inline {
            uri: "http://example.com/main.dtd".to_string(),
            text: r#"<!ENTITY % common PUBLIC "-//Test//ENTITIES Common//EN" "missing/common.ent">
%common;
<!ELEMENT root (shared)>"#
                .to_string(),
        };
        let grammar = DtdGrammar::read(&source, &ByPublicId, &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(children(&grammar, "root"), vec![("shared".to_string(), true)]);

        let pending = GrammarSource::Inline {
            uri: "http://example.com/pending.dtd".to_string(),
            text: r#"<!ENTITY % later PUBLIC "-//Test//ENTITIES Pending//EN" "later.ent">"#
                .to_string(),
        };
        assert!(matches!(
            DtdGrammar::read(&pending, &ByPublicId, &CancellationToken::new()),
            Err(ContentModelError::Downloading { .. })
        ));
    }

    #[test]
    fn test_content_spec_parser() {
        assert_eq!(parse_content_spec("EMPTY"), ContentSpec::Empty);
        assert_eq!(parse_content_spec("(#PCDATA)"), ContentSpec::Mixed(Vec::new()));
        assert_eq!(parse_content_spec("(a,"), ContentSpec::Invalid);
        assert_eq!(
            parse_content_spec("(a | (b, c)+)?"),
            ContentSpec::Children(ContentParticle::Choice(
                vec![
                    ContentParticle::Name("a".to_string(), Occurrence::One),
                    ContentParticle::Sequence(
                        vec![
                            ContentParticle::Name("b".to_string(), Occurrence::One),
                            ContentParticle::Name("c".to_string(), Occurrence::One),
                        ],
                        Occurrence::OneOrMore
                    ),
                ],
                Occurrence::Optional
            ))
        );
    }
}
