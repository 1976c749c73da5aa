//! The per-format seam: one provider per schema language.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::dom::XmlDocument;
use crate::entity::EntityResolver;
use crate::error::Result;
use crate::model::ContentModelDocument;
use crate::uri;

/// How a document binds itself to a grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    SchemaLocation,
    NoNamespaceSchemaLocation,
    Doctype,
    XmlModel,
}

/// A grammar reference declared by a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub public_id: Option<String>,
    pub system_id: Option<String>,
    /// Source range of the reference, for diagnostics.
    pub range: Option<Range<usize>>,
    pub binding: BindingKind,
}

impl Identifier {
    pub fn new(public_id: Option<String>, system_id: Option<String>, binding: BindingKind) -> Self {
        Self {
            public_id,
            system_id,
            range: None,
            binding,
        }
    }

    pub fn with_range(mut self, range: Option<Range<usize>>) -> Self {
        self.range = range;
        self
    }
}

/// Where a provider reads a grammar from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarSource {
    /// A local file; `uri` is the resolved location it stands for, which
    /// differs from the path for downloaded resources.
    File { uri: String, path: PathBuf },
    /// Grammar text already in memory.
    Inline { uri: String, text: String },
}

impl GrammarSource {
    /// Source for a `file:` URI or a plain path.
    pub fn from_uri(location: &str) -> Option<Self> {
        let path = uri::to_file_path(location)?;
        Some(GrammarSource::File {
            uri: location.to_string(),
            path,
        })
    }

    pub fn uri(&self) -> &str {
        match self {
            GrammarSource::File { uri, .. } | GrammarSource::Inline { uri, .. } => uri,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            GrammarSource::File { path, .. } => Some(path),
            GrammarSource::Inline { .. } => None,
        }
    }

    pub fn read_text(&self) -> Result<String> {
        match self {
            GrammarSource::File { path, .. } => Ok(std::fs::read_to_string(path)?),
            GrammarSource::Inline { text, .. } => Ok(text.clone()),
        }
    }
}

/// Adapter for one schema language.
///
/// Providers are queried in registration order; the first one that adapts
/// a document owns it.
pub trait ContentModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// True if the document uses this provider's binding convention. With
    /// `internal`, only grammars embedded in the document count.
    fn adapts_document(&self, document: &XmlDocument, internal: bool) -> bool;

    /// True if the location looks like a grammar of this format.
    fn adapts_uri(&self, uri: &str) -> bool;

    fn schema_identifiers(
        &self,
        document: &XmlDocument,
        namespace_uri: Option<&str>,
    ) -> Vec<Identifier>;

    /// `Ok(None)` for a grammar that cannot be read (malformed, mid-edit).
    /// Errors are reserved for I/O failures and abandoned reads.
    /// References the grammar makes to other grammars go through `entities`.
    fn create_content_model_document(
        &self,
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<ContentModelDocument>>;

    fn create_internal_content_model_document(
        &self,
        _document: &XmlDocument,
    ) -> Option<ContentModelDocument> {
        None
    }
}

/// `xml-model` processing instructions pointing at a grammar of the given
/// format, recognised by href extension or `schematypens`.
pub(crate) fn xml_model_identifiers(
    document: &XmlDocument,
    extensions: &[&str],
    schema_type_namespace: Option<&str>,
) -> Vec<Identifier> {
    document
        .xml_model_instructions()
        .filter_map(|pi| {
            let href = pi.pseudo_attribute("href")?;
            let by_extension = uri::extension(&href)
                .is_some_and(|ext| extensions.contains(&ext.as_str()));
            let by_namespace = schema_type_namespace.is_some_and(|ns| {
                pi.pseudo_attribute("schematypens").as_deref() == Some(ns)
            });
            (by_extension || by_namespace).then(|| {
                Identifier::new(None, Some(href), BindingKind::XmlModel)
                    .with_range(Some(pi.range.clone()))
            })
        })
        .collect()
}
