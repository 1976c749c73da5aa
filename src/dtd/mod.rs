//! DTD content model provider.

mod reader;

use std::sync::Arc;

use tracing::warn;

use crate::cancel::CancellationToken;
use crate::dom::XmlDocument;
use crate::entity::EntityResolver;
use crate::error::Result;
use crate::model::ContentModelDocument;
use crate::provider::{
    xml_model_identifiers, BindingKind, ContentModelProvider, GrammarSource, Identifier,
};
use crate::uri;

pub use reader::DtdGrammar;

const DTD_EXTENSIONS: &[&str] = &["dtd", "ent", "mod"];

/// Claims documents with a DOCTYPE. Internal subsets are exposed as their
/// own content model document.
#[derive(Debug, Default)]
pub struct DtdProvider;

impl DtdProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ContentModelProvider for DtdProvider {
    fn name(&self) -> &str {
        "dtd"
    }

    fn adapts_document(&self, document: &XmlDocument, internal: bool) -> bool {
        if internal {
            document.has_internal_subset()
        } else {
            document.has_dtd() || !xml_model_identifiers(document, DTD_EXTENSIONS, None).is_empty()
        }
    }

    fn adapts_uri(&self, location: &str) -> bool {
        uri::extension(location).is_some_and(|ext| DTD_EXTENSIONS.contains(&ext.as_str()))
    }

    fn schema_identifiers(
        &self,
        document: &XmlDocument,
        _namespace_uri: Option<&str>,
    ) -> Vec<Identifier> {
        let mut identifiers = Vec::new();
        if let Some(doctype) = document.doctype().filter(|d| d.has_external_id()) {
            identifiers.push(
                Identifier::new(
                    doctype.public_id.clone(),
                    doctype.system_id.clone(),
                    BindingKind::Doctype,
                )
                .with_range(
                    doctype
                        .system_id_range
                        .clone()
                        .or_else(|| doctype.public_id_range.clone()),
                ),
            );
        }
        identifiers.extend(xml_model_identifiers(document, DTD_EXTENSIONS, None));
        identifiers
    }

    fn create_content_model_document(
        &self,
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<ContentModelDocument>> {
        let grammar = DtdGrammar::read(source, entities, cancel)?;
        Ok(grammar.map(|grammar| {
            ContentModelDocument::new(Some(source.uri().to_string()), Arc::new(grammar))
        }))
    }

    fn create_internal_content_model_document(
        &self,
        document: &XmlDocument,
    ) -> Option<ContentModelDocument> {
        let subset = document.doctype()?.internal_subset.as_deref()?;
        match DtdGrammar::parse(subset, document.uri(), &CancellationToken::new()) {
            Ok(grammar) => Some(ContentModelDocument::new(None, Arc::new(grammar))),
            Err(e) => {
                warn!(
                    uri = document.uri().unwrap_or_default(),
                    error = %e,
                    "Cannot read internal subset"
                );
                None
            }
        }
    }
}
