//! XML Schema content model provider.

mod reader;

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::dom::XmlDocument;
use crate::entity::EntityResolver;
use crate::error::Result;
use crate::model::ContentModelDocument;
use crate::provider::{
    xml_model_identifiers, BindingKind, ContentModelProvider, GrammarSource, Identifier,
};
use crate::uri;

pub use reader::{XsdGrammar, XS_NAMESPACE};

/// Claims documents bound with `xsi:schemaLocation`,
/// `xsi:noNamespaceSchemaLocation` or an `xml-model` pointing at an `.xsd`.
#[derive(Debug, Default)]
pub struct XsdProvider;

impl XsdProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ContentModelProvider for XsdProvider {
    fn name(&self) -> &str {
        "xsd"
    }

    fn adapts_document(&self, document: &XmlDocument, internal: bool) -> bool {
        if internal {
            return false;
        }
        document.has_schema_location()
            || document.has_no_namespace_schema_location()
            || !xml_model_identifiers(document, &["xsd"], Some(XS_NAMESPACE)).is_empty()
    }

    fn adapts_uri(&self, location: &str) -> bool {
        uri::extension(location).as_deref() == Some("xsd")
    }

    fn schema_identifiers(
        &self,
        document: &XmlDocument,
        namespace_uri: Option<&str>,
    ) -> Vec<Identifier> {
        let mut identifiers = Vec::new();
        match namespace_uri {
            Some(namespace) => {
                if let Some(hint) = document.schema_location_hint(namespace) {
                    identifiers.push(
                        Identifier::new(
                            Some(namespace.to_string()),
                            Some(hint.location),
                            BindingKind::SchemaLocation,
                        )
                        .with_range(Some(hint.range)),
                    );
                }
            }
            None => {
                if let Some(location) = document.no_namespace_schema_location() {
                    identifiers.push(
                        Identifier::new(
                            None,
                            Some(location.location),
                            BindingKind::NoNamespaceSchemaLocation,
                        )
                        .with_range(Some(location.range)),
                    );
                }
            }
        }
        identifiers.extend(xml_model_identifiers(document, &["xsd"], Some(XS_NAMESPACE)));
        identifiers
    }

    fn create_content_model_document(
        &self,
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<ContentModelDocument>> {
        let grammar = XsdGrammar::read(source, entities, cancel)?;
        Ok(grammar.map(|grammar| {
            ContentModelDocument::new(Some(source.uri().to_string()), Arc::new(grammar))
        }))
    }
}
