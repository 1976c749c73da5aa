//! RelaxNG content model provider. Only the XML syntax is read.

mod reader;

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::dom::XmlDocument;
use crate::entity::EntityResolver;
use crate::error::Result;
use crate::model::ContentModelDocument;
use crate::provider::{xml_model_identifiers, ContentModelProvider, GrammarSource, Identifier};
use crate::uri;

pub use reader::{RelaxNgGrammar, RNG_NAMESPACE};

/// Claims documents associated through `xml-model` with an `.rng` href or
/// the RelaxNG `schematypens`.
#[derive(Debug, Default)]
pub struct RelaxNgProvider;

impl RelaxNgProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ContentModelProvider for RelaxNgProvider {
    fn name(&self) -> &str {
        "relaxng"
    }

    fn adapts_document(&self, document: &XmlDocument, internal: bool) -> bool {
        !internal && !xml_model_identifiers(document, &["rng"], Some(RNG_NAMESPACE)).is_empty()
    }

    fn adapts_uri(&self, location: &str) -> bool {
        uri::extension(location).as_deref() == Some("rng")
    }

    fn schema_identifiers(
        &self,
        document: &XmlDocument,
        _namespace_uri: Option<&str>,
    ) -> Vec<Identifier> {
        xml_model_identifiers(document, &["rng"], Some(RNG_NAMESPACE))
    }

    fn create_content_model_document(
        &self,
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> Result<Option<ContentModelDocument>> {
        let grammar = RelaxNgGrammar::read(source, entities, cancel)?;
        Ok(grammar.map(|grammar| {
            ContentModelDocument::new(Some(source.uri().to_string()), Arc::new(grammar))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::LocalEntityResolver;
    use crate::error::ContentModelError;

    #[test]
    fn test_adapts_xml_model_documents() {
        let provider = RelaxNgProvider::new();
        let by_href = XmlDocument::parse(None, "<?xml-model href=\"a.rng\"?><root/>").unwrap();
        let by_namespace = XmlDocument::parse(
            None,
            "<?xml-model href=\"grammar\" schematypens=\"http://relaxng.org/ns/structure/1.0\"?><root/>",
        )
        .unwrap();
        let other = XmlDocument::parse(None, "<?xml-model href=\"a.xsd\"?><root/>").unwrap();

        assert!(provider.adapts_document(&by_href, false));
        assert!(!provider.adapts_document(&by_href, true));
        assert!(provider.adapts_document(&by_namespace, false));
        assert!(!provider.adapts_document(&other, false));
        assert!(provider.adapts_uri("http://example.com/a.rng"));
        assert!(!provider.adapts_uri("http://example.com/a.rnc"));
    }

    #[test]
    fn test_cancelled_read_is_an_error() {
        let provider = RelaxNgProvider::new();
        let source = GrammarSource::Inline {
            uri: "file:///a.rng".to_string(),
            text: r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
  <start><element name="a"><empty/></element></start>
</grammar>"#
                .to_string(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = provider.create_content_model_document(&source, &LocalEntityResolver, &cancel);
        assert!(matches!(result, Err(ContentModelError::Cancelled)));
    }
}
