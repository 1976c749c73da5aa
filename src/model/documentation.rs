use crate::uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentationFormat {
    #[default]
    PlainText,
    Markdown,
}

/// How a client wants declaration documentation rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentationRequest {
    pub format: DocumentationFormat,
    /// Append a reference to the grammar the declaration comes from.
    pub include_source: bool,
}

impl DocumentationRequest {
    pub fn plain_text() -> Self {
        Self::default()
    }

    pub fn markdown() -> Self {
        Self {
            format: DocumentationFormat::Markdown,
            include_source: false,
        }
    }

    pub fn with_source(mut self, include_source: bool) -> Self {
        self.include_source = include_source;
        self
    }

    pub(crate) fn render(&self, text: Option<&str>, source_uri: Option<&str>) -> Option<String> {
        let text = text.map(str::trim).filter(|t| !t.is_empty());
        let source = source_uri.filter(|_| self.include_source).map(|uri| {
            match self.format {
                DocumentationFormat::Markdown => {
                    format!("Source: [{}]({})", uri::file_name(uri), uri)
                }
                DocumentationFormat::PlainText => format!("Source: {}", uri::file_name(uri)),
            }
        });

        match (text, source) {
            (Some(text), Some(source)) => Some(format!("{}\n\n{}", text, source)),
            (Some(text), None) => Some(text.to_string()),
            (None, Some(source)) => Some(source),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_without_source() {
        let request = DocumentationRequest::plain_text();
        assert_eq!(
            request.render(Some("  A note.  "), Some("file:///s/note.xsd")).as_deref(),
            Some("A note.")
        );
        assert!(request.render(Some("   "), None).is_none());
    }

    #[test]
    fn test_markdown_source_link() {
        let request = DocumentationRequest::markdown().with_source(true);
        assert_eq!(
            request.render(Some("A note."), Some("file:///s/note.xsd")).as_deref(),
            Some("A note.\n\nSource: [note.xsd](file:///s/note.xsd)")
        );
        assert_eq!(
            request.render(None, Some("file:///s/note.xsd")).as_deref(),
            Some("Source: [note.xsd](file:///s/note.xsd)")
        );
    }

    #[test]
    fn test_plain_text_source_name() {
        let request = DocumentationRequest::plain_text().with_source(true);
        assert_eq!(
            request.render(Some("Doc"), Some("http://example.com/a/b.dtd")).as_deref(),
            Some("Doc\n\nSource: b.dtd")
        );
    }
}
