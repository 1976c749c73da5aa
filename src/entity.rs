//! Nested grammar references: includes, imports and external parameter
//! entities that a grammar pulls in while it is being read.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::provider::GrammarSource;
use crate::uri;

/// Maps a reference made by a grammar to something readable.
///
/// Called from the blocking thread a grammar is read on.
pub trait EntityResolver: Send + Sync {
    /// `public_id` carries the imported namespace for XML Schema imports.
    ///
    /// `Ok(None)` when the reference cannot be served; the reader goes on
    /// without it. `Err(Cancelled)` or `Err(Downloading)` abandon the read.
    fn resolve_entity(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Result<Option<GrammarSource>>;
}

/// Expands the system id against its base and serves local files only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEntityResolver;

impl EntityResolver for LocalEntityResolver {
    fn resolve_entity(
        &self,
        base_uri: Option<&str>,
        _public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Result<Option<GrammarSource>> {
        let Some(location) = system_id.and_then(|id| uri::expand_system_id(id, base_uri)) else {
            return Ok(None);
        };
        Ok(uri::to_file_path(&location)
            .filter(|path| path.is_file())
            .map(|path| GrammarSource::File { uri: location, path }))
    }
}

/// State shared by the read of one grammar and everything it pulls in:
/// which locations were read already and which files they came from.
pub struct ReadSession<'a> {
    entities: &'a dyn EntityResolver,
    cancel: &'a CancellationToken,
    visited: HashSet<String>,
    files: Vec<PathBuf>,
}

/// A nested reference opened by a [`ReadSession`].
#[derive(Debug)]
pub struct NestedText {
    /// Base for the nested grammar's own references.
    pub uri: String,
    pub text: String,
}

impl<'a> ReadSession<'a> {
    pub fn new(entities: &'a dyn EntityResolver, cancel: &'a CancellationToken) -> Self {
        Self {
            entities,
            cancel,
            visited: HashSet::new(),
            files: Vec::new(),
        }
    }

    /// Mark the main source as read.
    pub fn enter(&mut self, source: &GrammarSource) {
        self.visited.insert(source.uri().to_string());
        if let Some(path) = source.path() {
            self.track(path.to_path_buf());
        }
    }

    pub fn check(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Text of a nested reference, or `None` when it cannot be served or
    /// was read before in this session.
    pub fn open(
        &mut self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Result<Option<NestedText>> {
        self.check()?;
        let Some(source) = self.entities.resolve_entity(base_uri, public_id, system_id)? else {
            debug!(
                base_uri = base_uri.unwrap_or_default(),
                public_id = public_id.unwrap_or_default(),
                system_id = system_id.unwrap_or_default(),
                "Skipping unresolved grammar reference"
            );
            return Ok(None);
        };
        if !self.visited.insert(source.uri().to_string()) {
            return Ok(None);
        }
        let text = match source.read_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(location = source.uri(), error = %e, "Cannot read referenced grammar");
                return Ok(None);
            }
        };
        if let Some(path) = source.path() {
            self.track(path.to_path_buf());
        }
        Ok(Some(NestedText {
            uri: source.uri().to_string(),
            text,
        }))
    }

    /// Every file read so far, main source first.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn into_files(self) -> Vec<PathBuf> {
        self.files
    }

    fn track(&mut self, path: PathBuf) {
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContentModelError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(Option<String>, Option<String>)>>,
    }

    impl EntityResolver for Recording {
        fn resolve_entity(
            &self,
            _base_uri: Option<&str>,
            public_id: Option<&str>,
            system_id: Option<&str>,
        ) -> Result<Option<GrammarSource>> {
            self.calls.lock().unwrap().push((
                public_id.map(str::to_string),
                system_id.map(str::to_string),
            ));
            Ok(system_id.map(|id| GrammarSource::Inline {
                uri: format!("http://example.com/{id}"),
                text: format!("<{id}/>"),
            }))
        }
    }

    #[test]
    fn test_local_resolver_serves_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.xsd"), "<a/>").unwrap();
        let base = uri::from_file_path(&dir.path().join("main.xsd")).unwrap();

        let found = LocalEntityResolver
            .resolve_entity(Some(&base), None, Some("a.xsd"))
            .unwrap()
            .unwrap();
        assert_eq!(found.path(), Some(dir.path().join("a.xsd").as_path()));
        assert!(LocalEntityResolver
            .resolve_entity(Some(&base), None, Some("missing.xsd"))
            .unwrap()
            .is_none());
        assert!(LocalEntityResolver
            .resolve_entity(Some(&base), None, Some("http://example.com/a.xsd"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_session_reads_each_location_once() {
        let resolver = Recording::default();
        let cancel = CancellationToken::new();
        let mut session = ReadSession::new(&resolver, &cancel);
        session.enter(&GrammarSource::Inline {
            uri: "http://example.com/main.xsd".to_string(),
            text: String::new(),
        });

        let nested = session
            .open(Some("http://example.com/main.xsd"), Some("urn:a"), Some("a.xsd"))
            .unwrap()
            .unwrap();
        assert_eq!(nested.uri, "http://example.com/a.xsd");
        assert_eq!(nested.text, "<a.xsd/>");
        assert!(session.open(None, None, Some("a.xsd")).unwrap().is_none());
        assert!(session.open(None, None, Some("main.xsd")).unwrap().is_none());
        assert!(session.files().is_empty());

        let calls = resolver.calls.lock().unwrap();
        assert_eq!(calls[0], (Some("urn:a".to_string()), Some("a.xsd".to_string())));
    }

    #[test]
    fn test_cancelled_session_stops_opening() {
        let resolver = Recording::default();
        let cancel = CancellationToken::new();
        let mut session = ReadSession::new(&resolver, &cancel);
        cancel.cancel();

        assert!(matches!(
            session.open(None, None, Some("a.xsd")),
            Err(ContentModelError::Cancelled)
        ));
        assert!(resolver.calls.lock().unwrap().is_empty());
    }
}
