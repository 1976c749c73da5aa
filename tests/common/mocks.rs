use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use xml_content_model::model::{AttributeInfo, ChildParticle, DeclId, ElementInfo};
use xml_content_model::xsd::XsdGrammar;
use xml_content_model::{
    CancellationToken, ContentModelDocument, ContentModelError, ContentModelProvider,
    EntityResolver, FetchedResource, GrammarKind, GrammarSource, Identifier, NativeGrammar, ResourceFetcher,
    XmlDocument, XsdProvider,
};

/// XSD provider that counts parses and child lookups on the grammars it
/// produces. It can also cancel its own next parse midway, like a client
/// abandoning a request while the grammar is being read.
pub struct CountingXsdProvider {
    inner: XsdProvider,
    pub parses: Arc<AtomicUsize>,
    pub child_calls: Arc<AtomicUsize>,
    cancel_next: AtomicBool,
}

impl CountingXsdProvider {
    pub fn new() -> Self {
        Self {
            inner: XsdProvider::new(),
            parses: Arc::new(AtomicUsize::new(0)),
            child_calls: Arc::new(AtomicUsize::new(0)),
            cancel_next: AtomicBool::new(false),
        }
    }

    pub fn cancel_next_parse(&self) {
        self.cancel_next.store(true, Ordering::SeqCst);
    }

    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn child_call_count(&self) -> usize {
        self.child_calls.load(Ordering::SeqCst)
    }
}

impl ContentModelProvider for CountingXsdProvider {
    fn name(&self) -> &str {
        "counting-xsd"
    }

    fn adapts_document(&self, document: &XmlDocument, internal: bool) -> bool {
        self.inner.adapts_document(document, internal)
    }

    fn adapts_uri(&self, uri: &str) -> bool {
        self.inner.adapts_uri(uri)
    }

    fn schema_identifiers(
        &self,
        document: &XmlDocument,
        namespace_uri: Option<&str>,
    ) -> Vec<Identifier> {
        self.inner.schema_identifiers(document, namespace_uri)
    }

    fn create_content_model_document(
        &self,
        source: &GrammarSource,
        entities: &dyn EntityResolver,
        cancel: &CancellationToken,
    ) -> xml_content_model::Result<Option<ContentModelDocument>> {
        self.parses.fetch_add(1, Ordering::SeqCst);
        if self.cancel_next.swap(false, Ordering::SeqCst) {
            cancel.cancel();
        }
        let Some(grammar) = XsdGrammar::read(source, entities, cancel)? else {
            return Ok(None);
        };
        let counting = CountingGrammar {
            inner: Arc::new(grammar),
            child_calls: self.child_calls.clone(),
        };
        Ok(Some(ContentModelDocument::new(
            Some(source.uri().to_string()),
            Arc::new(counting),
        )))
    }
}

#[derive(Debug)]
struct CountingGrammar {
    inner: Arc<dyn NativeGrammar>,
    child_calls: Arc<AtomicUsize>,
}

impl NativeGrammar for CountingGrammar {
    fn kind(&self) -> GrammarKind {
        self.inner.kind()
    }

    fn target_namespaces(&self) -> Vec<String> {
        self.inner.target_namespaces()
    }

    fn element_count(&self) -> usize {
        self.inner.element_count()
    }

    fn top_level_elements(&self) -> Vec<DeclId> {
        self.inner.top_level_elements()
    }

    fn element(&self, id: DeclId) -> ElementInfo {
        self.inner.element(id)
    }

    fn child_particles(&self, id: DeclId) -> Vec<ChildParticle> {
        self.child_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.child_particles(id)
    }

    fn attributes(&self, id: DeclId) -> Vec<AttributeInfo> {
        self.inner.attributes(id)
    }

    fn element_documentation(&self, id: DeclId) -> Option<String> {
        self.inner.element_documentation(id)
    }

    fn source_files(&self) -> Vec<PathBuf> {
        self.inner.source_files()
    }
}

/// In-memory fetcher that takes `delay` per request and logs every request.
pub struct DelayedFetcher {
    resources: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
    delay: Duration,
}

impl DelayedFetcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn add_resource(&self, uri: &str, body: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert(uri.to_string(), body.as_bytes().to_vec());
    }

    pub fn request_count(&self, uri: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == uri)
            .count()
    }
}

#[async_trait]
impl ResourceFetcher for DelayedFetcher {
    async fn fetch(&self, uri: &str) -> xml_content_model::Result<FetchedResource> {
        self.requests.lock().unwrap().push(uri.to_string());
        tokio::time::sleep(self.delay).await;

        let body = self.resources.lock().unwrap().get(uri).cloned();
        match body {
            Some(data) => Ok(FetchedResource {
                data,
                ..Default::default()
            }),
            None => Err(ContentModelError::HttpStatus {
                url: uri.to_string(),
                status: 404,
                message: "HTTP 404: Not Found".to_string(),
            }),
        }
    }
}
