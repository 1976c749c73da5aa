//! Orchestrates grammar resolution: providers claim documents, the resolver
//! chain turns their identifiers into locations, the resource store
//! materializes remote locations, and parsed documents are cached by
//! resolved location.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, DownloadFailure, ResourceCacheStore, ResourceStoreConfig};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::dom::{NodeId, XmlDocument};
use crate::dtd::DtdProvider;
use crate::entity::EntityResolver;
use crate::error::{ContentModelError, Result};
use crate::http_client::{AsyncHttpClient, HttpClientConfig, ResourceFetcher};
use crate::model::{ContentModelDocument, ElementDeclaration};
use crate::pool::GrammarPool;
use crate::provider::{ContentModelProvider, GrammarSource, Identifier};
use crate::relaxng::RelaxNgProvider;
use crate::resolver::{
    CatalogResolver, FileAssociation, FileAssociationResolver, ResolutionKind, ResolverChain,
    StandardResolver, UriResolver,
};
use crate::uri;
use crate::xsd::XsdProvider;

const DEFAULT_POOL_CAPACITY: u64 = 64;

/// Per-request knobs for resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub cancel: CancellationToken,
    /// How long to wait for a running download. `None` treats a download in
    /// progress as "no grammar yet".
    pub download_timeout: Option<Duration>,
    /// Include grammars embedded in the document (internal DTD subsets).
    pub with_internal: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            download_timeout: None,
            with_internal: true,
        }
    }
}

impl ResolveOptions {
    /// Options for consumers that need the grammar to proceed.
    pub fn waiting(timeout: Duration) -> Self {
        Self {
            download_timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// State of a remote grammar in the resource store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub cached_path: Option<PathBuf>,
    pub downloading: bool,
    pub download_disabled: bool,
    pub error: Option<DownloadFailure>,
}

/// How one grammar reference of a document was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedGrammarInfo {
    /// `None` for grammars found without a document-side reference, such as
    /// file associations.
    pub identifier: Option<Identifier>,
    pub resolved_uri: String,
    pub resolution: ResolutionKind,
    pub resolver: String,
    /// Present only for locations served through the resource store.
    pub cache_info: Option<CacheInfo>,
}

pub struct ContentModelManager {
    providers: RwLock<Vec<Arc<dyn ContentModelProvider>>>,
    resolver: Arc<ResolverChain>,
    file_associations: Arc<FileAssociationResolver>,
    catalogs: Arc<CatalogResolver>,
    documents: Mutex<HashMap<String, Arc<ContentModelDocument>>>,
    store: Arc<ResourceCacheStore>,
    fetcher: Arc<dyn ResourceFetcher>,
    pool: GrammarPool,
    use_cache: AtomicBool,
}

impl ContentModelManager {
    /// A manager with no providers and the resolver chain
    /// file association, catalog, standard.
    pub fn new(store_config: ResourceStoreConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        let file_associations = Arc::new(FileAssociationResolver::new());
        let catalogs = Arc::new(CatalogResolver::new());
        let resolver = Arc::new(ResolverChain::new());
        resolver.register(file_associations.clone());
        resolver.register(catalogs.clone());
        resolver.register(Arc::new(StandardResolver));

        Self {
            providers: RwLock::new(Vec::new()),
            resolver,
            file_associations,
            catalogs,
            documents: Mutex::new(HashMap::new()),
            store: Arc::new(ResourceCacheStore::new(store_config, fetcher.clone())),
            fetcher,
            pool: GrammarPool::new(DEFAULT_POOL_CAPACITY),
            use_cache: AtomicBool::new(true),
        }
    }

    pub fn with_pool_capacity(mut self, capacity: u64) -> Self {
        self.pool = GrammarPool::new(capacity);
        self
    }

    /// Build a manager with the XSD, DTD and RelaxNG providers from
    /// configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = AsyncHttpClient::new(HttpClientConfig {
            timeout_seconds: config.network.timeout_seconds,
            retry_attempts: config.network.retry_attempts,
            retry_delay_ms: config.network.retry_delay_ms,
            max_retry_delay_ms: config.network.max_retry_delay_ms,
            max_redirects: config.network.max_redirects,
            ..Default::default()
        })?;
        let store_config = ResourceStoreConfig {
            directory: config.cache.directory.clone(),
            download_external_resources: config.cache.download_external_resources,
            resource_ttl_hours: config.cache.resource_ttl_hours,
            negative_ttl_seconds: config.cache.negative_ttl_seconds,
        };

        let manager = Self::new(store_config, Arc::new(client))
            .with_pool_capacity(config.cache.max_pool_entries);
        manager.register_default_providers();
        manager.set_root_uri(config.resolution.root_uri.clone());
        manager.set_catalogs(&config.resolution.catalogs);
        manager.set_file_associations(&config.resolution.file_associations);
        manager.set_use_cache(config.cache.enabled);
        Ok(manager)
    }

    pub fn register_default_providers(&self) {
        self.register_provider(Arc::new(XsdProvider::new()));
        self.register_provider(Arc::new(DtdProvider::new()));
        self.register_provider(Arc::new(RelaxNgProvider::new()));
    }

    pub fn register_provider(&self, provider: Arc<dyn ContentModelProvider>) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    pub fn unregister_provider(&self, provider: &Arc<dyn ContentModelProvider>) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let before = providers.len();
        providers.retain(|p| !Arc::ptr_eq(p, provider));
        providers.len() != before
    }

    /// First provider recognising `location` by its extension.
    pub fn provider_by_uri(&self, location: &str) -> Option<Arc<dyn ContentModelProvider>> {
        self.providers_snapshot()
            .into_iter()
            .find(|p| p.adapts_uri(location))
    }

    /// Appends a resolver after the built-in ones.
    pub fn register_resolver(&self, resolver: Arc<dyn UriResolver>) {
        self.resolver.register(resolver);
    }

    pub fn unregister_resolver(&self, resolver: &Arc<dyn UriResolver>) -> bool {
        self.resolver.unregister(resolver)
    }

    pub fn resolver_chain(&self) -> &ResolverChain {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<ResourceCacheStore> {
        &self.store
    }

    /// Declaration for `node`, resolved through its ancestors.
    pub async fn find_declaration(
        &self,
        document: &XmlDocument,
        node: NodeId,
        namespace: Option<&str>,
        options: &ResolveOptions,
    ) -> Option<ElementDeclaration> {
        self.find_content_model_documents(document, namespace, options)
            .await
            .iter()
            .find_map(|cm| cm.find_cm_element(document, node, namespace))
    }

    /// Content model of the first provider that claims the document.
    pub async fn resolve_content_model_document(
        &self,
        document: &XmlDocument,
        namespace: Option<&str>,
        options: &ResolveOptions,
    ) -> Option<Arc<ContentModelDocument>> {
        self.collect_documents(document, namespace, options, true)
            .await
            .into_iter()
            .next()
    }

    /// Every content model bound to the document: internal subsets first,
    /// then each adapting provider's references in provider order.
    pub async fn find_content_model_documents(
        &self,
        document: &XmlDocument,
        namespace: Option<&str>,
        options: &ResolveOptions,
    ) -> Vec<Arc<ContentModelDocument>> {
        self.collect_documents(document, namespace, options, false)
            .await
    }

    async fn collect_documents(
        &self,
        document: &XmlDocument,
        namespace: Option<&str>,
        options: &ResolveOptions,
        first_only: bool,
    ) -> Vec<Arc<ContentModelDocument>> {
        // Unqualified local elements resolve through the document's namespace.
        let namespace = namespace.or(document.namespace_uri());
        let providers = self.providers_snapshot();
        let mut found: Vec<Arc<ContentModelDocument>> = Vec::new();

        if options.with_internal {
            for provider in providers.iter().filter(|p| p.adapts_document(document, true)) {
                if let Some(internal) = provider.create_internal_content_model_document(document) {
                    found.push(Arc::new(internal));
                    if first_only {
                        return found;
                    }
                }
            }
        }

        for provider in providers.iter().filter(|p| p.adapts_document(document, false)) {
            for identifier in provider.schema_identifiers(document, namespace) {
                if options.cancel.is_cancelled() {
                    return found;
                }
                let public_id = identifier.public_id.as_deref().or(namespace);
                let Some(resolved) = self.resolver.resolve(
                    document.uri(),
                    public_id,
                    identifier.system_id.as_deref(),
                ) else {
                    continue;
                };
                if let Some(cm) = self.load(&resolved, provider, options).await {
                    if !found.iter().any(|d| Arc::ptr_eq(d, &cm)) {
                        found.push(cm);
                    }
                    if first_only {
                        return found;
                    }
                }
            }
            if first_only {
                break;
            }
        }

        if found.is_empty()
            && let Some(resolved) = self.resolver.resolve(document.uri(), namespace, None)
        {
            match self.provider_by_uri(&resolved) {
                Some(provider) => {
                    if let Some(cm) = self.load(&resolved, &provider, options).await {
                        found.push(cm);
                    }
                }
                None => debug!(uri = %resolved, "No provider for resolved grammar"),
            }
        }
        found
    }

    /// Content model for a resolved location, from the document cache or
    /// freshly parsed. Failures are logged and become `None`.
    async fn load(
        &self,
        location: &str,
        provider: &Arc<dyn ContentModelProvider>,
        options: &ResolveOptions,
    ) -> Option<Arc<ContentModelDocument>> {
        if let Some(cached) = self.cached_document(location) {
            return Some(cached);
        }

        let source = self.materialize(location, options).await?;
        if options.cancel.is_cancelled() {
            return None;
        }

        let entities = ManagedEntities {
            resolver: self.resolver.clone(),
            store: self.store.clone(),
            fetcher: self.fetcher.clone(),
            use_cache: self.is_use_cache(),
            download_timeout: options.download_timeout,
            runtime: tokio::runtime::Handle::current(),
        };
        let parser = provider.clone();
        let cancel = options.cancel.clone();
        let parsed = tokio::task::spawn_blocking(move || {
            parser.create_content_model_document(&source, &entities, &cancel)
        })
        .await;

        match parsed {
            Ok(Ok(Some(document))) => Some(self.cache(location, Arc::new(document))),
            Ok(Ok(None)) => {
                warn!(uri = location, provider = provider.name(), "Grammar could not be parsed");
                None
            }
            Ok(Err(ContentModelError::Cancelled)) => {
                debug!(uri = location, provider = provider.name(), "Grammar parsing cancelled");
                None
            }
            Ok(Err(ContentModelError::Downloading { uri })) => {
                debug!(uri = location, pending = %uri, "Referenced grammar still downloading");
                None
            }
            Ok(Err(e)) => {
                warn!(uri = location, provider = provider.name(), error = %e, "Failed to load grammar");
                None
            }
            Err(e) => {
                warn!(uri = location, provider = provider.name(), error = %e, "Grammar parsing task failed");
                None
            }
        }
    }

    /// Local source for a location, downloading remote ones.
    async fn materialize(&self, location: &str, options: &ResolveOptions) -> Option<GrammarSource> {
        if !uri::is_remote(location) {
            let source = GrammarSource::from_uri(location);
            if source.is_none() {
                debug!(uri = location, "Grammar location is not a local file");
            }
            return source;
        }

        let remote = remote_source(
            &self.store,
            self.fetcher.as_ref(),
            self.is_use_cache(),
            location,
            options.download_timeout,
        );
        match remote.await {
            Ok(source) => source,
            Err(e) => {
                debug!(uri = location, error = %e, "Grammar not available yet");
                None
            }
        }
    }

    /// True if one of the document's references resolves to `grammar_uri`.
    pub fn depends_on_grammar(&self, document: &XmlDocument, grammar_uri: &str) -> bool {
        if grammar_uri.is_empty() {
            return false;
        }
        let namespace = document.namespace_uri();
        let referenced = self
            .providers_snapshot()
            .iter()
            .filter(|p| p.adapts_document(document, false))
            .flat_map(|p| p.schema_identifiers(document, namespace))
            .any(|identifier| {
                self.resolver.resolve(
                    document.uri(),
                    identifier.public_id.as_deref(),
                    identifier.system_id.as_deref(),
                )
                .as_deref()
                    == Some(grammar_uri)
            });
        referenced || self.resolver.resolve(document.uri(), None, None).as_deref() == Some(grammar_uri)
    }

    /// Which grammars the document references, how each was resolved, and
    /// the cache state of remote ones. Remote grammars not cached yet start
    /// downloading.
    pub async fn referenced_grammar_infos(&self, document: &XmlDocument) -> Vec<ReferencedGrammarInfo> {
        let mut requests: Vec<(Option<Identifier>, Option<String>, Option<String>)> = Vec::new();
        for provider in self.providers_snapshot().iter().filter(|p| p.adapts_document(document, false)) {
            for identifier in provider.schema_identifiers(document, None) {
                let public_id = identifier.public_id.clone();
                let system_id = identifier.system_id.clone();
                requests.push((Some(identifier), public_id, system_id));
            }
        }
        requests.push((None, document.namespace_uri().map(str::to_string), None));

        let mut infos: Vec<ReferencedGrammarInfo> = Vec::new();
        for (identifier, public_id, system_id) in requests {
            let Some(resolved) = self.resolver.resolve_info(
                document.uri(),
                public_id.as_deref(),
                system_id.as_deref(),
            ) else {
                continue;
            };
            let cache_info = self.cache_info(&resolved.uri).await;
            let info = ReferencedGrammarInfo {
                identifier,
                resolved_uri: resolved.uri,
                resolution: resolved.kind,
                resolver: resolved.resolver,
                cache_info,
            };
            if !infos.contains(&info) {
                infos.push(info);
            }
        }
        infos
    }

    async fn cache_info(&self, location: &str) -> Option<CacheInfo> {
        if !self.is_use_cache() || !self.store.can_use_cache(location) {
            return None;
        }
        let mut info = CacheInfo {
            cached_path: self.store.resource_cache_path(location).ok(),
            downloading: false,
            download_disabled: false,
            error: None,
        };
        match self.store.get_cached_resource(location).await {
            Ok(CacheLookup::Ready(path)) => info.cached_path = Some(path),
            Ok(CacheLookup::InProgress(_)) => info.downloading = true,
            Ok(CacheLookup::Disabled) => info.download_disabled = true,
            Ok(CacheLookup::Failed(failure)) => info.error = Some(failure),
            Err(e) => {
                info.error = Some(DownloadFailure {
                    uri: location.to_string(),
                    message: e.to_string(),
                    status: None,
                })
            }
        }
        Some(info)
    }

    /// Cached document for a resolved location. A dirty entry is evicted.
    pub fn cached_document(&self, location: &str) -> Option<Arc<ContentModelDocument>> {
        let document = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(location)
            .cloned()?;
        // Freshness checks stat files; keep them outside the lock.
        if !document.is_dirty() {
            return Some(document);
        }
        debug!(uri = location, "Evicting changed grammar");
        self.evict_if_same(location, &document);
        None
    }

    /// Remove `location` only while it still maps to `document`.
    fn evict_if_same(&self, location: &str, document: &Arc<ContentModelDocument>) -> bool {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        if documents
            .get(location)
            .is_some_and(|current| Arc::ptr_eq(current, document))
        {
            documents.remove(location);
            true
        } else {
            false
        }
    }

    /// Insert unless a clean document is already cached; returns the cached one.
    fn cache(&self, location: &str, document: Arc<ContentModelDocument>) -> Arc<ContentModelDocument> {
        if let Some(existing) = self.cached_document(location) {
            return existing;
        }
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location.to_string())
            .or_insert(document)
            .clone()
    }

    pub fn invalidate(&self, location: &str) -> bool {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location)
            .is_some()
    }

    pub fn clear(&self) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Resolution changes only; cached documents stay valid.
    pub fn set_catalogs(&self, catalogs: &[String]) -> bool {
        self.catalogs.set_catalogs(catalogs)
    }

    pub fn refresh_catalogs(&self) {
        self.catalogs.refresh_catalogs();
    }

    pub fn set_file_associations(&self, associations: &[FileAssociation]) -> bool {
        self.file_associations.set_file_associations(associations)
    }

    pub fn set_root_uri(&self, root_uri: Option<String>) {
        self.file_associations.set_root_uri(root_uri.clone());
        self.catalogs.set_root_uri(root_uri);
    }

    pub fn set_use_cache(&self, use_cache: bool) {
        self.use_cache.store(use_cache, Ordering::Release);
        if !use_cache {
            self.pool.clear();
        }
    }

    pub fn is_use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Acquire)
    }

    pub fn set_download_external_resources(&self, enabled: bool) {
        self.store.set_download_enabled(enabled);
    }

    /// The compiled-grammar pool, while caching is on.
    pub fn grammar_pool(&self) -> Option<&GrammarPool> {
        self.is_use_cache().then_some(&self.pool)
    }

    fn providers_snapshot(&self) -> Vec<Arc<dyn ContentModelProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Source for a remote location: the cached copy from the store, or a
/// direct fetch when the store is not used. `Err(Downloading)` when a
/// download is still running after `timeout`; `Ok(None)` when the location
/// cannot be served.
async fn remote_source(
    store: &ResourceCacheStore,
    fetcher: &dyn ResourceFetcher,
    use_cache: bool,
    location: &str,
    timeout: Option<Duration>,
) -> Result<Option<GrammarSource>> {
    let still_downloading = || ContentModelError::Downloading {
        uri: location.to_string(),
    };

    if use_cache && store.can_use_cache(location) {
        let path = match store.get_cached_resource(location).await {
            Ok(CacheLookup::Ready(path)) => path,
            Ok(CacheLookup::InProgress(handle)) => {
                let timeout = timeout.ok_or_else(still_downloading)?;
                match handle.wait_timeout(timeout).await {
                    Some(Ok(path)) => path,
                    Some(Err(failure)) => {
                        debug!(uri = location, error = %failure, "Grammar download failed");
                        return Ok(None);
                    }
                    None => return Err(still_downloading()),
                }
            }
            Ok(CacheLookup::Disabled) => {
                info!(uri = location, "Download of external resources is disabled");
                return Ok(None);
            }
            Ok(CacheLookup::Failed(failure)) => {
                debug!(uri = location, error = %failure, "Skipping recently failed download");
                return Ok(None);
            }
            Err(e) => {
                warn!(uri = location, error = %e, "Cannot cache grammar");
                return Ok(None);
            }
        };
        return Ok(Some(GrammarSource::File {
            uri: location.to_string(),
            path,
        }));
    }

    if !store.is_download_enabled() {
        info!(uri = location, "Download of external resources is disabled");
        return Ok(None);
    }
    match fetcher.fetch(location).await {
        Ok(fetched) => Ok(Some(GrammarSource::Inline {
            uri: location.to_string(),
            text: String::from_utf8_lossy(&fetched.data).into_owned(),
        })),
        Err(e) => {
            warn!(uri = location, error = %e, "Failed to fetch grammar");
            Ok(None)
        }
    }
}

/// Resolves the references a grammar makes while it is read, the way a
/// document's own references are resolved: through the resolver chain, with
/// remote locations served by the resource store. Downloaded copies are
/// returned as files so the document tracks them.
struct ManagedEntities {
    resolver: Arc<ResolverChain>,
    store: Arc<ResourceCacheStore>,
    fetcher: Arc<dyn ResourceFetcher>,
    use_cache: bool,
    download_timeout: Option<Duration>,
    runtime: tokio::runtime::Handle,
}

impl EntityResolver for ManagedEntities {
    fn resolve_entity(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Result<Option<GrammarSource>> {
        let Some(resolved) = self.resolver.resolve_nested(base_uri, public_id, system_id) else {
            return Ok(None);
        };
        if !uri::is_remote(&resolved.uri) {
            return Ok(GrammarSource::from_uri(&resolved.uri)
                .filter(|source| source.path().is_some_and(Path::is_file)));
        }
        // Readers run on the blocking pool, where waiting on the runtime is allowed.
        self.runtime.block_on(remote_source(
            &self.store,
            self.fetcher.as_ref(),
            self.use_cache,
            &resolved.uri,
            self.download_timeout,
        ))
    }
}

impl std::fmt::Debug for ContentModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentModelManager")
            .field("providers", &self.providers_snapshot().iter().map(|p| p.name().to_string()).collect::<Vec<_>>())
            .field("resolvers", &self.resolver.names())
            .field("use_cache", &self.is_use_cache())
            .field("store", &self.store)
            .finish()
    }
}
