//! # xml-content-model Library
//!
//! Grammar resolution and content-model caching for XML tooling. Finds the
//! DTD, XML Schema or RelaxNG grammar bound to a document, resolves it
//! through file associations, XML catalogs and standard conventions, caches
//! remote grammars on disk, and exposes a format-agnostic model of element
//! and attribute declarations.

pub mod cache;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod dom;
pub mod dtd;
pub mod entity;
pub mod error;
pub mod freshness;
pub mod http_client;
pub mod manager;
pub mod model;
pub mod pool;
pub mod provider;
pub mod relaxng;
pub mod resolver;
pub mod uri;
pub mod xsd;

pub use cache::{
    CacheLookup, CacheMetadata, DownloadFailure, DownloadHandle, DownloadState,
    ResourceCacheStore, ResourceStoreConfig,
};
pub use cancel::CancellationToken;
pub use cli::Cli;
pub use config::{Config, ConfigError, ConfigManager, EnvProvider};
pub use dom::{NodeId, XmlDocument};
pub use dtd::DtdProvider;
pub use entity::{EntityResolver, LocalEntityResolver, ReadSession};
pub use error::{ContentModelError, Result};
pub use freshness::FilesChangedTracker;
pub use http_client::{AsyncHttpClient, FetchedResource, HttpClientConfig, ResourceFetcher};
pub use manager::{CacheInfo, ContentModelManager, ReferencedGrammarInfo, ResolveOptions};
pub use model::{
    AttributeDeclaration, ContentModelDocument, DocumentationFormat, DocumentationRequest,
    ElementDeclaration, GrammarKind, NativeGrammar,
};
pub use pool::GrammarPool;
pub use provider::{BindingKind, ContentModelProvider, GrammarSource, Identifier};
pub use relaxng::RelaxNgProvider;
pub use resolver::{
    CatalogResolver, FileAssociation, FileAssociationResolver, ResolutionKind, ResolverChain,
    StandardResolver, UriResolver,
};
pub use xsd::XsdProvider;
