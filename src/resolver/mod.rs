//! Ordered chain of strategies mapping a schema reference to a location.

pub mod catalog;
pub mod file_association;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::uri;

pub use catalog::{CatalogResolver, XmlCatalog};
pub use file_association::{FileAssociation, FileAssociationResolver};

/// Which kind of strategy produced a resolved location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionKind {
    FileAssociation,
    Catalog,
    /// The format's own binding convention (schemaLocation, DOCTYPE, ...).
    Standard,
    Custom,
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResolutionKind::FileAssociation => "file association",
            ResolutionKind::Catalog => "catalog",
            ResolutionKind::Standard => "standard",
            ResolutionKind::Custom => "custom",
        };
        f.write_str(label)
    }
}

/// One resolution strategy.
///
/// `resolve` must not cache its answers; the manager owns caching.
pub trait UriResolver: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::Custom
    }

    fn resolve(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Option<String>;
}

/// A resolved location and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUri {
    pub uri: String,
    pub kind: ResolutionKind,
    pub resolver: String,
}

/// Resolvers tried in registration order; the first non-`None` answer wins.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: RwLock<Vec<Arc<dyn UriResolver>>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resolver: Arc<dyn UriResolver>) {
        self.resolvers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resolver);
    }

    /// Remove a previously registered resolver instance.
    pub fn unregister(&self, resolver: &Arc<dyn UriResolver>) -> bool {
        let mut resolvers = self
            .resolvers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = resolvers.len();
        resolvers.retain(|r| !Arc::ptr_eq(r, resolver));
        resolvers.len() != before
    }

    pub fn resolve(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Option<String> {
        self.resolve_info(base_uri, public_id, system_id)
            .map(|resolved| resolved.uri)
    }

    pub fn resolve_info(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Option<ResolvedUri> {
        self.resolve_matching(base_uri, public_id, system_id, |_| true)
    }

    /// Resolution of a reference made by a grammar rather than a document.
    /// File associations bind documents only and are skipped.
    pub fn resolve_nested(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Option<ResolvedUri> {
        self.resolve_matching(base_uri, public_id, system_id, |kind| {
            kind != ResolutionKind::FileAssociation
        })
    }

    fn resolve_matching(
        &self,
        base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
        accept: impl Fn(ResolutionKind) -> bool,
    ) -> Option<ResolvedUri> {
        // Snapshot so a resolver doing I/O never holds the registry lock.
        let resolvers = self
            .resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let resolved = resolvers
            .iter()
            .filter(|resolver| accept(resolver.kind()))
            .find_map(|resolver| {
                resolver
                    .resolve(base_uri, public_id, system_id)
                    .map(|uri| ResolvedUri {
                        uri,
                        kind: resolver.kind(),
                        resolver: resolver.name().to_string(),
                    })
            });

        if resolved.is_none() {
            debug!(
                base_uri = base_uri.unwrap_or_default(),
                public_id = public_id.unwrap_or_default(),
                system_id = system_id.unwrap_or_default(),
                "No resolver matched"
            );
        }
        resolved
    }

    pub fn names(&self) -> Vec<String> {
        self.resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expands the system id against the document location.
#[derive(Debug, Default)]
pub struct StandardResolver;

impl UriResolver for StandardResolver {
    fn name(&self) -> &str {
        "standard"
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::Standard
    }

    fn resolve(
        &self,
        base_uri: Option<&str>,
        _public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Option<String> {
        uri::expand_system_id(system_id?, base_uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        answer: Option<&'static str>,
    }

    impl UriResolver for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn resolve(&self, _: Option<&str>, _: Option<&str>, _: Option<&str>) -> Option<String> {
            self.answer.map(str::to_string)
        }
    }

    fn fixed(name: &'static str, answer: Option<&'static str>) -> Arc<dyn UriResolver> {
        Arc::new(Fixed { name, answer })
    }

    #[test]
    fn test_first_match_wins() {
        let chain = ResolverChain::new();
        chain.register(fixed("none", None));
        chain.register(fixed("a", Some("file:///a.xsd")));
        chain.register(fixed("b", Some("file:///b.xsd")));

        let resolved = chain.resolve_info(None, None, Some("x.xsd")).unwrap();
        assert_eq!(resolved.uri, "file:///a.xsd");
        assert_eq!(resolved.resolver, "a");
        assert_eq!(resolved.kind, ResolutionKind::Custom);
    }

    struct Associated;

    impl UriResolver for Associated {
        fn name(&self) -> &str {
            "associated"
        }

        fn kind(&self) -> ResolutionKind {
            ResolutionKind::FileAssociation
        }

        fn resolve(&self, _: Option<&str>, _: Option<&str>, _: Option<&str>) -> Option<String> {
            Some("file:///associated.xsd".to_string())
        }
    }

    #[test]
    fn test_nested_resolution_skips_file_associations() {
        let chain = ResolverChain::new();
        chain.register(Arc::new(Associated));
        chain.register(Arc::new(StandardResolver));

        let document = chain.resolve_info(Some("file:///work/a.xsd"), None, Some("b.xsd")).unwrap();
        assert_eq!(document.kind, ResolutionKind::FileAssociation);

        let nested = chain
            .resolve_nested(Some("file:///work/a.xsd"), None, Some("b.xsd"))
            .unwrap();
        assert_eq!(nested.uri, "file:///work/b.xsd");
        assert_eq!(nested.kind, ResolutionKind::Standard);
    }

    #[test]
    fn test_unregister_by_instance() {
        let chain = ResolverChain::new();
        let a = fixed("a", Some("file:///a.xsd"));
        let b = fixed("b", Some("file:///b.xsd"));
        chain.register(a.clone());
        chain.register(b);

        assert!(chain.unregister(&a));
        assert!(!chain.unregister(&a));
        assert_eq!(chain.names(), vec!["b".to_string()]);
        assert_eq!(chain.resolve(None, None, None).as_deref(), Some("file:///b.xsd"));
    }

    #[test]
    fn test_empty_chain_resolves_nothing() {
        let chain = ResolverChain::new();
        assert!(chain.is_empty());
        assert!(chain.resolve(Some("file:///doc.xml"), None, Some("a.xsd")).is_none());
    }

    #[test]
    fn test_standard_resolver() {
        let resolver = StandardResolver;
        assert_eq!(
            resolver
                .resolve(Some("file:///work/doc.xml"), None, Some("a.xsd"))
                .as_deref(),
            Some("file:///work/a.xsd")
        );
        assert!(resolver.resolve(Some("file:///work/doc.xml"), Some("urn:x"), None).is_none());
    }
}
