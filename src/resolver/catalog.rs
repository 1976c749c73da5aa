//! OASIS XML catalog support.
//!
//! Supported entries: `system`, `public`, `uri`, `rewriteSystem`,
//! `rewriteURI`, `systemSuffix`, `group` (with `xml:base`) and
//! `nextCatalog`. Relative targets are expanded against the catalog file, or
//! the closest `xml:base`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};
use url::Url;

use super::{ResolutionKind, UriResolver};
use crate::error::{ContentModelError, Result};
use crate::uri;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Parsed catalog file, including the catalogs it chains to.
#[derive(Debug, Clone, Default)]
pub struct XmlCatalog {
    system: HashMap<String, String>,
    public: HashMap<String, String>,
    uri: HashMap<String, String>,
    rewrite_system: Vec<(String, String)>,
    rewrite_uri: Vec<(String, String)>,
    system_suffix: Vec<(String, String)>,
    next_catalogs: Vec<XmlCatalog>,
    path: Option<PathBuf>,
}

impl XmlCatalog {
    /// Load a catalog file and every catalog reachable through `nextCatalog`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut visited = HashSet::new();
        Self::load(path.as_ref(), &mut visited)
    }

    fn load(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<Self> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        visited.insert(canonical.clone());

        let content = fs::read_to_string(path).map_err(|e| ContentModelError::Catalog {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        let base = Url::from_file_path(&canonical).map_err(|_| ContentModelError::Catalog {
            path: path.to_path_buf(),
            details: "catalog path cannot be expressed as a URI".to_string(),
        })?;

        let mut catalog = Self::parse_with_base(&content, &base).map_err(|details| {
            ContentModelError::Catalog {
                path: path.to_path_buf(),
                details,
            }
        })?;
        catalog.path = Some(path.to_path_buf());

        let pending = std::mem::take(&mut catalog.next_catalogs);
        for next in pending {
            let Some(next_path) = next.path else { continue };
            let next_canonical = fs::canonicalize(&next_path).unwrap_or_else(|_| next_path.clone());
            if visited.contains(&next_canonical) {
                continue;
            }
            match Self::load(&next_path, visited) {
                Ok(next) => catalog.next_catalogs.push(next),
                Err(e) => warn!(error = %e, "Skipping next catalog"),
            }
        }
        Ok(catalog)
    }

    /// Parse catalog text; relative targets are expanded against `base`.
    /// `nextCatalog` entries are recorded but not loaded.
    pub fn parse_with_base(content: &str, base: &Url) -> std::result::Result<Self, String> {
        let document = roxmltree::Document::parse(content).map_err(|e| e.to_string())?;
        let root = document.root_element();
        if root.tag_name().name() != "catalog" {
            return Err(format!(
                "expected catalog root element, got {}",
                root.tag_name().name()
            ));
        }

        let mut catalog = Self::default();
        let base = with_xml_base(root, base);
        catalog.read_entries(root, &base);
        Ok(catalog)
    }

    fn read_entries(&mut self, parent: roxmltree::Node<'_, '_>, base: &Url) {
        for child in parent.children().filter(|n| n.is_element()) {
            let base = with_xml_base(child, base);
            let expand = |target: &str| {
                base.join(target)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| target.to_string())
            };
            match child.tag_name().name() {
                "system" => {
                    if let (Some(id), Some(target)) =
                        (child.attribute("systemId"), child.attribute("uri"))
                    {
                        self.system.insert(id.to_string(), expand(target));
                    }
                }
                "public" => {
                    if let (Some(id), Some(target)) =
                        (child.attribute("publicId"), child.attribute("uri"))
                    {
                        self.public
                            .insert(normalize_public_id(id), expand(target));
                    }
                }
                "uri" => {
                    if let (Some(name), Some(target)) =
                        (child.attribute("name"), child.attribute("uri"))
                    {
                        self.uri.insert(name.to_string(), expand(target));
                    }
                }
                "rewriteSystem" => {
                    if let (Some(prefix), Some(target)) = (
                        child.attribute("systemIdStartString"),
                        child.attribute("rewritePrefix"),
                    ) {
                        self.rewrite_system
                            .push((prefix.to_string(), expand(target)));
                    }
                }
                "rewriteURI" => {
                    if let (Some(prefix), Some(target)) = (
                        child.attribute("uriStartString"),
                        child.attribute("rewritePrefix"),
                    ) {
                        self.rewrite_uri.push((prefix.to_string(), expand(target)));
                    }
                }
                "systemSuffix" => {
                    if let (Some(suffix), Some(target)) = (
                        child.attribute("systemIdSuffix"),
                        child.attribute("uri"),
                    ) {
                        self.system_suffix
                            .push((suffix.to_string(), expand(target)));
                    }
                }
                "group" => self.read_entries(child, &base),
                "nextCatalog" => {
                    if let Some(path) = child
                        .attribute("catalog")
                        .and_then(|c| base.join(c).ok())
                        .and_then(|u| u.to_file_path().ok())
                    {
                        self.next_catalogs.push(XmlCatalog {
                            path: Some(path),
                            ..XmlCatalog::default()
                        });
                    }
                }
                _ => {}
            }
        }
    }

    /// Resolve an external identifier. System entries are consulted before
    /// public ones; chained catalogs only when this one has no answer.
    pub fn resolve(&self, public_id: Option<&str>, system_id: Option<&str>) -> Option<String> {
        let own = system_id
            .and_then(|id| self.resolve_system_local(id))
            .or_else(|| {
                public_id.and_then(|id| self.public.get(&normalize_public_id(id)).cloned())
            });
        own.or_else(|| {
            self.next_catalogs
                .iter()
                .find_map(|next| next.resolve(public_id, system_id))
        })
    }

    /// Resolve a URI reference, such as a namespace name.
    pub fn resolve_uri(&self, name: &str) -> Option<String> {
        self.uri
            .get(name)
            .cloned()
            .or_else(|| rewrite(&self.rewrite_uri, name))
            .or_else(|| self.next_catalogs.iter().find_map(|next| next.resolve_uri(name)))
    }

    fn resolve_system_local(&self, system_id: &str) -> Option<String> {
        self.system
            .get(system_id)
            .cloned()
            .or_else(|| rewrite(&self.rewrite_system, system_id))
            .or_else(|| {
                self.system_suffix
                    .iter()
                    .filter(|(suffix, _)| system_id.ends_with(suffix.as_str()))
                    .max_by_key(|(suffix, _)| suffix.len())
                    .map(|(_, target)| target.clone())
            })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries, chained catalogs included.
    pub fn len(&self) -> usize {
        self.system.len()
            + self.public.len()
            + self.uri.len()
            + self.rewrite_system.len()
            + self.rewrite_uri.len()
            + self.system_suffix.len()
            + self.next_catalogs.iter().map(XmlCatalog::len).sum::<usize>()
    }
}

/// Longest matching prefix wins.
fn rewrite(rules: &[(String, String)], id: &str) -> Option<String> {
    rules
        .iter()
        .filter(|(prefix, _)| id.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(prefix, target)| format!("{}{}", target, &id[prefix.len()..]))
}

fn with_xml_base(node: roxmltree::Node<'_, '_>, base: &Url) -> Url {
    node.attribute((XML_NAMESPACE, "base"))
        .and_then(|b| base.join(b).ok())
        .unwrap_or_else(|| base.clone())
}

fn normalize_public_id(id: &str) -> String {
    id.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Default)]
struct CatalogState {
    catalogs: Vec<PathBuf>,
    root_uri: Option<String>,
    table: Option<Arc<Vec<XmlCatalog>>>,
}

/// Resolver backed by the configured catalog files.
///
/// Catalog files are read lazily on the first lookup; changing the catalog
/// list or refreshing drops the lookup table.
#[derive(Debug, Default)]
pub struct CatalogResolver {
    state: Mutex<CatalogState>,
}

impl CatalogResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_root_uri(&self, root_uri: Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.root_uri = root_uri;
    }

    /// Replace the catalog list. Relative paths are expanded against the root
    /// URI; files that do not exist are logged and skipped.
    ///
    /// Returns true if the effective catalog list changed.
    pub fn set_catalogs(&self, catalogs: &[String]) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let root_dir = state
            .root_uri
            .as_deref()
            .and_then(uri::to_file_path);

        let mut expanded = Vec::new();
        for catalog in catalogs {
            let path = uri::to_file_path(catalog).unwrap_or_else(|| PathBuf::from(catalog));
            let path = match (&root_dir, path.is_absolute()) {
                (Some(root), false) => root.join(path),
                _ => path,
            };
            if path.is_file() {
                expanded.push(path);
            } else {
                warn!(catalog = %path.display(), "Catalog file does not exist, skipping");
            }
        }

        let changed = expanded != state.catalogs;
        state.catalogs = expanded;
        state.table = None;
        changed
    }

    /// Drop the lookup table so catalog files are read again on next use.
    pub fn refresh_catalogs(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.table = None;
    }

    pub fn catalogs(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .catalogs
            .clone()
    }

    fn table(&self) -> Arc<Vec<XmlCatalog>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = &state.table {
            return table.clone();
        }

        let table = Arc::new(
            state
                .catalogs
                .iter()
                .filter_map(|path| match XmlCatalog::from_file(path) {
                    Ok(catalog) => {
                        debug!(catalog = %path.display(), entries = catalog.len(), "Loaded catalog");
                        Some(catalog)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to load catalog");
                        None
                    }
                })
                .collect::<Vec<_>>(),
        );
        state.table = Some(table.clone());
        table
    }
}

impl UriResolver for CatalogResolver {
    fn name(&self) -> &str {
        "catalog"
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::Catalog
    }

    fn resolve(
        &self,
        _base_uri: Option<&str>,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) -> Option<String> {
        if public_id.is_none() && system_id.is_none() {
            return None;
        }
        let table = self.table();
        table.iter().find_map(|catalog| {
            catalog
                .resolve(public_id, system_id)
                .or_else(|| public_id.and_then(|ns| catalog.resolve_uri(ns)))
                .or_else(|| system_id.and_then(|id| catalog.resolve_uri(id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_catalog(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(
            &path,
            format!(
                r#"<?xml version="1.0"?>
<catalog xmlns="urn:oasis:names:tc:entity:xmlns:xml:catalog">
{}
</catalog>"#,
                body
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_system_public_and_uri_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<system systemId="http://example.com/note.dtd" uri="dtd/note.dtd"/>
               <public publicId="-//Test//DTD  Note//EN" uri="dtd/public.dtd"/>
               <uri name="urn:example:ns" uri="xsd/ns.xsd"/>"#,
        );

        let catalog = XmlCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.len(), 3);

        let system = catalog
            .resolve(None, Some("http://example.com/note.dtd"))
            .unwrap();
        assert!(system.ends_with("/dtd/note.dtd"));
        assert!(system.starts_with("file://"));

        let public = catalog.resolve(Some("-//Test//DTD Note//EN"), None).unwrap();
        assert!(public.ends_with("/dtd/public.dtd"));

        assert!(catalog.resolve_uri("urn:example:ns").unwrap().ends_with("/xsd/ns.xsd"));
        assert!(catalog.resolve(None, Some("http://example.com/other.dtd")).is_none());
    }

    #[test]
    fn test_system_entry_wins_over_public() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<system systemId="note.dtd" uri="by-system.dtd"/>
               <public publicId="-//Note//EN" uri="by-public.dtd"/>"#,
        );
        let catalog = XmlCatalog::from_file(&path).unwrap();

        let resolved = catalog.resolve(Some("-//Note//EN"), Some("note.dtd")).unwrap();
        assert!(resolved.ends_with("by-system.dtd"));
    }

    #[test]
    fn test_rewrite_and_suffix_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<rewriteSystem systemIdStartString="http://example.com/" rewritePrefix="mirror/"/>
               <rewriteSystem systemIdStartString="http://example.com/deep/" rewritePrefix="deep/"/>
               <systemSuffix systemIdSuffix="/topic.xsd" uri="local/topic.xsd"/>"#,
        );
        let catalog = XmlCatalog::from_file(&path).unwrap();

        let rewritten = catalog
            .resolve(None, Some("http://example.com/deep/a.xsd"))
            .unwrap();
        assert!(rewritten.ends_with("/deep/a.xsd"));
        assert!(!rewritten.contains("mirror"));

        let suffixed = catalog
            .resolve(None, Some("http://other.org/dita/topic.xsd"))
            .unwrap();
        assert!(suffixed.ends_with("/local/topic.xsd"));
    }

    #[test]
    fn test_group_xml_base_and_next_catalog() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("nested")).unwrap();
        write_catalog(
            &temp_dir.path().join("nested"),
            "next.xml",
            r#"<system systemId="next.xsd" uri="next-local.xsd"/>
               <nextCatalog catalog="../catalog.xml"/>"#,
        );
        let path = write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<group xml:base="http://mirror.example.com/base/">
                 <system systemId="grouped.xsd" uri="g.xsd"/>
               </group>
               <nextCatalog catalog="nested/next.xml"/>"#,
        );

        let catalog = XmlCatalog::from_file(&path).unwrap();
        assert_eq!(
            catalog.resolve(None, Some("grouped.xsd")).as_deref(),
            Some("http://mirror.example.com/base/g.xsd")
        );
        let next = catalog.resolve(None, Some("next.xsd")).unwrap();
        assert!(next.ends_with("/nested/next-local.xsd"));
    }

    #[test]
    fn test_malformed_catalog_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.xml");
        fs::write(&path, "<catalog><system").unwrap();

        match XmlCatalog::from_file(&path) {
            Err(ContentModelError::Catalog { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected catalog error, got {:?}", other),
        }
    }

    #[test]
    fn test_resolver_reloads_after_set_catalogs() {
        let temp_dir = TempDir::new().unwrap();
        let first = write_catalog(
            temp_dir.path(),
            "first.xml",
            r#"<system systemId="a.xsd" uri="first/a.xsd"/>"#,
        );
        let second = write_catalog(
            temp_dir.path(),
            "second.xml",
            r#"<system systemId="a.xsd" uri="second/a.xsd"/>"#,
        );

        let resolver = CatalogResolver::new();
        assert!(resolver.set_catalogs(&[first.to_string_lossy().to_string()]));
        assert!(resolver.resolve(None, None, Some("a.xsd")).unwrap().contains("/first/"));

        assert!(resolver.set_catalogs(&[second.to_string_lossy().to_string()]));
        assert!(resolver.resolve(None, None, Some("a.xsd")).unwrap().contains("/second/"));

        assert!(!resolver.set_catalogs(&[second.to_string_lossy().to_string()]));
    }

    #[test]
    fn test_resolver_skips_missing_catalogs_and_uses_root_uri() {
        let temp_dir = TempDir::new().unwrap();
        write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<uri name="urn:example:ns" uri="ns.xsd"/>"#,
        );

        let resolver = CatalogResolver::new();
        resolver.set_root_uri(uri::from_file_path(temp_dir.path()));
        resolver.set_catalogs(&["catalog.xml".to_string(), "missing.xml".to_string()]);

        assert_eq!(resolver.catalogs(), vec![temp_dir.path().join("catalog.xml")]);
        let resolved = resolver.resolve(None, Some("urn:example:ns"), None).unwrap();
        assert!(resolved.ends_with("/ns.xsd"));
    }

    #[test]
    fn test_refresh_rereads_catalog_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<system systemId="a.xsd" uri="old.xsd"/>"#,
        );
        let resolver = CatalogResolver::new();
        resolver.set_catalogs(&[path.to_string_lossy().to_string()]);
        assert!(resolver.resolve(None, None, Some("a.xsd")).unwrap().ends_with("old.xsd"));

        write_catalog(
            temp_dir.path(),
            "catalog.xml",
            r#"<system systemId="a.xsd" uri="new.xsd"/>"#,
        );
        assert!(resolver.resolve(None, None, Some("a.xsd")).unwrap().ends_with("old.xsd"));

        resolver.refresh_catalogs();
        assert!(resolver.resolve(None, None, Some("a.xsd")).unwrap().ends_with("new.xsd"));
    }
}
