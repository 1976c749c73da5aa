use std::path::Path;
use std::sync::{PoisonError, RwLock};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ResolutionKind, UriResolver};
use crate::uri;

/// Binds documents matching a glob pattern to a grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAssociation {
    pub pattern: String,
    #[serde(alias = "systemId")]
    pub system_id: String,
}

impl FileAssociation {
    pub fn new(pattern: impl Into<String>, system_id: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            system_id: system_id.into(),
        }
    }
}

#[derive(Debug)]
struct CompiledAssociation {
    pattern: Pattern,
    system_id: String,
}

#[derive(Debug, Default)]
struct AssociationState {
    root_uri: Option<String>,
    associations: Vec<FileAssociation>,
    compiled: Vec<CompiledAssociation>,
}

impl AssociationState {
    fn compile(&mut self) {
        let root_dir = self.root_uri.as_deref().and_then(uri::to_file_path);
        let root_base = self.root_uri.as_deref().and_then(uri::directory_url);

        self.compiled = self
            .associations
            .iter()
            .filter_map(|association| {
                let pattern = match (&root_dir, Path::new(&association.pattern).is_absolute()) {
                    (Some(root), false) => root.join(&association.pattern).to_string_lossy().to_string(),
                    _ => association.pattern.clone(),
                };
                let pattern = match Pattern::new(&pattern) {
                    Ok(pattern) => pattern,
                    Err(e) => {
                        warn!(pattern = %association.pattern, error = %e, "Invalid file association pattern");
                        return None;
                    }
                };
                let system_id = uri::parse_absolute(&association.system_id)
                    .map(|u| u.to_string())
                    .or_else(|| {
                        root_base
                            .as_ref()
                            .and_then(|base| base.join(&association.system_id).ok())
                            .map(|u| u.to_string())
                    })
                    .or_else(|| uri::expand_system_id(&association.system_id, None))
                    .unwrap_or_else(|| association.system_id.clone());
                Some(CompiledAssociation { pattern, system_id })
            })
            .collect();
    }
}

/// Resolves a document to the grammar associated with its location,
/// whatever the document itself declares.
#[derive(Debug, Default)]
pub struct FileAssociationResolver {
    state: RwLock<AssociationState>,
}

impl FileAssociationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative patterns and system ids are anchored at `root_uri`.
    pub fn set_root_uri(&self, root_uri: Option<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.root_uri = root_uri;
        state.compile();
    }

    /// Returns true if the associations changed.
    pub fn set_file_associations(&self, associations: &[FileAssociation]) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.associations == associations {
            return false;
        }
        state.associations = associations.to_vec();
        state.compile();
        true
    }

    pub fn file_associations(&self) -> Vec<FileAssociation> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .associations
            .clone()
    }
}

impl UriResolver for FileAssociationResolver {
    fn name(&self) -> &str {
        "file association"
    }

    fn kind(&self) -> ResolutionKind {
        ResolutionKind::FileAssociation
    }

    fn resolve(
        &self,
        base_uri: Option<&str>,
        _public_id: Option<&str>,
        _system_id: Option<&str>,
    ) -> Option<String> {
        let document_path = uri::to_file_path(base_uri?)?;
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .compiled
            .iter()
            .find(|association| {
                association.pattern.matches_path_with(&document_path, options)
            })
            .map(|association| association.system_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_pattern_anchored_at_root() {
        let resolver = FileAssociationResolver::new();
        resolver.set_root_uri(Some("file:///work/project".to_string()));
        assert!(resolver.set_file_associations(&[FileAssociation::new(
            "**/*.note.xml",
            "schemas/note.xsd"
        )]));

        assert_eq!(
            resolver
                .resolve(Some("file:///work/project/data/a.note.xml"), None, None)
                .as_deref(),
            Some("file:///work/project/schemas/note.xsd")
        );
        assert!(resolver
            .resolve(Some("file:///elsewhere/a.note.xml"), None, None)
            .is_none());
        assert!(resolver
            .resolve(Some("file:///work/project/data/a.xml"), None, None)
            .is_none());
    }

    #[test]
    fn test_first_matching_association_wins() {
        let resolver = FileAssociationResolver::new();
        resolver.set_file_associations(&[
            FileAssociation::new("/work/*.xml", "http://example.com/first.xsd"),
            FileAssociation::new("/work/**/*.xml", "http://example.com/second.xsd"),
        ]);

        assert_eq!(
            resolver.resolve(Some("file:///work/a.xml"), None, None).as_deref(),
            Some("http://example.com/first.xsd")
        );
        assert_eq!(
            resolver.resolve(Some("file:///work/sub/a.xml"), None, None).as_deref(),
            Some("http://example.com/second.xsd")
        );
    }

    #[test]
    fn test_unchanged_associations_report_no_change() {
        let resolver = FileAssociationResolver::new();
        let associations = vec![FileAssociation::new("*.xml", "a.xsd")];
        assert!(resolver.set_file_associations(&associations));
        assert!(!resolver.set_file_associations(&associations));
        assert_eq!(resolver.file_associations(), associations);
    }

    #[test]
    fn test_document_without_location() {
        let resolver = FileAssociationResolver::new();
        resolver.set_file_associations(&[FileAssociation::new("**/*.xml", "/a.xsd")]);
        assert!(resolver.resolve(None, None, Some("b.xsd")).is_none());
    }
}
