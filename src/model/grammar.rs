use std::fmt;
use std::path::PathBuf;

/// Stable index of an element declaration inside a native grammar.
pub type DeclId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrammarKind {
    Dtd,
    Xsd,
    RelaxNg,
}

impl fmt::Display for GrammarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarKind::Dtd => write!(f, "DTD"),
            GrammarKind::Xsd => write!(f, "XML Schema"),
            GrammarKind::RelaxNg => write!(f, "RelaxNG"),
        }
    }
}

/// Scalar facts about one element declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElementInfo {
    pub local_name: String,
    pub namespace: Option<String>,
    pub is_empty: bool,
    pub is_mixed: bool,
    pub is_string_type: bool,
    pub is_nillable: bool,
    pub enumeration: Vec<String>,
}

/// A child an element may contain, and whether it must appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildParticle {
    pub element: DeclId,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeInfo {
    pub local_name: String,
    pub namespace: Option<String>,
    pub default_value: Option<String>,
    pub enumeration: Vec<String>,
    pub required: bool,
    pub documentation: Option<String>,
    /// Documentation of individual enumeration values.
    pub value_documentation: Vec<(String, String)>,
}

/// Grammar object produced by a format reader.
///
/// Everything is addressed by [`DeclId`]. Implementations may compute child
/// and attribute lists on demand; the content model document memoizes them.
pub trait NativeGrammar: Send + Sync + fmt::Debug {
    fn kind(&self) -> GrammarKind;

    fn target_namespaces(&self) -> Vec<String>;

    fn element_count(&self) -> usize;

    /// Elements allowed as a document root.
    fn top_level_elements(&self) -> Vec<DeclId>;

    fn element(&self, id: DeclId) -> ElementInfo;

    fn child_particles(&self, id: DeclId) -> Vec<ChildParticle>;

    fn attributes(&self, id: DeclId) -> Vec<AttributeInfo>;

    fn element_documentation(&self, id: DeclId) -> Option<String>;

    /// Local files the grammar was read from.
    fn source_files(&self) -> Vec<PathBuf>;
}

/// Merge duplicate children: a child is required if any occurrence is.
pub(crate) fn merge_particles(particles: Vec<ChildParticle>) -> Vec<ChildParticle> {
    let mut merged: Vec<ChildParticle> = Vec::with_capacity(particles.len());
    for particle in particles {
        match merged.iter_mut().find(|p| p.element == particle.element) {
            Some(existing) => existing.required |= particle.required,
            None => merged.push(particle),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_particles_keeps_order_and_required() {
        let merged = merge_particles(vec![
            ChildParticle { element: 2, required: false },
            ChildParticle { element: 1, required: true },
            ChildParticle { element: 2, required: true },
        ]);
        assert_eq!(
            merged,
            vec![
                ChildParticle { element: 2, required: true },
                ChildParticle { element: 1, required: true },
            ]
        );
    }
}
