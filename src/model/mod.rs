//! Format-agnostic content model: documents, element and attribute
//! declarations, adapted lazily from a reader's native grammar.

mod document;
mod documentation;
mod grammar;

pub use document::{AttributeDeclaration, ContentModelDocument, ElementDeclaration};
pub use documentation::{DocumentationFormat, DocumentationRequest};
pub use grammar::{AttributeInfo, ChildParticle, DeclId, ElementInfo, GrammarKind, NativeGrammar};

pub(crate) use grammar::merge_particles;
