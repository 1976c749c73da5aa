use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use xml_content_model::{
    uri, ContentModelManager, NodeId, ResourceFetcher, ResourceStoreConfig, XmlDocument,
};

/// Grammar where `<a><b><c/></b></a>` is valid and `c` is also a root.
pub const NESTED_SCHEMA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="a">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="b">
          <xs:complexType>
            <xs:sequence><xs:element ref="c"/></xs:sequence>
          </xs:complexType>
        </xs:element>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
  <xs:element name="c" type="xs:string"/>
</xs:schema>"#;

pub const ROOT_CHILD_SCHEMA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="root">
    <xs:complexType>
      <xs:sequence><xs:element name="child" type="xs:string"/></xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

/// Scratch directory holding grammars and documents.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn uri(&self, name: &str) -> String {
        file_uri(&self.path(name))
    }

    pub fn root_uri(&self) -> String {
        file_uri(self.dir.path())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path("cache")
    }

    /// Parse `content` as if saved at `name`, without writing it.
    pub fn document(&self, name: &str, content: &str) -> XmlDocument {
        XmlDocument::parse(Some(self.uri(name).as_str()), content).unwrap()
    }
}

pub fn file_uri(path: &Path) -> String {
    uri::from_file_path(path).unwrap()
}

/// Manager without providers, caching under the workspace.
pub fn bare_manager(workspace: &Workspace, fetcher: Arc<dyn ResourceFetcher>) -> ContentModelManager {
    ContentModelManager::new(
        ResourceStoreConfig {
            directory: workspace.cache_dir(),
            ..Default::default()
        },
        fetcher,
    )
}

/// Element with the given local name, searched in document order.
pub fn node(document: &XmlDocument, local_name: &str) -> NodeId {
    document
        .elements()
        .find(|id| document.element(*id).is_some_and(|e| e.local_name == local_name))
        .unwrap()
}

/// Elements with the given local name, in document order.
pub fn nodes(document: &XmlDocument, local_name: &str) -> Vec<NodeId> {
    document
        .elements()
        .filter(|id| document.element(*id).is_some_and(|e| e.local_name == local_name))
        .collect()
}
