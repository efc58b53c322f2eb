use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;
use vsync_core::CollectionParent;

use crate::SyncError;

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    parents: BTreeMap<String, String>,
    #[serde(default)]
    topics: BTreeMap<String, String>,
}

/// Statically known collection ids: the two fixed parents and the topic children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionCatalog {
    parents: BTreeMap<CollectionParent, String>,
    topics: BTreeMap<String, String>,
}

impl CollectionCatalog {
    pub fn new<P, T>(parents: P, topics: T) -> Self
    where
        P: IntoIterator<Item = (CollectionParent, String)>,
        T: IntoIterator<Item = (String, String)>,
    {
        Self {
            parents: parents.into_iter().collect(),
            topics: topics
                .into_iter()
                .map(|(name, id)| (normalize_topic(&name), id))
                .collect(),
        }
    }

    /// ```yaml
    /// parents:
    ///   series: 7XCIBU3P
    ///   topics: 2M9GD3KV
    /// topics:
    ///   Astronomy: QXN8ZH2A
    /// ```
    pub fn from_yaml_str(text: &str) -> Result<Self, SyncError> {
        let file: CatalogFile = serde_yaml::from_str(text)?;
        let mut parents = BTreeMap::new();
        for (kind, id) in file.parents {
            let parent: CollectionParent = kind.parse()?;
            parents.insert(parent, id);
        }
        Ok(Self::new(parents, file.topics))
    }

    /// A missing file yields an empty catalog; series creation then fails until one is provided.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "collection catalog not found; topics and series will not be filed");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn parent_id(&self, parent: CollectionParent) -> Option<&str> {
        self.parents.get(&parent).map(String::as_str)
    }

    pub fn topic_id(&self, topic: &str) -> Option<&str> {
        self.topics.get(&normalize_topic(topic)).map(String::as_str)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

fn normalize_topic(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
parents:
  series: SERIES01
  topics: TOPICS01
topics:
  Astronomy: ASTRO001
  "Earth Science": EARTH001
"#;

    #[test]
    fn catalog_parses_parents_and_topics() {
        let catalog = CollectionCatalog::from_yaml_str(YAML).unwrap();
        assert_eq!(catalog.parent_id(CollectionParent::Series), Some("SERIES01"));
        assert_eq!(catalog.parent_id(CollectionParent::Topics), Some("TOPICS01"));
        assert_eq!(catalog.topic_id("astronomy"), Some("ASTRO001"));
        assert_eq!(catalog.topic_id(" Earth Science "), Some("EARTH001"));
        assert_eq!(catalog.topic_id("Botany"), None);
        assert_eq!(catalog.topic_count(), 2);
    }

    #[test]
    fn catalog_rejects_unknown_parent_kinds() {
        let err = CollectionCatalog::from_yaml_str("parents:\n  genres: X\n").unwrap_err();
        assert!(matches!(err, SyncError::UnknownCollectionParent(_)));
        assert!(err.to_string().contains("genres"));
    }

    #[test]
    fn missing_catalog_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CollectionCatalog::load(&dir.path().join("collections.yaml")).unwrap();
        assert_eq!(catalog, CollectionCatalog::default());
        assert_eq!(catalog.parent_id(CollectionParent::Series), None);
    }

    #[test]
    fn example_catalog_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../collections.example.yaml");
        let catalog = CollectionCatalog::load(&path).unwrap();
        assert!(catalog.parent_id(CollectionParent::Series).is_some());
        assert_eq!(catalog.topic_id("earth science"), Some("EARTH001"));
    }
}
