//! In-memory embedded resources

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::collab::EmbeddedResources;

const RESOURCES_SCHEME: &str = "resources:";
const PACK_SCHEME: &str = "pack://";

/// Whether `source` names an embedded resource.
pub fn is_embedded_source(source: &str) -> bool {
    source.starts_with(RESOURCES_SCHEME) || source.starts_with(PACK_SCHEME)
}

/// Strip the embedded scheme from `source`, yielding the registry key.
///
/// `resources:/Images/logo.png` and `pack://application:,,,/Images/logo.png`
/// both map to `Images/logo.png`. Returns `None` for non-embedded sources.
pub fn embedded_key(source: &str) -> Option<&str> {
    let rest = if let Some(rest) = source.strip_prefix(RESOURCES_SCHEME) {
        rest
    } else if let Some(rest) = source.strip_prefix(PACK_SCHEME) {
        rest.split_once(",,,").map_or(rest, |(_, path)| path)
    } else {
        return None;
    };
    Some(rest.trim_start_matches('/'))
}

/// Canonical `resources:/` spelling of an embedded registry key.
///
/// Every scheme variant naming the same key yields the same source string.
pub fn embedded_source(key: &str) -> String {
    let key = embedded_key(key).unwrap_or(key);
    format!("{RESOURCES_SCHEME}/{}", key.trim_start_matches('/'))
}

/// Keyed byte blobs registered at startup.
#[derive(Debug, Default)]
pub struct StaticResources {
    entries: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(self, key: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.insert(key, bytes);
        self
    }

    /// Register `bytes` under `key`. Scheme prefixes on `key` are stripped.
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        let key = key.into();
        let key = embedded_key(&key).map(str::to_string).unwrap_or(key);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, bytes.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmbeddedResources for StaticResources {
    fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_key_normalization() {
        let logo = Some("Images/logo.png");
        assert_eq!(embedded_key("resources:/Images/logo.png"), logo);
        assert_eq!(embedded_key("resources:Images/logo.png"), logo);
        assert_eq!(embedded_key("pack://application:,,,/Images/logo.png"), logo);
        assert_eq!(embedded_key("pack://Images/logo.png"), logo);
        assert_eq!(embedded_key("/tmp/logo.png"), None);
        assert_eq!(embedded_key("https://example.com/logo.png"), None);
    }

    #[test]
    fn test_embedded_source_is_canonical() {
        let canonical = "resources:/Images/logo.png";
        assert_eq!(embedded_source("Images/logo.png"), canonical);
        assert_eq!(embedded_source("/Images/logo.png"), canonical);
        assert_eq!(
            embedded_source("pack://application:,,,/Images/logo.png"),
            canonical
        );
        assert_eq!(embedded_source(canonical), canonical);
    }

    #[test]
    fn test_is_embedded_source() {
        assert!(is_embedded_source("resources:/x"));
        assert!(is_embedded_source("pack://application:,,,/x"));
        assert!(!is_embedded_source("x/resources:"));
    }

    #[test]
    fn test_insert_strips_scheme() {
        let resources = StaticResources::new().with("resources:/Images/a.png", vec![1u8, 2, 3]);
        assert_eq!(
            resources.get("Images/a.png").as_deref(),
            Some(&[1u8, 2, 3][..])
        );
        assert_eq!(resources.len(), 1);

        assert!(resources.remove("Images/a.png"));
        assert!(resources.is_empty());
        assert!(resources.get("Images/a.png").is_none());
    }
}
