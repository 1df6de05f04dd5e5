use std::collections::HashMap;

use crate::errors::IndexError;
use crate::model::{ReferenceKey, Resource};

/// A write-once-then-read-only mapping from `(group, kind, namespace, name)`
/// to `Resource`. Populated entirely by the index stage before any Helm
/// worker starts; read-only afterwards, so no locking is needed for lookups.
#[derive(Debug, Default)]
pub struct ResourceIndex {
    entries: HashMap<ReferenceKey, Resource>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        ResourceIndex::default()
    }

    /// Merges a batch of resources into the index. Later pushes silently
    /// overwrite on key collision — no existence check, matching the
    /// plain-map-assignment semantics this is grounded on.
    pub fn push(&mut self, resources: Vec<Resource>) -> Result<(), IndexError> {
        for resource in resources {
            let key = resource.reference_key();
            self.entries.insert(key, resource);
        }
        Ok(())
    }

    pub fn lookup(&self, key: &ReferenceKey) -> Option<&Resource> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Resource> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn resource(kind: &str, ns: &str, name: &str) -> Resource {
        let yaml = format!("apiVersion: v1\nkind: {kind}\nmetadata:\n  name: {name}\n  namespace: {ns}\n");
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        Resource::from_value(value).unwrap()
    }

    #[test]
    fn later_push_overwrites_same_key() {
        let mut index = ResourceIndex::new();
        index.push(vec![resource("ConfigMap", "a", "cfg")]).unwrap();
        assert_eq!(index.len(), 1);

        index.push(vec![resource("ConfigMap", "a", "cfg")]).unwrap();
        assert_eq!(index.len(), 1, "same key must overwrite, not duplicate");
    }

    #[test]
    fn lookup_is_keyed_on_group_kind_namespace_name() {
        let mut index = ResourceIndex::new();
        index.push(vec![resource("ConfigMap", "a", "cfg")]).unwrap();
        index.push(vec![resource("ConfigMap", "b", "cfg")]).unwrap();
        assert_eq!(index.len(), 2, "distinct namespaces must not collide");

        let key = ReferenceKey::new("", "ConfigMap", "a", "cfg");
        assert!(index.lookup(&key).is_some());
        let missing = ReferenceKey::new("", "ConfigMap", "c", "cfg");
        assert!(index.lookup(&missing).is_none());
    }
}
