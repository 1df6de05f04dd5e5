use crate::model::Resource;

/// Sets `namespace` on every resource that doesn't already carry one,
/// unconditionally — not filtered by whether the kind is actually
/// namespace-scoped.
pub fn inject_namespace(resources: &mut [Resource], namespace: &str) {
    for resource in resources {
        if !resource.namespace.is_empty() {
            continue;
        }

        resource.namespace = namespace.to_string();

        if let Some(metadata) = resource.body.get_mut("metadata").and_then(|m| m.as_mapping_mut()) {
            metadata.insert(
                serde_yaml::Value::String("namespace".to_string()),
                serde_yaml::Value::String(namespace.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn resource(namespace: &str) -> Resource {
        let yaml = format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: {namespace}\n"
        );
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        Resource::from_value(value).unwrap()
    }

    #[test]
    fn sets_namespace_when_absent() {
        let mut resources = vec![resource("")];
        inject_namespace(&mut resources, "target");
        assert_eq!(resources[0].namespace, "target");
        assert_eq!(
            resources[0].body.get("metadata").unwrap().get("namespace").unwrap().as_str(),
            Some("target")
        );
    }

    #[test]
    fn leaves_existing_namespace_untouched() {
        let mut resources = vec![resource("already-set")];
        inject_namespace(&mut resources, "target");
        assert_eq!(resources[0].namespace, "already-set");
    }
}
