use crate::model::HELM_RELEASE_GROUP;
use crate::model::Resource;

/// Tags every resource with the identity of the release that produced it,
/// always the last step of the post-render chain.
pub fn inject_origin_labels(resources: &mut [Resource], release_namespace: &str, release_name: &str) {
    let name_key = format!("{HELM_RELEASE_GROUP}/name");
    let namespace_key = format!("{HELM_RELEASE_GROUP}/namespace");

    for resource in resources {
        let metadata = resource
            .body
            .as_mapping_mut()
            .expect("resource body must be a mapping")
            .entry(serde_yaml::Value::String("metadata".to_string()))
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));

        let metadata = metadata.as_mapping_mut().expect("metadata must be a mapping");
        let labels = metadata
            .entry(serde_yaml::Value::String("labels".to_string()))
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));

        if !matches!(labels, serde_yaml::Value::Mapping(_)) {
            *labels = serde_yaml::Value::Mapping(Default::default());
        }
        let labels = labels.as_mapping_mut().expect("labels must be a mapping");

        labels.insert(
            serde_yaml::Value::String(name_key.clone()),
            serde_yaml::Value::String(release_name.to_string()),
        );
        labels.insert(
            serde_yaml::Value::String(namespace_key.clone()),
            serde_yaml::Value::String(release_namespace.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn resource() -> Resource {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n";
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        Resource::from_value(value).unwrap()
    }

    #[test]
    fn adds_origin_labels() {
        let mut resources = vec![resource()];
        inject_origin_labels(&mut resources, "web-ns", "web");

        let labels = resources[0].body.get("metadata").unwrap().get("labels").unwrap();
        assert_eq!(labels.get("helm.toolkit.fluxcd.io/name").unwrap().as_str(), Some("web"));
        assert_eq!(labels.get("helm.toolkit.fluxcd.io/namespace").unwrap().as_str(), Some("web-ns"));
    }
}
