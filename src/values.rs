use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_yaml::Value;

use crate::errors::ValuesError;
use crate::index::ResourceIndex;
use crate::model::{ConfigMap, HelmRelease, ReferenceKey, Secret};

/// Composes a HelmRelease's effective values: every `valuesFrom` source in
/// declaration order, deep-merged, with the release's inline `values`
/// merged on top last (always wins).
pub fn compose_values(release: &HelmRelease, index: &ResourceIndex) -> Result<Value, ValuesError> {
    let mut accumulator = Value::Mapping(Default::default());
    let namespace = release.namespace().to_string();

    for source in &release.spec.values_from {
        let key = ReferenceKey::new(String::new(), source.kind.clone(), namespace.clone(), source.name.clone());
        let resource = match index.lookup(&key) {
            Some(resource) => resource,
            None if source.optional => continue,
            None => {
                return Err(ValuesError::SourceNotFound {
                    kind: source.kind.clone(),
                    namespace: namespace.clone(),
                    name: source.name.clone(),
                })
            }
        };

        let raw = extract_value_bytes(resource, source)?;

        match source.target_path.as_deref() {
            Some(target_path) if !target_path.is_empty() => {
                let leaf = parse_scalar(&raw)?;
                set_scalar_at_path(&mut accumulator, target_path, leaf);
            }
            _ => {
                let doc: Value = serde_yaml::from_slice(&raw)?;
                accumulator = deep_merge(accumulator, doc);
            }
        }
    }

    if let Some(inline) = &release.spec.values {
        accumulator = deep_merge(accumulator, inline.clone());
    }

    Ok(accumulator)
}

fn extract_value_bytes(resource: &crate::model::Resource, source: &crate::model::ValuesReference) -> Result<Vec<u8>, ValuesError> {
    let key = source.values_key();

    match resource.kind.as_str() {
        "ConfigMap" => {
            let cm: ConfigMap = serde_yaml::from_value(resource.body.clone())?;
            let raw = cm.data.get(key).ok_or_else(|| ValuesError::KeyNotFound {
                kind: "ConfigMap".to_string(),
                namespace: resource.namespace.clone(),
                name: resource.name.clone(),
                key: key.to_string(),
            })?;
            Ok(raw.clone().into_bytes())
        }
        "Secret" => {
            let secret: Secret = serde_yaml::from_value(resource.body.clone())?;
            if let Some(encoded) = secret.data.get(key) {
                Ok(BASE64.decode(encoded)?)
            } else if let Some(plain) = secret.string_data.get(key) {
                Ok(plain.clone().into_bytes())
            } else {
                Err(ValuesError::KeyNotFound {
                    kind: "Secret".to_string(),
                    namespace: resource.namespace.clone(),
                    name: resource.name.clone(),
                    key: key.to_string(),
                })
            }
        }
        other => Err(ValuesError::KeyNotFound {
            kind: other.to_string(),
            namespace: resource.namespace.clone(),
            name: resource.name.clone(),
            key: key.to_string(),
        }),
    }
}

/// Deep-merge with `src` winning on leaf collisions; maps recurse, anything
/// else (scalars, sequences, type mismatches) is replaced wholesale.
fn deep_merge(dst: Value, src: Value) -> Value {
    match (dst, src) {
        (Value::Mapping(mut dst_map), Value::Mapping(src_map)) => {
            for (key, value) in src_map {
                let merged = match dst_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                dst_map.insert(key, merged);
            }
            Value::Mapping(dst_map)
        }
        (_, src) => src,
    }
}

/// If wrapped in matching single/double quotes, strip them and treat as a
/// literal string; otherwise parse with type coercion (bool, int, float,
/// falling back to string).
fn parse_scalar(raw: &[u8]) -> Result<Value, ValuesError> {
    let text = String::from_utf8(raw.to_vec())?;
    let trimmed = text.trim();

    let is_quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"')) || (trimmed.starts_with('\'') && trimmed.ends_with('\'')));

    if is_quoted {
        return Ok(Value::String(trimmed[1..trimmed.len() - 1].to_string()));
    }

    if let Ok(b) = trimmed.parse::<bool>() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Ok(Value::Number(f.into()));
    }
    Ok(Value::String(trimmed.to_string()))
}

fn set_scalar_at_path(root: &mut Value, path: &str, leaf: Value) {
    if !matches!(root, Value::Mapping(_)) {
        *root = Value::Mapping(Default::default());
    }

    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, part) in parts.iter().enumerate() {
        let Value::Mapping(map) = current else {
            return;
        };
        let key = Value::String((*part).to_string());

        if i == parts.len() - 1 {
            map.insert(key, leaf);
            return;
        }

        current = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(Default::default()));
        if !matches!(current, Value::Mapping(_)) {
            *current = Value::Mapping(Default::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HelmReleaseMetadata, HelmReleaseSpec, Resource, ValuesReference};
    use serde_yaml::Value;

    fn configmap(ns: &str, name: &str, values_yaml: &str) -> Resource {
        let yaml = format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {ns}\ndata:\n  values.yaml: |\n    {values_yaml}\n"
        );
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        Resource::from_value(value).unwrap()
    }

    fn release_with(namespace: &str, values_from: Vec<ValuesReference>, inline: Option<Value>) -> HelmRelease {
        HelmRelease {
            metadata: HelmReleaseMetadata {
                name: "web".to_string(),
                namespace: namespace.to_string(),
            },
            spec: HelmReleaseSpec {
                chart: None,
                target_namespace: None,
                values: inline,
                values_from,
                post_renderers: vec![],
                skip_crds: false,
                crds: None,
                timeout: None,
                disable_hooks: false,
            },
        }
    }

    #[test]
    fn inline_values_always_win_over_values_from() {
        let mut index = ResourceIndex::new();
        index.push(vec![configmap("a", "cfg", "replicas: 2\n")]).unwrap();

        let source = ValuesReference {
            kind: "ConfigMap".to_string(),
            name: "cfg".to_string(),
            namespace: String::new(),
            values_key: None,
            target_path: None,
            optional: false,
        };
        let inline: Value = serde_yaml::from_str("replicas: 5\n").unwrap();
        let release = release_with("a", vec![source], Some(inline));

        let composed = compose_values(&release, &index).unwrap();
        assert_eq!(composed.get("replicas").unwrap().as_i64(), Some(5));
    }

    #[test]
    fn optional_missing_source_is_silently_skipped() {
        let index = ResourceIndex::new();
        let source = ValuesReference {
            kind: "ConfigMap".to_string(),
            name: "missing".to_string(),
            namespace: String::new(),
            values_key: None,
            target_path: None,
            optional: true,
        };
        let release = release_with("a", vec![source], None);
        let composed = compose_values(&release, &index).unwrap();
        assert_eq!(composed, Value::Mapping(Default::default()));
    }

    #[test]
    fn required_missing_source_fails() {
        let index = ResourceIndex::new();
        let source = ValuesReference {
            kind: "ConfigMap".to_string(),
            name: "missing".to_string(),
            namespace: String::new(),
            values_key: None,
            target_path: None,
            optional: false,
        };
        let release = release_with("a", vec![source], None);
        assert!(compose_values(&release, &index).is_err());
    }

    #[test]
    fn merge_is_associative_under_declared_order() {
        let mut index = ResourceIndex::new();
        index.push(vec![configmap("a", "cfg-a", "top:\n  a: 1\n")]).unwrap();
        index.push(vec![configmap("a", "cfg-b", "top:\n  b: 2\n")]).unwrap();
        index.push(vec![configmap("a", "cfg-c", "top:\n  a: 3\n")]).unwrap();

        let src = |name: &str| ValuesReference {
            kind: "ConfigMap".to_string(),
            name: name.to_string(),
            namespace: String::new(),
            values_key: None,
            target_path: None,
            optional: false,
        };

        let all_at_once = release_with("a", vec![src("cfg-a"), src("cfg-b"), src("cfg-c")], None);
        let step_wise = release_with("a", vec![src("cfg-a"), src("cfg-b")], None);

        let merged_all = compose_values(&all_at_once, &index).unwrap();
        let merged_ab = compose_values(&step_wise, &index).unwrap();
        let merged_ab_then_c = deep_merge(merged_ab, {
            let r = release_with("a", vec![src("cfg-c")], None);
            compose_values(&r, &index).unwrap()
        });

        assert_eq!(merged_all, merged_ab_then_c);
    }

    #[test]
    fn quoted_scalar_is_treated_as_literal_string() {
        let value = parse_scalar(b"\"42\"").unwrap();
        assert_eq!(value, Value::String("42".to_string()));
    }

    #[test]
    fn unquoted_scalar_is_type_coerced() {
        assert_eq!(parse_scalar(b"42").unwrap(), Value::Number(42.into()));
        assert_eq!(parse_scalar(b"true").unwrap(), Value::Bool(true));
        assert_eq!(parse_scalar(b"plain").unwrap(), Value::String("plain".to_string()));
    }
}
