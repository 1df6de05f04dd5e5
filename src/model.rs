use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::errors::IndexError;

pub const HELM_RELEASE_KIND: &str = "HelmRelease";
pub const HELM_RELEASE_GROUP: &str = "helm.toolkit.fluxcd.io";
pub const HELM_REPOSITORY_GROUP: &str = "source.toolkit.fluxcd.io";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_VALUES_KEY: &str = "values.yaml";

/// `(group, kind, namespace, name)` — the unique address of a resource
/// within one run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferenceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ReferenceKey {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ReferenceKey {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.group, self.kind, self.namespace, self.name)
    }
}

/// A generic Kubernetes object: enough structure to index and route it, an
/// opaque body for everything else. Full typed deserialization of every
/// object kind is deliberately not attempted here.
#[derive(Debug, Clone)]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub body: Value,
}

impl Resource {
    pub fn from_value(body: Value) -> Result<Resource, IndexError> {
        let api_version = body
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| IndexError::MissingMetadata("apiVersion".to_string()))?
            .to_string();
        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| IndexError::MissingMetadata("kind".to_string()))?
            .to_string();
        let metadata = body
            .get("metadata")
            .ok_or_else(|| IndexError::MissingMetadata("metadata".to_string()))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| IndexError::MissingMetadata("metadata.name".to_string()))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Resource {
            api_version,
            kind,
            namespace,
            name,
            body,
        })
    }

    /// The `group` half of `apiVersion` (`group/version`, or empty for core
    /// `v1` resources).
    pub fn group(&self) -> String {
        match self.api_version.split_once('/') {
            Some((group, _version)) => group.to_string(),
            None => String::new(),
        }
    }

    pub fn reference_key(&self) -> ReferenceKey {
        ReferenceKey::new(self.group(), self.kind.clone(), self.namespace.clone(), self.name.clone())
    }

    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.body)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChartSpec {
    pub chart: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "sourceRef", default)]
    pub source_ref: SourceRef,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChartTemplate {
    pub spec: ChartSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ValuesReference {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "valuesKey", default)]
    pub values_key: Option<String>,
    #[serde(rename = "targetPath", default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl ValuesReference {
    pub fn values_key(&self) -> &str {
        self.values_key.as_deref().unwrap_or(DEFAULT_VALUES_KEY)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct KustomizePostRenderer {
    #[serde(default)]
    pub patches: Vec<Value>,
    #[serde(default)]
    pub images: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PostRenderer {
    #[serde(default)]
    pub kustomize: Option<KustomizePostRenderer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HelmReleaseSpec {
    #[serde(default)]
    pub chart: Option<ChartTemplate>,
    #[serde(rename = "targetNamespace", default)]
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub values: Option<Value>,
    #[serde(rename = "valuesFrom", default)]
    pub values_from: Vec<ValuesReference>,
    #[serde(rename = "postRenderers", default)]
    pub post_renderers: Vec<PostRenderer>,
    #[serde(rename = "skipCRDs", default)]
    pub skip_crds: bool,
    #[serde(default)]
    pub crds: Option<String>,
    #[serde(rename = "timeout", default)]
    pub timeout: Option<String>,
    #[serde(rename = "disableHooks", default)]
    pub disable_hooks: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HelmReleaseMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HelmRelease {
    pub metadata: HelmReleaseMetadata,
    pub spec: HelmReleaseSpec,
}

impl HelmRelease {
    pub fn namespace(&self) -> &str {
        if self.metadata.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.metadata.namespace
        }
    }

    pub fn target_namespace(&self) -> &str {
        match self.spec.target_namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => self.namespace(),
        }
    }

    /// Source-ref namespace, resolved to the release's own namespace when absent.
    pub fn source_namespace(&self) -> String {
        let chart = self.spec.chart.as_ref();
        let configured = chart.map(|c| c.spec.source_ref.namespace.clone()).unwrap_or_default();
        if configured.is_empty() {
            self.namespace().to_string()
        } else {
            configured
        }
    }

    pub fn effective_crd_policy(&self) -> Option<String> {
        if let Some(policy) = &self.spec.crds {
            return Some(policy.clone());
        }
        if self.spec.skip_crds {
            return Some("Skip".to_string());
        }
        None
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HelmRepositorySpec {
    pub url: String,
    #[serde(default)]
    #[serde(rename = "type")]
    pub repo_type: Option<String>,
    #[serde(rename = "provider", default)]
    pub provider: Option<String>,
    #[serde(rename = "secretRef", default)]
    pub secret_ref: Option<SourceRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HelmRepository {
    pub metadata: HelmReleaseMetadata,
    pub spec: HelmRepositorySpec,
}

impl HelmRepository {
    pub fn is_oci(&self) -> bool {
        self.spec.repo_type.as_deref() == Some("oci") || self.spec.url.starts_with("oci://")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConfigMap {
    pub metadata: HelmReleaseMetadata,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Secret {
    pub metadata: HelmReleaseMetadata,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(rename = "stringData", default)]
    pub string_data: BTreeMap<String, String>,
}
