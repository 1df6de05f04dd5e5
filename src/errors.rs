use thiserror::Error;

use crate::cmd::command::CommandError;

/// The seven error kinds named by the error-handling design: each maps to a
/// distinct exit-path classification even though the process itself only
/// ever exits 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Io,
    Parse,
    Resolution,
    Rendering,
    Cache,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no input paths given: supply positional paths, the PATHS env var, or a non-empty --cache-dir run")]
    NoPaths,

    #[error("invalid value for --{field}: '{value}' (valid values: {valid})")]
    InvalidValue {
        field: &'static str,
        value: String,
        valid: &'static str,
    },

    #[error("{0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("resource is missing required metadata: {0}")]
    MissingMetadata(String),
}

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("failed to walk overlay path {path}: {source}")]
    Walk { path: String, source: std::io::Error },

    #[error("failed to read input path {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to stage temporary overlay for {path}: {source}")]
    Stage { path: String, source: std::io::Error },

    #[error("overlay compose failed for {path}: {source}")]
    Compose { path: String, source: CommandError },

    #[error("no parseable Kubernetes resources found under {0}")]
    Empty(String),
}

#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("referenced {kind} `{namespace}/{name}` not found for values source")]
    SourceNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("key `{key}` not found in {kind} `{namespace}/{name}`")]
    KeyNotFound {
        kind: String,
        namespace: String,
        name: String,
        key: String,
    },

    #[error("failed to parse values document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to decode base64 secret data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid UTF-8 in values source: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to acquire cache lock at {path}: {source}")]
    Lock { path: String, source: std::io::Error },

    #[error("cache lockfile {0} is present and non-empty but does not carry the ready marker")]
    CorruptLock(String),

    #[error("cache I/O error at {path}: {source}")]
    Io { path: String, source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum CrdPolicyError {
    #[error("invalid CRD policy '{value}', valid values are 'Skip', 'Create' or 'CreateReplace'")]
    Invalid { value: String },
}

#[derive(Debug, Error)]
pub enum HelmBuildError {
    #[error("unsupported chart source kind `{0}`")]
    UnsupportedSourceKind(String),

    #[error("no source `{kind}/{name}` found for HelmRelease `{namespace}/{release}`")]
    SourceNotFound {
        kind: String,
        name: String,
        namespace: String,
        release: String,
    },

    #[error(transparent)]
    Values(#[from] ValuesError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    CrdPolicy(#[from] CrdPolicyError),

    #[error("chart fetch failed: {0}")]
    Fetch(#[from] CommandError),

    #[error("chart render failed: {0}")]
    Render(String),

    #[error("post-render failed: {0}")]
    PostRender(String),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error("failed to decode HelmRelease manifest: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("I/O error while building release: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error surfaced to `main`, carrying enough classification to
/// decide exit behavior and to pick a diagnostic prefix.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    HelmBuild(#[from] HelmBuildError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),

    #[error("{0} task(s) failed; most recent error: {1}")]
    Pool(usize, Box<BuildError>),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Config(_) => ErrorKind::Configuration,
            BuildError::Index(_) => ErrorKind::Resolution,
            BuildError::Overlay(_) => ErrorKind::Io,
            BuildError::HelmBuild(HelmBuildError::SourceNotFound { .. }) => ErrorKind::Resolution,
            BuildError::HelmBuild(HelmBuildError::CrdPolicy(_)) => ErrorKind::Rendering,
            BuildError::HelmBuild(HelmBuildError::Render(_)) => ErrorKind::Rendering,
            BuildError::HelmBuild(HelmBuildError::Cache(_)) => ErrorKind::Cache,
            BuildError::HelmBuild(_) => ErrorKind::Rendering,
            BuildError::Cache(_) => ErrorKind::Cache,
            BuildError::Output(_) => ErrorKind::Io,
            BuildError::Pool(_, inner) => inner.kind(),
        }
    }
}
