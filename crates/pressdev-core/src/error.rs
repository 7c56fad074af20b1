use thiserror::Error;

#[derive(Debug, Error)]
pub enum PressError {
    #[error("data directory not found: set PRESSDEV_HOME")]
    DataDirNotFound,

    #[error("no Node.js builds are published for {os}-{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("no {platform} release found in the distribution index")]
    ReleaseNotFound { platform: String },

    #[error("Node.js runtime is missing or does not run")]
    RuntimeUnavailable,

    #[error("checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("database did not become healthy after {attempts} attempts")]
    HealthTimeout { attempts: u32 },

    #[error("superseded by a newer configuration")]
    Superseded,

    #[error("unknown preference '{section}.{key}'")]
    UnknownPreference { section: String, key: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidPreference { key: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Version(#[from] semver::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, PressError>;
