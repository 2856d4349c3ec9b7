use std::io;

use thiserror::Error;

/// Application-wide error type for modcrane.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown container engine '{0}' (expected 'docker' or 'singularity')")]
    UnknownEngine(String),

    #[error("Container engine '{0}' was requested but is not available")]
    EngineNotFound(String),

    #[error("No supported container engine (docker or singularity) detected")]
    NoEngine,

    #[error("Missing {{{}}} field(s) in tracker url: {}", .missing.join(", "), .url)]
    TrackerFields { missing: Vec<String>, url: String },

    #[error("Tracker url is not a Google Forms url: {0}")]
    TrackerUrl(String),

    #[error("Could not determine a shell inside {0}")]
    NoShell(String),

    #[error("No image references were given")]
    NoReferences,

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Failed to launch editor: {0}")]
    Editor(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to write configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Invalid exclude pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("Cache serialization failed: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl AppError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        AppError::Config(msg.into())
    }
}
