use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::AppError;

/// On-disk cache holding one JSON document per pipeline stage.
#[derive(Debug, Clone)]
pub struct StageCache {
    dir: PathBuf,
    force: bool,
}

impl StageCache {
    pub fn new(dir: impl Into<PathBuf>, force: bool) -> Self {
        Self { dir: dir.into(), force }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Loads `file_name`, falling back to `default` when the file is absent,
    /// unreadable, or a refresh is forced.
    pub fn load<T: DeserializeOwned>(&self, file_name: &str, default: T) -> T {
        let path = self.path(file_name);
        if !path.exists() {
            debug!(path = %path.display(), "cache file does not exist, using defaults");
            return default;
        }
        if self.force {
            debug!(path = %path.display(), "forcing a refresh of the cache, using defaults");
            return default;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(AppError::from)
            .and_then(|contents| serde_json::from_str(&contents).map_err(AppError::from));
        match parsed {
            Ok(value) => {
                debug!(path = %path.display(), "read cache");
                value
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable cache");
                default
            }
        }
    }

    pub fn save<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), AppError> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "creating cache dir");
            fs::create_dir_all(&self.dir)?;
        }
        let path = self.path(file_name);
        let contents = serde_json::to_string(value)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, contents)?;
        fs::rename(&staging, &path)?;
        debug!(path = %path.display(), "updated cache");
        Ok(())
    }
}
