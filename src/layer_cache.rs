//! Shared base-layer cache for file-based pulls.
//!
//! A handful of seed images are pulled once into a scratch cache directory
//! and the resulting layer blobs are archived into `scache.tar`. Every later
//! pull unpacks the archive into its own scratch cache before calling the
//! engine, so common base layers are not downloaded again.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::engine::{CommandRunner, RetryPolicy};
use crate::error::AppError;
use crate::utils::{format_bytes, shell_quote};

pub const ARCHIVE_NAME: &str = "scache.tar";

pub struct LayerCache {
    cache_dir: PathBuf,
    seeds: Vec<String>,
}

impl LayerCache {
    pub fn new(cache_dir: impl Into<PathBuf>, seeds: Vec<String>) -> Self {
        Self { cache_dir: cache_dir.into(), seeds }
    }

    pub fn archive_path(&self) -> PathBuf {
        self.cache_dir.join(ARCHIVE_NAME)
    }

    /// Returns the archive, building it unless one exists and `force` is off.
    pub fn prepare(
        &self,
        runner: &dyn CommandRunner,
        retry: &RetryPolicy,
        force: bool,
    ) -> Result<PathBuf, AppError> {
        let archive = self.archive_path();
        if archive.exists() && !force {
            info!(path = %archive.display(), "Using found layer cache");
            return Ok(archive);
        }
        info!("Creating the base layer cache.");
        fs::create_dir_all(&self.cache_dir)?;
        let staging = tempfile::Builder::new().prefix("scache").tempdir_in(&self.cache_dir)?;
        let layers = staging.path().join("layers");
        fs::create_dir_all(&layers)?;
        let env = vec![("SINGULARITY_CACHEDIR".to_string(), layers.display().to_string())];

        for (index, seed) in self.seeds.iter().enumerate() {
            let image = staging.path().join(format!("seed-{index}.sif"));
            let command = format!(
                "singularity pull -F {} docker://{seed} >/dev/null 2>&1",
                shell_quote(&image.display().to_string())
            );
            if !retry.run(runner, &command, &env).success {
                warn!(seed = %seed, "could not pull seed image for the layer cache");
            }
            if image.exists() {
                fs::remove_file(&image)?;
            }
        }
        for scratch in ["tmp", "oci-tmp"] {
            let path = layers.join(scratch);
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            }
        }

        let partial = archive.with_extension("tar.partial");
        {
            let mut builder = tar::Builder::new(File::create(&partial)?);
            builder.append_dir_all(".", &layers)?;
            builder.into_inner()?;
        }
        fs::rename(&partial, &archive)?;
        let size = fs::metadata(&archive).map(|metadata| metadata.len()).unwrap_or(0);
        info!(path = %archive.display(), size = %format_bytes(size), "created layer cache");
        Ok(archive)
    }
}

/// Unpacks `archive` into a pull's scratch cache directory.
pub fn extract_into(archive: &Path, dir: &Path) -> Result<(), AppError> {
    debug!(archive = %archive.display(), dir = %dir.display(), "Extracting layer cache");
    let mut contents = tar::Archive::new(File::open(archive)?);
    contents.unpack(dir)?;
    Ok(())
}
