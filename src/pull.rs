//! Pulling images into the local image directory.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::engine::{CommandOutput, CommandRunner, Engine, RetryPolicy};
use crate::error::AppError;
use crate::layer_cache;
use crate::model::{ImageHandle, ImageReference, Registry};
use crate::utils::{remove_empty_sub_directories, shell_quote};

/// Phrase registries print once anonymous pulls are throttled.
pub const RATE_LIMIT_PHRASE: &str = "You have reached your pull rate limit";

pub struct Puller {
    engine: Engine,
    runner: Arc<dyn CommandRunner>,
    image_dir: PathBuf,
    retry: RetryPolicy,
    layer_cache: Mutex<Option<PathBuf>>,
    rate_limited: Mutex<BTreeSet<Registry>>,
}

impl Puller {
    pub fn new(
        engine: Engine,
        runner: Arc<dyn CommandRunner>,
        image_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            runner,
            image_dir: image_dir.into(),
            retry,
            layer_cache: Mutex::new(None),
            rate_limited: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Registers the layer archive every later file-based pull starts from.
    pub fn use_layer_cache(&self, archive: PathBuf) {
        let mut current = self.layer_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref() == Some(&archive) {
            debug!(path = %archive.display(), "Using existing layer cache");
            return;
        }
        *current = Some(archive);
    }

    pub fn layer_cache(&self) -> Option<PathBuf> {
        self.layer_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// `{image_dir}/{name}/{name}-{tag}.{ext}`.
    pub fn image_path(&self, reference: &ImageReference, extension: &str) -> PathBuf {
        let tag = reference.tag.as_deref().unwrap_or("latest");
        self.image_dir.join(&reference.name).join(format!("{}-{tag}.{extension}", reference.name))
    }

    /// A previously pulled file under any recognized extension.
    pub fn existing_image(&self, reference: &ImageReference) -> Option<PathBuf> {
        Engine::EXTENSIONS
            .iter()
            .map(|extension| self.image_path(reference, extension))
            .find(|path| path.exists())
    }

    pub fn is_rate_limited(&self, registry: Registry) -> bool {
        self.rate_limited
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&registry)
    }

    /// Pulls `reference` and returns its local handle, or `None` on failure.
    pub fn pull(&self, reference: &ImageReference) -> Option<ImageHandle> {
        if self.is_rate_limited(reference.registry) {
            debug!(
                url = %reference,
                registry = %reference.registry,
                "skipping pull, registry is rate limited"
            );
            return None;
        }
        let pulled = if self.engine.is_daemon() {
            self.pull_daemon(reference)
        } else {
            self.pull_file(reference)
        };
        match pulled {
            Ok(Some(handle)) => {
                debug!(url = %reference, image = %handle.as_arg(), "pulled");
                Some(handle)
            }
            Ok(None) => {
                error!(url = %reference, "could not pull");
                None
            }
            Err(err) => {
                error!(url = %reference, error = %err, "could not pull");
                None
            }
        }
    }

    fn pull_daemon(&self, reference: &ImageReference) -> Result<Option<ImageHandle>, AppError> {
        let command = format!("docker pull {} >/dev/null", reference.docker_url());
        let output = self.runner.run(&command, &[])?;
        if output.success {
            return Ok(Some(ImageHandle::Daemon(reference.docker_url().to_string())));
        }
        self.note_failure(reference.registry, &output);
        Ok(None)
    }

    fn pull_file(&self, reference: &ImageReference) -> Result<Option<ImageHandle>, AppError> {
        if let Some(existing) = self.existing_image(reference) {
            debug!(
                url = %reference,
                path = %existing.display(),
                "detected previously pulled image"
            );
            return Ok(Some(ImageHandle::File(existing)));
        }
        let Some(extension) = self.engine.extension() else {
            return Ok(None);
        };
        let target = self.image_path(reference, extension);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let scratch = tempfile::Builder::new().prefix("modcrane-pull").tempdir()?;
        if let Some(archive) = self.layer_cache() {
            layer_cache::extract_into(&archive, scratch.path())?;
        }
        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged = scratch.path().join(&file_name);
        let command = match self.engine {
            Engine::Singularity2 => format!(
                "cd {} && singularity pull -F --name {} {} 2>&1",
                shell_quote(&scratch.path().display().to_string()),
                shell_quote(&file_name),
                reference.singularity_url()
            ),
            _ => format!(
                "singularity pull -F {} {} 2>&1",
                shell_quote(&staged.display().to_string()),
                reference.singularity_url()
            ),
        };
        let env = vec![("SINGULARITY_CACHEDIR".to_string(), scratch.path().display().to_string())];
        let output = self.retry.run(self.runner.as_ref(), &command, &env);
        if !output.success || !staged.exists() {
            self.note_failure(reference.registry, &output);
            return Ok(None);
        }
        relocate(&staged, &target)?;
        debug!(dir = %scratch.path().display(), "removing scratch directory");
        Ok(Some(ImageHandle::File(target)))
    }

    /// Flags the registry as throttled when the engine output says so.
    ///
    /// Returns true only for the first hit on a registry.
    pub fn note_failure(&self, registry: Registry, output: &CommandOutput) -> bool {
        let throttled = [&output.stdout, &output.stderr]
            .iter()
            .any(|stream| stream.contains(RATE_LIMIT_PHRASE));
        if !throttled {
            return false;
        }
        let newly = self
            .rate_limited
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(registry);
        if newly {
            warn!(
                "You have reached your pull limit on {}. Remaining pulls from this registry \
                 will be skipped; authenticate or wait before running again.",
                registry.display_name()
            );
        }
        newly
    }

    /// Removes a pulled image.
    pub fn delete_image(&self, handle: &ImageHandle) -> Result<(), AppError> {
        match handle {
            ImageHandle::Daemon(reference) => {
                let command = format!("docker rmi {reference} >/dev/null 2>&1");
                let output = self.runner.run(&command, &[])?;
                if !output.success {
                    warn!(image = %reference, "could not remove image");
                }
            }
            ImageHandle::File(path) => {
                if let Err(err) = fs::remove_file(path)
                    && err.kind() != io::ErrorKind::NotFound
                {
                    return Err(AppError::Io(err));
                }
                remove_empty_sub_directories(&self.image_dir)?;
            }
        }
        debug!(image = %handle.as_arg(), "deleted image");
        Ok(())
    }

    /// Deletes image files not listed in `keep` and prunes empty directories.
    pub fn prune(&self, keep: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>, AppError> {
        let mut removed = Vec::new();
        if !self.image_dir.is_dir() {
            return Ok(removed);
        }
        for entry in WalkDir::new(&self.image_dir).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|extension| extension.to_str())
                .is_some_and(|extension| Engine::EXTENSIONS.contains(&extension));
            if entry.file_type().is_file() && is_image && !keep.contains(path) {
                debug!(path = %path.display(), "deleting stale image");
                fs::remove_file(path)?;
                removed.push(path.to_path_buf());
            }
        }
        remove_empty_sub_directories(&self.image_dir)?;
        Ok(removed)
    }

    /// Best-effort kill of in-flight file-based pulls.
    pub fn kill_in_flight(&self) {
        if self.engine.is_daemon() {
            return;
        }
        if let Err(err) = self.runner.run("pkill -9 -f \"singularity pull\"", &[]) {
            debug!(error = %err, "could not signal in-flight pulls");
        }
    }
}

fn relocate(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
