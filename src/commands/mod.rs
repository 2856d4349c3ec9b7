use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::engine::{CommandRunner, Engine, ShellRunner};
use crate::error::AppError;
use crate::http::ReqwestClient;
use crate::modulefile::validate_tracker_url;
use crate::system::ContainerSystem;

pub mod config_cmd;
pub mod run;
pub mod scan;
pub mod validate;

pub use config_cmd::execute_config;
pub use run::execute_run;
pub use scan::execute_scan;
pub use validate::execute_validate;

/// Settings shared by every pipeline command.
pub struct PipelineOptions {
    /// Configuration with command line overrides already applied.
    pub config: Config,
    pub urls: Vec<String>,
    pub url_file: Option<PathBuf>,
    pub force_cache: bool,
    pub verbose: bool,
}

impl PipelineOptions {
    /// References from the command line followed by those in the URL file.
    pub fn references(&self) -> Result<Vec<String>, AppError> {
        let mut urls = self.urls.clone();
        if let Some(path) = &self.url_file {
            urls.extend(read_url_file(path)?);
        }
        if urls.is_empty() {
            return Err(AppError::NoReferences);
        }
        Ok(urls)
    }
}

/// One reference per line; blank lines and `#` comments are skipped.
pub fn read_url_file(path: &Path) -> Result<Vec<String>, AppError> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Builds the pipeline against the real engine and registries.
///
/// The tracker URL is checked first so a broken configuration fails before
/// any engine probing or network access.
pub(crate) fn build_system(
    options: &PipelineOptions,
    force_modules: bool,
) -> Result<ContainerSystem, AppError> {
    let mut system_options = options.config.system_options()?;
    if let Some(url) = &system_options.module.tracker_url {
        validate_tracker_url(url)?;
    }
    system_options.force_cache = options.force_cache;
    system_options.progress = !options.verbose;
    system_options.module.force = force_modules;

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let engine = Engine::detect(runner.as_ref(), options.config.engine.as_deref())?;
    debug!(engine = %engine, "selected container engine");
    let http = Arc::new(ReqwestClient::new(options.config.http_timeout())?);
    ContainerSystem::new(system_options, engine, http, runner)
}
