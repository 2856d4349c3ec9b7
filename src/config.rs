use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use dirs_next as dirs;
use globset::{Glob, GlobSet};
use serde::{Deserialize, Serialize};

use crate::engine::RetryPolicy;
use crate::error::AppError;
use crate::modulefile::ModuleOptions;
use crate::system::SystemOptions;

pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_PERCENTILE: f64 = 25.0;
pub const DEFAULT_PULL_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONTACT: &str = "https://github.com/TACC/rgc/issues";
pub const DEFAULT_CATALOG_URL: &str = "https://bio.tools/api/tool";
pub const DEFAULT_FALLBACK_CATALOG_URL: &str = "https://api.launchpad.net/devel";
/// Core tools that stay exposed however common they are.
pub const DEFAULT_PERMIT: [&str; 5] = ["samtools", "bwa", "bowtie", "bowtie2", "java"];
/// `time` is a shell builtin.
pub const DEFAULT_ALWAYS_BLOCKED: [&str; 1] = ["time"];
pub const DEFAULT_BASELINE: [&str; 4] = [
    "centos:7",
    "continuumio/miniconda:latest",
    "biocontainers/biocontainers:vdebian-buster-backports_cv1",
    "gzynda/build-essential:bionic",
];
pub const DEFAULT_LAYER_CACHE_IMAGES: [&str; 2] =
    ["biocontainers/biocontainers:vdebian-buster-backports_cv1", "continuumio/miniconda:latest"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub image_dir: PathBuf,
    pub module_dir: PathBuf,
    /// Defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub percentile: f64,
    pub threads: usize,
    pub contact: Vec<String>,
    pub tracker_url: Option<String>,
    pub path_prefix: Option<String>,
    pub module_prefix: Option<String>,
    pub prereqs: Vec<String>,
    /// `docker` or `singularity`; detected when unset.
    pub engine: Option<String>,
    pub include_libs: bool,
    pub baseline: Vec<String>,
    pub permit: Vec<String>,
    pub always_blocked: Vec<String>,
    /// Glob patterns matched against sanitized image references.
    pub exclude: Vec<String>,
    pub pull_retries: u32,
    pub retry_delay_secs: u64,
    pub layer_cache: bool,
    pub layer_cache_images: Vec<String>,
    pub catalog_url: String,
    pub fallback_catalog_url: String,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|item| item.to_string()).collect()
        }
        Self {
            image_dir: PathBuf::from("./containers"),
            module_dir: PathBuf::from("./modulefiles"),
            cache_dir: None,
            percentile: DEFAULT_PERCENTILE,
            threads: DEFAULT_THREADS,
            contact: vec![DEFAULT_CONTACT.to_string()],
            tracker_url: None,
            path_prefix: None,
            module_prefix: None,
            prereqs: Vec::new(),
            engine: None,
            include_libs: false,
            baseline: owned(&DEFAULT_BASELINE),
            permit: owned(&DEFAULT_PERMIT),
            always_blocked: owned(&DEFAULT_ALWAYS_BLOCKED),
            exclude: Vec::new(),
            pull_retries: DEFAULT_PULL_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            layer_cache: false,
            layer_cache_images: owned(&DEFAULT_LAYER_CACHE_IMAGES),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            fallback_catalog_url: DEFAULT_FALLBACK_CATALOG_URL.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        let path = config_file_path()?;
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> Result<(), AppError> {
        let path = config_file_path()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(path)?;
        let contents = toml::to_string_pretty(self)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    pub fn append_exclude(&mut self, value: String) {
        if !self.exclude.iter().any(|existing| existing == &value) {
            self.exclude.push(value);
        }
    }

    pub fn compile_excludes(&self) -> Result<Option<GlobSet>, AppError> {
        if self.exclude.is_empty() {
            return Ok(None);
        }

        let mut builder = globset::GlobSetBuilder::new();
        for pattern in &self.exclude {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Some(builder.build()?))
    }

    pub fn resolved_cache_dir(&self) -> Result<PathBuf, AppError> {
        if let Some(dir) = &self.cache_dir {
            return expand_home(dir);
        }
        dirs::cache_dir()
            .map(|dir| dir.join("modcrane"))
            .ok_or_else(|| {
                AppError::config("Unable to determine cache directory for this platform")
            })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Pipeline settings described by this configuration.
    pub fn system_options(&self) -> Result<SystemOptions, AppError> {
        if !(0.0..=100.0).contains(&self.percentile) {
            return Err(AppError::config(format!(
                "percentile must be within 0-100, got {}",
                self.percentile
            )));
        }
        let module = ModuleOptions {
            module_dir: expand_home(&self.module_dir)?,
            path_prefix: self.path_prefix.clone().filter(|prefix| !prefix.is_empty()),
            module_prefix: self.module_prefix.clone().filter(|prefix| !prefix.is_empty()),
            contact: self.contact.clone(),
            tracker_url: self.tracker_url.clone().filter(|url| !url.is_empty()),
            prereqs: self.prereqs.iter().filter(|prereq| !prereq.is_empty()).cloned().collect(),
            force: false,
        };
        let mut options = SystemOptions::new(
            expand_home(&self.image_dir)?,
            module.module_dir.clone(),
            self.resolved_cache_dir()?,
        );
        options.module = module;
        options.threads = self.threads;
        options.include_libs = self.include_libs;
        options.permit = self.permit.iter().cloned().collect();
        options.always_blocked = self.always_blocked.iter().cloned().collect();
        options.exclude = self.compile_excludes()?;
        options.retry = RetryPolicy {
            attempts: self.pull_retries,
            delay: Duration::from_secs(self.retry_delay_secs),
        };
        options.layer_cache = self.layer_cache.then(|| self.layer_cache_images.clone());
        options.catalog_url = self.catalog_url.clone();
        options.fallback_catalog_url = self.fallback_catalog_url.clone();
        Ok(options)
    }
}

pub fn config_file_path() -> Result<PathBuf, AppError> {
    let config_root = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .ok_or_else(|| {
            AppError::config("Unable to determine configuration directory for this platform")
        })?;
    Ok(config_root.join("modcrane").join("config.toml"))
}

pub fn ensure_config_file() -> Result<PathBuf, AppError> {
    let path = config_file_path()?;
    if !path.exists() {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let default = Config::default();
        let contents = toml::to_string_pretty(&default)?;
        fs::write(&path, contents)?;
    }
    Ok(path)
}

fn expand_home(value: &std::path::Path) -> Result<PathBuf, AppError> {
    let Ok(stripped) = value.strip_prefix("~") else {
        return Ok(value.to_path_buf());
    };
    let home_dir = dirs::home_dir().ok_or_else(|| {
        AppError::config("Unable to expand '~' because the home directory is unknown")
    })?;
    Ok(home_dir.join(stripped))
}
