//! The pipeline orchestrator.
//!
//! [`ContainerSystem`] owns one instance of every stage and the per-reference
//! records they produce. Each stage method works on a single reference and is
//! safe to call from worker threads; the `*_all` methods fan a list out over
//! a [`WorkerPool`] and persist the stage result through [`StageCache`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use globset::GlobSet;
use tracing::{debug, error, info, warn};

use crate::cache::StageCache;
use crate::config;
use crate::engine::{CommandRunner, Engine, RetryPolicy};
use crate::error::AppError;
use crate::http::HttpClient;
use crate::inventory::ProgramInventory;
use crate::layer_cache::LayerCache;
use crate::metadata::{Catalog, MetadataFetcher};
use crate::model::{ImageHandle, ImageRecord, ImageReference, Metadata};
use crate::modulefile::{ModuleOptions, ModulePage, ModuleRenderer};
use crate::pool::{Interrupt, WorkerPool};
use crate::pull::Puller;
use crate::reference::ReferenceResolver;
use crate::scanner::ProgramScanner;
use crate::validate::Validator;

const VALIDITY_CACHE: &str = "valid.json";
const METADATA_CACHE: &str = "metadata.json";
const PROGRAMS_CACHE: &str = "programs.json";

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct SystemOptions {
    pub image_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub threads: usize,
    pub include_libs: bool,
    pub force_cache: bool,
    pub progress: bool,
    pub permit: BTreeSet<String>,
    pub always_blocked: BTreeSet<String>,
    pub exclude: Option<GlobSet>,
    pub retry: RetryPolicy,
    /// Seed images for the shared layer cache. `None` disables it.
    pub layer_cache: Option<Vec<String>>,
    pub catalog_url: String,
    pub fallback_catalog_url: String,
    pub module: ModuleOptions,
}

impl SystemOptions {
    pub fn new(
        image_dir: impl Into<PathBuf>,
        module_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            image_dir: image_dir.into(),
            cache_dir: cache_dir.into(),
            threads: config::DEFAULT_THREADS,
            include_libs: false,
            force_cache: false,
            progress: false,
            permit: config::DEFAULT_PERMIT.iter().map(|program| program.to_string()).collect(),
            always_blocked: config::DEFAULT_ALWAYS_BLOCKED
                .iter()
                .map(|program| program.to_string())
                .collect(),
            exclude: None,
            retry: RetryPolicy {
                attempts: config::DEFAULT_PULL_RETRIES,
                delay: Duration::from_secs(config::DEFAULT_RETRY_DELAY_SECS),
            },
            layer_cache: None,
            catalog_url: config::DEFAULT_CATALOG_URL.to_string(),
            fallback_catalog_url: config::DEFAULT_FALLBACK_CATALOG_URL.to_string(),
            module: ModuleOptions { module_dir: module_dir.into(), ..ModuleOptions::default() },
        }
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    records: BTreeMap<String, ImageRecord>,
    valid: BTreeSet<String>,
    invalid: BTreeSet<String>,
    inventory: ProgramInventory,
    block: BTreeSet<String>,
}

pub struct ContainerSystem {
    options: SystemOptions,
    engine: Engine,
    runner: Arc<dyn CommandRunner>,
    resolver: ReferenceResolver,
    validator: Validator,
    metadata: MetadataFetcher,
    puller: Puller,
    scanner: ProgramScanner,
    renderer: ModuleRenderer,
    cache: StageCache,
    state: Mutex<PipelineState>,
}

impl ContainerSystem {
    /// Wires up every stage. Fails when the tracker URL is unusable, so a bad
    /// configuration is reported before any image is touched.
    pub fn new(
        options: SystemOptions,
        engine: Engine,
        http: Arc<dyn HttpClient>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, AppError> {
        let renderer = ModuleRenderer::new(options.module.clone())?;
        let catalog = Arc::new(Catalog::new(
            Arc::clone(&http),
            &options.catalog_url,
            &options.fallback_catalog_url,
        ));
        let validator =
            Validator::new(Arc::clone(&http), Arc::clone(&catalog), options.exclude.clone());
        let metadata = MetadataFetcher::new(catalog);
        let puller = Puller::new(engine, Arc::clone(&runner), &options.image_dir, options.retry);
        let scanner = ProgramScanner::new(engine, Arc::clone(&runner))?;
        let cache = StageCache::new(&options.cache_dir, options.force_cache);
        debug!(
            engine = %engine,
            cache = %options.cache_dir.display(),
            "initialized container system"
        );
        Ok(Self {
            options,
            engine,
            runner,
            resolver: ReferenceResolver::new(),
            validator,
            metadata,
            puller,
            scanner,
            renderer,
            cache,
            state: Mutex::new(PipelineState::default()),
        })
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pool(&self) -> Result<WorkerPool, AppError> {
        WorkerPool::new(self.options.threads, self.options.progress)
    }

    /// Canonical record for `url`, registering it on first sight.
    pub fn parse(&self, url: &str) -> ImageReference {
        let reference = self.resolver.resolve(url);
        self.lock()
            .records
            .entry(url.to_string())
            .or_insert_with(|| ImageRecord::new(reference.clone()));
        reference
    }

    pub fn reference(&self, url: &str) -> Option<ImageReference> {
        self.lock().records.get(url).map(|record| record.reference.clone())
    }

    pub fn valid(&self) -> BTreeSet<String> {
        self.lock().valid.clone()
    }

    pub fn invalid(&self) -> BTreeSet<String> {
        self.lock().invalid.clone()
    }

    pub fn is_valid(&self, url: &str) -> bool {
        self.lock().valid.contains(url)
    }

    pub fn is_invalid(&self, url: &str) -> bool {
        self.lock().invalid.contains(url)
    }

    pub fn image(&self, url: &str) -> Option<ImageHandle> {
        self.lock().records.get(url).and_then(|record| record.image.clone())
    }

    pub fn metadata(&self, url: &str) -> Option<Metadata> {
        self.lock().records.get(url).and_then(|record| record.metadata.clone())
    }

    pub fn inventory(&self) -> ProgramInventory {
        self.lock().inventory.clone()
    }

    pub fn block_set(&self) -> BTreeSet<String> {
        self.lock().block.clone()
    }

    /// Moves `url` from the valid set to the invalid set.
    pub fn mark_invalid(&self, url: &str) {
        let mut state = self.lock();
        state.valid.remove(url);
        state.invalid.insert(url.to_string());
        debug!(url, "marked invalid");
    }

    /// Classifies `url` once and records it in exactly one of the two sets.
    pub fn validate(&self, url: &str) -> bool {
        {
            let state = self.lock();
            if state.valid.contains(url) {
                return true;
            }
            if state.invalid.contains(url) {
                return false;
            }
        }
        let reference = self.parse(url);
        let valid = self.validator.is_valid(&reference, self.options.include_libs);
        let mut state = self.lock();
        if valid {
            state.valid.insert(url.to_string());
        } else {
            state.invalid.insert(url.to_string());
        }
        valid
    }

    /// Validates every unclassified URL and persists both sets.
    pub fn validate_all(
        &self,
        urls: &[String],
    ) -> Result<(BTreeSet<String>, BTreeSet<String>), AppError> {
        let (cached_invalid, cached_valid): (BTreeSet<String>, BTreeSet<String>) =
            self.cache.load(VALIDITY_CACHE, Default::default());
        let to_check: Vec<String> = {
            let mut state = self.lock();
            for url in cached_valid {
                if !state.invalid.contains(&url) {
                    state.valid.insert(url);
                }
            }
            for url in cached_invalid {
                if !state.valid.contains(&url) {
                    state.invalid.insert(url);
                }
            }
            unique(urls)
                .into_iter()
                .filter(|url| !state.valid.contains(url) && !state.invalid.contains(url))
                .collect()
        };
        if !to_check.is_empty() {
            let pool = self.pool()?;
            info!(count = to_check.len(), threads = pool.threads(), "validating urls");
            pool.process_list("validate", &to_check, |url| {
                self.validate(url);
            })?;
        }
        let (invalid, valid) = {
            let state = self.lock();
            (state.invalid.clone(), state.valid.clone())
        };
        self.cache.save(VALIDITY_CACHE, &(&invalid, &valid))?;
        Ok((valid, invalid))
    }

    /// Fills in metadata for `url` unless it is already known.
    pub fn fetch_metadata(&self, url: &str) -> Metadata {
        if let Some(metadata) = self.metadata(url) {
            return metadata;
        }
        let reference = self.parse(url);
        let metadata = self.metadata.fetch(&reference);
        if let Some(record) = self.lock().records.get_mut(url) {
            record.metadata = Some(metadata.clone());
        }
        metadata
    }

    /// Validates, fetches metadata for and pulls `url`.
    pub fn pull(&self, url: &str) -> bool {
        if !self.validate(url) {
            debug!(url, "not pulling an invalid url");
            return false;
        }
        self.fetch_metadata(url);
        if self.image(url).is_some() {
            return true;
        }
        let reference = self.parse(url);
        match self.puller.pull(&reference) {
            Some(handle) => {
                if let Some(record) = self.lock().records.get_mut(url) {
                    record.image = Some(handle);
                }
                true
            }
            None if Interrupt::requested() => {
                debug!(url, "pull was cancelled, leaving validity untouched");
                false
            }
            None => {
                self.mark_invalid(url);
                false
            }
        }
    }

    /// Pulls every valid URL, persisting metadata. With `delete_old`, image
    /// files that belong to no current URL are removed.
    pub fn pull_all(&self, urls: &[String], delete_old: bool) -> Result<(), AppError> {
        let cached: BTreeMap<String, Metadata> = self.cache.load(METADATA_CACHE, BTreeMap::new());
        for (url, metadata) in cached {
            let reference = self.resolver.resolve(&url);
            let mut state = self.lock();
            let record = state.records.entry(url).or_insert_with(|| ImageRecord::new(reference));
            record.metadata.get_or_insert(metadata);
        }

        self.validate_all(urls)?;
        self.prepare_layer_cache()?;

        let to_pull: Vec<String> =
            unique(urls).into_iter().filter(|url| self.is_valid(url)).collect();
        if !to_pull.is_empty() {
            let pool = self.pool()?;
            info!(count = to_pull.len(), threads = pool.threads(), "pulling images");
            pool.process_list_or_cancel(
                "pull",
                &to_pull,
                |url| {
                    self.pull(url);
                },
                || self.puller.kill_in_flight(),
            )?;
        }

        let metadata: BTreeMap<String, Metadata> = {
            let state = self.lock();
            state
                .records
                .iter()
                .filter_map(|(url, record)| {
                    record.metadata.clone().map(|metadata| (url.clone(), metadata))
                })
                .collect()
        };
        self.cache.save(METADATA_CACHE, &metadata)?;

        if delete_old {
            let keep: BTreeSet<PathBuf> = self
                .lock()
                .records
                .values()
                .filter_map(|record| match &record.image {
                    Some(ImageHandle::File(path)) => Some(path.clone()),
                    _ => None,
                })
                .collect();
            for path in self.puller.prune(&keep)? {
                info!(path = %path.display(), "deleted old image");
            }
        }
        Ok(())
    }

    fn prepare_layer_cache(&self) -> Result<(), AppError> {
        let Some(seeds) = &self.options.layer_cache else {
            return Ok(());
        };
        if self.engine.is_daemon() {
            debug!("layer cache only applies to file-based engines");
            return Ok(());
        }
        let cache = LayerCache::new(&self.options.cache_dir, seeds.clone());
        let archive =
            cache.prepare(self.runner.as_ref(), &self.options.retry, self.options.force_cache)?;
        self.puller.use_layer_cache(archive);
        Ok(())
    }

    /// Records the programs of `url`, pulling it first when needed.
    ///
    /// An image without a shell or without programs is marked invalid.
    pub fn scan(&self, url: &str, force: bool) -> bool {
        if self.is_invalid(url) {
            debug!(url, "not scanning an invalid url");
            return false;
        }
        let image = match self.image(url) {
            Some(image) => image,
            None => {
                warn!(url, "was not previously pulled, trying to pull now");
                if !self.pull(url) {
                    error!(url, "could not be pulled, skipping scan for programs");
                    return false;
                }
                match self.image(url) {
                    Some(image) => image,
                    None => return false,
                }
            }
        };
        if !force && self.lock().inventory.contains(url) {
            debug!(url, "programs are already cached");
            return true;
        }
        match self.scanner.scan(&image) {
            Ok(programs) if programs.is_empty() => {
                error!(url, "no programs detected, marking as invalid");
                self.mark_invalid(url);
                false
            }
            Ok(programs) => {
                self.lock().inventory.record(url, programs);
                true
            }
            Err(AppError::NoShell(_)) => {
                self.mark_invalid(url);
                false
            }
            Err(err) => {
                error!(url, error = %err, "could not scan");
                false
            }
        }
    }

    /// Scans every valid URL plus `urls` and persists the inventory.
    pub fn scan_all(&self, urls: &[String]) -> Result<(), AppError> {
        let cached = self.cache.load(PROGRAMS_CACHE, ProgramInventory::new());
        let to_check: Vec<String> = {
            let mut state = self.lock();
            for key in cached.keys() {
                if !state.inventory.contains(key)
                    && let Some(programs) = cached.get(key)
                {
                    state.inventory.record(key, programs.clone());
                }
            }
            let mut wanted: BTreeSet<String> = state.valid.clone();
            wanted.extend(unique(urls));
            let force = self.options.force_cache;
            wanted.into_iter().filter(|url| force || !state.inventory.contains(url)).collect()
        };
        if self.options.force_cache {
            debug!("ignoring cache and re-scanning all containers");
        }
        if !to_check.is_empty() {
            let pool = self.pool()?;
            info!(count = to_check.len(), threads = pool.threads(), "scanning for programs");
            pool.process_list("scan", &to_check, |url| {
                self.scan(url, self.options.force_cache);
            })?;
        }
        let inventory = self.inventory();
        self.cache.save(PROGRAMS_CACHE, &inventory)?;
        Ok(())
    }

    /// Recomputes the block set from the whole inventory.
    pub fn find_common(&self, percentile: f64, baseline: &[String]) -> BTreeSet<String> {
        let mut state = self.lock();
        let block = state.inventory.block_set(
            percentile,
            baseline,
            &self.options.permit,
            &self.options.always_blocked,
        );
        debug!(blocked = ?block, "block set");
        state.block = block.clone();
        block
    }

    /// Programs of `url`, without blocked ones when `block` is set.
    pub fn get_programs(&self, url: &str, block: bool) -> Vec<String> {
        if self.is_invalid(url) {
            return Vec::new();
        }
        if !self.lock().inventory.contains(url) {
            debug!(url, "programs have not been cached yet");
            self.scan(url, false);
        }
        let state = self.lock();
        state.inventory.programs(url, block.then_some(&state.block))
    }

    /// Writes the modulefile for `url`. Returns `None` for URLs that cannot
    /// have one.
    pub fn render(&self, url: &str) -> Result<Option<PathBuf>, AppError> {
        if self.is_invalid(url) {
            return Ok(None);
        }
        let programs = self.get_programs(url, true);
        let (Some(image), Some(reference)) = (self.image(url), self.reference(url)) else {
            debug!(url, "no image to build a module from");
            return Ok(None);
        };
        let metadata = self.fetch_metadata(url);
        let page = ModulePage {
            reference: &reference,
            metadata: &metadata,
            image: &image,
            programs: &programs,
        };
        self.renderer.render(&page).map(Some)
    }

    /// Renders every pulled, valid URL. With `delete_old`, modulefiles not
    /// produced by this call are removed.
    pub fn render_all(&self, delete_old: bool) -> Result<Vec<PathBuf>, AppError> {
        let urls: Vec<String> = {
            let state = self.lock();
            state
                .records
                .iter()
                .filter(|(url, record)| record.image.is_some() && state.valid.contains(*url))
                .map(|(url, _)| url.clone())
                .collect()
        };
        info!(count = urls.len(), "creating Lmod files");
        let mut written = Vec::new();
        for url in &urls {
            if let Some(path) = self.render(url)? {
                written.push(path);
            }
        }
        if delete_old {
            let keep: BTreeSet<PathBuf> = written.iter().cloned().collect();
            self.renderer.prune(&keep)?;
        }
        Ok(written)
    }

    /// Removes the local image of `url`. Returns false when none was pulled.
    pub fn delete_image(&self, url: &str) -> Result<bool, AppError> {
        let Some(image) = self.image(url) else {
            return Ok(false);
        };
        self.puller.delete_image(&image)?;
        if let Some(record) = self.lock().records.get_mut(url) {
            record.image = None;
        }
        Ok(true)
    }
}

/// `urls` without duplicates, first occurrence first.
fn unique(urls: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    urls.iter().filter(|url| seen.insert(url.as_str())).cloned().collect()
}
