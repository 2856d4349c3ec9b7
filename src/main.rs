use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use modcrane::commands::{
    PipelineOptions, config_cmd::ConfigOptions, execute_config, execute_run, execute_scan,
    execute_validate, run::RunOptions, scan::ScanOptions,
};
use modcrane::config::Config;
use modcrane::error::AppError;
use modcrane::pool::Interrupt;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose());
    Interrupt::install();

    if let Err(err) = run(cli) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Run(args) => {
            let options = RunOptions {
                pipeline: args.pipeline.into_options()?,
                force_modules: args.force_modules,
                delete_old: args.delete_old,
            };
            execute_run(options)?;
        }
        Commands::Scan(args) => {
            let options = ScanOptions { pipeline: args.pipeline.into_options()?, list: args.list };
            execute_scan(options)?;
        }
        Commands::Validate(args) => {
            execute_validate(args.into_options()?)?;
        }
        Commands::Config(args) => {
            let options = ConfigOptions {
                show_path: args.path,
                edit: args.edit,
                add_exclude: args.add_exclude,
            };
            execute_config(options)?;
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "modcrane", version, about = "Turn container images into Lmod modulefiles.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn verbose(&self) -> bool {
        match &self.command {
            Commands::Run(args) => args.pipeline.verbose,
            Commands::Scan(args) => args.pipeline.verbose,
            Commands::Validate(args) => args.verbose,
            Commands::Config(_) => false,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pull, scan and write a modulefile for every image.
    #[command(visible_alias = "rn")]
    Run(RunArgs),
    /// Pull images and list the programs on their PATH.
    #[command(visible_alias = "sc")]
    Scan(ScanArgs),
    /// Check which image references exist and can be pulled.
    #[command(visible_alias = "val")]
    Validate(PipelineArgs),
    /// Manage modcrane configuration (exclusions, defaults, etc.).
    #[command(visible_alias = "cfg")]
    Config(ConfigArgs),
}

#[derive(Args)]
struct PipelineArgs {
    /// Image references, e.g. quay.io/biocontainers/bwa:0.7.17--hed695b0_7.
    #[arg(value_name = "URL", num_args = 0..)]
    urls: Vec<String>,

    /// Read additional references from a file, one per line.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    url_file: Option<PathBuf>,

    /// Directory for pulled images.
    #[arg(short = 'I', long = "imgdir", value_name = "DIR")]
    image_dir: Option<PathBuf>,

    /// Directory for generated modulefiles.
    #[arg(short = 'M', long = "moddir", value_name = "DIR")]
    module_dir: Option<PathBuf>,

    /// Directory for stage caches.
    #[arg(short = 'C', long = "cachedir", value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Number of worker threads per stage.
    #[arg(short = 't', long = "threads", value_name = "N")]
    threads: Option<usize>,

    /// Hide programs found in at least this percent of images.
    #[arg(short = 'p', long = "percentile", value_name = "P")]
    percentile: Option<f64>,

    /// Container engine to use (docker or singularity).
    #[arg(short = 'S', long = "engine", value_name = "ENGINE")]
    engine: Option<String>,

    /// Contact URL shown in module help; repeat for several.
    #[arg(short = 'c', long = "contact", value_name = "URL", action = ArgAction::Append)]
    contact: Vec<String>,

    /// Google Forms URL used to record program usage.
    #[arg(long = "tracker", value_name = "URL")]
    tracker_url: Option<String>,

    /// Prefix replacing the working directory in image paths.
    #[arg(short = 'P', long = "prefix", value_name = "PREFIX")]
    path_prefix: Option<String>,

    /// Prefix for module versions, giving PREFIX-tag.
    #[arg(long = "modprefix", value_name = "PREFIX")]
    module_prefix: Option<String>,

    /// Module required before any generated module loads; repeat for several.
    #[arg(long = "prereq", value_name = "MODULE", action = ArgAction::Append)]
    prereqs: Vec<String>,

    /// Keep images the catalog lists as libraries.
    #[arg(long = "include-libs", action = ArgAction::SetTrue)]
    include_libs: bool,

    /// Seed new pulls from a shared base-layer archive.
    #[arg(long = "layer-cache", action = ArgAction::SetTrue)]
    layer_cache: bool,

    /// Ignore cached stage results.
    #[arg(long = "force-cache", action = ArgAction::SetTrue)]
    force_cache: bool,

    /// Show debug logs instead of progress bars.
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

impl PipelineArgs {
    fn into_options(self) -> Result<PipelineOptions, AppError> {
        let mut config = Config::load()?;
        if let Some(dir) = self.image_dir {
            config.image_dir = dir;
        }
        if let Some(dir) = self.module_dir {
            config.module_dir = dir;
        }
        if self.cache_dir.is_some() {
            config.cache_dir = self.cache_dir;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(percentile) = self.percentile {
            config.percentile = percentile;
        }
        if self.engine.is_some() {
            config.engine = self.engine;
        }
        if !self.contact.is_empty() {
            config.contact = self.contact;
        }
        if self.tracker_url.is_some() {
            config.tracker_url = self.tracker_url;
        }
        if self.path_prefix.is_some() {
            config.path_prefix = self.path_prefix;
        }
        if self.module_prefix.is_some() {
            config.module_prefix = self.module_prefix;
        }
        if !self.prereqs.is_empty() {
            config.prereqs = self.prereqs;
        }
        config.include_libs |= self.include_libs;
        config.layer_cache |= self.layer_cache;

        Ok(PipelineOptions {
            config,
            urls: self.urls,
            url_file: self.url_file,
            force_cache: self.force_cache,
            verbose: self.verbose,
        })
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Rewrite modulefiles that already exist.
    #[arg(long = "force", action = ArgAction::SetTrue)]
    force_modules: bool,

    /// Delete images and modulefiles that no reference produced.
    #[arg(short = 'd', long = "delete-old", action = ArgAction::SetTrue)]
    delete_old: bool,
}

#[derive(Args)]
struct ScanArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Only print how many programs each image exposes.
    #[arg(long = "list", action = ArgAction::SetTrue)]
    list: bool,
}

#[derive(Args)]
struct ConfigArgs {
    /// Show the configuration file path.
    #[arg(long = "path", action = ArgAction::SetTrue)]
    path: bool,

    /// Open the configuration file in $EDITOR.
    #[arg(long = "edit", action = ArgAction::SetTrue)]
    edit: bool,

    /// Add a glob pattern for image references to skip.
    #[arg(long = "add-exclude", value_name = "PATTERN")]
    add_exclude: Option<String>,
}
