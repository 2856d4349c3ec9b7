use crate::commands::{PipelineOptions, build_system};
use crate::error::AppError;
use crate::model::RunReport;
use crate::utils::{directory_size, display_path, format_bytes};

pub struct RunOptions {
    pub pipeline: PipelineOptions,
    /// Rewrite modulefiles that already exist.
    pub force_modules: bool,
    /// Remove images and modulefiles that belong to no current reference.
    pub delete_old: bool,
}

/// Validate, pull, scan, block and render every reference.
pub fn execute_run(options: RunOptions) -> Result<RunReport, AppError> {
    let urls = options.pipeline.references()?;
    let baseline = options.pipeline.config.baseline.clone();
    let system = build_system(&options.pipeline, options.force_modules)?;

    let mut all_urls = baseline.clone();
    all_urls.extend(urls.iter().cloned());

    system.pull_all(&all_urls, options.delete_old)?;
    system.scan_all(&all_urls)?;
    let block = system.find_common(options.pipeline.config.percentile, &baseline);
    for url in &baseline {
        system.delete_image(url)?;
    }
    let written = system.render_all(options.delete_old)?;

    let report = RunReport {
        valid: system.valid().into_iter().filter(|url| !baseline.contains(url)).collect(),
        invalid: system.invalid(),
        blocked: block.len(),
        written,
    };
    print_report(&report, &options);
    Ok(report)
}

fn print_report(report: &RunReport, options: &RunOptions) {
    let config = &options.pipeline.config;
    println!("Run results:");
    println!("- valid      {:>6}", report.valid.len());
    println!("- invalid    {:>6}", report.invalid.len());
    println!("- blocked    {:>6} program(s)", report.blocked);
    println!("- modules    {:>6} in {}", report.written.len(), display_path(&config.module_dir));
    if options.pipeline.verbose {
        for url in &report.invalid {
            println!("    • invalid {url}");
        }
        for path in &report.written {
            println!("    • {}", display_path(path));
        }
    }
    if report.is_empty() {
        println!("No valid images. Nothing was generated.");
    } else {
        println!("Images: {}", format_bytes(directory_size(&config.image_dir)));
    }
}
