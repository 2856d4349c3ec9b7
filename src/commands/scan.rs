use std::collections::BTreeMap;

use crate::commands::{PipelineOptions, build_system};
use crate::error::AppError;

pub struct ScanOptions {
    pub pipeline: PipelineOptions,
    /// Only print the program counts.
    pub list: bool,
}

/// Pull and scan every reference, printing the programs each one exposes.
pub fn execute_scan(options: ScanOptions) -> Result<BTreeMap<String, Vec<String>>, AppError> {
    let urls = options.pipeline.references()?;
    let system = build_system(&options.pipeline, false)?;
    system.pull_all(&urls, false)?;
    system.scan_all(&urls)?;

    let programs: BTreeMap<String, Vec<String>> = urls
        .iter()
        .filter(|url| system.is_valid(url))
        .map(|url| (url.clone(), system.get_programs(url, false)))
        .collect();

    println!("Scan results:");
    for (url, found) in &programs {
        println!("- {url} ({} program(s))", found.len());
        if !options.list {
            for program in found {
                println!("    • {program}");
            }
        }
    }
    for url in system.invalid().iter().filter(|url| urls.contains(url)) {
        println!("- {url} (invalid)");
    }
    Ok(programs)
}
