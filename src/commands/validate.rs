use std::collections::BTreeSet;

use crate::commands::{PipelineOptions, build_system};
use crate::error::AppError;

/// Classify every reference and print the partition.
pub fn execute_validate(
    options: PipelineOptions,
) -> Result<(BTreeSet<String>, BTreeSet<String>), AppError> {
    let urls = options.references()?;
    let system = build_system(&options, false)?;
    let (valid, invalid) = system.validate_all(&urls)?;

    let requested: BTreeSet<&String> = urls.iter().collect();
    println!("Validation results:");
    for url in valid.iter().filter(|url| requested.contains(url)) {
        println!("- valid   {url}");
    }
    for url in invalid.iter().filter(|url| requested.contains(url)) {
        println!("- invalid {url}");
    }
    Ok((valid, invalid))
}
