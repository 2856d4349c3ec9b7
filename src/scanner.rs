use std::collections::BTreeSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, error};

use crate::engine::{CommandRunner, Engine};
use crate::error::AppError;
use crate::model::ImageHandle;
use crate::scanners::{self, ShellDialect};

/// Lists the programs an image exposes on its `PATH`.
pub struct ProgramScanner {
    engine: Engine,
    runner: Arc<dyn CommandRunner>,
    dialects: Vec<Box<dyn ShellDialect>>,
    program_name: Regex,
}

impl ProgramScanner {
    pub fn new(engine: Engine, runner: Arc<dyn CommandRunner>) -> Result<Self, AppError> {
        let program_name = Regex::new(r"^\w+$").map_err(|err| AppError::config(err.to_string()))?;
        Ok(Self { engine, runner, dialects: scanners::supported(), program_name })
    }

    /// First supported shell present inside `image`.
    pub fn detect_shell(&self, image: &ImageHandle) -> Result<&dyn ShellDialect, AppError> {
        for dialect in &self.dialects {
            let test = self.engine.exec(image, &dialect.presence_test());
            let presence = format!("{test} >/dev/null 2>&1");
            if self.runner.succeeds(&presence) {
                debug!(image = %image.as_arg(), shell = dialect.shell(), "detected shell");
                return Ok(dialect.as_ref());
            }
        }
        error!(image = %image.as_arg(), "could not determine container env shell");
        Err(AppError::NoShell(image.as_arg()))
    }

    /// Unique program names found on the `PATH` of `image`.
    pub fn scan(&self, image: &ImageHandle) -> Result<BTreeSet<String>, AppError> {
        let dialect = self.detect_shell(image)?;
        let command = self.engine.exec(image, &dialect.listing_command());
        let output = self.runner.run(&command, &[])?;
        if !output.success {
            debug!(image = %image.as_arg(), "listing command exited with an error");
        }
        Ok(self.filter(&output.stdout))
    }

    /// Keeps identifier-like names that do not start with `_`.
    pub fn filter(&self, listing: &str) -> BTreeSet<String> {
        listing
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !name.starts_with('_'))
            .filter(|name| self.program_name.is_match(name))
            .map(str::to_string)
            .collect()
    }
}
