use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::config::{Config, config_file_path, ensure_config_file};
use crate::error::AppError;
use crate::modulefile::validate_tracker_url;
use crate::utils::display_path;

pub struct ConfigOptions {
    /// Print the configuration file location.
    pub show_path: bool,
    pub edit: bool,
    /// Glob matched against sanitized references, e.g. `quay.io/biocontainers/*`.
    pub add_exclude: Option<String>,
}

impl ConfigOptions {
    fn is_bare(&self) -> bool {
        !self.show_path && !self.edit && self.add_exclude.is_none()
    }
}

/// Shows, edits or extends the configuration file.
///
/// Without flags the path and the effective settings are printed.
pub fn execute_config(options: ConfigOptions) -> Result<(), AppError> {
    let path = config_file_path()?;
    if options.show_path || options.is_bare() {
        println!("Configuration file: {}", display_path(&path));
    }

    if let Some(pattern) = &options.add_exclude {
        let mut config = Config::load()?;
        config.append_exclude(pattern.clone());
        config.compile_excludes()?;
        config.save()?;
        println!("Added exclude pattern '{pattern}'.");
    }

    if options.edit {
        let path = ensure_config_file()?;
        launch_editor(&path)?;
        let config = check(Config::load()?)?;
        println!("Configuration OK ({} exclude pattern(s)).", config.exclude.len());
    }

    if options.is_bare() {
        let config = Config::load()?;
        print!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}

/// Rejects settings the pipeline would refuse at start-up.
fn check(config: Config) -> Result<Config, AppError> {
    config.compile_excludes()?;
    if !(0.0..=100.0).contains(&config.percentile) {
        return Err(AppError::config(format!(
            "percentile must be within 0-100, got {}",
            config.percentile
        )));
    }
    if let Some(url) = config.tracker_url.as_deref().filter(|url| !url.is_empty()) {
        validate_tracker_url(url)?;
    }
    Ok(config)
}

fn launch_editor(path: &Path) -> Result<(), AppError> {
    let editor = ["VISUAL", "EDITOR"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| "vi".to_string());
    debug!(editor = %editor, path = %path.display(), "opening configuration");

    let status = Command::new(&editor)
        .arg(path)
        .status()
        .map_err(|err| AppError::Editor(format!("{editor}: {err}")))?;
    if !status.success() {
        return Err(AppError::Editor(format!("{editor} exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_rejects_bad_tracker_and_globs() {
        let tracker = Config {
            tracker_url: Some(
                "https://docs.google.com/forms/d/e/x/viewform?&entry.1=package_name".to_string(),
            ),
            ..Config::default()
        };
        assert!(matches!(check(tracker), Err(AppError::TrackerFields { .. })));

        let glob = Config { exclude: vec!["quay.io/[".to_string()], ..Config::default() };
        assert!(matches!(check(glob), Err(AppError::Glob(_))));

        assert!(check(Config::default()).is_ok());
    }
}
