use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use byte_unit::{Byte, UnitType};
use dirs_next as dirs;
use tracing::debug;
use walkdir::WalkDir;

/// Format bytes into a human-readable string.
pub fn format_bytes(size: u64) -> String {
    if size == 0 {
        "0 B".to_string()
    } else {
        let adjusted = Byte::from_u64(size).get_appropriate_unit(UnitType::Decimal);
        format!("{adjusted:#.2}")
    }
}

/// Replace the home directory prefix with `~` to make output easier to read.
pub fn display_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir()
        && let Ok(stripped) = path.strip_prefix(&home)
    {
        let mut display = PathBuf::from("~");
        display.push(stripped);
        return display.display().to_string();
    }

    path.display().to_string()
}

/// Single-quotes `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Removes every empty directory below `root`, deepest first. `root` itself is kept.
pub fn remove_empty_sub_directories(root: &Path) -> io::Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_empty = fs::read_dir(entry.path())?.next().is_none();
        if is_empty {
            fs::remove_dir(entry.path())?;
            debug!(path = %entry.path().display(), "removed empty directory");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Total size of the regular files below `root`.
pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_nested_empty_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d/e/f"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        for name in ["a", "b", "c"] {
            fs::write(dir.path().join(name).join("v"), "").unwrap();
        }
        assert_eq!(remove_empty_sub_directories(dir.path()).unwrap(), 3);
        assert!(!dir.path().join("d").exists());
        assert!(dir.path().join("a/v").exists());
        assert_eq!(remove_empty_sub_directories(dir.path()).unwrap(), 0);
        assert!(dir.path().exists());
    }

    #[test]
    fn quotes_for_posix_shell() {
        assert_eq!(shell_quote("/img/bwa.sif"), "'/img/bwa.sif'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(directory_size(Path::new("/nonexistent/modcrane")), 0);
    }
}
