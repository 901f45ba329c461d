//! Platform-specific paths for topology files.
//!
//! # Directory Structure
//!
//! - **User topologies**: `~/.config/stratum/topologies/` (Linux), `~/Library/Application Support/stratum/topologies/` (macOS), `%APPDATA%\stratum\topologies\` (Windows)
//! - **User config**: `~/.config/stratum/` and the platform equivalents
//! - **System topologies**: `/usr/share/stratum/topologies/` (Linux), `/Library/Application Support/stratum/topologies/` (macOS)

use std::path::{Path, PathBuf};

const APP_NAME: &str = "stratum";

const TOPOLOGIES_SUBDIR: &str = "topologies";

/// Returns the user-specific configuration directory.
///
/// Falls back to the current directory if the platform gives none.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the user-specific topologies directory.
pub fn user_topologies_dir() -> PathBuf {
    user_config_dir().join(TOPOLOGIES_SUBDIR)
}

/// Returns the system-wide topologies directory.
pub fn system_topologies_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/usr/share").join(APP_NAME).join(TOPOLOGIES_SUBDIR)
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Application Support")
            .join(APP_NAME)
            .join(TOPOLOGIES_SUBDIR)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
            .join(TOPOLOGIES_SUBDIR)
    }
}

/// Finds a topology file by path or by name.
///
/// Searches in order:
/// 1. `name` as a path
/// 2. the user topologies directory
/// 3. the system topologies directory
///
/// A `.toml` extension is added to bare names.
pub fn find_topology(name: &str) -> Option<PathBuf> {
    let path = PathBuf::from(name);
    if path.is_file() {
        return Some(path);
    }

    let filename = if name.ends_with(".toml") {
        name.to_string()
    } else {
        format!("{name}.toml")
    };

    [user_topologies_dir(), system_topologies_dir()]
        .into_iter()
        .map(|dir| dir.join(&filename))
        .find(|candidate| candidate.is_file())
}

/// Creates the user topologies directory if needed and returns it.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_user_topologies_dir() -> Result<PathBuf, crate::ConfigError> {
    let dir = user_topologies_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| crate::ConfigError::create_dir(&dir, e))?;
    }
    Ok(dir)
}

/// Topology files in the user directory.
pub fn list_user_topologies() -> Vec<PathBuf> {
    list_topologies_in_dir(&user_topologies_dir())
}

/// Topology files in the user directory followed by the system directory.
pub fn list_all_topologies() -> Vec<PathBuf> {
    let mut found = list_user_topologies();
    found.extend(list_topologies_in_dir(&system_topologies_dir()));
    found
}

/// `.toml` files directly inside `dir`, sorted. Empty if `dir` is unreadable.
pub fn list_topologies_in_dir(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    found.sort();
    found
}

/// The topology name of a file: its stem.
///
/// ```rust
/// use stratum_config::paths::topology_name_from_path;
/// use std::path::Path;
///
/// assert_eq!(topology_name_from_path(Path::new("/x/lab.toml")), Some("lab".to_string()));
/// ```
pub fn topology_name_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_user_dirs_are_namespaced() {
        assert!(user_config_dir().to_string_lossy().contains("stratum"));
        assert!(user_topologies_dir().ends_with("stratum/topologies"));
        assert!(system_topologies_dir().to_string_lossy().contains("stratum"));
    }

    #[test]
    fn test_find_topology_by_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("lab.toml");
        fs::write(&path, "name = \"lab\"").unwrap();
        assert_eq!(find_topology(path.to_str().unwrap()), Some(path));
    }

    #[test]
    fn test_find_topology_not_found() {
        assert!(find_topology("nonexistent_topology_12345").is_none());
    }

    #[test]
    fn test_list_topologies_in_dir() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("b.toml"), "").unwrap();
        fs::write(temp_dir.path().join("a.toml"), "").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(temp_dir.path().join("dir.toml")).unwrap();

        let found = list_topologies_in_dir(temp_dir.path());
        let names: Vec<String> = found.iter().filter_map(|p| topology_name_from_path(p)).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_list_topologies_nonexistent_dir() {
        assert!(list_topologies_in_dir(Path::new("/nonexistent/path/12345")).is_empty());
    }
}
