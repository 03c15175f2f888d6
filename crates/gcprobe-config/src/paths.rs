//! Where configuration files live.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Checked-in project settings.
pub const PROJECT_FILE: &str = "gcprobe.toml";

/// Per-checkout overrides, kept out of version control.
pub const LOCAL_FILE: &str = "gcprobe.local.toml";

/// `config.toml` under the platform config dir, e.g. `~/.config/gcprobe/`.
pub fn user_file() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("", "", "gcprobe")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or(ConfigError::NoUserDir)
}

pub fn project_file(project_dir: impl AsRef<Path>) -> PathBuf {
    project_dir.as_ref().join(PROJECT_FILE)
}

pub fn local_file(project_dir: impl AsRef<Path>) -> PathBuf {
    project_dir.as_ref().join(LOCAL_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_file_is_namespaced() {
        if let Ok(file) = user_file() {
            assert!(file.ends_with("config.toml"));
            assert!(file.to_string_lossy().contains("gcprobe"));
        }
    }

    #[test]
    fn test_project_files_sit_side_by_side() {
        let dir = Path::new("/srv/probe");
        assert_eq!(project_file(dir), dir.join("gcprobe.toml"));
        assert_eq!(local_file(dir), dir.join("gcprobe.local.toml"));
        assert_eq!(project_file(dir).parent(), local_file(dir).parent());
    }
}
