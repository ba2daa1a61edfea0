//! Well-known directory resolution.

use std::env;
use std::path::{Path, PathBuf};

use crate::loader::{ConfigError, ConfigResult};

/// Resolved directory layout for one fabric process.
///
/// Resolution order per directory: an explicit `FABRIC_*` environment
/// override, then the conventional location under the project root. Missing
/// directories are created.
#[derive(Clone, Debug)]
pub struct FabricPaths {
    project_root: PathBuf,
    config_dir: PathBuf,
    logs_dir: PathBuf,
    data_dir: PathBuf,
    models_dir: PathBuf,
    cache_dir: PathBuf,
}

impl FabricPaths {
    /// Resolves the directory layout from the environment.
    ///
    /// The project root comes from `FABRIC_ROOT` if set; otherwise the
    /// directory containing the running executable is walked upward until a
    /// `config` directory is found, falling back to the current working
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when a directory cannot be created.
    pub fn resolve() -> ConfigResult<Self> {
        let project_root = match env::var_os("FABRIC_ROOT") {
            Some(root) => PathBuf::from(root),
            None => conventional_root(),
        };
        Self::rooted_at(project_root)
    }

    /// Resolves the layout under an explicit root, still honouring
    /// per-directory environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when a directory cannot be created.
    pub fn rooted_at(project_root: impl Into<PathBuf>) -> ConfigResult<Self> {
        let project_root = project_root.into();
        let dir = |var: &str, default: &str| -> PathBuf {
            env::var_os(var)
                .map_or_else(|| project_root.join(default), PathBuf::from)
        };
        let paths = Self {
            config_dir: dir("FABRIC_CONFIG_DIR", "config"),
            logs_dir: dir("FABRIC_LOGS_DIR", "logs"),
            data_dir: dir("FABRIC_DATA_DIR", "data"),
            models_dir: dir("FABRIC_MODELS_DIR", "models"),
            cache_dir: dir("FABRIC_CACHE_DIR", "cache"),
            project_root,
        };
        for dir in [
            &paths.config_dir,
            &paths.logs_dir,
            &paths.data_dir,
            &paths.models_dir,
            &paths.cache_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(paths)
    }

    /// Returns the project root.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Returns the configuration directory.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Returns the log directory.
    #[must_use]
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Returns the data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the models directory.
    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

fn conventional_root() -> PathBuf {
    if let Ok(exe) = env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        while let Some(candidate) = dir {
            if candidate.join("config").is_dir() {
                return candidate;
            }
            dir = candidate.parent().map(Path::to_path_buf);
        }
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_directories() {
        let root = tempfile::tempdir().expect("tempdir");
        let paths = FabricPaths::rooted_at(root.path()).expect("resolve");
        assert!(paths.config_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
        assert!(paths.data_dir().is_dir());
        assert!(paths.models_dir().is_dir());
        assert!(paths.cache_dir().is_dir());
        assert_eq!(paths.project_root(), root.path());
    }
}
