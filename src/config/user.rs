//! User configuration loading for nestcache.
//!
//! User config location: $XDG_CONFIG_HOME/nestcache/nestcache.toml
//! Fallback: the platform config directory (e.g. ~/.config/nestcache/nestcache.toml)

use std::path::{Path, PathBuf};

use super::settings::CacheSettings;

pub const CONFIG_DIR_NAME: &str = "nestcache";
pub const CONFIG_FILE_NAME: &str = "nestcache.toml";

#[derive(Debug, thiserror::Error)]
pub enum UserConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type UserConfigResult<T> = Result<T, UserConfigError>;

/// Returns the path to the user configuration file.
///
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/nestcache/nestcache.toml
/// 2. Otherwise: `dirs::config_dir()`/nestcache/nestcache.toml
///
/// Returns None if neither location can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg_config) if !xdg_config.is_empty() => PathBuf::from(xdg_config),
        _ => dirs::config_dir()?,
    };
    Some(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Read and parse one settings file.
pub fn load_settings_file(path: &Path) -> UserConfigResult<CacheSettings> {
    let contents = std::fs::read_to_string(path).map_err(|source| UserConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    CacheSettings::from_toml_str(&contents).map_err(|source| UserConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the user configuration, if the file exists.
pub fn load_user_config() -> UserConfigResult<Option<CacheSettings>> {
    let Some(path) = user_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    load_settings_file(&path).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn with_xdg<R>(value: Option<&Path>, f: impl FnOnce() -> R) -> R {
        let original = env::var_os("XDG_CONFIG_HOME");
        // SAFETY: #[serial(xdg_env)] prevents concurrent modification of XDG_CONFIG_HOME
        unsafe {
            match value {
                Some(path) => env::set_var("XDG_CONFIG_HOME", path),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }
        let result = f();
        // SAFETY: Same as above - restoring original env state
        unsafe {
            match original {
                Some(val) => env::set_var("XDG_CONFIG_HOME", val),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }
        result
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_path_uses_xdg_config_home_when_set() {
        let path = with_xdg(Some(Path::new("/custom/config")), user_config_path);
        assert_eq!(
            path,
            Some(PathBuf::from("/custom/config/nestcache/nestcache.toml"))
        );
    }

    #[test]
    #[serial(xdg_env)]
    fn user_config_path_falls_back_to_platform_dir() {
        let path = with_xdg(None, user_config_path);
        let expected = dirs::config_dir().map(|dir| dir.join("nestcache").join("nestcache.toml"));
        assert_eq!(path, expected);
    }

    #[test]
    #[serial(xdg_env)]
    fn load_user_config_returns_none_without_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let loaded = with_xdg(Some(dir.path()), load_user_config).expect("no error");
        assert!(loaded.is_none());
    }

    #[test]
    #[serial(xdg_env)]
    fn load_user_config_reads_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config_dir = dir.path().join("nestcache");
        std::fs::create_dir_all(&config_dir).expect("failed to create config dir");
        std::fs::write(config_dir.join("nestcache.toml"), "staleRetryLimit = 7\n")
            .expect("failed to write config");

        let loaded = with_xdg(Some(dir.path()), load_user_config)
            .expect("no error")
            .expect("config present");
        assert_eq!(loaded.stale_retry_limit, Some(7));
    }

    #[test]
    fn load_settings_file_reports_parse_errors() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "staleRetryLimit = \"many\"").expect("failed to write config");

        let err = load_settings_file(&path).unwrap_err();
        assert!(matches!(err, UserConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }
}
