//! Application directories for Relay.
//!
//! Everything lives under one home directory:
//! - `~/.relay` by default
//! - `RELAY_HOME` overrides it (relative values are resolved against the
//!   current directory)

use std::path::PathBuf;

/// Environment variable overriding the home directory.
pub const RELAY_HOME_ENV: &str = "RELAY_HOME";

/// Home directory name under the user's home.
pub const HOME_DIR_NAME: &str = ".relay";

/// Resolved application directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    pub home: PathBuf,
}

impl AppDirs {
    /// Resolve from the environment. `None` when no home directory can be
    /// determined and `RELAY_HOME` is unset.
    pub fn new() -> Option<Self> {
        if let Ok(home) = std::env::var(RELAY_HOME_ENV)
            && !home.is_empty()
        {
            let home = PathBuf::from(home);
            let home = if home.is_relative() {
                std::env::current_dir().ok()?.join(home)
            } else {
                home
            };
            return Some(Self { home });
        }

        dirs::home_dir().map(|dir| Self {
            home: dir.join(HOME_DIR_NAME),
        })
    }

    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Default configuration file (`config.toml`).
    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    /// One subdirectory per batch job.
    pub fn batches_dir(&self) -> PathBuf {
        self.home.join("batches")
    }

    /// Scheduled jobs and their run history.
    pub fn schedules_file(&self) -> PathBuf {
        self.home.join("schedules.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }
}

/// Shorthand for [`AppDirs::new`].
pub fn get_app_dirs() -> Option<AppDirs> {
    AppDirs::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard(Option<String>);

    impl EnvGuard {
        fn set(value: Option<&str>) -> Self {
            let previous = std::env::var(RELAY_HOME_ENV).ok();
            // SAFETY: tests touching the environment are serialized.
            unsafe {
                match value {
                    Some(v) => std::env::set_var(RELAY_HOME_ENV, v),
                    None => std::env::remove_var(RELAY_HOME_ENV),
                }
            }
            Self(previous)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            // SAFETY: see `set`.
            unsafe {
                match &self.0 {
                    Some(v) => std::env::set_var(RELAY_HOME_ENV, v),
                    None => std::env::remove_var(RELAY_HOME_ENV),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_relay_home_override() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::set(Some(dir.path().to_str().unwrap()));

        let dirs = AppDirs::new().unwrap();
        assert_eq!(dirs.home, dir.path());
        assert_eq!(dirs.batches_dir(), dir.path().join("batches"));
        assert_eq!(dirs.config_file(), dir.path().join("config.toml"));
    }

    #[test]
    #[serial]
    fn test_relative_home_is_absolutized() {
        let _guard = EnvGuard::set(Some("relay-data"));
        let dirs = AppDirs::new().unwrap();
        assert!(dirs.home.is_absolute());
        assert!(dirs.home.ends_with("relay-data"));
    }

    #[test]
    #[serial]
    fn test_default_home() {
        let _guard = EnvGuard::set(None);
        if let Some(dirs) = AppDirs::new() {
            assert!(dirs.home.ends_with(HOME_DIR_NAME));
        }
    }
}
