//! Locating and caching the raw configuration file.
//!
//! The file is found by, in order:
//!
//! 1. The path in the environment variable `TESTKIT_CONFIG_LOCATION`, if it
//!    is set to something other than whitespace.
//! 2. The first entry in the current working directory whose name ends with
//!    `.testkit.config.yaml` or `.testkit.config.yml` (case insensitive).
//!
//! The content is read once per process. Setting `DISABLE_CONFIG_CACHE` to
//! any value forces a re-read on every call, which is mostly useful for
//! tests that write config files on the fly.

use crate::SettingsError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Environment variable holding an explicit config file location.
pub const ENV_CONFIG_LOCATION: &str = "TESTKIT_CONFIG_LOCATION";

/// Environment variable that disables the process-wide config cache.
pub const ENV_DISABLE_CONFIG_CACHE: &str = "DISABLE_CONFIG_CACHE";

lazy_static! {
    static ref CONFIG_FILE_MATCHER: Regex =
        Regex::new(r"(?i)\.testkit\.config\.(yaml|yml)$").expect("valid config file pattern");
    static ref CONFIG_CACHE: Mutex<Option<ConfigFile>> = Mutex::new(None);
}

/// The raw content of a configuration file, and where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigFile {
    /// Where the file was read from.
    pub path: PathBuf,

    /// The file content, unparsed.
    pub content: String,

    /// True if the location came from `TESTKIT_CONFIG_LOCATION`.
    pub loaded_via_env: bool,
}

impl ConfigFile {
    /// Read the file at `path`.
    ///
    /// # Errors
    /// If the file cannot be read.
    pub fn read(path: &Path, loaded_via_env: bool) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            content,
            loaded_via_env,
        })
    }

    /// Locate and read a config file without consulting the cache.
    ///
    /// `env_location` takes precedence over searching `dir`.
    ///
    /// # Errors
    /// If no file can be found, or the file found cannot be read.
    pub fn locate(env_location: Option<&str>, dir: &Path) -> Result<Self, SettingsError> {
        match env_location.map(str::trim).filter(|l| !l.is_empty()) {
            Some(location) => Self::read(Path::new(location), true),
            None => Self::read(&find_config_file(dir)?, false),
        }
    }

    /// The directory holding the file. This is what `$PROJECT_ROOT` expands to.
    pub fn project_root(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Deserialize the raw file content as `T`. An empty file gives `T::default()`.
    ///
    /// # Errors
    /// If the content is not valid YAML for `T`.
    pub fn parse_as<T>(&self) -> Result<T, SettingsError>
    where
        T: DeserializeOwned + Default,
    {
        if self.content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_yaml::from_str(&self.content).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// Find the config file in `root`, without recursing.
fn find_config_file(root: &Path) -> Result<PathBuf, SettingsError> {
    let entries = std::fs::read_dir(root).map_err(|source| SettingsError::Read {
        path: root.to_path_buf(),
        source,
    })?;

    let mut names: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| CONFIG_FILE_MATCHER.is_match(name))
        })
        .collect();
    // read_dir order is platform dependent
    names.sort();

    names
        .into_iter()
        .next()
        .ok_or_else(|| SettingsError::NotFound(root.to_path_buf()))
}

/// Read the config file, using the process-wide cache unless it is disabled.
///
/// # Errors
/// If no file can be found or read. Failures are not cached.
pub fn read_config_file() -> Result<ConfigFile, SettingsError> {
    let cache_disabled = std::env::var_os(ENV_DISABLE_CONFIG_CACHE).is_some();
    let mut cache = CONFIG_CACHE.lock().expect("config cache mutex was poisoned");

    if !cache_disabled {
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
    }

    let env_location = std::env::var(ENV_CONFIG_LOCATION).ok();
    let working_dir = std::env::current_dir().map_err(|source| SettingsError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    let file = ConfigFile::locate(env_location.as_deref(), &working_dir)?;
    tracing::debug!(path = %file.path.display(), via_env = file.loaded_via_env, "Read testkit config file");

    *cache = Some(file.clone());
    Ok(file)
}

/// Read the config file and deserialize it as `T`.
///
/// # Errors
/// If the file cannot be found or read, or is not valid for `T`.
pub fn read_config_as<T>() -> Result<T, SettingsError>
where
    T: DeserializeOwned + Default,
{
    read_config_file()?.parse_as()
}
