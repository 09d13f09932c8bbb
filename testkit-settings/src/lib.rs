//! # Testkit Settings
//!
//! Configuration is read from a YAML file, located as described in
//! [`source`]. Values from the file can then be overridden by environment
//! variables that begin with `TESTKIT_` and use `__` to separate levels. For
//! example, `Settings::postgres::host` can be controlled from the environment
//! variable `TESTKIT_POSTGRES__HOST`.
//!
//! Every section is optional. A suite that never asks for Postgres does not
//! need a `postgres` section, and a crate without any config file gets
//! [`Settings::default`].
//!
//! ```yaml
//! # .testkit.config.yaml
//! log_level: debug
//! postgres:
//!   name: postgres
//!   user: testkit
//!   password: badger
//!   host: localhost:5544
//!   query_params:
//!     sslmode: disable
//!   from_template: orders_template
//! migrations:
//!   migration_path: $PROJECT_ROOT/migrations
//!   database_name: orders_template
//!   is_template: true
//! elasticsearch:
//!   addresses: http://localhost:9200
//! kafka:
//!   delivery_timeout_ms: 5000
//! ```

mod logging;
mod postgres;
pub mod source;

pub use logging::{DirectiveWrapper, LogFormat, LoggingSettings};
pub use postgres::{MigrationSettings, PostgresSettings, PROJECT_ROOT_PLACEHOLDER};
pub use source::{read_config_as, ConfigFile};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

/// Top level settings object for testkit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// A single level, such as `debug`, applied on top of
    /// [`logging.levels`](LoggingSettings::levels).
    pub log_level: Option<String>,

    /// Logging settings.
    pub logging: LoggingSettings,

    /// The Postgres server per-test databases are created on.
    pub postgres: PostgresSettings,

    /// Migrations to run once per process before the first database is created.
    pub migrations: Option<MigrationSettings>,

    /// The Elasticsearch cluster, if tests use one.
    pub elasticsearch: Option<SearchSettings>,

    /// The OpenSearch cluster, if tests use one.
    pub opensearch: Option<SearchSettings>,

    /// A remote stub server for API mocks. If not set, each suite starts its
    /// own in-process server.
    pub api_mock: Option<ApiMockSettings>,

    /// Settings for the Kafka mock clusters.
    pub kafka: KafkaSettings,

    /// The directory holding the config file, if one was found.
    #[serde(skip)]
    pub project_root: Option<PathBuf>,
}

/// Connection settings for an Elasticsearch or OpenSearch cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Comma separated node URLs, such as `http://localhost:9200`.
    pub addresses: String,

    /// Basic auth user. Empty means no authentication.
    pub username: String,

    /// Basic auth password.
    pub password: String,
}

impl SearchSettings {
    /// The configured node URLs, in order, with blanks removed.
    pub fn addresses(&self) -> Vec<&str> {
        self.addresses
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .collect()
    }

    /// The credentials to use, if a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }
}

/// Location of a remote stub server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiMockSettings {
    /// The server address, such as `http://localhost:8080`.
    pub address: String,
}

/// Settings for Kafka mock clusters and the clients that talk to them.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// How long a consumer waits for each message before polling again.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,

    /// How long a producer waits for delivery confirmation.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "delivery_timeout_ms")]
    pub delivery_timeout: Duration,

    /// Number of brokers in each mock cluster.
    pub broker_count: i32,

    /// Number of partitions for each created topic.
    pub partitions: i32,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(10),
            broker_count: 1,
            partitions: 1,
        }
    }
}

/// Errors produced while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// No config file exists where one was looked for.
    #[error("config file not found in {}", .0.display())]
    NotFound(PathBuf),

    /// The config file (or the directory holding it) could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// The path that was being read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid YAML for the requested type.
    #[error("failed to unmarshal config from file {}: {source}", path.display())]
    Parse {
        /// The file that was being parsed.
        path: PathBuf,
        /// The underlying error.
        source: serde_yaml::Error,
    },

    /// Merging the file with the environment failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Settings {
    /// Load settings from the config file and environment variables.
    ///
    /// # Errors
    /// If no config file can be found, or any configured value is invalid.
    pub fn load() -> Result<Self, SettingsError> {
        let file = source::read_config_file()?;
        Self::from_file(&file)
    }

    /// Load settings like [`Settings::load`], but fall back to the defaults
    /// when there is no config file at all. Environment variables apply
    /// either way.
    ///
    /// # Errors
    /// If a config file exists but is invalid, or an environment variable
    /// holds an invalid value.
    pub fn load_or_default() -> Result<Self, SettingsError> {
        match Self::load() {
            Err(SettingsError::NotFound(dir)) => {
                tracing::debug!(dir = %dir.display(), "No testkit config file, using defaults");
                Self::from_yaml("")
            }
            other => other,
        }
    }

    /// Build settings from an already read config file, layering environment
    /// variables on top.
    ///
    /// # Errors
    /// If any configured value is invalid.
    pub fn from_file(file: &ConfigFile) -> Result<Self, SettingsError> {
        let mut settings = Self::from_yaml(&file.content)?;
        settings.project_root = Some(file.project_root());
        Ok(settings)
    }

    /// Build settings from YAML `content`, layering environment variables on
    /// top.
    fn from_yaml(content: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Yaml))
            // `TESTKIT_POSTGRES__HOST` maps to `Settings::postgres::host`.
            .add_source(
                Environment::with_prefix("TESTKIT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut settings: Self = config.try_deserialize()?;
        settings.apply_log_level();
        Ok(settings)
    }

    /// Load settings for tests, then let `changer` adjust them.
    ///
    /// # Panics
    /// If a config file exists but is invalid.
    pub fn load_for_tests<F: FnOnce(&mut Self)>(changer: F) -> Self {
        let mut settings = Self::load_or_default().expect("Could not load testkit settings");
        changer(&mut settings);
        settings
    }

    /// Fold [`log_level`](Self::log_level) into the logging directives.
    fn apply_log_level(&mut self) {
        let Some(level) = self.log_level.as_deref() else {
            return;
        };

        match tracing::Level::from_str(level) {
            Ok(level) => match DirectiveWrapper::from_str(&level.to_string()) {
                Ok(directive) => self.logging.levels += directive,
                Err(error) => tracing::warn!(%error, "failed to apply log level"),
            },
            Err(error) => {
                tracing::warn!(%error, %level, "failed to parse log level, using configured levels");
            }
        }
    }
}
