//! Errors the suite runner and the resource helpers can produce.

use rdkafka::error::KafkaError;
use std::path::PathBuf;
use testkit_settings::SettingsError;
use thiserror::Error;

/// The error type for everything in this crate except the HTTP client, which
/// has its own [`xhttp::Error`](crate::xhttp::Error).
#[derive(Debug, Error)]
pub enum Error {
    /// Loading settings failed.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The test filter is not a valid regular expression.
    #[error("testkit: invalid regexp for test filter {pattern:?}: {source}")]
    InvalidFilter {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        source: regex::Error,
    },

    /// A resource was used before the service it needs was configured.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// `psql_db` or `psql_dsn` was called in a scope without a database.
    #[error("database not initiated, must call requires_postgres_database before using this method")]
    DatabaseNotInitiated,

    /// The Postgres settings do not form a valid connection string.
    #[error("invalid postgres connection settings: {0}")]
    InvalidDsn(#[from] url::ParseError),

    /// A Postgres operation failed.
    #[error("[{database}] {action}: {source}")]
    Postgres {
        /// The database being operated on.
        database: String,
        /// What was being attempted.
        action: &'static str,
        /// The driver error.
        source: sqlx::Error,
    },

    /// Running migrations failed.
    #[error("failed to apply migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A search cluster address is not a valid URL.
    #[error("invalid search cluster address {address:?}: {source}")]
    InvalidAddress {
        /// The configured address.
        address: String,
        /// Why it was rejected.
        source: url::ParseError,
    },

    /// The Elasticsearch client reported an error.
    #[error(transparent)]
    Elasticsearch(#[from] elasticsearch::Error),

    /// The OpenSearch client reported an error.
    #[error(transparent)]
    OpenSearch(#[from] opensearch::Error),

    /// A search cluster answered with an unexpected status.
    #[error("received status code: {0}")]
    SearchStatus(u16),

    /// A search cluster rejected a request, with the response body.
    #[error("failed to {action}: {body}")]
    SearchRejected {
        /// What was being attempted.
        action: &'static str,
        /// The response body, which usually names the cause.
        body: String,
    },

    /// A JSON payload could not be built or read.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The Kafka client reported an error.
    #[error(transparent)]
    Kafka(#[from] KafkaError),

    /// No mock cluster exists for the scope or any of its parents.
    #[error("Kafka cluster not found. call requires_kafka before calling produce")]
    KafkaClusterNotFound,

    /// A produced message was not confirmed in time.
    #[error("delivery timeout for topic {0}")]
    DeliveryTimeout(String),

    /// No message arrived on the topic in time.
    #[error("timeout reached while waiting for the message in topic {0}")]
    WaitTimeout(String),

    /// A mock definition file could not be read.
    #[error("failed to read api mock data from file {}: {source}", path.display())]
    MockFileRead {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A mock definition file is not valid.
    #[error("failed to unmarshal api mock data from file: {}: {source}", path.display())]
    MockFileParse {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: serde_yaml::Error,
    },

    /// A mock definition resolved to something the stub server cannot use.
    #[error("invalid api mock: {0}")]
    InvalidMock(String),
}

/// A `Result` using this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
