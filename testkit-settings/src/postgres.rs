use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use url::Url;

/// The placeholder in [`MigrationSettings::migration_path`] that expands to
/// the directory holding the config file.
pub const PROJECT_ROOT_PLACEHOLDER: &str = "$PROJECT_ROOT";

/// Connection settings for the Postgres server tests create databases on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    /// The default database name. Per-test databases get generated names, so
    /// this is informational.
    pub name: String,

    /// The user to connect as. Must be allowed to create and drop databases.
    pub user: String,

    /// The password for [`user`](Self::user).
    pub password: String,

    /// The host of the server, with an optional port, such as `localhost:5432`.
    pub host: String,

    /// Extra query parameters appended to every connection string, such as
    /// `sslmode: disable`.
    pub query_params: BTreeMap<String, String>,

    /// If set, per-test databases are created as copies of this template.
    pub from_template: Option<String>,
}

impl PostgresSettings {
    /// Build a connection string for the database called `name`.
    ///
    /// Query parameters are sorted by key.
    ///
    /// # Errors
    /// If `host` does not form a valid URL.
    pub fn dsn(&self, name: &str) -> Result<String, url::ParseError> {
        let mut url = Url::parse(&format!("postgres://{}", self.host))?;
        // These only fail for URLs without a host, which the parse above
        // already rejected for anything a server could listen on.
        let _ = url.set_username(&self.user);
        let _ = url.set_password(Some(&self.password));
        url.set_path(name);

        if !self.query_params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query_params);
        }

        Ok(url.into())
    }
}

/// Settings for preparing a database by running migrations once per process.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// The directory holding the migration files. May start with
    /// `$PROJECT_ROOT/`.
    pub migration_path: String,

    /// The database the migrations run against.
    pub database_name: String,

    /// Create the database as a template, so per-test databases can be
    /// copied from it.
    pub is_template: bool,

    /// Drop and recreate the database if it already exists.
    pub fresh: bool,
}

impl MigrationSettings {
    /// The migration directory with `$PROJECT_ROOT` replaced by `project_root`.
    pub fn resolve_migration_path(&self, project_root: &Path) -> PathBuf {
        match self
            .migration_path
            .strip_prefix(PROJECT_ROOT_PLACEHOLDER)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(relative) => project_root.join(relative),
            None => PathBuf::from(&self.migration_path),
        }
    }
}
