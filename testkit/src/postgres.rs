//! Throwaway Postgres databases, one per scope that asks for one.

use crate::{
    errors::{Error, Result},
    migrate,
    suite::{Suite, TestScope},
};
use dashmap::DashMap;
use sqlx::{postgres::PgPoolOptions, Connection, PgPool};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use testkit_settings::PostgresSettings;

/// The database every Postgres server has, used to create and drop others.
pub(crate) const ROOT_DATABASE: &str = "postgres";

/// The last timestamp handed out by [`generate_database_name`].
static LAST_DATABASE_MILLIS: AtomicU64 = AtomicU64::new(0);

/// A database created for a scope.
#[derive(Clone, Debug)]
pub(crate) struct PostgresDatabase {
    /// The generated database name.
    pub(crate) name: String,
    /// A connection string for the database.
    pub(crate) dsn: String,
    /// A pool connected to the database.
    pub(crate) pool: PgPool,
}

/// The databases of a suite.
#[derive(Default)]
pub(crate) struct PostgresResources {
    /// The current database of each scope.
    by_scope: DashMap<String, PostgresDatabase>,

    /// Every database created, in order, including ones a scope replaced.
    created: Mutex<Vec<PostgresDatabase>>,
}

/// `<prefix>_<unix millis>`, lowercased. Names handed out by one process are
/// unique, even when asked for within the same millisecond.
pub(crate) fn generate_database_name(prefix: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64);

    let mut last = LAST_DATABASE_MILLIS.load(Ordering::Relaxed);
    let millis = loop {
        let next = now.max(last + 1);
        match LAST_DATABASE_MILLIS.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break next,
            Err(actual) => last = actual,
        }
    };

    format!("{prefix}_{millis}").to_lowercase()
}

/// Quote `name` for use as an SQL identifier.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Connect to the database called `name`, and make sure it answers.
pub(crate) async fn connect(settings: &PostgresSettings, name: &str) -> Result<PgPool> {
    let dsn = settings.dsn(name)?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&dsn)
        .await
        .map_err(|source| Error::Postgres {
            database: name.to_string(),
            action: "failed to connect to database",
            source,
        })?;

    let mut connection = pool.acquire().await.map_err(|source| Error::Postgres {
        database: name.to_string(),
        action: "failed to acquire connection",
        source,
    })?;
    connection.ping().await.map_err(|source| Error::Postgres {
        database: name.to_string(),
        action: "ping database failed",
        source,
    })?;

    Ok(pool)
}

/// Run a statement that names `database` but runs against `pool`.
pub(crate) async fn execute(
    pool: &PgPool,
    database: &str,
    action: &'static str,
    statement: &str,
) -> Result<()> {
    tracing::debug!(%database, %statement, "Executing statement");
    sqlx::query(statement)
        .execute(pool)
        .await
        .map_err(|source| Error::Postgres {
            database: database.to_string(),
            action,
            source,
        })?;
    Ok(())
}

/// Whether a database called `name` exists on the server `root` talks to.
pub(crate) async fn database_exists(root: &PgPool, name: &str) -> Result<bool> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT datname FROM pg_catalog.pg_database WHERE datname = $1)",
    )
    .bind(name)
    .fetch_one(root)
    .await
    .map_err(|source| Error::Postgres {
        database: name.to_string(),
        action: "failed to check if database exists",
        source,
    })
}

/// Create the database `name`, copying the configured template if there is
/// one, and connect to it. An existing database of that name is reused.
pub(crate) async fn create_database(settings: &PostgresSettings, name: &str) -> Result<PgPool> {
    let root = connect(settings, ROOT_DATABASE).await?;
    let created = create_on(&root, settings, name).await;
    root.close().await;
    created?;

    connect(settings, name).await
}

/// The body of [`create_database`], run on a connection to the root
/// database.
async fn create_on(root: &PgPool, settings: &PostgresSettings, name: &str) -> Result<()> {
    let template = settings.from_template.as_deref().filter(|t| !t.is_empty());

    if database_exists(root, name).await? {
        tracing::info!(target_database = %name, "Database already exists");
        return Ok(());
    }

    match template {
        Some(template) => {
            tracing::info!(target_database = %name, %template, "Creating new database from template");
            let statement = format!(
                "CREATE DATABASE {} WITH TEMPLATE {}",
                quote_identifier(name),
                quote_identifier(template)
            );
            execute(root, name, "failed to create database from template", &statement).await
        }
        None => {
            tracing::info!(target_database = %name, "Creating new database from scratch");
            let statement = format!("CREATE DATABASE {}", quote_identifier(name));
            execute(root, name, "failed to create database from scratch", &statement).await
        }
    }
}

/// Drop the database `name`.
pub(crate) async fn drop_database(settings: &PostgresSettings, name: &str) -> Result<()> {
    let root = connect(settings, ROOT_DATABASE).await?;
    let statement = format!("DROP DATABASE IF EXISTS {}", quote_identifier(name));
    let dropped = execute(&root, name, "failed to drop database", &statement).await;
    root.close().await;
    dropped
}

impl TestScope {
    /// Create a database for this scope, named `<prefix>_<unix millis>` in
    /// lowercase, and return a pool connected to it.
    ///
    /// If migrations are configured, they are applied once per process
    /// before the first database is created. The database is created from
    /// the configured template if there is one. It is dropped when the suite
    /// finishes.
    ///
    /// # Errors
    /// If migrations fail, or the database cannot be created or reached.
    pub async fn requires_postgres_database(&self, prefix: &str) -> Result<PgPool> {
        migrate::ensure_database_initialised(self.settings()).await?;

        let settings = &self.settings().postgres;
        let name = generate_database_name(prefix);
        let pool = create_database(settings, &name).await?;
        let database = PostgresDatabase {
            dsn: settings.dsn(&name)?,
            name,
            pool: pool.clone(),
        };

        let resources = &self.suite().inner.postgres;
        resources
            .created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(database.clone());
        resources
            .by_scope
            .insert(self.name().to_string(), database);

        Ok(pool)
    }

    /// The pool for the database of this scope, or of the nearest parent
    /// scope that has one.
    ///
    /// # Errors
    /// If no such scope called [`requires_postgres_database`](Self::requires_postgres_database).
    pub fn psql_db(&self) -> Result<PgPool> {
        self.lookup(&self.suite().inner.postgres.by_scope)
            .map(|database| database.pool.clone())
            .ok_or(Error::DatabaseNotInitiated)
    }

    /// The connection string of the database [`psql_db`](Self::psql_db)
    /// returns.
    ///
    /// # Errors
    /// If no such scope called [`requires_postgres_database`](Self::requires_postgres_database).
    pub fn psql_dsn(&self) -> Result<String> {
        self.lookup(&self.suite().inner.postgres.by_scope)
            .map(|database| database.dsn.clone())
            .ok_or(Error::DatabaseNotInitiated)
    }
}

impl Suite {
    /// Close and drop every database the suite created, newest first.
    pub(crate) async fn cleanup_postgres(&self) {
        let resources = &self.inner.postgres;
        resources.by_scope.clear();
        let created =
            std::mem::take(&mut *resources.created.lock().unwrap_or_else(PoisonError::into_inner));

        for database in created.into_iter().rev() {
            database.pool.close().await;
            match drop_database(&self.inner.settings.postgres, &database.name).await {
                Ok(()) => tracing::debug!(database = %database.name, "Dropped database"),
                Err(error) => tracing::warn!(%error, database = %database.name, "Failed to drop database"),
            }
        }
    }
}
