//! Preparing the database per-test databases are copied from.
//!
//! When `migrations` is configured, the first call to
//! [`requires_postgres_database`](crate::TestScope::requires_postgres_database)
//! in the process creates the configured database and applies the migrations
//! to it. Every later call, from any suite, finds it already done.

use crate::{
    errors::{Error, Result},
    postgres::{self, ROOT_DATABASE},
};
use lazy_static::lazy_static;
use sqlx::{migrate::Migrator, PgPool};
use std::path::PathBuf;
use testkit_settings::{MigrationSettings, Settings};
use tokio::sync::OnceCell;
use tracing::Instrument;

lazy_static! {
    /// Set once the migrations database is ready in this process.
    static ref DATABASE_INITIALISED: OnceCell<()> = OnceCell::new();
}

/// Run [`initialise_database`] unless it already succeeded in this process.
///
/// # Errors
/// If initialising fails. The next call tries again.
pub async fn ensure_database_initialised(settings: &Settings) -> Result<()> {
    DATABASE_INITIALISED
        .get_or_try_init(|| async {
            if let Some(pool) = initialise_database(settings).await? {
                pool.close().await;
            }
            Ok::<_, Error>(())
        })
        .await?;
    Ok(())
}

/// Create the configured migrations database and apply the migrations.
///
/// An existing database is kept as it is, unless `fresh` is set, in which
/// case it is dropped and created again. Returns a pool connected to the
/// database, or `None` if no migrations are configured.
///
/// # Errors
/// If the server cannot be reached, or creating or migrating the database
/// fails.
pub async fn initialise_database(settings: &Settings) -> Result<Option<PgPool>> {
    let Some(migrations) = &settings.migrations else {
        tracing::debug!("No migrations configured");
        return Ok(None);
    };

    let span = tracing::info_span!(
        "initialise_database",
        database = %migrations.database_name,
        template = migrations.is_template,
        migration_path = %migrations.migration_path,
        fresh = migrations.fresh,
    );
    migrate(settings, migrations).instrument(span).await.map(Some)
}

/// Create and migrate the database, returning a pool connected to it.
async fn migrate(settings: &Settings, migrations: &MigrationSettings) -> Result<PgPool> {
    let root = postgres::connect(&settings.postgres, ROOT_DATABASE).await?;
    let prepared = prepare(&root, migrations).await;
    root.close().await;

    if !prepared? {
        tracing::debug!("Database already exists, keeping it");
        return postgres::connect(&settings.postgres, &migrations.database_name).await;
    }

    let path = migration_path(settings, migrations);
    tracing::info!(path = %path.display(), "Applying migrations");
    let migrator = Migrator::new(path).await?;
    let pool = postgres::connect(&settings.postgres, &migrations.database_name).await?;
    if let Err(error) = migrator.run(&pool).await {
        tracing::error!(%error, "failed to apply migrations");
        pool.close().await;
        return Err(error.into());
    }

    Ok(pool)
}

/// Make sure the database exists, recreating it if `fresh` is set. Returns
/// whether it was created, and so still needs migrating.
async fn prepare(root: &PgPool, migrations: &MigrationSettings) -> Result<bool> {
    let name = &migrations.database_name;
    let quoted = postgres::quote_identifier(name);

    if postgres::database_exists(root, name).await? {
        if !migrations.fresh {
            return Ok(false);
        }

        tracing::info!("Database exists but a fresh one was requested, deleting it");
        postgres::execute(
            root,
            name,
            "failed to unmark template database",
            &format!("ALTER DATABASE {quoted} IS_TEMPLATE FALSE"),
        )
        .await?;
        postgres::execute(
            root,
            name,
            "failed to delete database",
            &format!("DROP DATABASE {quoted}"),
        )
        .await?;
    }

    postgres::execute(
        root,
        name,
        "failed to create database",
        &create_statement(name, migrations.is_template),
    )
    .await?;
    Ok(true)
}

/// The statement creating the database `name`.
fn create_statement(name: &str, is_template: bool) -> String {
    let quoted = postgres::quote_identifier(name);
    if is_template {
        format!("CREATE DATABASE {quoted} WITH IS_TEMPLATE = TRUE")
    } else {
        format!("CREATE DATABASE {quoted}")
    }
}

/// The migration directory, with `$PROJECT_ROOT` resolved to the directory
/// the config file was found in (or the working directory, without one).
fn migration_path(settings: &Settings, migrations: &MigrationSettings) -> PathBuf {
    let project_root = settings
        .project_root
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();
    migrations.resolve_migration_path(&project_root)
}
