//! Database module for the build store.
//!
//! The CI ingester writes builds into SQLite; this service reads them and
//! appends comments and builder statuses.

mod retry;
mod sqlite;
mod store;

#[cfg(test)]
pub use retry::RetryConfig;
pub use sqlite::*;
pub use store::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            builder TEXT NOT NULL,
            master TEXT NOT NULL,
            number INTEGER NOT NULL,
            gotRevision TEXT,
            branch TEXT NOT NULL DEFAULT '',
            repository TEXT NOT NULL DEFAULT '',
            results INTEGER,
            buildslave TEXT NOT NULL DEFAULT '',
            started TEXT,
            finished TEXT,
            properties TEXT,
            UNIQUE (builder, master, number)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS buildSteps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            buildId INTEGER NOT NULL,
            name TEXT NOT NULL,
            number INTEGER NOT NULL,
            results INTEGER,
            started TEXT,
            finished TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS buildRevisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            buildId INTEGER NOT NULL,
            revision TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS buildComments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            buildId INTEGER NOT NULL,
            user TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            message TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builderStatus (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            builder TEXT NOT NULL,
            user TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            flaky INTEGER NOT NULL DEFAULT 0,
            ignoreFailure INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT ''
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS commitComments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            "commit" TEXT NOT NULL,
            user TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            message TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_build_revisions_revision ON buildRevisions(revision);
        CREATE INDEX IF NOT EXISTS idx_build_revisions_build ON buildRevisions(buildId);
        CREATE INDEX IF NOT EXISTS idx_build_steps_build ON buildSteps(buildId);
        CREATE INDEX IF NOT EXISTS idx_build_comments_build ON buildComments(buildId);
        CREATE INDEX IF NOT EXISTS idx_builder_status_builder ON builderStatus(builder);
        CREATE INDEX IF NOT EXISTS idx_commit_comments_commit ON commitComments("commit");
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
