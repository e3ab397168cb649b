//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages_and_outputs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                thread_id TEXT,
                sender TEXT NOT NULL,
                subject TEXT,
                body_text TEXT,
                body_html TEXT,
                received_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
            CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);

            CREATE TABLE IF NOT EXISTS derived_outputs (
                entity_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_id, kind)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "processing_status_and_logs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processing_status (
                entity_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                current_step TEXT,
                completed_steps TEXT NOT NULL DEFAULT '[]',
                failed_steps TEXT NOT NULL DEFAULT '[]',
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_status_status ON processing_status(status);

            CREATE TABLE IF NOT EXISTS execution_logs (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_execution_logs_entity ON execution_logs(entity_id);
            CREATE INDEX IF NOT EXISTS idx_execution_logs_step ON execution_logs(step_name);
        "#,
    },
    // Folds each log insert into the entity's status row in the same statement,
    // so concurrent appends from steps of one level cannot lose updates.
    Migration {
        version: 3,
        name: "execution_log_fold_trigger",
        sql: r#"
            CREATE TRIGGER IF NOT EXISTS trg_execution_logs_fold
            AFTER INSERT ON execution_logs
            BEGIN
                INSERT OR IGNORE INTO processing_status (entity_id, status, updated_at)
                VALUES (NEW.entity_id, 'pending', NEW.created_at);

                UPDATE processing_status SET
                    completed_steps = CASE
                        WHEN NEW.status = 'ok' AND NOT EXISTS (
                            SELECT 1 FROM json_each(processing_status.completed_steps)
                            WHERE value = NEW.step_name
                        ) THEN json_insert(processing_status.completed_steps, '$[#]', NEW.step_name)
                        WHEN NEW.status = 'error' THEN (
                            SELECT json_group_array(value) FROM json_each(processing_status.completed_steps)
                            WHERE value != NEW.step_name
                        )
                        ELSE processing_status.completed_steps
                    END,
                    failed_steps = CASE
                        WHEN NEW.status = 'error' AND NOT EXISTS (
                            SELECT 1 FROM json_each(processing_status.failed_steps)
                            WHERE value = NEW.step_name
                        ) THEN json_insert(processing_status.failed_steps, '$[#]', NEW.step_name)
                        WHEN NEW.status = 'ok' THEN (
                            SELECT json_group_array(value) FROM json_each(processing_status.failed_steps)
                            WHERE value != NEW.step_name
                        )
                        ELSE processing_status.failed_steps
                    END,
                    updated_at = NEW.created_at
                WHERE entity_id = NEW.entity_id;
            END;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
