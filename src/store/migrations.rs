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
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS prospects (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                first_name TEXT NOT NULL,
                phone TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                prospect_id TEXT NOT NULL REFERENCES prospects(id) ON DELETE CASCADE,
                thread_subject TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                outcome TEXT,
                intent TEXT,
                lead_score REAL,
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (prospect_id, thread_subject)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status);
            CREATE INDEX IF NOT EXISTS idx_conversations_last_message ON conversations(last_message_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS pending_responses (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                llm_content TEXT NOT NULL,
                edited_content TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                provider TEXT NOT NULL,
                created_at TEXT NOT NULL,
                actioned_at TEXT,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_responses(status);
            CREATE INDEX IF NOT EXISTS idx_pending_conversation ON pending_responses(conversation_id);
        "#,
    },
    Migration {
        version: 2,
        name: "system_config",
        sql: r#"
            CREATE TABLE IF NOT EXISTS system_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                polling_interval_minutes INTEGER NOT NULL,
                cold_lead_threshold_days INTEGER NOT NULL,
                cold_lead_notifications_enabled INTEGER NOT NULL,
                max_message_exchanges INTEGER NOT NULL,
                primary_provider TEXT NOT NULL,
                fallback_provider TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "prompt_versions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS prompts (
                name TEXT PRIMARY KEY,
                active_version INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS prompt_versions (
                prompt_name TEXT NOT NULL REFERENCES prompts(name) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (prompt_name, version)
            );
        "#,
    },
    Migration {
        version: 4,
        name: "draft_closing_outcome",
        sql: r#"
            ALTER TABLE pending_responses ADD COLUMN closes_with TEXT;
        "#,
    },
];

/// Run all pending migrations.
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

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        seed_version(conn, migration.version, migration.name).await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Bad migration version: {e}"))),
        _ => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record V{version}: {e}")))?;
    Ok(())
}
