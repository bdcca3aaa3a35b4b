//! libSQL backend: async `LeadStore` and `PromptStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z`) so string order is time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SystemConfig;
use crate::error::DatabaseError;
use crate::leads::model::{
    Conversation, ConversationStatus, ConversationThread, IntentAssessment, Message, MessageRole,
    PendingResponse, PendingReview, PendingStatus, Prospect,
};
use crate::prompts::{PromptStore, PromptVersion};
use crate::store::migrations;
use crate::store::traits::{
    LeadCommit, LeadCommitResult, LeadStore, NewDraft, TurnCommit, TurnCommitResult,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes
/// are serialized through `write_lock` so a multi-statement transaction
/// never interleaves with another writer on the shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn decode<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row decode: {e}"))
}

/// Map a write failure, surfacing constraint violations distinctly.
fn write_err(context: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint") || msg.contains("CHECK constraint") {
        DatabaseError::Constraint(format!("{context}: {msg}"))
    } else {
        DatabaseError::Query(format!("{context}: {msg}"))
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

const PROSPECT_COLUMNS: &str = "id, email, first_name, phone, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, prospect_id, thread_subject, status, outcome, intent, lead_score, created_at, last_message_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, created_at";

const PENDING_COLUMNS: &str = "id, conversation_id, llm_content, edited_content, status, provider, created_at, actioned_at, sent_at, closes_with";

/// Map a row to a Prospect, reading columns from `base`.
fn row_to_prospect(row: &libsql::Row, base: i32) -> Result<Prospect, DatabaseError> {
    let id: String = row.get(base).map_err(row_err)?;
    let created: String = row.get(base + 4).map_err(row_err)?;
    let updated: String = row.get(base + 5).map_err(row_err)?;
    Ok(Prospect {
        id: parse_uuid(&id)?,
        email: row.get(base + 1).map_err(row_err)?,
        first_name: row.get(base + 2).map_err(row_err)?,
        phone: row.get(base + 3).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_conversation(row: &libsql::Row, base: i32) -> Result<Conversation, DatabaseError> {
    let id: String = row.get(base).map_err(row_err)?;
    let prospect_id: String = row.get(base + 1).map_err(row_err)?;
    let status: String = row.get(base + 3).map_err(row_err)?;
    let outcome: Option<String> = row.get(base + 4).ok();
    let intent: Option<String> = row.get(base + 5).ok();
    let created: String = row.get(base + 7).map_err(row_err)?;
    let last: String = row.get(base + 8).map_err(row_err)?;
    let updated: String = row.get(base + 9).map_err(row_err)?;

    let intent = match intent {
        Some(json) => Some(
            serde_json::from_str::<IntentAssessment>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("intent: {e}")))?,
        ),
        None => None,
    };

    Ok(Conversation {
        id: parse_uuid(&id)?,
        prospect_id: parse_uuid(&prospect_id)?,
        thread_subject: row.get(base + 2).map_err(row_err)?,
        status: decode(&status)?,
        outcome: outcome.as_deref().map(decode).transpose()?,
        intent,
        lead_score: row.get::<f64>(base + 6).ok(),
        created_at: parse_datetime(&created),
        last_message_at: parse_datetime(&last),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let conversation_id: String = row.get(1).map_err(row_err)?;
    let role: String = row.get(2).map_err(row_err)?;
    let created: String = row.get(4).map_err(row_err)?;
    Ok(Message {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: decode(&role)?,
        content: row.get(3).map_err(row_err)?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_pending(row: &libsql::Row, base: i32) -> Result<PendingResponse, DatabaseError> {
    let id: String = row.get(base).map_err(row_err)?;
    let conversation_id: String = row.get(base + 1).map_err(row_err)?;
    let status: String = row.get(base + 4).map_err(row_err)?;
    let created: String = row.get(base + 6).map_err(row_err)?;
    let actioned: Option<String> = row.get(base + 7).ok();
    let sent: Option<String> = row.get(base + 8).ok();
    let closes_with: Option<String> = row.get(base + 9).ok();
    Ok(PendingResponse {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        llm_content: row.get(base + 2).map_err(row_err)?,
        edited_content: row.get(base + 3).ok(),
        status: decode(&status)?,
        provider: row.get(base + 5).map_err(row_err)?,
        closes_with: closes_with.as_deref().map(decode).transpose()?,
        created_at: parse_datetime(&created),
        actioned_at: parse_optional_datetime(&actioned),
        sent_at: parse_optional_datetime(&sent),
    })
}

// ── Connection-level queries (shared by plain calls and transactions) ──

async fn fetch_prospect_by_email(
    conn: &Connection,
    email: &str,
) -> Result<Option<Prospect>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {PROSPECT_COLUMNS} FROM prospects WHERE email = ?1 COLLATE NOCASE"),
            params![email],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fetch_prospect_by_email: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_prospect(&row, 0)?)),
        _ => Ok(None),
    }
}

async fn fetch_prospect(conn: &Connection, id: Uuid) -> Result<Option<Prospect>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {PROSPECT_COLUMNS} FROM prospects WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fetch_prospect: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_prospect(&row, 0)?)),
        _ => Ok(None),
    }
}

async fn fetch_conversation(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<Conversation>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fetch_conversation: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_conversation(&row, 0)?)),
        _ => Ok(None),
    }
}

async fn fetch_conversation_by_key(
    conn: &Connection,
    prospect_id: Uuid,
    subject: &str,
) -> Result<Option<Conversation>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE prospect_id = ?1 AND thread_subject = ?2"
            ),
            params![prospect_id.to_string(), subject],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fetch_conversation_by_key: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_conversation(&row, 0)?)),
        _ => Ok(None),
    }
}

async fn fetch_pending(conn: &Connection, id: Uuid) -> Result<Option<PendingResponse>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {PENDING_COLUMNS} FROM pending_responses WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fetch_pending: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_pending(&row, 0)?)),
        _ => Ok(None),
    }
}

async fn insert_message(
    conn: &Connection,
    conversation_id: Uuid,
    role: MessageRole,
    content: &str,
    at: DateTime<Utc>,
) -> Result<Message, DatabaseError> {
    let message = Message {
        id: Uuid::new_v4(),
        conversation_id,
        role,
        content: content.to_string(),
        created_at: at,
    };
    conn.execute(
        "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id.to_string(),
            conversation_id.to_string(),
            role.to_string(),
            content,
            fmt_ts(at)
        ],
    )
    .await
    .map_err(|e| write_err("insert_message", e))?;
    Ok(message)
}

/// Retire every draft on a conversation that has not gone out: open ones,
/// and approved ones whose send failed. A newer draft replaces them.
async fn supersede_open_drafts(
    conn: &Connection,
    conversation_id: Uuid,
    at: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    conn.execute(
        "UPDATE pending_responses SET status = 'rejected', actioned_at = COALESCE(actioned_at, ?1)
         WHERE conversation_id = ?2 AND sent_at IS NULL AND status IN ('pending', 'approved', 'edited')",
        params![fmt_ts(at), conversation_id.to_string()],
    )
    .await
    .map_err(|e| write_err("supersede_open_drafts", e))
}

async fn insert_draft(
    conn: &Connection,
    conversation_id: Uuid,
    draft: &NewDraft,
    at: DateTime<Utc>,
) -> Result<PendingResponse, DatabaseError> {
    let pending = PendingResponse {
        id: Uuid::new_v4(),
        conversation_id,
        llm_content: draft.content.clone(),
        edited_content: None,
        status: PendingStatus::Pending,
        provider: draft.provider.clone(),
        closes_with: draft.closes_with,
        created_at: at,
        actioned_at: None,
        sent_at: None,
    };
    conn.execute(
        "INSERT INTO pending_responses (id, conversation_id, llm_content, status, provider, closes_with, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
        params![
            pending.id.to_string(),
            conversation_id.to_string(),
            draft.content.as_str(),
            draft.provider.as_str(),
            opt_text(draft.closes_with.map(|o| o.as_str())),
            fmt_ts(at)
        ],
    )
    .await
    .map_err(|e| write_err("insert_draft", e))?;
    Ok(pending)
}

async fn fetch_prompt_versions(
    conn: &Connection,
    name: &str,
) -> Result<Vec<PromptVersion>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT v.prompt_name, v.version, v.content, v.notes, v.created_at,
                    CASE WHEN p.active_version = v.version THEN 1 ELSE 0 END
             FROM prompt_versions v JOIN prompts p ON p.name = v.prompt_name
             WHERE v.prompt_name = ?1 ORDER BY v.version ASC",
            params![name],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("list_versions: {e}")))?;

    let mut versions = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        let created: String = row.get(4).map_err(row_err)?;
        versions.push(PromptVersion {
            prompt_name: row.get(0).map_err(row_err)?,
            version: row.get(1).map_err(row_err)?,
            content: row.get(2).map_err(row_err)?,
            notes: row.get(3).ok(),
            is_active: row.get::<i64>(5).map_err(row_err)? == 1,
            created_at: parse_datetime(&created),
        });
    }
    Ok(versions)
}

// ── PromptStore ─────────────────────────────────────────────────────

#[async_trait]
impl PromptStore for LibSqlBackend {
    async fn get_active_content(&self, name: &str) -> Result<String, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT v.content FROM prompts p
                 JOIN prompt_versions v ON v.prompt_name = p.name AND v.version = p.active_version
                 WHERE p.name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_content: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row.get::<String>(0).map_err(row_err),
            _ => Err(DatabaseError::not_found("active prompt", name)),
        }
    }

    async fn create_version(
        &self,
        name: &str,
        content: &str,
        notes: Option<&str>,
    ) -> Result<PromptVersion, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_version begin: {e}")))?;

        tx.execute(
            "INSERT OR IGNORE INTO prompts (name, active_version, created_at) VALUES (?1, NULL, ?2)",
            params![name, fmt_ts(now)],
        )
        .await
        .map_err(|e| write_err("create_version prompt", e))?;

        let mut rows = tx
            .query(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_versions WHERE prompt_name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_version next: {e}")))?;
        let version: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(row_err)?,
            _ => 1,
        };
        drop(rows);

        tx.execute(
            "INSERT INTO prompt_versions (prompt_name, version, content, notes, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, version, content, opt_text(notes), fmt_ts(now)],
        )
        .await
        .map_err(|e| write_err("create_version insert", e))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_version commit: {e}")))?;

        debug!(prompt = name, version, "Prompt version created");
        Ok(PromptVersion {
            prompt_name: name.to_string(),
            version,
            content: content.to_string(),
            notes: notes.map(String::from),
            is_active: false,
            created_at: now,
        })
    }

    async fn activate_version(&self, name: &str, version: i64) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM prompt_versions WHERE prompt_name = ?1 AND version = ?2",
                params![name, version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("activate_version: {e}")))?;
        if !matches!(rows.next().await, Ok(Some(_))) {
            return Err(DatabaseError::not_found("prompt version", format!("{name} v{version}")));
        }

        self.conn()
            .execute(
                "UPDATE prompts SET active_version = ?1 WHERE name = ?2",
                params![version, name],
            )
            .await
            .map_err(|e| write_err("activate_version", e))?;
        info!(prompt = name, version, "Prompt version activated");
        Ok(())
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<PromptVersion>, DatabaseError> {
        fetch_prompt_versions(self.conn(), name).await
    }
}

// ── LeadStore ───────────────────────────────────────────────────────

#[async_trait]
impl LeadStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn load_system_config(&self) -> Result<SystemConfig, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT polling_interval_minutes, cold_lead_threshold_days, cold_lead_notifications_enabled,
                        max_message_exchanges, primary_provider, fallback_provider
                 FROM system_config WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_system_config: {e}")))?;

        if let Ok(Some(row)) = rows.next().await {
            let primary: String = row.get(4).map_err(row_err)?;
            let fallback: String = row.get(5).map_err(row_err)?;
            let config = SystemConfig {
                polling_interval_minutes: row.get::<i64>(0).map_err(row_err)? as u32,
                cold_lead_threshold_days: row.get::<i64>(1).map_err(row_err)? as u32,
                cold_lead_notifications_enabled: row.get::<i64>(2).map_err(row_err)? != 0,
                max_message_exchanges: row.get::<i64>(3).map_err(row_err)? as u32,
                primary_provider: primary
                    .parse()
                    .map_err(|e| DatabaseError::Serialization(format!("{e}")))?,
                fallback_provider: fallback
                    .parse()
                    .map_err(|e| DatabaseError::Serialization(format!("{e}")))?,
            };
            config
                .validate()
                .map_err(|e| DatabaseError::Constraint(e.to_string()))?;
            return Ok(config);
        }
        drop(rows);

        let config = SystemConfig::default();
        self.save_system_config(&config).await?;
        info!("Created default system config");
        Ok(config)
    }

    async fn save_system_config(&self, config: &SystemConfig) -> Result<(), DatabaseError> {
        config
            .validate()
            .map_err(|e| DatabaseError::Constraint(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO system_config (id, polling_interval_minutes, cold_lead_threshold_days,
                    cold_lead_notifications_enabled, max_message_exchanges, primary_provider,
                    fallback_provider, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    polling_interval_minutes = excluded.polling_interval_minutes,
                    cold_lead_threshold_days = excluded.cold_lead_threshold_days,
                    cold_lead_notifications_enabled = excluded.cold_lead_notifications_enabled,
                    max_message_exchanges = excluded.max_message_exchanges,
                    primary_provider = excluded.primary_provider,
                    fallback_provider = excluded.fallback_provider,
                    updated_at = excluded.updated_at",
                params![
                    i64::from(config.polling_interval_minutes),
                    i64::from(config.cold_lead_threshold_days),
                    i64::from(config.cold_lead_notifications_enabled),
                    i64::from(config.max_message_exchanges),
                    config.primary_provider.to_string(),
                    config.fallback_provider.to_string(),
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| write_err("save_system_config", e))?;
        Ok(())
    }

    async fn get_prospect(&self, id: Uuid) -> Result<Option<Prospect>, DatabaseError> {
        fetch_prospect(self.conn(), id).await
    }

    async fn find_prospect_by_email(&self, email: &str) -> Result<Option<Prospect>, DatabaseError> {
        fetch_prospect_by_email(self.conn(), email).await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        fetch_conversation(self.conn(), id).await
    }

    async fn find_conversation(
        &self,
        prospect_id: Uuid,
        thread_subject: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        fetch_conversation_by_key(self.conn(), prospect_id, thread_subject).await
    }

    async fn list_threads(
        &self,
        statuses: &[ConversationStatus],
    ) -> Result<Vec<(Prospect, Conversation)>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let status_list = statuses
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ");

        let prospect_cols = PROSPECT_COLUMNS
            .split(", ")
            .map(|c| format!("p.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let conversation_cols = CONVERSATION_COLUMNS
            .split(", ")
            .map(|c| format!("c.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {prospect_cols}, {conversation_cols}
                     FROM conversations c JOIN prospects p ON p.id = c.prospect_id
                     WHERE c.status IN ({status_list})
                     ORDER BY c.last_message_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_threads: {e}")))?;

        let mut threads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            threads.push((row_to_prospect(&row, 0)?, row_to_conversation(&row, 6)?));
        }
        Ok(threads)
    }

    async fn load_thread(&self, conversation_id: Uuid) -> Result<ConversationThread, DatabaseError> {
        let conversation = fetch_conversation(self.conn(), conversation_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("conversation", conversation_id))?;
        let prospect = fetch_prospect(self.conn(), conversation.prospect_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("prospect", conversation.prospect_id))?;
        let messages = self.list_messages(conversation_id).await?;
        Ok(ConversationThread {
            prospect,
            conversation,
            messages,
        })
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        if fetch_conversation(self.conn(), conversation_id).await?.is_none() {
            return Err(DatabaseError::not_found("conversation", conversation_id));
        }
        let message = insert_message(self.conn(), conversation_id, role, content, at).await?;
        self.conn()
            .execute(
                "UPDATE conversations SET last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(at), conversation_id.to_string()],
            )
            .await
            .map_err(|e| write_err("append_message touch", e))?;
        Ok(message)
    }

    async fn last_message_role(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<MessageRole>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_message_role: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let role: String = row.get(0).map_err(row_err)?;
                Ok(Some(decode(&role)?))
            }
            _ => Ok(None),
        }
    }

    async fn list_stale_active(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE status = 'active' AND last_message_at < ?1 ORDER BY last_message_at ASC"
                ),
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stale_active: {e}")))?;

        let mut conversations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            conversations.push(row_to_conversation(&row, 0)?);
        }
        Ok(conversations)
    }

    async fn mark_cold(&self, conversation_id: Uuid, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE conversations SET status = 'cold', updated_at = ?1 WHERE id = ?2 AND status = 'active'",
                params![fmt_ts(at), conversation_id.to_string()],
            )
            .await
            .map_err(|e| write_err("mark_cold", e))?;
        Ok(changed > 0)
    }

    async fn get_pending(&self, id: Uuid) -> Result<Option<PendingResponse>, DatabaseError> {
        fetch_pending(self.conn(), id).await
    }

    async fn open_pending_for(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<PendingResponse>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_responses WHERE conversation_id = ?1 AND status = 'pending' ORDER BY created_at DESC LIMIT 1"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_pending_for: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_pending(&row, 0)?)),
            _ => Ok(None),
        }
    }

    async fn list_open_pending(&self) -> Result<Vec<PendingReview>, DatabaseError> {
        let pending_cols = PENDING_COLUMNS
            .split(", ")
            .map(|c| format!("r.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {pending_cols}, p.email, p.first_name, c.thread_subject, c.outcome
                     FROM pending_responses r
                     JOIN conversations c ON c.id = r.conversation_id
                     JOIN prospects p ON p.id = c.prospect_id
                     WHERE r.status = 'pending'
                     ORDER BY r.created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_open_pending: {e}")))?;

        let mut reviews = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let outcome: Option<String> = row.get(13).ok();
            reviews.push(PendingReview {
                pending: row_to_pending(&row, 0)?,
                prospect_email: row.get(10).map_err(row_err)?,
                prospect_name: row.get(11).map_err(row_err)?,
                thread_subject: row.get(12).map_err(row_err)?,
                outcome: outcome.as_deref().map(decode).transpose()?,
            });
        }
        Ok(reviews)
    }

    async fn action_pending(
        &self,
        id: Uuid,
        status: PendingStatus,
        edited_content: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE pending_responses SET status = ?1, edited_content = COALESCE(?2, edited_content), actioned_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![
                    status.to_string(),
                    opt_text(edited_content),
                    fmt_ts(at),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| write_err("action_pending", e))?;
        debug!(pending_id = %id, status = %status, changed, "Draft actioned");
        Ok(changed > 0)
    }

    async fn record_sent(&self, pending_id: Uuid, at: DateTime<Utc>) -> Result<Message, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_sent begin: {e}")))?;

        let pending = fetch_pending(&tx, pending_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("pending response", pending_id))?;
        if !matches!(pending.status, PendingStatus::Approved | PendingStatus::Edited) {
            return Err(DatabaseError::Constraint(format!(
                "pending response {pending_id} is {} and cannot be sent",
                pending.status
            )));
        }
        if pending.sent_at.is_some() {
            return Err(DatabaseError::Constraint(format!(
                "pending response {pending_id} was already sent"
            )));
        }

        tx.execute(
            "UPDATE pending_responses SET sent_at = ?1 WHERE id = ?2",
            params![fmt_ts(at), pending_id.to_string()],
        )
        .await
        .map_err(|e| write_err("record_sent stamp", e))?;

        let message = insert_message(
            &tx,
            pending.conversation_id,
            MessageRole::Sent,
            pending.final_content(),
            at,
        )
        .await?;

        let close = pending.closes_with.is_some();
        let status = if close { "complete" } else { "active" };
        tx.execute(
            "UPDATE conversations SET last_message_at = ?1, updated_at = ?1,
                status = CASE WHEN ?2 = 'complete' THEN 'complete' ELSE status END
             WHERE id = ?3",
            params![fmt_ts(at), status, pending.conversation_id.to_string()],
        )
        .await
        .map_err(|e| write_err("record_sent conversation", e))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_sent commit: {e}")))?;

        debug!(pending_id = %pending_id, conversation_id = %pending.conversation_id, close, "Sent message recorded");
        Ok(message)
    }

    async fn commit_new_lead(&self, commit: LeadCommit) -> Result<LeadCommitResult, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = fmt_ts(commit.at);
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_new_lead begin: {e}")))?;

        // Prospect: insert or refresh contact fields.
        let prospect_id = match fetch_prospect_by_email(&tx, &commit.email).await? {
            Some(existing) => {
                tx.execute(
                    "UPDATE prospects SET first_name = ?1, phone = COALESCE(?2, phone), updated_at = ?3 WHERE id = ?4",
                    params![
                        commit.first_name.as_str(),
                        opt_text(commit.phone.as_deref()),
                        now.as_str(),
                        existing.id.to_string()
                    ],
                )
                .await
                .map_err(|e| write_err("commit_new_lead refresh prospect", e))?;
                existing.id
            }
            None => {
                let id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO prospects (id, email, first_name, phone, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        id.to_string(),
                        commit.email.as_str(),
                        commit.first_name.as_str(),
                        opt_text(commit.phone.as_deref()),
                        now.as_str()
                    ],
                )
                .await
                .map_err(|e| write_err("commit_new_lead insert prospect", e))?;
                id
            }
        };

        // Conversation: create, reopen, or reuse.
        let (conversation_id, created, reopened) =
            match fetch_conversation_by_key(&tx, prospect_id, &commit.thread_subject).await? {
                Some(existing) if existing.status.is_closed() => {
                    tx.execute(
                        "UPDATE conversations SET status = 'active', outcome = NULL, last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
                        params![now.as_str(), existing.id.to_string()],
                    )
                    .await
                    .map_err(|e| write_err("commit_new_lead reopen", e))?;
                    (existing.id, false, true)
                }
                Some(existing) => (existing.id, false, false),
                None => {
                    let id = Uuid::new_v4();
                    tx.execute(
                        "INSERT INTO conversations (id, prospect_id, thread_subject, status, created_at, last_message_at, updated_at)
                         VALUES (?1, ?2, ?3, 'active', ?4, ?4, ?4)",
                        params![
                            id.to_string(),
                            prospect_id.to_string(),
                            commit.thread_subject.as_str(),
                            now.as_str()
                        ],
                    )
                    .await
                    .map_err(|e| write_err("commit_new_lead insert conversation", e))?;
                    (id, true, false)
                }
            };

        supersede_open_drafts(&tx, conversation_id, commit.at).await?;
        let pending = insert_draft(&tx, conversation_id, &commit.opening, commit.at).await?;

        let prospect = fetch_prospect(&tx, prospect_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("prospect", prospect_id))?;
        let conversation = fetch_conversation(&tx, conversation_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("conversation", conversation_id))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_new_lead commit: {e}")))?;

        Ok(LeadCommitResult {
            prospect,
            conversation,
            pending,
            created,
            reopened,
        })
    }

    async fn commit_turn(&self, commit: TurnCommit) -> Result<TurnCommitResult, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = fmt_ts(commit.at);
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_turn begin: {e}")))?;

        let existing = fetch_conversation(&tx, commit.conversation_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("conversation", commit.conversation_id))?;
        let reopened = existing.status.is_closed();
        // A decided outcome sticks while the thread stays active; a reply
        // that reopens a closed thread starts it over.
        let outcome = if reopened {
            commit.outcome
        } else {
            commit.outcome.or(existing.outcome)
        };

        insert_message(
            &tx,
            commit.conversation_id,
            MessageRole::Prospect,
            &commit.inbound,
            commit.at,
        )
        .await?;

        let intent_json = match &commit.intent {
            Some(intent) => Some(
                serde_json::to_string(intent)
                    .map_err(|e| DatabaseError::Serialization(format!("intent: {e}")))?,
            ),
            None => None,
        };

        tx.execute(
            "UPDATE conversations SET status = 'active', outcome = ?1, intent = COALESCE(?2, intent),
                lead_score = COALESCE(?3, lead_score), last_message_at = ?4, updated_at = ?4
             WHERE id = ?5",
            params![
                opt_text(outcome.map(|o| o.as_str())),
                opt_text(intent_json.as_deref()),
                opt_real(commit.lead_score),
                now.as_str(),
                commit.conversation_id.to_string()
            ],
        )
        .await
        .map_err(|e| write_err("commit_turn update", e))?;

        let (pending, superseded) = match &commit.draft {
            Some(draft) => {
                let superseded = supersede_open_drafts(&tx, commit.conversation_id, commit.at).await?;
                let pending = insert_draft(&tx, commit.conversation_id, draft, commit.at).await?;
                (Some(pending), superseded)
            }
            None => (None, 0),
        };

        let conversation = fetch_conversation(&tx, commit.conversation_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("conversation", commit.conversation_id))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_turn commit: {e}")))?;

        Ok(TurnCommitResult {
            conversation,
            pending,
            reopened,
            superseded,
        })
    }
}
