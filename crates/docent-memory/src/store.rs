use crate::history::{Conversation, ConversationHistory, ConversationMessage};
use crate::migrations::run_migrations;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use docent_schema::MessageRole;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio::task;
use uuid::Uuid;

/// SQLite-backed conversation history.
#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// The latest `limit` messages of a conversation, oldest first.
    pub async fn messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, conversation_id, role, content, metadata, ts
                FROM conversation_messages
                WHERE conversation_id = ?1
                ORDER BY ts DESC, rowid DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_message)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out.reverse();
            Ok::<Vec<ConversationMessage>, anyhow::Error>(out)
        })
        .await?
    }
}

#[async_trait]
impl ConversationHistory for ConversationStore {
    async fn add_message(
        &self,
        conversation_id: &str,
        content: &str,
        role: MessageRole,
        metadata: Option<Value>,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_string();
        let content = content.to_string();
        task::spawn_blocking(move || {
            let now = timestamp_sql(Utc::now());
            let metadata = metadata.map(|m| serde_json::to_string(&m)).transpose()?;
            let mut conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO conversations (id, metadata, created_at, updated_at)
                VALUES (?1, '{}', ?2, ?2)
                ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
                "#,
                params![conversation_id, now],
            )?;
            tx.execute(
                r#"
                INSERT INTO conversation_messages (id, conversation_id, role, content, metadata, ts)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id,
                    role.as_str(),
                    content,
                    metadata,
                    now
                ],
            )?;
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    async fn update_conversation_metadata(
        &self,
        conversation_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let now = timestamp_sql(Utc::now());
            let mut conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;

            let mut merged = match existing {
                Some(raw) => parse_metadata(&raw),
                None => Map::new(),
            };
            merged.extend(metadata);
            let merged = serde_json::to_string(&merged)?;

            tx.execute(
                r#"
                INSERT INTO conversations (id, metadata, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(id) DO UPDATE SET
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
                params![conversation_id, merged, now],
            )?;
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let conversation = conn
                .query_row(
                    "SELECT id, metadata, created_at, updated_at FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    row_to_conversation,
                )
                .optional()?;
            Ok::<Option<Conversation>, anyhow::Error>(conversation)
        })
        .await?
    }

    async fn list_conversations(&self, limit: usize) -> Result<Option<Vec<Conversation>>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, metadata, created_at, updated_at
                FROM conversations
                ORDER BY updated_at DESC, rowid DESC
                LIMIT ?1
                "#,
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_conversation)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok::<Option<Vec<Conversation>>, anyhow::Error>(Some(out))
        })
        .await?
    }
}

fn timestamp_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_metadata(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!("discarding non-object conversation metadata");
            Map::new()
        }
    }
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid_sql(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let metadata_raw: String = row.get(1)?;
    let created_raw: String = row.get(2)?;
    let updated_raw: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        metadata: parse_metadata(&metadata_raw),
        created_at: parse_datetime_sql(&created_raw)?,
        updated_at: parse_datetime_sql(&updated_raw)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ConversationMessage> {
    let id_raw: String = row.get(0)?;
    let role_raw: String = row.get(2)?;
    let metadata_raw: Option<String> = row.get(4)?;
    let ts_raw: String = row.get(5)?;
    Ok(ConversationMessage {
        id: parse_uuid_sql(&id_raw)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&role_raw).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        timestamp: parse_datetime_sql(&ts_raw)?,
    })
}
