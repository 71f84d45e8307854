use crate::migrations::run_migrations;
use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use docent_schema::{
    FeedbackContentUpdate, FeedbackRecord, FeedbackType, PENDING_REACTION, PENDING_USER_ID,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};
use tokio::task;

const RECORD_COLUMNS: &str = "message_id, channel_id, user_id, feedback_type, reaction, \
     question, answer, skill_used, function_used, conversation_id, ts";

/// Result of writing message content into the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOutcome {
    /// Existing records for the message were patched.
    Patched(usize),
    /// No record existed for the channel, so the message's pending
    /// placeholder now holds the content. A placeholder left by an earlier
    /// update, from any channel, is reused.
    PendingCreated,
}

/// Primary feedback store. One row per `(message_id, user_id, reaction)`,
/// enforced by a unique index and written with upserts.
#[derive(Clone)]
pub struct FeedbackStore {
    db: Arc<Mutex<Connection>>,
}

impl FeedbackStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store one feedback event and return the row as persisted.
    ///
    /// Within a single transaction: a pending placeholder for the message is
    /// merged into the record and deleted, then the record is upserted on its
    /// `(message_id, user_id, reaction)` key. Content fields already on the
    /// row are kept when the incoming record leaves them empty.
    pub async fn store(&self, record: FeedbackRecord) -> Result<FeedbackRecord> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let mut record = record;
            let mut conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.transaction()?;

            if !record.is_pending() {
                let pending = tx
                    .query_row(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM feedback \
                             WHERE message_id = ?1 AND user_id = ?2 AND reaction = ?3"
                        ),
                        params![record.message_id, PENDING_USER_ID, PENDING_REACTION],
                        row_to_record,
                    )
                    .optional()?;
                if let Some(pending) = pending {
                    record.fill_content_from(&pending);
                    if record.channel_id.is_empty() {
                        record.channel_id = pending.channel_id.clone();
                    }
                    tx.execute(
                        "DELETE FROM feedback WHERE message_id = ?1 AND user_id = ?2 AND reaction = ?3",
                        params![record.message_id, PENDING_USER_ID, PENDING_REACTION],
                    )?;
                    tracing::debug!(message_id = %record.message_id, "merged pending feedback content");
                }
            }

            tx.execute(
                r#"
                INSERT INTO feedback (
                    message_id, channel_id, user_id, feedback_type, reaction,
                    question, answer, skill_used, function_used, conversation_id, ts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(message_id, user_id, reaction) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    feedback_type = excluded.feedback_type,
                    ts = excluded.ts,
                    question = COALESCE(excluded.question, feedback.question),
                    answer = COALESCE(excluded.answer, feedback.answer),
                    skill_used = COALESCE(excluded.skill_used, feedback.skill_used),
                    function_used = COALESCE(excluded.function_used, feedback.function_used),
                    conversation_id = COALESCE(excluded.conversation_id, feedback.conversation_id)
                "#,
                params![
                    record.message_id,
                    record.channel_id,
                    record.user_id,
                    record.feedback_type.as_str(),
                    record.reaction,
                    record.question,
                    record.answer,
                    record.skill_used,
                    record.function_used,
                    record.conversation_id,
                    timestamp_sql(record.timestamp),
                ],
            )?;

            let stored = tx.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM feedback \
                     WHERE message_id = ?1 AND user_id = ?2 AND reaction = ?3"
                ),
                params![record.message_id, record.user_id, record.reaction],
                row_to_record,
            )?;
            tx.commit()?;
            Ok::<FeedbackRecord, anyhow::Error>(stored)
        })
        .await?
    }

    /// Patch content on every record for `(message_id, channel_id)`, or
    /// create the pending placeholder when there is none yet.
    pub async fn apply_content(&self, update: FeedbackContentUpdate) -> Result<ContentOutcome> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.transaction()?;

            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM feedback WHERE message_id = ?1 AND channel_id = ?2",
                params![update.message_id, update.channel_id],
                |row| row.get(0),
            )?;

            let outcome = if existing == 0 {
                tx.execute(
                    r#"
                    INSERT INTO feedback (
                        message_id, channel_id, user_id, feedback_type, reaction,
                        question, answer, skill_used, function_used, conversation_id, ts
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    ON CONFLICT(message_id, user_id, reaction) DO UPDATE SET
                        question = COALESCE(excluded.question, feedback.question),
                        answer = COALESCE(excluded.answer, feedback.answer),
                        skill_used = COALESCE(excluded.skill_used, feedback.skill_used),
                        function_used = COALESCE(excluded.function_used, feedback.function_used),
                        conversation_id = COALESCE(excluded.conversation_id, feedback.conversation_id)
                    "#,
                    params![
                        update.message_id,
                        update.channel_id,
                        PENDING_USER_ID,
                        FeedbackType::Neutral.as_str(),
                        PENDING_REACTION,
                        update.question,
                        update.answer,
                        update.skill_used,
                        update.function_used,
                        update.conversation_id,
                        timestamp_sql(Utc::now()),
                    ],
                )?;
                ContentOutcome::PendingCreated
            } else {
                let patched = tx.execute(
                    r#"
                    UPDATE feedback SET
                        question = COALESCE(?3, question),
                        answer = COALESCE(?4, answer),
                        skill_used = COALESCE(?5, skill_used),
                        function_used = COALESCE(?6, function_used),
                        conversation_id = COALESCE(?7, conversation_id)
                    WHERE message_id = ?1 AND channel_id = ?2
                    "#,
                    params![
                        update.message_id,
                        update.channel_id,
                        update.question,
                        update.answer,
                        update.skill_used,
                        update.function_used,
                        update.conversation_id,
                    ],
                )?;
                ContentOutcome::Patched(patched)
            };
            tx.commit()?;
            Ok::<ContentOutcome, anyhow::Error>(outcome)
        })
        .await?
    }

    pub async fn find(
        &self,
        message_id: &str,
        user_id: &str,
        reaction: &str,
    ) -> Result<Option<FeedbackRecord>> {
        let db = Arc::clone(&self.db);
        let (message_id, user_id, reaction) =
            (message_id.to_string(), user_id.to_string(), reaction.to_string());
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM feedback \
                         WHERE message_id = ?1 AND user_id = ?2 AND reaction = ?3"
                    ),
                    params![message_id, user_id, reaction],
                    row_to_record,
                )
                .optional()?;
            Ok::<Option<FeedbackRecord>, anyhow::Error>(record)
        })
        .await?
    }

    pub async fn pending(&self, message_id: &str) -> Result<Option<FeedbackRecord>> {
        self.find(message_id, PENDING_USER_ID, PENDING_REACTION).await
    }

    /// Real feedback (placeholders excluded) at or after `since`, newest first.
    pub async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<FeedbackRecord>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM feedback \
                 WHERE ts >= ?1 AND NOT (user_id = ?2 AND reaction = ?3) \
                 ORDER BY ts DESC, id DESC"
            ))?;
            let rows = stmt.query_map(
                params![timestamp_sql(since), PENDING_USER_ID, PENDING_REACTION],
                row_to_record,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok::<Vec<FeedbackRecord>, anyhow::Error>(out)
        })
        .await?
    }

    /// Total rows, placeholders included.
    pub async fn count(&self) -> Result<usize> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))?;
            Ok::<usize, anyhow::Error>(n as usize)
        })
        .await?
    }
}

fn timestamp_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FeedbackRecord> {
    let type_raw: String = row.get(3)?;
    let ts_raw: String = row.get(10)?;
    Ok(FeedbackRecord {
        message_id: row.get(0)?,
        channel_id: row.get(1)?,
        user_id: row.get(2)?,
        feedback_type: FeedbackType::parse(&type_raw).unwrap_or(FeedbackType::Neutral),
        reaction: row.get(4)?,
        question: row.get(5)?,
        answer: row.get(6)?,
        skill_used: row.get(7)?,
        function_used: row.get(8)?,
        conversation_id: row.get(9)?,
        timestamp: parse_datetime_sql(&ts_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn thumbs(message_id: &str, user: &str) -> FeedbackRecord {
        FeedbackRecord::new(message_id, "C1", user, FeedbackType::Positive, "thumbsup")
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_triple() {
        let store = FeedbackStore::open_in_memory().unwrap();
        let t0 = Utc::now() - TimeDelta::minutes(5);
        let t1 = Utc::now();

        store.store(thumbs("M1", "U1").with_timestamp(t0)).await.unwrap();
        let mut second = thumbs("M1", "U1").with_timestamp(t1);
        second.feedback_type = FeedbackType::Removed;
        let stored = store.store(second).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(stored.feedback_type, FeedbackType::Removed);
        assert_eq!(
            timestamp_sql(stored.timestamp),
            timestamp_sql(t1)
        );
    }

    #[tokio::test]
    async fn upsert_keeps_content_when_not_resupplied() {
        let store = FeedbackStore::open_in_memory().unwrap();
        let mut first = thumbs("M1", "U1");
        first.question = Some("how do I deploy?".into());
        store.store(first).await.unwrap();

        let stored = store.store(thumbs("M1", "U1")).await.unwrap();
        assert_eq!(stored.question.as_deref(), Some("how do I deploy?"));
    }

    #[tokio::test]
    async fn content_without_records_creates_pending() {
        let store = FeedbackStore::open_in_memory().unwrap();
        let outcome = store
            .apply_content(FeedbackContentUpdate {
                message_id: "M1".into(),
                channel_id: "C1".into(),
                answer: Some("use the deploy button".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome, ContentOutcome::PendingCreated);

        let pending = store.pending("M1").await.unwrap().unwrap();
        assert!(pending.is_pending());
        assert_eq!(pending.feedback_type, FeedbackType::Neutral);
        assert_eq!(pending.answer.as_deref(), Some("use the deploy button"));
    }

    #[tokio::test]
    async fn pending_placeholder_is_shared_across_channels() {
        let store = FeedbackStore::open_in_memory().unwrap();
        store
            .apply_content(FeedbackContentUpdate {
                message_id: "M1".into(),
                channel_id: "C1".into(),
                question: Some("q".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let outcome = store
            .apply_content(FeedbackContentUpdate {
                message_id: "M1".into(),
                channel_id: "C2".into(),
                answer: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome, ContentOutcome::PendingCreated);
        assert_eq!(store.count().await.unwrap(), 1);

        let pending = store.pending("M1").await.unwrap().unwrap();
        assert_eq!(pending.channel_id, "C1");
        assert_eq!(pending.question.as_deref(), Some("q"));
        assert_eq!(pending.answer.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn content_patches_all_matching_records() {
        let store = FeedbackStore::open_in_memory().unwrap();
        store.store(thumbs("M1", "U1")).await.unwrap();
        store.store(thumbs("M1", "U2")).await.unwrap();
        store.store(thumbs("M2", "U1")).await.unwrap();

        let outcome = store
            .apply_content(FeedbackContentUpdate {
                message_id: "M1".into(),
                channel_id: "C1".into(),
                skill_used: Some("docs".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome, ContentOutcome::Patched(2));
        let other = store.find("M2", "U1", "thumbsup").await.unwrap().unwrap();
        assert!(other.skill_used.is_none());
    }

    #[tokio::test]
    async fn list_since_excludes_old_and_pending() {
        let store = FeedbackStore::open_in_memory().unwrap();
        store
            .store(thumbs("old", "U1").with_timestamp(Utc::now() - TimeDelta::days(40)))
            .await
            .unwrap();
        store.store(thumbs("new", "U1")).await.unwrap();
        store
            .apply_content(FeedbackContentUpdate {
                message_id: "later".into(),
                channel_id: "C1".into(),
                question: Some("q".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let recent = store
            .list_since(Utc::now() - TimeDelta::days(30))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message_id, "new");
    }

    #[tokio::test]
    async fn persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.db");
        let path = path.to_str().unwrap();
        FeedbackStore::open(path)
            .unwrap()
            .store(thumbs("M1", "U1"))
            .await
            .unwrap();
        let reopened = FeedbackStore::open(path).unwrap();
        assert!(reopened.find("M1", "U1", "thumbsup").await.unwrap().is_some());
    }
}
