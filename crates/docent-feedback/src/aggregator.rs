use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use docent_memory::{Conversation, ConversationHistory};
use docent_schema::{FeedbackContentUpdate, FeedbackRecord, FeedbackType, ReactionEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::export::{self, ExportError, ExportFormat};
use crate::reaction::feedback_type_for;
use crate::store::{ContentOutcome, FeedbackStore};

/// Metadata keys holding mirrored feedback are `feedback_{message_id}`.
pub const MIRROR_KEY_PREFIX: &str = "feedback_";
/// Default upper bound on conversations scanned for mirrored feedback.
pub const MIRROR_SCAN_LIMIT: usize = 1000;
pub const UNKNOWN_SKILL: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    Database,
    ConversationMetadata,
}

impl FeedbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::ConversationMetadata => "conversation_metadata",
        }
    }
}

/// A feedback record tagged with the store it was read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcedFeedback {
    #[serde(flatten)]
    pub record: FeedbackRecord,
    pub source: FeedbackSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredFeedback {
    pub record: FeedbackRecord,
    /// Written to the primary store.
    pub persisted: bool,
    /// Written to the conversation-metadata mirror.
    pub mirrored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackStats {
    pub days: u32,
    pub total_feedback: usize,
    pub positive_count: usize,
    pub negative_count: usize,
    pub positive_percentage: f64,
    pub counts_by_type: BTreeMap<String, usize>,
    pub sources: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillFeedback {
    pub skill: String,
    pub total: usize,
    pub positive: usize,
    pub negative: usize,
    pub positive_percentage: f64,
    pub sources: BTreeMap<String, usize>,
}

/// Merges feedback from the primary store and the feedback entries mirrored
/// into conversation metadata.
///
/// Records present in both places are counted once per source.
#[derive(Clone)]
pub struct FeedbackAggregator {
    store: FeedbackStore,
    mirror: Option<Arc<dyn ConversationHistory>>,
    mirror_scan_limit: usize,
}

impl FeedbackAggregator {
    pub fn new(store: FeedbackStore) -> Self {
        Self {
            store,
            mirror: None,
            mirror_scan_limit: MIRROR_SCAN_LIMIT,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ConversationHistory>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Most recently updated conversations scanned per query.
    pub fn with_mirror_scan_limit(mut self, limit: usize) -> Self {
        self.mirror_scan_limit = limit;
        self
    }

    pub fn store(&self) -> &FeedbackStore {
        &self.store
    }

    /// Persist one feedback event. Storage failures are logged and reported
    /// through the `persisted`/`mirrored` flags.
    pub async fn store_feedback(&self, record: FeedbackRecord) -> StoredFeedback {
        let (record, persisted) = match self.store.store(record.clone()).await {
            Ok(stored) => (stored, true),
            Err(e) => {
                tracing::warn!(message_id = %record.message_id, "failed to store feedback: {e}");
                (record, false)
            }
        };

        let mirrored = match record.conversation_id.as_deref() {
            Some(conversation_id) => {
                let mut blob = Map::new();
                blob.insert("type".into(), record.feedback_type.as_str().into());
                blob.insert("reaction".into(), record.reaction.clone().into());
                blob.insert("timestamp".into(), record.timestamp.to_rfc3339().into());
                blob.insert("user_id".into(), record.user_id.clone().into());
                blob.insert("channel_id".into(), record.channel_id.clone().into());
                insert_content(
                    &mut blob,
                    &record.question,
                    &record.answer,
                    &record.skill_used,
                    &record.function_used,
                );
                self.mirror_merge(conversation_id, &record.message_id, blob)
                    .await
            }
            None => false,
        };

        StoredFeedback {
            record,
            persisted,
            mirrored,
        }
    }

    /// Attach message content to feedback, before or after reactions arrive.
    /// Returns whether either store accepted the update.
    pub async fn update_feedback_content(&self, update: FeedbackContentUpdate) -> bool {
        if update.message_id.is_empty() || update.channel_id.is_empty() {
            tracing::warn!("feedback content update without message_id or channel_id");
            return false;
        }

        let primary = match self.store.apply_content(update.clone()).await {
            Ok(ContentOutcome::PendingCreated) => {
                tracing::debug!(message_id = %update.message_id, "created pending feedback");
                true
            }
            Ok(ContentOutcome::Patched(n)) => {
                tracing::debug!(message_id = %update.message_id, records = n, "patched feedback content");
                true
            }
            Err(e) => {
                tracing::warn!(message_id = %update.message_id, "failed to update feedback content: {e}");
                false
            }
        };

        let mirrored = match update.conversation_id.as_deref() {
            Some(conversation_id) => {
                let mut blob = Map::new();
                insert_content(
                    &mut blob,
                    &update.question,
                    &update.answer,
                    &update.skill_used,
                    &update.function_used,
                );
                self.mirror_merge(conversation_id, &update.message_id, blob)
                    .await
            }
            None => false,
        };

        primary || mirrored
    }

    /// Map a reaction event to feedback and store it. Returns `None` for
    /// events that are not feedback.
    pub async fn handle_reaction(&self, event: &ReactionEvent) -> Option<StoredFeedback> {
        if !event.is_message_item() {
            tracing::debug!(item_type = %event.item.item_type, "ignoring reaction on non-message item");
            return None;
        }
        let Some(feedback_type) = feedback_type_for(event.event_type, &event.reaction) else {
            tracing::debug!(reaction = %event.reaction, "ignoring non-feedback reaction");
            return None;
        };

        let record = FeedbackRecord::new(
            event.item.ts.clone(),
            event.item.channel.clone(),
            event.user.clone(),
            feedback_type,
            event.reaction.clone(),
        );
        Some(self.store_feedback(record).await)
    }

    pub async fn get_feedback_stats(&self, days: u32) -> FeedbackStats {
        let records = self.collect(days).await;

        let mut counts_by_type: BTreeMap<String, usize> = [
            FeedbackType::Positive,
            FeedbackType::Negative,
            FeedbackType::Neutral,
            FeedbackType::Removed,
        ]
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();
        let mut sources: BTreeMap<String, usize> = [
            FeedbackSource::Database,
            FeedbackSource::ConversationMetadata,
        ]
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

        for entry in &records {
            *counts_by_type
                .entry(entry.record.feedback_type.as_str().to_string())
                .or_default() += 1;
            *sources.entry(entry.source.as_str().to_string()).or_default() += 1;
        }

        let positive_count = counts_by_type
            .get(FeedbackType::Positive.as_str())
            .copied()
            .unwrap_or_default();
        let negative_count = counts_by_type
            .get(FeedbackType::Negative.as_str())
            .copied()
            .unwrap_or_default();

        FeedbackStats {
            days,
            total_feedback: records.len(),
            positive_count,
            negative_count,
            positive_percentage: percentage(positive_count, records.len()),
            counts_by_type,
            sources,
        }
    }

    /// Per-skill breakdown, largest `total` first.
    pub async fn get_feedback_by_skill(&self, days: u32) -> Vec<SkillFeedback> {
        let mut by_skill: BTreeMap<String, SkillFeedback> = BTreeMap::new();
        for entry in self.collect(days).await {
            let skill = entry
                .record
                .skill_used
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN_SKILL.to_string());
            let summary = by_skill
                .entry(skill.clone())
                .or_insert_with(|| SkillFeedback {
                    skill,
                    total: 0,
                    positive: 0,
                    negative: 0,
                    positive_percentage: 0.0,
                    sources: BTreeMap::new(),
                });
            summary.total += 1;
            match entry.record.feedback_type {
                FeedbackType::Positive => summary.positive += 1,
                FeedbackType::Negative => summary.negative += 1,
                FeedbackType::Neutral | FeedbackType::Removed => {}
            }
            *summary
                .sources
                .entry(entry.source.as_str().to_string())
                .or_default() += 1;
        }

        let mut skills: Vec<SkillFeedback> = by_skill
            .into_values()
            .map(|mut s| {
                s.positive_percentage = percentage(s.positive, s.total);
                s
            })
            .collect();
        skills.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.skill.cmp(&b.skill)));
        skills
    }

    /// Merged records from both sources, newest first.
    pub async fn get_feedback_data(&self, days: u32) -> Vec<SourcedFeedback> {
        let mut records = self.collect(days).await;
        records.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));
        records
    }

    pub async fn export_feedback_data(
        &self,
        days: u32,
        format: &str,
    ) -> Result<String, ExportError> {
        let format = ExportFormat::parse(format)?;
        let records = self.get_feedback_data(days).await;
        export::render(&records, format)
    }

    async fn collect(&self, days: u32) -> Vec<SourcedFeedback> {
        let cutoff = window_start(Utc::now(), days);

        let mut records: Vec<SourcedFeedback> = match self.store.list_since(cutoff).await {
            Ok(rows) => rows
                .into_iter()
                .map(|record| SourcedFeedback {
                    record,
                    source: FeedbackSource::Database,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("failed to read feedback store: {e}");
                Vec::new()
            }
        };

        records.extend(
            self.mirrored_since(cutoff)
                .await
                .into_iter()
                .map(|record| SourcedFeedback {
                    record,
                    source: FeedbackSource::ConversationMetadata,
                }),
        );
        records
    }

    async fn mirrored_since(&self, cutoff: DateTime<Utc>) -> Vec<FeedbackRecord> {
        let Some(mirror) = &self.mirror else {
            return Vec::new();
        };
        let conversations = match mirror.list_conversations(self.mirror_scan_limit).await {
            Ok(Some(conversations)) => {
                if conversations.len() >= self.mirror_scan_limit {
                    tracing::warn!(
                        limit = self.mirror_scan_limit,
                        "conversation scan hit its limit, older mirrored feedback is not counted"
                    );
                }
                conversations
            }
            Ok(None) => {
                tracing::debug!("conversation store cannot list conversations");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!("failed to scan conversation metadata: {e}");
                return Vec::new();
            }
        };

        conversations
            .iter()
            .flat_map(mirrored_records)
            .filter(|record| record.timestamp >= cutoff)
            .collect()
    }

    /// Merge `fields` into the mirrored blob for `message_id`.
    async fn mirror_merge(
        &self,
        conversation_id: &str,
        message_id: &str,
        fields: Map<String, Value>,
    ) -> bool {
        let Some(mirror) = &self.mirror else {
            return false;
        };
        let key = format!("{MIRROR_KEY_PREFIX}{message_id}");

        let mut blob = match mirror.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => match conversation.metadata.get(&key) {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            },
            Ok(None) => Map::new(),
            Err(e) => {
                tracing::warn!(conversation_id, "failed to read conversation metadata: {e}");
                Map::new()
            }
        };
        blob.extend(fields);

        let mut update = Map::new();
        update.insert(key, Value::Object(blob));
        match mirror
            .update_conversation_metadata(conversation_id, update)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(conversation_id, "failed to mirror feedback: {e}");
                false
            }
        }
    }
}

/// Start of a `days`-long window ending at `now`. Windows reaching past the
/// representable range cover everything.
fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn insert_content(
    blob: &mut Map<String, Value>,
    question: &Option<String>,
    answer: &Option<String>,
    skill_used: &Option<String>,
    function_used: &Option<String>,
) {
    for (key, value) in [
        ("question", question),
        ("answer", answer),
        ("skill_used", skill_used),
        ("function_used", function_used),
    ] {
        if let Some(value) = value {
            blob.insert(key.to_string(), Value::String(value.clone()));
        }
    }
}

/// Feedback entries mirrored into one conversation's metadata. Entries
/// without a recognised `type` or a parseable `timestamp` are skipped.
fn mirrored_records(conversation: &Conversation) -> Vec<FeedbackRecord> {
    conversation
        .metadata
        .iter()
        .filter_map(|(key, value)| {
            let message_id = key.strip_prefix(MIRROR_KEY_PREFIX)?;
            let blob = value.as_object()?;
            let text = |field: &str| blob.get(field).and_then(Value::as_str).map(str::to_string);

            let feedback_type = FeedbackType::parse(blob.get("type")?.as_str()?)?;
            let timestamp = DateTime::parse_from_rfc3339(blob.get("timestamp")?.as_str()?)
                .ok()?
                .with_timezone(&Utc);

            Some(FeedbackRecord {
                message_id: message_id.to_string(),
                channel_id: text("channel_id").unwrap_or_default(),
                user_id: text("user_id").unwrap_or_default(),
                feedback_type,
                reaction: text("reaction").unwrap_or_default(),
                question: text("question"),
                answer: text("answer"),
                skill_used: text("skill_used"),
                function_used: text("function_used"),
                conversation_id: Some(conversation.id.clone()),
                timestamp,
            })
        })
        .collect()
}
