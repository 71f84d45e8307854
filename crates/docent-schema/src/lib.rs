use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User id carried by the placeholder record that holds message content
/// captured before anyone reacted.
pub const PENDING_USER_ID: &str = "pending";
/// Reaction carried by the placeholder record.
pub const PENDING_REACTION: &str = "pending";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Positive,
    Negative,
    Neutral,
    Removed,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Removed => "removed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reaction-derived feedback entry on a bot message.
///
/// The primary store keeps at most one record per
/// `(message_id, user_id, reaction)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    pub message_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub feedback_type: FeedbackType,
    pub reaction: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub skill_used: Option<String>,
    #[serde(default)]
    pub function_used: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(
        message_id: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        feedback_type: FeedbackType,
        reaction: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            feedback_type,
            reaction: reaction.into(),
            question: None,
            answer: None,
            skill_used: None,
            function_used: None,
            conversation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.user_id == PENDING_USER_ID && self.reaction == PENDING_REACTION
    }

    /// Copy content fields from `other` wherever this record has none.
    pub fn fill_content_from(&mut self, other: &FeedbackRecord) {
        fill(&mut self.question, &other.question);
        fill(&mut self.answer, &other.answer);
        fill(&mut self.skill_used, &other.skill_used);
        fill(&mut self.function_used, &other.function_used);
        fill(&mut self.conversation_id, &other.conversation_id);
    }
}

fn fill(target: &mut Option<String>, source: &Option<String>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

/// Message content learned about a bot answer, possibly before any reaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedbackContentUpdate {
    pub message_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub skill_used: Option<String>,
    #[serde(default)]
    pub function_used: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl FeedbackContentUpdate {
    pub fn has_content(&self) -> bool {
        self.question.is_some()
            || self.answer.is_some()
            || self.skill_used.is_some()
            || self.function_used.is_some()
            || self.conversation_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReactionEventType {
    ReactionAdded,
    ReactionRemoved,
}

/// The reacted-to item of a Slack reaction event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub ts: String,
}

/// Slack `reaction_added` / `reaction_removed` event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionEvent {
    #[serde(rename = "type")]
    pub event_type: ReactionEventType,
    pub reaction: String,
    pub user: String,
    pub item: ReactionItem,
    #[serde(default)]
    pub event_ts: Option<String>,
}

impl ReactionEvent {
    pub fn is_message_item(&self) -> bool {
        self.item.item_type == "message"
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_event_deserializes_slack_payload() {
        let raw = serde_json::json!({
            "type": "reaction_added",
            "user": "U123",
            "reaction": "thumbsup",
            "item": {"type": "message", "channel": "C1", "ts": "1700000000.000100"},
            "event_ts": "1700000001.000200"
        });
        let event: ReactionEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, ReactionEventType::ReactionAdded);
        assert_eq!(event.item.channel, "C1");
        assert!(event.is_message_item());
    }

    #[test]
    fn reaction_event_on_file_is_not_message() {
        let raw = serde_json::json!({
            "type": "reaction_removed",
            "user": "U1",
            "reaction": "x",
            "item": {"type": "file"}
        });
        let event: ReactionEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, ReactionEventType::ReactionRemoved);
        assert!(!event.is_message_item());
        assert!(event.item.ts.is_empty());
    }

    #[test]
    fn feedback_type_serializes_lowercase() {
        let json = serde_json::to_value(FeedbackType::Removed).unwrap();
        assert_eq!(json, "removed");
        assert_eq!(FeedbackType::parse("negative"), Some(FeedbackType::Negative));
        assert_eq!(FeedbackType::parse("meh"), None);
    }

    #[test]
    fn fill_content_keeps_existing_values() {
        let mut record = FeedbackRecord::new("m", "c", "u", FeedbackType::Positive, "+1");
        record.question = Some("mine".into());
        let mut pending = FeedbackRecord::new("m", "c", PENDING_USER_ID, FeedbackType::Neutral, PENDING_REACTION);
        pending.question = Some("theirs".into());
        pending.answer = Some("answer".into());

        record.fill_content_from(&pending);
        assert_eq!(record.question.as_deref(), Some("mine"));
        assert_eq!(record.answer.as_deref(), Some("answer"));
        assert!(pending.is_pending());
        assert!(!record.is_pending());
    }
}
