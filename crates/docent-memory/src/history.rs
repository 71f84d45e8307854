use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docent_schema::MessageRole;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A conversation together with its free-form side metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Write side of conversation history, plus the optional ability to list
/// conversations with their metadata.
#[async_trait]
pub trait ConversationHistory: Send + Sync {
    async fn add_message(
        &self,
        conversation_id: &str,
        content: &str,
        role: MessageRole,
        metadata: Option<Value>,
    ) -> Result<()>;

    /// Merge `metadata` keys into the conversation's metadata map.
    async fn update_conversation_metadata(
        &self,
        conversation_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<()>;

    /// `Ok(None)` when the conversation is unknown or the store cannot read
    /// conversations back.
    async fn get_conversation(&self, _conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(None)
    }

    /// Most recently updated conversations first. `Ok(None)` means this
    /// store cannot enumerate conversations at all.
    async fn list_conversations(&self, _limit: usize) -> Result<Option<Vec<Conversation>>> {
        Ok(None)
    }
}
