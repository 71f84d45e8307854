use std::collections::HashMap;
use std::sync::RwLock;

use docent_schema::FeedbackType;

pub const DEFAULT_CONFIDENCE: f32 = 0.5;
const QUESTION_DECAY: f32 = 0.9;
const FEEDBACK_STEP: f32 = 0.05;

/// In-memory estimate of how well each user knows each domain, in `[0, 1]`.
/// Lost on restart.
#[derive(Debug, Default)]
pub struct UserKnowledgeConfidence {
    scores: RwLock<HashMap<(String, String), f32>>,
}

impl UserKnowledgeConfidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str, domain_id: &str) -> f32 {
        let scores = match self.scores.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        scores
            .get(&(user_id.to_string(), domain_id.to_string()))
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE)
    }

    pub fn set(&self, user_id: &str, domain_id: &str, value: f32) -> f32 {
        self.update(user_id, domain_id, |_| value)
    }

    /// Asking a question in a domain suggests the user is less sure of it.
    pub fn record_question(&self, user_id: &str, domain_id: &str) -> f32 {
        self.update(user_id, domain_id, |c| c * QUESTION_DECAY)
    }

    pub fn record_feedback(&self, user_id: &str, domain_id: &str, feedback: FeedbackType) -> f32 {
        self.update(user_id, domain_id, |c| match feedback {
            FeedbackType::Positive => c + FEEDBACK_STEP,
            FeedbackType::Negative => c - FEEDBACK_STEP,
            FeedbackType::Neutral | FeedbackType::Removed => c,
        })
    }

    fn update(&self, user_id: &str, domain_id: &str, f: impl FnOnce(f32) -> f32) -> f32 {
        let mut scores = match self.scores.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = scores
            .entry((user_id.to_string(), domain_id.to_string()))
            .or_insert(DEFAULT_CONFIDENCE);
        let next = f(*entry);
        *entry = if next.is_nan() {
            DEFAULT_CONFIDENCE
        } else {
            next.clamp(0.0, 1.0)
        };
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_pair_defaults_to_half() {
        let store = UserKnowledgeConfidence::new();
        assert_eq!(store.get("U1", "deploys"), 0.5);
    }

    #[test]
    fn set_is_clamped() {
        let store = UserKnowledgeConfidence::new();
        assert_eq!(store.set("U1", "d", 1.7), 1.0);
        assert_eq!(store.set("U1", "d", -3.0), 0.0);
        assert_eq!(store.set("U1", "d", f32::NAN), 0.5);
    }

    #[test]
    fn questions_decay_confidence() {
        let store = UserKnowledgeConfidence::new();
        let after = store.record_question("U1", "d");
        assert!((after - 0.45).abs() < 1e-6);
        assert!((store.get("U1", "d") - 0.45).abs() < 1e-6);
        assert_eq!(store.get("U1", "other"), 0.5);
    }

    #[test]
    fn feedback_nudges_confidence() {
        let store = UserKnowledgeConfidence::new();
        store.set("U1", "d", 0.98);
        assert_eq!(store.record_feedback("U1", "d", FeedbackType::Positive), 1.0);
        let lowered = store.record_feedback("U1", "d", FeedbackType::Negative);
        assert!((lowered - 0.95).abs() < 1e-6);
        assert_eq!(store.record_feedback("U1", "d", FeedbackType::Removed), lowered);
    }
}
