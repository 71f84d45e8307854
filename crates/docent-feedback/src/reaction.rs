use docent_schema::{FeedbackType, ReactionEventType};

const POSITIVE_REACTIONS: &[&str] = &["thumbsup", "+1", "thumbs_up", "clap", "raised_hands", "heart"];
const NEGATIVE_REACTIONS: &[&str] = &["thumbsdown", "-1", "thumbs_down", "x", "no_entry"];

/// Map a reaction event to a feedback type. Removals always map to
/// `Removed`; emoji outside the known sets are not feedback.
pub fn feedback_type_for(event_type: ReactionEventType, reaction: &str) -> Option<FeedbackType> {
    if event_type == ReactionEventType::ReactionRemoved {
        return Some(FeedbackType::Removed);
    }
    if POSITIVE_REACTIONS.contains(&reaction) {
        Some(FeedbackType::Positive)
    } else if NEGATIVE_REACTIONS.contains(&reaction) {
        Some(FeedbackType::Negative)
    } else {
        None
    }
}
