use std::{collections::HashMap, time::Duration, time::Instant};

use shared::domain::{ConversationId, UserId};

/// A typing indicator with no stop signal goes stale after this long.
pub const TYPING_TTL: Duration = Duration::from_secs(3);

/// Tracks who is typing where, expiring entries client-side so a peer that
/// disconnects mid-keystroke never leaves a stuck indicator.
#[derive(Debug, Default)]
pub struct TypingTracker {
    entries: HashMap<(ConversationId, UserId), Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&mut self, conversation_id: ConversationId, user_id: UserId, at: Instant) {
        self.entries.insert((conversation_id, user_id), at);
    }

    pub fn stopped(&mut self, conversation_id: ConversationId, user_id: UserId) {
        self.entries.remove(&(conversation_id, user_id));
    }

    /// Prunes expired entries and returns the live typists, sorted by id.
    pub fn active_in(&mut self, conversation_id: ConversationId, now: Instant) -> Vec<UserId> {
        self.entries
            .retain(|_, started_at| now.duration_since(*started_at) < TYPING_TTL);
        let mut typing: Vec<UserId> = self
            .entries
            .keys()
            .filter(|(conversation, _)| *conversation == conversation_id)
            .map(|(_, user)| *user)
            .collect();
        typing.sort();
        typing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_expires_after_the_staleness_window() {
        let mut tracker = TypingTracker::new();
        let start = Instant::now();
        tracker.started(ConversationId(1), UserId(2), start);

        assert_eq!(
            tracker.active_in(ConversationId(1), start + Duration::from_secs(2)),
            vec![UserId(2)]
        );
        assert!(tracker
            .active_in(ConversationId(1), start + TYPING_TTL)
            .is_empty());
    }

    #[test]
    fn restart_refreshes_the_window() {
        let mut tracker = TypingTracker::new();
        let start = Instant::now();
        tracker.started(ConversationId(1), UserId(2), start);
        tracker.started(ConversationId(1), UserId(2), start + Duration::from_secs(2));

        assert_eq!(
            tracker.active_in(ConversationId(1), start + Duration::from_secs(4)),
            vec![UserId(2)]
        );
    }

    #[test]
    fn stop_clears_immediately_and_scoping_is_per_conversation() {
        let mut tracker = TypingTracker::new();
        let start = Instant::now();
        tracker.started(ConversationId(1), UserId(2), start);
        tracker.started(ConversationId(9), UserId(3), start);

        tracker.stopped(ConversationId(1), UserId(2));
        assert!(tracker.active_in(ConversationId(1), start).is_empty());
        assert_eq!(tracker.active_in(ConversationId(9), start), vec![UserId(3)]);
    }
}
