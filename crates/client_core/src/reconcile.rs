use chrono::{DateTime, Utc};
use shared::{
    domain::ConversationId,
    protocol::{ConversationSnapshot, MessageView, SendMessageBody},
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStatus {
    Sending,
    Failed { error: String },
}

/// A locally queued send awaiting its server snapshot. Identified by a
/// client-generated temp id so retries keep their queue position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub temp_id: Uuid,
    pub conversation_id: ConversationId,
    pub body: SendMessageBody,
    pub queued_at: DateTime<Utc>,
    pub status: PendingStatus,
}

impl PendingMessage {
    pub fn new(temp_id: Uuid, conversation_id: ConversationId, body: SendMessageBody) -> Self {
        Self {
            temp_id,
            conversation_id,
            body,
            queued_at: Utc::now(),
            status: PendingStatus::Sending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Confirmed(MessageView),
    Pending(PendingMessage),
}

/// Local view of one conversation: the last authoritative snapshot plus the
/// optimistic send queue. Reconciliation is whole-list replacement; only the
/// pending entry whose own response arrived is removed, so two in-flight
/// sends never cancel each other out.
#[derive(Debug, Clone, Default)]
pub struct LocalConversation {
    confirmed: Vec<MessageView>,
    pending: Vec<PendingMessage>,
}

impl LocalConversation {
    pub fn confirmed(&self) -> &[MessageView] {
        &self.confirmed
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn queue(&mut self, message: PendingMessage) {
        self.pending.push(message);
    }

    /// Replaces the confirmed history without touching the pending queue.
    pub fn apply_snapshot(&mut self, snapshot: ConversationSnapshot) {
        self.confirmed = snapshot.messages;
    }

    /// A send's own response arrived: drop exactly that pending entry and
    /// take the snapshot, which already contains the confirmed message.
    pub fn confirm(&mut self, temp_id: Uuid, snapshot: ConversationSnapshot) {
        self.pending.retain(|pending| pending.temp_id != temp_id);
        self.confirmed = snapshot.messages;
    }

    pub fn mark_failed(&mut self, temp_id: Uuid, error: &str) {
        if let Some(pending) = self.pending_mut(temp_id) {
            pending.status = PendingStatus::Failed {
                error: error.to_string(),
            };
        }
    }

    /// Returns false when there is nothing to retry under that id.
    pub fn mark_sending(&mut self, temp_id: Uuid) -> bool {
        match self.pending_mut(temp_id) {
            Some(pending) => {
                pending.status = PendingStatus::Sending;
                true
            }
            None => false,
        }
    }

    pub fn remove_pending(&mut self, temp_id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|pending| pending.temp_id != temp_id);
        self.pending.len() != before
    }

    pub fn pending_body(&self, temp_id: Uuid) -> Option<SendMessageBody> {
        self.pending
            .iter()
            .find(|pending| pending.temp_id == temp_id)
            .map(|pending| pending.body.clone())
    }

    /// Display order: confirmed history, then queued sends in queue order.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.confirmed
            .iter()
            .cloned()
            .map(TimelineEntry::Confirmed)
            .chain(self.pending.iter().cloned().map(TimelineEntry::Pending))
            .collect()
    }

    fn pending_mut(&mut self, temp_id: Uuid) -> Option<&mut PendingMessage> {
        self.pending
            .iter_mut()
            .find(|pending| pending.temp_id == temp_id)
    }
}
