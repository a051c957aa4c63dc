use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttachmentKind, ConversationId, ConversationKind, MessageId, Role, UserId},
    error::ApiError,
};

/// Attachment descriptor, already stripped to the three fields the store
/// persists. Media bytes live with an external storage collaborator; the
/// url is treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: MessageId,
    /// Snippet of the target message, denormalized when the reply is sent so
    /// it survives the target being tombstoned later.
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOrigin {
    pub author_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEntry {
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptionView {
    pub label: String,
    pub voter_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollView {
    pub question: String,
    pub options: Vec<PollOptionView>,
}

/// Poll shape as submitted by a client; the gateway validates it before
/// anything is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    pub question: String,
    pub options: Vec<String>,
}

/// Normalized message representation returned by every gateway operation.
/// The author is always resolved to an id plus denormalized display name;
/// consumers never have to distinguish populated from unpopulated references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub author_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<ForwardOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollView>,
    pub pinned: bool,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionEntry>,
    pub sent_at: DateTime<Utc>,
}

/// Full authoritative message list for one conversation. Mutation responses
/// return this whole snapshot rather than a delta so client reconciliation
/// stays a single list replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<ForwardOrigin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_unread_index: Option<usize>,
}

/// Ephemeral events on the push channel. Best effort, never persisted, and
/// never carries message bodies; a missed event self-heals on the next
/// snapshot fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    PresenceUpdate {
        online_user_ids: Vec<UserId>,
    },
    TypingStarted {
        from: UserId,
        conversation_id: ConversationId,
    },
    TypingStopped {
        from: UserId,
        conversation_id: ConversationId,
    },
    Error(ApiError),
}

/// Signals a connected client may send upstream on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientSignal {
    TypingStart { conversation_id: ConversationId },
    TypingStop { conversation_id: ConversationId },
}
