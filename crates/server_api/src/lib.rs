use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentRef, ConversationSnapshot, ConversationSummary, ForwardOrigin, MemberSummary,
        MessageView, PollOptionView, PollView, ReactionEntry, ReplyRef, SendMessageBody,
        UnreadSummary,
    },
};
use storage::{NewMessage, NewPoll, Storage, StoredAttachment, StoredMessage, StoredReplyRef};
use tokio::sync::Mutex;
use tracing::info;

const REPLY_SNIPPET_MAX_CHARS: usize = 80;

/// Per-conversation mutation locks. Every write against a conversation is
/// applied under its lock so the full-snapshot response is never assembled
/// from a half-applied state.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub async fn acquire(
        &self,
        conversation_id: ConversationId,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub locks: ConversationLocks,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            locks: ConversationLocks::default(),
        }
    }
}

/// Appends a message and returns the full authoritative snapshot. The
/// sender implicitly reads their own send, so the read marker advances too.
pub async fn post_message(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    body: SendMessageBody,
) -> Result<ConversationSnapshot, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    let payload = validate_send_body(ctx, conversation_id, &body).await?;
    let author_name = ctx
        .storage
        .display_name_for_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "unknown author"))?;

    let _guard = ctx.locks.acquire(conversation_id).await;
    let message_id = ctx
        .storage
        .append_message(conversation_id, user_id, &author_name, payload)
        .await
        .map_err(internal)?;
    ctx.storage
        .mark_read(user_id, conversation_id, Utc::now())
        .await
        .map_err(internal)?;
    info!(
        conversation_id = conversation_id.0,
        message_id = message_id.0,
        author_id = user_id.0,
        "message appended"
    );
    snapshot_locked(ctx, conversation_id).await
}

pub async fn react(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    message_id: MessageId,
    emoji: &str,
) -> Result<ConversationSnapshot, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    if emoji.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "emoji cannot be empty"));
    }
    ensure_message_in_conversation(ctx, conversation_id, message_id).await?;

    let _guard = ctx.locks.acquire(conversation_id).await;
    ctx.storage
        .toggle_reaction(message_id, user_id, emoji)
        .await
        .map_err(internal)?;
    snapshot_locked(ctx, conversation_id).await
}

pub async fn vote(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    message_id: MessageId,
    option_index: i64,
) -> Result<ConversationSnapshot, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    ensure_message_in_conversation(ctx, conversation_id, message_id).await?;
    let option_count = ctx
        .storage
        .poll_option_count(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Validation, "message has no poll"))?;
    if option_index < 0 || option_index >= option_count {
        return Err(ApiError::new(ErrorCode::Conflict, "invalid option index"));
    }

    let _guard = ctx.locks.acquire(conversation_id).await;
    ctx.storage
        .cast_vote(message_id, user_id, option_index)
        .await
        .map_err(internal)?;
    snapshot_locked(ctx, conversation_id).await
}

/// Pin rights follow delete rights: author or admin. Multiple messages may
/// be pinned at once.
pub async fn toggle_pin(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<ConversationSnapshot, ApiError> {
    let role = ensure_member(ctx, conversation_id, user_id).await?;

    // The current pin state must be read under the conversation lock, or two
    // concurrent toggles both observe the same state and one is lost.
    let _guard = ctx.locks.acquire(conversation_id).await;
    let (author_id, pinned) =
        ensure_message_in_conversation(ctx, conversation_id, message_id).await?;
    ensure_author_or_admin(user_id, author_id, role, "pin")?;

    ctx.storage
        .set_pinned(message_id, !pinned)
        .await
        .map_err(internal)?;
    info!(
        conversation_id = conversation_id.0,
        message_id = message_id.0,
        pinned = !pinned,
        "pin toggled"
    );
    snapshot_locked(ctx, conversation_id).await
}

pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let role = ensure_member(ctx, conversation_id, user_id).await?;
    let (author_id, _) = ensure_message_in_conversation(ctx, conversation_id, message_id).await?;
    ensure_author_or_admin(user_id, author_id, role, "delete")?;

    let _guard = ctx.locks.acquire(conversation_id).await;
    ctx.storage.soft_delete(message_id).await.map_err(internal)?;
    info!(
        conversation_id = conversation_id.0,
        message_id = message_id.0,
        requested_by = user_id.0,
        "message tombstoned"
    );
    Ok(())
}

pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    at: Option<DateTime<Utc>>,
) -> Result<(), ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    ctx.storage
        .mark_read(user_id, conversation_id, at.unwrap_or_else(Utc::now))
        .await
        .map_err(internal)
}

pub async fn snapshot(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<ConversationSnapshot, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    snapshot_locked(ctx, conversation_id).await
}

pub async fn pinned_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<Vec<MessageView>, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    let pinned = ctx
        .storage
        .list_pinned(conversation_id)
        .await
        .map_err(internal)?;
    Ok(pinned.into_iter().map(message_view).collect())
}

pub async fn unread(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<UnreadSummary, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    let count = ctx
        .storage
        .unread_count(user_id, conversation_id)
        .await
        .map_err(internal)?;
    let first_unread_index = ctx
        .storage
        .first_unread_index(user_id, conversation_id)
        .await
        .map_err(internal)?;
    Ok(UnreadSummary {
        count,
        first_unread_index,
    })
}

pub async fn create_club(
    ctx: &ApiContext,
    user_id: UserId,
    name: &str,
) -> Result<ConversationSummary, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "club name cannot be empty"));
    }
    let conversation_id = ctx
        .storage
        .create_club(name, user_id)
        .await
        .map_err(internal)?;
    Ok(ConversationSummary {
        conversation_id,
        kind: ConversationKind::Club,
        name: Some(name.to_string()),
    })
}

pub async fn join_club(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    let kind = ctx
        .storage
        .conversation_kind(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    if kind != ConversationKind::Club {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "direct threads cannot be joined",
        ));
    }
    ctx.storage
        .add_member(conversation_id, user_id, Role::Member)
        .await
        .map_err(internal)
}

/// Opens (or returns) the direct thread for the caller and a peer. A second
/// request for the same pair is an expected race, not an error: it resolves
/// to the existing thread.
pub async fn open_direct(
    ctx: &ApiContext,
    user_id: UserId,
    peer_id: UserId,
) -> Result<ConversationSummary, ApiError> {
    if user_id == peer_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot open a direct thread with yourself",
        ));
    }
    ctx.storage
        .display_name_for_user(peer_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "peer not found"))?;

    let (conversation_id, created) = ctx
        .storage
        .open_direct_thread(user_id, peer_id)
        .await
        .map_err(internal)?;
    if created {
        info!(
            conversation_id = conversation_id.0,
            a = user_id.0,
            b = peer_id.0,
            "direct thread created"
        );
    }
    Ok(ConversationSummary {
        conversation_id,
        kind: ConversationKind::Direct,
        name: None,
    })
}

pub async fn list_members(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<Vec<MemberSummary>, ApiError> {
    ensure_member(ctx, conversation_id, user_id).await?;
    let members = ctx
        .storage
        .list_members(conversation_id)
        .await
        .map_err(internal)?;
    Ok(members
        .into_iter()
        .map(|member| MemberSummary {
            conversation_id,
            user_id: member.user_id,
            display_name: member.display_name,
            role: member.role,
        })
        .collect())
}

async fn snapshot_locked(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<ConversationSnapshot, ApiError> {
    let messages = ctx
        .storage
        .list_messages(conversation_id)
        .await
        .map_err(internal)?;
    Ok(ConversationSnapshot {
        conversation_id,
        messages: messages.into_iter().map(message_view).collect(),
    })
}

/// Normalizes a client payload into the store's shape: attachment stripped
/// to {kind, url, name}, poll checked for well-formedness, reply snippet
/// denormalized from the target message.
async fn validate_send_body(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    body: &SendMessageBody,
) -> Result<NewMessage, ApiError> {
    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let attachment = body.attachment.as_ref().map(strip_attachment).transpose()?;

    let poll = match &body.poll {
        Some(spec) => {
            let question = spec.question.trim();
            if question.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "poll question cannot be empty",
                ));
            }
            let options: Vec<String> = spec
                .options
                .iter()
                .map(|option| option.trim().to_string())
                .collect();
            if options.len() < 2 || options.iter().any(String::is_empty) {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "poll needs at least two non-empty options",
                ));
            }
            Some(NewPoll {
                question: question.to_string(),
                options,
            })
        }
        None => None,
    };

    if content.is_none() && attachment.is_none() && poll.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message needs a body, attachment, or poll",
        ));
    }

    let reply_to = match body.reply_to {
        Some(target_id) => {
            let target = ctx
                .storage
                .load_message(target_id)
                .await
                .map_err(internal)?
                .filter(|target| target.conversation_id == conversation_id)
                .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "reply target not found"))?;
            Some(StoredReplyRef {
                message_id: target_id,
                snippet: reply_snippet(&target),
            })
        }
        None => None,
    };

    Ok(NewMessage {
        body: content,
        attachment,
        reply_to,
        forwarded_from: body
            .forwarded_from
            .as_ref()
            .map(|origin| origin.author_name.clone()),
        poll,
    })
}

fn strip_attachment(attachment: &AttachmentRef) -> Result<StoredAttachment, ApiError> {
    if attachment.url.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "attachment url cannot be empty",
        ));
    }
    Ok(StoredAttachment {
        kind: attachment.kind,
        url: attachment.url.trim().to_string(),
        name: attachment.name.trim().to_string(),
    })
}

fn reply_snippet(target: &StoredMessage) -> String {
    if target.deleted {
        return "message deleted".to_string();
    }
    if let Some(body) = &target.body {
        return body.chars().take(REPLY_SNIPPET_MAX_CHARS).collect();
    }
    if target.poll.is_some() {
        return "poll".to_string();
    }
    if let Some(attachment) = &target.attachment {
        return attachment.kind.as_str().to_string();
    }
    String::new()
}

fn message_view(message: StoredMessage) -> MessageView {
    MessageView {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        author_id: message.author_id,
        author_name: message.author_name,
        body: message.body,
        attachment: message.attachment.map(|a| AttachmentRef {
            kind: a.kind,
            url: a.url,
            name: a.name,
        }),
        reply_to: message.reply_to.map(|r| ReplyRef {
            message_id: r.message_id,
            snippet: r.snippet,
        }),
        forwarded_from: message
            .forwarded_from
            .map(|author_name| ForwardOrigin { author_name }),
        poll: message.poll.map(|poll| PollView {
            question: poll.question,
            options: poll
                .options
                .into_iter()
                .map(|option| PollOptionView {
                    label: option.label,
                    voter_ids: option.voters,
                })
                .collect(),
        }),
        pinned: message.pinned,
        deleted: message.deleted,
        reactions: message
            .reactions
            .into_iter()
            .map(|reaction| ReactionEntry {
                user_id: reaction.user_id,
                emoji: reaction.emoji,
            })
            .collect(),
        sent_at: message.created_at,
    }
}

async fn ensure_member(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Role, ApiError> {
    ctx.storage
        .conversation_kind(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    ctx.storage
        .membership_role(conversation_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "user is not a member"))
}

/// Confirms the message belongs to the addressed conversation; returns its
/// author and current pin state.
async fn ensure_message_in_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<(UserId, bool), ApiError> {
    let (actual_conversation, author_id, pinned, _deleted) = ctx
        .storage
        .message_meta(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if actual_conversation != conversation_id {
        return Err(ApiError::new(ErrorCode::NotFound, "message not found"));
    }
    Ok((author_id, pinned))
}

fn ensure_author_or_admin(
    user_id: UserId,
    author_id: UserId,
    role: Role,
    action: &str,
) -> Result<(), ApiError> {
    if user_id == author_id || role == Role::Admin {
        return Ok(());
    }
    Err(ApiError::new(
        ErrorCode::Forbidden,
        format!("only the author or an admin may {action} this message"),
    ))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
