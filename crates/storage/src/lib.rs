use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{AttachmentKind, ConversationId, ConversationKind, MessageId, Role, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReplyRef {
    pub message_id: MessageId,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReaction {
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPollOption {
    pub label: String,
    pub voters: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPoll {
    pub question: String,
    pub options: Vec<StoredPollOption>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    pub author_name: String,
    pub body: Option<String>,
    pub attachment: Option<StoredAttachment>,
    pub reply_to: Option<StoredReplyRef>,
    pub forwarded_from: Option<String>,
    pub poll: Option<StoredPoll>,
    pub pinned: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<StoredReaction>,
}

#[derive(Debug, Clone)]
pub struct NewPoll {
    pub question: String,
    pub options: Vec<String>,
}

/// Payload for a single append, already validated and normalized by the
/// gateway. Reply snippets arrive denormalized so they survive later
/// tombstoning of the target.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub body: Option<String>,
    pub attachment: Option<StoredAttachment>,
    pub reply_to: Option<StoredReplyRef>,
    pub forwarded_from: Option<String>,
    pub poll: Option<NewPoll>,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn role_as_str(role: Role) -> &'static str {
    match role {
        Role::Admin => "admin",
        Role::Member => "member",
    }
}

fn role_from_str(raw: &str) -> Role {
    match raw {
        "admin" => Role::Admin,
        _ => Role::Member,
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET display_name=excluded.display_name
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn display_name_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn create_club(&self, name: &str, owner_user_id: UserId) -> Result<ConversationId> {
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, name, created_at) VALUES ('club', ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));
        self.add_member(conversation_id, owner_user_id, Role::Admin)
            .await?;
        Ok(conversation_id)
    }

    /// Returns the direct thread for the unordered user pair, creating it on
    /// first use. The second element is true when the thread was created by
    /// this call. Creation registers the pair row last with INSERT OR IGNORE,
    /// so racing opens converge on whichever call registered first; the
    /// loser removes its own rows and returns the registered thread.
    pub async fn open_direct_thread(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(ConversationId, bool)> {
        let (low, high) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };

        if let Some(existing) = self.direct_pair(low, high).await? {
            return Ok((existing, false));
        }

        let rec = sqlx::query(
            "INSERT INTO conversations (kind, name, created_at) VALUES ('direct', NULL, ?) RETURNING id",
        )
        .bind(millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        // Members go in before the pair row: anyone who can see the pair can
        // already resolve both memberships.
        for user in [low, high] {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, role) VALUES (?, ?, 'member')",
            )
            .bind(conversation_id.0)
            .bind(user)
            .execute(&self.pool)
            .await?;
        }

        let claimed = sqlx::query(
            "INSERT OR IGNORE INTO direct_pairs (user_low, user_high, conversation_id) VALUES (?, ?, ?)",
        )
        .bind(low)
        .bind(high)
        .bind(conversation_id.0)
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 1 {
            return Ok((conversation_id, true));
        }

        // Lost the race: a concurrent open registered the pair first.
        sqlx::query("DELETE FROM conversation_members WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .execute(&self.pool)
            .await?;
        let existing = self
            .direct_pair(low, high)
            .await?
            .ok_or_else(|| anyhow!("direct pair missing after losing the open race"))?;
        Ok((existing, false))
    }

    async fn direct_pair(&self, low: i64, high: i64) -> Result<Option<ConversationId>> {
        let row = sqlx::query(
            "SELECT conversation_id FROM direct_pairs WHERE user_low = ? AND user_high = ?",
        )
        .bind(low)
        .bind(high)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ConversationId(r.get::<i64, _>(0))))
    }

    pub async fn add_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: Role,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role)
             VALUES (?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET role=excluded.role",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(role_as_str(role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn membership_role(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT role FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| role_from_str(r.get::<String, _>(0).as_str())))
    }

    pub async fn list_members(&self, conversation_id: ConversationId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, u.display_name, m.role
             FROM conversation_members m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ?
             ORDER BY lower(u.display_name) ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                display_name: r.get::<String, _>(2),
                role: role_from_str(r.get::<String, _>(3).as_str()),
            })
            .collect())
    }

    pub async fn conversation_kind(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationKind>> {
        let row = sqlx::query("SELECT kind FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| match r.get::<String, _>(0).as_str() {
            "direct" => ConversationKind::Direct,
            _ => ConversationKind::Club,
        }))
    }

    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        author_name: &str,
        payload: NewMessage,
    ) -> Result<MessageId> {
        let mut tx = self.pool.begin().await?;

        let rec = sqlx::query(
            "INSERT INTO messages (
                conversation_id, author_id, author_name, body,
                attachment_kind, attachment_url, attachment_name,
                reply_to_message_id, reply_snippet, forwarded_from, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(author_id.0)
        .bind(author_name)
        .bind(payload.body.as_deref())
        .bind(payload.attachment.as_ref().map(|a| a.kind.as_str()))
        .bind(payload.attachment.as_ref().map(|a| a.url.as_str()))
        .bind(payload.attachment.as_ref().map(|a| a.name.as_str()))
        .bind(payload.reply_to.as_ref().map(|r| r.message_id.0))
        .bind(payload.reply_to.as_ref().map(|r| r.snippet.as_str()))
        .bind(payload.forwarded_from.as_deref())
        .bind(millis(Utc::now()))
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        if let Some(poll) = payload.poll {
            sqlx::query("INSERT INTO polls (message_id, question) VALUES (?, ?)")
                .bind(message_id.0)
                .bind(&poll.question)
                .execute(&mut *tx)
                .await?;
            for (idx, label) in poll.options.iter().enumerate() {
                sqlx::query("INSERT INTO poll_options (message_id, idx, label) VALUES (?, ?, ?)")
                    .bind(message_id.0)
                    .bind(idx as i64)
                    .bind(label)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(message_id)
    }

    /// Conversation, author and flags for a message, or None for a stale id.
    pub async fn message_meta(
        &self,
        message_id: MessageId,
    ) -> Result<Option<(ConversationId, UserId, bool, bool)>> {
        let row = sqlx::query(
            "SELECT conversation_id, author_id, pinned, deleted FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                ConversationId(r.get::<i64, _>(0)),
                UserId(r.get::<i64, _>(1)),
                r.get::<bool, _>(2),
                r.get::<bool, _>(3),
            )
        }))
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut message = map_message_row(&row);
        message.reactions_and_poll(self).await?;
        Ok(Some(message.into_message()))
    }

    /// Toggles the (user, emoji) reaction entry; returns true when the entry
    /// is present after the call.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed > 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO reactions (message_id, user_id, emoji) VALUES (?, ?, ?)")
            .bind(message_id.0)
            .bind(user_id.0)
            .bind(emoji)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    /// Number of options on the message's poll, or None when the message has
    /// no poll.
    pub async fn poll_option_count(&self, message_id: MessageId) -> Result<Option<i64>> {
        let poll = sqlx::query("SELECT 1 FROM polls WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if poll.is_none() {
            return Ok(None);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM poll_options WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(count))
    }

    /// Replaces any prior vote by this user on the poll; the (message, user)
    /// primary key enforces exclusivity across options.
    pub async fn cast_vote(
        &self,
        message_id: MessageId,
        user_id: UserId,
        option_idx: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO poll_votes (message_id, user_id, option_idx) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET option_idx=excluded.option_idx",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(option_idx)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_pinned(&self, message_id: MessageId, pinned: bool) -> Result<()> {
        sqlx::query("UPDATE messages SET pinned = ? WHERE id = ?")
            .bind(pinned)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tombstones a message: body and attachment cleared, id and reply edges
    /// kept. Repeating the call is a no-op.
    pub async fn soft_delete(&self, message_id: MessageId) -> Result<()> {
        sqlx::query(
            "UPDATE messages
             SET deleted = 1, body = NULL,
                 attachment_kind = NULL, attachment_url = NULL, attachment_name = NULL
             WHERE id = ?",
        )
        .bind(message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full ordered snapshot of a conversation. Total order is
    /// (created_at, id); the AUTOINCREMENT id is the atomic insertion
    /// sequence that breaks same-millisecond ties.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut partials: Vec<PartialMessage> = rows.iter().map(map_message_row).collect();

        let mut reactions: HashMap<i64, Vec<StoredReaction>> = HashMap::new();
        let reaction_rows = sqlx::query(
            "SELECT r.message_id, r.user_id, r.emoji
             FROM reactions r
             INNER JOIN messages m ON m.id = r.message_id
             WHERE m.conversation_id = ?
             ORDER BY r.rowid ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in reaction_rows {
            reactions
                .entry(r.get::<i64, _>(0))
                .or_default()
                .push(StoredReaction {
                    user_id: UserId(r.get::<i64, _>(1)),
                    emoji: r.get::<String, _>(2),
                });
        }

        let polls = self.load_polls_for_conversation(conversation_id).await?;

        Ok(partials
            .drain(..)
            .map(|mut partial| {
                partial.reactions = reactions.remove(&partial.message_id.0).unwrap_or_default();
                partial.poll = polls.get(&partial.message_id.0).cloned();
                partial.into_message()
            })
            .collect())
    }

    pub async fn list_pinned(&self, conversation_id: ConversationId) -> Result<Vec<StoredMessage>> {
        let all = self.list_messages(conversation_id).await?;
        Ok(all.into_iter().filter(|m| m.pinned).collect())
    }

    async fn load_polls_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<HashMap<i64, StoredPoll>> {
        let mut polls: HashMap<i64, StoredPoll> = HashMap::new();

        let poll_rows = sqlx::query(
            "SELECT p.message_id, p.question
             FROM polls p
             INNER JOIN messages m ON m.id = p.message_id
             WHERE m.conversation_id = ?",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in poll_rows {
            polls.insert(
                r.get::<i64, _>(0),
                StoredPoll {
                    question: r.get::<String, _>(1),
                    options: Vec::new(),
                },
            );
        }

        let option_rows = sqlx::query(
            "SELECT o.message_id, o.idx, o.label
             FROM poll_options o
             INNER JOIN messages m ON m.id = o.message_id
             WHERE m.conversation_id = ?
             ORDER BY o.message_id ASC, o.idx ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in option_rows {
            if let Some(poll) = polls.get_mut(&r.get::<i64, _>(0)) {
                poll.options.push(StoredPollOption {
                    label: r.get::<String, _>(2),
                    voters: Vec::new(),
                });
            }
        }

        let vote_rows = sqlx::query(
            "SELECT v.message_id, v.option_idx, v.user_id
             FROM poll_votes v
             INNER JOIN messages m ON m.id = v.message_id
             WHERE m.conversation_id = ?
             ORDER BY v.rowid ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        for r in vote_rows {
            if let Some(poll) = polls.get_mut(&r.get::<i64, _>(0)) {
                let idx = r.get::<i64, _>(1) as usize;
                if let Some(option) = poll.options.get_mut(idx) {
                    option.voters.push(UserId(r.get::<i64, _>(2)));
                }
            }
        }

        Ok(polls)
    }

    /// Advances the read marker, never moving it backward. Out-of-order
    /// network replies can deliver an older timestamp after a newer one.
    pub async fn mark_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_markers (user_id, conversation_id, last_read_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id, conversation_id) DO UPDATE
             SET last_read_at = MAX(last_read_at, excluded.last_read_at)",
        )
        .bind(user_id.0)
        .bind(conversation_id.0)
        .bind(millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_marker(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_read_at FROM read_markers WHERE user_id = ? AND conversation_id = ?",
        )
        .bind(user_id.0)
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| from_millis(r.get::<i64, _>(0))))
    }

    /// Messages authored by someone else strictly after the marker. A user's
    /// own sends never count as unread.
    pub async fn unread_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<u32> {
        let marker = self
            .read_marker(user_id, conversation_id)
            .await?
            .map(millis)
            .unwrap_or(i64::MIN);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ? AND author_id != ? AND created_at > ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(marker)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    /// Position of the earliest unread message within the ordered snapshot,
    /// for rendering a "new messages" divider. Recomputed on every call; the
    /// marker moves too often for caching to be safe.
    pub async fn first_unread_index(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<usize>> {
        let marker = self
            .read_marker(user_id, conversation_id)
            .await?
            .map(millis)
            .unwrap_or(i64::MIN);
        let rows = sqlx::query(
            "SELECT author_id, created_at FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().position(|r| {
            r.get::<i64, _>(0) != user_id.0 && r.get::<i64, _>(1) > marker
        }))
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, author_id, author_name, body, \
     attachment_kind, attachment_url, attachment_name, \
     reply_to_message_id, reply_snippet, forwarded_from, pinned, deleted, created_at";

struct PartialMessage {
    message_id: MessageId,
    conversation_id: ConversationId,
    author_id: UserId,
    author_name: String,
    body: Option<String>,
    attachment: Option<StoredAttachment>,
    reply_to: Option<StoredReplyRef>,
    forwarded_from: Option<String>,
    pinned: bool,
    deleted: bool,
    created_at: DateTime<Utc>,
    reactions: Vec<StoredReaction>,
    poll: Option<StoredPoll>,
}

impl PartialMessage {
    async fn reactions_and_poll(&mut self, storage: &Storage) -> Result<()> {
        let reaction_rows = sqlx::query(
            "SELECT user_id, emoji FROM reactions WHERE message_id = ? ORDER BY rowid ASC",
        )
        .bind(self.message_id.0)
        .fetch_all(&storage.pool)
        .await?;
        self.reactions = reaction_rows
            .into_iter()
            .map(|r| StoredReaction {
                user_id: UserId(r.get::<i64, _>(0)),
                emoji: r.get::<String, _>(1),
            })
            .collect();

        let poll_row = sqlx::query("SELECT question FROM polls WHERE message_id = ?")
            .bind(self.message_id.0)
            .fetch_optional(&storage.pool)
            .await?;
        if let Some(poll_row) = poll_row {
            let mut options: Vec<StoredPollOption> = sqlx::query(
                "SELECT label FROM poll_options WHERE message_id = ? ORDER BY idx ASC",
            )
            .bind(self.message_id.0)
            .fetch_all(&storage.pool)
            .await?
            .into_iter()
            .map(|r| StoredPollOption {
                label: r.get::<String, _>(0),
                voters: Vec::new(),
            })
            .collect();

            let votes = sqlx::query(
                "SELECT option_idx, user_id FROM poll_votes WHERE message_id = ? ORDER BY rowid ASC",
            )
            .bind(self.message_id.0)
            .fetch_all(&storage.pool)
            .await?;
            for vote in votes {
                let idx = vote.get::<i64, _>(0) as usize;
                if let Some(option) = options.get_mut(idx) {
                    option.voters.push(UserId(vote.get::<i64, _>(1)));
                }
            }

            self.poll = Some(StoredPoll {
                question: poll_row.get::<String, _>(0),
                options,
            });
        }

        Ok(())
    }

    fn into_message(self) -> StoredMessage {
        StoredMessage {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            author_id: self.author_id,
            author_name: self.author_name,
            body: self.body,
            attachment: self.attachment,
            reply_to: self.reply_to,
            forwarded_from: self.forwarded_from,
            poll: self.poll,
            pinned: self.pinned,
            deleted: self.deleted,
            created_at: self.created_at,
            reactions: self.reactions,
        }
    }
}

fn map_message_row(r: &SqliteRow) -> PartialMessage {
    PartialMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        conversation_id: ConversationId(r.get::<i64, _>(1)),
        author_id: UserId(r.get::<i64, _>(2)),
        author_name: r.get::<String, _>(3),
        body: r.get::<Option<String>, _>(4),
        attachment: r.get::<Option<String>, _>(5).and_then(|kind| {
            let kind = AttachmentKind::parse(&kind)?;
            Some(StoredAttachment {
                kind,
                url: r.get::<Option<String>, _>(6).unwrap_or_default(),
                name: r.get::<Option<String>, _>(7).unwrap_or_default(),
            })
        }),
        reply_to: r.get::<Option<i64>, _>(8).map(|target| StoredReplyRef {
            message_id: MessageId(target),
            snippet: r.get::<Option<String>, _>(9).unwrap_or_default(),
        }),
        forwarded_from: r.get::<Option<String>, _>(10),
        pinned: r.get::<bool, _>(11),
        deleted: r.get::<bool, _>(12),
        created_at: from_millis(r.get::<i64, _>(13)),
        reactions: Vec::new(),
        poll: None,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
