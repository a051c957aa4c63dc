use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ClientSignal, ConversationSnapshot, ConversationSummary, MemberSummary, MessageView,
        PushEvent, SendMessageBody, UnreadSummary,
    },
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use uuid::Uuid;

mod reconcile;
mod typing;

pub use reconcile::{LocalConversation, PendingMessage, PendingStatus, TimelineEntry};
pub use typing::{TypingTracker, TYPING_TTL};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events surfaced to the UI layer. State is pulled from the client after an
/// event rather than carried inside it, so a slow consumer only ever sees
/// the latest state.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationUpdated {
        conversation_id: ConversationId,
    },
    /// `retryable` mirrors `ApiError::is_retryable`; failures that never
    /// reached the server count as retryable.
    SendFailed {
        conversation_id: ConversationId,
        temp_id: Uuid,
        error: String,
        retryable: bool,
    },
    PresenceChanged {
        online_user_ids: Vec<UserId>,
    },
    TypingChanged {
        conversation_id: ConversationId,
    },
    Error(String),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct OpenDirectRequest {
    peer_id: i64,
}

#[derive(Debug, Serialize)]
struct CreateClubRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ReactRequest<'a> {
    emoji: &'a str,
}

#[derive(Debug, Serialize)]
struct VoteRequest {
    option_index: i64,
}

struct ClientState {
    server_url: Option<String>,
    user_id: Option<UserId>,
    ws_started: bool,
    ws_tx: Option<mpsc::UnboundedSender<ClientSignal>>,
    conversations: HashMap<ConversationId, LocalConversation>,
    online: HashSet<UserId>,
    typing: TypingTracker,
}

/// HTTP-and-websocket client with optimistic local sends. Confirmed history
/// is whatever snapshot the server returned last; queued sends render after
/// it until their own mutation response lands.
pub struct ChatClient {
    http: Client,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            inner: Mutex::new(ClientState {
                server_url: None,
                user_id: None,
                ws_started: false,
                ws_tx: None,
                conversations: HashMap::new(),
                online: HashSet::new(),
                typing: TypingTracker::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Logs in and starts the push channel. The push channel is best effort:
    /// presence and typing degrade silently if it drops, everything else
    /// still works over HTTP.
    pub async fn connect(
        self: &Arc<Self>,
        server_url: &str,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<UserId> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let response = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginRequest {
                username,
                display_name,
            })
            .send()
            .await?;
        let body: LoginResponse = expect_json(response).await?;
        let user_id = UserId(body.user_id);

        {
            let mut guard = self.inner.lock().await;
            guard.server_url = Some(server_url.clone());
            guard.user_id = Some(user_id);
        }
        if let Err(err) = self.spawn_push_channel(&server_url, user_id).await {
            warn!(%err, "push channel unavailable, continuing without it");
        }
        Ok(user_id)
    }

    async fn session(&self) -> Result<(String, UserId)> {
        let guard = self.inner.lock().await;
        let server_url = guard
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("not connected"))?;
        let user_id = guard.user_id.ok_or_else(|| anyhow!("not logged in"))?;
        Ok((server_url, user_id))
    }

    /// Fetches the authoritative snapshot and marks the conversation read.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<Vec<TimelineEntry>> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/messages?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await?;
        let snapshot: ConversationSnapshot = expect_json(response).await?;

        let read = self
            .http
            .post(format!(
                "{server_url}/conversations/{}/read?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await;
        if let Err(err) = read {
            warn!(%err, conversation_id = conversation_id.0, "failed to advance read marker");
        }

        let mut guard = self.inner.lock().await;
        let local = guard.conversations.entry(conversation_id).or_default();
        local.apply_snapshot(snapshot);
        let timeline = local.timeline();
        drop(guard);
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation_id });
        Ok(timeline)
    }

    /// Queues a send optimistically and returns its temp id immediately. The
    /// HTTP round trip runs in the background; the pending entry is replaced
    /// by the server snapshot on success and flagged failed otherwise.
    pub async fn queue_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        body: SendMessageBody,
    ) -> Result<Uuid> {
        self.session().await?;
        let temp_id = Uuid::new_v4();
        {
            let mut guard = self.inner.lock().await;
            guard
                .conversations
                .entry(conversation_id)
                .or_default()
                .queue(PendingMessage::new(temp_id, conversation_id, body));
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation_id });
        self.spawn_send(conversation_id, temp_id);
        Ok(temp_id)
    }

    /// Re-attempts a failed send under its original temp id, so the queue
    /// position and the entry the UI tracks are preserved.
    pub async fn retry_send(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        temp_id: Uuid,
    ) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            let local = guard
                .conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| anyhow!("unknown conversation"))?;
            if !local.mark_sending(temp_id) {
                return Err(anyhow!("no pending send with that id"));
            }
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation_id });
        self.spawn_send(conversation_id, temp_id);
        Ok(())
    }

    pub async fn dismiss_failed(
        &self,
        conversation_id: ConversationId,
        temp_id: Uuid,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let local = guard
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| anyhow!("unknown conversation"))?;
        if !local.remove_pending(temp_id) {
            return Err(anyhow!("no pending send with that id"));
        }
        drop(guard);
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation_id });
        Ok(())
    }

    fn spawn_send(self: &Arc<Self>, conversation_id: ConversationId, temp_id: Uuid) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = client.perform_send(conversation_id, temp_id).await;
            match outcome {
                Ok(snapshot) => {
                    let mut guard = client.inner.lock().await;
                    if let Some(local) = guard.conversations.get_mut(&conversation_id) {
                        local.confirm(temp_id, snapshot);
                    }
                    drop(guard);
                    let _ = client
                        .events
                        .send(ClientEvent::ConversationUpdated { conversation_id });
                }
                Err(err) => {
                    let retryable = err
                        .downcast_ref::<ApiError>()
                        .map(ApiError::is_retryable)
                        .unwrap_or(true);
                    let error = err.to_string();
                    let mut guard = client.inner.lock().await;
                    if let Some(local) = guard.conversations.get_mut(&conversation_id) {
                        local.mark_failed(temp_id, &error);
                    }
                    drop(guard);
                    let _ = client.events.send(ClientEvent::SendFailed {
                        conversation_id,
                        temp_id,
                        error,
                        retryable,
                    });
                }
            }
        });
    }

    async fn perform_send(
        &self,
        conversation_id: ConversationId,
        temp_id: Uuid,
    ) -> Result<ConversationSnapshot> {
        let (server_url, user_id) = self.session().await?;
        let body = {
            let guard = self.inner.lock().await;
            guard
                .conversations
                .get(&conversation_id)
                .and_then(|local| local.pending_body(temp_id))
                .ok_or_else(|| anyhow!("pending send vanished before dispatch"))?
        };
        let response = self
            .http
            .post(format!(
                "{server_url}/conversations/{}/messages?user_id={}",
                conversation_id.0, user_id.0
            ))
            .json(&body)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn react(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!(
                "{server_url}/conversations/{}/messages/{}/react?user_id={}",
                conversation_id.0, message_id.0, user_id.0
            ))
            .json(&ReactRequest { emoji })
            .send()
            .await?;
        self.apply_snapshot_response(conversation_id, response).await
    }

    pub async fn vote(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        option_index: i64,
    ) -> Result<()> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!(
                "{server_url}/conversations/{}/messages/{}/vote?user_id={}",
                conversation_id.0, message_id.0, user_id.0
            ))
            .json(&VoteRequest { option_index })
            .send()
            .await?;
        self.apply_snapshot_response(conversation_id, response).await
    }

    pub async fn toggle_pin(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<()> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!(
                "{server_url}/conversations/{}/messages/{}/pin?user_id={}",
                conversation_id.0, message_id.0, user_id.0
            ))
            .send()
            .await?;
        self.apply_snapshot_response(conversation_id, response).await
    }

    /// Tombstones a message, then refetches: deletion returns no body, so
    /// the follow-up snapshot keeps the local copy authoritative.
    pub async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<()> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .delete(format!(
                "{server_url}/conversations/{}/messages/{}?user_id={}",
                conversation_id.0, message_id.0, user_id.0
            ))
            .send()
            .await?;
        expect_ok(response).await?;

        let response = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/messages?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await?;
        self.apply_snapshot_response(conversation_id, response).await
    }

    pub async fn pinned_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageView>> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/pins?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn unread(&self, conversation_id: ConversationId) -> Result<UnreadSummary> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/unread?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn members(&self, conversation_id: ConversationId) -> Result<Vec<MemberSummary>> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/members?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn create_club(&self, name: &str) -> Result<ConversationSummary> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}/clubs?user_id={}", user_id.0))
            .json(&CreateClubRequest { name })
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn join_club(&self, conversation_id: ConversationId) -> Result<()> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!(
                "{server_url}/clubs/{}/join?user_id={}",
                conversation_id.0, user_id.0
            ))
            .send()
            .await?;
        expect_ok(response).await
    }

    pub async fn open_direct(&self, peer_id: UserId) -> Result<ConversationSummary> {
        let (server_url, user_id) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}/direct?user_id={}", user_id.0))
            .json(&OpenDirectRequest { peer_id: peer_id.0 })
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn timeline(&self, conversation_id: ConversationId) -> Vec<TimelineEntry> {
        let guard = self.inner.lock().await;
        guard
            .conversations
            .get(&conversation_id)
            .map(LocalConversation::timeline)
            .unwrap_or_default()
    }

    pub async fn online_user_ids(&self) -> Vec<UserId> {
        let guard = self.inner.lock().await;
        let mut online: Vec<UserId> = guard.online.iter().copied().collect();
        online.sort();
        online
    }

    /// Users currently typing in the conversation, pruned by the staleness
    /// window. The caller's own typing never shows here.
    pub async fn typing_in(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let mut guard = self.inner.lock().await;
        let own = guard.user_id;
        let mut typing = guard.typing.active_in(conversation_id, Instant::now());
        typing.retain(|user| Some(*user) != own);
        typing
    }

    pub async fn start_typing(&self, conversation_id: ConversationId) {
        self.send_signal(ClientSignal::TypingStart { conversation_id })
            .await;
    }

    pub async fn stop_typing(&self, conversation_id: ConversationId) {
        self.send_signal(ClientSignal::TypingStop { conversation_id })
            .await;
    }

    async fn send_signal(&self, signal: ClientSignal) {
        let guard = self.inner.lock().await;
        if let Some(tx) = &guard.ws_tx {
            let _ = tx.send(signal);
        }
    }

    async fn apply_snapshot_response(
        &self,
        conversation_id: ConversationId,
        response: reqwest::Response,
    ) -> Result<()> {
        let snapshot: ConversationSnapshot = expect_json(response).await?;
        {
            let mut guard = self.inner.lock().await;
            guard
                .conversations
                .entry(conversation_id)
                .or_default()
                .apply_snapshot(snapshot);
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation_id });
        Ok(())
    }

    async fn spawn_push_channel(self: &Arc<Self>, server_url: &str, user_id: UserId) -> Result<()> {
        {
            let guard = self.inner.lock().await;
            if guard.ws_started {
                return Ok(());
            }
        }
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?user_id={}", user_id.0);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientSignal>();
        {
            let mut guard = self.inner.lock().await;
            guard.ws_started = true;
            guard.ws_tx = Some(signal_tx);
        }

        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let text = match serde_json::to_string(&signal) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<PushEvent>(&text) {
                    Ok(event) => client.handle_push_event(event).await,
                    Err(err) => {
                        warn!(%err, "unparseable push event");
                    }
                }
            }
            let mut guard = client.inner.lock().await;
            guard.ws_started = false;
            guard.ws_tx = None;
        });

        Ok(())
    }

    async fn handle_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::PresenceUpdate { online_user_ids } => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.online = online_user_ids.iter().copied().collect();
                }
                let _ = self
                    .events
                    .send(ClientEvent::PresenceChanged { online_user_ids });
            }
            PushEvent::TypingStarted {
                from,
                conversation_id,
            } => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.typing.started(conversation_id, from, Instant::now());
                }
                let _ = self
                    .events
                    .send(ClientEvent::TypingChanged { conversation_id });
            }
            PushEvent::TypingStopped {
                from,
                conversation_id,
            } => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.typing.stopped(conversation_id, from);
                }
                let _ = self
                    .events
                    .send(ClientEvent::TypingChanged { conversation_id });
            }
            PushEvent::Error(error) => {
                let _ = self.events.send(ClientEvent::Error(error.message));
            }
        }
    }
}

async fn expect_ok(response: reqwest::Response) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(decode_error(response).await)
}

async fn expect_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(decode_error(response).await);
    }
    Ok(response.json().await?)
}

/// Decoded errors keep their `ApiError` so callers can downcast for the
/// code and the retryability verdict.
async fn decode_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api_error) => anyhow::Error::new(api_error),
        Err(_) => anyhow!("request failed with status {status}"),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
