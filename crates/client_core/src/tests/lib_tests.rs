use super::*;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::error::ErrorCode;
use tokio::time::timeout;

fn view(message_id: i64, body: &str) -> MessageView {
    MessageView {
        message_id: shared::domain::MessageId(message_id),
        conversation_id: ConversationId(1),
        author_id: UserId(1),
        author_name: "Alice".to_string(),
        body: Some(body.to_string()),
        attachment: None,
        reply_to: None,
        forwarded_from: None,
        poll: None,
        pinned: false,
        deleted: false,
        reactions: Vec::new(),
        sent_at: Utc::now(),
    }
}

fn snapshot_of(messages: Vec<MessageView>) -> ConversationSnapshot {
    ConversationSnapshot {
        conversation_id: ConversationId(1),
        messages,
    }
}

fn text_body(content: &str) -> SendMessageBody {
    SendMessageBody {
        content: Some(content.to_string()),
        ..SendMessageBody::default()
    }
}

#[test]
fn pending_sends_render_after_confirmed_history() {
    let mut local = LocalConversation::default();
    local.apply_snapshot(snapshot_of(vec![view(1, "hello")]));
    let temp = Uuid::new_v4();
    local.queue(PendingMessage::new(temp, ConversationId(1), text_body("mine")));

    let timeline = local.timeline();
    assert_eq!(timeline.len(), 2);
    assert!(matches!(&timeline[0], TimelineEntry::Confirmed(m) if m.body.as_deref() == Some("hello")));
    assert!(matches!(&timeline[1], TimelineEntry::Pending(p) if p.temp_id == temp));
}

#[test]
fn confirm_removes_only_its_own_pending_entry() {
    let mut local = LocalConversation::default();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    local.queue(PendingMessage::new(first, ConversationId(1), text_body("one")));
    local.queue(PendingMessage::new(second, ConversationId(1), text_body("two")));

    // The first send's response arrives while the second is still in flight.
    local.confirm(first, snapshot_of(vec![view(1, "one")]));

    assert_eq!(local.confirmed().len(), 1);
    assert_eq!(local.pending().len(), 1);
    assert_eq!(local.pending()[0].temp_id, second);
}

#[test]
fn interleaved_foreign_message_lands_via_the_snapshot() {
    let mut local = LocalConversation::default();
    let temp = Uuid::new_v4();
    local.queue(PendingMessage::new(temp, ConversationId(1), text_body("mine")));

    // Someone else's message was appended before ours; the snapshot carries
    // both in server order.
    local.confirm(temp, snapshot_of(vec![view(1, "theirs"), view(2, "mine")]));

    let timeline = local.timeline();
    assert_eq!(timeline.len(), 2);
    assert!(local.pending().is_empty());
}

#[test]
fn failed_send_keeps_its_place_until_dismissed() {
    let mut local = LocalConversation::default();
    let temp = Uuid::new_v4();
    local.queue(PendingMessage::new(temp, ConversationId(1), text_body("doomed")));

    local.mark_failed(temp, "not a member");
    assert!(matches!(
        &local.pending()[0].status,
        PendingStatus::Failed { error } if error == "not a member"
    ));

    assert!(local.mark_sending(temp));
    assert_eq!(local.pending()[0].status, PendingStatus::Sending);

    assert!(local.remove_pending(temp));
    assert!(!local.remove_pending(temp));
}

#[test]
fn snapshot_refresh_does_not_disturb_the_send_queue() {
    let mut local = LocalConversation::default();
    let temp = Uuid::new_v4();
    local.queue(PendingMessage::new(temp, ConversationId(1), text_body("mine")));

    local.apply_snapshot(snapshot_of(vec![view(1, "refresh")]));
    assert_eq!(local.pending().len(), 1);
}

// Stub server backing the end-to-end client tests below.

struct StubState {
    messages: std::sync::Mutex<Vec<MessageView>>,
    next_id: AtomicI64,
    reject_sends: AtomicBool,
}

async fn stub_login() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "user_id": 7 }))
}

async fn stub_get_messages(
    State(state): State<Arc<StubState>>,
    Path(conversation_id): Path<i64>,
) -> Json<ConversationSnapshot> {
    let messages = state.messages.lock().expect("lock").clone();
    Json(ConversationSnapshot {
        conversation_id: ConversationId(conversation_id),
        messages,
    })
}

async fn stub_post_message(
    State(state): State<Arc<StubState>>,
    Path(conversation_id): Path<i64>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, Json<ApiError>)> {
    if state.reject_sends.load(Ordering::SeqCst) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ApiError::new(ErrorCode::Forbidden, "user is not a member")),
        ));
    }
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let mut messages = state.messages.lock().expect("lock");
    messages.push(MessageView {
        message_id: shared::domain::MessageId(id),
        conversation_id: ConversationId(conversation_id),
        author_id: UserId(7),
        author_name: "Me".to_string(),
        body: body.content,
        attachment: None,
        reply_to: None,
        forwarded_from: None,
        poll: None,
        pinned: false,
        deleted: false,
        reactions: Vec::new(),
        sent_at: Utc::now(),
    });
    Ok(Json(ConversationSnapshot {
        conversation_id: ConversationId(conversation_id),
        messages: messages.clone(),
    }))
}

async fn stub_mark_read() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn stub_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|_socket| async {})
}

async fn start_stub_server(reject_sends: bool) -> (String, Arc<StubState>) {
    let state = Arc::new(StubState {
        messages: std::sync::Mutex::new(Vec::new()),
        next_id: AtomicI64::new(1),
        reject_sends: AtomicBool::new(reject_sends),
    });
    let app = Router::new()
        .route("/login", post(stub_login))
        .route(
            "/conversations/:conversation_id/messages",
            get(stub_get_messages).post(stub_post_message),
        )
        .route("/conversations/:conversation_id/read", post(stub_mark_read))
        .route("/ws", get(stub_ws))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn wait_for_update(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(std::time::Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

#[tokio::test]
async fn queued_send_is_confirmed_by_the_server_snapshot() {
    let (server_url, _state) = start_stub_server(false).await;
    let client = ChatClient::new();
    client
        .connect(&server_url, "alice", None)
        .await
        .expect("connect");

    let conversation = ConversationId(1);
    client.open_conversation(conversation).await.expect("open");

    let mut rx = client.subscribe_events();
    let temp_id = client
        .queue_message(conversation, text_body("first post"))
        .await
        .expect("queue");

    loop {
        let timeline = client.timeline(conversation).await;
        let confirmed = timeline
            .iter()
            .any(|entry| matches!(entry, TimelineEntry::Confirmed(m) if m.body.as_deref() == Some("first post")));
        let still_pending = timeline
            .iter()
            .any(|entry| matches!(entry, TimelineEntry::Pending(p) if p.temp_id == temp_id));
        if confirmed {
            assert!(!still_pending);
            break;
        }
        wait_for_update(&mut rx).await;
    }
}

#[tokio::test]
async fn rejected_send_is_flagged_failed_and_can_be_retried() {
    let (server_url, state) = start_stub_server(true).await;
    let client = ChatClient::new();
    client
        .connect(&server_url, "alice", None)
        .await
        .expect("connect");

    let conversation = ConversationId(1);
    client.open_conversation(conversation).await.expect("open");

    let mut rx = client.subscribe_events();
    let temp_id = client
        .queue_message(conversation, text_body("blocked"))
        .await
        .expect("queue");

    loop {
        match wait_for_update(&mut rx).await {
            ClientEvent::SendFailed {
                temp_id: failed,
                retryable,
                ..
            } => {
                assert_eq!(failed, temp_id);
                assert!(!retryable, "a forbidden send is final, not retryable");
                break;
            }
            _ => continue,
        }
    }
    let timeline = client.timeline(conversation).await;
    assert!(timeline.iter().any(|entry| matches!(
        entry,
        TimelineEntry::Pending(p)
            if p.temp_id == temp_id && matches!(p.status, PendingStatus::Failed { .. })
    )));

    // The server relents; the retry reuses the same temp id.
    state.reject_sends.store(false, Ordering::SeqCst);
    client
        .retry_send(conversation, temp_id)
        .await
        .expect("retry");
    loop {
        let timeline = client.timeline(conversation).await;
        if timeline
            .iter()
            .any(|entry| matches!(entry, TimelineEntry::Confirmed(m) if m.body.as_deref() == Some("blocked")))
        {
            break;
        }
        wait_for_update(&mut rx).await;
    }
}

#[tokio::test]
async fn dismissing_a_failed_send_drops_it_from_the_timeline() {
    let (server_url, _state) = start_stub_server(true).await;
    let client = ChatClient::new();
    client
        .connect(&server_url, "alice", None)
        .await
        .expect("connect");

    let conversation = ConversationId(1);
    client.open_conversation(conversation).await.expect("open");

    let mut rx = client.subscribe_events();
    let temp_id = client
        .queue_message(conversation, text_body("giving up"))
        .await
        .expect("queue");
    loop {
        if let ClientEvent::SendFailed { .. } = wait_for_update(&mut rx).await {
            break;
        }
    }

    client
        .dismiss_failed(conversation, temp_id)
        .await
        .expect("dismiss");
    assert!(client.timeline(conversation).await.is_empty());
}
