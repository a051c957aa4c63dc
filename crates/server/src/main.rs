use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{
    create_club, delete_message, join_club, list_members, mark_read, open_direct, pinned_messages,
    post_message, react, snapshot, toggle_pin, unread, vote, ApiContext,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientSignal, ConversationSnapshot, ConversationSummary, MemberSummary, MessageView,
        PushEvent, SendMessageBody, UnreadSummary,
    },
};
use storage::Storage;
use tokio::sync::{broadcast, mpsc};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod config;
mod presence;

use config::{load_settings, prepare_database_url};
use presence::PresenceRegistry;

const MAX_BODY_BYTES: usize = 64 * 1024;
const PUSH_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    presence: PresenceRegistry,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    display_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct CreateClubRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OpenDirectRequest {
    peer_id: i64,
}

#[derive(Debug, Deserialize)]
struct ReactRequest {
    emoji: String,
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    option_index: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext::new(storage),
        presence: PresenceRegistry::new(PUSH_CHANNEL_CAPACITY),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/clubs", post(http_create_club))
        .route("/clubs/:conversation_id/join", post(http_join_club))
        .route("/direct", post(http_open_direct))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_snapshot).post(http_post_message),
        )
        .route(
            "/conversations/:conversation_id/messages/:message_id/react",
            post(http_react),
        )
        .route(
            "/conversations/:conversation_id/messages/:message_id/vote",
            post(http_vote),
        )
        .route(
            "/conversations/:conversation_id/messages/:message_id/pin",
            post(http_toggle_pin),
        )
        .route(
            "/conversations/:conversation_id/messages/:message_id",
            delete(http_delete_message),
        )
        .route("/conversations/:conversation_id/read", post(http_mark_read))
        .route("/conversations/:conversation_id/pins", get(http_pins))
        .route("/conversations/:conversation_id/unread", get(http_unread))
        .route("/conversations/:conversation_id/members", get(http_members))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        )));
    }
    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(username);

    let user_id = state
        .api
        .storage
        .create_user(username, display_name)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_create_club(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<CreateClubRequest>,
) -> Result<Json<ConversationSummary>, (StatusCode, Json<ApiError>)> {
    let club = create_club(&state.api, UserId(q.user_id), &req.name)
        .await
        .map_err(reject)?;
    Ok(Json(club))
}

async fn http_join_club(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    join_club(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_open_direct(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<OpenDirectRequest>,
) -> Result<Json<ConversationSummary>, (StatusCode, Json<ApiError>)> {
    let thread = open_direct(&state.api, UserId(q.user_id), UserId(req.peer_id))
        .await
        .map_err(reject)?;
    Ok(Json(thread))
}

async fn http_snapshot(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = snapshot(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_post_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = post_message(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        body,
    )
    .await
    .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_react(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, message_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
    Json(req): Json<ReactRequest>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = react(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        MessageId(message_id),
        &req.emoji,
    )
    .await
    .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_vote(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, message_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = vote(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        MessageId(message_id),
        req.option_index,
    )
    .await
    .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_toggle_pin(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, message_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = toggle_pin(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        MessageId(message_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, message_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    delete_message(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        MessageId(message_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    mark_read(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        None,
    )
    .await
    .map_err(reject)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn http_pins(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<MessageView>>, (StatusCode, Json<ApiError>)> {
    let pinned = pinned_messages(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(Json(pinned))
}

async fn http_unread(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadSummary>, (StatusCode, Json<ApiError>)> {
    let summary = unread(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(Json(summary))
}

async fn http_members(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<MemberSummary>>, (StatusCode, Json<ApiError>)> {
    let members = list_members(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(Json(members))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

/// Push channel: forwards presence and typing events downstream, accepts
/// typing signals upstream. Everything here is best effort; a dropped
/// event is repaired by the client's next snapshot fetch. A malformed
/// signal earns an error event on the same socket, never a disconnect.
async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.presence.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<PushEvent>();
    state.presence.connect(user_id);

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = direct_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let signal: ClientSignal = match serde_json::from_str(&text) {
            Ok(signal) => signal,
            Err(error) => {
                warn!(user_id = user_id.0, %error, "unparseable client signal");
                let _ = direct_tx.send(PushEvent::Error(ApiError::new(
                    ErrorCode::Validation,
                    "unrecognized signal",
                )));
                continue;
            }
        };
        let conversation_id = match &signal {
            ClientSignal::TypingStart { conversation_id }
            | ClientSignal::TypingStop { conversation_id } => *conversation_id,
        };
        // Typing signals from non-members are dropped, not errored.
        let is_member = state
            .api
            .storage
            .membership_role(conversation_id, user_id)
            .await
            .ok()
            .flatten()
            .is_some();
        if !is_member {
            continue;
        }
        match signal {
            ClientSignal::TypingStart { conversation_id } => {
                state.presence.typing_started(user_id, conversation_id);
            }
            ClientSignal::TypingStop { conversation_id } => {
                state.presence.typing_stopped(user_id, conversation_id);
            }
        }
    }

    send_task.abort();
    state.presence.disconnect(user_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    async fn test_app() -> (Router, i64, i64, i64) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let alice = storage.create_user("alice", "Alice").await.expect("user");
        let bob = storage.create_user("bob", "Bob").await.expect("user");
        let club = storage.create_club("page turners", alice).await.expect("club");
        storage
            .add_member(club, bob, shared::domain::Role::Member)
            .await
            .expect("member");

        let state = AppState {
            api: ApiContext::new(storage),
            presence: PresenceRegistry::new(32),
        };
        (build_router(Arc::new(state)), alice.0, bob.0, club.0)
    }

    fn json_request(method: &str, uri: String, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let (app, _, _, _) = test_app().await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_message_returns_the_full_snapshot() {
        let (app, alice, _, club) = test_app().await;
        let request = json_request(
            "POST",
            format!("/conversations/{club}/messages?user_id={alice}"),
            serde_json::json!({ "content": "welcome to the club" }),
        );
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let snapshot = body_json(response).await;
        assert_eq!(snapshot["conversation_id"], club);
        assert_eq!(snapshot["messages"][0]["body"], "welcome to the club");
        assert_eq!(snapshot["messages"][0]["author_name"], "Alice");
    }

    #[tokio::test]
    async fn non_member_post_is_forbidden() {
        let (app, _, _, club) = test_app().await;
        let request = json_request(
            "POST",
            format!("/conversations/{club}/messages?user_id=999"),
            serde_json::json!({ "content": "let me in" }),
        );
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_poll_vote_maps_to_conflict() {
        let (app, alice, bob, club) = test_app().await;
        let request = json_request(
            "POST",
            format!("/conversations/{club}/messages?user_id={alice}"),
            serde_json::json!({
                "poll": { "question": "next meeting?", "options": ["friday", "sunday"] }
            }),
        );
        let response = app.clone().oneshot(request).await.expect("response");
        let snapshot = body_json(response).await;
        let message_id = snapshot["messages"][0]["message_id"].as_i64().expect("id");

        let request = json_request(
            "POST",
            format!("/conversations/{club}/messages/{message_id}/vote?user_id={bob}"),
            serde_json::json!({ "option_index": 9 }),
        );
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn member_cannot_delete_someone_elses_message() {
        let (app, alice, bob, club) = test_app().await;
        let request = json_request(
            "POST",
            format!("/conversations/{club}/messages?user_id={alice}"),
            serde_json::json!({ "content": "admin note" }),
        );
        let response = app.clone().oneshot(request).await.expect("response");
        let snapshot = body_json(response).await;
        let message_id = snapshot["messages"][0]["message_id"].as_i64().expect("id");

        let request = Request::delete(format!(
            "/conversations/{club}/messages/{message_id}?user_id={bob}"
        ))
        .body(Body::empty())
        .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn direct_thread_round_trip() {
        let (app, alice, bob, _) = test_app().await;
        let request = json_request(
            "POST",
            format!("/direct?user_id={alice}"),
            serde_json::json!({ "peer_id": bob }),
        );
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let thread = body_json(response).await;
        assert_eq!(thread["kind"], "direct");

        let request = json_request(
            "POST",
            format!("/direct?user_id={bob}"),
            serde_json::json!({ "peer_id": alice }),
        );
        let response = app.oneshot(request).await.expect("response");
        let again = body_json(response).await;
        assert_eq!(again["conversation_id"], thread["conversation_id"]);
    }

    #[tokio::test]
    async fn malformed_ws_signal_gets_an_error_event() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let (app, alice, _, _) = test_app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id={alice}"))
                .await
                .expect("connect");
        socket
            .send(WsMessage::Text("not a signal".into()))
            .await
            .expect("send");

        // The roster broadcast from our own connect arrives first; skip
        // ahead to the error event.
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(frame) = socket.next().await {
                let text = match frame.expect("frame") {
                    WsMessage::Text(text) => text,
                    _ => continue,
                };
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                if value["type"] == "error" {
                    return value;
                }
            }
            panic!("socket closed before the error event");
        })
        .await
        .expect("timed out waiting for the error event");

        assert_eq!(event["payload"]["code"], "validation");
    }

    #[tokio::test]
    async fn unread_endpoint_reports_count_and_divider() {
        let (app, alice, bob, club) = test_app().await;
        let request = json_request(
            "POST",
            format!("/conversations/{club}/messages?user_id={alice}"),
            serde_json::json!({ "content": "chapter one thoughts" }),
        );
        app.clone().oneshot(request).await.expect("response");

        let request = Request::get(format!("/conversations/{club}/unread?user_id={bob}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let summary = body_json(response).await;
        assert_eq!(summary["count"], 1);
        assert_eq!(summary["first_unread_index"], 0);

        let request = Request::post(format!("/conversations/{club}/read?user_id={bob}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::get(format!("/conversations/{club}/unread?user_id={bob}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let summary = body_json(response).await;
        assert_eq!(summary["count"], 0);
    }
}
