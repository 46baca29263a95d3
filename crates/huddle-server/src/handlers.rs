//! Connection handlers for Huddle server.
//!
//! This module handles the connection lifecycle and event dispatch.

use crate::auth::{AuthVerifier, StaticTokenVerifier};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use huddle_core::rooms::RoomError;
use huddle_core::{
    call_room, conversation_room, CallManager, InitiateRequest, MemoryStore, MessagePipeline,
    PresenceRegistry, RoomRegistry, RoomsConfig, SignalRelay, Store, UserProfile,
};
use huddle_protocol::{codec, codes, ClientEvent, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub pipeline: MessagePipeline,
    pub calls: CallManager,
    pub relay: SignalRelay,
    pub verifier: StaticTokenVerifier,
}

impl AppState {
    /// Create new app state, seeding the store with provisioned accounts.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let verifier = StaticTokenVerifier::from_config(&config.auth);

        let memory = Arc::new(MemoryStore::new());
        for profile in verifier.profiles() {
            memory.add_user(profile);
        }
        let store: Arc<dyn Store> = memory;

        let presence = Arc::new(PresenceRegistry::new(store.clone()));
        let rooms = Arc::new(RoomRegistry::with_config(RoomsConfig {
            room_capacity: config.limits.room_capacity,
            max_rooms_per_connection: config.limits.max_rooms_per_connection,
        }));
        let pipeline = MessagePipeline::new(store.clone(), presence.clone(), rooms.clone());
        let calls = CallManager::new(store.clone(), presence.clone());
        let relay = SignalRelay::new(presence.clone(), rooms.clone());

        Self {
            config,
            store,
            presence,
            rooms,
            pipeline,
            calls,
            relay,
            verifier,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
///
/// Verifies the `?token=` query parameter before upgrading; bad or missing
/// tokens are rejected with 401.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = params.get("token").map(String::as_str).unwrap_or_default();
    match state.verifier.verify(token).await {
        Ok(user) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, user))
            .into_response(),
        Err(e) => {
            debug!(error = %e, "WebSocket upgrade rejected");
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: UserProfile) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!("conn_{}", uuid::Uuid::new_v4().simple());

    debug!(connection = %connection_id, user = %user.id, "WebSocket connected");

    // Single outbox per connection: presence routing and room forwarding
    // both feed it, the select loop below drains it onto the socket.
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Arc<ServerEvent>>();

    if let Some(old) = state
        .presence
        .connect(user.id.clone(), connection_id.clone(), outbox_tx.clone())
    {
        debug!(connection = %connection_id, superseded = %old, "Superseded prior connection");
    }

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Send the hello
    let hello = ServerEvent::Connected {
        user_id: user.id.clone(),
        connection_id: connection_id.clone(),
        heartbeat_ms: state.config.heartbeat.interval_ms,
    };
    if let Ok(data) = codec::encode(&hello) {
        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
            error!(connection = %connection_id, "Failed to send hello");
            // No rooms joined yet; everything else tears down as usual.
            teardown(&state, &connection_id, HashMap::new()).await;
            return;
        }
    }

    // Track room forwarding task handles for cleanup
    let mut room_tasks: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    // Auto-subscribe to every conversation the user participates in
    match state.store.conversations_for_user(&user.id).await {
        Ok(conversations) => {
            for conversation in conversations {
                join_room(
                    &state,
                    &connection_id,
                    &conversation_room(&conversation.id),
                    &mut room_tasks,
                    &outbox_tx,
                );
            }
        }
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Conversation lookup failed");
        }
    }

    // Announce presence to everyone else
    let online = Arc::new(ServerEvent::UserOnline {
        user_id: user.id.clone(),
    });
    state.presence.broadcast(&online, &user.id);

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Event processing loop
    loop {
        tokio::select! {
            biased;

            // Events routed to this connection (presence sends, room fan-out)
            Some(event) = outbox_rx.recv() => {
                match codec::encode(&*event) {
                    Ok(data) => {
                        metrics::record_event(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Outbound encode failed");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        if !buffer_frame(&mut read_buffer, &data, state.config.limits.max_message_size) {
                            warn!(connection = %connection_id, len = data.len(), "Inbound frame over size limit");
                            metrics::record_error("oversize");
                            let _ = outbox_tx.send(Arc::new(ServerEvent::error(
                                codes::BAD_REQUEST,
                                "frame too large",
                            )));
                            continue;
                        }
                        metrics::record_event(data.len(), "inbound");

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    handle_event(
                                        &state,
                                        &user,
                                        &connection_id,
                                        event,
                                        &mut room_tasks,
                                        &outbox_tx,
                                    ).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Malformed frame");
                                    metrics::record_error("decode");
                                    let _ = outbox_tx.send(Arc::new(ServerEvent::error(
                                        codes::BAD_REQUEST,
                                        "malformed frame",
                                    )));
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.presence.touch(&connection_id);
                    }
                    Some(Ok(Message::Text(_))) => {
                        // Binary-only protocol
                        warn!(connection = %connection_id, "Ignoring text frame");
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, &connection_id, room_tasks).await;
}

/// Release everything a connection holds: forwarding tasks, room
/// subscriptions, presence, and any live calls.
async fn teardown(
    state: &AppState,
    connection_id: &str,
    room_tasks: HashMap<String, tokio::task::JoinHandle<()>>,
) {
    for (_, handle) in room_tasks {
        handle.abort();
    }
    state.rooms.unsubscribe_all(connection_id);
    metrics::set_active_rooms(state.rooms.room_count());

    // A superseded connection must not tear down its successor's presence.
    if let Some(user_id) = state.presence.disconnect(connection_id) {
        state.calls.handle_disconnect(&user_id).await;
        metrics::set_active_calls(state.calls.active_count());

        let now = Utc::now();
        if let Err(e) = state.store.set_user_presence(&user_id, false, now).await {
            warn!(user = %user_id, error = %e, "Presence write failed on disconnect");
        }

        let offline = Arc::new(ServerEvent::UserOffline {
            user_id: user_id.clone(),
            last_seen: now.timestamp_millis(),
        });
        state.presence.broadcast(&offline, &user_id);
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch one decoded client event.
async fn handle_event(
    state: &AppState,
    user: &UserProfile,
    connection_id: &str,
    event: ClientEvent,
    room_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    outbox_tx: &mpsc::UnboundedSender<Arc<ServerEvent>>,
) {
    match event {
        ClientEvent::SendMessage {
            conversation_id,
            content,
            kind,
            reply_to,
        } => {
            if let Err(e) = state
                .pipeline
                .send_message(&user.id, &conversation_id, content, kind, reply_to)
                .await
            {
                report(outbox_tx, e);
            }
        }

        ClientEvent::TypingStart { conversation_id } => {
            state.rooms.publish(
                &conversation_room(&conversation_id),
                ServerEvent::UserTyping {
                    conversation_id,
                    user_id: user.id.clone(),
                },
            );
        }

        ClientEvent::TypingStop { conversation_id } => {
            state.rooms.publish(
                &conversation_room(&conversation_id),
                ServerEvent::UserStoppedTyping {
                    conversation_id,
                    user_id: user.id.clone(),
                },
            );
        }

        ClientEvent::MessagesRead { conversation_id } => {
            if let Err(e) = state.pipeline.mark_read(&conversation_id, &user.id).await {
                report(outbox_tx, e);
            }
        }

        ClientEvent::CallUser {
            user_to_call,
            conversation_id,
            is_group,
            signal_data,
            call_type,
            call_id,
        } => {
            let request = InitiateRequest {
                call_id,
                user_to_call,
                conversation_id,
                is_group,
                kind: call_type,
                signal: signal_data,
            };
            match state.calls.initiate(&user.id, request).await {
                Ok(_) => metrics::set_active_calls(state.calls.active_count()),
                Err(e) => report(outbox_tx, e),
            }
        }

        ClientEvent::AnswerCall {
            signal,
            to: _,
            call_id,
        } => {
            if let Err(e) = state.calls.accept(&call_id, &user.id, signal).await {
                report(outbox_tx, e);
            }
        }

        ClientEvent::IceCandidate { candidate, to } => {
            state.relay.relay_to_user(
                &user.id,
                &to,
                ServerEvent::IceCandidate {
                    candidate,
                    from: user.id.clone(),
                },
            );
        }

        ClientEvent::RejectCall { to: _, call_id } => {
            match state.calls.reject(&call_id, &user.id).await {
                Ok(_) => metrics::set_active_calls(state.calls.active_count()),
                Err(e) => report(outbox_tx, e),
            }
        }

        ClientEvent::EndCall { to: _, call_id } => {
            match state.calls.end(&call_id, &user.id).await {
                Ok(_) => metrics::set_active_calls(state.calls.active_count()),
                Err(e) => report(outbox_tx, e),
            }
        }

        ClientEvent::UserBusy { to, call_id } => {
            // Client-side busy report, relayed verbatim
            state.relay.relay_to_user(
                &user.id,
                &to,
                ServerEvent::UserBusy {
                    from: user.id.clone(),
                    call_id,
                },
            );
        }

        ClientEvent::JoinCallRoom { room_id } => {
            let key = call_room(&room_id);
            // Publish before subscribing so the joiner does not echo itself
            state.rooms.publish(
                &key,
                ServerEvent::UserJoinedCall {
                    room_id,
                    user_id: user.id.clone(),
                    user_name: user.name.clone(),
                },
            );
            join_room(state, connection_id, &key, room_tasks, outbox_tx);
        }

        ClientEvent::LeaveCallRoom { room_id } => {
            let key = call_room(&room_id);
            leave_room(state, connection_id, &key, room_tasks);
            state.rooms.publish(
                &key,
                ServerEvent::UserLeftCall {
                    room_id,
                    user_id: user.id.clone(),
                    user_name: user.name.clone(),
                },
            );
        }

        ClientEvent::GroupCallSignal {
            room_id,
            user_to_signal,
            signal,
        } => {
            state.relay.relay_to_user(
                &user.id,
                &user_to_signal,
                ServerEvent::GroupCallSignal {
                    signal,
                    from: user.id.clone(),
                    room_id,
                },
            );
        }

        ClientEvent::GroupCallReturnSignal { to, signal } => {
            state.relay.relay_to_user(
                &user.id,
                &to,
                ServerEvent::GroupCallSignalReturned {
                    signal,
                    from: user.id.clone(),
                },
            );
        }

        ClientEvent::ScreenShareStarted {
            conversation_id,
            room_id,
        } => {
            state.relay.relay_to_room(
                &call_room(&room_id),
                ServerEvent::ScreenShareStarted {
                    conversation_id,
                    room_id,
                    user_id: user.id.clone(),
                },
            );
        }

        ClientEvent::ScreenShareStopped {
            conversation_id,
            room_id,
        } => {
            state.relay.relay_to_room(
                &call_room(&room_id),
                ServerEvent::ScreenShareStopped {
                    conversation_id,
                    room_id,
                    user_id: user.id.clone(),
                },
            );
        }

        ClientEvent::JoinConversation { conversation_id } => {
            match state.store.get_conversation(&conversation_id).await {
                Ok(Some(conversation)) if conversation.is_participant(&user.id) => {
                    join_room(
                        state,
                        connection_id,
                        &conversation_room(&conversation_id),
                        room_tasks,
                        outbox_tx,
                    );
                }
                Ok(Some(_)) => {
                    let _ = outbox_tx.send(Arc::new(ServerEvent::error(
                        codes::UNAUTHORIZED,
                        format!("not a participant of {conversation_id}"),
                    )));
                }
                Ok(None) => {
                    let _ = outbox_tx.send(Arc::new(ServerEvent::error(
                        codes::NOT_FOUND,
                        format!("unknown conversation {conversation_id}"),
                    )));
                }
                Err(e) => report(outbox_tx, e.into()),
            }
        }

        ClientEvent::LeaveConversation { conversation_id } => {
            leave_room(
                state,
                connection_id,
                &conversation_room(&conversation_id),
                room_tasks,
            );
        }

        ClientEvent::Ping => {
            state.presence.touch(connection_id);
            let _ = outbox_tx.send(Arc::new(ServerEvent::Pong));
        }
    }
}

/// Subscribe the connection to a room and spawn a task forwarding the
/// room's broadcast stream into the connection outbox.
fn join_room(
    state: &AppState,
    connection_id: &str,
    room_key: &str,
    room_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    outbox_tx: &mpsc::UnboundedSender<Arc<ServerEvent>>,
) {
    match state.rooms.subscribe(connection_id, room_key) {
        Ok(mut rx) => {
            let tx = outbox_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                break; // Receiver dropped
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            });
            if let Some(old) = room_tasks.insert(room_key.to_string(), handle) {
                old.abort();
            }
            metrics::set_active_rooms(state.rooms.room_count());
        }
        // Re-opening a conversation view re-sends join-conversation; an
        // existing subscription is already the requested state.
        Err(RoomError::AlreadySubscribed(_)) => {
            debug!(connection = %connection_id, room = %room_key, "Already subscribed");
        }
        Err(e) => {
            debug!(connection = %connection_id, room = %room_key, error = %e, "Subscribe skipped");
            let _ = outbox_tx.send(Arc::new(ServerEvent::error(
                codes::BAD_REQUEST,
                e.to_string(),
            )));
        }
    }
}

/// Drop a room subscription and its forwarding task.
fn leave_room(
    state: &AppState,
    connection_id: &str,
    room_key: &str,
    room_tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) {
    if let Some(handle) = room_tasks.remove(room_key) {
        handle.abort();
    }
    if let Err(e) = state.rooms.unsubscribe(connection_id, room_key) {
        debug!(connection = %connection_id, room = %room_key, error = %e, "Unsubscribe skipped");
    }
    metrics::set_active_rooms(state.rooms.room_count());
}

/// Stage an inbound frame for decoding, refusing anything over the
/// configured size limit.
fn buffer_frame(read_buffer: &mut BytesMut, data: &[u8], limit: usize) -> bool {
    if data.len() > limit {
        return false;
    }
    read_buffer.extend_from_slice(data);
    true
}

/// Push a structured error report onto the connection outbox.
fn report(outbox_tx: &mpsc::UnboundedSender<Arc<ServerEvent>>, error: huddle_core::CoreError) {
    metrics::record_error("core");
    let _ = outbox_tx.send(Arc::new(ServerEvent::error(
        error.code(),
        error.to_string(),
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthUser};

    fn test_config() -> Config {
        Config {
            auth: AuthConfig {
                users: vec![
                    AuthUser {
                        token: "t-alice".to_string(),
                        id: "alice".to_string(),
                        name: "Alice".to_string(),
                        avatar_url: None,
                    },
                    AuthUser {
                        token: "t-bob".to_string(),
                        id: "bob".to_string(),
                        name: "Bob".to_string(),
                        avatar_url: None,
                    },
                ],
            },
            ..Config::default()
        }
    }

    fn connect(state: &AppState, user: &str) -> mpsc::UnboundedReceiver<Arc<ServerEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.presence.connect(user, format!("conn-{user}"), tx);
        rx
    }

    fn profile(id: &str, name: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            name: name.to_string(),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn test_state_seeds_provisioned_users() {
        let state = AppState::new(test_config());
        let alice = state.store.get_user("alice").await.unwrap();
        assert_eq!(alice.unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn test_ping_pongs_on_outbox() {
        let state = AppState::new(test_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();

        handle_event(
            &state,
            &profile("alice", "Alice"),
            "conn-alice",
            ClientEvent::Ping,
            &mut tasks,
            &tx,
        )
        .await;

        assert!(matches!(*rx.recv().await.unwrap(), ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_unknown_conversation_reports_not_found() {
        let state = AppState::new(test_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();

        handle_event(
            &state,
            &profile("alice", "Alice"),
            "conn-alice",
            ClientEvent::SendMessage {
                conversation_id: "nope".to_string(),
                content: "hi".to_string(),
                kind: huddle_protocol::MessageKind::Text,
                reply_to: None,
            },
            &mut tasks,
            &tx,
        )
        .await;

        match &*rx.recv().await.unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(*code, codes::NOT_FOUND),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ice_candidate_relays_to_target() {
        let state = AppState::new(test_config());
        let mut bob_rx = connect(&state, "bob");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();

        handle_event(
            &state,
            &profile("alice", "Alice"),
            "conn-alice",
            ClientEvent::IceCandidate {
                candidate: serde_json::json!({"candidate": "..."}),
                to: "bob".to_string(),
            },
            &mut tasks,
            &tx,
        )
        .await;

        match &*bob_rx.recv().await.unwrap() {
            ServerEvent::IceCandidate { from, .. } => assert_eq!(from, "alice"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_room_membership_events() {
        let state = AppState::new(test_config());
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let mut alice_tasks = HashMap::new();
        let alice = profile("alice", "Alice");

        // Alice joins first, then Bob; Alice sees Bob's join, not her own.
        handle_event(
            &state,
            &alice,
            "conn-alice",
            ClientEvent::JoinCallRoom {
                room_id: "room_1".to_string(),
            },
            &mut alice_tasks,
            &alice_tx,
        )
        .await;

        let (bob_tx, _bob_rx) = mpsc::unbounded_channel();
        let mut bob_tasks = HashMap::new();
        handle_event(
            &state,
            &profile("bob", "Bob"),
            "conn-bob",
            ClientEvent::JoinCallRoom {
                room_id: "room_1".to_string(),
            },
            &mut bob_tasks,
            &bob_tx,
        )
        .await;

        match &*alice_rx.recv().await.unwrap() {
            ServerEvent::UserJoinedCall { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(state.rooms.subscriber_count(&call_room("room_1")), 2);

        handle_event(
            &state,
            &profile("bob", "Bob"),
            "conn-bob",
            ClientEvent::LeaveCallRoom {
                room_id: "room_1".to_string(),
            },
            &mut bob_tasks,
            &bob_tx,
        )
        .await;

        match &*alice_rx.recv().await.unwrap() {
            ServerEvent::UserLeftCall { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_conversation_requires_membership() {
        let state = AppState::new(test_config());
        // Seed via the private-conversation path
        let conversation = state
            .store
            .find_or_create_private("alice", "bob")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();

        handle_event(
            &state,
            &profile("mallory", "Mallory"),
            "conn-mallory",
            ClientEvent::JoinConversation {
                conversation_id: conversation.id.clone(),
            },
            &mut tasks,
            &tx,
        )
        .await;

        match &*rx.recv().await.unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(*code, codes::UNAUTHORIZED),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_typing_fans_out_to_conversation_room() {
        let state = AppState::new(test_config());
        let conversation = state
            .store
            .find_or_create_private("alice", "bob")
            .await
            .unwrap();
        let conversation_id = conversation.id.clone();

        let key = conversation_room(&conversation_id);
        let mut room_rx = state.rooms.subscribe("conn-bob", &key).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        handle_event(
            &state,
            &profile("alice", "Alice"),
            "conn-alice",
            ClientEvent::TypingStart {
                conversation_id: conversation_id.clone(),
            },
            &mut tasks,
            &tx,
        )
        .await;

        match &*room_rx.recv().await.unwrap() {
            ServerEvent::UserTyping { user_id, .. } => assert_eq!(user_id, "alice"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejoin_conversation_is_silent() {
        let state = AppState::new(test_config());
        let conversation = state
            .store
            .find_or_create_private("alice", "bob")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        let alice = profile("alice", "Alice");

        // Re-opening the conversation view re-sends join-conversation.
        for _ in 0..2 {
            handle_event(
                &state,
                &alice,
                "conn-alice",
                ClientEvent::JoinConversation {
                    conversation_id: conversation.id.clone(),
                },
                &mut tasks,
                &tx,
            )
            .await;
        }

        assert!(rx.try_recv().is_err(), "rejoin emitted an event");
        assert_eq!(
            state
                .rooms
                .subscriber_count(&conversation_room(&conversation.id)),
            1
        );
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_reconciles_presence_and_calls() {
        let state = AppState::new(test_config());
        let _alice_rx = connect(&state, "alice");
        let mut bob_rx = connect(&state, "bob");

        let call = state
            .calls
            .initiate(
                "alice",
                InitiateRequest {
                    call_id: None,
                    user_to_call: Some("bob".to_string()),
                    conversation_id: None,
                    is_group: false,
                    kind: huddle_protocol::CallKind::Video,
                    signal: serde_json::json!({"sdp": "offer"}),
                },
            )
            .await
            .unwrap();
        let _ = bob_rx.recv().await.unwrap();
        state
            .calls
            .accept(&call.id, "bob", serde_json::json!({}))
            .await
            .unwrap();

        teardown(&state, "conn-alice", HashMap::new()).await;

        assert!(!state.presence.is_online("alice"));
        match &*bob_rx.recv().await.unwrap() {
            ServerEvent::CallEnded { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("disconnect"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &*bob_rx.recv().await.unwrap() {
            ServerEvent::UserOffline { user_id, .. } => assert_eq!(user_id, "alice"),
            other => panic!("unexpected event: {other:?}"),
        }
        let stored = state.store.get_call(&call.id).await.unwrap().unwrap();
        assert_eq!(stored.status, huddle_core::CallStatus::Ended);
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let mut buffer = BytesMut::new();
        assert!(!buffer_frame(&mut buffer, &[0u8; 64], 16));
        assert!(buffer.is_empty());
        assert!(buffer_frame(&mut buffer, &[0u8; 16], 16));
        assert_eq!(buffer.len(), 16);
    }
}
