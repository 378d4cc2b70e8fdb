//! Component F: the connection frontend and authentication handshake.
//!
//! Each accepted websocket is split into sink/stream halves. A pre-auth
//! loop accepts only `register`/`auth` frames; on successful `auth` the
//! connection is handed to [`MessageHub::handle_frame`] and subscribed to
//! the filesystem notification stream (§4.F).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use hub_session::SessionId;

use crate::hub::MessageHub;
use crate::protocol::{
    check_version_compatibility, OutboundEnvelope, PreAuthFrame, SERVER_VERSION,
};
use crate::session::SessionStatus;
use crate::state::SharedState;

/// Builds the axum router: the websocket upgrade route plus a liveness
/// check (§10.5: "health/readiness route").
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz(State(state): State<SharedState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
        "connectedAgents": state.identity.connected_count().await,
        "antiEchoEnabled": state.config.enable_anti_echo,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: SharedState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Forward anything queued for this connection to the actual socket.
    // Kept as a separate task so handlers never await the transport while
    // holding a component lock (§5: "must not hold any component lock
    // across the wait").
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let session_id = match run_preauth(&mut stream, &tx, &state).await {
        Some(id) => id,
        None => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let hub = Arc::new(MessageHub::new(Arc::clone(&state)));
    let mut fs_events = state.fs_notifier.subscribe();
    let span = tracing::info_span!("connection", %session_id);

    async {
        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            hub.handle_frame(&session_id, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error");
                            break;
                        }
                    }
                }
                notification = fs_events.recv() => {
                    if let Ok(notification) = notification {
                        if let Some(session) = state.sessions.get(&session_id).await {
                            let envelope = fs_envelope(&notification);
                            hub.send_to(&session, &envelope).await;
                        }
                    }
                }
            }
        }
    }
    .instrument(span)
    .await;

    state.sessions.set_status(&session_id, SessionStatus::Disconnected).await;
    state.sessions.remove(&session_id).await;
    drop(tx);
    let _ = writer.await;
    info!(%session_id, "connection closed");
}

fn fs_envelope(notification: &crate::fsnotify::Notification) -> OutboundEnvelope {
    use crate::fsnotify::NotificationKind;
    match notification.kind {
        NotificationKind::TaskBoardUpdated => OutboundEnvelope::TaskBoardUpdate {
            data: notification.payload.clone(),
        },
        NotificationKind::DiscussionUpdated => OutboundEnvelope::DiscussionUpdate {
            data: notification.payload.clone(),
        },
        NotificationKind::NewMessage => OutboundEnvelope::NewMessageNotification {
            data: notification.payload.clone(),
        },
        NotificationKind::FileChanged => OutboundEnvelope::FileUpdate {
            data: notification.payload.clone(),
        },
    }
}

/// Drives the pre-auth handshake to completion. Returns the new session's
/// id on success, `None` if the connection closed or was rejected before
/// authenticating.
async fn run_preauth(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &SharedState,
) -> Option<SessionId> {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        };

        let parsed: Result<PreAuthFrame, _> = serde_json::from_str(&text);
        let frame = match parsed {
            Ok(frame) => frame,
            Err(_) => {
                let _ = tx.send(Message::Text(
                    OutboundEnvelope::Error {
                        message: "Authentication required".into(),
                    }
                    .to_json(),
                ));
                continue;
            }
        };

        match frame {
            PreAuthFrame::Register { agent_name, role, force_new } => {
                handle_register(agent_name, role, force_new, tx, state).await;
                // Registration is one-shot; close after responding (§4.F).
                return None;
            }
            PreAuthFrame::Auth {
                agent_name,
                auth_token,
                role,
                perspective,
                client_version,
            } => {
                if let Some(session_id) = handle_auth(
                    agent_name,
                    auth_token,
                    role,
                    perspective,
                    client_version,
                    tx,
                    state,
                )
                .await
                {
                    return Some(session_id);
                }
                return None;
            }
        }
    }
    None
}

async fn handle_register(
    agent_name: Option<String>,
    role: Option<String>,
    force_new: bool,
    tx: &mpsc::UnboundedSender<Message>,
    state: &SharedState,
) {
    let Some(agent_name) = agent_name.filter(|n| !n.trim().is_empty()) else {
        let _ = tx.send(Message::Text(
            OutboundEnvelope::RegisterFailed {
                reason: "agent name is required".into(),
                suggestions: None,
            }
            .to_json(),
        ));
        return;
    };
    let role = role.unwrap_or_else(|| "contributor".to_string());

    if !force_new && !state.identity.is_name_available(&agent_name).await {
        let suggestions = state.identity.suggest_names(&agent_name, 3).await;
        let _ = tx.send(Message::Text(
            OutboundEnvelope::RegisterFailed {
                reason: "name-taken".into(),
                suggestions: Some(suggestions),
            }
            .to_json(),
        ));
        return;
    }

    let result = if force_new {
        state.identity.register_new_forced(&agent_name, &role).await
    } else {
        state.identity.register_new(&agent_name, &role).await
    };

    match result {
        Ok(identity) => {
            let _ = tx.send(Message::Text(
                OutboundEnvelope::RegisterSuccess {
                    agent_id: identity.agent_id,
                    agent_name: identity.display_name,
                    auth_token: identity.auth_token,
                    role: identity.current_role,
                }
                .to_json(),
            ));
        }
        Err(e) => {
            let _ = tx.send(Message::Text(
                OutboundEnvelope::RegisterFailed {
                    reason: e.to_string(),
                    suggestions: None,
                }
                .to_json(),
            ));
        }
    }
}

async fn handle_auth(
    agent_name: Option<String>,
    auth_token: Option<String>,
    role: Option<String>,
    perspective: Option<String>,
    client_version: Option<String>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &SharedState,
) -> Option<SessionId> {
    let compat = check_version_compatibility(client_version.as_deref(), SERVER_VERSION);
    let role = role.unwrap_or_else(|| "contributor".to_string());
    let session_id = SessionId::new();

    let create_result = state
        .sessions
        .create(
            session_id.clone(),
            tx.clone(),
            auth_token.as_deref(),
            agent_name.as_deref(),
            &role,
        )
        .await;

    let session = match create_result {
        Ok(session) => session,
        Err(e) => {
            let _ = tx.send(Message::Text(
                OutboundEnvelope::AuthFailed {
                    reason: e.to_string(),
                }
                .to_json(),
            ));
            return None;
        }
    };

    let identity = state.identity.find_by_agent_id(&session.agent_id).await?;
    let is_returning = identity.stats.total_sessions > 1;
    let total_contributions =
        identity.stats.total_messages + identity.stats.total_tasks + identity.stats.total_edits;

    if let Some(perspective) = perspective {
        state.sessions.change_perspective(&session_id, &perspective, None).await;
    } else if state.anti_echo.enabled() {
        let active = state.sessions.active_perspectives().await;
        if let Some(assigned) = state.anti_echo.assign_perspective(&active).await {
            state.sessions.change_perspective(&session_id, &assigned, None).await;
        }
    }

    let _ = tx.send(Message::Text(
        OutboundEnvelope::AuthSuccess {
            agent_id: identity.agent_id.clone(),
            auth_token: identity.auth_token.clone(),
            is_returning,
            total_sessions: identity.stats.total_sessions,
            total_contributions,
            last_seen: identity.last_seen,
            server_version: SERVER_VERSION.to_string(),
            client_version,
            version_warning: compat.warning,
            capabilities: vec!["edit".into(), "task".into(), "vote".into(), "spawn".into()],
        }
        .to_json(),
    ));

    info!(%session_id, agent = %identity.display_name, "session authenticated");

    let hub = MessageHub::new(Arc::clone(state));
    hub.broadcast(
        &OutboundEnvelope::SessionUpdate {
            event: "joined".into(),
            session: json!({
                "sessionId": session_id.to_string(),
                "agentId": identity.agent_id.to_string(),
                "displayName": identity.display_name,
                "role": role,
            }),
        },
        Some(&session_id),
    )
    .await;

    Some(session_id)
}
