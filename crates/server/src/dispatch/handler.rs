//! WebSocket handler for Axum
//!
//! Upgrades connections after credential verification, tenant resolution,
//! and admission checks, then runs one receive loop per connection. Each
//! connection gets its own send task; closing a connection aborts that
//! task without disturbing other sessions.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use livedesk_shared::{AgentStatus, CoreError, CoreResult};

use crate::auth::{Credential, Principal};
use crate::presence::ConnectionSession;
use crate::state::AppState;

use super::{
    connection::{ConnectionPhase, PhaseTracker},
    events::{ChatMessageEvent, ClientEvent, ServerEvent},
};

/// Credential material arrives as query parameters; exactly one of the
/// three shapes must be present.
#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
    plugin_key: Option<String>,
    member_id: Option<String>,
    api_key: Option<String>,
    api_secret: Option<String>,
}

fn credential_from_query(params: &WebSocketQuery) -> Option<Credential> {
    match params {
        WebSocketQuery {
            token: Some(token), ..
        } => Some(Credential::Bearer {
            token: token.clone(),
        }),
        WebSocketQuery {
            plugin_key: Some(key),
            member_id: Some(member_id),
            ..
        } => Some(Credential::PluginKey {
            key: key.clone(),
            member_id: member_id.clone(),
        }),
        WebSocketQuery {
            api_key: Some(key),
            api_secret: Some(secret),
            ..
        } => Some(Credential::ApiKey {
            key: key.clone(),
            secret: secret.clone(),
        }),
        _ => None,
    }
}

/// Empty allow-list admits every origin; browsers always send the header,
/// non-browser clients (backends) usually omit it and pass.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match headers.get("origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => allowed.iter().any(|a| a == origin),
        None => true,
    }
}

fn refusal_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::InvalidCredential
        | CoreError::ExpiredCredential
        | CoreError::RevokedCredential
        | CoreError::UnknownTenant => StatusCode::UNAUTHORIZED,
        CoreError::Banned => StatusCode::FORBIDDEN,
        CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        CoreError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// WebSocket handler: authenticates from query parameters, then upgrades.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let Some(credential) = credential_from_query(&params) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let principal = state.verifier.verify(&credential).await.map_err(|e| {
        tracing::warn!(error = %e, "connection refused: credential rejected");
        refusal_status(&e)
    })?;

    let tenant = state.resolver.resolve(&principal).await.map_err(|e| {
        tracing::warn!(error = %e, "connection refused: tenant resolution failed");
        refusal_status(&e)
    })?;

    if !origin_allowed(&headers, &tenant.allowed_origins) {
        tracing::warn!(org_id = %tenant.org_id, "connection refused: origin not allowed");
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .guard
        .check_connection(&tenant, &principal.rate_key())
        .await
        .map_err(|e| {
            tracing::warn!(rate_key = %principal.rate_key(), error = %e, "connection refused by guard");
            refusal_status(&e)
        })?;

    tracing::info!(
        org_id = %tenant.org_id,
        principal = %principal.kind(),
        "WebSocket connection upgrade requested"
    );
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, principal, tenant, state)))
}

/// Handle one upgraded WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    principal: Principal,
    tenant: crate::tenant::TenantContext,
    state: AppState,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let phase = PhaseTracker::new();
    if phase.advance(ConnectionPhase::Authenticated).is_err() {
        return;
    }

    // Agents carry a per-agent concurrency limit; best-effort read
    let concurrency_limit = match principal.agent_id() {
        Some(agent_id) => state
            .tenants
            .agent_by_id(agent_id)
            .await
            .ok()
            .flatten()
            .and_then(|a| a.concurrency_limit),
        None => None,
    };

    let org_id = tenant.org_id;
    let outcome = match state
        .registry
        .register(principal, tenant, tx, concurrency_limit)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "failed to register session");
            return;
        }
    };
    let session = outcome.session;
    let session_id = session.session_id;

    if phase.advance(ConnectionPhase::Ready).is_err() {
        let _ = state.registry.deregister(session_id).await;
        return;
    }
    let _ = session.send(ServerEvent::Connected { session_id });

    if outcome.agent_came_online {
        if let Some(agent_id) = session.principal.agent_id() {
            state
                .broadcast_agent_status(org_id, agent_id, AgentStatus::Online)
                .await;
            // A fresh agent may unblock the waiting queue
            if let Err(e) = state.router.sweep_waiting(org_id).await {
                tracing::warn!(org_id = %org_id, error = ?e, "waiting sweep after agent online failed");
            }
        }
    }

    // Outbound pump: serialize and forward until the channel closes
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "failed to serialize outbound event");
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                session.touch().await;
                if let Err(e) = phase.ensure_ready() {
                    let _ = session.send(ServerEvent::from_error(&e));
                    continue;
                }
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        if let Err(e) = handle_client_event(event, &session, &state).await {
                            let _ = session.send(ServerEvent::from_error(&e));
                            if e.refuses_connection() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "failed to parse client event");
                        let _ = session.send(ServerEvent::from_error(&CoreError::BadRequest(
                            "invalid event format".to_string(),
                        )));
                    }
                }
            }
            Message::Close(_) => {
                tracing::info!(session_id = %session_id, "close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                session.touch().await;
            }
            _ => {}
        }
    }

    let _ = phase.advance(ConnectionPhase::Closing);
    tracing::info!(session_id = %session_id, "WebSocket connection closing");
    cleanup_session(&state, session_id).await;
    send_task.abort();
}

/// Deregister a session and unwind its side effects: typing state, agent
/// presence fan-out, and reassignment of the agent's conversations. Also
/// invoked by the idle sweep, so it must be safe after the session is gone.
pub async fn cleanup_session(state: &AppState, session_id: Uuid) {
    state.router.clear_typing_for_session(session_id).await;

    let outcome = match state.registry.deregister(session_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "deregistration failed");
            return;
        }
    };
    if !outcome.existed {
        return;
    }

    if let (Some(org_id), Some(agent_id)) = (outcome.org_id, outcome.agent_went_offline) {
        state
            .broadcast_agent_status(org_id, agent_id, AgentStatus::Offline)
            .await;
        if let Err(e) = state.router.reassign_on_disconnect(org_id, agent_id).await {
            tracing::warn!(
                org_id = %org_id,
                agent_id = %agent_id,
                error = ?e,
                "reassignment after disconnect failed"
            );
        }
    }
}

/// Route one parsed client event.
async fn handle_client_event(
    event: ClientEvent,
    session: &Arc<ConnectionSession>,
    state: &AppState,
) -> CoreResult<()> {
    use ClientEvent::*;

    let org_id = session.tenant.org_id;
    match event {
        JoinChat { conversation_id } => {
            state.router.join(session, conversation_id).await?;
            tracing::debug!(
                session_id = %session.session_id,
                conversation_id = %conversation_id,
                "joined conversation room"
            );
            Ok(())
        }

        LeaveChat { conversation_id } => state.router.leave(session, conversation_id).await,

        SendMessage {
            conversation_id,
            content,
            is_internal,
            message_type,
        } => {
            state
                .guard
                .check_message(&session.tenant, &session.principal.rate_key())
                .await?;
            let routed = state
                .router
                .route_message(session, conversation_id, &content, is_internal, message_type)
                .await?;

            let event = ServerEvent::NewMessage {
                conversation_id,
                message: ChatMessageEvent::from(&routed.record),
            };
            for target in &routed.targets {
                if target.send(event.clone()).is_err() {
                    tracing::warn!(
                        session_id = %target.session_id,
                        "failed to deliver message to room member (likely closed)"
                    );
                }
            }
            Ok(())
        }

        TypingStart { conversation_id } => state.router.typing_start(session, conversation_id).await,

        TypingStop { conversation_id } => state.router.typing_stop(session, conversation_id).await,

        MarkRead {
            conversation_id,
            up_to_seq,
        } => {
            let (up_to, count, reader) = state
                .router
                .mark_read(session, conversation_id, up_to_seq)
                .await?;
            if count > 0 {
                state
                    .registry
                    .broadcast_room(
                        org_id,
                        conversation_id,
                        ServerEvent::MessageRead {
                            conversation_id,
                            reader,
                            up_to_seq: up_to,
                        },
                    )
                    .await;
            }
            Ok(())
        }

        CloseChat { conversation_id } => {
            state.router.close(session, conversation_id).await?;
            let closed_by = session
                .principal
                .agent_id()
                .ok_or_else(|| CoreError::Forbidden("agents only".to_string()))?;
            state
                .registry
                .broadcast_room(
                    org_id,
                    conversation_id,
                    ServerEvent::ChatClosed {
                        conversation_id,
                        closed_by: Some(closed_by),
                    },
                )
                .await;
            Ok(())
        }

        AssignChat {
            conversation_id,
            agent_id,
        } => {
            state
                .router
                .manual_assign(session, conversation_id, agent_id)
                .await
        }

        StatusChange { status } => {
            let Some(agent_id) = session.principal.agent_id() else {
                return Err(CoreError::Forbidden(
                    "only agents have an availability status".to_string(),
                ));
            };
            state
                .registry
                .set_agent_status(org_id, agent_id, status)
                .await?;
            state.broadcast_agent_status(org_id, agent_id, status).await;
            if status == AgentStatus::Online {
                state.router.sweep_waiting(org_id).await?;
            }
            Ok(())
        }

        Ping => {
            let _ = session.send(ServerEvent::Pong);
            Ok(())
        }
    }
}
