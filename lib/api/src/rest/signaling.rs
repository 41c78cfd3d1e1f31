//! Web routes for the peer-to-peer signaling sessions.
//!
//! Unlike the callback endpoint these fail loudly: every operation carries
//! the session's bearer token and bad input gets a 4xx.

use std::{convert::Infallible, sync::Arc, time::Duration};

use aggregator::signaling::{
    SessionDescriptor, SessionId, SignalingError, SignalingSessions,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use utoipa::OpenApi;

use super::api_resource::RoutedResource;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(OpenApi)]
#[openapi(
    paths(
        create_session,
        probe_session,
        session_stream,
        post_signal,
    ),
    components(
        schemas(
            SessionDescriptor,
            SessionId,
            SessionProbe,
            SignalRequest,
        ),
    ),
    tags(
        (name = "Signaling", description = "Peer-to-peer signaling session API")
    )
)]
pub(crate) struct SignalingResource;

impl RoutedResource for SignalingResource {
    /// Create routes for the signaling sessions.
    fn routes() -> Router {
        Router::new().nest(
            "/aggregate/webrtc",
            Router::new()
                .route("/create", post(create_session))
                .route(
                    "/:session_id",
                    get(probe_session),
                )
                .route("/:session_id/stream", get(session_stream))
                .route("/:session_id/signal", post(post_signal)),
        )
    }
}

const fn signaling_status(error: &SignalingError) -> StatusCode {
    match error {
        SignalingError::NotFound => StatusCode::NOT_FOUND,
        SignalingError::Unauthorized => StatusCode::UNAUTHORIZED,
        SignalingError::Conflict => StatusCode::CONFLICT,
    }
}

#[utoipa::path(
    post,
    path = "/aggregate/webrtc/create",
    tag = "Signaling",
    responses(
        (status = 200, content_type = "application/json", description = "The created session with its bearer token", body = SessionDescriptor),
    )
)]
#[tracing::instrument(level = "info", skip(sessions))]
async fn create_session(
    sessions: Extension<Arc<SignalingSessions>>,
) -> Json<SessionDescriptor> {
    Json(sessions.create())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
struct SessionProbe {
    session_id: SessionId,
    ttl_remaining_seconds: u64,
}

#[utoipa::path(
    get,
    path = "/aggregate/webrtc/{session_id}",
    tag = "Signaling",
    params(
        ("session_id" = SessionId, Path, description = "The session to probe"),
        ("token" = String, Query, description = "The session's bearer token"),
    ),
    responses(
        (status = 200, content_type = "application/json", description = "The session is alive", body = SessionProbe),
        (status = 401, description = "Invalid token"),
        (status = 404, description = "Unknown or expired session"),
    )
)]
#[tracing::instrument(level = "info", skip(sessions, query))]
async fn probe_session(
    Path(session_id): Path<SessionId>,
    Query(query): Query<TokenQuery>,
    sessions: Extension<Arc<SignalingSessions>>,
) -> Result<Json<SessionProbe>, StatusCode> {
    sessions
        .ttl_remaining(&session_id, &query.token)
        .map(|remaining| {
            Json(SessionProbe {
                session_id,
                ttl_remaining_seconds: remaining.as_secs(),
            })
        })
        .map_err(|error| signaling_status(&error))
}

#[utoipa::path(
    get,
    path = "/aggregate/webrtc/{session_id}/stream",
    tag = "Signaling",
    params(
        ("session_id" = SessionId, Path, description = "The session to attach to"),
        ("token" = String, Query, description = "The session's bearer token"),
    ),
    responses(
        (status = 200, content_type = "text/event-stream", description = "Stream of signal payloads posted after subscription"),
        (status = 401, description = "Invalid token"),
        (status = 404, description = "Unknown or expired session"),
        (status = 409, description = "The session already has both subscribers"),
    )
)]
#[tracing::instrument(level = "info", skip(sessions, query))]
async fn session_stream(
    Path(session_id): Path<SessionId>,
    Query(query): Query<TokenQuery>,
    sessions: Extension<Arc<SignalingSessions>>,
) -> Response {
    match sessions.subscribe(&session_id, &query.token) {
        Err(error) => signaling_status(&error).into_response(),
        Ok(signals) => {
            let stream = ReceiverStream::new(signals).filter_map(|payload| async move {
                match Event::default().json_data(&payload) {
                    Ok(message) => Some(Ok::<_, Infallible>(message)),
                    Err(error) => {
                        tracing::error!(%error, "could not serialize signal payload");
                        None
                    }
                }
            });
            Sse::new(stream)
                .keep_alive(
                    KeepAlive::new()
                        .interval(KEEP_ALIVE_INTERVAL)
                        .text("keep-alive"),
                )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
struct SignalRequest {
    token: String,
    #[schema(value_type = Object)]
    payload: serde_json::Value,
}

#[utoipa::path(
    post,
    path = "/aggregate/webrtc/{session_id}/signal",
    tag = "Signaling",
    request_body = SignalRequest,
    params(
        ("session_id" = SessionId, Path, description = "The session to signal on"),
    ),
    responses(
        (status = 204, description = "Payload fanned out to all live subscribers"),
        (status = 401, description = "Invalid token"),
        (status = 404, description = "Unknown or expired session"),
    )
)]
#[tracing::instrument(level = "info", skip(sessions, request))]
async fn post_signal(
    Path(session_id): Path<SessionId>,
    sessions: Extension<Arc<SignalingSessions>>,
    Json(request): Json<SignalRequest>,
) -> Result<StatusCode, StatusCode> {
    sessions
        .signal(&session_id, &request.token, request.payload)
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|error| signaling_status(&error))
}
