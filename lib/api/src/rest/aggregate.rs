//! Web routes for the aggregation flow: accept a request, stream the merged
//! result, receive backend callbacks.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use aggregator::{
    event::{CallbackEvent, CallbackStatus, CorrelationId, JournalNote},
    service::{
        AggregateRequest, AggregateResponse, AggregatorService, Strategy, SubscribeOutcome,
    },
};
use axum::{
    extract::Query,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use utoipa::OpenApi;

use super::api_resource::RoutedResource;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(OpenApi)]
#[openapi(
    paths(
        aggregate_journals,
        stream_events,
        record_callback,
    ),
    components(
        schemas(
            AggregateRequest,
            AggregateResponse,
            CallbackEvent,
            CallbackStatus,
            CorrelationId,
            JournalNote,
            Strategy,
        ),
    ),
    tags(
        (name = "Aggregate", description = "Journal aggregation API")
    )
)]
pub(crate) struct AggregateResource;

impl RoutedResource for AggregateResource {
    /// Create routes for the aggregation flow.
    fn routes() -> Router {
        Router::new().nest(
            "/aggregate",
            Router::new()
                .route("/journals", post(aggregate_journals))
                .route("/stream", get(stream_events))
                .route("/callback", post(record_callback)),
        )
    }
}

#[utoipa::path(
    post,
    path = "/aggregate/journals",
    tag = "Aggregate",
    request_body = AggregateRequest,
    responses(
        (status = 200, content_type = "application/json", description = "Aggregation accepted; stream events under the returned correlation id", body = AggregateResponse),
        (status = 500, description = "The aggregation could not be started"),
    )
)]
#[tracing::instrument(level = "info", skip(service, request), fields(patient_id = %request.patient_id))]
async fn aggregate_journals(
    service: Extension<AggregatorService>,
    Json(request): Json<AggregateRequest>,
) -> Result<Json<AggregateResponse>, StatusCode> {
    service.aggregate(request).await.map(Json).map_err(|error| {
        tracing::error!(%error, "could not start aggregation");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    correlation_id: CorrelationId,
}

#[utoipa::path(
    get,
    path = "/aggregate/stream",
    tag = "Aggregate",
    params(
        ("correlationId" = CorrelationId, Query, description = "Correlation id returned by the aggregate endpoint"),
    ),
    responses(
        (status = 200, content_type = "text/event-stream", description = "Event stream terminated by a COMPLETE summary; empty if the correlation already terminated"),
        (status = 409, description = "The stream already has a subscriber"),
    )
)]
#[tracing::instrument(level = "info", skip(service))]
async fn stream_events(
    Query(query): Query<StreamQuery>,
    service: Extension<AggregatorService>,
) -> Response {
    match service.subscribe(&query.correlation_id) {
        // The client may arrive after termination: an empty stream that
        // closes right away, not an error.
        SubscribeOutcome::Unknown => sse_response(stream::empty().boxed()),
        SubscribeOutcome::Conflict => StatusCode::CONFLICT.into_response(),
        SubscribeOutcome::Stream(events) => sse_response(
            CorrelationStream::new(service.0.clone(), query.correlation_id, events.into()).boxed(),
        ),
    }
}

fn sse_response(stream: BoxStream<'static, Result<Event, Infallible>>) -> Response {
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/aggregate/callback",
    tag = "Aggregate",
    request_body = CallbackEvent,
    responses(
        (status = 204, description = "Callback accepted, or acknowledged and dropped for an unknown correlation"),
    )
)]
#[tracing::instrument(
    level = "info",
    skip(service, event),
    fields(correlation_id = %event.correlation_id, status = %event.status)
)]
async fn record_callback(
    service: Extension<AggregatorService>,
    Json(event): Json<CallbackEvent>,
) -> StatusCode {
    if event.status == CallbackStatus::Complete {
        tracing::warn!("backend posted a COMPLETE status, ignoring");
        return StatusCode::NO_CONTENT;
    }
    service.record_callback(event).await;
    // Always 2xx: unknown correlations are late callbacks from cancelled
    // runs and must not make the backend retry.
    StatusCode::NO_CONTENT
}

/// Adapts the correlation's event channel to an SSE stream and ties the
/// correlation's lifetime to the connection: dropping the stream before the
/// summary arrived cancels the whole run.
struct CorrelationStream {
    events: mpsc::Receiver<CallbackEvent>,
    guard: DisconnectGuard,
}

impl CorrelationStream {
    fn new(
        service: AggregatorService,
        id: CorrelationId,
        events: mpsc::Receiver<CallbackEvent>,
    ) -> Self {
        Self {
            events,
            guard: DisconnectGuard {
                service,
                id,
                armed: true,
            },
        }
    }
}

impl Stream for CorrelationStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.guard.disarm();
                Poll::Ready(None)
            }
            Poll::Ready(Some(event)) => {
                if event.status == CallbackStatus::Complete {
                    this.guard.disarm();
                }
                match Event::default().json_data(&event) {
                    Ok(message) => Poll::Ready(Some(Ok(message))),
                    Err(error) => {
                        tracing::error!(%error, "could not serialize event, closing stream");
                        Poll::Ready(None)
                    }
                }
            }
        }
    }
}

struct DisconnectGuard {
    service: AggregatorService,
    id: CorrelationId,
    armed: bool,
}

impl DisconnectGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.service.client_disconnected(&self.id);
        }
    }
}
