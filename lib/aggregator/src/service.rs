//! The aggregator facade orchestrating registry, dispatch, deadline, and
//! event emission.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    deadline,
    dispatch::{self, DirectAggregate},
    event::{CallbackEvent, CallbackStatus, CorrelationId, JournalNote},
    registry::CorrelationRegistry,
    state::{AggregationState, CallbackOutcome},
    Error, Result,
};

/// Static gateway configuration, resolved once at startup.
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// The gateway's own callback endpoint, handed to every backend.
    pub callback_url: String,
    /// Fixed list of backend dispatch endpoints.
    pub backend_urls: Vec<String>,
    /// Upper bound on the callback-waiting deadline. Client-requested values
    /// above it are clamped.
    pub max_deadline: Duration,
}

/// How the client wants the aggregate delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub enum Strategy {
    /// Stream events as callbacks arrive.
    #[default]
    #[serde(rename = "SSE")]
    Sse,
    /// Block until every backend answered and return one aggregate body.
    #[serde(rename = "WAIT_FOR_EVERYONE")]
    WaitForEveryone,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    pub patient_id: String,
    /// Comma-separated per-slot delays forwarded to the backends.
    pub delays: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AggregateResponse {
    /// 0 for the streaming strategy; the true count for the blocking one.
    pub respondents: u32,
    pub correlation_id: CorrelationId,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<JournalNote>>,
}

/// Result of attaching to a correlation's event stream.
pub enum SubscribeOutcome {
    Stream(crate::channel::EventRecv),
    /// The stream is already consumed by another subscriber.
    Conflict,
    /// Unknown id: the correlation may have terminated already.
    Unknown,
}

struct Inner {
    registry: CorrelationRegistry,
    config: AggregatorConfig,
    client: reqwest::Client,
}

/// Cheap-clone facade over the process-wide aggregation engine.
#[derive(Clone)]
pub struct AggregatorService {
    inner: Arc<Inner>,
}

impl AggregatorService {
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: CorrelationRegistry::new(),
                config,
                client: reqwest::Client::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub(crate) fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    /// Number of correlations currently in flight.
    #[must_use]
    pub fn live_correlations(&self) -> usize {
        self.inner.registry.len()
    }

    /// Clamps the client-requested deadline to the configured maximum.
    #[must_use]
    pub fn effective_deadline(&self, requested_ms: Option<u64>) -> Duration {
        let max = self.inner.config.max_deadline;
        match requested_ms {
            None => max,
            Some(ms) => {
                let requested = Duration::from_millis(ms);
                if requested > max {
                    tracing::warn!(
                        requested_ms = ms,
                        max_ms = max.as_millis() as u64,
                        "requested timeout exceeds the maximum, clamping"
                    );
                    max
                } else {
                    requested
                }
            }
        }
    }

    /// Accepts an aggregation request: registers the correlation, starts the
    /// fan-out, arms the deadline, and returns the id the client streams on.
    ///
    /// With [`Strategy::WaitForEveryone`] this instead blocks until every
    /// backend answered the direct variant and returns the aggregate body.
    ///
    /// # Errors
    ///
    /// [`Error::NoBackends`] if no backend resources are configured.
    pub async fn aggregate(&self, request: AggregateRequest) -> Result<AggregateResponse> {
        let backends = self.inner.config.backend_urls.len() as u32;
        if backends == 0 {
            return Err(Error::NoBackends);
        }

        let deadline = self.effective_deadline(request.timeout_ms);
        let delays = dispatch::parse_delays(&request.delays);

        if request.strategy == Some(Strategy::WaitForEveryone) {
            let DirectAggregate {
                respondents,
                errors,
                notes,
            } = dispatch::direct_fan_out(self, &request.patient_id, &delays, deadline).await;
            return Ok(AggregateResponse {
                respondents,
                correlation_id: CorrelationId::generate(),
                strategy: Strategy::WaitForEveryone,
                errors: Some(errors),
                notes: Some(notes),
            });
        }

        let (id, state) = self.inner.registry.create(&request.patient_id);
        tracing::info!(correlation_id = %id, backends, deadline_ms = deadline.as_millis() as u64, "aggregation started");

        dispatch::spawn_fan_out(self, id, &state, &delays, deadline);

        // Dispatch synthetics may already have landed; `set_expected`
        // re-checks the crossing so they are never lost.
        match state.set_expected(id, backends) {
            Ok(CallbackOutcome::Terminate) => self.finalize(id).await,
            Ok(_) => {
                state.arm_deadline(deadline::schedule(self.clone(), id, deadline));
            }
            Err(error) => {
                tracing::error!(correlation_id = %id, %error, "could not set expected count");
                state.arm_deadline(deadline::schedule(self.clone(), id, deadline));
            }
        }

        Ok(AggregateResponse {
            respondents: 0,
            correlation_id: id,
            strategy: Strategy::Sse,
            errors: None,
            notes: None,
        })
    }

    /// Routes a backend callback into its aggregation state. Returns whether
    /// the correlation was known; unknown ids are dropped (late callbacks
    /// from cancelled runs are expected and harmless).
    pub async fn record_callback(&self, event: CallbackEvent) -> bool {
        let Some(state) = self.inner.registry.get(&event.correlation_id) else {
            tracing::debug!(
                correlation_id = %event.correlation_id,
                status = %event.status,
                "callback for unknown correlation dropped"
            );
            return false;
        };
        self.complete_slot(&state, event).await;
        true
    }

    /// Shared completion path for real callbacks and dispatch synthetics.
    pub(crate) async fn complete_slot(&self, state: &Arc<AggregationState>, event: CallbackEvent) {
        let id = event.correlation_id;
        let outcome = {
            let _order = state.emit_order().lock().await;
            let outcome = state.record_callback(event.status);
            match outcome {
                CallbackOutcome::Stale => {
                    tracing::debug!(correlation_id = %id, status = %event.status, "stale event dropped");
                }
                CallbackOutcome::Continue | CallbackOutcome::Terminate => {
                    state.events().emit(event).await;
                }
            }
            outcome
        };
        if outcome == CallbackOutcome::Terminate {
            self.finalize(id).await;
        }
    }

    /// Deadline fire: book every missing slot as a timeout, then terminate.
    pub(crate) async fn deadline_fired(&self, id: CorrelationId) {
        let Some(state) = self.inner.registry.get(&id) else {
            return;
        };
        if !state.claim_termination() {
            return;
        }

        {
            let _order = state.emit_order().lock().await;
            let tally = state.tally();
            let missing = tally.expected.saturating_sub(tally.received);
            tracing::info!(correlation_id = %id, missing, "deadline expired");
            for _ in 0..missing {
                state.record_deadline_miss();
                state
                    .events()
                    .emit(CallbackEvent::synthetic(
                        "deadline",
                        state.patient_id(),
                        id,
                        CallbackStatus::Timeout,
                    ))
                    .await;
            }
        }
        self.finalize(id).await;
    }

    /// The single path past registry removal: cancels outstanding work and
    /// emits the summary. Dropping the state afterwards closes the channel,
    /// so the summary is guaranteed to be the last event.
    async fn finalize(&self, id: CorrelationId) {
        let Some(state) = self.inner.registry.remove(&id) else {
            return;
        };
        state.cancel_all();

        let tally = state.tally();
        tracing::info!(
            correlation_id = %id,
            respondents = tally.respondents,
            errors = tally.errors,
            rejections = tally.rejections(),
            "aggregation complete"
        );
        let _order = state.emit_order().lock().await;
        state
            .events()
            .emit(CallbackEvent::summary(
                state.patient_id(),
                id,
                tally.respondents,
                tally.errors,
            ))
            .await;
    }

    /// Attaches the single subscriber to a correlation's event stream.
    #[must_use]
    pub fn subscribe(&self, id: &CorrelationId) -> SubscribeOutcome {
        match self.inner.registry.get(id) {
            None => SubscribeOutcome::Unknown,
            Some(state) => match state.subscribe() {
                Some(events) => SubscribeOutcome::Stream(events),
                None => SubscribeOutcome::Conflict,
            },
        }
    }

    /// Client went away: cancel the dispatch group and the deadline, drop the
    /// registry entry. No summary is emitted on this path.
    pub fn client_disconnected(&self, id: &CorrelationId) {
        let Some(state) = self.inner.registry.remove(id) else {
            return;
        };
        state.claim_termination();
        state.cancel_all();
        tracing::info!(correlation_id = %id, "client disconnected, aggregation cancelled");
    }

    /// Flushes every live correlation: pending deadlines are cancelled and
    /// subscriber streams close without a summary (truncated-stream marker).
    pub fn shutdown(&self) {
        for (id, state) in self.inner.registry.drain() {
            state.claim_termination();
            state.cancel_all();
            tracing::debug!(correlation_id = %id, "aggregation aborted on shutdown");
        }
    }
}
