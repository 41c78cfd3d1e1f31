//! Backend fan-out.
//!
//! The callback channel is the true completion channel: a dispatch that the
//! backend accepts (2xx) sets up a future callback, every other dispatch
//! outcome synthesizes the terminal event for that slot on the spot. This
//! keeps `expected` equal to the backend count for the whole run.

use std::{sync::Arc, time::Duration};

use futures::{stream::FuturesUnordered, StreamExt};
use serde::Serialize;

use crate::{
    event::{CallbackEvent, CallbackStatus, CorrelationId, JournalNote},
    service::AggregatorService,
    state::AggregationState,
};

/// Dispatch body sent to each backend resource.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchCall<'a> {
    patient_id: &'a str,
    delay: i64,
    callback_url: &'a str,
    correlation_id: CorrelationId,
}

/// Body for the synchronous (`WAIT_FOR_EVERYONE`) variant, served by the
/// backends under `<url>/direct`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirectCall<'a> {
    patient_id: &'a str,
    delay: i64,
}

/// Result of a blocking fan-out.
#[derive(Clone, Debug, Default)]
pub struct DirectAggregate {
    pub respondents: u32,
    pub errors: u32,
    pub notes: Vec<JournalNote>,
}

/// Parses the comma-separated delay list; missing or malformed entries
/// default to 0.
#[must_use]
pub fn parse_delays(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(|entry| entry.trim().parse().unwrap_or(0))
        .collect()
}

fn classify_failure(error: &reqwest::Error) -> CallbackStatus {
    if error.is_timeout() {
        CallbackStatus::Timeout
    } else if error.is_connect() {
        CallbackStatus::ConnectionClosed
    } else {
        CallbackStatus::Error
    }
}

/// Starts one dispatch task per backend slot under the correlation's group
/// token. Returns immediately; outcomes flow through the state's event
/// channel.
pub(crate) fn spawn_fan_out(
    service: &AggregatorService,
    id: CorrelationId,
    state: &Arc<AggregationState>,
    delays: &[i64],
    deadline: Duration,
) {
    let backends = service.config().backend_urls.clone();
    let token = state.dispatch_token();

    for slot in 0..backends.len() {
        let backend = backends[slot % backends.len()].clone();
        let delay = delays.get(slot).copied().unwrap_or(0);
        let service = service.clone();
        let state = Arc::clone(state);
        let token = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!(correlation_id = %id, backend, "dispatch cancelled");
                }
                outcome = dispatch_one(&service, id, &state, &backend, delay, deadline) => {
                    if let Some(status) = outcome {
                        let event = CallbackEvent::synthetic(
                            backend,
                            state.patient_id(),
                            id,
                            status,
                        );
                        service.complete_slot(&state, event).await;
                    }
                }
            }
        });
    }
}

/// Issues one dispatch call. `None` means the backend accepted and a real
/// callback is expected later; `Some(status)` is the synthetic outcome that
/// replaces the callback for this slot.
async fn dispatch_one(
    service: &AggregatorService,
    id: CorrelationId,
    state: &Arc<AggregationState>,
    backend: &str,
    delay: i64,
    deadline: Duration,
) -> Option<CallbackStatus> {
    let call = DispatchCall {
        patient_id: state.patient_id(),
        delay,
        callback_url: &service.config().callback_url,
        correlation_id: id,
    };

    let response = service
        .client()
        .post(backend)
        .timeout(deadline)
        .json(&call)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => None,
        Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
            tracing::debug!(correlation_id = %id, backend, "backend rejected dispatch");
            Some(CallbackStatus::Rejected)
        }
        Ok(response) => {
            tracing::warn!(
                correlation_id = %id,
                backend,
                status = %response.status(),
                "unexpected dispatch response"
            );
            Some(CallbackStatus::Error)
        }
        Err(error) => {
            let status = classify_failure(&error);
            tracing::warn!(correlation_id = %id, backend, %error, %status, "dispatch failed");
            Some(status)
        }
    }
}

/// Blocking fan-out for `WAIT_FOR_EVERYONE`: calls the direct variant of
/// every backend and aggregates in arrival order.
pub(crate) async fn direct_fan_out(
    service: &AggregatorService,
    patient_id: &str,
    delays: &[i64],
    deadline: Duration,
) -> DirectAggregate {
    let backends = &service.config().backend_urls;

    let mut calls: FuturesUnordered<_> = backends
        .iter()
        .enumerate()
        .map(|(slot, _)| {
            let backend = backends[slot % backends.len()].clone();
            let delay = delays.get(slot).copied().unwrap_or(0);
            async move {
                let call = DirectCall { patient_id, delay };
                let outcome = service
                    .client()
                    .post(format!("{backend}/direct"))
                    .timeout(deadline)
                    .json(&call)
                    .send()
                    .await;
                (backend, outcome)
            }
        })
        .collect();

    let mut aggregate = DirectAggregate::default();
    while let Some((backend, outcome)) = calls.next().await {
        match outcome {
            Ok(response) if response.status().is_success() => {
                match response.json::<Vec<JournalNote>>().await {
                    Ok(notes) => {
                        aggregate.respondents += 1;
                        aggregate.notes.extend(notes);
                    }
                    Err(error) => {
                        tracing::warn!(backend, %error, "direct response body unreadable");
                        aggregate.errors += 1;
                    }
                }
            }
            Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
                tracing::debug!(backend, "backend rejected direct call");
            }
            Ok(response) => {
                tracing::warn!(backend, status = %response.status(), "direct call failed");
                aggregate.errors += 1;
            }
            Err(error) => {
                tracing::warn!(backend, %error, "direct call failed");
                aggregate.errors += 1;
            }
        }
    }
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_delay_lists() {
        assert_eq!(parse_delays("1000,2000,3000"), vec![1000, 2000, 3000]);
        assert_eq!(parse_delays("0,-1, 500 "), vec![0, -1, 500]);
    }

    #[test]
    fn malformed_entries_default_to_zero() {
        assert_eq!(parse_delays("abc,2000,"), vec![0, 2000, 0]);
        assert_eq!(parse_delays(""), vec![0]);
        assert_eq!(parse_delays("1e3,None,42"), vec![0, 0, 42]);
    }
}
