//! End-to-end scenarios: the real router, real mock backends, and a real
//! HTTP client driving the aggregation loop over the wire.

use std::{sync::Arc, time::Duration};

use aggregator::{
    service::{AggregatorConfig, AggregatorService},
    signaling::{SignalingConfig, SignalingSessions},
};
use aggregator_api::rest::{rest_api_router, RestRouterDependencies};
use axum::{http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the full gateway on an ephemeral port; the callback URL points back
/// at the gateway itself.
async fn spawn_gateway(backend_urls: Vec<String>, max_deadline: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let aggregator = AggregatorService::new(AggregatorConfig {
        callback_url: format!("http://{addr}/aggregate/callback"),
        backend_urls,
        max_deadline,
    });
    let signaling = Arc::new(SignalingSessions::new(SignalingConfig::default()));
    let router = rest_api_router(RestRouterDependencies {
        aggregator,
        signaling,
    });

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockDispatchCall {
    patient_id: String,
    delay: i64,
    callback_url: String,
    correlation_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockDirectCall {
    patient_id: String,
    delay: i64,
}

fn mock_note(patient_id: &str) -> Value {
    json!({
        "date": "2024-05-01",
        "note": "routine visit",
        "patientId": patient_id,
        "doctorId": "doc-1",
        "caregiverId": "cg-1",
    })
}

/// A backend resource that sleeps for the requested delay and then posts an
/// `ok` callback. A negative delay makes it reject the dispatch with 401.
async fn spawn_mock_backend() -> String {
    async fn dispatch(Json(call): Json<MockDispatchCall>) -> StatusCode {
        if call.delay < 0 {
            return StatusCode::UNAUTHORIZED;
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(call.delay as u64)).await;
            let event = json!({
                "source": "mock-resource",
                "patientId": call.patient_id,
                "correlationId": call.correlation_id,
                "status": "ok",
                "notes": [mock_note(&call.patient_id)],
            });
            let _ = reqwest::Client::new()
                .post(&call.callback_url)
                .json(&event)
                .send()
                .await;
        });
        StatusCode::OK
    }

    async fn direct(Json(call): Json<MockDirectCall>) -> axum::response::Response {
        if call.delay < 0 {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        tokio::time::sleep(Duration::from_millis(call.delay as u64)).await;
        Json(json!([mock_note(&call.patient_id)])).into_response()
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new()
        .route("/", post(dispatch))
        .route("/direct", post(direct));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn start_aggregation(gateway: &str, body: Value) -> Value {
    let response = reqwest::Client::new()
        .post(format!("{gateway}/aggregate/journals"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response.json().await.unwrap()
}

async fn open_stream(gateway: &str, correlation_id: &str) -> reqwest::Response {
    let response = reqwest::Client::new()
        .get(format!(
            "{gateway}/aggregate/stream?correlationId={correlation_id}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response
}

/// Drains SSE data frames until the COMPLETE summary or end of stream.
async fn collect_events(response: reqwest::Response) -> Vec<Value> {
    let mut events = Vec::new();
    let mut buffer = String::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.expect("stream failed");
        buffer.push_str(std::str::from_utf8(&chunk).expect("stream is not UTF-8"));
        while let Some(frame_end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..frame_end + 2).collect();
            for line in frame.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    let event: Value = serde_json::from_str(data).expect("malformed event");
                    let complete = event["status"] == "COMPLETE";
                    events.push(event);
                    if complete {
                        return events;
                    }
                }
            }
        }
    }
    events
}

fn count_status(events: &[Value], status: &str) -> usize {
    events
        .iter()
        .filter(|event| event["status"] == status)
        .count()
}

#[tokio::test]
async fn all_backends_succeed() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(27)).await;

    let accepted = start_aggregation(
        &gateway,
        json!({"patientId": "191212121212", "delays": "10,20,30", "timeoutMs": 5000}),
    )
    .await;
    assert_eq!(accepted["respondents"], 0);

    let stream = open_stream(&gateway, accepted["correlationId"].as_str().unwrap()).await;
    let events = tokio::time::timeout(TEST_TIMEOUT, collect_events(stream))
        .await
        .unwrap();

    assert_eq!(events.len(), 4);
    assert_eq!(count_status(&events, "ok"), 3);
    let summary = events.last().unwrap();
    assert_eq!(summary["status"], "COMPLETE");
    assert_eq!(summary["respondents"], 3);
    assert_eq!(summary["errors"], 0);
    assert_eq!(events[0]["notes"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn one_backend_rejects_at_dispatch_time() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(27)).await;

    let accepted = start_aggregation(
        &gateway,
        json!({"patientId": "p", "delays": "10,20,-1", "timeoutMs": 5000}),
    )
    .await;

    let stream = open_stream(&gateway, accepted["correlationId"].as_str().unwrap()).await;
    let events = tokio::time::timeout(TEST_TIMEOUT, collect_events(stream))
        .await
        .unwrap();

    assert_eq!(events.len(), 4);
    assert_eq!(count_status(&events, "ok"), 2);
    assert_eq!(count_status(&events, "REJECTED"), 1);
    let summary = events.last().unwrap();
    assert_eq!(summary["respondents"], 2);
    assert_eq!(summary["errors"], 0);
}

#[tokio::test]
async fn deadline_converts_missing_slots_into_timeouts() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(27)).await;

    let accepted = start_aggregation(
        &gateway,
        json!({"patientId": "p", "delays": "10,20,60000", "timeoutMs": 400}),
    )
    .await;

    let stream = open_stream(&gateway, accepted["correlationId"].as_str().unwrap()).await;
    let events = tokio::time::timeout(TEST_TIMEOUT, collect_events(stream))
        .await
        .unwrap();

    assert_eq!(count_status(&events, "ok"), 2);
    assert_eq!(count_status(&events, "TIMEOUT"), 1);
    let summary = events.last().unwrap();
    assert_eq!(summary["status"], "COMPLETE");
    assert_eq!(summary["respondents"], 2);
    assert_eq!(summary["errors"], 1);
}

#[tokio::test]
async fn all_backends_reject() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(27)).await;

    let accepted = start_aggregation(
        &gateway,
        json!({"patientId": "p", "delays": "-1,-1,-1"}),
    )
    .await;

    let stream = open_stream(&gateway, accepted["correlationId"].as_str().unwrap()).await;
    let events = tokio::time::timeout(TEST_TIMEOUT, collect_events(stream))
        .await
        .unwrap();

    assert_eq!(count_status(&events, "REJECTED"), 3);
    let summary = events.last().unwrap();
    assert_eq!(summary["respondents"], 0);
    assert_eq!(summary["errors"], 0);
}

#[tokio::test]
async fn wait_for_everyone_returns_one_aggregate_body() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(27)).await;

    let aggregate = start_aggregation(
        &gateway,
        json!({
            "patientId": "p",
            "delays": "10,20,-1",
            "strategy": "WAIT_FOR_EVERYONE",
        }),
    )
    .await;

    assert_eq!(aggregate["strategy"], "WAIT_FOR_EVERYONE");
    assert_eq!(aggregate["respondents"], 2);
    assert_eq!(aggregate["errors"], 0);
    assert_eq!(aggregate["notes"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn callback_for_unknown_correlation_is_acknowledged() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend], Duration::from_secs(27)).await;

    let response = reqwest::Client::new()
        .post(format!("{gateway}/aggregate/callback"))
        .json(&json!({
            "source": "mock-resource",
            "patientId": "p",
            "correlationId": uuid::Uuid::new_v4(),
            "status": "ok",
            "notes": [],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn stream_for_unknown_correlation_closes_immediately() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend], Duration::from_secs(27)).await;

    let stream = open_stream(&gateway, &uuid::Uuid::new_v4().to_string()).await;
    let events = tokio::time::timeout(TEST_TIMEOUT, collect_events(stream))
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn second_stream_subscriber_conflicts() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(27)).await;

    let accepted = start_aggregation(
        &gateway,
        json!({"patientId": "p", "delays": "60000,60000,60000", "timeoutMs": 20000}),
    )
    .await;
    let correlation_id = accepted["correlationId"].as_str().unwrap().to_owned();

    let _held = open_stream(&gateway, &correlation_id).await;
    let second = reqwest::Client::new()
        .get(format!(
            "{gateway}/aggregate/stream?correlationId={correlation_id}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn client_disconnect_cancels_the_run() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend; 3], Duration::from_secs(60)).await;

    let accepted = start_aggregation(
        &gateway,
        json!({"patientId": "p", "delays": "0,0,60000", "timeoutMs": 60000}),
    )
    .await;
    let correlation_id = accepted["correlationId"].as_str().unwrap().to_owned();

    // Read the two quick events, then drop the connection mid-stream.
    let stream = open_stream(&gateway, &correlation_id).await;
    let mut buffer = String::new();
    let mut body = stream.bytes_stream();
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while buffer.matches("data: ").count() < 2 {
        let chunk = tokio::time::timeout_at(deadline, body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    drop(body);

    // The gateway notices the disconnect and removes the correlation: a
    // fresh subscriber gets the unknown-id empty stream.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let reopened = open_stream(&gateway, &correlation_id).await;
    let events = tokio::time::timeout(TEST_TIMEOUT, collect_events(reopened))
        .await
        .unwrap();
    assert!(events.is_empty());

    // A late callback for the cancelled run is still acknowledged.
    let response = reqwest::Client::new()
        .post(format!("{gateway}/aggregate/callback"))
        .json(&json!({
            "source": "mock-resource",
            "patientId": "p",
            "correlationId": correlation_id,
            "status": "ok",
            "notes": [],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn signaling_session_round_trip() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend], Duration::from_secs(27)).await;
    let client = reqwest::Client::new();

    let session: Value = client
        .post(format!("{gateway}/aggregate/webrtc/create"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = session["sessionId"].as_str().unwrap().to_owned();
    let token = session["token"].as_str().unwrap().to_owned();
    assert!(token.len() >= 32);
    assert!(session["iceServers"].is_array());

    let probe = client
        .get(format!(
            "{gateway}/aggregate/webrtc/{session_id}?token={token}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(probe.status(), reqwest::StatusCode::OK);

    let stream = client
        .get(format!(
            "{gateway}/aggregate/webrtc/{session_id}/stream?token={token}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), reqwest::StatusCode::OK);

    let payload = json!({"type": "offer", "sdp": "v=0"});
    let posted = client
        .post(format!("{gateway}/aggregate/webrtc/{session_id}/signal"))
        .json(&json!({"token": token, "payload": payload}))
        .send()
        .await
        .unwrap();
    assert_eq!(posted.status(), reqwest::StatusCode::NO_CONTENT);

    let mut body = stream.bytes_stream();
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    let received = loop {
        if let Some(start) = buffer.find("data: ") {
            if let Some(end) = buffer[start..].find("\n\n") {
                let frame = &buffer[start + "data: ".len()..start + end];
                break serde_json::from_str::<Value>(frame.trim()).unwrap();
            }
        }
        let chunk = tokio::time::timeout_at(deadline, body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
    };
    assert_eq!(received, payload);
}

#[tokio::test]
async fn signaling_rejects_bad_tokens_and_unknown_sessions() {
    let backend = spawn_mock_backend().await;
    let gateway = spawn_gateway(vec![backend], Duration::from_secs(27)).await;
    let client = reqwest::Client::new();

    let session: Value = client
        .post(format!("{gateway}/aggregate/webrtc/create"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = session["sessionId"].as_str().unwrap();

    let unauthorized = client
        .post(format!("{gateway}/aggregate/webrtc/{session_id}/signal"))
        .json(&json!({"token": "bogus", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);

    let unknown = client
        .post(format!(
            "{gateway}/aggregate/webrtc/{}/signal",
            uuid::Uuid::new_v4()
        ))
        .json(&json!({"token": "bogus", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
}
