use std::time::Duration;

use axum::{body::Body, extract::MatchedPath, http::Request, response::Response};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{DefaultOnRequest, TraceLayer},
};
use tracing::field::Empty;

pub(crate) fn span_trace_layer() -> TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    impl Fn(&Request<Body>) -> tracing::Span + Clone,
    DefaultOnRequest,
    impl Fn(&Response<Body>, Duration, &tracing::Span) + Clone,
> {
    TraceLayer::new_for_http()
        .make_span_with(span_maker)
        .on_response(span_on_response)
}

fn span_maker(request: &Request<Body>) -> tracing::Span {
    let method = request.method();
    // Prefer the matched route over the raw path to keep span names
    // low-cardinality.
    let route = request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_owned(),
        |matched_path| matched_path.as_str().to_owned(),
    );

    tracing::info_span!(
        "http-request",
        otel.name = %format!("{method} {route}"),
        http.method = %method,
        http.route = %route,
        http.status_code = Empty,
    )
}

fn span_on_response(response: &Response<Body>, _latency: Duration, span: &tracing::Span) {
    let status = response.status().as_u16();
    span.record("http.status_code", tracing::field::display(status));
}
