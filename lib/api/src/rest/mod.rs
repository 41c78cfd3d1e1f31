//! Route definitions and router assembly.
//!
//! Each resource contributes its own `Router` and `OpenApi` fragment; the
//! fragments are merged into one documentation document served under
//! `/api-doc`.

mod api_resource;
mod middleware;

mod aggregate;
mod signaling;

use std::sync::Arc;

use aggregator::{service::AggregatorService, signaling::SignalingSessions};
use axum::{routing::get, Extension, Json, Router};
use utoipa::{openapi, Modify, OpenApi};

use self::{
    aggregate::AggregateResource, api_resource::RoutedResource, middleware::span_trace_layer,
    signaling::SignalingResource,
};

fn api_resources() -> Vec<Router> {
    vec![
        AggregateResource::routes(),
        SignalingResource::routes(),
    ]
}

fn api_documentation() -> Vec<openapi::OpenApi> {
    vec![
        AggregateResource::documentation(),
        SignalingResource::documentation(),
    ]
}

/// Shared state handed to the REST router.
pub struct RestRouterDependencies {
    pub aggregator: AggregatorService,
    pub signaling: Arc<SignalingSessions>,
}

/// A [`Router`] that only serves the `OpenAPI` specification for the REST
/// API.
pub fn openapi_only_router() -> Router {
    let open_api_doc = OpenApiDocumentation::openapi();

    Router::new().nest(
        "/api-doc",
        Router::new().route("/openapi.json", get(|| async { Json(open_api_doc) })),
    )
}

/// A [`Router`] that serves all of the REST API routes, and the `OpenAPI`
/// specification.
pub fn rest_api_router(dependencies: RestRouterDependencies) -> Router {
    // All api resources are merged together into a super-router.
    let merged_routes = api_resources()
        .into_iter()
        .fold(Router::new(), Router::merge);

    // Make sure extensions are added at the end so they are made available
    // to merged routers. The `/api-doc` endpoints stay outside the layers.
    merged_routes
        .layer(Extension(dependencies.aggregator))
        .layer(Extension(dependencies.signaling))
        .layer(span_trace_layer())
        .merge(openapi_only_router())
}

#[derive(OpenApi)]
#[openapi(
    tags(
        (name = "Gateway", description = "Journal aggregation gateway API")
    ),
    info(title = "journal-gateway"),
    modifiers(
        &MergeAddon,
    ),
)]
pub struct OpenApiDocumentation;

/// Addon to merge multiple [`OpenApi`] documents together.
///
/// [`OpenApi`]: utoipa::openapi::OpenApi
struct MergeAddon;

impl Modify for MergeAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let api_documentation = api_documentation();

        let api_components = api_documentation
            .iter()
            .cloned()
            .filter_map(|api_docs| {
                api_docs
                    .components
                    .map(|components| components.schemas.into_iter())
            })
            .flatten();

        let mut components = openapi.components.take().unwrap_or_default();
        components.schemas.extend(api_components);
        openapi.components = Some(components);

        let mut tags = openapi.tags.take().unwrap_or_default();
        tags.extend(
            api_documentation
                .iter()
                .cloned()
                .filter_map(|api_docs| api_docs.tags)
                .flatten(),
        );
        openapi.tags = Some(tags);

        openapi.paths.paths.extend(
            api_documentation
                .iter()
                .cloned()
                .flat_map(|api_docs| api_docs.paths.paths.into_iter()),
        );
    }
}
