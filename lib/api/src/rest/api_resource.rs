use axum::Router;

/// A self-contained group of gateway routes (aggregation, signaling) that
/// ships its own `OpenApi` fragment.
///
/// Implementors hand back their `Router` from [`routes`] and their
/// documentation through the `utoipa::OpenApi` supertrait; the router
/// assembly merges both sets, so a resource cannot add an endpoint without
/// it showing up in the served specification.
///
/// [`routes`]: Self::routes
pub(crate) trait RoutedResource: utoipa::OpenApi {
    fn routes() -> Router;

    fn documentation() -> utoipa::openapi::OpenApi {
        Self::openapi()
    }
}
