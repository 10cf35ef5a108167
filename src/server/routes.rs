use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::auth::auth_middleware;
use super::handlers::*;

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/graphql", post(execute_graphql))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(api)
        .route("/api/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
