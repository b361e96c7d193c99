use crate::handlers::{handle_command, handle_health, SharedWorker};
use axum::{
    routing::{get, post},
    Router,
};
use http::header::HeaderName;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// HTTP surface of one island worker: `POST /command` and `GET /health`.
pub fn build_app(worker: SharedWorker) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/command", post(handle_command))
        .route("/health", get(handle_health))
        .with_state(worker)
        .layer(
            tower::ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    x_request_id.clone(),
                    MakeRequestUuid,
                ))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(x_request_id))
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
}
