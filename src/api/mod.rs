pub mod error;
pub mod handlers;
pub mod models;

use axum::{routing::get, Router};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::EnvelopeStyle;
use crate::markets::MarketService;

#[derive(Clone)]
pub struct AppState {
    pub service: MarketService,
    pub envelope: EnvelopeStyle,
}

impl AppState {
    pub fn new(service: MarketService, envelope: EnvelopeStyle) -> Self {
        Self { service, envelope }
    }
}

pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let api_routes = Router::new()
        .route(
            "/prediction-markets",
            get(handlers::list_markets).post(handlers::create_market),
        )
        .route("/prediction-markets/{id}", get(handlers::get_market));

    Router::new()
        .route("/", get(handlers::root))
        .route("/_health", get(handlers::health))
        .nest("/api", api_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
