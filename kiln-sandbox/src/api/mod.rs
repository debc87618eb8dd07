//! API Module
//!
//! The queue listener the daemon talks to.

pub mod envelope;
pub mod error;
pub mod queue;

use axum::{Router, extract::DefaultBodyLimit, routing::post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::{Miner, TaskQueue};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TaskQueue>,

    /// Present only in sandboxes started for mining
    pub miner: Option<Arc<Miner>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(queue::handle_command))
        .with_state(state)
        .layer(DefaultBodyLimit::max(envelope::MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}
