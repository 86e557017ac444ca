// API route assembly, split by domain.
pub mod chat_ws;
pub mod errors;
pub mod federated;
pub mod federated_ws;
pub mod gateways;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(gateways::router())
        .merge(federated::router())
        .merge(chat_ws::router())
        .merge(federated_ws::router())
        .with_state(state)
}
