pub mod handler;
pub mod models;

use axum::{
    routing::{get, post},
    Router,
};

use handler::*;

/// Application routes without transport layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(health_check))
        .nest(
            "/api/user",
            Router::new()
                .route("/register", post(register))
                .route("/login", post(login))
                .route("/orders", post(upload_order).get(list_orders))
                .route("/balance", get(get_balance))
                .route("/balance/withdraw", post(withdraw))
                .route("/withdrawals", get(list_withdrawals)),
        )
        .with_state(state)
}
