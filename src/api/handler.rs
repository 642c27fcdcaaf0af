use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRef, State},
    http::{header::AUTHORIZATION, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use super::models::*;
use crate::{
    auth::{AuthService, AuthUser, Session},
    error::{AppError, AppResult},
    gateway::{OrderGateway, SubmitOutcome},
    ledger::LedgerStore,
    middleware::ValidatedJson,
};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub gateway: Arc<OrderGateway>,
    pub auth: Arc<AuthService>,
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Storage reachability check
/// GET /ping
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    tokio::time::timeout(PING_TIMEOUT, state.ledger.ping())
        .await?
        .map_err(|e| AppError::Unavailable(format!("storage unreachable: {}", e)))?;

    Ok(Json(HealthResponse { status: "ok" }))
}

// ========== AUTH ==========

/// POST /api/user/register
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CredentialsRequest>,
) -> AppResult<Response> {
    let session = state.auth.register(&request.login, &request.password).await?;
    session_response(session)
}

/// POST /api/user/login
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CredentialsRequest>,
) -> AppResult<Response> {
    let session = state.auth.login(&request.login, &request.password).await?;
    info!(user_id = session.user.id, "🔑 User logged in");
    session_response(session)
}

fn session_response(session: Session) -> AppResult<Response> {
    let token = HeaderValue::from_str(&session.token)
        .map_err(|e| AppError::Internal(format!("unusable session token: {}", e)))?;

    Ok((StatusCode::OK, [(AUTHORIZATION, token)]).into_response())
}

// ========== ORDERS ==========

/// Upload an order number (plain-text body)
/// POST /api/user/orders
///
/// 202 when the order is new and queued, 200 when the caller already
/// uploaded it.
pub async fn upload_order(
    State(state): State<AppState>,
    user: AuthUser,
    body: String,
) -> AppResult<StatusCode> {
    match state.gateway.submit_order(user.user_id, &body).await? {
        SubmitOutcome::Accepted(_) => Ok(StatusCode::ACCEPTED),
        SubmitOutcome::AlreadyUploaded(_) => Ok(StatusCode::OK),
    }
}

/// GET /api/user/orders
pub async fn list_orders(State(state): State<AppState>, user: AuthUser) -> AppResult<Response> {
    let orders = state.ledger.list_orders(user.user_id).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(body).into_response())
}

// ========== BALANCE ==========

/// GET /api/user/balance
pub async fn get_balance(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<BalanceResponse>> {
    let audit = state.ledger.balance_audit(user.user_id).await?;
    Ok(Json(BalanceResponse::from(audit)))
}

/// POST /api/user/balance/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(request): ValidatedJson<WithdrawRequest>,
) -> AppResult<StatusCode> {
    state
        .gateway
        .withdraw(user.user_id, &request.order, request.sum)
        .await?;
    Ok(StatusCode::OK)
}

/// GET /api/user/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Response> {
    let withdrawals = state.ledger.list_withdrawals(user.user_id).await?;
    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<WithdrawalResponse> = withdrawals
        .into_iter()
        .map(WithdrawalResponse::from)
        .collect();
    Ok(Json(body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::auth::AuthConfig;
    use crate::ledger::models::OrderStatus;
    use crate::ledger::money::Amount;
    use crate::ledger::InMemoryLedger;
    use crate::settlement::queue::{OrderDrain, OrderQueue};
    use axum::{
        body::{to_bytes, Body},
        http::{header::CONTENT_TYPE, Method, Request},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        ledger: Arc<InMemoryLedger>,
        drain: OrderDrain,
    }

    fn test_app() -> TestApp {
        let ledger = Arc::new(InMemoryLedger::new());
        let (queue, drain) = OrderQueue::bounded(16);
        let state = AppState {
            ledger: ledger.clone(),
            gateway: Arc::new(OrderGateway::new(ledger.clone(), queue)),
            auth: Arc::new(AuthService::new(
                ledger.clone(),
                AuthConfig {
                    secret: "test".to_string(),
                    session_ttl: chrono::Duration::hours(1),
                },
            )),
        };
        TestApp {
            app: router(state),
            ledger,
            drain,
        }
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.unwrap()
        }

        async fn register(&self, login: &str) -> String {
            let response = self
                .send(json_request(
                    Method::POST,
                    "/api/user/register",
                    None,
                    json!({"login": login, "password": "pw"}),
                ))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            response.headers()[AUTHORIZATION].to_str().unwrap().to_string()
        }

        async fn user_id(&self, login: &str) -> i64 {
            self.ledger.find_user_by_login(login).await.unwrap().unwrap().id
        }
    }

    fn json_request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn text_request(uri: &str, token: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "text/plain")
            .header(AUTHORIZATION, token)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(AUTHORIZATION, token)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let t = test_app();
        let response = t
            .send(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let t = test_app();
        t.register("alice").await;

        let duplicate = t
            .send(json_request(
                Method::POST,
                "/api/user/register",
                None,
                json!({"login": "alice", "password": "other"}),
            ))
            .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let bad_body = t
            .send(json_request(
                Method::POST,
                "/api/user/register",
                None,
                json!({"login": "", "password": "pw"}),
            ))
            .await;
        assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);

        let wrong = t
            .send(json_request(
                Method::POST,
                "/api/user/login",
                None,
                json!({"login": "alice", "password": "nope"}),
            ))
            .await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = t
            .send(json_request(
                Method::POST,
                "/api/user/login",
                None,
                json!({"login": "alice", "password": "pw"}),
            ))
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(ok.headers().contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_protected_routes_require_session() {
        let t = test_app();
        let response = t
            .send(Request::builder().uri("/api/user/orders").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = t.send(get("/api/user/balance", "forged")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_order_upload_statuses() {
        let mut t = test_app();
        let alice = t.register("alice").await;
        let bob = t.register("bob").await;

        let first = t.send(text_request("/api/user/orders", &alice, "12345678903")).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(t.drain.drain().len(), 1);

        let again = t.send(text_request("/api/user/orders", &alice, "12345678903")).await;
        assert_eq!(again.status(), StatusCode::OK);

        let other = t.send(text_request("/api/user/orders", &bob, "12345678903")).await;
        assert_eq!(other.status(), StatusCode::CONFLICT);

        let invalid = t.send(text_request("/api/user/orders", &alice, "12345678901")).await;
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let empty = t.send(text_request("/api/user/orders", &alice, "")).await;
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_order_list() {
        let t = test_app();
        let alice = t.register("alice").await;

        let empty = t.send(get("/api/user/orders", &alice)).await;
        assert_eq!(empty.status(), StatusCode::NO_CONTENT);

        t.send(text_request("/api/user/orders", &alice, "12345678903")).await;
        t.send(text_request("/api/user/orders", &alice, "79927398713")).await;

        let settled = t.ledger.find_order("12345678903").await.unwrap().unwrap();
        t.ledger
            .settle_order(settled.id, OrderStatus::Processed, Amount::from_minor(729))
            .await
            .unwrap();

        let response = t.send(get("/api/user/orders", &alice)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let orders = body.as_array().unwrap();
        assert_eq!(orders.len(), 2);

        let processed = orders
            .iter()
            .find(|o| o["number"] == "12345678903")
            .unwrap();
        assert_eq!(processed["status"], "PROCESSED");
        assert_eq!(processed["accrual"].as_f64(), Some(7.29));

        let pending = orders
            .iter()
            .find(|o| o["number"] == "79927398713")
            .unwrap();
        assert_eq!(pending["status"], "NEW");
        assert!(pending.get("accrual").is_none());
    }

    #[tokio::test]
    async fn test_balance_and_withdrawals() {
        let t = test_app();
        let alice = t.register("alice").await;
        let user_id = t.user_id("alice").await;

        let order = t.ledger.create_order(user_id, "18").await.unwrap();
        t.ledger
            .settle_order(order.id, OrderStatus::Processed, Amount::from_minor(72_998))
            .await
            .unwrap();

        let withdraw = |order: &str, sum: f64| {
            json_request(
                Method::POST,
                "/api/user/balance/withdraw",
                Some(alice.as_str()),
                json!({"order": order, "sum": sum}),
            )
        };

        let none = t.send(get("/api/user/withdrawals", &alice)).await;
        assert_eq!(none.status(), StatusCode::NO_CONTENT);

        assert_eq!(t.send(withdraw("2377225624", 751.0)).await.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(t.send(withdraw("2377225625", 1.0)).await.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(t.send(withdraw("2377225624", 0.0)).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(t.send(withdraw("18", 1.0)).await.status(), StatusCode::CONFLICT);
        assert_eq!(t.send(withdraw("2377225624", 500.5)).await.status(), StatusCode::OK);

        let balance = body_json(t.send(get("/api/user/balance", &alice)).await).await;
        assert_eq!(balance["current"].as_f64(), Some(229.48));
        assert_eq!(balance["withdrawn"].as_f64(), Some(500.5));

        let response = t.send(get("/api/user/withdrawals", &alice)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["order"], "2377225624");
        assert_eq!(body[0]["sum"].as_f64(), Some(500.5));
        assert!(body[0]["processed_at"].is_string());

        // The withdrawal anchor is not listed as an uploaded order.
        let orders = body_json(t.send(get("/api/user/orders", &alice)).await).await;
        assert_eq!(orders.as_array().unwrap().len(), 1);
    }
}
