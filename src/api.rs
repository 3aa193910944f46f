//! HTTP surface over the ledger and the checkout coordinator.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;
use crate::checkout::{CheckoutCoordinator, CheckoutOutcome, CheckoutRequest, CheckoutStore, PaymentGateway};
use crate::discount::{Coupon, PromotionalOffer, Quote};
use crate::domain::aggregates::{Availability, CartLine, Hold, Order, OrderRecord};
use crate::domain::value_objects::{BuyerId, OrderId, ProductId, UnitId, VariantId};
use crate::error::CheckoutError;
use crate::ledger::{LedgerError, StockLedger};

type Shared<L, S, P> = State<Arc<CheckoutCoordinator<L, S, P>>>;
type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router<L, S, P>(coordinator: Arc<CheckoutCoordinator<L, S, P>>) -> Router
where
    L: StockLedger,
    S: CheckoutStore,
    P: PaymentGateway,
{
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "opensase-checkout"})) }))
        .route("/api/v1/stock/:unit_id", get(availability::<L, S, P>).put(set_stock::<L, S, P>))
        .route("/api/v1/buyers/:buyer_id/holds", get(buyer_holds::<L, S, P>))
        .route("/api/v1/checkout/holds", post(ensure_holds::<L, S, P>))
        .route("/api/v1/checkout/quote", post(quote::<L, S, P>))
        .route("/api/v1/checkout", post(checkout::<L, S, P>))
        .route("/api/v1/payments/:order_id/success", post(payment_success::<L, S, P>))
        .route("/api/v1/payments/:order_id/failure", post(payment_failure::<L, S, P>))
        .route("/api/v1/orders/:order_id", get(get_order::<L, S, P>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

#[derive(Debug, Deserialize)]
pub struct SetStock {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub available_quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct HoldsRequest {
    pub buyer_id: BuyerId,
    #[serde(default)]
    pub lines: Vec<CartLine>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub offers: Vec<PromotionalOffer>,
    pub coupon: Option<Coupon>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaymentSucceeded {
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentFailed {
    pub reason: String,
}

async fn availability<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Path(unit_id): Path<UnitId>,
) -> ApiResult<Json<Availability>> {
    Ok(Json(c.ledger().availability(&unit_id).await?))
}

async fn set_stock<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Path(unit_id): Path<UnitId>, Json(body): Json<SetStock>,
) -> ApiResult<Json<Availability>> {
    let availability = c.ledger()
        .set_available(&unit_id, &body.product_id, body.variant_id.as_ref(), body.available_quantity)
        .await?;
    Ok(Json(availability))
}

async fn buyer_holds<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Path(buyer_id): Path<BuyerId>,
) -> ApiResult<Json<Vec<Hold>>> {
    Ok(Json(c.ledger().holds_for(&buyer_id).await?))
}

async fn ensure_holds<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Json(body): Json<HoldsRequest>,
) -> ApiResult<Json<Vec<Hold>>> {
    Ok(Json(c.ensure_holds(&body.buyer_id, &body.lines).await?))
}

async fn quote<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Json(body): Json<QuoteRequest>,
) -> Json<Quote> {
    Json(c.quote(&body.lines, &body.offers, body.coupon.as_ref()))
}

async fn checkout<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Json(body): Json<CheckoutRequest>,
) -> ApiResult<(StatusCode, Json<CheckoutOutcome>)> {
    let outcome = c.checkout(body).await?;
    let status = match outcome {
        CheckoutOutcome::Completed { .. } => StatusCode::CREATED,
        CheckoutOutcome::AwaitingPayment { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn payment_success<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Path(order_id): Path<OrderId>, Json(body): Json<PaymentSucceeded>,
) -> ApiResult<Json<Order>> {
    Ok(Json(c.payment_succeeded(order_id, body.reference).await?))
}

async fn payment_failure<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Path(order_id): Path<OrderId>, Json(body): Json<PaymentFailed>,
) -> ApiResult<Json<Order>> {
    Ok(Json(c.payment_failed(order_id, body.reason).await?))
}

async fn get_order<L: StockLedger, S: CheckoutStore, P: PaymentGateway>(
    State(c): Shared<L, S, P>, Path(order_id): Path<OrderId>,
) -> ApiResult<Json<OrderRecord>> {
    Ok(Json(c.order(order_id).await?))
}

// =============================================================================
// Error responses
// =============================================================================

pub struct ApiError(CheckoutError);

impl<E: Into<CheckoutError>> From<E> for ApiError {
    fn from(e: E) -> Self { Self(e.into()) }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CheckoutError::QuantityUnavailable(_) | CheckoutError::HoldExpired(_) => StatusCode::CONFLICT,
            CheckoutError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CheckoutError::OrderCommitFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            CheckoutError::PaymentFailure { .. } => StatusCode::PAYMENT_REQUIRED,
            CheckoutError::EmptyCart | CheckoutError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CheckoutError::Ledger(LedgerError::InvalidQuantity { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            CheckoutError::Ledger(LedgerError::BelowHeld { .. }) => StatusCode::CONFLICT,
            CheckoutError::OrderNotFound(_) | CheckoutError::Ledger(LedgerError::UnknownUnit(_)) => StatusCode::NOT_FOUND,
            CheckoutError::Ledger(_) | CheckoutError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> serde_json::Value {
        match &self.0 {
            CheckoutError::QuantityUnavailable(lines) => json!({ "lines": lines }),
            CheckoutError::HoldExpired(units) => json!({ "units": units }),
            CheckoutError::PaymentFailure { order_id, .. } => json!({ "order_id": order_id }),
            CheckoutError::Ledger(LedgerError::BelowHeld { held, .. }) => json!({ "held": held }),
            _ => serde_json::Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self.0, "Request failed");
            "Internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = json!({ "error": self.0.code(), "message": message, "details": self.details() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use rust_decimal::Decimal;
    use tower::ServiceExt;
    use crate::checkout::{MemoryStore, PaymentGatewayError, PaymentHandoff, PaymentRequest};
    use crate::clock::ManualClock;
    use crate::config::CheckoutConfig;
    use crate::ledger::MemoryLedger;
    use crate::notify::Signals;

    struct Accepting;

    impl PaymentGateway for Accepting {
        async fn begin(&self, request: &PaymentRequest) -> Result<PaymentHandoff, PaymentGatewayError> {
            Ok(PaymentHandoff { reference: request.order_number.to_string(), redirect_url: Some("https://pay.test/r".into()) })
        }
    }

    fn app() -> Router {
        let clock = Arc::new(ManualClock::default());
        let config = CheckoutConfig::default();
        let ledger = Arc::new(MemoryLedger::new(clock.clone(), config.hold_window));
        let coordinator = CheckoutCoordinator::new(ledger, Arc::new(MemoryStore::new()), Arc::new(Accepting), Signals::default(), clock, config);
        router(Arc::new(coordinator))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { serde_json::Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    fn line(unit_id: UnitId, quantity: u32) -> serde_json::Value {
        json!({
            "unit_id": unit_id, "product_id": ProductId::new(), "variant_id": null, "category_id": null,
            "name": "Diya set", "sku": "DIYA-4", "unit_price": "120.00", "quantity": quantity,
        })
    }

    async fn stocked(app: &Router, quantity: u32) -> UnitId {
        let unit = UnitId::new();
        let (status, _) = send(app, Method::PUT, &format!("/api/v1/stock/{unit}"),
            json!({ "product_id": ProductId::new(), "available_quantity": quantity })).await;
        assert_eq!(status, StatusCode::OK);
        unit
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_shortage_maps_to_conflict_with_lines() {
        let app = app();
        let unit = stocked(&app, 2).await;
        let (status, body) = send(&app, Method::POST, "/api/v1/checkout/holds",
            json!({ "buyer_id": BuyerId::new(), "lines": [line(unit, 3)] })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "quantity_unavailable");
        assert_eq!(body["details"]["lines"][0]["available"], 2);
        assert_eq!(body["details"]["lines"][0]["sku"], "DIYA-4");
    }

    #[tokio::test]
    async fn test_unknown_unit_is_not_found() {
        let (status, body) = send(&app(), Method::GET, &format!("/api/v1/stock/{}", UnitId::new()), json!(null)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_unit");
    }

    #[tokio::test]
    async fn test_quote_preview() {
        let (status, body) = send(&app(), Method::POST, "/api/v1/checkout/quote",
            json!({ "lines": [line(UnitId::new(), 2)] })).await;
        assert_eq!(status, StatusCode::OK);
        let quote: Quote = serde_json::from_value(body).unwrap();
        assert_eq!(quote.subtotal, Decimal::new(240, 0));
        assert_eq!(quote.shipping_charge, Decimal::new(50, 0));
        assert_eq!(quote.total, Decimal::new(290, 0));
    }

    #[tokio::test]
    async fn test_online_checkout_then_success_callback() {
        let app = app();
        let unit = stocked(&app, 1).await;
        let buyer = BuyerId::new();
        let (status, body) = send(&app, Method::POST, "/api/v1/checkout", json!({
            "buyer_id": buyer,
            "contact": { "name": "Meera", "email": "meera@example.com", "phone": "9123456780" },
            "lines": [line(unit, 1)],
            "shipping_address": {
                "name": "Meera", "phone": "9123456780", "line1": "4 Lake View", "line2": null,
                "city": "Kochi", "state": "KL", "postal_code": "682001"
            },
            "payment_method": "online"
        })).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "awaiting_payment");
        let order_id = body["order"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, Method::POST, &format!("/api/v1/payments/{order_id}/success"), json!({ "reference": "pay_1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payment_status"], "paid");

        let (status, body) = send(&app, Method::POST, &format!("/api/v1/payments/{order_id}/failure"), json!({ "reason": "late" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payment_status"], "paid");

        let (_, record) = send(&app, Method::GET, &format!("/api/v1/orders/{order_id}"), json!(null)).await;
        assert_eq!(record["payment"]["reference"], "pay_1");
        let (_, holds) = send(&app, Method::GET, &format!("/api/v1/buyers/{buyer}/holds"), json!(null)).await;
        assert_eq!(holds[0]["state"], "finalized");
    }

    #[tokio::test]
    async fn test_invalid_address_is_unprocessable() {
        let app = app();
        let unit = stocked(&app, 1).await;
        let (status, body) = send(&app, Method::POST, "/api/v1/checkout", json!({
            "buyer_id": BuyerId::new(),
            "contact": { "name": "Meera", "email": "meera@example.com", "phone": "9123456780" },
            "lines": [line(unit, 1)],
            "shipping_address": { "name": "", "phone": "1", "line1": "", "line2": null, "city": "", "state": "", "postal_code": "" },
            "payment_method": "cash_on_delivery"
        })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_request");
    }
}
