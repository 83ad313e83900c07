use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::{
    service::{
        CancelOrderResponse, OrderBookResponse, OrderStatusResponse, PlaceOrderRequest,
        PlaceOrderResponse, ServiceError,
    },
    state::AppState,
    store::StoreError,
    trade::Trade,
};

/// Transport-level error: every service outcome maps onto one of these,
/// which render as a JSON body with the matching status code.
#[derive(Debug)]
pub enum ApiError {
    /// Per-field validation failures, rendered as
    /// `{"validation_errors": {field: message}}`.
    Validation(BTreeMap<&'static str, String>),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "validation_errors": errors })),
            )
                .into_response(),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidId => ApiError::BadRequest("invalid order ID".to_string()),
            ServiceError::Invalid(msg) => ApiError::BadRequest(msg),
            ServiceError::NotCancelable => {
                ApiError::BadRequest("order cannot be canceled".to_string())
            }
            ServiceError::Store(StoreError::NotFound(id)) => {
                ApiError::NotFound(format!("order with ID {id} not found"))
            }
            ServiceError::TransientConflict => ApiError::Internal(err.to_string()),
            ServiceError::Corrupt(e) => ApiError::Internal(e.to_string()),
            ServiceError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Structural validation of a placement, one message per offending field.
fn validate_place(req: &PlaceOrderRequest) -> Result<(), ApiError> {
    use crate::orders::OrderType;
    use rust_decimal::Decimal;

    let mut errors = BTreeMap::new();
    if req.symbol.trim().is_empty() {
        errors.insert("symbol", "symbol is required".to_string());
    }
    if req.quantity <= 0 {
        errors.insert("quantity", "quantity must be greater than zero".to_string());
    }
    match req.order_type {
        OrderType::Limit => match req.price {
            None => {
                errors.insert("price", "price is required for limit orders".to_string());
            }
            Some(p) if p <= Decimal::ZERO => {
                errors.insert("price", "price must be greater than zero".to_string());
            }
            Some(_) => {}
        },
        OrderType::Market => {
            if req.price.is_some() {
                errors.insert("price", "price must not be set for market orders".to_string());
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(errors))
    }
}

/// `POST /api/orders`
///
/// *Success:* 200, `PlaceOrderResponse`
/// *Failure:* 400 on malformed body or field validation, 500 on internal
/// errors (the transaction was rolled back; nothing is visible).
pub async fn place_order(
    State(state): State<AppState>,
    payload: Result<Json<PlaceOrderRequest>, JsonRejection>,
) -> Result<Json<PlaceOrderResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    validate_place(&req)?;
    Ok(Json(state.service.place(&req).await?))
}

/// `DELETE /api/orders/{id}`
///
/// *Success:* 200, `{"message": "Order N canceled"}`
/// *Failure:* 400 invalid id or terminal order, 404 unknown id.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelOrderResponse>, ApiError> {
    Ok(Json(state.service.cancel(&id).await?))
}

/// `GET /api/orders/{id}`
pub async fn order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    Ok(Json(state.service.status(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SymbolQuery {
    symbol: Option<String>,
}

impl SymbolQuery {
    fn required(self) -> Result<String, ApiError> {
        self.symbol
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::BadRequest("missing symbol query parameter".to_string()))
    }
}

/// `GET /api/orderbook?symbol=…`
pub async fn order_book(
    State(state): State<AppState>,
    Query(query): Query<SymbolQuery>,
) -> Result<Json<OrderBookResponse>, ApiError> {
    let symbol = query.required()?;
    Ok(Json(state.service.book(&symbol).await?))
}

/// `GET /api/trades?symbol=…`
pub async fn list_trades(
    State(state): State<AppState>,
    Query(query): Query<SymbolQuery>,
) -> Result<Json<Vec<Trade>>, ApiError> {
    let symbol = query.required()?;
    Ok(Json(state.service.list_trades(&symbol).await?))
}

/// Constructs the application's `Router` with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/orders", post(place_order))
        .route("/orders/{id}", get(order_status).delete(cancel_order))
        .route("/orderbook", get(order_book))
        .route("/trades", get(list_trades));
    Router::new().nest("/api", api).with_state(state)
}
