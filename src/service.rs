use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    engine::{self, MatchError},
    orders::{Order, OrderStatus, OrderType, Side},
    store::{OrderStore, StoreError, TradeStore},
    trade::Trade,
};

/// Serialization conflicts between concurrent placements are expected
/// under SERIALIZABLE; a few short retries absorb almost all of them.
const MAX_PLACE_ATTEMPTS: u32 = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid order ID")]
    InvalidId,

    #[error("{0}")]
    Invalid(String),

    #[error("order cannot be canceled")]
    NotCancelable,

    #[error("placement conflicted with concurrent orders; retries exhausted")]
    TransientConflict,

    #[error(transparent)]
    Corrupt(#[from] MatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub quantity: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub order_id: i64,
    pub status: OrderStatus,
    pub remaining_quantity: i64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelOrderResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderStatusResponse {
    pub order_id: i64,
    pub status: OrderStatus,
    pub executed_quantity: i64,
    pub remaining_quantity: i64,
}

/// One aggregated price level of the book.
#[derive(Debug, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderBookResponse {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Transaction coordinator for the matching subsystem.
///
/// Owns no durable state itself; every placement/cancel runs inside a
/// transaction that rolls back on drop unless explicitly committed, so no
/// error path can leave partial trades behind.
#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
    orders: OrderStore,
    trades: TradeStore,
}

impl OrderService {
    pub fn new(pool: PgPool) -> Self {
        let orders = OrderStore::new(pool.clone());
        let trades = TradeStore::new(pool.clone());
        Self {
            pool,
            orders,
            trades,
        }
    }

    /// Place an order: insert, match against the book, persist the trades
    /// and every touched order, all under one SERIALIZABLE transaction.
    ///
    /// Serializable isolation is what keeps two concurrent placements on
    /// the same symbol from both consuming the same resting liquidity;
    /// conflicts abort one of them, which we retry a bounded number of
    /// times before surfacing `TransientConflict`.
    pub async fn place(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderResponse, ServiceError> {
        validate_place(req)?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_place(req).await {
                Err(ServiceError::Store(StoreError::Database(err)))
                    if is_serialization_failure(&err) =>
                {
                    if attempt >= MAX_PLACE_ATTEMPTS {
                        warn!(attempt, symbol = %req.symbol, "placement retries exhausted");
                        return Err(ServiceError::TransientConflict);
                    }
                    debug!(attempt, symbol = %req.symbol, "serialization conflict, retrying");
                    tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn try_place(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderResponse, ServiceError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        // Market orders carry no meaningful price; store zero.
        let price = match req.order_type {
            OrderType::Limit => req.price.unwrap_or(Decimal::ZERO),
            OrderType::Market => Decimal::ZERO,
        };
        let mut order = Order::submitted(
            req.symbol.clone(),
            req.side,
            req.order_type,
            price,
            req.quantity,
        );
        order.id = self.orders.insert(&mut *tx, &order).await?;

        // The scan sees only the opposite side, so the just-inserted row
        // can never be its own counter-order.
        let counter = self
            .orders
            .scan_counter(&mut *tx, &order.symbol, order.side)
            .await?;
        let outcome = engine::match_order(order, counter)?;

        for trade in &outcome.trades {
            self.trades.insert(&mut *tx, trade).await?;
        }
        for touched in &outcome.touched {
            self.orders.update(&mut *tx, touched).await?;
        }
        self.orders.update(&mut *tx, &outcome.incoming).await?;

        tx.commit().await.map_err(StoreError::from)?;

        info!(
            order_id = outcome.incoming.id,
            symbol = %outcome.incoming.symbol,
            status = outcome.incoming.status.as_str(),
            trades = outcome.trades.len(),
            "order placed"
        );
        Ok(PlaceOrderResponse {
            order_id: outcome.incoming.id,
            status: outcome.incoming.status,
            remaining_quantity: outcome.incoming.remaining_qty,
            message: "Order placed successfully".to_string(),
        })
    }

    /// Cancel a live order: zero its remaining quantity and mark it
    /// `canceled`. Terminal orders are rejected. The row lock makes the
    /// read-then-write safe against a concurrent fill.
    pub async fn cancel(&self, id_str: &str) -> Result<CancelOrderResponse, ServiceError> {
        let id: i64 = id_str.parse().map_err(|_| ServiceError::InvalidId)?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut order = self.orders.get_for_update(&mut *tx, id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::NotCancelable);
        }
        order.status = OrderStatus::Canceled;
        order.remaining_qty = 0;
        self.orders.update(&mut *tx, &order).await?;
        tx.commit().await.map_err(StoreError::from)?;

        info!(order_id = id, "order canceled");
        Ok(CancelOrderResponse {
            message: format!("Order {id} canceled"),
        })
    }

    pub async fn status(&self, id_str: &str) -> Result<OrderStatusResponse, ServiceError> {
        let id: i64 = id_str.parse().map_err(|_| ServiceError::InvalidId)?;
        let order = self.orders.get(id).await?;
        Ok(OrderStatusResponse {
            order_id: order.id,
            status: order.status,
            executed_quantity: order.executed_qty(),
            remaining_quantity: order.remaining_qty,
        })
    }

    /// Snapshot the live book for a symbol, remaining quantity aggregated
    /// by price level: bids descending, asks ascending.
    pub async fn book(&self, symbol: &str) -> Result<OrderBookResponse, ServiceError> {
        if symbol.is_empty() {
            return Err(ServiceError::Invalid("symbol is required".to_string()));
        }
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        // The live bids are exactly what an incoming sell would scan, and
        // the scan already returns them in display order; same for asks.
        let bids = self.orders.scan_counter(&mut *tx, symbol, Side::Sell).await?;
        let asks = self.orders.scan_counter(&mut *tx, symbol, Side::Buy).await?;
        tx.commit().await.map_err(StoreError::from)?;

        Ok(OrderBookResponse {
            symbol: symbol.to_string(),
            bids: aggregate_levels(&bids, true),
            asks: aggregate_levels(&asks, false),
        })
    }

    pub async fn list_trades(&self, symbol: &str) -> Result<Vec<Trade>, ServiceError> {
        if symbol.is_empty() {
            return Err(ServiceError::Invalid("symbol is required".to_string()));
        }
        Ok(self.trades.list_by_symbol(symbol).await?)
    }
}

/// Coarse shape validation; the adapter performs the per-field variant
/// with user-facing messages, this guards direct service callers.
fn validate_place(req: &PlaceOrderRequest) -> Result<(), ServiceError> {
    if req.symbol.trim().is_empty() {
        return Err(ServiceError::Invalid("symbol is required".to_string()));
    }
    if req.quantity <= 0 {
        return Err(ServiceError::Invalid(
            "quantity must be positive".to_string(),
        ));
    }
    match req.order_type {
        OrderType::Limit => match req.price {
            Some(p) if p > Decimal::ZERO => Ok(()),
            _ => Err(ServiceError::Invalid(
                "limit orders require a positive price".to_string(),
            )),
        },
        OrderType::Market => {
            if req.price.is_some() {
                Err(ServiceError::Invalid(
                    "market orders must not carry a price".to_string(),
                ))
            } else {
                Ok(())
            }
        }
    }
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("40001")
    )
}

/// Sum remaining quantity per price into sorted levels.
fn aggregate_levels(orders: &[Order], descending: bool) -> Vec<PriceLevel> {
    let mut by_price: BTreeMap<Decimal, i64> = BTreeMap::new();
    for order in orders {
        *by_price.entry(order.price).or_insert(0) += order.remaining_qty;
    }
    let levels = by_price
        .into_iter()
        .map(|(price, quantity)| PriceLevel { price, quantity });
    if descending {
        levels.rev().collect()
    } else {
        levels.collect()
    }
}
