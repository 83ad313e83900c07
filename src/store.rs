use std::time::Duration;

use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgExecutor, PgPool, Row,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::DbConfig,
    orders::{Order, Side},
    trade::Trade,
};

/// Idempotent DDL; safe to run on every startup.
const SCHEMA: &str = include_str!("../schema.sql");

/// Errors from the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order with ID {0} not found")]
    NotFound(i64),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Postgres integrity violations (class 23) map to `Constraint` so the
/// storage boundary reports bad writes as such rather than as opaque
/// database failures.
fn write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().map(|c| c.starts_with("23")).unwrap_or(false) {
            return StoreError::Constraint(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

/// Connect to Postgres, waiting for it to come up.
///
/// Retries every 2 seconds up to `max_connect_attempts` times, matching
/// the container startup window the service is deployed with.
pub async fn connect(cfg: &DbConfig) -> StoreResult<PgPool> {
    let url = cfg.url();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await
        {
            Ok(pool) => {
                info!(attempt, "connected to postgres");
                return Ok(pool);
            }
            Err(err) if attempt >= cfg.max_connect_attempts => {
                return Err(StoreError::Database(err));
            }
            Err(err) => {
                warn!(attempt, error = %err, "postgres not ready, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

pub async fn init_schema(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema initialized");
    Ok(())
}

/// Enum↔text conversion lives here, at the storage edge; everything above
/// this line works with typed variants.
fn order_from_row(row: &PgRow) -> Result<Order, sqlx::Error> {
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        side: side.parse().map_err(|e| sqlx::Error::ColumnDecode {
            index: "side".into(),
            source: Box::new(e),
        })?,
        order_type: order_type.parse().map_err(|e| sqlx::Error::ColumnDecode {
            index: "type".into(),
            source: Box::new(e),
        })?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        remaining_qty: row.try_get("remaining_quantity")?,
        status: status.parse().map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: Box::new(e),
        })?,
        created_at: row.try_get("created_at")?,
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade, sqlx::Error> {
    Ok(Trade {
        id: row.try_get("id")?,
        buy_order_id: row.try_get("buy_order_id")?,
        sell_order_id: row.try_get("sell_order_id")?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        created_at: row.try_get("created_at")?,
    })
}

const ORDER_COLUMNS: &str =
    "id, symbol, side, type, price, quantity, remaining_quantity, status, created_at";

/// Durable order rows. Mutating operations run on whatever executor the
/// caller passes in, so they join the caller's transaction; reads may run
/// straight off the pool.
#[derive(Debug, Clone)]
pub struct OrderStore {
    pool: PgPool,
}

impl OrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a new order and return its store-assigned monotonic id.
    pub async fn insert<'e>(&self, exec: impl PgExecutor<'e>, order: &Order) -> StoreResult<i64> {
        if order.quantity <= 0 {
            return Err(StoreError::Constraint("quantity must be positive".into()));
        }
        if order.remaining_qty < 0 || order.remaining_qty > order.quantity {
            return Err(StoreError::Constraint(
                "remaining quantity out of range".into(),
            ));
        }
        let row = sqlx::query(
            "INSERT INTO orders (symbol, side, type, price, quantity, remaining_quantity, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.remaining_qty)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .fetch_one(exec)
        .await
        .map_err(write_error)?;
        Ok(row.try_get("id")?)
    }

    /// Write back `remaining_quantity` and `status`. Idempotent under equal
    /// inputs; `NotFound` when the id does not exist.
    pub async fn update<'e>(&self, exec: impl PgExecutor<'e>, order: &Order) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE orders SET remaining_quantity = $1, status = $2 WHERE id = $3",
        )
        .bind(order.remaining_qty)
        .bind(order.status.as_str())
        .bind(order.id)
        .execute(exec)
        .await
        .map_err(write_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(order.id));
        }
        Ok(())
    }

    /// Snapshot one order outside any transaction.
    pub async fn get(&self, id: i64) -> StoreResult<Order> {
        self.get_with(&self.pool, id).await
    }

    /// Snapshot one order on the given executor.
    pub async fn get_with<'e>(&self, exec: impl PgExecutor<'e>, id: i64) -> StoreResult<Order> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        sqlx::query(&query)
            .bind(id)
            .try_map(|row: PgRow| order_from_row(&row))
            .fetch_optional(exec)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    /// Like `get_with`, but takes a row lock so a read-then-write sequence
    /// (cancel) cannot race a concurrent fill.
    pub async fn get_for_update<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        id: i64,
    ) -> StoreResult<Order> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        sqlx::query(&query)
            .bind(id)
            .try_map(|row: PgRow| order_from_row(&row))
            .fetch_optional(exec)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    /// All live (open/partial) orders an incoming order could trade
    /// against, in matching priority order:
    /// cheapest asks first for an incoming buy, richest bids first for an
    /// incoming sell, then arrival time, then id as a stable tiebreaker.
    pub async fn scan_counter<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        symbol: &str,
        incoming_side: Side,
    ) -> StoreResult<Vec<Order>> {
        let order_by = match incoming_side {
            Side::Buy => "price ASC, created_at ASC, id ASC",
            Side::Sell => "price DESC, created_at ASC, id ASC",
        };
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE symbol = $1 AND side = $2 AND status IN ('open', 'partial')
             ORDER BY {order_by}"
        );
        let orders = sqlx::query(&query)
            .bind(symbol)
            .bind(incoming_side.opposite().as_str())
            .try_map(|row: PgRow| order_from_row(&row))
            .fetch_all(exec)
            .await?;
        Ok(orders)
    }
}

/// Append-only trade log.
#[derive(Debug, Clone)]
pub struct TradeStore {
    pool: PgPool,
}

impl TradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a trade within the caller's transaction and return its
    /// assigned id.
    pub async fn insert<'e>(&self, exec: impl PgExecutor<'e>, trade: &Trade) -> StoreResult<i64> {
        let row = sqlx::query(
            "INSERT INTO trades (buy_order_id, sell_order_id, price, quantity, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(trade.buy_order_id)
        .bind(trade.sell_order_id)
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.created_at)
        .fetch_one(exec)
        .await
        .map_err(write_error)?;
        Ok(row.try_get("id")?)
    }

    /// Trades where either participating order has the given symbol,
    /// deduplicated by trade id, ascending id (creation order).
    pub async fn list_by_symbol(&self, symbol: &str) -> StoreResult<Vec<Trade>> {
        let trades = sqlx::query(
            "SELECT DISTINCT ON (t.id)
                    t.id, t.buy_order_id, t.sell_order_id, t.price, t.quantity, t.created_at
             FROM trades t
             JOIN orders o ON o.id = t.buy_order_id OR o.id = t.sell_order_id
             WHERE o.symbol = $1
             ORDER BY t.id ASC",
        )
        .bind(symbol)
        .try_map(|row: PgRow| trade_from_row(&row))
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }
}
