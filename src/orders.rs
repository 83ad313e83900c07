use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a stored enum column holds a value outside its domain.
///
/// With `Side`/`OrderType`/`OrderStatus` modeled as enums this can only
/// happen on the way *out* of storage, never on the way in.
#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct InvalidEnum {
    pub kind: &'static str,
    pub value: String,
}

/// Which side of the market the order is on.
///
/// Buy orders (bids) rank from **highest to lowest price**, sell orders
/// (asks) from **lowest to highest**, so the matching engine always sees
/// the best counterparty price first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The side a counter-order must have to match this one.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl FromStr for Side {
    type Err = InvalidEnum;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(InvalidEnum {
                kind: "order side",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether an order executes at a price bound (`Limit`) or at whatever the
/// book offers (`Market`). A market remainder never rests; it is canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

impl FromStr for OrderType {
    type Err = InvalidEnum;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(InvalidEnum {
                kind: "order type",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of an order.
///
/// `Open` and `Partial` are the only states visible to the book scan;
/// `Filled` and `Canceled` are terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

impl FromStr for OrderStatus {
    type Err = InvalidEnum;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "partial" => Ok(OrderStatus::Partial),
            "filled" => Ok(OrderStatus::Filled),
            "canceled" => Ok(OrderStatus::Canceled),
            other => Err(InvalidEnum {
                kind: "order status",
                value: other.to_string(),
            }),
        }
    }
}

/// An order as persisted in the store.
///
/// - `quantity` is the original size and never changes.
/// - `remaining_qty` only ever decreases, and stays in `[0, quantity]`.
/// - `price` is the limit bound; market orders store 0 and ignore it.
/// - `created_at` is the time-priority tiebreaker within a price level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: i64,
    #[serde(rename = "remaining_quantity")]
    pub remaining_qty: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// A freshly submitted order: `open`, nothing executed yet, id 0 until
    /// the store assigns one.
    pub fn submitted(
        symbol: String,
        side: Side,
        order_type: OrderType,
        price: Decimal,
        quantity: i64,
    ) -> Self {
        Order {
            id: 0,
            symbol,
            side,
            order_type,
            price,
            quantity,
            remaining_qty: quantity,
            status: OrderStatus::Open,
            created_at: Utc::now(),
        }
    }

    pub fn executed_qty(&self) -> i64 {
        self.quantity - self.remaining_qty
    }
}
