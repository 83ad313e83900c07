use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A matched transaction between two orders.
///
/// - The price comes from the maker's (resting) order.
/// - `quantity` is the amount filled on both sides.
/// - Participants are recorded by side; id 0 means the trade has not been
///   persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub buy_order_id: i64,
    pub sell_order_id: i64,
    pub price: Decimal,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}
