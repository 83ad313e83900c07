use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::{
    orders::{Order, OrderStatus, OrderType, Side},
    trade::Trade,
};

/// Result of matching one incoming order against a counter-order snapshot.
///
/// `touched` holds value copies of the resting orders that gave up
/// quantity, with their new `remaining_qty` and `status`. `incoming` is the
/// same order that came in, resolved to its final state.
#[derive(Debug)]
pub struct MatchOutcome {
    pub trades: Vec<Trade>,
    pub touched: Vec<Order>,
    pub incoming: Order,
}

#[derive(Debug, Error)]
pub enum MatchError {
    /// The store invariant says a resting order always has remaining
    /// quantity; seeing zero here means the book is corrupt.
    #[error("resting order {0} has zero remaining quantity")]
    CorruptResting(i64),
}

/// True when the incoming order is willing to trade at the resting price.
///
/// Market orders cross unconditionally; limit orders cross on a non-strict
/// comparison, so an exactly equal price trades.
fn crosses(incoming: &Order, resting: &Order) -> bool {
    match incoming.order_type {
        OrderType::Market => true,
        OrderType::Limit => match incoming.side {
            Side::Buy => incoming.price >= resting.price,
            Side::Sell => incoming.price <= resting.price,
        },
    }
}

/// Matches `incoming` against `counter`, a snapshot of open/partial
/// counter-orders already sorted by price priority then arrival time.
///
/// Pure function: no I/O, outputs depend only on the inputs. Fills execute
/// at the **resting** price. The walk stops at the first resting order the
/// price predicate rejects — the sequence is price-sorted, so nothing
/// behind it can cross either.
///
/// Terminal resolution of the incoming order:
/// - fully consumed → `filled`
/// - market with anything left → `canceled` (a market remainder never
///   rests; the unfilled quantity stays on the order)
/// - limit partially consumed → `partial`
/// - limit untouched → `open`
pub fn match_order(mut incoming: Order, counter: Vec<Order>) -> Result<MatchOutcome, MatchError> {
    let mut trades = Vec::new();
    let mut touched = Vec::new();
    let mut remaining = incoming.remaining_qty;

    for mut resting in counter {
        if remaining == 0 {
            break;
        }
        if resting.remaining_qty <= 0 {
            return Err(MatchError::CorruptResting(resting.id));
        }
        if !crosses(&incoming, &resting) {
            break;
        }

        let fill = remaining.min(resting.remaining_qty);
        remaining -= fill;
        resting.remaining_qty -= fill;
        resting.status = if resting.remaining_qty == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        let (buy_order_id, sell_order_id) = match incoming.side {
            Side::Buy => (incoming.id, resting.id),
            Side::Sell => (resting.id, incoming.id),
        };
        trades.push(Trade {
            id: 0,
            buy_order_id,
            sell_order_id,
            price: resting.price,
            quantity: fill,
            created_at: Utc::now(),
        });
        touched.push(resting);
    }

    incoming.remaining_qty = remaining;
    incoming.status = if remaining == 0 {
        OrderStatus::Filled
    } else if incoming.order_type == OrderType::Market {
        OrderStatus::Canceled
    } else if remaining < incoming.quantity {
        OrderStatus::Partial
    } else {
        OrderStatus::Open
    };

    debug!(
        order_id = incoming.id,
        trades = trades.len(),
        status = incoming.status.as_str(),
        "matched incoming order"
    );

    Ok(MatchOutcome {
        trades,
        touched,
        incoming,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn resting(id: i64, side: Side, price: Decimal, qty: i64, t_offset: i64) -> Order {
        Order {
            id,
            symbol: "TEST".into(),
            side,
            order_type: OrderType::Limit,
            price,
            quantity: qty,
            remaining_qty: qty,
            status: OrderStatus::Open,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(t_offset),
        }
    }

    fn incoming_limit(id: i64, side: Side, price: Decimal, qty: i64) -> Order {
        Order {
            order_type: OrderType::Limit,
            ..resting(id, side, price, qty, 100)
        }
    }

    fn incoming_market(id: i64, side: Side, qty: i64) -> Order {
        Order {
            order_type: OrderType::Market,
            price: Decimal::ZERO,
            ..resting(id, side, Decimal::ZERO, qty, 100)
        }
    }

    /// Resting sell 100.0 x 50, incoming buy limit 100.0 x 50: one trade,
    /// both sides filled, equal prices cross.
    #[test]
    fn exact_full_match() {
        let sells = vec![resting(1, Side::Sell, dec!(100.0), 50, 0)];
        let out = match_order(incoming_limit(2, Side::Buy, dec!(100.0), 50), sells).unwrap();

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].price, dec!(100.0));
        assert_eq!(out.trades[0].quantity, 50);
        assert_eq!(out.trades[0].buy_order_id, 2);
        assert_eq!(out.trades[0].sell_order_id, 1);
        assert_eq!(out.incoming.status, OrderStatus::Filled);
        assert_eq!(out.incoming.remaining_qty, 0);
        assert_eq!(out.touched[0].status, OrderStatus::Filled);
        assert_eq!(out.touched[0].remaining_qty, 0);
    }

    /// Resting sell 200.0 x 30, incoming buy limit 200.0 x 50: incoming is
    /// left partial with 20, resting fills.
    #[test]
    fn partial_fill_of_incoming() {
        let sells = vec![resting(1, Side::Sell, dec!(200.0), 30, 0)];
        let out = match_order(incoming_limit(2, Side::Buy, dec!(200.0), 50), sells).unwrap();

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].quantity, 30);
        assert_eq!(out.incoming.status, OrderStatus::Partial);
        assert_eq!(out.incoming.remaining_qty, 20);
        assert_eq!(out.touched[0].status, OrderStatus::Filled);
    }

    /// Sells at 300.0 x 25 and 301.0 x 30; buy limit 301.0 x 40 walks both
    /// levels, each fill at the resting price.
    #[test]
    fn walk_the_book_across_price_levels() {
        let sells = vec![
            resting(1, Side::Sell, dec!(300.0), 25, 0),
            resting(2, Side::Sell, dec!(301.0), 30, 1),
        ];
        let out = match_order(incoming_limit(3, Side::Buy, dec!(301.0), 40), sells).unwrap();

        assert_eq!(out.trades.len(), 2);
        assert_eq!((out.trades[0].price, out.trades[0].quantity), (dec!(300.0), 25));
        assert_eq!((out.trades[1].price, out.trades[1].quantity), (dec!(301.0), 15));
        assert_eq!(out.incoming.status, OrderStatus::Filled);
        assert_eq!(out.touched[0].status, OrderStatus::Filled);
        assert_eq!(out.touched[1].status, OrderStatus::Partial);
        assert_eq!(out.touched[1].remaining_qty, 15);
    }

    /// Bid below the ask: no cross, incoming limit rests open.
    #[test]
    fn no_cross_leaves_limit_open() {
        let sells = vec![resting(1, Side::Sell, dec!(400.0), 50, 0)];
        let out = match_order(incoming_limit(2, Side::Buy, dec!(390.0), 25), sells).unwrap();

        assert!(out.trades.is_empty());
        assert!(out.touched.is_empty());
        assert_eq!(out.incoming.status, OrderStatus::Open);
        assert_eq!(out.incoming.remaining_qty, 25);
    }

    /// A market order against an empty book cannot rest: canceled, with
    /// the unfilled quantity left on the order.
    #[test]
    fn market_order_on_empty_book_is_canceled() {
        let out = match_order(incoming_market(1, Side::Buy, 30), vec![]).unwrap();

        assert!(out.trades.is_empty());
        assert_eq!(out.incoming.status, OrderStatus::Canceled);
        assert_eq!(out.incoming.remaining_qty, 30);
    }

    /// A market order that exhausts the book resolves terminal canceled,
    /// never partial — the remainder is not parked.
    #[test]
    fn market_order_partial_fill_is_canceled_not_parked() {
        let sells = vec![resting(1, Side::Sell, dec!(10.0), 20, 0)];
        let out = match_order(incoming_market(2, Side::Buy, 50), sells).unwrap();

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].quantity, 20);
        assert_eq!(out.incoming.status, OrderStatus::Canceled);
        assert_eq!(out.incoming.remaining_qty, 30);
    }

    /// Two sells at the same price: the earlier one fills first (FIFO),
    /// the later one is untouched.
    #[test]
    fn time_priority_within_a_price_level() {
        let sells = vec![
            resting(1, Side::Sell, dec!(100), 30, 0),
            resting(2, Side::Sell, dec!(100), 20, 5),
        ];
        let out = match_order(incoming_limit(3, Side::Buy, dec!(100), 25), sells).unwrap();

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].sell_order_id, 1);
        assert_eq!(out.trades[0].quantity, 25);
        assert_eq!(out.touched.len(), 1);
        assert_eq!(out.touched[0].id, 1);
        assert_eq!(out.touched[0].status, OrderStatus::Partial);
        assert_eq!(out.touched[0].remaining_qty, 5);
        assert_eq!(out.incoming.status, OrderStatus::Filled);
    }

    /// An incoming sell matches the richest bid first and fills at the
    /// bid's price, not its own.
    #[test]
    fn incoming_sell_fills_at_bid_price() {
        let bids = vec![
            resting(1, Side::Buy, dec!(105.0), 10, 0),
            resting(2, Side::Buy, dec!(101.0), 10, 1),
        ];
        let out = match_order(incoming_limit(3, Side::Sell, dec!(100.0), 15), bids).unwrap();

        assert_eq!(out.trades.len(), 2);
        assert_eq!(out.trades[0].price, dec!(105.0));
        assert_eq!(out.trades[1].price, dec!(101.0));
        assert_eq!(out.trades[1].quantity, 5);
        assert_eq!(out.trades[0].buy_order_id, 1);
        assert_eq!(out.trades[0].sell_order_id, 3);
    }

    /// The walk stops at the first resting order that fails the price
    /// predicate; the sequence is price-sorted so nothing after it crosses.
    #[test]
    fn walk_stops_at_first_non_crossing_level() {
        let sells = vec![
            resting(1, Side::Sell, dec!(100.0), 10, 0),
            resting(2, Side::Sell, dec!(110.0), 10, 1),
        ];
        let out = match_order(incoming_limit(3, Side::Buy, dec!(105.0), 30), sells).unwrap();

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].quantity, 10);
        assert_eq!(out.incoming.status, OrderStatus::Partial);
        assert_eq!(out.incoming.remaining_qty, 20);
    }

    /// A resting order with zero remaining quantity violates the store
    /// invariant and must be reported, not silently skipped.
    #[test]
    fn zero_remaining_resting_order_is_corruption() {
        let mut bad = resting(7, Side::Sell, dec!(100.0), 10, 0);
        bad.remaining_qty = 0;
        let err = match_order(incoming_limit(8, Side::Buy, dec!(100.0), 5), vec![bad]).unwrap_err();
        assert!(matches!(err, MatchError::CorruptResting(7)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashMap;

        #[derive(Debug, Clone)]
        struct Op {
            side: Side,
            order_type: OrderType,
            price: Decimal,
            quantity: i64,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            (
                prop::bool::ANY,
                prop::bool::ANY,
                1i64..=20,
                1i64..=50,
            )
                .prop_map(|(buy, market, price, quantity)| Op {
                    side: if buy { Side::Buy } else { Side::Sell },
                    order_type: if market {
                        OrderType::Market
                    } else {
                        OrderType::Limit
                    },
                    price: Decimal::from(price),
                    quantity,
                })
        }

        /// Sort a live-book snapshot the way `scan_counter` does for the
        /// given incoming side.
        fn counter_snapshot(book: &[Order], incoming_side: Side) -> Vec<Order> {
            let mut counter: Vec<Order> = book
                .iter()
                .filter(|o| o.side == incoming_side.opposite())
                .cloned()
                .collect();
            counter.sort_by(|a, b| {
                let by_price = match incoming_side {
                    Side::Buy => a.price.cmp(&b.price),
                    Side::Sell => b.price.cmp(&a.price),
                };
                by_price
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });
            counter
        }

        proptest! {
            /// Replays random order flow through the engine against an
            /// in-test book model and checks the committed-state laws:
            /// quantity bounds, conservation, maker pricing, price-time
            /// priority of emitted trades, and a never-crossed book.
            #[test]
            fn random_order_flow_preserves_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
                let mut book: Vec<Order> = Vec::new();
                let mut filled_by_order: HashMap<i64, i64> = HashMap::new();
                let mut original_qty: HashMap<i64, i64> = HashMap::new();
                let mut final_remaining: HashMap<i64, i64> = HashMap::new();

                for (i, op) in ops.iter().enumerate() {
                    let id = (i + 1) as i64;
                    let mut incoming = Order::submitted(
                        "PROP".into(),
                        op.side,
                        op.order_type,
                        if op.order_type == OrderType::Market { Decimal::ZERO } else { op.price },
                        op.quantity,
                    );
                    incoming.id = id;
                    original_qty.insert(id, op.quantity);

                    let counter = counter_snapshot(&book, op.side);
                    let prices_before: HashMap<i64, Decimal> =
                        counter.iter().map(|o| (o.id, o.price)).collect();
                    let out = match_order(incoming, counter).unwrap();

                    // Quantity bounds on every output order.
                    prop_assert!(out.incoming.remaining_qty >= 0);
                    prop_assert!(out.incoming.remaining_qty <= out.incoming.quantity);
                    for t in &out.touched {
                        prop_assert!(t.remaining_qty >= 0 && t.remaining_qty <= t.quantity);
                        prop_assert_eq!(
                            t.status == OrderStatus::Filled,
                            t.remaining_qty == 0
                        );
                    }

                    // Maker pricing: every trade priced at the resting
                    // order's price as it stood before the match.
                    for t in &out.trades {
                        let maker_id = if op.side == Side::Buy { t.sell_order_id } else { t.buy_order_id };
                        prop_assert_eq!(t.price, prices_before[&maker_id]);
                        prop_assert!(t.quantity > 0);
                    }

                    // Price priority across the trade sequence.
                    for pair in out.trades.windows(2) {
                        match op.side {
                            Side::Buy => prop_assert!(pair[0].price <= pair[1].price),
                            Side::Sell => prop_assert!(pair[0].price >= pair[1].price),
                        }
                    }

                    // Fill accounting.
                    for t in &out.trades {
                        *filled_by_order.entry(t.buy_order_id).or_insert(0) += t.quantity;
                        *filled_by_order.entry(t.sell_order_id).or_insert(0) += t.quantity;
                    }

                    // Commit the outcome to the model book.
                    for touched in &out.touched {
                        if let Some(slot) = book.iter_mut().find(|o| o.id == touched.id) {
                            *slot = touched.clone();
                        }
                        final_remaining.insert(touched.id, touched.remaining_qty);
                    }
                    book.retain(|o| !o.status.is_terminal());
                    final_remaining.insert(out.incoming.id, out.incoming.remaining_qty);
                    if !out.incoming.status.is_terminal() {
                        book.push(out.incoming);
                    }

                    // Non-crossing book after every committed placement.
                    let best_bid = book.iter().filter(|o| o.side == Side::Buy).map(|o| o.price).max();
                    let best_ask = book.iter().filter(|o| o.side == Side::Sell).map(|o| o.price).min();
                    if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
                        prop_assert!(bid < ask);
                    }
                }

                // Conservation: executed quantity equals the sum of trade
                // quantities referencing the order.
                for (id, qty) in &original_qty {
                    let executed = qty - final_remaining[id];
                    prop_assert_eq!(executed, *filled_by_order.get(id).unwrap_or(&0));
                }
            }
        }
    }
}
