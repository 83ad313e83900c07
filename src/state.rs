use sqlx::PgPool;

use crate::service::OrderService;

/// Shared application state handed to every handler.
///
/// Holds the order service (which owns the connection pool); handlers keep
/// no state of their own across calls.
#[derive(Clone)]
pub struct AppState {
    pub service: OrderService,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        Self {
            service: OrderService::new(pool),
        }
    }
}
