use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{CurrencyPair, LimitOrder, OpenOrder, OrderBook, Ticker};

/// Error taxonomy at the venue boundary. Connectors map whatever their
/// client library raises into one of these before it reaches the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// A client error the connector could not classify.
    #[error("unclassified error: {0}")]
    Unknown(String),
    /// Programming-level failure inside a connector.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Only programming-level errors escalate out of a cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Internal(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, GatewayError::NotSupported(_))
    }
}

/// Per-venue capability consumed by the engine. Every pair passed in is
/// already converted to the venue's native form.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_tickers(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<CurrencyPair, Ticker>, GatewayError>;

    async fn get_ticker(&self, pair: &CurrencyPair) -> Result<Ticker, GatewayError>;

    async fn get_order_book(&self, pair: &CurrencyPair) -> Result<OrderBook, GatewayError>;

    /// Available balance of `currency`; zero when the account holds none.
    async fn get_account_balance(&self, currency: &str) -> Result<Decimal, GatewayError>;

    async fn get_dynamic_fees(&self) -> Result<HashMap<CurrencyPair, Decimal>, GatewayError>;

    /// Static per-instrument maker fee from venue metadata, if published.
    fn metadata_fee(&self, pair: &CurrencyPair) -> Option<Decimal>;

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<String, GatewayError>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError>;

    /// Remaining (unfilled) volume of an order.
    async fn get_order(&self, order_id: &str) -> Result<Decimal, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;
}
