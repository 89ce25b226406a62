use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{CurrencyPair, LimitOrder, OpenOrder, OrderBook, Ticker};
use crate::ports::gateway::{ExchangeGateway, GatewayError};
use crate::rate_limit_notifier::notify_rate_limit;

/// Wraps a venue connector and inspects every error it returns before
/// handing it on unchanged.
pub struct GatewayBox {
    venue: String,
    pub inner: Arc<dyn ExchangeGateway>,
}

impl GatewayBox {
    pub fn new(venue: &str, inner: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            venue: venue.to_string(),
            inner,
        }
    }

    fn report_error(&self, operation: &str, detail: &str, err: &GatewayError) {
        match err {
            GatewayError::RateLimited(text) => {
                let context = format!("{}:{} ({})", self.venue, operation, detail);
                notify_rate_limit(&context, text);
            }
            GatewayError::Unknown(text) => {
                log::error!(
                    "[GATEWAY] unclassified error from {} during {} ({}): {}",
                    self.venue,
                    operation,
                    detail,
                    text
                );
            }
            _ => {}
        }
    }

    fn inspect<T>(
        &self,
        operation: &str,
        detail: &str,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        if let Err(ref err) = result {
            self.report_error(operation, detail, err);
        }
        result
    }
}

#[async_trait]
impl ExchangeGateway for GatewayBox {
    async fn get_tickers(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<CurrencyPair, Ticker>, GatewayError> {
        let result = self.inner.get_tickers(pairs).await;
        self.inspect("get_tickers", &format!("{} pairs", pairs.len()), result)
    }

    async fn get_ticker(&self, pair: &CurrencyPair) -> Result<Ticker, GatewayError> {
        let result = self.inner.get_ticker(pair).await;
        self.inspect("get_ticker", &pair.to_string(), result)
    }

    async fn get_order_book(&self, pair: &CurrencyPair) -> Result<OrderBook, GatewayError> {
        let result = self.inner.get_order_book(pair).await;
        self.inspect("get_order_book", &pair.to_string(), result)
    }

    async fn get_account_balance(&self, currency: &str) -> Result<Decimal, GatewayError> {
        let result = self.inner.get_account_balance(currency).await;
        self.inspect("get_account_balance", currency, result)
    }

    async fn get_dynamic_fees(&self) -> Result<HashMap<CurrencyPair, Decimal>, GatewayError> {
        let result = self.inner.get_dynamic_fees().await;
        self.inspect("get_dynamic_fees", "all", result)
    }

    fn metadata_fee(&self, pair: &CurrencyPair) -> Option<Decimal> {
        self.inner.metadata_fee(pair)
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<String, GatewayError> {
        let result = self.inner.place_limit_order(order).await;
        self.inspect(
            "place_limit_order",
            &format!(
                "{} | side={:?} volume={} price={} margin={}",
                order.pair, order.side, order.volume, order.price, order.margin
            ),
            result,
        )
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let result = self.inner.get_open_orders().await;
        self.inspect("get_open_orders", "all", result)
    }

    async fn get_order(&self, order_id: &str) -> Result<Decimal, GatewayError> {
        let result = self.inner.get_order(order_id).await;
        self.inspect("get_order", order_id, result)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let result = self.inner.cancel_order(order_id).await;
        self.inspect("cancel_order", order_id, result)
    }
}
