//! Scripted in-memory gateway shared by the unit tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::{CurrencyPair, LimitOrder, OpenOrder, OrderBook, OrderBookLevel, Ticker};
use crate::ports::gateway::{ExchangeGateway, GatewayError};
use crate::venue::Venue;

pub fn pair(raw: &str) -> CurrencyPair {
    raw.parse().unwrap()
}

pub fn test_venue(name: &str, gateway: Arc<dyn ExchangeGateway>) -> Venue {
    Venue {
        name: name.to_string(),
        home_currency: "USD".to_string(),
        trading_pairs: vec![pair("BTC/USD")],
        margin: true,
        margin_exclude: Default::default(),
        fee: None,
        gateway,
    }
}

/// A book deep enough that any test-sized order fills at `price`.
pub fn flat_book(bid: Decimal, ask: Decimal) -> OrderBook {
    OrderBook {
        bids: vec![OrderBookLevel {
            price: bid,
            volume: Decimal::from(1_000_000),
        }],
        asks: vec![OrderBookLevel {
            price: ask,
            volume: Decimal::from(1_000_000),
        }],
    }
}

#[derive(Debug, Clone)]
struct MockOrder {
    order: LimitOrder,
    remaining: Decimal,
}

#[derive(Default)]
pub struct MockGateway {
    tickers: Mutex<HashMap<CurrencyPair, Ticker>>,
    ticker_error: Mutex<Option<GatewayError>>,
    batch_unsupported: Mutex<bool>,
    books: Mutex<HashMap<CurrencyPair, OrderBook>>,
    balances: Mutex<HashMap<String, Decimal>>,
    balance_error: Mutex<Option<GatewayError>>,
    dynamic_fees: Mutex<Option<Result<HashMap<CurrencyPair, Decimal>, GatewayError>>>,
    metadata_fees: Mutex<HashMap<CurrencyPair, Decimal>>,
    orders: Mutex<Vec<(String, MockOrder)>>,
    place_error: Mutex<Option<GatewayError>>,
    cancel_error: Mutex<Option<GatewayError>>,
    order_lookup_error: Mutex<Option<GatewayError>>,
    never_fill: Mutex<bool>,
    open_orders_error: Mutex<Option<GatewayError>>,
    cancelled: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    open_order_polls: AtomicUsize,
}

impl MockGateway {
    pub fn set_ticker(&self, raw_pair: &str, bid: Decimal, ask: Decimal) {
        let p = pair(raw_pair);
        self.tickers.lock().unwrap().insert(
            p.clone(),
            Ticker {
                pair: p,
                bid,
                ask,
            },
        );
    }

    pub fn clear_tickers(&self) {
        self.tickers.lock().unwrap().clear();
    }

    pub fn fail_tickers(&self, err: GatewayError) {
        *self.ticker_error.lock().unwrap() = Some(err);
    }

    pub fn disable_batch_tickers(&self) {
        *self.batch_unsupported.lock().unwrap() = true;
    }

    pub fn set_book(&self, raw_pair: &str, book: OrderBook) {
        self.books.lock().unwrap().insert(pair(raw_pair), book);
    }

    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(currency.to_string(), amount);
    }

    pub fn fail_balances(&self, err: GatewayError) {
        *self.balance_error.lock().unwrap() = Some(err);
    }

    pub fn set_dynamic_fees(&self, fees: Result<HashMap<CurrencyPair, Decimal>, GatewayError>) {
        *self.dynamic_fees.lock().unwrap() = Some(fees);
    }

    pub fn set_metadata_fee(&self, raw_pair: &str, fee: Decimal) {
        self.metadata_fees.lock().unwrap().insert(pair(raw_pair), fee);
    }

    pub fn fail_placement(&self, err: GatewayError) {
        *self.place_error.lock().unwrap() = Some(err);
    }

    pub fn fail_cancel(&self, err: GatewayError) {
        *self.cancel_error.lock().unwrap() = Some(err);
    }

    pub fn fail_order_lookup(&self, err: GatewayError) {
        *self.order_lookup_error.lock().unwrap() = Some(err);
    }

    pub fn fail_open_orders(&self, err: Option<GatewayError>) {
        *self.open_orders_error.lock().unwrap() = err;
    }

    pub fn set_never_fill(&self, never: bool) {
        *self.never_fill.lock().unwrap() = never;
    }

    /// Leaves an order partially filled.
    pub fn set_remaining(&self, order_id: &str, remaining: Decimal) {
        for (id, order) in self.orders.lock().unwrap().iter_mut() {
            if id == order_id {
                order.remaining = remaining;
            }
        }
    }

    pub fn placed(&self) -> Vec<LimitOrder> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .map(|(_, o)| o.order.clone())
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn open_order_polls(&self) -> usize {
        self.open_order_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn get_tickers(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<CurrencyPair, Ticker>, GatewayError> {
        if *self.batch_unsupported.lock().unwrap() {
            return Err(GatewayError::NotSupported("get_tickers".into()));
        }
        if let Some(err) = self.ticker_error.lock().unwrap().clone() {
            return Err(err);
        }
        let tickers = self.tickers.lock().unwrap();
        Ok(pairs
            .iter()
            .filter_map(|p| tickers.get(p).map(|t| (p.clone(), t.clone())))
            .collect())
    }

    async fn get_ticker(&self, pair: &CurrencyPair) -> Result<Ticker, GatewayError> {
        if let Some(err) = self.ticker_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.tickers
            .lock()
            .unwrap()
            .get(pair)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(pair.to_string()))
    }

    async fn get_order_book(&self, pair: &CurrencyPair) -> Result<OrderBook, GatewayError> {
        self.books
            .lock()
            .unwrap()
            .get(pair)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(pair.to_string()))
    }

    async fn get_account_balance(&self, currency: &str) -> Result<Decimal, GatewayError> {
        if let Some(err) = self.balance_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(currency)
            .cloned()
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_dynamic_fees(&self) -> Result<HashMap<CurrencyPair, Decimal>, GatewayError> {
        self.dynamic_fees
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(GatewayError::NotSupported("dynamic fees".into())))
    }

    fn metadata_fee(&self, pair: &CurrencyPair) -> Option<Decimal> {
        self.metadata_fees.lock().unwrap().get(pair).cloned()
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<String, GatewayError> {
        if let Some(err) = self.place_error.lock().unwrap().clone() {
            return Err(err);
        }
        let id = format!("order-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.orders.lock().unwrap().push((
            id.clone(),
            MockOrder {
                order: order.clone(),
                remaining: order.volume,
            },
        ));
        Ok(id)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        self.open_order_polls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.open_orders_error.lock().unwrap().clone() {
            return Err(err);
        }
        if !*self.never_fill.lock().unwrap() {
            for (_, order) in self.orders.lock().unwrap().iter_mut() {
                order.remaining = Decimal::ZERO;
            }
        }
        let cancelled = self.cancelled.lock().unwrap().clone();
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, o)| o.remaining > Decimal::ZERO && !cancelled.contains(id))
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                pair: o.order.pair.clone(),
                side: o.order.side,
                remaining: o.remaining,
            })
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> Result<Decimal, GatewayError> {
        if let Some(err) = self.order_lookup_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == order_id)
            .map(|(_, o)| o.remaining)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        if let Some(err) = self.cancel_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }
}
