use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::model::{
    CurrencyPair, LimitOrder, OpenOrder, OrderBook, OrderBookLevel, OrderSide, Ticker,
};
use crate::ports::gateway::{ExchangeGateway, GatewayError};

lazy_static! {
    static ref FILLED_PROBABILITY_IN_EMULATION: Decimal = {
        match env::var("FILLED_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(Decimal::ONE),
            Err(_) => Decimal::ONE,
        }
    };
}

// Depth given to the single level synthesized from a ticker when the dump
// carries no book for the pair.
const SYNTHETIC_DEPTH: Decimal = dec!(1000000);

// Lines of the JSONL market-data dump
#[derive(Debug, Clone, Deserialize)]
struct DumpedQuote {
    bid: Decimal,
    ask: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedEntry {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    tickers: HashMap<CurrencyPair, DumpedQuote>,
    #[serde(default)]
    books: HashMap<CurrencyPair, OrderBook>,
    #[serde(default)]
    balances: HashMap<String, Decimal>,
    #[serde(default)]
    fees: HashMap<CurrencyPair, Decimal>,
}

#[derive(Debug, Clone)]
struct ReplayOrder {
    id: String,
    order: LimitOrder,
    remaining: Decimal,
    cancelled: bool,
}

/// File-backed venue that steps through a recorded market-data dump.
/// Orders rest until the open-order list is polled, then fill with the
/// configured probability.
#[derive(Debug)]
pub struct ReplayGateway {
    data: Vec<DumpedEntry>,
    cursor: AtomicUsize,
    fill_probability: Decimal,
    orders: Mutex<Vec<ReplayOrder>>,
    balance_deltas: Mutex<HashMap<String, Decimal>>,
    next_id: AtomicUsize,
}

impl ReplayGateway {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open replay file {}", path_ref.display()))?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line.context("failed to read replay line")?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedEntry = serde_json::from_str(&line).with_context(|| {
                format!(
                    "failed to parse replay entry {} of {}",
                    index + 1,
                    path_ref.display()
                )
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(anyhow!(
                "replay file {} is empty or invalid",
                path_ref.display()
            ));
        }

        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            fill_probability: *FILLED_PROBABILITY_IN_EMULATION,
            orders: Mutex::new(Vec::new()),
            balance_deltas: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn with_fill_probability(mut self, probability: Decimal) -> Self {
        self.fill_probability = probability;
        self
    }

    /// Moves to the next recorded entry. Returns false at the end of the dump.
    pub fn advance(&self) -> bool {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if current_cursor + 1 < self.data.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Recorded time of the current entry. Dumps carry milliseconds.
    pub fn current_timestamp_secs(&self) -> Option<i64> {
        self.current().ok().map(|e| e.timestamp / 1000)
    }

    fn current(&self) -> Result<&DumpedEntry, GatewayError> {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        self.data
            .get(current_cursor)
            .ok_or_else(|| GatewayError::Internal("replay cursor out of bounds".to_string()))
    }

    fn lock_orders(&self) -> Result<std::sync::MutexGuard<'_, Vec<ReplayOrder>>, GatewayError> {
        self.orders
            .lock()
            .map_err(|_| GatewayError::Internal("replay order book poisoned".to_string()))
    }

    fn roll_fill(&self) -> bool {
        let probability = self.fill_probability.to_f64().unwrap_or(1.0).clamp(0.0, 1.0);
        rand::thread_rng().gen_bool(probability)
    }

    fn apply_fill(&self, order: &LimitOrder, volume: Decimal) {
        // Margin sells open a short, they do not move spot balances.
        if order.margin {
            return;
        }
        let Ok(mut deltas) = self.balance_deltas.lock() else {
            return;
        };
        let notional = volume * order.price;
        let (base_delta, counter_delta) = match order.side {
            OrderSide::Bid => (volume, -notional),
            OrderSide::Ask => (-volume, notional),
        };
        *deltas.entry(order.pair.base.clone()).or_insert(Decimal::ZERO) += base_delta;
        *deltas
            .entry(order.pair.counter.clone())
            .or_insert(Decimal::ZERO) += counter_delta;
    }
}

#[async_trait]
impl ExchangeGateway for ReplayGateway {
    async fn get_tickers(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<CurrencyPair, Ticker>, GatewayError> {
        let entry = self.current()?;
        Ok(pairs
            .iter()
            .filter_map(|pair| {
                entry.tickers.get(pair).map(|q| {
                    (
                        pair.clone(),
                        Ticker {
                            pair: pair.clone(),
                            bid: q.bid,
                            ask: q.ask,
                        },
                    )
                })
            })
            .collect())
    }

    async fn get_ticker(&self, pair: &CurrencyPair) -> Result<Ticker, GatewayError> {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let quote = self.current()?.tickers.get(pair).ok_or_else(|| {
            GatewayError::NotFound(format!(
                "pair '{}' not found in replay entry {}",
                pair, current_cursor
            ))
        })?;
        Ok(Ticker {
            pair: pair.clone(),
            bid: quote.bid,
            ask: quote.ask,
        })
    }

    async fn get_order_book(&self, pair: &CurrencyPair) -> Result<OrderBook, GatewayError> {
        let entry = self.current()?;
        if let Some(book) = entry.books.get(pair) {
            return Ok(book.clone());
        }
        let quote = entry
            .tickers
            .get(pair)
            .ok_or_else(|| GatewayError::NotFound(format!("no book for '{}'", pair)))?;
        Ok(OrderBook {
            bids: vec![OrderBookLevel {
                price: quote.bid,
                volume: SYNTHETIC_DEPTH,
            }],
            asks: vec![OrderBookLevel {
                price: quote.ask,
                volume: SYNTHETIC_DEPTH,
            }],
        })
    }

    async fn get_account_balance(&self, currency: &str) -> Result<Decimal, GatewayError> {
        let recorded = self
            .current()?
            .balances
            .get(currency)
            .cloned()
            .unwrap_or(Decimal::ZERO);
        let delta = self
            .balance_deltas
            .lock()
            .map_err(|_| GatewayError::Internal("replay balances poisoned".to_string()))?
            .get(currency)
            .cloned()
            .unwrap_or(Decimal::ZERO);
        Ok(recorded + delta)
    }

    async fn get_dynamic_fees(&self) -> Result<HashMap<CurrencyPair, Decimal>, GatewayError> {
        let entry = self.current()?;
        if entry.fees.is_empty() {
            return Err(GatewayError::NotSupported(
                "replay entry carries no fees".to_string(),
            ));
        }
        Ok(entry.fees.clone())
    }

    fn metadata_fee(&self, _pair: &CurrencyPair) -> Option<Decimal> {
        None
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<String, GatewayError> {
        if order.volume <= Decimal::ZERO || order.price <= Decimal::ZERO {
            return Err(GatewayError::Transport(format!(
                "rejected order volume={} price={}",
                order.volume, order.price
            )));
        }
        let id = format!("replay-{}", self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        log::info!(
            "[REPLAY_ORDER] id={} pair={} side={:?} volume={} price={} margin={}",
            id,
            order.pair,
            order.side,
            order.volume,
            order.price,
            order.margin
        );
        self.lock_orders()?.push(ReplayOrder {
            id: id.clone(),
            order: order.clone(),
            remaining: order.volume,
            cancelled: false,
        });
        Ok(id)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let mut orders = self.lock_orders()?;
        let mut open = Vec::new();
        for order in orders.iter_mut() {
            if order.cancelled || order.remaining <= Decimal::ZERO {
                continue;
            }
            if self.roll_fill() {
                self.apply_fill(&order.order, order.remaining);
                order.remaining = Decimal::ZERO;
                continue;
            }
            open.push(OpenOrder {
                order_id: order.id.clone(),
                pair: order.order.pair.clone(),
                side: order.order.side,
                remaining: order.remaining,
            });
        }
        Ok(open)
    }

    async fn get_order(&self, order_id: &str) -> Result<Decimal, GatewayError> {
        self.lock_orders()?
            .iter()
            .find(|o| o.id == order_id)
            .map(|o| o.remaining)
            .ok_or_else(|| GatewayError::NotFound(format!("order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut orders = self.lock_orders()?;
        let order = orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| GatewayError::NotFound(format!("order {}", order_id)))?;
        order.cancelled = true;
        Ok(())
    }
}
