use anyhow::{anyhow, Error};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Volumes are carried with 8 decimal places.
pub const VOLUME_SCALE: u32 = 8;
/// Home-currency amounts (balances, exposure, profit).
pub const CURRENCY_SCALE: u32 = 2;
/// Spread rates.
pub const RATE_SCALE: u32 = 8;

/// Base/counter currency pair, e.g. `BTC/USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    pub base: String,
    pub counter: String,
}

impl CurrencyPair {
    pub fn new(base: &str, counter: &str) -> Self {
        Self {
            base: base.to_ascii_uppercase(),
            counter: counter.to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.counter)
    }
}

impl FromStr for CurrencyPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut split = trimmed.split('/');
        let base = split
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("invalid pair: {}", trimmed))?;
        let counter = split
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("invalid pair: {}", trimmed))?;
        if split.next().is_some() {
            return Err(anyhow!("invalid pair: {}", trimmed));
        }
        Ok(CurrencyPair::new(base, counter))
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.to_string()
    }
}

/// Best bid/ask for one instrument on one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: CurrencyPair,
    pub bid: Decimal,
    pub ask: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy.
    Bid,
    /// Sell.
    Ask,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Bid => OrderSide::Ask,
            OrderSide::Ask => OrderSide::Bid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Both sides of a book, best price first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    pub fn side(&self, side: OrderSide) -> &[OrderBookLevel] {
        match side {
            OrderSide::Bid => &self.bids,
            OrderSide::Ask => &self.asks,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrder {
    pub pair: CurrencyPair,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
    pub margin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub pair: CurrencyPair,
    pub side: OrderSide,
    pub remaining: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_pair_parses_and_normalizes_case() {
        let pair: CurrencyPair = " btc/usd ".parse().unwrap();
        assert_eq!(pair, CurrencyPair::new("BTC", "USD"));
        assert_eq!(pair.to_string(), "BTC/USD");
    }

    #[test]
    fn currency_pair_rejects_malformed_input() {
        assert!("BTC".parse::<CurrencyPair>().is_err());
        assert!("BTC/".parse::<CurrencyPair>().is_err());
        assert!("BTC/USD/EUR".parse::<CurrencyPair>().is_err());
    }

    #[test]
    fn currency_pair_serializes_as_string() {
        let json = serde_json::to_string(&CurrencyPair::new("ETH", "EUR")).unwrap();
        assert_eq!(json, "\"ETH/EUR\"");
        let back: CurrencyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CurrencyPair::new("ETH", "EUR"));
    }
}
