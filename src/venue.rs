use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::config::VenueConfig;
use crate::model::CurrencyPair;
use crate::ports::gateway::ExchangeGateway;

const USD: &str = "USD";

/// A configured exchange. Immutable once connected.
pub struct Venue {
    pub name: String,
    pub home_currency: String,
    pub trading_pairs: Vec<CurrencyPair>,
    pub margin: bool,
    pub margin_exclude: HashSet<CurrencyPair>,
    pub fee: Option<Decimal>,
    pub gateway: Arc<dyn ExchangeGateway>,
}

impl Venue {
    pub fn from_config(cfg: &VenueConfig, gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            name: cfg.name.clone(),
            home_currency: cfg.home_currency.clone(),
            trading_pairs: cfg.trading_pairs.clone(),
            margin: cfg.margin,
            margin_exclude: cfg.margin_exclude.iter().cloned().collect(),
            fee: cfg.fee,
            gateway,
        }
    }

    /// The same venue talking through another gateway.
    pub fn with_gateway(&self, gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            name: self.name.clone(),
            home_currency: self.home_currency.clone(),
            trading_pairs: self.trading_pairs.clone(),
            margin: self.margin,
            margin_exclude: self.margin_exclude.clone(),
            fee: self.fee,
            gateway,
        }
    }

    /// Translates a USD-quoted pair into the venue's home currency.
    pub fn native_pair(&self, pair: &CurrencyPair) -> CurrencyPair {
        if pair.base == USD {
            CurrencyPair::new(&self.home_currency, &pair.counter)
        } else if pair.counter == USD {
            CurrencyPair::new(&pair.base, &self.home_currency)
        } else {
            pair.clone()
        }
    }

    pub fn ticker_key(&self, pair: &CurrencyPair) -> String {
        format!("{}:{}", self.name, self.native_pair(pair))
    }

    pub fn can_short(&self, pair: &CurrencyPair) -> bool {
        self.margin && !self.margin_exclude.contains(pair)
    }

    /// Pairs configured on both venues, in this venue's order.
    pub fn common_pairs(&self, other: &Venue) -> Vec<CurrencyPair> {
        self.trading_pairs
            .iter()
            .filter(|p| other.trading_pairs.contains(p))
            .cloned()
            .collect()
    }
}

impl PartialEq for Venue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Venue {}

impl fmt::Debug for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Venue")
            .field("name", &self.name)
            .field("home_currency", &self.home_currency)
            .field("trading_pairs", &self.trading_pairs)
            .field("margin", &self.margin)
            .field("fee", &self.fee)
            .finish()
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
