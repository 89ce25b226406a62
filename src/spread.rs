use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use thiserror::Error;

use crate::model::RATE_SCALE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpreadError {
    #[error("non-positive long price {0}")]
    NonPositivePrice(Decimal),
    #[error("spread of {short} over {long} is out of range")]
    Overflow { long: Decimal, short: Decimal },
}

/// `(short - long) / long`, rounded half-to-even at [`RATE_SCALE`].
pub fn compute_spread(long_price: Decimal, short_price: Decimal) -> Result<Decimal, SpreadError> {
    if long_price <= Decimal::ZERO {
        return Err(SpreadError::NonPositivePrice(long_price));
    }
    short_price
        .checked_sub(long_price)
        .and_then(|gap| gap.checked_div(long_price))
        .map(|spread| spread.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointNearestEven))
        .ok_or(SpreadError::Overflow {
            long: long_price,
            short: short_price,
        })
}

/// Running extremes of the spreads seen for one long/short/pair combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadStats {
    pub min_entry: Decimal,
    pub max_entry: Decimal,
    pub min_exit: Decimal,
    pub max_exit: Decimal,
}

impl SpreadStats {
    fn new(entry: Decimal, exit: Decimal) -> Self {
        Self {
            min_entry: entry,
            max_entry: entry,
            min_exit: exit,
            max_exit: exit,
        }
    }

    fn observe(&mut self, entry: Decimal, exit: Decimal) {
        self.min_entry = self.min_entry.min(entry);
        self.max_entry = self.max_entry.max(entry);
        self.min_exit = self.min_exit.min(exit);
        self.max_exit = self.max_exit.max(exit);
    }
}

/// Diagnostic only; nothing in the decision path reads it.
#[derive(Debug, Default)]
pub struct SpreadStatsTracker {
    stats: HashMap<String, SpreadStats>,
}

impl SpreadStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: &str, entry_spread: Decimal, exit_spread: Decimal) {
        self.stats
            .entry(key.to_string())
            .and_modify(|s| s.observe(entry_spread, exit_spread))
            .or_insert_with(|| SpreadStats::new(entry_spread, exit_spread));
    }

    pub fn get(&self, key: &str) -> Option<&SpreadStats> {
        self.stats.get(key)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
