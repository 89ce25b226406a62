use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::model::{CurrencyPair, OrderBookLevel, OrderSide, CURRENCY_SCALE};
use crate::ports::gateway::GatewayError;
use crate::venue::Venue;

/// Used when a venue publishes no fee and none is configured.
pub const DEFAULT_FEE: Decimal = dec!(0.0030);
/// Share of the smaller balance put at risk per trade.
pub const EXPOSURE_SAFETY_FACTOR: Decimal = dec!(0.90);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    #[error("not enough liquidity: book holds {available} of {required}")]
    InsufficientLiquidity {
        required: Decimal,
        available: Decimal,
    },
    #[error("order book unavailable: {0}")]
    Gateway(#[from] GatewayError),
}

/// Maker fee for (venue, pair): dynamic schedule, then static metadata,
/// then the configured fallback, then [`DEFAULT_FEE`]. Never fails.
pub async fn resolve_fee(venue: &Venue, pair: &CurrencyPair, quiet: bool) -> Decimal {
    let native = venue.native_pair(pair);
    match venue.gateway.get_dynamic_fees().await {
        Ok(fees) => {
            if let Some(fee) = fees.get(&native) {
                return *fee;
            }
        }
        Err(GatewayError::NotSupported(_)) => {
            log::trace!(
                "[FEE] dynamic fees not supported by {}, trying other sources",
                venue.name
            );
        }
        Err(GatewayError::Internal(detail)) => {
            log::error!(
                "[FEE] connector failure fetching dynamic fees for {}: {}",
                venue.name,
                detail
            );
        }
        Err(e) => {
            log::trace!("[FEE] dynamic fees for {} unavailable: {}", venue.name, e);
        }
    }

    if let Some(fee) = venue.gateway.metadata_fee(&native) {
        return fee;
    }

    match venue.fee {
        Some(fee) => {
            if !quiet {
                log::warn!(
                    "[FEE] {} fees unavailable via API, using configured value {}",
                    venue.name,
                    fee
                );
            }
            fee
        }
        None => {
            if !quiet {
                log::error!(
                    "[FEE] {} has no fees configured, using default of {}. Please configure the correct value!",
                    venue.name,
                    DEFAULT_FEE
                );
            }
            DEFAULT_FEE
        }
    }
}

/// Price of the level at which cumulative volume first exceeds `volume`.
pub fn limit_price(levels: &[OrderBookLevel], volume: Decimal) -> Result<Decimal, PricingError> {
    let mut cumulative = Decimal::ZERO;
    for level in levels {
        cumulative += level.volume;
        if cumulative > volume {
            return Ok(level.price);
        }
    }
    Err(PricingError::InsufficientLiquidity {
        required: volume,
        available: cumulative,
    })
}

/// Fetches the book and walks the side a `side` order would consume:
/// buys eat asks, sells eat bids.
pub async fn fetch_limit_price(
    venue: &Venue,
    pair: &CurrencyPair,
    volume: Decimal,
    side: OrderSide,
) -> Result<Decimal, PricingError> {
    let book = venue
        .gateway
        .get_order_book(&venue.native_pair(pair))
        .await?;
    let levels = book.side(side.opposite());
    for level in levels {
        log::trace!(
            "[LIQUIDITY] {} {} level {} @ {}",
            venue.name,
            pair,
            level.volume,
            level.price
        );
    }
    limit_price(levels, volume)
}

/// Home-currency capital to risk on one trade.
#[derive(Debug, Clone)]
pub struct ExposureSizer {
    fixed_exposure: Option<Decimal>,
}

impl ExposureSizer {
    pub fn new(fixed_exposure: Option<Decimal>) -> Self {
        Self { fixed_exposure }
    }

    pub fn fixed_exposure(&self) -> Option<Decimal> {
        self.fixed_exposure
    }

    /// Fixed amount if configured, otherwise 90% of the smallest home
    /// balance. A failed balance read counts as zero.
    pub async fn maximum_exposure(&self, venues: &[&Venue]) -> Option<Decimal> {
        if let Some(fixed) = self.fixed_exposure {
            return Some(fixed);
        }
        let mut smallest: Option<Decimal> = None;
        for venue in venues {
            let balance = match venue.gateway.get_account_balance(&venue.home_currency).await {
                Ok(balance) => balance,
                Err(e) => {
                    log::trace!(
                        "[EXPOSURE] failed to fetch {} balance for {}: {}",
                        venue.home_currency,
                        venue.name,
                        e
                    );
                    Decimal::ZERO
                }
            };
            smallest = Some(smallest.map_or(balance, |s| s.min(balance)));
        }
        smallest.map(|balance| {
            (balance * EXPOSURE_SAFETY_FACTOR)
                .round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointNearestEven)
        })
    }
}
