use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::model::{CurrencyPair, LimitOrder, OrderSide};
use crate::ports::gateway::GatewayError;
use crate::venue::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeDirection {
    /// Buy on the long venue, sell short on the short venue.
    Open,
    /// Sell on the long venue, buy back on the short venue.
    Close,
}

impl TradeDirection {
    fn long_side(self) -> OrderSide {
        match self {
            TradeDirection::Open => OrderSide::Bid,
            TradeDirection::Close => OrderSide::Ask,
        }
    }
}

/// Prices and volumes for both legs, already depth-verified by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct PairOrder {
    pub pair: CurrencyPair,
    pub direction: TradeDirection,
    pub long_volume: Decimal,
    pub long_price: Decimal,
    pub short_volume: Decimal,
    pub short_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct PlacedLeg {
    pub venue: Arc<Venue>,
    pub order_id: String,
    pub order: LimitOrder,
}

#[derive(Debug, Clone)]
pub struct PlacedPair {
    pub long: PlacedLeg,
    pub short: PlacedLeg,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("order placement failed on both venues: long={long}, short={short}")]
    Placement {
        long: GatewayError,
        short: GatewayError,
    },
    #[error("order placement failed on {failed_venue}: {source} (placed leg {placed_order_id} on {placed_venue}, compensated={compensated})")]
    PartialPlacement {
        failed_venue: String,
        source: GatewayError,
        placed_venue: String,
        placed_order_id: String,
        /// Whether the leg that did get placed was cancelled again.
        compensated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    Filled,
    /// Deadline passed; lists `(venue, order_id)` still reported open.
    TimedOut { outstanding: Vec<(String, String)> },
    Cancelled,
}

/// Places paired limit orders and waits for both to leave the open-order
/// lists of their venues.
#[derive(Debug, Clone)]
pub struct OrderExecutor {
    poll_interval: Duration,
    timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl OrderExecutor {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
            shutdown: None,
        }
    }

    /// A `true` on the channel aborts any fill wait in progress.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn place_pair(
        &self,
        long_venue: &Arc<Venue>,
        short_venue: &Arc<Venue>,
        request: &PairOrder,
    ) -> Result<PlacedPair, ExecutionError> {
        let long_side = request.direction.long_side();
        let long_order = LimitOrder {
            pair: long_venue.native_pair(&request.pair),
            side: long_side,
            price: request.long_price,
            volume: request.long_volume,
            margin: false,
        };
        let short_order = LimitOrder {
            pair: short_venue.native_pair(&request.pair),
            side: long_side.opposite(),
            price: request.short_price,
            volume: request.short_volume,
            margin: true,
        };

        let (long_result, short_result) = tokio::join!(
            long_venue.gateway.place_limit_order(&long_order),
            short_venue.gateway.place_limit_order(&short_order)
        );

        match (long_result, short_result) {
            (Ok(long_id), Ok(short_id)) => {
                log::info!(
                    "[ORDER] {:?} {} long {}:{} {:?} {}@{} short {}:{} {:?} {}@{}",
                    request.direction,
                    request.pair,
                    long_venue.name,
                    long_id,
                    long_order.side,
                    long_order.volume,
                    long_order.price,
                    short_venue.name,
                    short_id,
                    short_order.side,
                    short_order.volume,
                    short_order.price
                );
                Ok(PlacedPair {
                    long: PlacedLeg {
                        venue: long_venue.clone(),
                        order_id: long_id,
                        order: long_order,
                    },
                    short: PlacedLeg {
                        venue: short_venue.clone(),
                        order_id: short_id,
                        order: short_order,
                    },
                })
            }
            (Err(long), Err(short)) => {
                log::error!(
                    "[ORDER] both legs rejected for {}: long={} short={}",
                    request.pair,
                    long,
                    short
                );
                Err(ExecutionError::Placement { long, short })
            }
            (Ok(placed_id), Err(source)) => {
                Err(self
                    .compensate(long_venue, &placed_id, short_venue, source)
                    .await)
            }
            (Err(source), Ok(placed_id)) => {
                Err(self
                    .compensate(short_venue, &placed_id, long_venue, source)
                    .await)
            }
        }
    }

    async fn compensate(
        &self,
        placed_venue: &Venue,
        placed_order_id: &str,
        failed_venue: &Venue,
        source: GatewayError,
    ) -> ExecutionError {
        log::error!(
            "[ORDER] leg on {} rejected ({}), cancelling order {} on {}",
            failed_venue.name,
            source,
            placed_order_id,
            placed_venue.name
        );
        let compensated = match placed_venue.gateway.cancel_order(placed_order_id).await {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "[ORDER] failed to cancel order {} on {}: {}. The position is unhedged!",
                    placed_order_id,
                    placed_venue.name,
                    e
                );
                false
            }
        };
        ExecutionError::PartialPlacement {
            failed_venue: failed_venue.name.clone(),
            source,
            placed_venue: placed_venue.name.clone(),
            placed_order_id: placed_order_id.to_string(),
            compensated,
        }
    }

    /// Polls both venues until neither lists its leg as open, the timeout
    /// elapses, or shutdown is signalled. Poll failures are logged and the
    /// leg is treated as still open.
    pub async fn wait_for_fills(&self, placed: &PlacedPair) -> FillOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut shutdown = self.shutdown.clone();
        loop {
            if shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false) {
                log::warn!("[ORDER] fill wait cancelled by shutdown");
                return FillOutcome::Cancelled;
            }

            let (long_open, short_open) =
                tokio::join!(self.is_open(&placed.long), self.is_open(&placed.short));
            let mut outstanding = Vec::new();
            if long_open {
                outstanding.push((placed.long.venue.name.clone(), placed.long.order_id.clone()));
            }
            if short_open {
                outstanding.push((
                    placed.short.venue.name.clone(),
                    placed.short.order_id.clone(),
                ));
            }
            if outstanding.is_empty() {
                log::info!(
                    "[ORDER] both legs filled ({} on {}, {} on {})",
                    placed.long.order_id,
                    placed.long.venue.name,
                    placed.short.order_id,
                    placed.short.venue.name
                );
                return FillOutcome::Filled;
            }

            let now = Instant::now();
            if now >= deadline {
                log::error!(
                    "[ORDER] fill wait timed out after {:?}, outstanding: {:?}",
                    self.timeout,
                    outstanding
                );
                return FillOutcome::TimedOut { outstanding };
            }
            log::debug!("[ORDER] waiting for fills, outstanding: {:?}", outstanding);

            let pause = self.poll_interval.min(deadline - now);
            let mut sender_gone = false;
            match shutdown.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        changed = rx.changed() => sender_gone = changed.is_err(),
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
            if sender_gone {
                // Nobody can signal shutdown any more.
                shutdown = None;
            }
        }
    }

    async fn is_open(&self, leg: &PlacedLeg) -> bool {
        match leg.venue.gateway.get_open_orders().await {
            Ok(orders) => orders.iter().any(|o| o.order_id == leg.order_id),
            Err(e) => {
                log::warn!(
                    "[ORDER] failed to poll open orders on {}: {}",
                    leg.venue.name,
                    e
                );
                true
            }
        }
    }

    /// Cancels whatever is left of both legs. `NotFound` counts as done.
    /// Returns the ids that could not be cancelled.
    pub async fn cancel_outstanding(&self, placed: &PlacedPair) -> Vec<String> {
        let (long, short) = tokio::join!(
            placed.long.venue.gateway.cancel_order(&placed.long.order_id),
            placed.short.venue.gateway.cancel_order(&placed.short.order_id)
        );
        let mut failed = Vec::new();
        for (leg, result) in [(&placed.long, long), (&placed.short, short)] {
            match result {
                Ok(()) | Err(GatewayError::NotFound(_)) => {}
                Err(e) => {
                    log::error!(
                        "[ORDER] failed to cancel {} on {}: {}",
                        leg.order_id,
                        leg.venue.name,
                        e
                    );
                    failed.push(leg.order_id.clone());
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::gateway::ExchangeGateway;
    use crate::testing::{pair, test_venue, MockGateway};
    use rust_decimal_macros::dec;

    fn executor() -> OrderExecutor {
        OrderExecutor::new(Duration::from_millis(5), Duration::from_millis(40))
    }

    fn venues() -> (Arc<MockGateway>, Arc<MockGateway>, Arc<Venue>, Arc<Venue>) {
        let long_gw = Arc::new(MockGateway::default());
        let short_gw = Arc::new(MockGateway::default());
        let long = Arc::new(test_venue("alpha", long_gw.clone()));
        let short = Arc::new(test_venue("beta", short_gw.clone()));
        (long_gw, short_gw, long, short)
    }

    fn request(direction: TradeDirection) -> PairOrder {
        PairOrder {
            pair: pair("BTC/USD"),
            direction,
            long_volume: dec!(1.5),
            long_price: dec!(100),
            short_volume: dec!(1.4),
            short_price: dec!(101.5),
        }
    }

    #[tokio::test]
    async fn open_buys_long_and_sells_short_on_margin() {
        let (long_gw, short_gw, long, short) = venues();
        let placed = executor()
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap();

        let long_orders = long_gw.placed();
        let short_orders = short_gw.placed();
        assert_eq!(long_orders.len(), 1);
        assert_eq!(long_orders[0].side, OrderSide::Bid);
        assert!(!long_orders[0].margin);
        assert_eq!(long_orders[0].volume, dec!(1.5));
        assert_eq!(short_orders[0].side, OrderSide::Ask);
        assert!(short_orders[0].margin);
        assert_eq!(short_orders[0].price, dec!(101.5));
        assert_eq!(placed.long.venue.name, "alpha");
    }

    #[tokio::test]
    async fn close_reverses_sides_and_keeps_short_on_margin() {
        let (long_gw, short_gw, long, short) = venues();
        executor()
            .place_pair(&long, &short, &request(TradeDirection::Close))
            .await
            .unwrap();
        assert_eq!(long_gw.placed()[0].side, OrderSide::Ask);
        assert!(!long_gw.placed()[0].margin);
        assert_eq!(short_gw.placed()[0].side, OrderSide::Bid);
        assert!(short_gw.placed()[0].margin);
    }

    #[tokio::test]
    async fn partial_placement_cancels_the_placed_leg() {
        let (long_gw, short_gw, long, short) = venues();
        short_gw.fail_placement(GatewayError::Transport("timeout".into()));
        let err = executor()
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap_err();
        match err {
            ExecutionError::PartialPlacement {
                failed_venue,
                placed_venue,
                placed_order_id,
                compensated,
                ..
            } => {
                assert_eq!(failed_venue, "beta");
                assert_eq!(placed_venue, "alpha");
                assert!(compensated);
                assert_eq!(long_gw.cancelled(), vec![placed_order_id]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_compensation_is_reported() {
        let (long_gw, short_gw, long, short) = venues();
        long_gw.fail_placement(GatewayError::Transport("down".into()));
        short_gw.fail_cancel(GatewayError::Transport("down".into()));
        let err = executor()
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::PartialPlacement {
                compensated: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn both_legs_rejected_is_a_plain_placement_error() {
        let (long_gw, short_gw, long, short) = venues();
        long_gw.fail_placement(GatewayError::RateLimited("429".into()));
        short_gw.fail_placement(GatewayError::Transport("down".into()));
        let err = executor()
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Placement { .. }));
    }

    #[tokio::test]
    async fn wait_returns_once_both_legs_leave_the_book() {
        let (_, _, long, short) = venues();
        let exec = executor();
        let placed = exec
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap();
        assert_eq!(exec.wait_for_fills(&placed).await, FillOutcome::Filled);
    }

    #[tokio::test]
    async fn wait_times_out_and_outstanding_orders_can_be_cancelled() {
        let (long_gw, short_gw, long, short) = venues();
        short_gw.set_never_fill(true);
        let exec = executor();
        let placed = exec
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap();
        match exec.wait_for_fills(&placed).await {
            FillOutcome::TimedOut { outstanding } => {
                assert_eq!(
                    outstanding,
                    vec![("beta".to_string(), placed.short.order_id.clone())]
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(short_gw.open_order_polls() > 1);
        assert!(exec.cancel_outstanding(&placed).await.is_empty());
        assert_eq!(short_gw.cancelled(), vec![placed.short.order_id.clone()]);
        assert_eq!(long_gw.cancelled(), vec![placed.long.order_id.clone()]);
        assert!(short_gw.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_errors_keep_the_wait_going() {
        let (long_gw, _, long, short) = venues();
        long_gw.fail_open_orders(Some(GatewayError::Transport("flaky".into())));
        let exec = executor();
        let placed = exec
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap();
        assert!(matches!(
            exec.wait_for_fills(&placed).await,
            FillOutcome::TimedOut { .. }
        ));
        assert!(long_gw.open_order_polls() > 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_the_wait() {
        let (_, short_gw, long, short) = venues();
        short_gw.set_never_fill(true);
        let (tx, rx) = watch::channel(false);
        let exec = OrderExecutor::new(Duration::from_millis(5), Duration::from_secs(60))
            .with_shutdown(rx);
        let placed = exec
            .place_pair(&long, &short, &request(TradeDirection::Open))
            .await
            .unwrap();
        let signal = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });
        assert_eq!(exec.wait_for_fills(&placed).await, FillOutcome::Cancelled);
        signal.await.unwrap();
    }
}
