use anyhow::{anyhow, Context, Result};
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::ArbitrageConfig;
use crate::model::{CurrencyPair, OrderSide, Ticker, CURRENCY_SCALE, VOLUME_SCALE};
use crate::ports::gateway::{ExchangeGateway, GatewayError};
use crate::ports::replay_gateway::ReplayGateway;
use crate::position::{Position, PositionStore, TradeLeg};
use crate::pricing::{fetch_limit_price, resolve_fee, ExposureSizer};
use crate::spread::{compute_spread, SpreadStatsTracker};
use crate::status::StatusReporter;
use crate::trade::execution::gateway_box::GatewayBox;
use crate::trade::execution::order_executor::{
    ExecutionError, FillOutcome, OrderExecutor, PairOrder, TradeDirection,
};
use crate::venue::Venue;

const SLOW_POLL: Duration = Duration::from_millis(3000);

/// Where the volume to unwind one leg comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVolumeSource {
    /// Base-currency balance currently held on the venue.
    LiveBalance,
    /// Unfilled remainder of the leg's entry order.
    OrderRemaining,
    /// Volume recorded when the position was opened.
    RecordedEntry,
}

pub const LONG_EXIT_SOURCES: [ExitVolumeSource; 3] = [
    ExitVolumeSource::LiveBalance,
    ExitVolumeSource::OrderRemaining,
    ExitVolumeSource::RecordedEntry,
];
pub const SHORT_EXIT_SOURCES: [ExitVolumeSource; 2] = [
    ExitVolumeSource::OrderRemaining,
    ExitVolumeSource::RecordedEntry,
];

impl ExitVolumeSource {
    pub async fn resolve(self, leg: &TradeLeg, pair: &CurrencyPair) -> Result<Decimal, GatewayError> {
        let volume = match self {
            ExitVolumeSource::LiveBalance => {
                let base = leg.venue.native_pair(pair).base;
                leg.venue.gateway.get_account_balance(&base).await?
            }
            ExitVolumeSource::OrderRemaining => {
                if leg.order_id.is_empty() {
                    return Err(GatewayError::NotFound("no order id recorded".to_string()));
                }
                leg.venue.gateway.get_order(&leg.order_id).await?
            }
            ExitVolumeSource::RecordedEntry => leg.volume,
        };
        Ok(volume.round_dp_with_strategy(VOLUME_SCALE, RoundingStrategy::MidpointNearestEven))
    }

    /// A successful read is final even when it is zero: an empty balance
    /// means the leg is already unwound.
    fn is_authoritative(self) -> bool {
        matches!(self, ExitVolumeSource::LiveBalance)
    }
}

/// First usable volume among `sources`, tried in order. Errors and
/// non-positive amounts fall through, except from an authoritative source.
pub async fn resolve_exit_volume(
    sources: &[ExitVolumeSource],
    leg: &TradeLeg,
    pair: &CurrencyPair,
) -> Option<Decimal> {
    for source in sources {
        match source.resolve(leg, pair).await {
            Ok(volume) if volume > Decimal::ZERO || source.is_authoritative() => {
                return Some(volume)
            }
            Ok(volume) => {
                log::debug!(
                    "[EXIT] {:?} on {} yielded {}, trying next source",
                    source,
                    leg.venue.name,
                    volume
                );
            }
            Err(e) if e.is_not_supported() => {
                log::debug!("[EXIT] {:?} not supported by {}", source, leg.venue.name);
            }
            Err(e) => {
                log::warn!(
                    "[EXIT] unable to get {:?} for {} on {}: {}, falling back",
                    source,
                    pair,
                    leg.venue.name,
                    e
                );
            }
        }
    }
    None
}

/// One (long venue, short venue, pair) candidate.
#[derive(Debug, Clone)]
pub struct Combination {
    pub long: Arc<Venue>,
    pub short: Arc<Venue>,
    pub pair: CurrencyPair,
}

impl Combination {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.long.name, self.short.name, self.pair)
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.long.name, self.short.name, self.pair)
    }
}

#[derive(Debug, Clone)]
struct EntryPlan {
    exit_target: Decimal,
    long_volume: Decimal,
    short_volume: Decimal,
    long_price: Decimal,
    short_price: Decimal,
}

pub struct ArbitrageEngine {
    cfg: ArbitrageConfig,
    venues: Vec<Arc<Venue>>,
    replay_feeds: Vec<Arc<ReplayGateway>>,
    tickers: HashMap<String, Ticker>,
    position: Option<Position>,
    store: PositionStore,
    blacklist: HashSet<String>,
    sizer: ExposureSizer,
    executor: OrderExecutor,
    stats: SpreadStatsTracker,
    missed_entries: HashSet<String>,
    entry_halted: bool,
    status_reporter: Option<StatusReporter>,
    shutdown: Option<watch::Receiver<bool>>,
    rng: StdRng,
}

impl ArbitrageEngine {
    /// Builds an engine over replay gateways, one per configured venue.
    pub async fn new(cfg: ArbitrageConfig) -> Result<Self> {
        let mut venues = Vec::new();
        let mut feeds = Vec::new();
        for venue_cfg in &cfg.venues {
            let path = venue_cfg.replay_file.as_ref().ok_or_else(|| {
                anyhow!(
                    "venue {} has no replay_file; live gateways are passed to with_venues",
                    venue_cfg.name
                )
            })?;
            let feed = Arc::new(
                ReplayGateway::new(path)
                    .with_context(|| format!("failed to initialize venue {}", venue_cfg.name))?,
            );
            let gateway: Arc<dyn ExchangeGateway> =
                Arc::new(GatewayBox::new(&venue_cfg.name, feed.clone()));
            venues.push(Arc::new(Venue::from_config(venue_cfg, gateway)));
            feeds.push(feed);
        }
        let mut engine = Self::build(cfg, venues, feeds)?;
        engine.startup_overview().await;
        Ok(engine)
    }

    /// Builds an engine over already connected venues. Every gateway is
    /// wrapped in a [`GatewayBox`].
    pub async fn with_venues(cfg: ArbitrageConfig, venues: Vec<Arc<Venue>>) -> Result<Self> {
        let venues = venues
            .into_iter()
            .map(|venue| {
                let gateway: Arc<dyn ExchangeGateway> =
                    Arc::new(GatewayBox::new(&venue.name, venue.gateway.clone()));
                Arc::new(venue.with_gateway(gateway))
            })
            .collect();
        let mut engine = Self::build(cfg, venues, Vec::new())?;
        engine.startup_overview().await;
        Ok(engine)
    }

    fn build(
        cfg: ArbitrageConfig,
        venues: Vec<Arc<Venue>>,
        replay_feeds: Vec<Arc<ReplayGateway>>,
    ) -> Result<Self> {
        let blacklist = cfg.blacklist_keys()?;
        let store = PositionStore::new(&cfg.position_file);
        let position = match store.load()? {
            Some(record) => Some(
                Position::from_record(record, &venues)
                    .context("failed to restore persisted position")?,
            ),
            None => None,
        };
        let status_reporter = cfg
            .status_file
            .as_ref()
            .map(|path| StatusReporter::new(path, cfg.interval_secs));
        let executor = OrderExecutor::new(
            Duration::from_secs(cfg.fill_poll_interval_secs),
            Duration::from_secs(cfg.fill_timeout_secs),
        );
        Ok(Self {
            sizer: ExposureSizer::new(cfg.fixed_exposure),
            cfg,
            venues,
            replay_feeds,
            tickers: HashMap::new(),
            position,
            store,
            blacklist,
            executor,
            stats: SpreadStatsTracker::new(),
            missed_entries: HashSet::new(),
            entry_halted: false,
            status_reporter,
            shutdown: None,
            rng: StdRng::from_entropy(),
        })
    }

    /// Fixes the scan-order shuffle.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_executor(mut self, executor: OrderExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// A `true` on the channel stops `run` and aborts fill waits.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.executor = self.executor.with_shutdown(shutdown.clone());
        self.shutdown = Some(shutdown);
        self
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_entry_halted(&self) -> bool {
        self.entry_halted
    }

    pub fn stats(&self) -> &SpreadStatsTracker {
        &self.stats
    }

    pub async fn run(&mut self) -> Result<()> {
        if !self.replay_feeds.is_empty() {
            return self.run_replay().await;
        }

        log::info!("[LIVE] Running in live mode.");
        let mut cycle = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let summary_every = Duration::from_secs(self.cfg.summary_interval_secs);
        let mut summary =
            tokio::time::interval_at(tokio::time::Instant::now() + summary_every, summary_every);
        summary.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = cycle.tick() => {
                    if let Err(e) = self.tick().await {
                        log::error!("arbitrage tick failed: {:?}", e);
                    }
                }
                _ = summary.tick() => self.summary(),
                _ = wait_for_shutdown(&mut shutdown) => {
                    log::info!("[LIVE] shutdown requested, stopping.");
                    break;
                }
            }
        }
        self.summary();
        Ok(())
    }

    async fn run_replay(&mut self) -> Result<()> {
        log::info!("[REPLAY] Running against recorded market data.");
        loop {
            if let Some(ts) = self
                .replay_feeds
                .first()
                .and_then(|feed| feed.current_timestamp_secs())
            {
                let recorded_at = chrono::DateTime::from_timestamp(ts, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| ts.to_string());
                log::debug!("[REPLAY] cycle at {}", recorded_at);
            }
            if let Err(e) = self.tick().await {
                log::error!("[REPLAY] tick failed: {:?}", e);
            }
            let has_more = self
                .replay_feeds
                .iter()
                .fold(false, |more, feed| feed.advance() || more);
            if !has_more {
                log::info!("[REPLAY] End of data reached.");
                break;
            }
        }
        self.summary();
        Ok(())
    }

    /// One decision cycle: refresh every quote, then scan all combinations.
    /// Only programming-level gateway errors are returned.
    pub async fn tick(&mut self) -> Result<()> {
        let cycle_start = Instant::now();
        self.refresh_tickers().await?;

        let scan_start = Instant::now();
        for combination in self.scan_plan() {
            self.evaluate(&combination).await;
        }
        let scan_duration = scan_start.elapsed();
        if scan_duration > SLOW_POLL {
            log::warn!("Polling exchanges took {} ms", scan_duration.as_millis());
        }

        self.write_status(cycle_start.elapsed());
        Ok(())
    }

    async fn refresh_tickers(&mut self) -> Result<()> {
        self.tickers.clear();
        let results = join_all(self.venues.iter().map(|venue| fetch_tickers(venue))).await;
        for (venue, result) in self.venues.iter().zip(results) {
            let tickers = result
                .map_err(|e| anyhow!("fatal gateway error on {}: {}", venue.name, e))?;
            self.tickers.extend(tickers);
        }
        Ok(())
    }

    /// Every valid combination for this cycle. Venues and each venue pair's
    /// common pairs are shuffled first.
    pub fn scan_plan(&mut self) -> Vec<Combination> {
        let mut venues = self.venues.clone();
        venues.shuffle(&mut self.rng);
        let mut plan = Vec::new();
        for long in &venues {
            for short in &venues {
                let mut pairs = long.common_pairs(short);
                pairs.shuffle(&mut self.rng);
                for pair in pairs {
                    if self.is_invalid(long, short, &pair) {
                        continue;
                    }
                    plan.push(Combination {
                        long: long.clone(),
                        short: short.clone(),
                        pair,
                    });
                }
            }
        }
        plan
    }

    fn combinations(&self) -> Vec<Combination> {
        let mut all = Vec::new();
        for long in &self.venues {
            for short in &self.venues {
                for pair in long.common_pairs(short) {
                    if !self.is_invalid(long, short, &pair) {
                        all.push(Combination {
                            long: long.clone(),
                            short: short.clone(),
                            pair,
                        });
                    }
                }
            }
        }
        all
    }

    fn is_invalid(&self, long: &Venue, short: &Venue, pair: &CurrencyPair) -> bool {
        long.name == short.name
            || !short.can_short(pair)
            || self
                .blacklist
                .contains(&format!("{}:{}:{}", long.name, short.name, pair))
    }

    fn quotes(&self, combination: &Combination) -> Option<(Ticker, Ticker)> {
        let long = self
            .tickers
            .get(&combination.long.ticker_key(&combination.pair));
        let short = self
            .tickers
            .get(&combination.short.ticker_key(&combination.pair));
        match (long, short) {
            (Some(long), Some(short)) => Some((long.clone(), short.clone())),
            _ => {
                log::debug!(
                    "[TICKER] missing quote for {}: long={:?} short={:?}",
                    combination,
                    long,
                    short
                );
                None
            }
        }
    }

    async fn evaluate(&mut self, combination: &Combination) {
        let Some((long_ticker, short_ticker)) = self.quotes(combination) else {
            return;
        };
        let spreads = compute_spread(long_ticker.ask, short_ticker.bid)
            .and_then(|entry| compute_spread(long_ticker.bid, short_ticker.ask).map(|exit| (entry, exit)));
        let (spread_in, spread_out) = match spreads {
            Ok(spreads) => spreads,
            Err(e) => {
                log::error!("[TICKER] bad quote for {}: {}", combination, e);
                return;
            }
        };

        log::debug!("Long/Short: {} {}", combination, spread_in);

        if spread_in > self.cfg.entry_spread {
            self.consider_entry(combination, &long_ticker, &short_ticker, spread_in)
                .await;
        } else if let Some(exit_target) = self.active_exit_target(combination) {
            if spread_out < exit_target {
                self.consider_exit(combination, &long_ticker, &short_ticker, exit_target)
                    .await;
            }
        }

        self.stats.record(&combination.key(), spread_in, spread_out);
    }

    fn active_exit_target(&self, combination: &Combination) -> Option<Decimal> {
        self.position
            .as_ref()
            .filter(|p| p.matches(&combination.long, &combination.short, &combination.pair))
            .map(|p| p.exit_target)
    }

    async fn plan_entry(
        &self,
        combination: &Combination,
        long_ticker: &Ticker,
        short_ticker: &Ticker,
        spread_in: Decimal,
    ) -> Option<EntryPlan> {
        let long_fee = resolve_fee(&combination.long, &combination.pair, true).await;
        let short_fee = resolve_fee(&combination.short, &combination.pair, true).await;
        let exit_target =
            spread_in - self.cfg.exit_target - (long_fee + short_fee) * Decimal::TWO;

        let exposure = match self
            .sizer
            .maximum_exposure(&[combination.long.as_ref(), combination.short.as_ref()])
            .await
        {
            Some(exposure) if exposure > Decimal::ZERO => exposure,
            Some(exposure) => {
                log::warn!(
                    "Will not trade {}: exposure {} is not positive",
                    combination,
                    exposure
                );
                return None;
            }
            None => {
                log::warn!("Will not trade {}: exposure could not be computed", combination);
                return None;
            }
        };

        let volume_at = |price: Decimal| {
            exposure
                .checked_div(price)
                .filter(|_| price > Decimal::ZERO)
                .map(|v| v.round_dp_with_strategy(VOLUME_SCALE, RoundingStrategy::MidpointNearestEven))
        };
        let (Some(long_volume), Some(short_volume)) =
            (volume_at(long_ticker.ask), volume_at(short_ticker.bid))
        else {
            log::error!("[TICKER] cannot size {} from non-positive quote", combination);
            return None;
        };

        let long_price =
            fetch_limit_price(&combination.long, &combination.pair, long_volume, OrderSide::Bid);
        let short_price =
            fetch_limit_price(&combination.short, &combination.pair, short_volume, OrderSide::Ask);
        let (long_price, short_price) = match tokio::join!(long_price, short_price) {
            (Ok(long), Ok(short)) => (long, short),
            (Err(e), _) | (_, Err(e)) => {
                log::debug!("[LIQUIDITY] {} entry not priceable: {}", combination, e);
                return None;
            }
        };

        match compute_spread(long_price, short_price) {
            Ok(verification) if verification > self.cfg.entry_spread => Some(EntryPlan {
                exit_target,
                long_volume,
                short_volume,
                long_price,
                short_price,
            }),
            Ok(verification) => {
                log::debug!(
                    "[LIQUIDITY] Not enough liquidity to execute both trades profitably: {} {} at trade size",
                    combination,
                    verification
                );
                None
            }
            Err(e) => {
                log::error!("[LIQUIDITY] bad limit price for {}: {}", combination, e);
                None
            }
        }
    }

    async fn consider_entry(
        &mut self,
        combination: &Combination,
        long_ticker: &Ticker,
        short_ticker: &Ticker,
        spread_in: Decimal,
    ) {
        let Some(plan) = self
            .plan_entry(combination, long_ticker, short_ticker, spread_in)
            .await
        else {
            return;
        };

        if let Some(position) = &self.position {
            let key = combination.key();
            if key != position.combination_key() && self.missed_entries.insert(key) {
                log::info!("[MISSED_ENTRY] ***** MISSED ENTRY *****");
                log::info!(
                    "[MISSED_ENTRY] Detected an entry opportunity but there are already positions open."
                );
                log::info!("[MISSED_ENTRY] {} @ {}", combination, spread_in);
            }
            return;
        }

        if self.entry_halted {
            log::warn!(
                "[ENTRY] entries halted after an unhedged placement failure, skipping {} @ {}",
                combination,
                spread_in
            );
            return;
        }

        self.enter(combination, long_ticker, short_ticker, spread_in, plan)
            .await;
    }

    async fn enter(
        &mut self,
        combination: &Combination,
        long_ticker: &Ticker,
        short_ticker: &Ticker,
        spread_in: Decimal,
        plan: EntryPlan,
    ) {
        log::info!("[ENTRY] ***** ENTRY *****");
        log_balances(&combination.long, &combination.short).await;
        log::info!("[ENTRY] Entry spread: {}", spread_in);
        log::info!("[ENTRY] Exit spread target: {}", plan.exit_target);
        log::info!(
            "[ENTRY] Long entry: {} {} {} @ {} ({} slip) = {}",
            combination.long.name,
            combination.pair,
            plan.long_volume,
            plan.long_price,
            plan.long_price - long_ticker.ask,
            plan.long_volume * plan.long_price
        );
        log::info!(
            "[ENTRY] Short entry: {} {} {} @ {} ({} slip) = {}",
            combination.short.name,
            combination.pair,
            plan.short_volume,
            plan.short_price,
            short_ticker.bid - plan.short_price,
            plan.short_volume * plan.short_price
        );

        let request = PairOrder {
            pair: combination.pair.clone(),
            direction: TradeDirection::Open,
            long_volume: plan.long_volume,
            long_price: plan.long_price,
            short_volume: plan.short_volume,
            short_price: plan.short_price,
        };
        let placed = match self
            .executor
            .place_pair(&combination.long, &combination.short, &request)
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                self.handle_execution_error("[ENTRY]", &e);
                return;
            }
        };

        match self.executor.wait_for_fills(&placed).await {
            FillOutcome::Filled => log::info!("[ENTRY] Trades executed successfully!"),
            FillOutcome::TimedOut { outstanding } => log::error!(
                "[ENTRY] orders still open after timeout {:?}; recording the position so the exposure stays tracked",
                outstanding
            ),
            FillOutcome::Cancelled => log::warn!(
                "[ENTRY] fill wait interrupted; recording the position with orders still working"
            ),
        }

        self.position = Some(Position {
            long: TradeLeg {
                venue: combination.long.clone(),
                order_id: placed.long.order_id,
                volume: plan.long_volume,
                entry: plan.long_price,
            },
            short: TradeLeg {
                venue: combination.short.clone(),
                order_id: placed.short.order_id,
                volume: plan.short_volume,
                entry: plan.short_price,
            },
            pair: combination.pair.clone(),
            exit_target: plan.exit_target,
        });
        self.missed_entries.clear();
        self.persist_position();
        if let Some(reporter) = self.status_reporter.as_mut() {
            reporter.record_entry();
        }
    }

    async fn consider_exit(
        &mut self,
        combination: &Combination,
        long_ticker: &Ticker,
        short_ticker: &Ticker,
        exit_target: Decimal,
    ) {
        let Some(position) = self.position.clone() else {
            return;
        };
        let pair = &position.pair;
        let Some(long_volume) = resolve_exit_volume(&LONG_EXIT_SOURCES, &position.long, pair).await
        else {
            log::error!("[EXIT] no volume source for the long leg of {}", combination);
            return;
        };
        if long_volume <= Decimal::ZERO {
            log::error!(
                "[EXIT] {} holds {} {} for the long leg of {}; it is already unwound, skipping the exit",
                combination.long.name,
                long_volume,
                combination.long.native_pair(pair).base,
                combination
            );
            return;
        }
        let Some(short_volume) =
            resolve_exit_volume(&SHORT_EXIT_SOURCES, &position.short, pair).await
        else {
            log::error!("[EXIT] no volume source for the short leg of {}", combination);
            return;
        };

        let (long_price, short_price) = match tokio::join!(
            fetch_limit_price(&combination.long, pair, long_volume, OrderSide::Ask),
            fetch_limit_price(&combination.short, pair, short_volume, OrderSide::Bid)
        ) {
            (Ok(long), Ok(short)) => (long, short),
            (Err(e), _) | (_, Err(e)) => {
                log::debug!("[LIQUIDITY] {} exit not priceable: {}", combination, e);
                return;
            }
        };

        match compute_spread(long_price, short_price) {
            Ok(verification) if verification < exit_target => {}
            Ok(verification) => {
                log::debug!(
                    "[LIQUIDITY] Not enough liquidity to execute both trades profitably: {} {} at trade size",
                    combination,
                    verification
                );
                return;
            }
            Err(e) => {
                log::error!("[LIQUIDITY] bad limit price for {}: {}", combination, e);
                return;
            }
        }

        log::info!("[EXIT] ***** EXIT *****");
        log::info!(
            "[EXIT] Long close: {} {} {} @ {} ({} slip) = {}",
            combination.long.name,
            pair,
            long_volume,
            long_price,
            long_price - long_ticker.bid,
            long_volume * long_ticker.bid
        );
        log::info!(
            "[EXIT] Short close: {} {} {} @ {} ({} slip) = {}",
            combination.short.name,
            pair,
            short_volume,
            short_price,
            short_ticker.ask - short_price,
            short_volume * short_ticker.ask
        );
        let (long_profit, short_profit) =
            estimated_profit(&position, long_volume, long_price, short_volume, short_price);
        log::info!(
            "[EXIT] Estimated profit: (long) {} + (short) {} = {}",
            long_profit,
            short_profit,
            long_profit + short_profit
        );

        let request = PairOrder {
            pair: pair.clone(),
            direction: TradeDirection::Close,
            long_volume,
            long_price,
            short_volume,
            short_price,
        };
        let placed = match self
            .executor
            .place_pair(&combination.long, &combination.short, &request)
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                self.handle_execution_error("[EXIT]", &e);
                return;
            }
        };

        match self.executor.wait_for_fills(&placed).await {
            FillOutcome::Filled => {
                log::info!("[EXIT] Trades executed successfully!");
                log_balances(&combination.long, &combination.short).await;
                self.position = None;
                self.persist_position();
                if let Some(reporter) = self.status_reporter.as_mut() {
                    reporter.record_exit();
                }
            }
            FillOutcome::TimedOut { outstanding } => {
                log::error!(
                    "[EXIT] orders still open after timeout {:?}; cancelling and keeping the position",
                    outstanding
                );
                let failed = self.executor.cancel_outstanding(&placed).await;
                if !failed.is_empty() {
                    log::error!("[EXIT] could not cancel exit orders {:?}", failed);
                }
            }
            FillOutcome::Cancelled => {
                log::warn!("[EXIT] fill wait interrupted; keeping the position");
            }
        }
    }

    fn handle_execution_error(&mut self, tag: &str, err: &ExecutionError) {
        log::error!("{} failed to place order pair: {}", tag, err);
        if let ExecutionError::PartialPlacement {
            compensated: false, ..
        } = err
        {
            log::error!(
                "{} one leg is live without its hedge, halting new entries until restart",
                tag
            );
            self.entry_halted = true;
        }
    }

    fn persist_position(&self) {
        if let Err(e) = self.store.save(self.position.as_ref()) {
            log::error!(
                "[POSITION] failed to persist position to {}: {:?}",
                self.store.path().display(),
                e
            );
        }
    }

    fn write_status(&mut self, cycle_duration: Duration) {
        let position = self.position.as_ref();
        if let Some(reporter) = self.status_reporter.as_mut() {
            if let Err(e) = reporter.write_snapshot(position, self.entry_halted, cycle_duration) {
                log::warn!("[STATUS] failed to write status: {:?}", e);
            }
        }
    }

    /// Logs every valid combination's current spread against its target.
    pub fn summary(&self) {
        log::info!(
            "[SUMMARY] [Long/Short Exchanges] [Pair] [Current Spread] -> [{} Spread Target]",
            if self.position.is_some() { "Exit" } else { "Entry" }
        );
        for combination in self.combinations() {
            let Some((long_ticker, short_ticker)) = self.quotes(&combination) else {
                continue;
            };
            let (Ok(spread_in), Ok(spread_out)) = (
                compute_spread(long_ticker.ask, short_ticker.bid),
                compute_spread(long_ticker.bid, short_ticker.ask),
            ) else {
                continue;
            };
            match (&self.position, self.active_exit_target(&combination)) {
                (None, _) if spread_in > Decimal::ZERO => {
                    log::info!(
                        "[SUMMARY] {} {} -> {}",
                        combination,
                        spread_in,
                        self.cfg.entry_spread
                    );
                }
                (Some(_), Some(exit_target)) => {
                    log::info!("[SUMMARY] {} {} -> {}", combination, spread_out, exit_target);
                }
                _ => {}
            }
            if let Some(stats) = self.stats.get(&combination.key()) {
                log::info!(
                    "[SUMMARY] {} entry min/max {}/{} exit min/max {}/{}",
                    combination,
                    stats.min_entry,
                    stats.max_entry,
                    stats.min_exit,
                    stats.max_exit
                );
            }
        }
    }

    async fn startup_overview(&mut self) {
        for venue in &self.venues {
            log::debug!("{} home currency: {}", venue.name, venue.home_currency);
            match venue.gateway.get_account_balance(&venue.home_currency).await {
                Ok(balance) => log::info!(
                    "{} balance: {} {}",
                    venue.name,
                    venue.home_currency,
                    balance.round_dp_with_strategy(
                        CURRENCY_SCALE,
                        RoundingStrategy::MidpointNearestEven
                    )
                ),
                Err(e) => log::error!("Unable to fetch account balance for {}: {}", venue.name, e),
            }
            if let Some(pair) = venue.trading_pairs.first() {
                let fee = resolve_fee(venue, pair, false).await;
                log::info!(
                    "[FEE] {} {} trading fee: {}",
                    venue.name,
                    venue.native_pair(pair),
                    fee
                );
            }
        }

        if let Err(e) = self.refresh_tickers().await {
            log::error!("[TICKER] initial quote fetch failed: {:?}", e);
        }
        log::info!("Trading the following exchanges and pairs:");
        for combination in self.combinations() {
            if self.quotes(&combination).is_some() {
                log::info!("{}", combination);
            }
        }

        if let Some(fixed) = self.sizer.fixed_exposure() {
            log::info!("Using fixed exposure of {} as configured", fixed);
        }
        if let Some(position) = &self.position {
            log::info!(
                "[POSITION] resuming open position {} long {} {} @ {} short {} {} @ {} exit target {}",
                position.combination_key(),
                position.long.venue.name,
                position.long.volume,
                position.long.entry,
                position.short.venue.name,
                position.short.volume,
                position.short.entry,
                position.exit_target
            );
        }
    }
}

/// Quotes of one venue keyed by [`Venue::ticker_key`]. Only `Internal`
/// errors are returned; anything else leaves the venue without quotes.
async fn fetch_tickers(venue: &Venue) -> Result<Vec<(String, Ticker)>, GatewayError> {
    let start = Instant::now();
    let native: Vec<CurrencyPair> = venue
        .trading_pairs
        .iter()
        .map(|p| venue.native_pair(p))
        .collect();

    let tickers = match venue.gateway.get_tickers(&native).await {
        Ok(mut by_pair) => venue
            .trading_pairs
            .iter()
            .filter_map(|pair| {
                by_pair
                    .remove(&venue.native_pair(pair))
                    .map(|t| (venue.ticker_key(pair), t))
            })
            .collect(),
        Err(GatewayError::NotSupported(_)) => {
            log::debug!(
                "[TICKER] {} does not support batch tickers, fetching individually",
                venue.name
            );
            let singles = join_all(venue.trading_pairs.iter().map(|pair| async move {
                (pair, venue.gateway.get_ticker(&venue.native_pair(pair)).await)
            }))
            .await;
            let mut tickers = Vec::new();
            for (pair, result) in singles {
                match result {
                    Ok(ticker) => tickers.push((venue.ticker_key(pair), ticker)),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log::debug!("[TICKER] Unable to fetch ticker for {} {}: {}", venue.name, pair, e)
                    }
                }
            }
            tickers
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            log::debug!("[TICKER] Unable to get tickers for {}: {}", venue.name, e);
            Vec::new()
        }
    };

    let elapsed = start.elapsed();
    if elapsed > SLOW_POLL {
        log::warn!(
            "[TICKER] Slow Tickers! Fetched {} tickers for {} in {} ms",
            tickers.len(),
            venue.name,
            elapsed.as_millis()
        );
    }
    for (key, ticker) in &tickers {
        log::debug!("[TICKER] {} {}/{}", key, ticker.bid, ticker.ask);
    }
    Ok(tickers)
}

fn estimated_profit(
    position: &Position,
    long_volume: Decimal,
    long_exit: Decimal,
    short_volume: Decimal,
    short_exit: Decimal,
) -> (Decimal, Decimal) {
    let round = |v: Decimal| v.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointNearestEven);
    (
        round(long_volume * (long_exit - position.long.entry)),
        round(short_volume * (position.short.entry - short_exit)),
    )
}

async fn log_balances(long: &Venue, short: &Venue) {
    let (long_balance, short_balance) = tokio::join!(
        long.gateway.get_account_balance(&long.home_currency),
        short.gateway.get_account_balance(&short.home_currency)
    );
    match (long_balance, short_balance) {
        (Ok(l), Ok(s)) => log::info!(
            "Updated account balances: {} {} + {} {} = {}",
            long.name,
            l,
            short.name,
            s,
            l + s
        ),
        (Err(e), _) | (_, Err(e)) => log::error!("Error fetching account balances: {}", e),
    }
}

async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown.as_mut() {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}
