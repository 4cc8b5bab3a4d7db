//! Order reconciliation engine
//!
//! Each tick compares the open orders reported by the exchange with the
//! expected per-side counts kept in [`StateManager`]. A side with fewer open
//! orders than expected has been (partially) filled; the engine places the
//! same number of replacement orders on the opposite side, re-reads the
//! exchange as ground truth and tops up sides that fell below their target.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::balance::{BalanceLedger, ObservedOrders};
use super::clock::Clock;
use super::config::{QuoteConvention, TradingPairConfig};
use super::errors::{GridError, GridResult};
use super::executor::ExchangeClient;
use super::ledger::{ExecutionRecord, LedgerSink};
use super::planner::{GridPlanner, Ladder, DEFAULT_ORDER_DELAY};
use super::reposition::RepositionController;
use super::shutdown::ShutdownSignal;
use super::sizer::{OrderSizer, ReferenceRate};
use super::state::StateManager;
use super::types::{BalanceSnapshot, OrderRecord, OrderSide, PriceBook, SideCounts};

/// Delay between replacement placements
pub const DEFAULT_REPLACEMENT_DELAY: Duration = Duration::from_millis(200);

/// Tunables for [`ReconciliationEngine`]
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub sizer: OrderSizer,
    pub order_delay: Duration,
    pub replacement_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sizer: OrderSizer::default(),
            order_delay: DEFAULT_ORDER_DELAY,
            replacement_delay: DEFAULT_REPLACEMENT_DELAY,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Orders accepted by the exchange
    pub placed: u32,
    pub filled_buys: u32,
    pub filled_sells: u32,
    /// Pairs whose grid was rebuilt
    pub repositioned: Vec<String>,
    /// Open orders that matched no configured pair
    pub unmatched: usize,
    /// Pairs sized with a fallback reference rate instead of the auxiliary price
    pub degraded_rates: Vec<String>,
}

#[derive(Debug, Default)]
struct PairOutcome {
    placed: u32,
    filled: SideCounts,
    repositioned: bool,
    degraded_rate: bool,
    /// Ground truth read after placing, if any
    snapshot: Option<ObservedOrders>,
    /// Orders were placed but open orders could not be re-read
    stale: bool,
}

pub struct ReconciliationEngine {
    pairs: Vec<TradingPairConfig>,
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<dyn LedgerSink>,
    planner: GridPlanner,
    balance_ledger: BalanceLedger,
    reposition: RepositionController,
    state: StateManager,
    prices: PriceBook,
    totals: HashMap<String, f64>,
    /// Orders seen at the end of the previous tick: id -> (pair, order)
    last_seen: HashMap<String, (String, OrderRecord)>,
    options: EngineOptions,
    shutdown: ShutdownSignal,
}

impl ReconciliationEngine {
    /// Create an engine for the enabled pairs in `pairs`
    pub fn new(
        pairs: Vec<TradingPairConfig>,
        exchange: Arc<dyn ExchangeClient>,
        ledger: Arc<dyn LedgerSink>,
        state: StateManager,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownSignal,
        options: EngineOptions,
    ) -> Self {
        let pairs: Vec<TradingPairConfig> = pairs.into_iter().filter(|p| p.enabled).collect();
        let planner = GridPlanner::new(exchange.clone(), ledger.clone(), options.sizer, shutdown.clone())
            .with_order_delay(options.order_delay);

        Self {
            balance_ledger: BalanceLedger::new(&pairs),
            pairs,
            exchange,
            ledger,
            planner,
            reposition: RepositionController::new(clock),
            state,
            prices: PriceBook::new(),
            totals: HashMap::new(),
            last_seen: HashMap::new(),
            options,
            shutdown,
        }
    }

    pub fn pairs(&self) -> &[TradingPairConfig] {
        &self.pairs
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn prices(&self) -> &PriceBook {
        &self.prices
    }

    /// Write the state file now
    pub fn save_state(&self) -> GridResult<()> {
        self.state.save()
    }

    // ------------------------------------------------------------------
    // Market data
    // ------------------------------------------------------------------

    /// Refresh total balances; on failure the previous totals are kept
    pub async fn refresh_balances(&mut self) -> bool {
        match self.exchange.get_balances().await {
            Ok(totals) => {
                debug!("Balances: {:?}", totals);
                self.totals = totals;
                true
            }
            Err(e) => {
                warn!("Balance refresh failed, using previous balances: {}", e);
                false
            }
        }
    }

    /// Refresh last prices for every traded and reference pair
    pub async fn refresh_prices(&mut self) -> bool {
        let mut ids: Vec<String> = Vec::new();
        for config in &self.pairs {
            ids.push(config.exchange_pair.clone());
            if let QuoteConvention::CrossQuoted {
                auxiliary_pair,
                fallback_pair,
                ..
            } = &config.quote_convention
            {
                ids.push(auxiliary_pair.clone());
                ids.extend(fallback_pair.iter().cloned());
            }
        }
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));

        match self.exchange.get_ticker(&ids).await {
            Ok(prices) => {
                for id in ids.iter().filter(|id| !prices.contains_key(*id)) {
                    warn!("No ticker price for {}", id);
                }
                self.prices.update(prices);
                true
            }
            Err(e) => {
                warn!("Price refresh failed, using previous prices: {}", e);
                false
            }
        }
    }

    async fn fetch_observed(&self) -> GridResult<ObservedOrders> {
        let orders = self.exchange.get_open_orders().await?;
        Ok(self.balance_ledger.classify(orders))
    }

    fn current_price(&self, config: &TradingPairConfig) -> Option<f64> {
        self.prices.get(&config.exchange_pair)
    }

    fn reference_rate(&self, config: &TradingPairConfig) -> ReferenceRate {
        self.options.sizer.reference_rate(config, &self.prices)
    }

    fn balances(&self, observed: &ObservedOrders) -> BalanceSnapshot {
        self.balance_ledger.compute(&self.totals, observed)
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Cancel every open order and build a fresh grid for each pair
    pub async fn rebuild_all(&mut self) -> GridResult<SideCounts> {
        let cancelled = self.exchange.cancel_all(None).await?;
        info!("Cancelled {} open orders before rebuilding", cancelled);
        for config in &self.pairs {
            self.state.set_expected(&config.name, SideCounts::default());
        }
        self.last_seen.clear();

        self.refresh_balances().await;
        self.refresh_prices().await;

        let mut total = SideCounts::default();
        let pairs = self.pairs.clone();
        for config in &pairs {
            if self.shutdown.is_triggered() {
                break;
            }

            let Some(price) = self.current_price(config) else {
                warn!("{}: no price available, grid deferred to the next tick", config.name);
                continue;
            };

            // Earlier pairs' placements lock funds shared with this one
            let observed = self.fetch_observed().await?;
            let balances = self.balances(&observed);
            let rate = self.reference_rate(config);

            match self
                .planner
                .create_grid(config, &mut self.state, price, &balances, &rate)
                .await
            {
                Ok(placed) => {
                    total.buy += placed.buy;
                    total.sell += placed.sell;
                }
                Err(e) => warn!("{}: grid creation failed: {}", config.name, e),
            }
        }

        // Track the new grid so fills before the first tick are recorded
        match self.fetch_observed().await {
            Ok(observed) => self.remember(&observed),
            Err(e) => warn!("Cannot read open orders after rebuilding: {}", e),
        }

        Ok(total)
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Run one reconciliation pass over all pairs
    ///
    /// Fails only when the open orders cannot be read; every other failure
    /// is contained to its pair and side.
    pub async fn tick(&mut self) -> GridResult<TickReport> {
        self.refresh_balances().await;
        self.refresh_prices().await;

        let mut snapshot = self.fetch_observed().await?;
        let mut report = TickReport {
            unmatched: snapshot.unmatched().len(),
            ..TickReport::default()
        };

        self.seed_expected(&snapshot);
        self.clamp_expected(&snapshot);

        // Each pair is sized against a snapshot that includes every order
        // placed earlier in this tick, since pairs may share an asset
        let mut stale = false;
        let pairs = self.pairs.clone();
        for config in &pairs {
            if self.shutdown.is_triggered() {
                info!("Shutdown requested, ending tick early");
                break;
            }

            let Some(price) = self.current_price(config) else {
                warn!("{}: no current price, skipping", config.name);
                continue;
            };

            let outcome = if self
                .reposition
                .should_reposition(config, self.state.get(&config.name), price)
            {
                self.reposition_pair(config).await
            } else {
                self.reconcile_pair(config, &snapshot, price).await
            };

            report.placed += outcome.placed;
            report.filled_buys += outcome.filled.buy;
            report.filled_sells += outcome.filled.sell;
            if outcome.repositioned {
                report.repositioned.push(config.name.clone());
            }
            if outcome.degraded_rate {
                report.degraded_rates.push(config.name.clone());
            }
            if let Some(fresh) = outcome.snapshot {
                snapshot = fresh;
            }
            if outcome.stale {
                warn!(
                    "{}: open orders unreadable after placing, remaining pairs wait for the next tick",
                    config.name
                );
                stale = true;
                break;
            }
        }

        if stale {
            match self.fetch_observed().await {
                Ok(fresh) => snapshot = fresh,
                Err(e) => warn!("Open orders still unreadable, execution tracking may miss fills: {}", e),
            }
        }
        self.remember(&snapshot);

        if report.placed > 0 || report.filled_buys > 0 || report.filled_sells > 0 {
            info!(
                "Tick: {} fills ({} buy / {} sell), {} orders placed",
                report.filled_buys + report.filled_sells,
                report.filled_buys,
                report.filled_sells,
                report.placed
            );
        } else {
            debug!("Tick: no changes");
        }

        Ok(report)
    }

    /// Start tracking pairs without a record from this tick's observation
    ///
    /// A pair with no matched orders is only seeded when nothing was left
    /// unmatched, since an unmatched order might be one of its own.
    fn seed_expected(&mut self, observed: &ObservedOrders) {
        let any_unmatched = !observed.unmatched().is_empty();

        for config in &self.pairs {
            if self.state.has_expected(&config.name) {
                continue;
            }

            if observed.has_orders(&config.name) || !any_unmatched {
                let counts = observed.counts(&config.name);
                info!("{}: seeding expected counts from open orders: {}", config.name, counts);
                self.state.set_expected(&config.name, counts);
            } else {
                warn!(
                    "{}: not seeding expected counts while {} open order(s) are unmatched",
                    config.name,
                    observed.unmatched().len()
                );
            }
        }
    }

    /// Reset expected counts that exceed the per-side maximum
    fn clamp_expected(&mut self, observed: &ObservedOrders) {
        for config in &self.pairs {
            let Some(expected) = self.state.expected(&config.name) else {
                continue;
            };

            let counts = observed.counts(&config.name);
            let mut clamped = expected;
            for side in [OrderSide::Buy, OrderSide::Sell] {
                if expected.get(side) > config.max_orders_per_side {
                    warn!(
                        "{}: expected {} count {} exceeds max {}, resetting to observed {}",
                        config.name,
                        side,
                        expected.get(side),
                        config.max_orders_per_side,
                        counts.get(side)
                    );
                    *clamped.get_mut(side) = counts.get(side);
                }
            }

            if clamped != expected {
                self.state.set_expected(&config.name, clamped);
            }
        }
    }

    fn remember(&mut self, observed: &ObservedOrders) {
        self.last_seen = observed
            .iter()
            .map(|(pair, order)| (order.id.clone(), (pair.to_string(), order.clone())))
            .collect();
    }

    async fn reconcile_pair(
        &mut self,
        config: &TradingPairConfig,
        observed: &ObservedOrders,
        price: f64,
    ) -> PairOutcome {
        let name = config.name.as_str();
        let mut outcome = PairOutcome::default();

        let Some(expected) = self.state.expected(name) else {
            debug!("{}: no expected counts yet", name);
            return outcome;
        };
        if self.state.center_price(name).is_none() {
            self.state.set_center(name, price);
        }

        let mut counts = observed.counts(name);
        outcome.filled = SideCounts::new(
            expected.buy.saturating_sub(counts.buy),
            expected.sell.saturating_sub(counts.sell),
        );
        let rate = self.reference_rate(config);
        outcome.degraded_rate = rate.is_degraded();

        if outcome.filled.total() > 0 {
            info!(
                "{}: expected {}, observed {} -> {} sell fill(s), {} buy fill(s)",
                name, expected, counts, outcome.filled.sell, outcome.filled.buy
            );
            self.record_executions(config, observed, outcome.filled, &rate);

            self.refresh_balances().await;
            let balances = self.balances(observed);

            let mut placed = SideCounts::default();
            for side in [OrderSide::Buy, OrderSide::Sell] {
                // Filled sells are replaced by buys and vice versa
                let delta = outcome.filled.get(side.opposite());
                if delta == 0 || self.shutdown.is_triggered() {
                    continue;
                }
                let room = config.max_orders_per_side.saturating_sub(counts.get(side));
                let count = delta.min(room);
                if count < delta {
                    info!(
                        "{}: {} side has room for {} of {} replacement(s)",
                        name, side, count, delta
                    );
                }
                if count == 0 {
                    continue;
                }
                *placed.get_mut(side) = self
                    .place_side(config, side, count, observed, price, &balances, &rate, self.options.replacement_delay)
                    .await;
            }
            outcome.placed += placed.total();

            match self.fetch_observed().await {
                Ok(fresh) => {
                    counts = fresh.counts(name);
                    self.state.set_expected(name, counts);
                    outcome.snapshot = Some(fresh);
                }
                Err(e) => {
                    warn!("{}: re-reading open orders failed, assuming placements stuck: {}", name, e);
                    counts = SideCounts::new(counts.buy + placed.buy, counts.sell + placed.sell);
                    self.state.set_expected(name, counts);
                    // Without ground truth the balances cannot be trusted for a top-up
                    outcome.stale = placed.total() > 0;
                    return outcome;
                }
            }
        }

        // Top up from the freshest view available
        let current = outcome.snapshot.as_ref().unwrap_or(observed);
        let balances = self.balances(current);
        let mut topped_up = 0;
        for side in [OrderSide::Buy, OrderSide::Sell] {
            if self.shutdown.is_triggered() {
                break;
            }
            let placed = self
                .top_up_side(config, side, counts.get(side), current, price, &balances, &rate)
                .await;
            if placed > 0 {
                topped_up += placed;
                self.state
                    .set_expected_side(name, side, counts.get(side) + placed);
            }
        }

        if topped_up > 0 {
            outcome.placed += topped_up;
            self.refresh_snapshot(name, &mut outcome).await;
        }

        outcome
    }

    /// Re-read open orders after placing so later pairs see the locked funds
    async fn refresh_snapshot(&self, name: &str, outcome: &mut PairOutcome) {
        match self.fetch_observed().await {
            Ok(fresh) => outcome.snapshot = Some(fresh),
            Err(e) => {
                warn!("{}: re-reading open orders after placing failed: {}", name, e);
                outcome.stale = true;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn top_up_side(
        &self,
        config: &TradingPairConfig,
        side: OrderSide,
        have: u32,
        observed: &ObservedOrders,
        price: f64,
        balances: &BalanceSnapshot,
        rate: &ReferenceRate,
    ) -> u32 {
        if have >= config.max_orders_per_side {
            return 0;
        }

        let available = self.planner.available_for(side, config, balances);
        let affordable = self
            .options
            .sizer
            .affordable_orders(side, config, price, available, rate);
        let to_add = (config.max_orders_per_side - have).min(affordable);

        if have < config.min_orders_per_side {
            warn!(
                "{}: {} {} orders, below minimum {}; adding {}",
                config.name, have, side, config.min_orders_per_side, to_add
            );
        } else if to_add > 0 {
            info!(
                "{}: {} {} orders, balance allows {} more",
                config.name, have, side, to_add
            );
        }

        if to_add == 0 {
            return 0;
        }

        self.place_side(config, side, to_add, observed, price, balances, rate, self.options.order_delay)
            .await
    }

    /// Place `count` orders beyond the outermost order of `side`
    #[allow(clippy::too_many_arguments)]
    async fn place_side(
        &self,
        config: &TradingPairConfig,
        side: OrderSide,
        count: u32,
        observed: &ObservedOrders,
        price: f64,
        balances: &BalanceSnapshot,
        rate: &ReferenceRate,
        delay: Duration,
    ) -> u32 {
        let available = self.planner.available_for(side, config, balances);
        let volume = match self
            .options
            .sizer
            .compute_volume(side, config, price, count, available, rate)
        {
            Ok(volume) => volume,
            Err(e) => {
                warn!("{}: cannot place {} {} order(s): {}", config.name, count, side, e);
                return 0;
            }
        };

        let center = self.state.center_price(&config.name).unwrap_or(price);
        let ladder = Ladder {
            side,
            anchor: ladder_anchor(side, observed.outermost_price(&config.name, side), price),
            step: center * config.grid_interval / 100.0,
            count,
            volume,
        };

        self.planner.extend(config, &ladder, rate, delay).await
    }

    /// Report orders that vanished since the last tick as executions
    ///
    /// Only done when the vanished orders of a side account exactly for the
    /// inferred fills.
    fn record_executions(
        &self,
        config: &TradingPairConfig,
        observed: &ObservedOrders,
        filled: SideCounts,
        rate: &ReferenceRate,
    ) {
        let present: HashSet<&str> = observed
            .orders(&config.name)
            .iter()
            .map(|o| o.id.as_str())
            .collect();

        for side in [OrderSide::Buy, OrderSide::Sell] {
            let inferred = filled.get(side);
            if inferred == 0 {
                continue;
            }

            let gone: Vec<&OrderRecord> = self
                .last_seen
                .values()
                .filter(|(pair, order)| {
                    *pair == config.name && order.side == side && !present.contains(order.id.as_str())
                })
                .map(|(_, order)| order)
                .collect();

            if gone.len() != inferred as usize {
                debug!(
                    "{}: {} {} fill(s) inferred but {} tracked order(s) vanished, not recording",
                    config.name,
                    inferred,
                    side,
                    gone.len()
                );
                continue;
            }

            for order in gone {
                let execution = ExecutionRecord {
                    order_id: order.id.clone(),
                    execution_id: uuid::Uuid::new_v4().to_string(),
                    pair: config.name.clone(),
                    side,
                    volume: order.volume,
                    price: order.price,
                    fee: 0.0,
                    reference_rate: rate.value,
                };
                if let Err(e) = self.ledger.record_execution(&execution) {
                    warn!("{}: failed to record execution of {}: {}", config.name, order.id, e);
                }
            }
        }
    }

    /// Cancel and rebuild a pair's grid around the current price
    ///
    /// The outcome carries the open orders read after the rebuild, whether
    /// or not it succeeded, since the cancel may already have gone through.
    async fn reposition_pair(&mut self, config: &TradingPairConfig) -> PairOutcome {
        self.reposition.begin(&config.name);
        let result = self.try_reposition(config).await;
        self.reposition.finish(&config.name);

        let mut outcome = PairOutcome::default();
        match result {
            Ok((placed, rate)) => {
                if placed.total() > 0 {
                    let now = self.reposition.now_secs();
                    self.state.set_last_reposition(&config.name, now);
                    info!("{}: repositioned with {}", config.name, placed);
                } else {
                    warn!("{}: reposition placed no orders", config.name);
                }
                outcome.placed = placed.total();
                outcome.repositioned = true;
                outcome.degraded_rate = rate.is_degraded();
            }
            Err(e) => warn!("{}: reposition failed: {}", config.name, e),
        }

        self.refresh_snapshot(&config.name, &mut outcome).await;
        outcome
    }

    async fn try_reposition(
        &mut self,
        config: &TradingPairConfig,
    ) -> GridResult<(SideCounts, ReferenceRate)> {
        let cancelled = self.exchange.cancel_all(Some(&config.exchange_pair)).await?;
        info!("{}: cancelled {} orders for reposition", config.name, cancelled);
        self.state.set_expected(&config.name, SideCounts::default());

        self.refresh_balances().await;
        self.refresh_prices().await;

        let price = self.current_price(config).ok_or_else(|| {
            GridError::PriceUnavailable(format!("{}: no price after cancelling", config.name))
        })?;
        let observed = self.fetch_observed().await?;
        let balances = self.balances(&observed);
        let rate = self.reference_rate(config);

        let placed = self
            .planner
            .create_grid(config, &mut self.state, price, &balances, &rate)
            .await?;
        Ok((placed, rate))
    }
}

/// Price the next level is stepped from: the outermost order of the side if
/// it lies on the correct side of the market, else the current price
fn ladder_anchor(side: OrderSide, outermost: Option<f64>, price: f64) -> f64 {
    match (side, outermost) {
        (OrderSide::Buy, Some(lowest)) if lowest < price => lowest,
        (OrderSide::Sell, Some(highest)) if highest > price => highest,
        _ => price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::clock::ManualClock;
    use crate::grid::config::MinOrderUnit;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::ledger::MemoryLedger;

    fn test_pair() -> TradingPairConfig {
        TradingPairConfig::new("TEST/USD", "XTESTZUSD", "TEST", "USD", 1.0)
            .with_precision(2, 6)
            .with_min_order(1.0, MinOrderUnit::BaseVolume)
            .with_order_limits(2, 6)
    }

    fn options() -> EngineOptions {
        EngineOptions {
            order_delay: Duration::ZERO,
            replacement_delay: Duration::ZERO,
            ..EngineOptions::default()
        }
    }

    fn engine_with(
        config: TradingPairConfig,
        exchange: Arc<MockExchange>,
        ledger: Arc<MemoryLedger>,
        state: StateManager,
        clock: Arc<ManualClock>,
    ) -> ReconciliationEngine {
        ReconciliationEngine::new(
            vec![config],
            exchange,
            ledger,
            state,
            clock,
            ShutdownSignal::never(),
            options(),
        )
    }

    /// Four buys at 99..96 and four sells at 101..104, one unit each
    async fn seed_ladder(exchange: &MockExchange) -> Vec<String> {
        let mut sells = Vec::new();
        for i in 1..=4 {
            exchange
                .seed_order("TESTUSD", OrderSide::Buy, 1.0, 100.0 - i as f64)
                .await;
            sells.push(
                exchange
                    .seed_order("TESTUSD", OrderSide::Sell, 1.0, 100.0 + i as f64)
                    .await,
            );
        }
        sells
    }

    fn buy_prices(orders: &[crate::grid::types::OrderRequest]) -> Vec<f64> {
        orders
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.price)
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_start_builds_grid_through_top_up() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 220.0).await;
        exchange.set_balance("TEST", 2.2).await;
        exchange.set_echo_pair("XTESTZUSD", "TESTUSD").await;

        let config = test_pair().with_order_limits(1, 3);
        let mut engine = engine_with(
            config,
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
            Arc::new(ManualClock::new(0)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 4);

        let placed = exchange.placed_orders().await;
        assert_eq!(buy_prices(&placed), vec![99.0, 98.0]);
        let sells: Vec<f64> = placed
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .map(|o| o.price)
            .collect();
        assert_eq!(sells, vec![101.0, 102.0]);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(2, 2)));
        assert_eq!(engine.state().center_price("TEST/USD"), Some(100.0));

        // Echoed orders resolve to the pair, so nothing more is placed
        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 0);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(2, 2)));
    }

    #[tokio::test]
    async fn test_sell_fills_trigger_exact_buy_replacements() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 620.0).await;
        exchange.set_balance("TEST", 4.0).await;
        seed_ladder(&exchange).await;

        let mut state = StateManager::in_memory();
        state.set_expected("TEST/USD", SideCounts::new(4, 6));
        state.set_center("TEST/USD", 100.0);

        let mut engine = engine_with(
            test_pair(),
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            state,
            Arc::new(ManualClock::new(0)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.filled_sells, 2);
        assert_eq!(report.filled_buys, 0);
        assert_eq!(report.placed, 2);

        let placed = exchange.placed_orders().await;
        assert_eq!(buy_prices(&placed), vec![95.0, 94.0]);
        assert!(placed.iter().all(|o| o.side == OrderSide::Buy));
        assert!((placed[0].volume - 1.0925).abs() < 1e-9);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(6, 4)));

        // Unchanged open orders: nothing to do
        let report = engine.tick().await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(exchange.placed_orders().await.len(), 2);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(6, 4)));
    }

    #[tokio::test]
    async fn test_vanished_orders_are_recorded_as_executions() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        // Everything locked in the seeded ladder
        exchange.set_balance("USD", 390.0).await;
        exchange.set_balance("TEST", 4.0).await;
        let sells = seed_ladder(&exchange).await;

        let ledger = Arc::new(MemoryLedger::new());
        let mut engine = engine_with(
            test_pair(),
            exchange.clone(),
            ledger.clone(),
            StateManager::in_memory(),
            Arc::new(ManualClock::new(0)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 0);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(4, 4)));

        exchange.fill_order(&sells[0]).await.unwrap();
        exchange.fill_order(&sells[1]).await.unwrap();
        exchange.set_balance("USD", 620.0).await;
        exchange.set_balance("TEST", 2.0).await;

        let report = engine.tick().await.unwrap();
        assert_eq!(report.filled_sells, 2);
        assert_eq!(report.placed, 2);

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.executions, 2);
        assert_eq!(summary.orders_placed, 2);
        assert_eq!(summary.pairs["TEST/USD"].sells, 2);
        assert!((summary.total_volume - 203.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejected_replacement_is_refilled_from_ground_truth() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 620.0).await;
        exchange.set_balance("TEST", 4.0).await;
        seed_ladder(&exchange).await;
        exchange
            .script_placements(vec![Some(GridError::Rejected("EOrder:Insufficient funds".into()))])
            .await;

        let mut state = StateManager::in_memory();
        state.set_expected("TEST/USD", SideCounts::new(4, 6));
        state.set_center("TEST/USD", 100.0);
        let mut engine = engine_with(
            test_pair(),
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            state,
            Arc::new(ManualClock::new(0)),
        );

        // The rejected level at 95 is not counted; the re-read shows five buys
        // and top-up adds the sixth beyond the new lowest buy
        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 2);
        assert_eq!(buy_prices(&exchange.placed_orders().await), vec![94.0, 93.0]);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(6, 4)));
    }

    #[tokio::test]
    async fn test_expected_above_max_is_clamped() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 390.0).await;
        exchange.set_balance("TEST", 4.0).await;
        seed_ladder(&exchange).await;

        let mut state = StateManager::in_memory();
        state.set_expected("TEST/USD", SideCounts::new(9, 4));
        state.set_center("TEST/USD", 100.0);
        let mut engine = engine_with(
            test_pair(),
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            state,
            Arc::new(ManualClock::new(0)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.filled_buys, 0);
        assert_eq!(report.placed, 0);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(4, 4)));
    }

    #[tokio::test]
    async fn test_unmatched_orders_block_seeding() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 1_000.0).await;
        exchange.set_balance("TEST", 10.0).await;
        exchange.seed_order("DOGEUSD", OrderSide::Buy, 100.0, 0.1).await;

        let mut engine = engine_with(
            test_pair(),
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
            Arc::new(ManualClock::new(0)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.placed, 0);
        assert!(!engine.state().has_expected("TEST/USD"));
    }

    #[tokio::test]
    async fn test_open_order_failure_aborts_tick() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_should_fail(true).await;

        let mut engine = engine_with(
            test_pair(),
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
            Arc::new(ManualClock::new(0)),
        );

        assert!(engine.tick().await.is_err());
        assert!(exchange.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_drift_repositions_grid() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 133.0).await;
        exchange.set_balance("USD", 1_000.0).await;
        exchange.set_balance("TEST", 10.0).await;
        seed_ladder(&exchange).await;

        let mut state = StateManager::in_memory();
        state.set_expected("TEST/USD", SideCounts::new(4, 4));
        state.set_center("TEST/USD", 100.0);

        let config = test_pair().with_order_limits(1, 3).with_reposition(5.0, 300);
        let mut engine = engine_with(
            config,
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            state,
            Arc::new(ManualClock::new(50_000)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.repositioned, vec!["TEST/USD".to_string()]);
        assert_eq!(report.placed, 6);

        let open = exchange.open_order_snapshot().await;
        assert_eq!(open.len(), 6);
        assert!(open
            .iter()
            .all(|o| (o.side == OrderSide::Buy && o.price < 133.0) || (o.side == OrderSide::Sell && o.price > 133.0)));
        assert_eq!(engine.state().center_price("TEST/USD"), Some(133.0));
        assert_eq!(engine.state().last_reposition("TEST/USD"), Some(50_000));
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(3, 3)));

        // Inside the band now: reconcile normally, no fills
        let report = engine.tick().await.unwrap();
        assert!(report.repositioned.is_empty());
        assert_eq!(report.placed, 0);
    }

    #[tokio::test]
    async fn test_rebuild_all_cancels_and_creates() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 220.0).await;
        exchange.set_balance("TEST", 2.2).await;
        exchange.seed_order("TESTUSD", OrderSide::Buy, 1.0, 90.0).await;

        let mut engine = engine_with(
            test_pair().with_order_limits(1, 3),
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
            Arc::new(ManualClock::new(0)),
        );

        let placed = engine.rebuild_all().await.unwrap();
        assert_eq!(placed, SideCounts::new(2, 2));
        assert_eq!(exchange.open_order_snapshot().await.len(), 4);
        assert_eq!(engine.state().expected("TEST/USD"), Some(SideCounts::new(2, 2)));
    }

    fn usd_pair(name: &str, exchange_pair: &str, base: &str) -> TradingPairConfig {
        TradingPairConfig::new(name, exchange_pair, base, "USD", 1.0)
            .with_min_order(1.0, MinOrderUnit::BaseVolume)
            .with_order_limits(1, 3)
    }

    fn multi_engine(
        pairs: Vec<TradingPairConfig>,
        exchange: Arc<MockExchange>,
        ledger: Arc<MemoryLedger>,
        state: StateManager,
    ) -> ReconciliationEngine {
        ReconciliationEngine::new(
            pairs,
            exchange,
            ledger,
            state,
            Arc::new(ManualClock::new(0)),
            ShutdownSignal::never(),
            options(),
        )
    }

    fn buy_notional(orders: &[crate::grid::types::OrderRequest]) -> f64 {
        orders
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.volume * o.price)
            .sum()
    }

    #[tokio::test]
    async fn test_pairs_sharing_quote_never_overspend() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XAAAZUSD", 100.0).await;
        exchange.set_price("XBBBZUSD", 100.0).await;
        exchange.set_balance("USD", 220.0).await;
        exchange.set_balance("AAA", 10.0).await;
        exchange.set_balance("BBB", 10.0).await;

        let mut engine = multi_engine(
            vec![
                usd_pair("AAA/USD", "XAAAZUSD", "AAA"),
                usd_pair("BBB/USD", "XBBBZUSD", "BBB"),
            ],
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 8);

        // AAA's buys lock most of the USD, BBB cannot afford another buy
        let placed = exchange.placed_orders().await;
        assert!(buy_notional(&placed) <= 220.0);
        assert!(placed
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .all(|o| o.pair == "XAAAZUSD"));
        assert_eq!(engine.state().expected("AAA/USD"), Some(SideCounts::new(2, 3)));
        assert_eq!(engine.state().expected("BBB/USD"), Some(SideCounts::new(0, 3)));

        // Nothing changed on the exchange, nothing to do
        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 0);
    }

    #[tokio::test]
    async fn test_repositioned_grid_locks_funds_for_later_pairs() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XAAAZUSD", 133.0).await;
        exchange.set_price("XBBBZUSD", 100.0).await;
        exchange.set_balance("USD", 330.0).await;
        exchange.set_balance("AAA", 10.0).await;
        exchange.set_balance("BBB", 10.0).await;

        let mut state = StateManager::in_memory();
        state.set_expected("AAA/USD", SideCounts::default());
        state.set_center("AAA/USD", 100.0);
        state.set_expected("BBB/USD", SideCounts::default());

        let mut engine = multi_engine(
            vec![
                usd_pair("AAA/USD", "XAAAZUSD", "AAA").with_reposition(5.0, 300),
                usd_pair("BBB/USD", "XBBBZUSD", "BBB"),
            ],
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            state,
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.repositioned, vec!["AAA/USD".to_string()]);

        let placed = exchange.placed_orders().await;
        assert!(buy_notional(&placed) <= 330.0);
        assert!(!placed
            .iter()
            .any(|o| o.side == OrderSide::Buy && o.pair == "XBBBZUSD"));
        assert_eq!(engine.state().expected("AAA/USD"), Some(SideCounts::new(2, 3)));
    }

    #[tokio::test]
    async fn test_cross_quoted_pair_shares_base_with_direct_pair() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_price("XALTXTEST", 0.05).await;
        exchange.set_balance("USD", 0.0).await;
        exchange.set_balance("TEST", 1.0).await;
        exchange.set_balance("ALT", 5.0).await;

        let direct = TradingPairConfig::new("TEST/USD", "XTESTZUSD", "TEST", "USD", 1.0)
            .with_min_order(0.1, MinOrderUnit::BaseVolume)
            .with_order_limits(1, 3);
        // ALT quoted in TEST, $10 minimum valued through TEST/USD
        let cross = TradingPairConfig::new("ALT/TEST", "XALTXTEST", "ALT", "TEST", 2.0)
            .with_precision(6, 2)
            .with_min_order(10.0, MinOrderUnit::ReferenceValue)
            .with_order_limits(1, 3)
            .with_quote_convention(QuoteConvention::CrossQuoted {
                auxiliary_pair: "XTESTZUSD".into(),
                fallback_pair: None,
                fallback_multiplier: 18.0,
                fallback_rate: 90_000.0,
            });

        let mut engine = multi_engine(
            vec![direct, cross],
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
        );

        let report = engine.tick().await.unwrap();
        assert!(report.degraded_rates.is_empty());

        let placed = exchange.placed_orders().await;
        let test_sells: Vec<_> = placed.iter().filter(|o| o.pair == "XTESTZUSD").collect();
        assert_eq!(test_sells.len(), 3);
        assert!(test_sells.iter().all(|o| o.side == OrderSide::Sell));

        // TEST is locked by the direct pair's sells, so no ALT buys
        let alt: Vec<_> = placed.iter().filter(|o| o.pair == "XALTXTEST").collect();
        assert_eq!(alt.len(), 2);
        assert!(alt.iter().all(|o| o.side == OrderSide::Sell));
        assert!(alt.iter().all(|o| o.volume * o.price * 100.0 >= 10.0));
        assert_eq!(engine.state().expected("ALT/TEST"), Some(SideCounts::new(0, 2)));
    }

    #[tokio::test]
    async fn test_degraded_reference_rate_is_reported() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XETHZUSD", 5_000.0).await;
        exchange.set_price("XALTXXBT", 0.0001).await;
        exchange.set_balance("XXBT", 0.0).await;
        exchange.set_balance("ALT", 0.0).await;

        let cross = TradingPairConfig::new("ALT/BTC", "XALTXXBT", "ALT", "XXBT", 2.0)
            .with_precision(8, 2)
            .with_min_order(10.0, MinOrderUnit::ReferenceValue)
            .with_order_limits(0, 3)
            .with_quote_convention(QuoteConvention::CrossQuoted {
                auxiliary_pair: "XXBTZUSD".into(),
                fallback_pair: Some("XETHZUSD".into()),
                fallback_multiplier: 18.0,
                fallback_rate: 90_000.0,
            });

        let mut engine = multi_engine(
            vec![cross],
            exchange.clone(),
            Arc::new(MemoryLedger::new()),
            StateManager::in_memory(),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.degraded_rates, vec!["ALT/BTC".to_string()]);
        assert_eq!(report.placed, 0);
    }

    #[tokio::test]
    async fn test_fill_of_topped_up_order_is_recorded() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XTESTZUSD", 100.0).await;
        exchange.set_balance("USD", 220.0).await;
        exchange.set_balance("TEST", 2.2).await;
        exchange.set_echo_pair("XTESTZUSD", "TESTUSD").await;

        let ledger = Arc::new(MemoryLedger::new());
        let mut engine = engine_with(
            test_pair().with_order_limits(1, 3),
            exchange.clone(),
            ledger.clone(),
            StateManager::in_memory(),
            Arc::new(ManualClock::new(0)),
        );

        let report = engine.tick().await.unwrap();
        assert_eq!(report.placed, 4);
        exchange.clear_placed().await;

        let sell = exchange
            .open_order_snapshot()
            .await
            .into_iter()
            .find(|o| o.side == OrderSide::Sell && o.price == 101.0)
            .unwrap();
        exchange.fill_order(&sell.id).await.unwrap();
        exchange.set_balance("USD", 325.0).await;
        exchange.set_balance("TEST", 1.155).await;

        let report = engine.tick().await.unwrap();
        assert_eq!(report.filled_sells, 1);
        assert_eq!(buy_prices(&exchange.placed_orders().await), vec![97.0]);

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.executions, 1);
        assert_eq!(summary.pairs["TEST/USD"].sells, 1);
        assert!((summary.total_volume - sell.volume * 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_ladder_anchor() {
        assert_eq!(ladder_anchor(OrderSide::Buy, Some(96.0), 100.0), 96.0);
        assert_eq!(ladder_anchor(OrderSide::Buy, Some(101.0), 100.0), 100.0);
        assert_eq!(ladder_anchor(OrderSide::Buy, None, 100.0), 100.0);
        assert_eq!(ladder_anchor(OrderSide::Sell, Some(104.0), 100.0), 104.0);
        assert_eq!(ladder_anchor(OrderSide::Sell, Some(99.0), 100.0), 100.0);
    }
}
