//! Grid construction
//!
//! A grid is two ladders of limit orders spaced `grid_interval` percent apart
//! around a center price. The same ladder routine places replacement and
//! top-up orders beyond the current outermost order of a side.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::config::TradingPairConfig;
use super::errors::{GridError, GridResult};
use super::executor::ExchangeClient;
use super::ledger::LedgerSink;
use super::shutdown::ShutdownSignal;
use super::sizer::{OrderSizer, ReferenceRate};
use super::state::StateManager;
use super::types::{BalanceSnapshot, OrderRequest, OrderSide, SideCounts};

/// Inter-order delay while building a grid
pub const DEFAULT_ORDER_DELAY: Duration = Duration::from_millis(100);

/// One side's run of equally spaced orders
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ladder {
    pub side: OrderSide,
    /// Price the first level is one step away from
    pub anchor: f64,
    /// Distance between levels in quote currency
    pub step: f64,
    pub count: u32,
    /// Unrounded volume shared by every level
    pub volume: f64,
}

impl Ladder {
    /// Price of level `k` (1-based): below the anchor for buys, above for sells
    pub fn price_at(&self, k: u32) -> f64 {
        match self.side {
            OrderSide::Buy => self.anchor - k as f64 * self.step,
            OrderSide::Sell => self.anchor + k as f64 * self.step,
        }
    }
}

/// Places grids and ladders through the exchange client
pub struct GridPlanner {
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<dyn LedgerSink>,
    sizer: OrderSizer,
    order_delay: Duration,
    shutdown: ShutdownSignal,
}

impl GridPlanner {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: Arc<dyn LedgerSink>,
        sizer: OrderSizer,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            exchange,
            ledger,
            sizer,
            order_delay: DEFAULT_ORDER_DELAY,
            shutdown,
        }
    }

    pub fn with_order_delay(mut self, delay: Duration) -> Self {
        self.order_delay = delay;
        self
    }

    pub fn sizer(&self) -> &OrderSizer {
        &self.sizer
    }

    pub fn order_delay(&self) -> Duration {
        self.order_delay
    }

    /// Build a full grid around `current_price`
    ///
    /// Records the new center and sets expected counts to what was actually
    /// placed. Returns the placed counts.
    pub async fn create_grid(
        &self,
        config: &TradingPairConfig,
        state: &mut StateManager,
        current_price: f64,
        balances: &BalanceSnapshot,
        rate: &ReferenceRate,
    ) -> GridResult<SideCounts> {
        if current_price <= 0.0 || !current_price.is_finite() {
            return Err(GridError::PriceUnavailable(format!(
                "{}: cannot build a grid at price {}",
                config.name, current_price
            )));
        }

        let step = current_price * config.grid_interval / 100.0;
        let mut placed = SideCounts::default();

        info!(
            "{}: creating grid at {} (interval {}%, up to {} orders per side)",
            config.name, current_price, config.grid_interval, config.max_orders_per_side
        );

        for side in [OrderSide::Buy, OrderSide::Sell] {
            let available = self.available_for(side, config, balances);
            let count = self
                .sizer
                .affordable_orders(side, config, current_price, available, rate);

            if count == 0 {
                warn!(
                    "{}: insufficient {} balance for any {} order ({:.8} available)",
                    config.name,
                    spent_asset(side, config),
                    side,
                    available
                );
                continue;
            }

            let volume = match self
                .sizer
                .compute_volume(side, config, current_price, count, available, rate)
            {
                Ok(volume) => volume,
                Err(e) => {
                    warn!("{}: skipping {} side: {}", config.name, side, e);
                    continue;
                }
            };

            let ladder = Ladder {
                side,
                anchor: current_price,
                step,
                count,
                volume,
            };
            *placed.get_mut(side) = self.extend(config, &ladder, rate, self.order_delay).await;
        }

        state.set_center(&config.name, current_price);
        state.set_expected(&config.name, placed);

        info!("{}: grid created with {}", config.name, placed);
        Ok(placed)
    }

    /// Place the levels of a ladder, returning how many were accepted
    ///
    /// Each level is rounded and size-checked before submission; levels that
    /// fail the check or are rejected are skipped. Stops early on shutdown.
    pub async fn extend(
        &self,
        config: &TradingPairConfig,
        ladder: &Ladder,
        rate: &ReferenceRate,
        delay: Duration,
    ) -> u32 {
        let mut placed = 0;

        for k in 1..=ladder.count {
            if self.shutdown.is_triggered() {
                info!("{}: shutdown requested, stopping {} placement", config.name, ladder.side);
                break;
            }

            let price = self.sizer.round_price(config, ladder.price_at(k));
            if price <= 0.0 {
                warn!("{}: {} level {} would be priced at {}, stopping", config.name, ladder.side, k, price);
                break;
            }
            let volume = self.sizer.round_volume(config, ladder.volume);

            let check = self.sizer.validate(config, volume, price, rate);
            if !check.passed {
                warn!(
                    "{}: {} {} @ {} worth ${:.2} is below minimum ${:.2}, skipped",
                    config.name, ladder.side, volume, price, check.value, check.minimum
                );
                continue;
            }

            if k > 1 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let request = OrderRequest {
                pair: config.exchange_pair.clone(),
                side: ladder.side,
                volume,
                price,
                price_decimals: config.price_precision,
                volume_decimals: config.volume_precision,
            };

            match self.exchange.place_order(&request).await {
                Ok(order_id) => {
                    placed += 1;
                    info!(
                        "{}: placed {} {} @ {} (${:.2}) -> {}",
                        config.name,
                        ladder.side,
                        request.volume_str(),
                        request.price_str(),
                        check.value,
                        order_id
                    );
                    if let Err(e) = self
                        .ledger
                        .record_order_placed(&order_id, &config.name, ladder.side, volume, price)
                    {
                        warn!("{}: failed to record order {}: {}", config.name, order_id, e);
                    }
                }
                Err(e) => warn!(
                    "{}: {} {} @ {} failed: {}",
                    config.name, ladder.side, request.volume_str(), request.price_str(), e
                ),
            }
        }

        debug!("{}: placed {}/{} {} orders", config.name, placed, ladder.count, ladder.side);
        placed
    }

    /// Balance a side spends: quote for buys, base for sells
    pub fn available_for(&self, side: OrderSide, config: &TradingPairConfig, balances: &BalanceSnapshot) -> f64 {
        balances.available(spent_asset(side, config))
    }
}

fn spent_asset(side: OrderSide, config: &TradingPairConfig) -> &str {
    match side {
        OrderSide::Buy => &config.quote_asset,
        OrderSide::Sell => &config.base_asset,
    }
}
