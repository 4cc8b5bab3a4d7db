//! Grid bot runner - main execution loop

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::{interval, MissedTickBehavior};

use super::engine::ReconciliationEngine;
use super::errors::GridResult;
use super::ledger::LedgerSink;
use super::shutdown::ShutdownSignal;

/// Grid bot runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub pnl_report_interval: Duration,
    /// Cancel every open order and rebuild all grids before the first tick
    pub cancel_all_on_startup: bool,
    /// Consecutive failed ticks before escalating to error level
    pub max_consecutive_errors: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            pnl_report_interval: Duration::from_secs(300),
            cancel_all_on_startup: false,
            max_consecutive_errors: 5,
        }
    }
}

/// Drives the reconciliation engine until shutdown
pub struct GridRunner {
    engine: ReconciliationEngine,
    ledger: Arc<dyn LedgerSink>,
    config: RunnerConfig,
    shutdown: ShutdownSignal,
}

impl GridRunner {
    pub fn new(
        engine: ReconciliationEngine,
        ledger: Arc<dyn LedgerSink>,
        config: RunnerConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            engine,
            ledger,
            config,
            shutdown,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub async fn run(&mut self) -> GridResult<()> {
        info!(
            "Starting grid bot for {} pair(s), polling every {}s",
            self.engine.pairs().len(),
            self.config.poll_interval.as_secs_f64()
        );
        for pair in self.engine.pairs() {
            info!(
                "  {} ({}): interval {}%, {}-{} orders per side{}",
                pair.name,
                pair.exchange_pair,
                pair.grid_interval,
                pair.min_orders_per_side,
                pair.max_orders_per_side,
                if pair.dynamic_reposition { ", dynamic reposition" } else { "" }
            );
        }

        if self.config.cancel_all_on_startup && !self.shutdown.is_triggered() {
            match self.engine.rebuild_all().await {
                Ok(placed) => info!("Startup rebuild placed {}", placed),
                Err(e) => error!("Startup rebuild failed, continuing with reconciliation: {}", e),
            }
        }

        let mut shutdown = self.shutdown.clone();
        let mut poll_timer = interval(self.config.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pnl_timer = interval(self.config.pnl_report_interval);
        pnl_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        pnl_timer.tick().await;

        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = poll_timer.tick() => {
                    match self.engine.tick().await {
                        Ok(report) => {
                            consecutive_errors = 0;
                            debug!("Tick report: {:?}", report);
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= self.config.max_consecutive_errors {
                                error!("Tick failed ({} in a row): {}", consecutive_errors, e);
                            } else {
                                warn!("Tick failed: {}", e);
                            }
                        }
                    }
                }
                _ = pnl_timer.tick() => self.report_pnl(),
            }
        }

        if let Err(e) = self.engine.save_state() {
            warn!("Failed to save state on exit: {}", e);
        }
        self.report_pnl();
        info!("Grid bot stopped");
        Ok(())
    }

    fn report_pnl(&self) {
        match self.ledger.summary() {
            Ok(summary) => summary.log_report(),
            Err(e) => warn!("PnL summary unavailable: {}", e),
        }
    }
}
