//! Dynamic grid repositioning
//!
//! When the price drifts far enough from a grid's center that the grid no
//! longer brackets it, the whole grid is cancelled and rebuilt around the
//! current price.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use super::clock::Clock;
use super::config::TradingPairConfig;
use super::state::PairState;

/// Per-pair reposition phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepositionPhase {
    #[default]
    Stable,
    Repositioning,
}

/// Decides when a pair's grid must be rebuilt and tracks the transition
pub struct RepositionController {
    clock: Arc<dyn Clock>,
    phases: HashMap<String, RepositionPhase>,
}

impl RepositionController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            phases: HashMap::new(),
        }
    }

    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    pub fn phase(&self, pair: &str) -> RepositionPhase {
        self.phases.get(pair).copied().unwrap_or_default()
    }

    /// Percent distance of `price` from the grid center
    pub fn deviation_percent(center: f64, price: f64) -> f64 {
        (price - center).abs() / center * 100.0
    }

    /// Whether the pair's grid should be rebuilt at `current_price`
    pub fn should_reposition(
        &self,
        config: &TradingPairConfig,
        state: Option<&PairState>,
        current_price: f64,
    ) -> bool {
        if !config.dynamic_reposition || current_price <= 0.0 {
            return false;
        }

        let Some(center) = state.and_then(|s| s.center_price).filter(|c| *c > 0.0) else {
            return false;
        };

        if let Some(last) = state.and_then(|s| s.last_reposition) {
            let elapsed = self.clock.now_secs().saturating_sub(last);
            if elapsed < config.reposition_cooldown_secs {
                debug!(
                    "{}: reposition cooldown, {}s of {}s elapsed",
                    config.name, elapsed, config.reposition_cooldown_secs
                );
                return false;
            }
        }

        let deviation = Self::deviation_percent(center, current_price);
        let limit = config.side_span_percent() + config.reposition_threshold;
        if deviation > limit {
            info!(
                "{}: price {} is {:.2}% from center {} (limit {:.2}%), repositioning",
                config.name, current_price, deviation, center, limit
            );
            true
        } else {
            false
        }
    }

    /// Enter `Repositioning` for a pair
    pub fn begin(&mut self, pair: &str) {
        self.phases.insert(pair.to_string(), RepositionPhase::Repositioning);
    }

    /// Return a pair to `Stable`, successful or not
    pub fn finish(&mut self, pair: &str) {
        self.phases.insert(pair.to_string(), RepositionPhase::Stable);
    }
}
