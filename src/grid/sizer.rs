//! Order sizing: precision rounding, minimum-size validation and
//! balance-to-volume conversion.
//!
//! Minimum sizes are enforced in a common comparison unit, the reference
//! currency (USD). Cross-quoted pairs convert their quote currency through a
//! reference rate resolved from the price book.

use log::{debug, warn};

use super::config::{MinOrderUnit, QuoteConvention, TradingPairConfig};
use super::errors::{GridError, GridResult};
use super::types::{OrderSide, PriceBook};

/// Share of the available balance committed to new orders
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.95;

const EPSILON: f64 = 1e-9;

/// Where a reference rate came from
#[derive(Debug, Clone, PartialEq)]
pub enum RateSource {
    /// Pair is quoted in the reference currency
    Direct,
    /// Last price of the auxiliary pair
    Auxiliary,
    /// Degraded estimate from another pair's price times a multiplier
    Derived { from_pair: String },
    /// Hardcoded last-resort constant
    Constant,
}

/// Price of one unit of a pair's quote asset in the reference currency
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRate {
    pub value: f64,
    pub source: RateSource,
}

impl ReferenceRate {
    pub fn direct() -> Self {
        Self {
            value: 1.0,
            source: RateSource::Direct,
        }
    }

    /// True when the rate is an estimate rather than a market price
    pub fn is_degraded(&self) -> bool {
        matches!(self.source, RateSource::Derived { .. } | RateSource::Constant)
    }
}

/// Result of a minimum-size check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeCheck {
    pub passed: bool,
    /// Order value in the reference currency
    pub value: f64,
    /// Minimum value in the reference currency
    pub minimum: f64,
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Sizes orders for one pair given its configuration and balances
#[derive(Debug, Clone, Copy)]
pub struct OrderSizer {
    safety_margin: f64,
}

impl Default for OrderSizer {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_MARGIN)
    }
}

impl OrderSizer {
    pub fn new(safety_margin: f64) -> Self {
        Self { safety_margin }
    }

    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    /// Resolve the quote-to-reference rate for a pair
    ///
    /// Cross-quoted pairs try the auxiliary pair first, then the degraded
    /// multiple of a fallback pair, then the configured constant.
    pub fn reference_rate(&self, config: &TradingPairConfig, prices: &PriceBook) -> ReferenceRate {
        match &config.quote_convention {
            QuoteConvention::Direct => ReferenceRate::direct(),
            QuoteConvention::CrossQuoted {
                auxiliary_pair,
                fallback_pair,
                fallback_multiplier,
                fallback_rate,
            } => {
                if let Some(price) = prices.get(auxiliary_pair) {
                    debug!("{}: reference rate {:.2} from {}", config.name, price, auxiliary_pair);
                    return ReferenceRate {
                        value: price,
                        source: RateSource::Auxiliary,
                    };
                }

                if let Some(pair) = fallback_pair {
                    if let Some(price) = prices.get(pair) {
                        let value = price * fallback_multiplier;
                        warn!(
                            "{}: {} price unavailable, DEGRADED estimate {:.2} = {} x {} (review before trusting)",
                            config.name, auxiliary_pair, value, pair, fallback_multiplier
                        );
                        return ReferenceRate {
                            value,
                            source: RateSource::Derived {
                                from_pair: pair.clone(),
                            },
                        };
                    }
                }

                warn!(
                    "{}: {} price unavailable, using fallback constant {:.2}",
                    config.name, auxiliary_pair, fallback_rate
                );
                ReferenceRate {
                    value: *fallback_rate,
                    source: RateSource::Constant,
                }
            }
        }
    }

    /// Order value in the reference currency
    pub fn comparison_value(&self, volume: f64, price: f64, rate: &ReferenceRate) -> f64 {
        volume * price * rate.value
    }

    /// Configured minimum expressed in the reference currency at `price`
    pub fn minimum_value(&self, config: &TradingPairConfig, price: f64, rate: &ReferenceRate) -> f64 {
        match config.min_order_unit {
            MinOrderUnit::BaseVolume => config.min_order_size * price * rate.value,
            MinOrderUnit::ReferenceValue => config.min_order_size,
        }
    }

    /// Check an order against the pair's minimum size
    pub fn validate(
        &self,
        config: &TradingPairConfig,
        volume: f64,
        price: f64,
        rate: &ReferenceRate,
    ) -> SizeCheck {
        let value = self.comparison_value(volume, price, rate);
        let minimum = self.minimum_value(config, price, rate);
        let passed = volume > 0.0 && price > 0.0 && value + EPSILON >= minimum;

        if !passed {
            debug!(
                "{}: order {} @ {} worth {:.4} is below minimum {:.4}",
                config.name, volume, price, value, minimum
            );
        }

        SizeCheck { passed, value, minimum }
    }

    /// Minimum amount of the spent currency one order needs
    ///
    /// Buys spend the quote asset, sells spend the base asset.
    pub fn per_order_minimum(
        &self,
        side: OrderSide,
        config: &TradingPairConfig,
        price: f64,
        rate: &ReferenceRate,
    ) -> f64 {
        match (side, config.min_order_unit) {
            (OrderSide::Buy, MinOrderUnit::BaseVolume) => config.min_order_size * price,
            (OrderSide::Buy, MinOrderUnit::ReferenceValue) => config.min_order_size / rate.value,
            (OrderSide::Sell, MinOrderUnit::BaseVolume) => config.min_order_size,
            (OrderSide::Sell, MinOrderUnit::ReferenceValue) => {
                config.min_order_size / (price * rate.value)
            }
        }
    }

    /// How many orders the available balance can fund, capped at `max_orders_per_side`
    pub fn affordable_orders(
        &self,
        side: OrderSide,
        config: &TradingPairConfig,
        price: f64,
        available: f64,
        rate: &ReferenceRate,
    ) -> u32 {
        let spendable = available * self.safety_margin;
        if spendable <= 0.0 || price <= 0.0 {
            return 0;
        }

        let per_order = self.per_order_minimum(side, config, price, rate);
        if per_order <= 0.0 || !per_order.is_finite() {
            return config.max_orders_per_side;
        }

        let affordable = (spendable / per_order + EPSILON).floor();
        if affordable >= config.max_orders_per_side as f64 {
            config.max_orders_per_side
        } else {
            affordable.max(0.0) as u32
        }
    }

    /// Volume for each of `orders_count` orders funded from `available`
    ///
    /// Returns `Infeasible` if one order's share falls below the minimum.
    pub fn compute_volume(
        &self,
        side: OrderSide,
        config: &TradingPairConfig,
        current_price: f64,
        orders_count: u32,
        available: f64,
        rate: &ReferenceRate,
    ) -> GridResult<f64> {
        if current_price <= 0.0 || !current_price.is_finite() {
            return Err(GridError::PriceUnavailable(format!(
                "{}: invalid price {}",
                config.name, current_price
            )));
        }

        if orders_count == 0 {
            return Err(GridError::Infeasible(format!(
                "{}: no {} orders requested",
                config.name, side
            )));
        }

        let spendable = available * self.safety_margin;
        let share = spendable / orders_count as f64;
        let minimum = self.per_order_minimum(side, config, current_price, rate);

        if share <= 0.0 || share + EPSILON < minimum {
            return Err(GridError::Infeasible(format!(
                "{}: {} share {:.8} per order (of {} orders, {:.8} spendable) is below minimum {:.8}",
                config.name, side, share, orders_count, spendable, minimum
            )));
        }

        let volume = match side {
            OrderSide::Buy => share / current_price,
            OrderSide::Sell => share,
        };

        debug!(
            "{}: {} volume {:.8} for {} orders ({:.8} spendable)",
            config.name, side, volume, orders_count, spendable
        );

        Ok(volume)
    }

    pub fn round_price(&self, config: &TradingPairConfig, price: f64) -> f64 {
        round_to(price, config.price_precision)
    }

    pub fn round_volume(&self, config: &TradingPairConfig, volume: f64) -> f64 {
        round_to(volume, config.volume_precision)
    }
}
