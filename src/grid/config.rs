//! Per-pair grid trading configuration

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// How a pair's quote currency relates to the reference currency (USD)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuoteConvention {
    /// Quote asset is the reference currency (e.g. ETH/USD)
    Direct,
    /// Quote asset must be converted through an auxiliary price (e.g. XRP/BTC via BTC/USD)
    CrossQuoted {
        /// Exchange pair whose last price converts the quote asset to the reference currency
        auxiliary_pair: String,
        /// Degraded estimate: price of this pair times `fallback_multiplier`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_pair: Option<String>,
        #[serde(default = "default_fallback_multiplier")]
        fallback_multiplier: f64,
        /// Last resort when neither price is known
        #[serde(default = "default_fallback_rate")]
        fallback_rate: f64,
    },
}

fn default_fallback_multiplier() -> f64 {
    18.0
}

fn default_fallback_rate() -> f64 {
    90_000.0
}

/// Unit of `min_order_size`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinOrderUnit {
    /// Minimum is a volume of the base asset (e.g. 0.005 ETH)
    BaseVolume,
    /// Minimum is a value in the reference currency (e.g. $10)
    ReferenceValue,
}

/// Trading pair configuration, immutable for the process lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPairConfig {
    /// Logical pair name (e.g. "ETH/USD")
    pub name: String,

    /// Exchange-native pair identifier used when placing orders (e.g. "XETHZUSD")
    pub exchange_pair: String,

    /// Other encodings the exchange may echo back for this pair (e.g. "ETHUSD")
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Traded asset, sold by sell orders (e.g. "XETH")
    pub base_asset: String,

    /// Asset spent by buy orders (e.g. "ZUSD")
    pub quote_asset: String,

    /// Distance between grid levels in percent of the center price
    pub grid_interval: f64,

    /// Decimal places for prices
    pub price_precision: u32,

    /// Decimal places for volumes
    pub volume_precision: u32,

    pub min_order_size: f64,

    #[serde(default = "default_min_order_unit")]
    pub min_order_unit: MinOrderUnit,

    pub min_orders_per_side: u32,

    pub max_orders_per_side: u32,

    #[serde(default = "default_quote_convention")]
    pub quote_convention: QuoteConvention,

    /// Cancel and rebuild the grid when price leaves the band
    #[serde(default)]
    pub dynamic_reposition: bool,

    /// Extra drift beyond the grid span, in percent, before repositioning
    #[serde(default = "default_reposition_threshold")]
    pub reposition_threshold: f64,

    /// Minimum seconds between repositions
    #[serde(default = "default_reposition_cooldown")]
    pub reposition_cooldown_secs: u64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_min_order_unit() -> MinOrderUnit {
    MinOrderUnit::BaseVolume
}

fn default_quote_convention() -> QuoteConvention {
    QuoteConvention::Direct
}

fn default_reposition_threshold() -> f64 {
    5.0
}

fn default_reposition_cooldown() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

impl TradingPairConfig {
    /// Create a directly quoted pair with default limits
    ///
    /// # Arguments
    /// * `name` - Logical pair name (e.g. "ETH/USD")
    /// * `exchange_pair` - Exchange-native identifier (e.g. "XETHZUSD")
    /// * `base_asset` - Asset sold by sell orders
    /// * `quote_asset` - Asset spent by buy orders
    /// * `grid_interval` - Level spacing in percent
    pub fn new(
        name: impl Into<String>,
        exchange_pair: impl Into<String>,
        base_asset: impl Into<String>,
        quote_asset: impl Into<String>,
        grid_interval: f64,
    ) -> Self {
        Self {
            name: name.into(),
            exchange_pair: exchange_pair.into(),
            aliases: Vec::new(),
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
            grid_interval,
            price_precision: 2,
            volume_precision: 6,
            min_order_size: 0.0,
            min_order_unit: default_min_order_unit(),
            min_orders_per_side: 3,
            max_orders_per_side: 10,
            quote_convention: default_quote_convention(),
            dynamic_reposition: false,
            reposition_threshold: default_reposition_threshold(),
            reposition_cooldown_secs: default_reposition_cooldown(),
            enabled: default_enabled(),
        }
    }

    /// Builder: set price and volume precision
    pub fn with_precision(mut self, price_precision: u32, volume_precision: u32) -> Self {
        self.price_precision = price_precision;
        self.volume_precision = volume_precision;
        self
    }

    /// Builder: set the minimum order size and its unit
    pub fn with_min_order(mut self, size: f64, unit: MinOrderUnit) -> Self {
        self.min_order_size = size;
        self.min_order_unit = unit;
        self
    }

    /// Builder: set min/max orders per side
    pub fn with_order_limits(mut self, min_per_side: u32, max_per_side: u32) -> Self {
        self.min_orders_per_side = min_per_side;
        self.max_orders_per_side = max_per_side;
        self
    }

    /// Builder: set the quote convention
    pub fn with_quote_convention(mut self, convention: QuoteConvention) -> Self {
        self.quote_convention = convention;
        self
    }

    /// Builder: enable dynamic repositioning
    pub fn with_reposition(mut self, threshold: f64, cooldown_secs: u64) -> Self {
        self.dynamic_reposition = true;
        self.reposition_threshold = threshold;
        self.reposition_cooldown_secs = cooldown_secs;
        self
    }

    /// Builder: add exchange echo aliases
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// How far one side of the grid reaches from its center, in percent
    pub fn side_span_percent(&self) -> f64 {
        self.grid_interval * self.max_orders_per_side as f64
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.name.trim().is_empty() {
            return Err(GridError::InvalidConfig("pair name cannot be empty".into()));
        }

        if self.exchange_pair.trim().is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "{}: exchange_pair cannot be empty",
                self.name
            )));
        }

        if self.base_asset.trim().is_empty() || self.quote_asset.trim().is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "{}: base_asset and quote_asset are required",
                self.name
            )));
        }

        if !(self.grid_interval > 0.0 && self.grid_interval < 100.0) {
            return Err(GridError::InvalidConfig(format!(
                "{}: grid_interval must be between 0 and 100 percent",
                self.name
            )));
        }

        if self.min_order_size < 0.0 || !self.min_order_size.is_finite() {
            return Err(GridError::InvalidConfig(format!(
                "{}: min_order_size must be a non-negative number",
                self.name
            )));
        }

        if self.max_orders_per_side == 0 {
            return Err(GridError::InvalidConfig(format!(
                "{}: max_orders_per_side must be at least 1",
                self.name
            )));
        }

        if self.min_orders_per_side > self.max_orders_per_side {
            return Err(GridError::InvalidConfig(format!(
                "{}: min_orders_per_side ({}) exceeds max_orders_per_side ({})",
                self.name, self.min_orders_per_side, self.max_orders_per_side
            )));
        }

        // Lowest buy level must stay above zero
        if self.side_span_percent() >= 100.0 {
            return Err(GridError::InvalidConfig(format!(
                "{}: grid_interval x max_orders_per_side must stay below 100%",
                self.name
            )));
        }

        if self.reposition_threshold < 0.0 {
            return Err(GridError::InvalidConfig(format!(
                "{}: reposition_threshold cannot be negative",
                self.name
            )));
        }

        if let QuoteConvention::CrossQuoted {
            auxiliary_pair,
            fallback_multiplier,
            fallback_rate,
            ..
        } = &self.quote_convention
        {
            if auxiliary_pair.trim().is_empty() {
                return Err(GridError::InvalidConfig(format!(
                    "{}: cross-quoted pairs need an auxiliary_pair",
                    self.name
                )));
            }
            if *fallback_multiplier <= 0.0 || *fallback_rate <= 0.0 {
                return Err(GridError::InvalidConfig(format!(
                    "{}: reference price fallbacks must be positive",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_usd() -> TradingPairConfig {
        TradingPairConfig::new("ETH/USD", "XETHZUSD", "XETH", "ZUSD", 1.5)
            .with_precision(2, 6)
            .with_min_order(0.005, MinOrderUnit::BaseVolume)
            .with_order_limits(3, 18)
            .with_reposition(5.0, 300)
    }

    #[test]
    fn test_config_validation() {
        assert!(eth_usd().validate().is_ok());

        let inverted = eth_usd().with_order_limits(5, 2);
        assert!(inverted.validate().is_err());

        let mut no_interval = eth_usd();
        no_interval.grid_interval = 0.0;
        assert!(no_interval.validate().is_err());

        let too_wide = eth_usd().with_order_limits(1, 70);
        assert!(too_wide.validate().is_err());
    }

    #[test]
    fn test_cross_quoted_requires_auxiliary_pair() {
        let config = TradingPairConfig::new("XRP/BTC", "XXRPXXBT", "XXRP", "XXBT", 2.5)
            .with_quote_convention(QuoteConvention::CrossQuoted {
                auxiliary_pair: String::new(),
                fallback_pair: None,
                fallback_multiplier: 18.0,
                fallback_rate: 90_000.0,
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_side_span() {
        assert!((eth_usd().side_span_percent() - 27.0).abs() < 1e-9);
    }

    #[test]
    fn test_deserialize_cross_quoted_pair() {
        let json = r#"{
            "name": "XRP/BTC",
            "exchange_pair": "XXRPXXBT",
            "aliases": ["XRPXBT"],
            "base_asset": "XXRP",
            "quote_asset": "XXBT",
            "grid_interval": 2.5,
            "price_precision": 8,
            "volume_precision": 2,
            "min_order_size": 10.0,
            "min_order_unit": "reference_value",
            "min_orders_per_side": 4,
            "max_orders_per_side": 20,
            "quote_convention": {
                "kind": "cross_quoted",
                "auxiliary_pair": "XXBTZUSD",
                "fallback_pair": "XETHZUSD"
            }
        }"#;

        let config: TradingPairConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.enabled);
        assert!(!config.dynamic_reposition);
        assert_eq!(config.min_order_unit, MinOrderUnit::ReferenceValue);
        match config.quote_convention {
            QuoteConvention::CrossQuoted {
                auxiliary_pair,
                fallback_multiplier,
                fallback_rate,
                ..
            } => {
                assert_eq!(auxiliary_pair, "XXBTZUSD");
                assert_eq!(fallback_multiplier, 18.0);
                assert_eq!(fallback_rate, 90_000.0);
            }
            QuoteConvention::Direct => panic!("expected cross-quoted pair"),
        }
    }
}
