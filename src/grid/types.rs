//! Core data types for grid trading

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// Parse an exchange side string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "b" | "buy" => Some(OrderSide::Buy),
            "s" | "a" | "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Exchange order ID
    pub id: String,
    /// Exchange-native pair identifier, in whatever encoding the exchange echoes
    pub pair: String,
    pub side: OrderSide,
    /// Remaining (unfilled) volume
    pub volume: f64,
    /// Limit price
    pub price: f64,
}

/// Request to place a limit order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Exchange-native pair identifier
    pub pair: String,
    pub side: OrderSide,
    pub volume: f64,
    pub price: f64,
    /// Decimal places used when formatting the price
    pub price_decimals: u32,
    /// Decimal places used when formatting the volume
    pub volume_decimals: u32,
}

impl OrderRequest {
    /// Price formatted with the configured precision
    pub fn price_str(&self) -> String {
        format!("{:.*}", self.price_decimals as usize, self.price)
    }

    /// Volume formatted with the configured precision
    pub fn volume_str(&self) -> String {
        format!("{:.*}", self.volume_decimals as usize, self.volume)
    }
}

/// Buy/sell order counts for one pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideCounts {
    pub buy: u32,
    pub sell: u32,
}

impl SideCounts {
    pub fn new(buy: u32, sell: u32) -> Self {
        Self { buy, sell }
    }

    /// Count for one side
    pub fn get(&self, side: OrderSide) -> u32 {
        match side {
            OrderSide::Buy => self.buy,
            OrderSide::Sell => self.sell,
        }
    }

    /// Mutable count for one side
    pub fn get_mut(&mut self, side: OrderSide) -> &mut u32 {
        match side {
            OrderSide::Buy => &mut self.buy,
            OrderSide::Sell => &mut self.sell,
        }
    }

    pub fn total(&self) -> u32 {
        self.buy + self.sell
    }
}

impl std::fmt::Display for SideCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} buy / {} sell", self.buy, self.sell)
    }
}

/// Per-asset balances net of funds locked in open orders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceSnapshot {
    pub total: HashMap<String, f64>,
    pub locked: HashMap<String, f64>,
    pub available: HashMap<String, f64>,
}

impl BalanceSnapshot {
    /// Total custodial balance for an asset
    pub fn total(&self, asset: &str) -> f64 {
        self.total.get(asset).copied().unwrap_or(0.0)
    }

    /// Amount locked in open orders for an asset
    pub fn locked(&self, asset: &str) -> f64 {
        self.locked.get(asset).copied().unwrap_or(0.0)
    }

    /// Spendable balance for an asset. May be slightly negative on stale data.
    pub fn available(&self, asset: &str) -> f64 {
        self.available
            .get(asset)
            .copied()
            .unwrap_or_else(|| self.total(asset) - self.locked(asset))
    }
}

/// Last trade prices keyed by exchange-native pair identifier
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    prices: HashMap<String, f64>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge fresh prices, keeping previous values for pairs missing from the update
    pub fn update(&mut self, prices: HashMap<String, f64>) {
        for (pair, price) in prices {
            if price.is_finite() && price > 0.0 {
                self.prices.insert(pair, price);
            }
        }
    }

    pub fn set(&mut self, pair: impl Into<String>, price: f64) {
        self.prices.insert(pair.into(), price);
    }

    pub fn get(&self, pair: &str) -> Option<f64> {
        self.prices.get(pair).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parsing() {
        assert_eq!(OrderSide::parse("buy"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("SELL"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("limit"), None);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }

    #[test]
    fn test_order_request_formatting() {
        let request = OrderRequest {
            pair: "XETHZUSD".into(),
            side: OrderSide::Buy,
            volume: 0.0051,
            price: 2450.5,
            price_decimals: 2,
            volume_decimals: 6,
        };
        assert_eq!(request.price_str(), "2450.50");
        assert_eq!(request.volume_str(), "0.005100");
    }

    #[test]
    fn test_price_book_ignores_invalid_prices() {
        let mut book = PriceBook::new();
        book.set("XETHZUSD", 2500.0);
        book.update(HashMap::from([
            ("XETHZUSD".to_string(), 0.0),
            ("XXBTZUSD".to_string(), 95000.0),
        ]));
        assert_eq!(book.get("XETHZUSD"), Some(2500.0));
        assert_eq!(book.get("XXBTZUSD"), Some(95000.0));
    }

    #[test]
    fn test_side_counts_accessors() {
        let mut counts = SideCounts::new(2, 3);
        *counts.get_mut(OrderSide::Buy) += 1;
        assert_eq!(counts.get(OrderSide::Buy), 3);
        assert_eq!(counts.total(), 6);
    }
}
