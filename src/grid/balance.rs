//! Available-balance accounting and pair resolution
//!
//! Exchanges often echo a pair in a different encoding than it was submitted
//! with (an order placed on `XETHZUSD` comes back as `ETHUSD`). Every open
//! order is resolved to a configured pair before it counts towards locked
//! funds or grid order counts.

use std::collections::HashMap;

use log::{debug, warn};

use super::config::TradingPairConfig;
use super::types::{BalanceSnapshot, OrderRecord, OrderSide, SideCounts};

/// Strip currency-code decoration (`X`/`Z` prefixes) for structural comparison
pub fn normalize_pair_code(code: &str) -> String {
    code.trim()
        .to_uppercase()
        .chars()
        .filter(|c| *c != 'X' && *c != 'Z')
        .collect()
}

/// How an exchange pair string was matched to a configured pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Alias,
    Structural,
}

#[derive(Debug, Clone)]
struct ResolverEntry {
    name: String,
    exact: Vec<String>,
    aliases: Vec<String>,
    structural: String,
}

/// Maps exchange-native pair strings to logical pair names
#[derive(Debug, Clone, Default)]
pub struct PairResolver {
    entries: Vec<ResolverEntry>,
}

impl PairResolver {
    pub fn new(pairs: &[TradingPairConfig]) -> Self {
        let entries = pairs
            .iter()
            .map(|p| ResolverEntry {
                name: p.name.clone(),
                exact: vec![p.exchange_pair.to_uppercase(), p.name.to_uppercase()],
                aliases: p.aliases.iter().map(|a| a.trim().to_uppercase()).collect(),
                structural: normalize_pair_code(&p.exchange_pair),
            })
            .collect();
        Self { entries }
    }

    /// Resolve an exchange pair string: exact match, then aliases, then structural
    pub fn resolve(&self, raw: &str) -> Option<(&str, MatchKind)> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() {
            return None;
        }

        if let Some(entry) = self.entries.iter().find(|e| e.exact.contains(&upper)) {
            return Some((entry.name.as_str(), MatchKind::Exact));
        }

        if let Some(entry) = self.entries.iter().find(|e| e.aliases.contains(&upper)) {
            return Some((entry.name.as_str(), MatchKind::Alias));
        }

        let structural = normalize_pair_code(&upper);
        self.entries
            .iter()
            .find(|e| !structural.is_empty() && e.structural == structural)
            .map(|e| (e.name.as_str(), MatchKind::Structural))
    }
}

/// Open orders grouped by logical pair
#[derive(Debug, Clone, Default)]
pub struct ObservedOrders {
    by_pair: HashMap<String, Vec<OrderRecord>>,
    unmatched: Vec<OrderRecord>,
}

impl ObservedOrders {
    /// Orders resolved to a pair
    pub fn orders(&self, pair: &str) -> &[OrderRecord] {
        self.by_pair.get(pair).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Buy/sell counts for a pair
    pub fn counts(&self, pair: &str) -> SideCounts {
        let mut counts = SideCounts::default();
        for order in self.orders(pair) {
            *counts.get_mut(order.side) += 1;
        }
        counts
    }

    /// Whether at least one open order resolved to this pair
    pub fn has_orders(&self, pair: &str) -> bool {
        !self.orders(pair).is_empty()
    }

    /// Lowest buy price or highest sell price for a pair
    pub fn outermost_price(&self, pair: &str, side: OrderSide) -> Option<f64> {
        let prices = self
            .orders(pair)
            .iter()
            .filter(|o| o.side == side)
            .map(|o| o.price);
        match side {
            OrderSide::Buy => prices.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p)))),
            OrderSide::Sell => prices.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p)))),
        }
    }

    pub fn unmatched(&self) -> &[OrderRecord] {
        &self.unmatched
    }

    /// All resolved orders with their logical pair name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OrderRecord)> {
        self.by_pair
            .iter()
            .flat_map(|(pair, orders)| orders.iter().map(move |o| (pair.as_str(), o)))
    }

    pub fn matched_len(&self) -> usize {
        self.by_pair.values().map(Vec::len).sum()
    }
}

/// Derives spendable balances from custodial totals and open orders
#[derive(Debug, Clone)]
pub struct BalanceLedger {
    resolver: PairResolver,
    /// pair name -> (base asset, quote asset)
    assets: HashMap<String, (String, String)>,
}

impl BalanceLedger {
    pub fn new(pairs: &[TradingPairConfig]) -> Self {
        Self {
            resolver: PairResolver::new(pairs),
            assets: pairs
                .iter()
                .map(|p| (p.name.clone(), (p.base_asset.clone(), p.quote_asset.clone())))
                .collect(),
        }
    }

    pub fn resolver(&self) -> &PairResolver {
        &self.resolver
    }

    /// Group open orders by logical pair. Unresolvable orders are kept aside and logged.
    pub fn classify(&self, orders: Vec<OrderRecord>) -> ObservedOrders {
        let mut observed = ObservedOrders::default();

        for order in orders {
            match self.resolver.resolve(&order.pair) {
                Some((name, kind)) => {
                    if kind != MatchKind::Exact {
                        debug!("Matched '{}' -> {} ({:?})", order.pair, name, kind);
                    }
                    observed
                        .by_pair
                        .entry(name.to_string())
                        .or_default()
                        .push(order);
                }
                None => observed.unmatched.push(order),
            }
        }

        if !observed.unmatched.is_empty() {
            warn!(
                "{} open order(s) could not be matched to a configured pair",
                observed.unmatched.len()
            );
            for order in observed.unmatched.iter().take(5) {
                warn!("  Order {}: pair='{}' {} {} @ {}", order.id, order.pair, order.side, order.volume, order.price);
            }
            if observed.unmatched.len() > 5 {
                warn!("  ... and {} more unmatched orders", observed.unmatched.len() - 5);
            }
        }

        observed
    }

    /// Compute `available = total - locked` for every asset
    ///
    /// A buy locks `volume x price` of the quote asset; a sell locks `volume`
    /// of the base asset. Unmatched orders are excluded.
    pub fn compute(&self, totals: &HashMap<String, f64>, observed: &ObservedOrders) -> BalanceSnapshot {
        let mut locked: HashMap<String, f64> = HashMap::new();

        for (pair, order) in observed.iter() {
            let Some((base, quote)) = self.assets.get(pair) else {
                continue;
            };
            match order.side {
                OrderSide::Buy => *locked.entry(quote.clone()).or_insert(0.0) += order.volume * order.price,
                OrderSide::Sell => *locked.entry(base.clone()).or_insert(0.0) += order.volume,
            }
        }

        let mut available: HashMap<String, f64> = totals
            .iter()
            .map(|(asset, total)| (asset.clone(), total - locked.get(asset).copied().unwrap_or(0.0)))
            .collect();
        for (asset, amount) in &locked {
            available.entry(asset.clone()).or_insert(-amount);
        }

        for (asset, amount) in &available {
            if *amount < 0.0 {
                debug!("{} available balance is negative ({:.8}), stale data?", asset, amount);
            }
        }

        BalanceSnapshot {
            total: totals.clone(),
            locked,
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs() -> Vec<TradingPairConfig> {
        vec![
            TradingPairConfig::new("XRP/BTC", "XXRPXXBT", "XXRP", "XXBT", 2.5)
                .with_aliases(["XRPBTC", "XRP/BTC", "XRPXXBT", "XXRPXBT", "XRPXBT"]),
            TradingPairConfig::new("ETH/USD", "XETHZUSD", "XETH", "ZUSD", 1.5)
                .with_aliases(["ETHUSD", "ETH/USD", "XETHUSD", "ETHZUSD"]),
        ]
    }

    fn order(id: &str, pair: &str, side: OrderSide, volume: f64, price: f64) -> OrderRecord {
        OrderRecord {
            id: id.into(),
            pair: pair.into(),
            side,
            volume,
            price,
        }
    }

    #[test]
    fn test_resolution_chain() {
        let resolver = PairResolver::new(&pairs());

        assert_eq!(resolver.resolve("xethzusd"), Some(("ETH/USD", MatchKind::Exact)));
        assert_eq!(resolver.resolve("ETH/USD"), Some(("ETH/USD", MatchKind::Exact)));
        assert_eq!(resolver.resolve("ETHUSD"), Some(("ETH/USD", MatchKind::Alias)));
        assert_eq!(resolver.resolve("XRPXBT"), Some(("XRP/BTC", MatchKind::Alias)));
        assert_eq!(resolver.resolve("ZETHXUSD"), Some(("ETH/USD", MatchKind::Structural)));
        assert_eq!(resolver.resolve("SOLUSD"), None);
        assert_eq!(resolver.resolve(""), None);
    }

    #[test]
    fn test_structural_match_without_aliases() {
        let bare = vec![TradingPairConfig::new("XRP/BTC", "XXRPXXBT", "XXRP", "XXBT", 2.5)];
        let resolver = PairResolver::new(&bare);
        assert_eq!(resolver.resolve("XRPXBT"), Some(("XRP/BTC", MatchKind::Structural)));
    }

    #[test]
    fn test_available_equals_total_minus_locked() {
        let ledger = BalanceLedger::new(&pairs());
        let mut orders: Vec<OrderRecord> = (0..12)
            .map(|i| order(&format!("S{i}"), "ETHUSD", OrderSide::Sell, 0.005077, 3000.0 + i as f64))
            .collect();
        orders.push(order("B1", "ETHUSD", OrderSide::Buy, 0.01, 2500.0));
        orders.push(order("B2", "XRPXBT", OrderSide::Buy, 100.0, 0.00002));
        orders.push(order("X1", "DOGEUSD", OrderSide::Sell, 1000.0, 0.1));

        let totals = HashMap::from([
            ("XETH".to_string(), 0.064131),
            ("ZUSD".to_string(), 100.0),
            ("XXBT".to_string(), 0.01),
            ("XXRP".to_string(), 50.0),
        ]);

        let observed = ledger.classify(orders);
        assert_eq!(observed.unmatched().len(), 1);

        let snapshot = ledger.compute(&totals, &observed);

        for asset in totals.keys() {
            let expected = snapshot.total(asset) - snapshot.locked(asset);
            assert!((snapshot.available(asset) - expected).abs() < 1e-12, "{asset}");
        }
        assert!((snapshot.locked("XETH") - 12.0 * 0.005077).abs() < 1e-12);
        assert!((snapshot.available("XETH") - (0.064131 - 0.060924)).abs() < 1e-9);
        assert!((snapshot.locked("ZUSD") - 25.0).abs() < 1e-9);
        assert!((snapshot.locked("XXBT") - 0.002).abs() < 1e-12);
        assert_eq!(snapshot.locked("XXRP"), 0.0);
        // The unmatched DOGE order locks nothing
        assert_eq!(snapshot.locked("XDG"), 0.0);
    }

    #[test]
    fn test_locked_asset_without_total_goes_negative() {
        let ledger = BalanceLedger::new(&pairs());
        let observed = ledger.classify(vec![order("S1", "XETHZUSD", OrderSide::Sell, 0.5, 3000.0)]);
        let snapshot = ledger.compute(&HashMap::new(), &observed);
        assert!((snapshot.available("XETH") + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_observed_counts_and_extremes() {
        let ledger = BalanceLedger::new(&pairs());
        let observed = ledger.classify(vec![
            order("B1", "ETHUSD", OrderSide::Buy, 0.01, 99.0),
            order("B2", "ETHUSD", OrderSide::Buy, 0.01, 97.0),
            order("S1", "XETHZUSD", OrderSide::Sell, 0.01, 103.0),
            order("S2", "ETHUSD", OrderSide::Sell, 0.01, 101.0),
        ]);

        assert_eq!(observed.counts("ETH/USD"), SideCounts::new(2, 2));
        assert_eq!(observed.counts("XRP/BTC"), SideCounts::default());
        assert_eq!(observed.outermost_price("ETH/USD", OrderSide::Buy), Some(97.0));
        assert_eq!(observed.outermost_price("ETH/USD", OrderSide::Sell), Some(103.0));
        assert_eq!(observed.outermost_price("XRP/BTC", OrderSide::Buy), None);
        assert_eq!(observed.matched_len(), 4);
    }
}
