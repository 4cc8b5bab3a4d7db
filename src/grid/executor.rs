//! Exchange abstraction for grid trading - enables mocking for tests

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use super::errors::{GridError, GridResult};
use super::types::{OrderRecord, OrderRequest};

/// Exchange operations consumed by the reconciliation engine
///
/// Implementations retry transient failures themselves; an error returned
/// from any method is final for the current tick.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a limit order, returning the exchange order id
    async fn place_order(&self, request: &OrderRequest) -> GridResult<String>;

    /// Cancel all open orders, or only those of one exchange pair
    async fn cancel_all(&self, pair: Option<&str>) -> GridResult<u32>;

    /// All currently open orders
    async fn get_open_orders(&self) -> GridResult<Vec<OrderRecord>>;

    /// Total custodial balance per asset
    async fn get_balances(&self) -> GridResult<HashMap<String, f64>>;

    /// Last trade price for each requested pair, keyed by the requested id
    async fn get_ticker(&self, pairs: &[String]) -> GridResult<HashMap<String, f64>>;
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the retry following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Execute with exponential backoff retry
    ///
    /// Only retryable errors are retried; anything else is returned as is.
    /// `operation` is called afresh for every attempt so each attempt can
    /// carry a new nonce.
    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> GridResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GridResult<T>>,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        return Err(GridError::RetriesExhausted {
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    let delay = self.delay_for(attempts);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        label,
                        attempts,
                        self.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::grid::balance::normalize_pair_code;
    use crate::grid::types::OrderSide;

    /// In-memory exchange: orders rest until a test fills or cancels them
    pub struct MockExchange {
        pub open_orders: Arc<Mutex<Vec<OrderRecord>>>,
        pub placed: Arc<Mutex<Vec<OrderRequest>>>,
        pub balances: Arc<Mutex<HashMap<String, f64>>>,
        pub tickers: Arc<Mutex<HashMap<String, f64>>>,
        /// Pair string echoed back in open orders, keyed by the submitted pair
        pub echo_pairs: Arc<Mutex<HashMap<String, String>>>,
        /// Scripted placement outcomes; `Some(err)` rejects, `None` accepts
        pub placement_script: Arc<Mutex<VecDeque<Option<GridError>>>>,
        pub should_fail: Arc<Mutex<bool>>,
        next_oid: AtomicU64,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self {
                open_orders: Arc::new(Mutex::new(Vec::new())),
                placed: Arc::new(Mutex::new(Vec::new())),
                balances: Arc::new(Mutex::new(HashMap::new())),
                tickers: Arc::new(Mutex::new(HashMap::new())),
                echo_pairs: Arc::new(Mutex::new(HashMap::new())),
                placement_script: Arc::new(Mutex::new(VecDeque::new())),
                should_fail: Arc::new(Mutex::new(false)),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_balance(&self, asset: &str, amount: f64) {
            self.balances.lock().await.insert(asset.to_string(), amount);
        }

        pub async fn set_price(&self, pair: &str, price: f64) {
            self.tickers.lock().await.insert(pair.to_string(), price);
        }

        /// Report orders placed on `submitted` as `echoed` in open orders
        pub async fn set_echo_pair(&self, submitted: &str, echoed: &str) {
            self.echo_pairs
                .lock()
                .await
                .insert(submitted.to_string(), echoed.to_string());
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        /// Queue outcomes for the next placements
        pub async fn script_placements(&self, outcomes: Vec<Option<GridError>>) {
            self.placement_script.lock().await.extend(outcomes);
        }

        /// Insert a resting order directly, bypassing placement
        pub async fn seed_order(&self, pair: &str, side: OrderSide, volume: f64, price: f64) -> String {
            let id = format!("SEED-{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
            self.open_orders.lock().await.push(OrderRecord {
                id: id.clone(),
                pair: pair.to_string(),
                side,
                volume,
                price,
            });
            id
        }

        /// Remove an order as if it had been filled
        pub async fn fill_order(&self, id: &str) -> Option<OrderRecord> {
            let mut orders = self.open_orders.lock().await;
            let index = orders.iter().position(|o| o.id == id)?;
            Some(orders.remove(index))
        }

        pub async fn placed_orders(&self) -> Vec<OrderRequest> {
            self.placed.lock().await.clone()
        }

        pub async fn clear_placed(&self) {
            self.placed.lock().await.clear();
        }

        pub async fn open_order_snapshot(&self) -> Vec<OrderRecord> {
            self.open_orders.lock().await.clone()
        }
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn place_order(&self, request: &OrderRequest) -> GridResult<String> {
            if *self.should_fail.lock().await {
                return Err(GridError::Transient("Mock failure".into()));
            }

            if let Some(Some(err)) = self.placement_script.lock().await.pop_front() {
                return Err(err);
            }

            self.placed.lock().await.push(request.clone());
            let id = format!("O-{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
            let pair = self
                .echo_pairs
                .lock()
                .await
                .get(&request.pair)
                .cloned()
                .unwrap_or_else(|| request.pair.clone());

            self.open_orders.lock().await.push(OrderRecord {
                id: id.clone(),
                pair,
                side: request.side,
                volume: request.volume,
                price: request.price,
            });

            Ok(id)
        }

        async fn cancel_all(&self, pair: Option<&str>) -> GridResult<u32> {
            if *self.should_fail.lock().await {
                return Err(GridError::Transient("Mock failure".into()));
            }

            let mut orders = self.open_orders.lock().await;
            let before = orders.len();
            match pair {
                Some(pair) => {
                    let target = normalize_pair_code(pair);
                    orders.retain(|o| normalize_pair_code(&o.pair) != target);
                }
                None => orders.clear(),
            }
            Ok((before - orders.len()) as u32)
        }

        async fn get_open_orders(&self) -> GridResult<Vec<OrderRecord>> {
            if *self.should_fail.lock().await {
                return Err(GridError::Transient("Mock failure".into()));
            }
            Ok(self.open_orders.lock().await.clone())
        }

        async fn get_balances(&self) -> GridResult<HashMap<String, f64>> {
            if *self.should_fail.lock().await {
                return Err(GridError::Transient("Mock failure".into()));
            }
            Ok(self.balances.lock().await.clone())
        }

        async fn get_ticker(&self, pairs: &[String]) -> GridResult<HashMap<String, f64>> {
            if *self.should_fail.lock().await {
                return Err(GridError::Transient("Mock failure".into()));
            }
            let tickers = self.tickers.lock().await;
            Ok(pairs
                .iter()
                .filter_map(|p| tickers.get(p).map(|price| (p.clone(), *price)))
                .collect())
        }
    }
}
