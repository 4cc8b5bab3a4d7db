//! Grid Order Reconciliation for Kraken
//!
//! A multi-pair grid bot that keeps buy and sell ladders around the current
//! price. Fills are never streamed: every tick the engine polls open orders,
//! compares them with the persisted expected counts, and infers fills from
//! the difference.
//!
//! # Architecture
//!
//! - [`config`] - Per-pair trading configuration and validation
//! - [`types`] - Core data types (OrderSide, OrderRecord, SideCounts, etc.)
//! - [`errors`] - Grid-specific error types
//! - [`balance`] - Pair-code matching and balance accounting from open orders
//! - [`sizer`] - Order sizing, minimum checks and reference rates
//! - [`planner`] - Grid construction and ladder extension
//! - [`reposition`] - Drift detection for dynamic repositioning
//! - [`engine`] - The reconciliation tick
//! - [`state`] - Expected-count persistence
//! - [`ledger`] - Order and execution ledger with PnL estimates
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`kraken`] - Kraken REST client, signer and nonce source
//! - [`runner`] - Main execution loop
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use kraken_gridbot::grid::{
//!     GridRunner, JsonlLedger, ReconciliationEngine, RunnerConfig, StateManager,
//! };
//!
//! let engine = ReconciliationEngine::new(
//!     pairs,
//!     exchange,
//!     ledger.clone(),
//!     StateManager::load_or_create("data/.expected_order_counts.json"),
//!     Arc::new(SystemClock),
//!     shutdown.clone(),
//!     EngineOptions::default(),
//! );
//! GridRunner::new(engine, ledger, RunnerConfig::default(), shutdown).run().await?;
//! ```
//!
//! # Testing
//!
//! ```rust,ignore
//! use kraken_gridbot::grid::executor::mock::MockExchange;
//!
//! let exchange = MockExchange::new();
//! exchange.set_price("XETHZUSD", 2000.0).await;
//! exchange.set_balance("ZUSD", 1000.0).await;
//! ```

pub mod balance;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod kraken;
pub mod ledger;
pub mod planner;
pub mod reposition;
pub mod runner;
pub mod shutdown;
pub mod sizer;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use balance::{BalanceLedger, ObservedOrders, PairResolver};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MinOrderUnit, QuoteConvention, TradingPairConfig};
pub use engine::{EngineOptions, ReconciliationEngine, TickReport};
pub use errors::{GridError, GridResult};
pub use executor::{ExchangeClient, RetryPolicy};
pub use kraken::{KrakenClient, KrakenSigner, MonotonicNonce, NonceProvider};
pub use ledger::{
    ExecutionRecord, JsonlLedger, LedgerFilter, LedgerReport, LedgerSink, LedgerSummary, MemoryLedger,
};
pub use planner::GridPlanner;
pub use reposition::{RepositionController, RepositionPhase};
pub use runner::{GridRunner, RunnerConfig};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use sizer::{OrderSizer, ReferenceRate};
pub use state::{PairState, StateManager};
pub use types::{BalanceSnapshot, OrderRecord, OrderRequest, OrderSide, PriceBook, SideCounts};
