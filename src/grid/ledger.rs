//! Trade ledger and PnL estimation
//!
//! The engine reports every confirmed placement and every inferred execution
//! here. Recording is fire-and-forget from the engine's point of view: a
//! failing sink is logged and trading continues.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::OrderSide;

/// Executions of the opposite side averaged by [`AverageOppositeEstimator`]
pub const DEFAULT_PNL_WINDOW: usize = 10;

/// An inferred fill, as reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub order_id: String,
    pub execution_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub volume: f64,
    pub price: f64,
    pub fee: f64,
    /// Quote-to-reference rate used to value the execution
    pub reference_rate: f64,
}

/// One line of the ledger file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEntry {
    OrderPlaced {
        timestamp: DateTime<Utc>,
        order_id: String,
        pair: String,
        side: OrderSide,
        volume: f64,
        price: f64,
    },
    Execution {
        timestamp: DateTime<Utc>,
        order_id: String,
        execution_id: String,
        pair: String,
        side: OrderSide,
        volume: f64,
        price: f64,
        fee: f64,
        /// `volume x price x reference rate`
        reference_value: f64,
        pnl: f64,
    },
}

impl LedgerEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::OrderPlaced { timestamp, .. } | LedgerEntry::Execution { timestamp, .. } => {
                *timestamp
            }
        }
    }

    pub fn pair(&self) -> &str {
        match self {
            LedgerEntry::OrderPlaced { pair, .. } | LedgerEntry::Execution { pair, .. } => pair,
        }
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, LedgerEntry::Execution { .. })
    }
}

/// A recorded execution as seen by PnL estimators
#[derive(Debug, Clone, PartialEq)]
pub struct PastExecution {
    pub pair: String,
    pub side: OrderSide,
    pub volume: f64,
    pub price: f64,
    pub reference_value: f64,
    pub pnl: f64,
}

/// Estimates the PnL contribution of an execution from past executions
pub trait PnlEstimator: Send + Sync {
    /// `history` is oldest first
    fn estimate(&self, history: &[PastExecution], execution: &ExecutionRecord) -> f64;
}

/// Compares the execution price with the average of recent opposite-side executions
///
/// Buying below that average or selling above it counts as a gain.
#[derive(Debug, Clone, Copy)]
pub struct AverageOppositeEstimator {
    pub window: usize,
}

impl Default for AverageOppositeEstimator {
    fn default() -> Self {
        Self {
            window: DEFAULT_PNL_WINDOW,
        }
    }
}

impl PnlEstimator for AverageOppositeEstimator {
    fn estimate(&self, history: &[PastExecution], execution: &ExecutionRecord) -> f64 {
        let opposite = execution.side.opposite();
        let recent: Vec<f64> = history
            .iter()
            .rev()
            .filter(|e| e.pair == execution.pair && e.side == opposite)
            .take(self.window)
            .map(|e| e.price)
            .collect();

        if recent.is_empty() {
            return 0.0;
        }

        let average = recent.iter().sum::<f64>() / recent.len() as f64;
        let diff = match execution.side {
            OrderSide::Buy => average - execution.price,
            OrderSide::Sell => execution.price - average,
        };

        let value = diff.abs() * execution.volume * execution.reference_rate;
        if diff > 0.0 {
            value
        } else {
            -value
        }
    }
}

/// Per-pair execution totals
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PairSummary {
    pub executions: u64,
    pub buys: u64,
    pub sells: u64,
    pub volume: f64,
    pub pnl: f64,
}

/// Aggregate ledger statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub session_start: DateTime<Utc>,
    pub session_secs: i64,
    pub orders_placed: u64,
    pub executions: u64,
    /// Reference-currency value of all executions
    pub total_volume: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub pairs: BTreeMap<String, PairSummary>,
}

impl LedgerSummary {
    /// Log the summary at info level
    pub fn log_report(&self) {
        info!("==================== PnL REPORT ====================");
        info!(
            "Session: {}h {}m (started {})",
            self.session_secs / 3600,
            (self.session_secs % 3600) / 60,
            self.session_start.format("%Y-%m-%d %H:%M:%S")
        );
        info!("Orders placed: {}", self.orders_placed);
        if self.executions == 0 {
            info!("No executions recorded yet");
            return;
        }
        info!("Executions: {}", self.executions);
        info!("Total volume: ${:.2}", self.total_volume);
        info!("Total PnL: ${:.2} (avg ${:.2}/execution)", self.total_pnl, self.avg_pnl);
        for (pair, stats) in &self.pairs {
            info!(
                "  {}: {} executions ({} buy / {} sell), volume ${:.2}, PnL ${:.2}",
                pair, stats.executions, stats.buys, stats.sells, stats.volume, stats.pnl
            );
        }
    }
}

/// Destination for placement and execution records
pub trait LedgerSink: Send + Sync {
    fn record_order_placed(
        &self,
        order_id: &str,
        pair: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> GridResult<()>;

    /// Record an execution, returning its estimated PnL contribution
    fn record_execution(&self, execution: &ExecutionRecord) -> GridResult<f64>;

    fn summary(&self) -> GridResult<LedgerSummary>;
}

/// In-memory aggregation shared by the ledger implementations
struct LedgerBook {
    session_start: DateTime<Utc>,
    orders_placed: u64,
    executions: Vec<PastExecution>,
    estimator: Box<dyn PnlEstimator>,
}

impl LedgerBook {
    fn new(estimator: Box<dyn PnlEstimator>) -> Self {
        Self {
            session_start: Utc::now(),
            orders_placed: 0,
            executions: Vec::new(),
            estimator,
        }
    }

    fn apply(&mut self, entry: &LedgerEntry) {
        match entry {
            LedgerEntry::OrderPlaced { .. } => self.orders_placed += 1,
            LedgerEntry::Execution {
                pair,
                side,
                volume,
                price,
                reference_value,
                pnl,
                ..
            } => self.executions.push(PastExecution {
                pair: pair.clone(),
                side: *side,
                volume: *volume,
                price: *price,
                reference_value: *reference_value,
                pnl: *pnl,
            }),
        }
    }

    fn execution_entry(&self, execution: &ExecutionRecord) -> LedgerEntry {
        let pnl = self.estimator.estimate(&self.executions, execution);
        LedgerEntry::Execution {
            timestamp: Utc::now(),
            order_id: execution.order_id.clone(),
            execution_id: execution.execution_id.clone(),
            pair: execution.pair.clone(),
            side: execution.side,
            volume: execution.volume,
            price: execution.price,
            fee: execution.fee,
            reference_value: execution.volume * execution.price * execution.reference_rate,
            pnl,
        }
    }

    fn summary(&self) -> LedgerSummary {
        let mut pairs: BTreeMap<String, PairSummary> = BTreeMap::new();
        for execution in &self.executions {
            let stats = pairs.entry(execution.pair.clone()).or_default();
            stats.executions += 1;
            match execution.side {
                OrderSide::Buy => stats.buys += 1,
                OrderSide::Sell => stats.sells += 1,
            }
            stats.volume += execution.reference_value;
            stats.pnl += execution.pnl;
        }

        let executions = self.executions.len() as u64;
        let total_volume = self.executions.iter().map(|e| e.reference_value).sum();
        let total_pnl: f64 = self.executions.iter().map(|e| e.pnl).sum();

        LedgerSummary {
            session_start: self.session_start,
            session_secs: (Utc::now() - self.session_start).num_seconds().max(0),
            orders_placed: self.orders_placed,
            executions,
            total_volume,
            total_pnl,
            avg_pnl: if executions > 0 {
                total_pnl / executions as f64
            } else {
                0.0
            },
            pairs,
        }
    }
}

fn placed_entry(order_id: &str, pair: &str, side: OrderSide, volume: f64, price: f64) -> LedgerEntry {
    LedgerEntry::OrderPlaced {
        timestamp: Utc::now(),
        order_id: order_id.to_string(),
        pair: pair.to_string(),
        side,
        volume,
        price,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> GridResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| GridError::Ledger("ledger lock poisoned".into()))
}

// ============================================================================
// Memory ledger
// ============================================================================

/// Ledger kept only in memory
pub struct MemoryLedger {
    book: Mutex<LedgerBook>,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_estimator(Box::new(AverageOppositeEstimator::default()))
    }

    pub fn with_estimator(estimator: Box<dyn PnlEstimator>) -> Self {
        Self {
            book: Mutex::new(LedgerBook::new(estimator)),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Every entry recorded so far
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerSink for MemoryLedger {
    fn record_order_placed(
        &self,
        order_id: &str,
        pair: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> GridResult<()> {
        let entry = placed_entry(order_id, pair, side, volume, price);
        lock(&self.book)?.apply(&entry);
        lock(&self.entries)?.push(entry);
        Ok(())
    }

    fn record_execution(&self, execution: &ExecutionRecord) -> GridResult<f64> {
        let mut book = lock(&self.book)?;
        let entry = book.execution_entry(execution);
        book.apply(&entry);
        let pnl = match &entry {
            LedgerEntry::Execution { pnl, .. } => *pnl,
            LedgerEntry::OrderPlaced { .. } => 0.0,
        };
        lock(&self.entries)?.push(entry);
        Ok(pnl)
    }

    fn summary(&self) -> GridResult<LedgerSummary> {
        Ok(lock(&self.book)?.summary())
    }
}

// ============================================================================
// JSON-lines ledger
// ============================================================================

/// Append-only JSON-lines ledger file
pub struct JsonlLedger {
    path: PathBuf,
    file: Mutex<File>,
    book: Mutex<LedgerBook>,
}

impl JsonlLedger {
    /// Open (or create) a ledger file, replaying existing entries
    pub fn open(path: impl AsRef<Path>) -> GridResult<Self> {
        Self::open_with_estimator(path, Box::new(AverageOppositeEstimator::default()))
    }

    pub fn open_with_estimator(path: impl AsRef<Path>, estimator: Box<dyn PnlEstimator>) -> GridResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut book = LedgerBook::new(estimator);
        let replayed = Self::replay(path, &mut book)?;
        if replayed > 0 {
            info!(
                "Ledger {:?}: replayed {} entries ({} executions)",
                path,
                replayed,
                book.executions.len()
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| GridError::Ledger(format!("{:?}: {}", path, e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            book: Mutex::new(book),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path, book: &mut LedgerBook) -> GridResult<usize> {
        let entries = read_entries(path)?;
        for entry in &entries {
            book.apply(entry);
        }
        Ok(entries.len())
    }

    fn append(&self, entry: &LedgerEntry) -> GridResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = lock(&self.file)?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| GridError::Ledger(format!("{:?}: {}", self.path, e)))
    }
}

impl LedgerSink for JsonlLedger {
    fn record_order_placed(
        &self,
        order_id: &str,
        pair: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
    ) -> GridResult<()> {
        let entry = placed_entry(order_id, pair, side, volume, price);
        self.append(&entry)?;
        lock(&self.book)?.apply(&entry);
        Ok(())
    }

    fn record_execution(&self, execution: &ExecutionRecord) -> GridResult<f64> {
        let mut book = lock(&self.book)?;
        let entry = book.execution_entry(execution);
        self.append(&entry)?;
        book.apply(&entry);

        let pnl = match &entry {
            LedgerEntry::Execution { pnl, .. } => *pnl,
            LedgerEntry::OrderPlaced { .. } => 0.0,
        };
        info!(
            "Execution recorded: {} {} {:.6} @ {} (PnL ${:.2})",
            execution.pair,
            execution.side.as_str().to_uppercase(),
            execution.volume,
            execution.price,
            pnl
        );
        Ok(pnl)
    }

    fn summary(&self) -> GridResult<LedgerSummary> {
        Ok(lock(&self.book)?.summary())
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Read every well-formed entry of a ledger file, oldest first
///
/// A missing file reads as empty. Malformed lines are skipped with a warning.
pub fn read_entries(path: impl AsRef<Path>) -> GridResult<Vec<LedgerEntry>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping malformed ledger line {} in {:?}: {}", index + 1, path, e),
        }
    }
    Ok(entries)
}

/// Which entries a report covers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFilter {
    /// Logical pair name
    pub pair: Option<String>,
    /// Entries at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl LedgerFilter {
    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = Some(pair.into());
        self
    }

    /// Only the last `days` days before `now`
    pub fn within_days(mut self, days: i64, now: DateTime<Utc>) -> Self {
        self.since = Some(now - chrono::Duration::days(days));
        self
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(pair) = &self.pair {
            if entry.pair() != pair {
                return false;
            }
        }
        match self.since {
            Some(since) => entry.timestamp() >= since,
            None => true,
        }
    }
}

/// Summary plus the most recent executions and placements, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerReport {
    pub summary: LedgerSummary,
    pub recent_executions: Vec<LedgerEntry>,
    pub recent_orders: Vec<LedgerEntry>,
}

impl LedgerReport {
    /// Build a report over the entries matching `filter`
    ///
    /// The summary's session spans the first to the last matching entry.
    pub fn build(entries: &[LedgerEntry], filter: &LedgerFilter, recent: usize) -> Self {
        let selected: Vec<&LedgerEntry> = entries.iter().filter(|e| filter.matches(e)).collect();

        let mut book = LedgerBook::new(Box::new(AverageOppositeEstimator::default()));
        for entry in &selected {
            book.apply(entry);
        }
        let mut summary = book.summary();
        if let (Some(first), Some(last)) = (selected.first(), selected.last()) {
            summary.session_start = first.timestamp();
            summary.session_secs = (last.timestamp() - first.timestamp()).num_seconds().max(0);
        }

        let latest = |executions: bool| -> Vec<LedgerEntry> {
            selected
                .iter()
                .rev()
                .filter(|e| e.is_execution() == executions)
                .take(recent)
                .map(|e| (*e).clone())
                .collect()
        };

        Self {
            summary,
            recent_executions: latest(true),
            recent_orders: latest(false),
        }
    }

    pub fn log_report(&self) {
        self.summary.log_report();

        if !self.recent_executions.is_empty() {
            info!("Recent executions:");
        }
        for entry in &self.recent_executions {
            if let LedgerEntry::Execution {
                timestamp,
                pair,
                side,
                volume,
                price,
                reference_value,
                pnl,
                ..
            } = entry
            {
                info!(
                    "  {} {} {} {} @ {} (${:.2}, PnL ${:.2})",
                    timestamp.format("%Y-%m-%d %H:%M:%S"),
                    pair,
                    side,
                    volume,
                    price,
                    reference_value,
                    pnl
                );
            }
        }

        if !self.recent_orders.is_empty() {
            info!("Recent orders:");
        }
        for entry in &self.recent_orders {
            if let LedgerEntry::OrderPlaced {
                timestamp,
                order_id,
                pair,
                side,
                volume,
                price,
            } = entry
            {
                info!(
                    "  {} {} {} {} @ {} -> {}",
                    timestamp.format("%Y-%m-%d %H:%M:%S"),
                    pair,
                    side,
                    volume,
                    price,
                    order_id
                );
            }
        }
    }
}
