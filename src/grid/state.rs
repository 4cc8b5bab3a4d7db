//! Reconciliation state with JSON persistence
//!
//! One document holds every pair's expected order counts, grid center and
//! last reposition time. It is rewritten (temp file, then rename) after every
//! mutation so a restart resumes from the last known ground truth.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::{OrderSide, SideCounts};

/// Durable state of one pair's grid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairState {
    /// Believed number of resting orders per side
    #[serde(default)]
    pub expected: SideCounts,

    /// Price the current grid was built around
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_price: Option<f64>,

    /// Unix seconds of the last successful reposition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reposition: Option<u64>,
}

/// Persistent state for all pairs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridStates {
    #[serde(default)]
    pub pairs: BTreeMap<String, PairState>,
}

impl GridStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load state from file
    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;
        Ok(state)
    }

    /// Save state to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

/// Owns the reconciliation state and its file
///
/// The engine is the only writer, so no locking is involved.
#[derive(Debug)]
pub struct StateManager {
    state: GridStates,
    save_path: Option<PathBuf>,
}

impl StateManager {
    /// Purely in-memory state, never written to disk
    pub fn in_memory() -> Self {
        Self {
            state: GridStates::new(),
            save_path: None,
        }
    }

    /// Load state from file or start empty
    ///
    /// An unreadable file is logged and replaced on the next save.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = if path.exists() {
            match GridStates::load_from_file(&path) {
                Ok(state) => {
                    info!("Loaded state for {} pair(s) from {:?}", state.pairs.len(), path);
                    for (name, pair) in &state.pairs {
                        info!("  {}: expected {}", name, pair.expected);
                    }
                    state
                }
                Err(e) => {
                    warn!("Failed to load state from {:?}: {}, starting fresh", path, e);
                    GridStates::new()
                }
            }
        } else {
            info!("No existing state file at {:?}, starting fresh", path);
            GridStates::new()
        };

        Self {
            state,
            save_path: Some(path),
        }
    }

    pub fn states(&self) -> &GridStates {
        &self.state
    }

    pub fn get(&self, pair: &str) -> Option<&PairState> {
        self.state.pairs.get(pair)
    }

    pub fn expected(&self, pair: &str) -> Option<SideCounts> {
        self.get(pair).map(|s| s.expected)
    }

    pub fn center_price(&self, pair: &str) -> Option<f64> {
        self.get(pair).and_then(|s| s.center_price)
    }

    pub fn last_reposition(&self, pair: &str) -> Option<u64> {
        self.get(pair).and_then(|s| s.last_reposition)
    }

    pub fn has_expected(&self, pair: &str) -> bool {
        self.state.pairs.contains_key(pair)
    }

    pub fn set_expected(&mut self, pair: &str, expected: SideCounts) {
        self.entry(pair).expected = expected;
        self.persist();
    }

    pub fn set_expected_side(&mut self, pair: &str, side: OrderSide, count: u32) {
        *self.entry(pair).expected.get_mut(side) = count;
        self.persist();
    }

    pub fn set_center(&mut self, pair: &str, center: f64) {
        self.entry(pair).center_price = Some(center);
        self.persist();
    }

    pub fn set_last_reposition(&mut self, pair: &str, at: u64) {
        self.entry(pair).last_reposition = Some(at);
        self.persist();
    }

    /// Write the state file now. Failures are returned.
    pub fn save(&self) -> GridResult<()> {
        if let Some(path) = &self.save_path {
            self.state
                .save_to_file_atomic(path)
                .map_err(|e| GridError::StatePersistence(format!("{:?}: {}", path, e)))?;
            debug!("State saved to {:?}", path);
        }
        Ok(())
    }

    /// Write the state file, logging failures; the in-memory state stays authoritative
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            warn!("{}", e);
        }
    }

    fn entry(&mut self, pair: &str) -> &mut PairState {
        self.state.pairs.entry(pair.to_string()).or_default()
    }
}
