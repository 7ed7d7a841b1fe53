//! Engine state persistence.
//!
//! One JSON file holds everything the engine needs to survive a restart:
//! queued signals, positions (open and recently closed), cooldowns,
//! outstanding order ids, and strategy-local state. Writes are atomic
//! (temp file + rename). Version mismatches migrate forward when possible;
//! files that cannot be migrated are backed up and replaced with a fresh
//! empty state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TradewindError};
use crate::execution::cooldown::Cooldown;
use crate::execution::position_tracker::TrackedPosition;
use crate::execution::signal_queue::PendingSignal;

/// Current schema version.
pub const STATE_VERSION: &str = "1.1.0";

/// Everything persisted between engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub signal_queue: Vec<PendingSignal>,
    pub positions: Vec<TrackedPosition>,
    #[serde(default)]
    pub closed_positions: Vec<TrackedPosition>,
    pub cooldowns: Vec<Cooldown>,
    /// ticker -> outstanding order ids.
    pub orders: HashMap<String, Vec<String>>,
    /// Strategy-local state, opaque to the engine.
    #[serde(default)]
    pub strategy_state: serde_json::Value,
}

impl EngineState {
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            saved_at: Utc::now(),
            signal_queue: Vec::new(),
            positions: Vec::new(),
            closed_positions: Vec::new(),
            cooldowns: Vec::new(),
            orders: HashMap::new(),
            strategy_state: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Atomic file-backed store for [`EngineState`].
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub const DEFAULT_PATH: &'static str = "./engine-state.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the state atomically: serialize to a sibling temp file, then
    /// rename over the target.
    pub fn save(&self, state: &EngineState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");

        fs::write(&tmp_path, json).map_err(|e| {
            TradewindError::Persistence(format!("write {}: {e}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            TradewindError::Persistence(format!("rename to {}: {e}", self.path.display()))
        })?;

        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    /// Load the stored state, or an empty one when the file is absent.
    /// Unreadable or unmigratable files are backed up and replaced.
    pub fn load(&self) -> EngineState {
        if !self.path.exists() {
            info!("no state file, starting fresh");
            return EngineState::empty();
        }

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(path = %self.path.display(), "state read failed: {e}");
                self.backup_corrupt();
                return EngineState::empty();
            }
        };

        match self.parse_and_migrate(&raw) {
            Ok(state) => {
                info!(
                    saved_at = %state.saved_at,
                    signals = state.signal_queue.len(),
                    positions = state.positions.len(),
                    cooldowns = state.cooldowns.len(),
                    "state loaded"
                );
                state
            }
            Err(e) => {
                error!("state load failed, starting fresh: {e}");
                self.backup_corrupt();
                EngineState::empty()
            }
        }
    }

    /// Delete the state file. The next load starts empty.
    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            info!(path = %self.path.display(), "state file removed");
        }
        Ok(())
    }

    /// Parse the raw file, applying forward migrations by version number.
    fn parse_and_migrate(&self, raw: &str) -> Result<EngineState> {
        let mut value: serde_json::Value = serde_json::from_str(raw)?;

        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        match version.as_str() {
            STATE_VERSION => {}
            // 1.0.0 predates strategy_state; default it and carry on.
            "1.0.0" => {
                info!("migrating state 1.0.0 -> {STATE_VERSION}");
                let object = value.as_object_mut().ok_or_else(|| {
                    TradewindError::StateCorrupt("state root is not an object".to_string())
                })?;
                object.entry("strategy_state").or_insert_with(|| {
                    serde_json::Value::Object(serde_json::Map::new())
                });
                object.insert(
                    "version".to_string(),
                    serde_json::Value::String(STATE_VERSION.to_string()),
                );
            }
            other => {
                return Err(TradewindError::StateCorrupt(format!(
                    "unsupported state version '{other}'"
                )));
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Move an unusable state file aside so nothing is silently lost.
    fn backup_corrupt(&self) {
        let backup = self
            .path
            .with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
        match fs::rename(&self.path, &backup) {
            Ok(()) => warn!(backup = %backup.display(), "incompatible state file backed up"),
            Err(e) => error!("failed to back up state file: {e}"),
        }
    }
}
