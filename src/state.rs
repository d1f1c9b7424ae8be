//! Durable bridge progress: the last processed EVM height and the Stellar
//! account paging cursor, persisted as a single JSON file.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Persisted state file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeState {
    #[serde(default)]
    pub stellar_cursor: String,
    #[serde(default)]
    pub last_height: u64,
}

/// File-backed cursor store. Saves are atomic against crashes: the new state
/// is written to a temp file next to the target and renamed over it.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. An absent file yields zero height and an
    /// empty cursor.
    pub fn load(&self) -> Result<BridgeState> {
        if !self.path.exists() {
            return Ok(BridgeState::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .wrap_err_with(|| format!("Failed to read state file {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .wrap_err_with(|| format!("Failed to parse state file {}", self.path.display()))
    }

    pub fn load_height(&self) -> Result<u64> {
        Ok(self.load()?.last_height)
    }

    pub fn load_stellar_cursor(&self) -> Result<String> {
        Ok(self.load()?.stellar_cursor)
    }

    /// Persist a new EVM height. Heights never move backward; a lower value
    /// is ignored so a late save cannot undo progress. Rewinding is only
    /// possible through [`CursorStore::rewind_height`].
    pub fn save_height(&self, height: u64) -> Result<()> {
        let mut state = self.load()?;
        if height < state.last_height {
            return Ok(());
        }
        state.last_height = height;
        self.write(&state)
    }

    /// Operator-requested rewind (`RESCAN_HEIGHT`). This is the only path
    /// that moves the persisted height backward.
    pub fn rewind_height(&self, height: u64) -> Result<()> {
        let mut state = self.load()?;
        state.last_height = height;
        self.write(&state)
    }

    pub fn save_stellar_cursor(&self, cursor: &str) -> Result<()> {
        let mut state = self.load()?;
        state.stellar_cursor = cursor.to_string();
        self.write(&state)
    }

    fn write(&self, state: &BridgeState) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_string_pretty(state).wrap_err("Failed to encode state")?;
        std::fs::write(&tmp, raw)
            .wrap_err_with(|| format!("Failed to write state file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("Failed to replace state file {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CursorStore {
        CursorStore::new(dir.path().join("node.json"))
    }

    #[test]
    fn test_absent_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let state = store.load().unwrap();
        assert_eq!(state.last_height, 0);
        assert_eq!(state.stellar_cursor, "");
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save_height(1003).unwrap();
        store.save_stellar_cursor("168178954735206400").unwrap();
        assert_eq!(store.load_height().unwrap(), 1003);
        assert_eq!(store.load_stellar_cursor().unwrap(), "168178954735206400");
    }

    #[test]
    fn test_saving_one_field_keeps_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save_height(42).unwrap();
        store.save_stellar_cursor("cursor-1").unwrap();
        assert_eq!(store.load_height().unwrap(), 42);
    }

    #[test]
    fn test_height_never_moves_backward() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save_height(1000).unwrap();
        store.save_height(900).unwrap();
        assert_eq!(store.load_height().unwrap(), 1000);
    }

    #[test]
    fn test_rewind_moves_height_backward() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save_height(1000).unwrap();
        store.rewind_height(900).unwrap();
        assert_eq!(store.load_height().unwrap(), 900);
    }

    #[test]
    fn test_file_matches_documented_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save_height(7).unwrap();
        store.save_stellar_cursor("c").unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["last_height"], 7);
        assert_eq!(value["stellar_cursor"], "c");
    }
}
