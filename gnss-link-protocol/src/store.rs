//! Bonded-device persistence
//!
//! The engine treats the store as ground truth for "is this device
//! paired" and re-reads it for every decision.

use crate::device::DeviceId;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persistence collaborator for bonding state
pub trait BondStore: Send + Sync + Debug {
    fn bonded_ids(&self) -> Result<BTreeSet<DeviceId>>;

    fn set_bonded_ids(&mut self, ids: &BTreeSet<DeviceId>) -> Result<()>;

    fn last_connected_id(&self) -> Result<Option<DeviceId>>;

    fn set_last_connected_id(&mut self, id: Option<DeviceId>) -> Result<()>;

    /// Whether `id` is in the bonded set
    fn is_bonded(&self, id: &DeviceId) -> Result<bool> {
        Ok(self.bonded_ids()?.contains(id))
    }

    /// Read-modify-write insert
    fn add_bonded(&mut self, id: DeviceId) -> Result<()> {
        let mut ids = self.bonded_ids()?;
        if ids.insert(id) {
            self.set_bonded_ids(&ids)?;
        }
        Ok(())
    }

    /// Read-modify-write removal
    fn remove_bonded(&mut self, id: &DeviceId) -> Result<()> {
        let mut ids = self.bonded_ids()?;
        if ids.remove(id) {
            self.set_bonded_ids(&ids)?;
        }
        Ok(())
    }
}

/// Persisted document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondState {
    #[serde(default)]
    pub bonded: BTreeSet<DeviceId>,
    #[serde(default)]
    pub last_connected: Option<DeviceId>,
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryBondStore {
    state: BondState,
}

impl MemoryBondStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with bonded identities
    pub fn with_bonded(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            state: BondState {
                bonded: ids.into_iter().collect(),
                last_connected: None,
            },
        }
    }
}

impl BondStore for MemoryBondStore {
    fn bonded_ids(&self) -> Result<BTreeSet<DeviceId>> {
        Ok(self.state.bonded.clone())
    }

    fn set_bonded_ids(&mut self, ids: &BTreeSet<DeviceId>) -> Result<()> {
        self.state.bonded = ids.clone();
        Ok(())
    }

    fn last_connected_id(&self) -> Result<Option<DeviceId>> {
        Ok(self.state.last_connected)
    }

    fn set_last_connected_id(&mut self, id: Option<DeviceId>) -> Result<()> {
        self.state.last_connected = id;
        Ok(())
    }
}

/// JSON file store
///
/// Every read goes to disk. Writes land in a sibling temp file that is
/// renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonBondStore {
    path: PathBuf,
}

impl JsonBondStore {
    /// Open a store at `path`, creating parent directories
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BondState> {
        if !self.path.exists() {
            debug!("Bond store {} does not exist yet", self.path.display());
            return Ok(BondState::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BondState::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            warn!("Bond store {} is corrupt: {}", self.path.display(), e);
            ProtocolError::Storage(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, state: &BondState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved bond store to {}", self.path.display());
        Ok(())
    }
}

impl BondStore for JsonBondStore {
    fn bonded_ids(&self) -> Result<BTreeSet<DeviceId>> {
        Ok(self.load()?.bonded)
    }

    fn set_bonded_ids(&mut self, ids: &BTreeSet<DeviceId>) -> Result<()> {
        let mut state = self.load()?;
        state.bonded = ids.clone();
        self.save(&state)
    }

    fn last_connected_id(&self) -> Result<Option<DeviceId>> {
        Ok(self.load()?.last_connected)
    }

    fn set_last_connected_id(&mut self, id: Option<DeviceId>) -> Result<()> {
        let mut state = self.load()?;
        state.last_connected = id;
        self.save(&state)
    }
}
