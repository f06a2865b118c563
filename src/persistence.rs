//! src/persistence.rs
//!
//! Atomic load/store of the serialized membership on disk. The state lives
//! in a single file; everything else about a node is rebuilt from gossip.

use crate::{error::Result, membership::Membership};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

const STATE_DIR: &str = "peer_service";
const STATE_FILE: &str = "cluster_state";

/// Stores the membership CRDT under the configured data directory. With no
/// data directory configured, every operation is a no-op.
#[derive(Clone, Debug)]
pub struct Store {
    path: Option<PathBuf>,
}

impl Store {
    pub fn new(data_dir: Option<&Path>) -> Self {
        Self {
            path: data_dir.map(|dir| dir.join(STATE_DIR).join(STATE_FILE)),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Loads the persisted membership, if any.
    ///
    /// A file that fails to decode is treated as absent: the caller reseeds
    /// a fresh membership and the gossip loop re-learns the cluster.
    pub fn load(&self) -> Result<Option<Membership>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        match fs::read(path) {
            Ok(bytes) => match Membership::decode(&bytes) {
                Ok(membership) => Ok(Some(membership)),
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        %error,
                        "Persisted cluster state is corrupt. Starting fresh."
                    );
                    Ok(None)
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Persists the membership, writing to a temporary file and renaming so
    /// a crash mid-write leaves either the old state or the new one, never
    /// a torn file.
    pub fn save(&self, membership: &Membership) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, membership.encode()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Removes the persisted state. A missing file is not an error.
    pub fn delete(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// The on-disk location of the state file, when persistence is enabled.
    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// --- Unit Tests ---
