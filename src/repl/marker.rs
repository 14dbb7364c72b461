//! Durable recovery marker: position, bootstrap flag and safety state.
//!
//! The marker is one JSON document replaced atomically (write-new + fsync +
//! rename), so the position tuple and the safety flags can never be observed
//! torn across a crash.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Gtid, Seqno};

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("recovery marker corrupted at {path:?}: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported recovery marker version {got}")]
    UnsupportedVersion { got: u32 },
}

/// The persisted tuple exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    pub uuid: Uuid,
    pub seqno: Seqno,
    pub safe_to_bootstrap: bool,
}

impl Marker {
    pub fn gtid(&self) -> Gtid {
        Gtid::new(self.uuid, self.seqno)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct MarkerFile {
    version: u32,
    uuid: Uuid,
    seqno: i64,
    safe_to_bootstrap: bool,
    safe: bool,
    corrupt: bool,
}

impl Default for MarkerFile {
    fn default() -> Self {
        MarkerFile {
            version: MARKER_VERSION,
            uuid: Uuid::nil(),
            seqno: Seqno::UNDEFINED.get(),
            safe_to_bootstrap: true,
            safe: true,
            corrupt: false,
        }
    }
}

/// Durable recovery marker store. A missing file reads as the undefined
/// position with `safe = true`.
#[derive(Debug)]
pub struct MarkerStore {
    path: PathBuf,
    state: MarkerFile,
}

impl MarkerStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MarkerError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => {
                let state: MarkerFile =
                    serde_json::from_slice(&bytes).map_err(|source| MarkerError::Corrupted {
                        path: path.clone(),
                        source,
                    })?;
                if state.version != MARKER_VERSION {
                    return Err(MarkerError::UnsupportedVersion { got: state.version });
                }
                state
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => MarkerFile::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(MarkerStore { path, state })
    }

    pub fn get(&self) -> Marker {
        Marker {
            uuid: self.state.uuid,
            seqno: Seqno::new(self.state.seqno),
            safe_to_bootstrap: self.state.safe_to_bootstrap,
        }
    }

    /// Install a new position tuple. A fresh authoritative position
    /// supersedes a previously recorded corrupt sentinel.
    pub fn set(
        &mut self,
        uuid: Uuid,
        seqno: Seqno,
        safe_to_bootstrap: bool,
    ) -> Result<(), MarkerError> {
        self.state.uuid = uuid;
        self.state.seqno = seqno.get();
        self.state.safe_to_bootstrap = safe_to_bootstrap;
        self.state.corrupt = false;
        self.persist()
    }

    /// Declare that data may change without the seqno advancing; recovery
    /// after a crash in this window must demand a full snapshot.
    pub fn mark_unsafe(&mut self) -> Result<(), MarkerError> {
        if !self.state.safe {
            return Ok(());
        }
        self.state.safe = false;
        self.persist()
    }

    pub fn mark_safe(&mut self) -> Result<(), MarkerError> {
        if self.state.safe {
            return Ok(());
        }
        self.state.safe = true;
        self.persist()
    }

    /// Record that apply failed mid-transfer: the local state is not usable
    /// as an incremental base any more.
    pub fn mark_corrupt(&mut self) -> Result<(), MarkerError> {
        self.state.corrupt = true;
        self.state.seqno = Seqno::UNDEFINED.get();
        self.persist()
    }

    pub fn is_safe(&self) -> bool {
        self.state.safe
    }

    pub fn is_corrupt(&self) -> bool {
        self.state.corrupt
    }

    /// True when recovery must not trust the persisted position and a full
    /// snapshot is required on the next join.
    pub fn requires_full_snapshot(&self) -> bool {
        !self.state.safe || self.state.corrupt
    }

    fn persist(&self) -> Result<(), MarkerError> {
        let tmp = tmp_path(&self.path);
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            serde_json::to_writer(&mut file, &self.state).map_err(|source| {
                MarkerError::Corrupted {
                    path: tmp.clone(),
                    source,
                }
            })?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_parent_dir(path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}
