//! File-backed engine-state store.
//!
//! One CBOR file per format. Saves write a temporary file, sync it and then
//! rename it over the previous snapshot, so a crash leaves either the old or
//! the new state on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use asap_core::{EngineState, Format};

use crate::error::{Result, StoreError};
use crate::traits::StateStore;

/// Engine-state store writing one file per format into a directory.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Use `dir` for state files, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the state files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, format: &Format) -> PathBuf {
        self.dir
            .join(format!("{}.state", hex::encode(format.as_str())))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, format: &Format) -> Result<Option<EngineState>> {
        let path = self.path_for(format);
        tokio::task::spawn_blocking(move || {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let state = ciborium::from_reader(bytes.as_slice())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(Some(state))
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn save(&self, state: &EngineState) -> Result<()> {
        let path = self.path_for(&state.format);
        let mut buf = Vec::new();
        ciborium::into_writer(state, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let tmp = path.with_extension("tmp");
            {
                let mut file = fs::File::create(&tmp)?;
                file.write_all(&buf)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)?;
            tracing::trace!(path = %path.display(), bytes = buf.len(), "saved engine state");
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
