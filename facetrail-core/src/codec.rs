//! Single-file binary persistence for the identity store.
//!
//! The blob carries the recognizer parameters next to the embeddings so a
//! database is never compared under a different model or threshold than the
//! one it was built with.

use crate::config::RecognizerConfig;
use crate::embed::Embedding;
use crate::store::IdentityStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"FTDB";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// On-disk layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    magic: [u8; 4],
    version: u32,
    pub person_encodings: BTreeMap<String, Vec<Vec<f32>>>,
    pub threshold: f32,
    pub model_name: String,
    pub saved_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(store: &IdentityStore, config: &RecognizerConfig) -> Self {
        let person_encodings = store
            .iter()
            .map(|(name, embeddings)| {
                let vectors = embeddings.iter().map(|e| e.to_vec()).collect();
                (name.to_string(), vectors)
            })
            .collect();

        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            person_encodings,
            threshold: config.threshold,
            model_name: config.model_name.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn recognizer_config(&self) -> RecognizerConfig {
        RecognizerConfig {
            threshold: self.threshold,
            model_name: self.model_name.clone(),
        }
    }

    pub fn into_store(self) -> IdentityStore {
        let identities = self
            .person_encodings
            .into_iter()
            .map(|(name, vectors)| {
                let embeddings = vectors.into_iter().map(Embedding::from_vec).collect();
                (name, embeddings)
            })
            .collect();
        IdentityStore::from_map(identities)
    }
}

/// Write `store` and `config` to `path`. Failures are logged, never raised.
pub fn save(path: &Path, store: &IdentityStore, config: &RecognizerConfig) -> bool {
    match try_save(path, &PersistedState::new(store, config)) {
        Ok(()) => {
            log::debug!(
                "Saved {} identities ({} embeddings) to {}",
                store.len(),
                store.embedding_count(),
                path.display()
            );
            true
        }
        Err(e) => {
            log::error!("Failed to save face database {}: {}", path.display(), e);
            false
        }
    }
}

/// Write to a sibling temp file, then rename over the target
fn try_save(path: &Path, state: &PersistedState) -> Result<(), CodecError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let data = bincode::serialize(state)?;

    let tmp_path = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }

    // Set permissions to 600 (owner read/write only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        CodecError::Io(e)
    })
}

/// `faces.bin` -> `faces.bin.tmp`; never equal to `path` itself
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read a database. Missing, corrupt or incompatible files all yield `None`.
pub fn load(path: &Path) -> Option<PersistedState> {
    if !path.exists() {
        log::debug!("No face database at {}, starting empty", path.display());
        return None;
    }

    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            log::warn!("Failed to read face database {}: {}", path.display(), e);
            return None;
        }
    };

    let state: PersistedState = match bincode::deserialize(&data) {
        Ok(state) => state,
        Err(e) => {
            log::warn!("Ignoring unreadable face database {}: {}", path.display(), e);
            return None;
        }
    };

    if state.magic != MAGIC {
        log::warn!("Ignoring {}: not a face database", path.display());
        return None;
    }
    if state.version != FORMAT_VERSION {
        log::warn!(
            "Ignoring {}: format version {} is not supported (expected {})",
            path.display(),
            state.version,
            FORMAT_VERSION
        );
        return None;
    }
    if let Some(name) = inconsistent_dimension(&state.person_encodings) {
        log::warn!(
            "Ignoring {}: embeddings for {:?} differ in length from the rest",
            path.display(),
            name
        );
        return None;
    }

    log::info!(
        "Loaded {} registered person(s) from {}",
        state.person_encodings.len(),
        path.display()
    );
    Some(state)
}

fn inconsistent_dimension(encodings: &BTreeMap<String, Vec<Vec<f32>>>) -> Option<&str> {
    let mut expected = None;
    for (name, vectors) in encodings {
        for vector in vectors {
            match expected {
                None => expected = Some(vector.len()),
                Some(len) if len != vector.len() => return Some(name.as_str()),
                Some(_) => {}
            }
        }
    }
    None
}

/// Remove the database file; a missing file is fine
pub fn delete(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::info!("Deleted face database {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to delete face database {}: {}", path.display(), e),
    }
}
