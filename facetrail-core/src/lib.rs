pub mod align;
pub mod annotate;
pub mod capture;
pub mod codec;
pub mod config;
pub mod detect;
pub mod embed;
pub mod enroll;
pub mod extract;
pub mod matcher;
pub mod recognize;
pub mod runtime;
pub mod service;
pub mod store;
pub mod video;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use image::RgbImage;
use thiserror::Error;

use config::{Config, RecognizerConfig};
use embed::Embedding;
use extract::{EmbeddingExtractor, FaceRecord, OnnxExtractor};
use matcher::MatchResult;
use store::IdentityStore;

pub use enroll::{EnrollOutcome, EnrollSummary};
pub use recognize::{Detection, FrameResult, RecognitionStream, Sighting, SightingLog, VideoSummary};
pub use service::SharedRecognizer;
pub use video::VideoSource;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Video error: {0}")]
    Video(video::VideoError),
    #[error("Storage error: {0}")]
    Storage(#[from] store::StorageError),
    #[error("Failed to persist face database to {}", .0.display())]
    Persistence(PathBuf),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<video::VideoError> for Error {
    fn from(e: video::VideoError) -> Self {
        match e {
            video::VideoError::NotFound(path) => Error::NotFound(path),
            other => Error::Video(other),
        }
    }
}

/// Face-identity recognition service.
///
/// Owns the enrolled identities, the parameters they were built with, and
/// the extractor. Shareable across threads: recognition only takes short read
/// locks, enrollment serializes its append + save sequence.
pub struct Recognizer {
    config: Config,
    extractor: Mutex<Box<dyn EmbeddingExtractor>>,
    store: RwLock<IdentityStore>,
    persist_lock: Mutex<()>,
}

impl Recognizer {
    /// Create a recognizer backed by the ONNX models named in `config`
    pub fn new(config: Config) -> Result<Self, Error> {
        let extractor = OnnxExtractor::new(&config);
        Self::with_extractor(config, Box::new(extractor))
    }

    /// Create a recognizer around any extractor, loading the database from disk
    pub fn with_extractor(
        mut config: Config,
        extractor: Box<dyn EmbeddingExtractor>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let store = match codec::load(&config.storage.database_path) {
            Some(state) => {
                let mut reconciled = config.clone();
                reconciled.recognizer = reconcile(&config.recognizer, &state.recognizer_config());
                match reconciled.validate() {
                    Ok(()) => config = reconciled,
                    Err(e) => log::warn!(
                        "Stored recognizer settings are invalid ({}); keeping configured values",
                        e
                    ),
                }
                state.into_store()
            }
            None => IdentityStore::new(),
        };

        if extractor.model_name() != config.recognizer.model_name {
            log::warn!(
                "Extractor model {:?} differs from database model {:?}; distances may be meaningless",
                extractor.model_name(),
                config.recognizer.model_name
            );
        }

        log::info!(
            "Recognizer ready: {} identities, threshold {}, model {}",
            store.len(),
            config.recognizer.threshold,
            config.recognizer.model_name
        );

        Ok(Self {
            config,
            extractor: Mutex::new(extractor),
            store: RwLock::new(store),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parameters in effect after reconciliation with the database
    pub fn recognizer_config(&self) -> &RecognizerConfig {
        &self.config.recognizer
    }

    pub fn database_path(&self) -> &Path {
        &self.config.storage.database_path
    }

    /// Names with at least one enrolled embedding
    pub fn names(&self) -> Vec<String> {
        self.read_store().names()
    }

    pub fn has_identities(&self) -> bool {
        !self.read_store().is_empty()
    }

    /// Number of reference embeddings stored for `name`
    pub fn embedding_count(&self, name: &str) -> usize {
        self.read_store().embeddings(name).len()
    }

    /// Point-in-time copy of the identity store
    pub fn snapshot(&self) -> IdentityStore {
        self.read_store().clone()
    }

    /// Nearest enrolled identity for one embedding
    pub fn match_embedding(&self, embedding: &Embedding) -> MatchResult {
        let store = self.read_store();
        matcher::find_best_match(embedding, &store, self.config.recognizer.threshold)
    }

    /// Write the current identities to disk
    pub fn save(&self) -> bool {
        let _guard = self.lock_persist();
        self.save_locked()
    }

    /// Remove one identity and persist the change; returns whether it existed
    pub fn remove(&self, name: &str) -> Result<bool, Error> {
        let _guard = self.lock_persist();
        if !self.write_store().remove(name) {
            return Ok(false);
        }
        log::info!("Removed identity {}", name);
        if self.save_locked() {
            Ok(true)
        } else {
            Err(Error::Persistence(self.database_path().to_path_buf()))
        }
    }

    /// Forget every identity and delete the database file. Safe to repeat.
    pub fn clear(&self) {
        let _guard = self.lock_persist();
        self.write_store().clear();
        codec::delete(self.database_path());
        log::info!("Cleared all registered persons");
    }

    /// Run the extractor; failures count as "no faces"
    pub(crate) fn extract(&self, image: &RgbImage) -> Vec<FaceRecord> {
        match self.lock_extractor().extract(image) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Face extraction failed, treating frame as empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Caller must hold `persist_lock`
    fn save_locked(&self) -> bool {
        let snapshot = self.snapshot();
        codec::save(self.database_path(), &snapshot, &self.config.recognizer)
    }

    fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.persist_lock.lock().unwrap_or_else(|poisoned| {
            log::warn!("Persist lock poisoned, continuing");
            poisoned.into_inner()
        })
    }

    fn lock_extractor(&self) -> MutexGuard<'_, Box<dyn EmbeddingExtractor>> {
        self.extractor.lock().unwrap_or_else(|poisoned| {
            log::warn!("Extractor lock poisoned, continuing");
            poisoned.into_inner()
        })
    }

    pub(crate) fn read_store(&self) -> RwLockReadGuard<'_, IdentityStore> {
        self.store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write_store(&self) -> RwLockWriteGuard<'_, IdentityStore> {
        self.store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stored parameters win over requested ones; embeddings are only comparable
/// under the model and threshold they were enrolled with.
fn reconcile(requested: &RecognizerConfig, persisted: &RecognizerConfig) -> RecognizerConfig {
    if persisted.threshold != requested.threshold {
        log::warn!(
            "Loaded threshold ({}) differs from provided threshold ({}). Using loaded value.",
            persisted.threshold,
            requested.threshold
        );
    }
    if persisted.model_name != requested.model_name {
        log::warn!(
            "Loaded model_name ({}) differs from provided model_name ({}). Using loaded value.",
            persisted.model_name,
            requested.model_name
        );
    }
    persisted.clone()
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::extract::testing::{solid, FakeExtractor};
    use ndarray::arr1;

    #[test]
    fn test_starts_empty_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        assert!(!recognizer.has_identities());
        assert!(recognizer.names().is_empty());
    }

    #[test]
    fn test_persisted_config_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.bin");
        let stored = RecognizerConfig {
            threshold: 0.6,
            model_name: "VGG-Face".to_string(),
        };
        let mut store = IdentityStore::new();
        store.append("Alice", arr1(&[0.1, 0.2, 0.3])).unwrap();
        assert!(codec::save(&path, &store, &stored));

        let recognizer =
            Recognizer::with_extractor(test_config(dir.path()), Box::new(FakeExtractor::new())).unwrap();
        assert_eq!(recognizer.recognizer_config(), &stored);
        assert_eq!(recognizer.names(), vec!["Alice".to_string()]);
    }

    #[test]
    fn test_invalid_stored_settings_are_not_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.bin");
        let mut store = IdentityStore::new();
        store.append("Alice", arr1(&[0.1, 0.2, 0.3])).unwrap();

        for stored in [
            RecognizerConfig { threshold: f32::NAN, model_name: "VGG-Face".to_string() },
            RecognizerConfig { threshold: -0.5, model_name: "VGG-Face".to_string() },
            RecognizerConfig { threshold: 0.6, model_name: String::new() },
        ] {
            assert!(codec::save(&path, &store, &stored));
            let (recognizer, _) = fake_recognizer(dir.path());
            assert_eq!(recognizer.recognizer_config(), &test_config(dir.path()).recognizer);
            assert_eq!(recognizer.names(), vec!["Alice".to_string()]);
        }
    }

    #[test]
    fn test_corrupt_database_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("faces.bin"), b"\x00\x01garbage").unwrap();

        let (recognizer, _) = fake_recognizer(dir.path());
        assert!(!recognizer.has_identities());
        assert_eq!(recognizer.recognizer_config().threshold, 0.1);
    }

    #[test]
    fn test_clear_twice_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        assert!(recognizer.enroll_one(&solid(200, 10, 10), "Alice"));
        assert!(recognizer.database_path().exists());

        recognizer.clear();
        assert!(!recognizer.has_identities());
        assert!(!recognizer.database_path().exists());

        recognizer.clear();
        assert!(!recognizer.has_identities());
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        recognizer.enroll_one(&solid(200, 10, 10), "Alice");
        recognizer.enroll_one(&solid(10, 200, 10), "Bob");

        assert!(recognizer.remove("Alice").unwrap());
        assert!(!recognizer.remove("Alice").unwrap());

        let (reloaded, _) = fake_recognizer(dir.path());
        assert_eq!(reloaded.names(), vec!["Bob".to_string()]);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (recognizer, _) = fake_recognizer(dir.path());
            recognizer.enroll_one(&solid(200, 10, 10), "Alice");
            recognizer.enroll_one(&solid(190, 20, 10), "Alice");
        }

        let (reloaded, _) = fake_recognizer(dir.path());
        assert_eq!(reloaded.embedding_count("Alice"), 2);
        let result = reloaded.match_embedding(&extract::testing::mean_color(&solid(200, 10, 10)));
        assert_eq!(result.name, "Alice");
    }

    #[test]
    fn test_video_not_found_maps_to_not_found() {
        let err: Error = video::VideoError::NotFound(PathBuf::from("/x.mp4")).into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
