use crate::config::RuntimeConfig;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Model file not found: {0}")]
    ModelMissing(String),
    #[error("Failed to create session: {0}")]
    SessionCreation(String),
}

/// ONNX Runtime session factory (CPU execution provider)
#[derive(Debug, Clone)]
pub struct OnnxRuntime {
    intra_threads: usize,
}

impl OnnxRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            intra_threads: config.intra_threads.max(1),
        }
    }

    /// Create a new session from a model file
    pub fn create_session<P: AsRef<Path>>(&self, model_path: P) -> Result<Session, RuntimeError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(RuntimeError::ModelMissing(model_path.display().to_string()));
        }

        let session = Session::builder()
            .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| {
                RuntimeError::SessionCreation(format!(
                    "Failed to load model from {:?}: {}",
                    model_path, e
                ))
            })?;

        log::info!(
            "Loaded ONNX model {:?} ({} intra-op threads)",
            model_path,
            self.intra_threads
        );
        Ok(session)
    }
}

impl Default for OnnxRuntime {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}
