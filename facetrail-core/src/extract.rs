//! Face detection + embedding behind one pluggable interface.

use crate::align::{self, AlignmentError};
use crate::config::Config;
use crate::detect::{BoundingBox, DetectionError, FaceDetector};
use crate::embed::{EmbedError, Embedding, FaceEmbedder};
use crate::runtime::OnnxRuntime;
use image::{imageops, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),
    #[error("Alignment error: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbedError),
}

/// One detected face and its embedding
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub confidence: f32,
}

/// Maps an RGB image to zero or more faces with embeddings.
///
/// Records are ordered most prominent first. Returning no records is the
/// normal "no face" answer; `Err` is reserved for inference failures, which
/// callers treat as an empty frame.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceRecord>, ExtractError>;

    /// Identifier of the model that produces the embeddings
    fn model_name(&self) -> &str;
}

struct Models {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

/// SCRFD + ArcFace-style extractor running on ONNX Runtime
pub struct OnnxExtractor {
    config: Config,
    runtime: OnnxRuntime,
    models: Option<Models>,
}

impl OnnxExtractor {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            runtime: OnnxRuntime::new(&config.runtime),
            models: None,
        }
    }

    /// Initialize ML models (lazy initialization)
    fn ensure_models_loaded(&mut self) -> Result<&mut Models, ExtractError> {
        let models = match self.models.take() {
            Some(models) => models,
            None => {
                log::info!("Loading face detection model...");
                let detector = FaceDetector::new(
                    &self.config.detection.model_path,
                    &self.runtime,
                    self.config.detection.confidence_threshold,
                )?;

                log::info!("Loading face embedding model...");
                let embedder = FaceEmbedder::new(
                    &self.config.embedding.model_path,
                    &self.runtime,
                    self.config.embedding.normalize,
                )?;

                Models { detector, embedder }
            }
        };

        Ok(self.models.insert(models))
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceRecord>, ExtractError> {
        let scale = self.config.detection.scale;
        let models = self.ensure_models_loaded()?;

        // Detect on a downscaled copy, align and embed from the full frame
        let faces = if scale < 1.0 {
            let (width, height) = image.dimensions();
            let small = imageops::resize(
                image,
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
                imageops::FilterType::Triangle,
            );
            let inverse = 1.0 / scale;
            models
                .detector
                .detect(&small)?
                .into_iter()
                .map(|mut face| {
                    face.bbox = face.bbox.scaled(inverse);
                    face.landmarks = face.landmarks.scaled(inverse);
                    face
                })
                .collect()
        } else {
            models.detector.detect(image)?
        };

        let mut records = Vec::with_capacity(faces.len());
        for face in faces {
            let aligned = align::align_face(image, &face.landmarks)?;
            let embedding = models.embedder.embed(&aligned)?;
            records.push(FaceRecord {
                bbox: face.bbox.clamp_to(image.width(), image.height()),
                embedding,
                confidence: face.confidence,
            });
        }

        log::debug!("Extracted {} face(s)", records.len());
        Ok(records)
    }

    fn model_name(&self) -> &str {
        &self.config.recognizer.model_name
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-in for the ONNX models.

    use super::*;
    use ndarray::Array1;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Embeds the mean RGB of the whole frame as a 3-D vector.
    /// Pure white frames have no face.
    pub struct FakeExtractor {
        pub calls: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    impl FakeExtractor {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                delay: None,
            }
        }

        /// Sleeps `delay` on every call, like a real model would take time
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new()
            }
        }
    }

    pub fn mean_color(image: &RgbImage) -> Embedding {
        let mut sums = [0f64; 3];
        for pixel in image.pixels() {
            for c in 0..3 {
                sums[c] += pixel[c] as f64;
            }
        }
        let n = (image.width() as f64 * image.height() as f64).max(1.0);
        Array1::from_iter(sums.iter().map(|s| (s / n / 255.0) as f32))
    }

    pub fn solid(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(16, 16, image::Rgb([r, g, b]))
    }

    impl EmbeddingExtractor for FakeExtractor {
        fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceRecord>, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if image.width() == 0 || image.height() == 0 {
                return Err(DetectionError::EmptyImage.into());
            }
            if image.pixels().all(|p| p.0 == [255, 255, 255]) {
                return Ok(Vec::new());
            }
            Ok(vec![FaceRecord {
                bbox: BoundingBox {
                    x: 1.0,
                    y: 2.0,
                    width: image.width() as f32 - 2.0,
                    height: image.height() as f32 - 4.0,
                },
                embedding: mean_color(image),
                confidence: 0.9,
            }])
        }

        fn model_name(&self) -> &str {
            "fake-mean-color"
        }
    }
}
