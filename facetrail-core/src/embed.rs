use crate::align::ALIGNED_SIZE;
use crate::runtime::OnnxRuntime;
use image::RgbImage;
use ndarray::Array1;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected embedding output shape {0:?}")]
    InvalidShape(Vec<i64>),
}

/// Face embedding; length is fixed by the model that produced it
pub type Embedding = Array1<f32>;

/// Embedding model over aligned 112x112 RGB crops
pub struct FaceEmbedder {
    session: Session,
    normalize: bool,
}

impl FaceEmbedder {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        runtime: &OnnxRuntime,
        normalize: bool,
    ) -> Result<Self, EmbedError> {
        let session = runtime
            .create_session(model_path)
            .map_err(|e| EmbedError::ModelLoad(e.to_string()))?;

        Ok(Self { session, normalize })
    }

    pub fn embed(&mut self, aligned_face: &RgbImage) -> Result<Embedding, EmbedError> {
        let (width, height) = aligned_face.dimensions();
        if width != ALIGNED_SIZE || height != ALIGNED_SIZE {
            return Err(EmbedError::Inference(format!(
                "Input image must be {}x{}, got {}x{}",
                ALIGNED_SIZE, ALIGNED_SIZE, width, height
            )));
        }

        let input_value = Value::from_array(preprocess(aligned_face))
            .map_err(|e| EmbedError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|e| EmbedError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::Inference(format!("Failed to extract embedding: {}", e)))?;

        // [1, D]
        let dims: Vec<i64> = shape.iter().copied().collect();
        let dim = match dims.as_slice() {
            [1, d] if *d > 0 => *d as usize,
            _ => return Err(EmbedError::InvalidShape(dims)),
        };

        let values = data
            .get(..dim)
            .ok_or_else(|| EmbedError::InvalidShape(dims.clone()))?;
        let embedding = Array1::from_vec(values.to_vec());
        Ok(if self.normalize {
            normalize_embedding(embedding)
        } else {
            embedding
        })
    }
}

/// NCHW layout, (pixel - 127.5) / 128
fn preprocess(image: &RgbImage) -> ([usize; 4], Vec<f32>) {
    let size = ALIGNED_SIZE as usize;
    let mut input_data = Vec::with_capacity(size * size * 3);

    for c in 0..3 {
        for y in 0..ALIGNED_SIZE {
            for x in 0..ALIGNED_SIZE {
                let pixel = image.get_pixel(x, y);
                input_data.push((pixel[c] as f32 - 127.5) / 128.0);
            }
        }
    }

    ([1, 3, size, size], input_data)
}

/// L2 normalize an embedding vector
pub fn normalize_embedding(mut embedding: Embedding) -> Embedding {
    let norm = embedding.dot(&embedding).sqrt();
    if norm > 0.0 {
        embedding /= norm;
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_embedding() {
        let normalized = normalize_embedding(Array1::from_vec(vec![3.0, 4.0]));

        let norm = normalized.dot(&normalized).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let normalized = normalize_embedding(Array1::zeros(128));
        assert!(normalized.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_preprocess_layout() {
        let mut image = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
        image.put_pixel(0, 0, image::Rgb([255, 0, 128]));

        let (shape, data) = preprocess(&image);
        let plane = (ALIGNED_SIZE * ALIGNED_SIZE) as usize;
        assert_eq!(shape, [1, 3, 112, 112]);
        assert_eq!(data.len(), plane * 3);
        assert!((data[0] - 127.5 / 128.0).abs() < 1e-6);
        assert!((data[plane] + 127.5 / 128.0).abs() < 1e-6);
        assert!((data[2 * plane] - 0.5 / 128.0).abs() < 1e-6);
    }
}
