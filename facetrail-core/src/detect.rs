use crate::runtime::OnnxRuntime;
use image::{imageops, RgbImage};
use ort::session::Session;
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Empty input image")]
    EmptyImage,
}

const INPUT_SIZE: u32 = 640;

/// SCRFD feature pyramid strides
const FEATURE_STRIDES: [usize; 3] = [8, 16, 32];
const NUM_ANCHORS: usize = 2;
const NMS_IOU_THRESHOLD: f32 = 0.4;

/// Face rectangle in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }

    /// Intersect with the `width` x `height` image rectangle
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let x1 = self.x.clamp(0.0, width as f32);
        let y1 = self.y.clamp(0.0, height as f32);
        let x2 = (self.x + self.width).clamp(0.0, width as f32);
        let y2 = (self.y + self.height).clamp(0.0, height as f32);
        BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacialLandmarks {
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
    pub nose: (f32, f32),
    pub left_mouth: (f32, f32),
    pub right_mouth: (f32, f32),
}

impl FacialLandmarks {
    pub fn points(&self) -> [(f32, f32); 5] {
        [
            self.left_eye,
            self.right_eye,
            self.nose,
            self.left_mouth,
            self.right_mouth,
        ]
    }

    pub fn scaled(&self, factor: f32) -> FacialLandmarks {
        let s = |(x, y): (f32, f32)| (x * factor, y * factor);
        FacialLandmarks {
            left_eye: s(self.left_eye),
            right_eye: s(self.right_eye),
            nose: s(self.nose),
            left_mouth: s(self.left_mouth),
            right_mouth: s(self.right_mouth),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: FacialLandmarks,
    pub confidence: f32,
}

/// SCRFD face detector
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
}

impl FaceDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        runtime: &OnnxRuntime,
        confidence_threshold: f32,
    ) -> Result<Self, DetectionError> {
        let session = runtime
            .create_session(model_path)
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?;

        Ok(Self {
            session,
            confidence_threshold,
        })
    }

    /// Detect faces, most prominent first. An empty result is not an error.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectionError::EmptyImage);
        }

        let (input_tensor, scale_x, scale_y) = Self::preprocess(image);

        let input_value = Value::from_array(input_tensor)
            .map_err(|e| DetectionError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs!["input.1" => input_value])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        // Outputs come grouped: scores for every stride, then boxes, then keypoints
        if outputs.len() != 9 {
            return Err(DetectionError::Inference(format!(
                "Expected 9 SCRFD outputs, got {}",
                outputs.len()
            )));
        }

        let mut detections = Vec::new();

        for (stride_idx, &stride) in FEATURE_STRIDES.iter().enumerate() {
            let feat_size = INPUT_SIZE as usize / stride;
            let anchors = Self::generate_anchors(stride, feat_size);

            let (_, score_data) = outputs[stride_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("scores, stride {}: {}", stride, e)))?;
            let (_, bbox_data) = outputs[stride_idx + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("boxes, stride {}: {}", stride, e)))?;
            let (_, kps_data) = outputs[stride_idx + 6]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("keypoints, stride {}: {}", stride, e)))?;

            for (anchor_idx, &anchor) in anchors.iter().enumerate() {
                for anchor_num in 0..NUM_ANCHORS {
                    let idx = anchor_idx * NUM_ANCHORS + anchor_num;
                    let Some(&score) = score_data.get(idx) else {
                        continue;
                    };
                    if !score.is_finite() || score < self.confidence_threshold {
                        continue;
                    }

                    let (Some(bbox_pred), Some(kps_pred)) = (
                        bbox_data.get(idx * 4..idx * 4 + 4),
                        kps_data.get(idx * 10..idx * 10 + 10),
                    ) else {
                        continue;
                    };

                    let bbox = Self::decode_bbox(anchor, bbox_pred, stride as f32);
                    let landmarks = Self::decode_landmarks(anchor, kps_pred, stride as f32);

                    detections.push(DetectedFace {
                        bbox: BoundingBox {
                            x: bbox.x / scale_x,
                            y: bbox.y / scale_y,
                            width: bbox.width / scale_x,
                            height: bbox.height / scale_y,
                        },
                        landmarks: Self::unscale_landmarks(&landmarks, scale_x, scale_y),
                        confidence: score,
                    });
                }
            }
        }

        log::trace!("{} candidate faces before NMS", detections.len());

        let mut detections = Self::nms(detections, NMS_IOU_THRESHOLD);

        // Prefer larger, more confident faces
        detections.sort_by(|a, b| {
            let score_a = a.confidence * a.bbox.area().sqrt();
            let score_b = b.confidence * b.bbox.area().sqrt();
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(detections)
    }

    fn generate_anchors(stride: usize, feat_size: usize) -> Vec<(f32, f32)> {
        let mut anchors = Vec::with_capacity(feat_size * feat_size);
        for i in 0..feat_size {
            for j in 0..feat_size {
                anchors.push((j as f32 * stride as f32, i as f32 * stride as f32));
            }
        }
        anchors
    }

    /// Box predictions are distances to the four edges, in stride units
    fn decode_bbox(anchor: (f32, f32), pred: &[f32], stride: f32) -> BoundingBox {
        let (cx, cy) = anchor;
        let x1 = cx - pred[0] * stride;
        let y1 = cy - pred[1] * stride;
        let x2 = cx + pred[2] * stride;
        let y2 = cy + pred[3] * stride;

        BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    fn decode_landmarks(anchor: (f32, f32), pred: &[f32], stride: f32) -> FacialLandmarks {
        let (cx, cy) = anchor;
        let p = |i: usize| (cx + pred[i * 2] * stride, cy + pred[i * 2 + 1] * stride);
        FacialLandmarks {
            left_eye: p(0),
            right_eye: p(1),
            nose: p(2),
            left_mouth: p(3),
            right_mouth: p(4),
        }
    }

    fn unscale_landmarks(landmarks: &FacialLandmarks, scale_x: f32, scale_y: f32) -> FacialLandmarks {
        let u = |(x, y): (f32, f32)| (x / scale_x, y / scale_y);
        FacialLandmarks {
            left_eye: u(landmarks.left_eye),
            right_eye: u(landmarks.right_eye),
            nose: u(landmarks.nose),
            left_mouth: u(landmarks.left_mouth),
            right_mouth: u(landmarks.right_mouth),
        }
    }

    /// Resize to the model input and lay out as NCHW, normalized with mean 127.5 / std 128
    fn preprocess(image: &RgbImage) -> (([usize; 4], Vec<f32>), f32, f32) {
        let (orig_width, orig_height) = image.dimensions();

        let resized = imageops::resize(
            image,
            INPUT_SIZE,
            INPUT_SIZE,
            imageops::FilterType::Triangle,
        );

        let scale_x = INPUT_SIZE as f32 / orig_width as f32;
        let scale_y = INPUT_SIZE as f32 / orig_height as f32;

        let mut input_data = Vec::with_capacity((INPUT_SIZE * INPUT_SIZE * 3) as usize);
        for c in 0..3 {
            for y in 0..INPUT_SIZE {
                for x in 0..INPUT_SIZE {
                    let pixel = resized.get_pixel(x, y);
                    input_data.push((pixel[c] as f32 - 127.5) / 128.0);
                }
            }
        }

        let shape = [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
        ((shape, input_data), scale_x, scale_y)
    }

    /// Non-Maximum Suppression
    fn nms(mut detections: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
        detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut keep: Vec<DetectedFace> = Vec::new();
        for candidate in detections {
            if keep.iter().all(|kept| kept.bbox.iou(&candidate.bbox) <= iou_threshold) {
                keep.push(candidate);
            }
        }
        keep
    }
}
