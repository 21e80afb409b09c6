use crate::detect::FacialLandmarks;
use image::{Rgb, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Degenerate landmarks, cannot estimate transform")]
    DegenerateLandmarks,
    #[error("Singular transform")]
    SingularTransform,
}

/// Side length of the aligned face crop fed to the embedder
pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace reference landmark positions inside a 112x112 crop
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// x' = a*x - b*y + tx, y' = b*x + a*y + ty
#[derive(Debug, Clone, Copy, PartialEq)]
struct SimilarityTransform {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit mapping `src` points onto `dst` points
    fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len()) as f32;
        let (mut sx, mut sy, mut su, mut sv) = (0.0, 0.0, 0.0, 0.0);
        let (mut sxx_yy, mut sux_vy, mut svx_uy) = (0.0, 0.0, 0.0);

        for (&(x, y), &(u, v)) in src.iter().zip(dst) {
            sx += x;
            sy += y;
            su += u;
            sv += v;
            sxx_yy += x * x + y * y;
            sux_vy += u * x + v * y;
            svx_uy += v * x - u * y;
        }

        let denom = n * sxx_yy - sx * sx - sy * sy;
        if denom.abs() < 1e-6 {
            return None;
        }

        let a = (n * sux_vy - su * sx - sv * sy) / denom;
        let b = (n * svx_uy + su * sy - sv * sx) / denom;
        Some(Self {
            a,
            b,
            tx: (su - a * sx + b * sy) / n,
            ty: (sv - b * sx - a * sy) / n,
        })
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-9 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }
}

/// Warp the face described by `landmarks` onto the reference 112x112 layout
pub fn align_face(image: &RgbImage, landmarks: &FacialLandmarks) -> Result<RgbImage, AlignmentError> {
    let forward = SimilarityTransform::estimate(&landmarks.points(), &REFERENCE_LANDMARKS)
        .ok_or(AlignmentError::DegenerateLandmarks)?;
    let backward = forward.inverse().ok_or(AlignmentError::SingularTransform)?;

    let mut output = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    for (x, y, pixel) in output.enumerate_pixels_mut() {
        let source = backward.apply((x as f32, y as f32));
        *pixel = sample_bilinear(image, source);
    }
    Ok(output)
}

/// Bilinear lookup; black outside the image
fn sample_bilinear(image: &RgbImage, (x, y): (f32, f32)) -> Rgb<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    if x0 < 0.0 || y0 < 0.0 || x0 + 1.0 >= image.width() as f32 || y0 + 1.0 >= image.height() as f32 {
        return Rgb([0, 0, 0]);
    }

    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as u32, y0 as u32);
    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x0 + 1, y0);
    let p01 = image.get_pixel(x0, y0 + 1);
    let p11 = image.get_pixel(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t = SimilarityTransform::estimate(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 1.0).abs() < 1e-3);
        assert!(t.b.abs() < 1e-3);
        assert!(t.tx.abs() < 0.1);
        assert!(t.ty.abs() < 0.1);
    }

    #[test]
    fn test_translation_and_inverse() {
        let src: Vec<(f32, f32)> = REFERENCE_LANDMARKS
            .iter()
            .map(|&(x, y)| (x + 10.0, y + 20.0))
            .collect();
        let t = SimilarityTransform::estimate(&src, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.tx + 10.0).abs() < 0.5);
        assert!((t.ty + 20.0).abs() < 0.5);

        let back = t.inverse().unwrap().apply(t.apply((50.0, 60.0)));
        assert!((back.0 - 50.0).abs() < 1e-2);
        assert!((back.1 - 60.0).abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let point = (10.0, 10.0);
        let landmarks = FacialLandmarks {
            left_eye: point,
            right_eye: point,
            nose: point,
            left_mouth: point,
            right_mouth: point,
        };
        let image = RgbImage::new(64, 64);
        assert!(matches!(
            align_face(&image, &landmarks),
            Err(AlignmentError::DegenerateLandmarks)
        ));
    }

    #[test]
    fn test_aligned_output_size() {
        let image = RgbImage::from_pixel(200, 200, Rgb([90, 90, 90]));
        let landmarks = FacialLandmarks {
            left_eye: REFERENCE_LANDMARKS[0],
            right_eye: REFERENCE_LANDMARKS[1],
            nose: REFERENCE_LANDMARKS[2],
            left_mouth: REFERENCE_LANDMARKS[3],
            right_mouth: REFERENCE_LANDMARKS[4],
        };
        let aligned = align_face(&image, &landmarks).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([90, 90, 90]));
    }
}
