use crate::config::CameraConfig;
use crate::video::{FrameSource, VideoError, VideoInfo};
use image::{ImageBuffer, RgbImage};
use thiserror::Error;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as V4lCapture;
use v4l::{Device, FourCC};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open camera device: {0}")]
    DeviceOpen(String),
    #[error("Failed to capture frame: {0}")]
    Capture(String),
    #[error("Frame conversion failed: {0}")]
    Conversion(String),
}

/// Buffers mapped per capture session
const STREAM_BUFFERS: u32 = 4;

/// Live V4L2 capture session.
///
/// One mmap stream is kept open for the life of the session. It shares the
/// device handle and stops capture (STREAMOFF) when the camera is dropped.
pub struct Camera {
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    fps: f32,
    format: FourCC,
}

impl Camera {
    pub fn new(config: &CameraConfig) -> Result<Self, CaptureError> {
        let device_num = parse_device_index(&config.device).ok_or_else(|| {
            CaptureError::DeviceOpen(format!("not a V4L2 device: {}", config.device))
        })?;

        let device = Device::new(device_num)
            .map_err(|e| CaptureError::DeviceOpen(format!("{}: {}", config.device, e)))?;

        let mut format = device
            .format()
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to get format: {}", e)))?;
        format.width = config.width;
        format.height = config.height;

        // Prefer MJPEG if available, fallback to YUYV
        for fourcc in [FourCC::new(b"MJPG"), FourCC::new(b"YUYV")] {
            format.fourcc = fourcc;
            if device.set_format(&format).is_ok() {
                break;
            }
        }

        let actual = device
            .format()
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to verify format: {}", e)))?;

        let fps = device
            .params()
            .ok()
            .map(|params| params.interval)
            .filter(|interval| interval.numerator > 0)
            .map(|interval| interval.denominator as f32 / interval.numerator as f32)
            .unwrap_or(0.0);

        let stream = MmapStream::with_buffers(&device, v4l::buffer::Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to create stream: {}", e)))?;

        log::info!(
            "Camera {} initialized: {}x{} {} @ {:.1} fps",
            config.device,
            actual.width,
            actual.height,
            actual.fourcc,
            fps
        );

        Ok(Self {
            stream,
            width: actual.width,
            height: actual.height,
            fps,
            format: actual.fourcc,
        })
    }

    /// Grab the next frame from the running stream, converted to RGB
    pub fn capture_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| CaptureError::Capture(e.to_string()))?;

        match self.format.str() {
            Ok("MJPG") => decode_mjpeg(buf),
            Ok("YUYV") => decode_yuyv(buf, self.width, self.height),
            _ => Err(CaptureError::Conversion(format!(
                "Unsupported pixel format: {}",
                self.format
            ))),
        }
    }
}

impl FrameSource for Camera {
    fn info(&self) -> VideoInfo {
        VideoInfo {
            fps: self.fps,
            width: self.width,
            height: self.height,
        }
    }

    /// Live capture never ends on its own; the consumer stops pulling
    fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        Ok(Some(self.capture_frame()?))
    }
}

/// "/dev/video2" or "2" -> 2
fn parse_device_index(device: &str) -> Option<usize> {
    device
        .strip_prefix("/dev/video")
        .unwrap_or(device)
        .parse()
        .ok()
}

fn decode_mjpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| CaptureError::Conversion(format!("MJPEG decode failed: {}", e)))?;
    Ok(img.to_rgb8())
}

/// YUYV packs two pixels in four bytes: Y0 U Y1 V
fn decode_yuyv(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let (w, h) = (width as usize, height as usize);
    if data.len() < w * h * 2 {
        return Err(CaptureError::Conversion("YUYV buffer too small".to_string()));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for chunk in data[..w * h * 2].chunks_exact(4) {
        let u = chunk[1] as i32 - 128;
        let v = chunk[3] as i32 - 128;
        for luma in [chunk[0] as i32, chunk[2] as i32] {
            rgb.push((luma + ((1436 * v) >> 10)).clamp(0, 255) as u8);
            rgb.push((luma - ((354 * u + 732 * v) >> 10)).clamp(0, 255) as u8);
            rgb.push((luma + ((1814 * u) >> 10)).clamp(0, 255) as u8);
        }
    }

    ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| CaptureError::Conversion("Failed to create RGB image".to_string()))
}
