//! Video decode and encode sessions.
//!
//! Files are decoded by an `ffmpeg` child process emitting raw `rgb24`
//! frames on stdout; annotated output is encoded by a second child reading
//! raw frames on stdin. Each session owns its child and reaps it on drop.

use crate::capture::{Camera, CaptureError};
use crate::config::{CameraConfig, VideoConfig};
use image::RgbImage;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Video source not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to open video source {source_name}: {reason}")]
    Open { source_name: String, reason: String },
    #[error("Failed to decode frame: {0}")]
    Decode(String),
    #[error("Failed to encode frame: {0}")]
    Encode(String),
    #[error("Camera error: {0}")]
    Capture(#[from] CaptureError),
}

/// Stream properties needed to configure a writer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    /// Frames per second; 0.0 when the source does not report it
    pub fps: f32,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    /// Frame rate for writers, falling back to 30 when unknown
    pub fn output_fps(&self) -> f32 {
        if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            30.0
        }
    }
}

/// Sequential RGB frame producer. `Ok(None)` marks the end of the stream.
pub trait FrameSource {
    fn info(&self) -> VideoInfo;

    fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn info(&self) -> VideoInfo {
        (**self).info()
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        (**self).next_frame()
    }
}

/// Where recognition frames come from
#[derive(Debug, Clone)]
pub enum VideoSource {
    File(PathBuf),
    Camera(CameraConfig),
}

impl VideoSource {
    /// Start a fresh decode session
    pub fn open(&self, config: &VideoConfig) -> Result<Box<dyn FrameSource + Send>, VideoError> {
        match self {
            VideoSource::File(path) => Ok(Box::new(FfmpegDecoder::open(path, config)?)),
            VideoSource::Camera(camera) => Ok(Box::new(Camera::new(camera)?)),
        }
    }
}

/// Decode session for a video file
pub struct FfmpegDecoder {
    child: Child,
    stdout: Option<ChildStdout>,
    info: VideoInfo,
    frame_len: usize,
    finished: bool,
}

impl FfmpegDecoder {
    pub fn open(path: &Path, config: &VideoConfig) -> Result<Self, VideoError> {
        if !path.exists() {
            return Err(VideoError::NotFound(path.to_path_buf()));
        }

        let info = probe(path, &config.ffprobe)?;
        if info.width == 0 || info.height == 0 {
            return Err(open_error(path, "stream reports zero frame size"));
        }

        log::debug!(
            "Decoding {} ({}x{} @ {:.2} fps)",
            path.display(),
            info.width,
            info.height,
            info.fps
        );

        let mut child = Command::new(&config.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| open_error(path, &format!("failed to spawn {}: {}", config.ffmpeg, e)))?;

        let stdout = child.stdout.take();
        Ok(Self {
            child,
            stdout,
            info,
            frame_len: info.width as usize * info.height as usize * 3,
            finished: false,
        })
    }

    fn finish(&mut self) -> Result<(), VideoError> {
        self.finished = true;
        self.stdout = None;
        let status = self
            .child
            .wait()
            .map_err(|e| VideoError::Decode(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(VideoError::Decode(format!("ffmpeg exited with {}", status)))
        }
    }
}

impl FrameSource for FfmpegDecoder {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        if self.finished {
            return Ok(None);
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buffer = vec![0u8; self.frame_len];
        let filled = read_full(stdout, &mut buffer).map_err(|e| VideoError::Decode(e.to_string()))?;

        if filled == 0 {
            self.finish()?;
            return Ok(None);
        }
        if filled < self.frame_len {
            self.finished = true;
            return Err(VideoError::Decode(format!(
                "truncated frame: {} of {} bytes",
                filled, self.frame_len
            )));
        }

        RgbImage::from_raw(self.info.width, self.info.height, buffer)
            .map(Some)
            .ok_or_else(|| VideoError::Decode("frame buffer size mismatch".to_string()))
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.stdout = None;
        if !self.finished {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Read until `buffer` is full or the stream ends; returns bytes read
fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn open_error(path: &Path, reason: &str) -> VideoError {
    VideoError::Open {
        source_name: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Read display size and frame rate of the first video stream.
///
/// ffmpeg applies the stream's rotation when decoding, so a 90° rotation
/// swaps the coded width and height.
fn probe(path: &Path, ffprobe: &str) -> Result<VideoInfo, VideoError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate:stream_tags=rotate:stream_side_data=rotation",
            "-of",
            "default=noprint_wrappers=1",
        ])
        .arg(path)
        .output()
        .map_err(|e| open_error(path, &format!("failed to execute {}: {}", ffprobe, e)))?;

    if !output.status.success() {
        return Err(open_error(path, &format!("{} exited with {}", ffprobe, output.status)));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&text).ok_or_else(|| {
        open_error(path, &format!("unexpected probe output {:?}", text.trim()))
    })
}

/// Parses `key=value` lines: width, height, r_frame_rate and an optional
/// rotation (`rotation=` side data or the older `TAG:rotate=` tag)
fn parse_probe_output(text: &str) -> Option<VideoInfo> {
    let mut width = None;
    let mut height = None;
    let mut fps = 0.0;
    let mut rotation = 0i64;

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "width" => width = value.parse::<u32>().ok(),
            "height" => height = value.parse::<u32>().ok(),
            "r_frame_rate" => fps = parse_rate(value),
            "rotation" | "TAG:rotate" => {
                if let Ok(degrees) = value.parse::<f64>() {
                    rotation = degrees.round() as i64;
                }
            }
            _ => {}
        }
    }

    let (width, height) = (width?, height?);
    let (width, height) = if rotation.rem_euclid(180) == 90 {
        (height, width)
    } else {
        (width, height)
    };
    Some(VideoInfo { fps, width, height })
}

fn parse_rate(rate: &str) -> f32 {
    let rate = rate.trim();
    match rate.split_once('/') {
        Some((num, den)) => match (num.parse::<f32>(), den.parse::<f32>()) {
            (Ok(num), Ok(den)) if den > 0.0 => num / den,
            _ => 0.0,
        },
        None => rate.parse().unwrap_or(0.0),
    }
}

/// Encode session writing an H.264 mp4
pub struct FfmpegWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    info: VideoInfo,
    frames: u64,
}

impl FfmpegWriter {
    pub fn create(path: &Path, info: VideoInfo, config: &VideoConfig) -> Result<Self, VideoError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| VideoError::Encode(format!("create {}: {}", parent.display(), e)))?;
        }

        let size = format!("{}x{}", info.width, info.height);
        let rate = format!("{:.3}", info.output_fps());

        let mut child = Command::new(&config.ffmpeg)
            .args(["-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", size.as_str(), "-r", rate.as_str(), "-i", "pipe:0"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VideoError::Encode(format!("failed to spawn {}: {}", config.ffmpeg, e)))?;

        let stdin = child.stdin.take();
        Ok(Self {
            child,
            stdin,
            info,
            frames: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        if frame.dimensions() != (self.info.width, self.info.height) {
            return Err(VideoError::Encode(format!(
                "frame is {}x{}, writer expects {}x{}",
                frame.width(),
                frame.height(),
                self.info.width,
                self.info.height
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VideoError::Encode("writer already finished".to_string()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| VideoError::Encode(e.to_string()))?;
        self.frames += 1;
        Ok(())
    }

    /// Close the input and wait for the encoder; returns frames written
    pub fn finish(mut self) -> Result<u64, VideoError> {
        self.stdin = None;
        let status = self
            .child
            .wait()
            .map_err(|e| VideoError::Encode(e.to_string()))?;
        if !status.success() {
            return Err(VideoError::Encode(format!("ffmpeg exited with {}", status)));
        }
        Ok(self.frames)
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        // Closing stdin lets ffmpeg flush whatever was written
        if self.stdin.take().is_some() {
            let _ = self.child.wait();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let info = parse_probe_output("width=1280\nheight=720\nr_frame_rate=30000/1001\n").unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert!((info.fps - 29.97).abs() < 0.01);

        let no_rate = parse_probe_output("width=640\nheight=480\nr_frame_rate=0/0").unwrap();
        assert_eq!(no_rate.fps, 0.0);
        assert_eq!(no_rate.output_fps(), 30.0);

        assert!(parse_probe_output("").is_none());
        assert!(parse_probe_output("width=N/A\nheight=480\nr_frame_rate=25/1").is_none());
    }

    #[test]
    fn test_parse_probe_output_swaps_rotated_streams() {
        let side_data = "width=1920\nheight=1080\nr_frame_rate=30/1\nrotation=-90\n";
        let info = parse_probe_output(side_data).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));

        let tag = "width=1920\nheight=1080\nr_frame_rate=30/1\nTAG:rotate=270\n";
        assert_eq!(parse_probe_output(tag).unwrap().width, 1080);

        let upside_down = "width=1920\nheight=1080\nr_frame_rate=30/1\nrotation=180\n";
        assert_eq!(parse_probe_output(upside_down).unwrap().width, 1920);
    }

    #[test]
    fn test_parse_plain_rate() {
        assert_eq!(parse_rate("25"), 25.0);
        assert_eq!(parse_rate("garbage"), 0.0);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let result = FfmpegDecoder::open(Path::new("/nonexistent/clip.mp4"), &VideoConfig::default());
        assert!(matches!(result, Err(VideoError::NotFound(_))));
    }

    #[test]
    fn test_read_full_reports_short_reads() {
        let mut reader: &[u8] = &[1, 2, 3];
        let mut buffer = [0u8; 5];
        assert_eq!(read_full(&mut reader, &mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);
    }

    #[test]
    #[ignore] // Requires ffmpeg on PATH
    fn test_decode_generated_clip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        testing::generate_clip(&path);

        let mut decoder = FfmpegDecoder::open(&path, &VideoConfig::default()).unwrap();
        assert_eq!((decoder.info().width, decoder.info().height), (64, 48));

        let mut count = 0;
        while let Some(frame) = decoder.next_frame().unwrap() {
            assert_eq!(frame.dimensions(), (64, 48));
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    #[ignore] // Requires ffmpeg on PATH
    fn test_decode_rotated_clip_is_upright() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.mp4");
        let rotated = dir.path().join("rotated.mp4");
        testing::generate_clip(&plain);
        let status = Command::new("ffmpeg")
            .args(["-y", "-v", "error", "-i"])
            .arg(&plain)
            .args(["-c", "copy", "-metadata:s:v", "rotate=90"])
            .arg(&rotated)
            .status()
            .unwrap();
        assert!(status.success());

        let mut decoder = FfmpegDecoder::open(&rotated, &VideoConfig::default()).unwrap();
        assert_eq!((decoder.info().width, decoder.info().height), (48, 64));

        let mut count = 0;
        while let Some(frame) = decoder.next_frame().unwrap() {
            assert_eq!(frame.dimensions(), (48, 64));
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    #[ignore] // Requires ffmpeg on PATH
    fn test_writer_defaults_unknown_fps_to_30() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("written.mp4");
        let info = VideoInfo {
            fps: 0.0,
            width: 32,
            height: 24,
        };

        let mut writer = FfmpegWriter::create(&path, info, &VideoConfig::default()).unwrap();
        let frame = RgbImage::from_pixel(32, 24, image::Rgb([10, 120, 200]));
        for _ in 0..3 {
            writer.write_frame(&frame).unwrap();
        }
        assert!(writer.write_frame(&RgbImage::new(8, 8)).is_err());
        assert_eq!(writer.finish().unwrap(), 3);

        let (written, frames) = testing::inspect(&path);
        assert_eq!((written.width, written.height), (32, 24));
        assert!((written.fps - 30.0).abs() < 0.01);
        assert_eq!(frames, 3);
    }

    #[test]
    #[ignore] // Requires ffmpeg on PATH
    fn test_dropped_writer_still_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.mp4");
        let info = VideoInfo {
            fps: 10.0,
            width: 32,
            height: 24,
        };
        {
            let mut writer = FfmpegWriter::create(&path, info, &VideoConfig::default()).unwrap();
            writer.write_frame(&RgbImage::new(32, 24)).unwrap();
            writer.write_frame(&RgbImage::new(32, 24)).unwrap();
        }
        assert_eq!(testing::inspect(&path).1, 2);
    }
}
