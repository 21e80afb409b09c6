//! Enrollment: learn reference embeddings for a name from images or video.

use crate::store::StorageError;
use crate::video::{FfmpegDecoder, FrameSource};
use crate::{Error, Recognizer};
use image::RgbImage;
use serde::Serialize;
use std::path::Path;

/// Result of enrolling a single image
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    /// Embedding appended; `persisted` is false if the database write failed
    Enrolled { persisted: bool },
    /// The extractor found no face
    NoFace,
    /// A face was found but the store refused the embedding
    Rejected(String),
}

impl EnrollOutcome {
    pub fn is_enrolled(&self) -> bool {
        matches!(self, EnrollOutcome::Enrolled { .. })
    }
}

/// Counts for a multi-image or video enrollment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrollSummary {
    pub success: usize,
    pub failed: usize,
    /// False when embeddings were learned but could not be written to disk
    pub persisted: bool,
}

enum Failure {
    NoFace,
    Rejected(StorageError),
}

impl Recognizer {
    /// Append the first detected face in `image` to `name` without saving
    fn add_first_face(&self, image: &RgbImage, name: &str) -> Result<(), Failure> {
        let record = self
            .extract(image)
            .into_iter()
            .next()
            .ok_or(Failure::NoFace)?;

        self.write_store()
            .append(name, record.embedding)
            .map_err(Failure::Rejected)
    }

    /// Enroll the most prominent face in `image` under `name` and persist
    pub fn enroll_image(&self, image: &RgbImage, name: &str) -> EnrollOutcome {
        let _guard = self.lock_persist();
        match self.add_first_face(image, name) {
            Ok(()) => {
                let persisted = self.save_locked();
                log::info!("Registered a face for {}", name);
                EnrollOutcome::Enrolled { persisted }
            }
            Err(Failure::NoFace) => {
                log::debug!("No face found while enrolling {}", name);
                EnrollOutcome::NoFace
            }
            Err(Failure::Rejected(e)) => {
                log::warn!("Rejected embedding for {}: {}", name, e);
                EnrollOutcome::Rejected(e.to_string())
            }
        }
    }

    /// `true` when a face was found and enrolled
    pub fn enroll_one(&self, image: &RgbImage, name: &str) -> bool {
        self.enroll_image(image, name).is_enrolled()
    }

    /// Enroll from an image file. A missing file is an error; an unreadable
    /// or faceless image is `Ok(false)`.
    pub fn enroll_image_path(&self, path: &Path, name: &str) -> Result<bool, Error> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        match image::open(path) {
            Ok(img) => Ok(self.enroll_one(&img.to_rgb8(), name)),
            Err(e) => {
                log::warn!("Could not load image {}: {}", path.display(), e);
                Ok(false)
            }
        }
    }

    /// Enroll every image in order, persisting once at the end.
    ///
    /// Other writers (`clear`, `remove`, enrollment) wait for the whole batch.
    pub fn enroll_batch(&self, images: &[RgbImage], name: &str) -> EnrollSummary {
        log::info!("Registering {} with {} images...", name, images.len());
        let _guard = self.lock_persist();
        let mut summary = EnrollSummary::default();
        for (i, image) in images.iter().enumerate() {
            self.tally(&mut summary, self.add_first_face(image, name), name, i + 1);
        }
        self.finish_batch(summary, name)
    }

    /// File-based batch; missing or unreadable files count as failures
    pub fn enroll_batch_paths<P: AsRef<Path>>(&self, paths: &[P], name: &str) -> EnrollSummary {
        log::info!("Registering {} with {} images...", name, paths.len());
        let _guard = self.lock_persist();
        let mut summary = EnrollSummary::default();
        for (i, path) in paths.iter().enumerate() {
            let path = path.as_ref();
            let result = match image::open(path) {
                Ok(img) => self.add_first_face(&img.to_rgb8(), name),
                Err(e) => {
                    log::warn!("Could not load image {}: {}", path.display(), e);
                    Err(Failure::NoFace)
                }
            };
            self.tally(&mut summary, result, name, i + 1);
        }
        self.finish_batch(summary, name)
    }

    /// Enroll from sampled frames of a video file.
    ///
    /// Frames are counted from 1 and every `frame_interval`-th frame is tried,
    /// up to `max_frames` attempts. Failing to open the video is an error.
    pub fn enroll_from_video(
        &self,
        path: &Path,
        name: &str,
        frame_interval: u32,
        max_frames: Option<u32>,
    ) -> Result<EnrollSummary, Error> {
        if frame_interval == 0 {
            return Err(Error::InvalidArgument("frame interval must be at least 1".to_string()));
        }
        log::info!(
            "Registering {} from video {} (interval {}, max frames {})",
            name,
            path.display(),
            frame_interval,
            max_frames.map_or("unlimited".to_string(), |m| m.to_string())
        );
        let mut decoder = FfmpegDecoder::open(path, &self.config().video)?;
        self.enroll_from_source(&mut decoder, name, frame_interval, max_frames)
    }

    /// Source-generic form of [`Recognizer::enroll_from_video`]
    pub fn enroll_from_source<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        name: &str,
        frame_interval: u32,
        max_frames: Option<u32>,
    ) -> Result<EnrollSummary, Error> {
        if frame_interval == 0 {
            return Err(Error::InvalidArgument("frame interval must be at least 1".to_string()));
        }

        let _guard = self.lock_persist();
        let interval = u64::from(frame_interval);
        let limit = max_frames.map(u64::from);
        let mut summary = EnrollSummary::default();
        let mut frame_index: u64 = 0;
        let mut processed: u64 = 0;

        while limit.map_or(true, |max| processed < max) {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Stopping enrollment at frame {}: {}", frame_index + 1, e);
                    break;
                }
            };
            frame_index += 1;
            if frame_index % interval != 0 {
                continue;
            }

            processed += 1;
            let result = self.add_first_face(&frame, name);
            self.tally(&mut summary, result, name, frame_index as usize);
        }

        log::info!(
            "{} successful, {} failed out of {} processed frames",
            summary.success,
            summary.failed,
            processed
        );
        Ok(self.finish_batch(summary, name))
    }

    fn tally(&self, summary: &mut EnrollSummary, result: Result<(), Failure>, name: &str, item: usize) {
        match result {
            Ok(()) => summary.success += 1,
            Err(Failure::NoFace) => {
                log::debug!("Item {} for {}: no face detected", item, name);
                summary.failed += 1;
            }
            Err(Failure::Rejected(e)) => {
                log::warn!("Item {} for {}: {}", item, name, e);
                summary.failed += 1;
            }
        }
    }

    /// Persist once if anything was learned. Caller must hold `persist_lock`.
    fn finish_batch(&self, mut summary: EnrollSummary, name: &str) -> EnrollSummary {
        summary.persisted = summary.success == 0 || self.save_locked();
        log::info!(
            "Registered {}: {} successful, {} failed",
            name,
            summary.success,
            summary.failed
        );
        summary
    }
}
