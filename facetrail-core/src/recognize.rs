//! Recognition over still images and frame streams.

use crate::annotate;
use crate::detect::BoundingBox;
use crate::matcher::{self, MatchResult};
use crate::video::{FfmpegWriter, FrameSource, VideoError, VideoSource};
use crate::{Error, Recognizer};
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A located face and who it matched
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Enrolled name, or [`matcher::UNKNOWN`]
    pub name: String,
    pub distance: f32,
}

impl Detection {
    /// `None` for boxes that round to nothing
    fn new(bbox: &BoundingBox, result: MatchResult) -> Option<Self> {
        let width = bbox.width.round();
        let height = bbox.height.round();
        if !(width >= 1.0 && height >= 1.0) {
            return None;
        }
        Some(Self {
            x: bbox.x.round() as i32,
            y: bbox.y.round() as i32,
            width: width as u32,
            height: height as u32,
            name: result.name,
            distance: result.distance,
        })
    }

    pub fn is_known(&self) -> bool {
        self.name != matcher::UNKNOWN
    }
}

/// One frame of a recognition stream
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// 1-based position in the stream
    pub index: u64,
    pub frame: RgbImage,
    pub detections: Vec<Detection>,
    /// False when `detections` were carried over from an earlier frame
    pub fresh: bool,
}

/// Lazy per-frame recognition over a [`FrameSource`].
///
/// The extractor runs on the first frame and on every `frame_skip`-th frame;
/// the frames in between reuse the last detections. Dropping the stream drops
/// the source, which ends its decode session.
pub struct RecognitionStream<'a, S: FrameSource> {
    recognizer: &'a Recognizer,
    source: S,
    frame_skip: u64,
    index: u64,
    last: Vec<Detection>,
    done: bool,
}

impl<'a, S: FrameSource> RecognitionStream<'a, S> {
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> Iterator for RecognitionStream<'_, S> {
    type Item = Result<FrameResult, VideoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        self.index += 1;
        let fresh = self.index == 1 || self.index % self.frame_skip == 0;
        if fresh {
            self.last = self.recognizer.recognize_image(&frame);
            log::debug!("Frame {}: {} detection(s)", self.index, self.last.len());
        }

        Some(Ok(FrameResult {
            index: self.index,
            frame,
            detections: self.last.clone(),
            fresh,
        }))
    }
}

/// Where and when one name appeared in a video
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sighting {
    pub name: String,
    pub first_frame: u64,
    pub last_frame: u64,
    pub frames_seen: u64,
}

/// Accumulates per-name sightings across frames
#[derive(Debug, Clone, Default)]
pub struct SightingLog {
    sightings: BTreeMap<String, Sighting>,
}

impl SightingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count each name at most once per frame
    pub fn record(&mut self, index: u64, detections: &[Detection]) {
        let mut seen: Vec<&str> = detections.iter().map(|d| d.name.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();

        for name in seen {
            let sighting = self
                .sightings
                .entry(name.to_string())
                .or_insert_with(|| Sighting {
                    name: name.to_string(),
                    first_frame: index,
                    last_frame: index,
                    frames_seen: 0,
                });
            sighting.last_frame = index;
            sighting.frames_seen += 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Sighting> {
        self.sightings.get(name)
    }

    /// Sightings ordered by first appearance, then name
    pub fn into_sightings(self) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self.sightings.into_values().collect();
        sightings.sort_by(|a, b| a.first_frame.cmp(&b.first_frame).then_with(|| a.name.cmp(&b.name)));
        sightings
    }
}

/// Totals from a processed video
#[derive(Debug, Clone, Serialize)]
pub struct VideoSummary {
    pub frames: u64,
    /// Frames the extractor actually ran on
    pub analyzed: u64,
    pub sightings: Vec<Sighting>,
}

impl Recognizer {
    /// Detect and identify every face in `image`, unknowns included
    pub fn recognize_image(&self, image: &RgbImage) -> Vec<Detection> {
        self.extract(image)
            .into_iter()
            .filter_map(|record| {
                let result = self.match_embedding(&record.embedding);
                Detection::new(&record.bbox, result)
            })
            .collect()
    }

    pub fn recognize_image_path(&self, path: &Path) -> Result<Vec<Detection>, Error> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let image = image::open(path)?.to_rgb8();
        Ok(self.recognize_image(&image))
    }

    /// Copy of `image` with recognized faces drawn on it
    pub fn annotate_image(&self, image: &RgbImage) -> RgbImage {
        annotate::annotated(image, &self.recognize_image(image))
    }

    /// Open `source` and recognize its frames lazily
    pub fn recognize_video(
        &self,
        source: &VideoSource,
        frame_skip: u32,
    ) -> Result<RecognitionStream<'_, Box<dyn FrameSource + Send>>, Error> {
        check_frame_skip(frame_skip)?;
        let decoder = source.open(&self.config().video)?;
        self.recognize_frames(decoder, frame_skip)
    }

    /// Recognition stream over an already opened source
    pub fn recognize_frames<S: FrameSource>(
        &self,
        source: S,
        frame_skip: u32,
    ) -> Result<RecognitionStream<'_, S>, Error> {
        check_frame_skip(frame_skip)?;
        Ok(RecognitionStream {
            recognizer: self,
            source,
            frame_skip: u64::from(frame_skip),
            index: 0,
            last: Vec::new(),
            done: false,
        })
    }

    /// Recognize `source`, draw the results and encode them to `output`.
    ///
    /// `max_frames` bounds live sources, which never end on their own.
    pub fn annotate_video(
        &self,
        source: &VideoSource,
        frame_skip: u32,
        output: &Path,
        max_frames: Option<u64>,
    ) -> Result<VideoSummary, Error> {
        let stream = self.recognize_video(source, frame_skip)?;
        let info = stream.source().info();
        let mut writer = FfmpegWriter::create(output, info, &self.config().video)?;

        log::info!(
            "Writing annotated video to {} ({}x{} @ {:.2} fps)",
            output.display(),
            info.width,
            info.height,
            info.output_fps()
        );

        let summary = summarize(stream, max_frames, |result| {
            let mut frame = result.frame;
            annotate::draw_detections(&mut frame, &result.detections);
            writer.write_frame(&frame)
        })?;

        let written = writer.finish()?;
        log::info!(
            "Annotated {} frames ({} analyzed), {} name(s) seen",
            written,
            summary.analyzed,
            summary.sightings.len()
        );
        Ok(summary)
    }
}

fn check_frame_skip(frame_skip: u32) -> Result<(), Error> {
    if frame_skip == 0 {
        return Err(Error::InvalidArgument("frame skip must be at least 1".to_string()));
    }
    Ok(())
}

/// Drain `stream` into a [`VideoSummary`], handing each frame to `sink`.
///
/// A decode error after at least one frame ends the video early; one on the
/// very first frame is returned.
pub fn summarize<S, F>(
    stream: RecognitionStream<'_, S>,
    max_frames: Option<u64>,
    mut sink: F,
) -> Result<VideoSummary, VideoError>
where
    S: FrameSource,
    F: FnMut(FrameResult) -> Result<(), VideoError>,
{
    let mut sightings = SightingLog::new();
    let mut frames = 0;
    let mut analyzed = 0;

    if max_frames == Some(0) {
        return Ok(VideoSummary { frames, analyzed, sightings: Vec::new() });
    }

    for result in stream {
        let result = match result {
            Ok(result) => result,
            Err(e) if frames > 0 => {
                log::warn!("Stopping after {} frames: {}", frames, e);
                break;
            }
            Err(e) => return Err(e),
        };

        frames += 1;
        if result.fresh {
            analyzed += 1;
        }
        sightings.record(result.index, &result.detections);
        sink(result)?;

        if max_frames.is_some_and(|max| frames >= max) {
            break;
        }
    }

    Ok(VideoSummary {
        frames,
        analyzed,
        sightings: sightings.into_sightings(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testing::solid;
    use crate::testing::fake_recognizer;
    use crate::video::testing::VecSource;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_empty_store_reports_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());

        let detections = recognizer.recognize_image(&solid(40, 80, 120));
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].name, matcher::UNKNOWN);
        assert!(detections[0].distance.is_infinite());
        assert_eq!(
            (detections[0].x, detections[0].y, detections[0].width, detections[0].height),
            (1, 2, 14, 12)
        );
    }

    #[test]
    fn test_blank_image_has_no_detections() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        assert!(recognizer.recognize_image(&solid(255, 255, 255)).is_empty());
    }

    #[test]
    fn test_extraction_error_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        assert!(recognizer.recognize_image(&RgbImage::new(0, 0)).is_empty());
    }

    #[test]
    fn test_known_and_unknown_faces() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        recognizer.enroll_one(&solid(200, 20, 20), "Alice");

        let alice = recognizer.recognize_image(&solid(202, 20, 20));
        assert_eq!(alice[0].name, "Alice");
        assert!(alice[0].is_known());

        let stranger = recognizer.recognize_image(&solid(20, 20, 200));
        assert_eq!(stranger[0].name, matcher::UNKNOWN);
        assert!(stranger[0].distance.is_finite());
    }

    #[test]
    fn test_recognize_image_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());

        let missing = recognizer.recognize_image_path(&dir.path().join("missing.png"));
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let junk = dir.path().join("junk.png");
        std::fs::write(&junk, b"not an image").unwrap();
        assert!(matches!(recognizer.recognize_image_path(&junk), Err(Error::Image(_))));
    }

    #[test]
    fn test_frame_skip_reuses_detections() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, calls) = fake_recognizer(dir.path());
        recognizer.enroll_one(&solid(200, 20, 20), "Alice");
        calls.store(0, Ordering::SeqCst);

        let frames = (0..12).map(|_| solid(200, 20, 20)).collect();
        let results: Vec<FrameResult> = recognizer
            .recognize_frames(VecSource::new(frames), 5)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(results.len(), 12);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let fresh: Vec<u64> = results.iter().filter(|r| r.fresh).map(|r| r.index).collect();
        assert_eq!(fresh, vec![1, 5, 10]);
        assert!(results.iter().all(|r| r.detections.len() == 1));
        assert_eq!(results[2].detections, results[0].detections);
    }

    #[test]
    fn test_stream_fuses_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        let source = VecSource::with_results(vec![
            Ok(solid(10, 10, 10)),
            Err(VideoError::Decode("bad".to_string())),
            Ok(solid(10, 10, 10)),
        ]);

        let mut stream = recognizer.recognize_frames(source, 1).unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_dropping_stream_releases_source() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        let source = VecSource::new(vec![solid(1, 1, 1); 10]);
        let released = source.released.clone();

        let mut stream = recognizer.recognize_frames(source, 5).unwrap();
        assert!(stream.next().is_some());
        assert!(!released.load(Ordering::SeqCst));
        drop(stream);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_frame_skip_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        let result = recognizer.recognize_frames(VecSource::new(Vec::new()), 0);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_summarize_tracks_sightings() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _) = fake_recognizer(dir.path());
        recognizer.enroll_one(&solid(200, 20, 20), "Alice");
        recognizer.enroll_one(&solid(20, 200, 20), "Bob");

        let mut frames = vec![solid(200, 20, 20); 3];
        frames.extend(vec![solid(20, 200, 20); 3]);
        frames.push(solid(255, 255, 255));

        let stream = recognizer.recognize_frames(VecSource::new(frames), 1).unwrap();
        let mut written = 0;
        let summary = summarize(stream, None, |_| {
            written += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!((summary.frames, summary.analyzed, written), (7, 7, 7));
        let names: Vec<&str> = summary.sightings.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
        assert_eq!(
            summary.sightings[1],
            Sighting {
                name: "Bob".to_string(),
                first_frame: 4,
                last_frame: 6,
                frames_seen: 3,
            }
        );
    }

    #[test]
    fn test_summarize_respects_max_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, calls) = fake_recognizer(dir.path());
        let stream = recognizer
            .recognize_frames(VecSource::new(vec![solid(5, 5, 5); 20]), 2)
            .unwrap();

        let summary = summarize(stream, Some(4), |_| Ok(())).unwrap();
        assert_eq!(summary.frames, 4);
        // frames 1, 2, 4
        assert_eq!(summary.analyzed, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_sighting_log_counts_name_once_per_frame() {
        let detection = |name: &str| Detection {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
            name: name.to_string(),
            distance: 0.0,
        };
        let mut log = SightingLog::new();
        log.record(3, &[detection("Alice"), detection("Alice")]);
        log.record(9, &[detection("Alice")]);

        let alice = log.get("Alice").unwrap();
        assert_eq!((alice.first_frame, alice.last_frame, alice.frames_seen), (3, 9, 2));
    }

    #[test]
    #[ignore] // Requires ffmpeg on PATH
    fn test_annotate_video_writes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        let output = dir.path().join("annotated").join("out.mp4");
        crate::video::testing::generate_clip(&clip);
        let (recognizer, calls) = fake_recognizer(dir.path());

        let summary = recognizer
            .annotate_video(&VideoSource::File(clip), 5, &output, None)
            .unwrap();

        assert_eq!((summary.frames, summary.analyzed), (10, 3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.sightings.len(), 1);
        assert_eq!(summary.sightings[0].name, matcher::UNKNOWN);

        let (written, frames) = crate::video::testing::inspect(&output);
        assert_eq!((written.width, written.height), (64, 48));
        assert!((written.fps - 10.0).abs() < 0.01);
        assert_eq!(frames, 10);
    }

    #[test]
    #[ignore] // Requires ffmpeg on PATH
    fn test_annotate_video_respects_max_frames() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        let output = dir.path().join("short.mp4");
        crate::video::testing::generate_clip(&clip);
        let (recognizer, _) = fake_recognizer(dir.path());

        let summary = recognizer
            .annotate_video(&VideoSource::File(clip), 1, &output, Some(4))
            .unwrap();
        assert_eq!(summary.frames, 4);
        assert_eq!(crate::video::testing::inspect(&output).1, 4);
    }
}
