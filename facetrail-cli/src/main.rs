use anyhow::Context;
use clap::{Parser, Subcommand};
use facetrail_core::config::Config;
use facetrail_core::recognize::summarize;
use facetrail_core::{Detection, Recognizer, VideoSource};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "facetrail")]
#[command(about = "Face enrollment and recognition for images, videos and cameras", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use this config file instead of the default search path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from one or more images
    Enroll {
        /// Name to enroll under
        name: String,
        /// Image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Enroll a person from sampled frames of a video
    EnrollVideo {
        name: String,
        video: PathBuf,
        /// Sample every Nth frame (defaults to [video] enroll_frame_interval)
        #[arg(short, long)]
        interval: Option<u32>,
        /// Stop after this many sampled frames
        #[arg(short, long)]
        max_frames: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Recognize faces in an image
    Recognize {
        image: PathBuf,
        /// Save an annotated copy of the image
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Recognize faces in a video file or the camera
    Scan {
        /// Video file (omit with --camera)
        #[arg(required_unless_present = "camera", conflicts_with = "camera")]
        video: Option<PathBuf>,
        /// Read from the configured camera
        #[arg(long)]
        camera: bool,
        /// Rerun detection every Nth frame (defaults to [video] frame_skip)
        #[arg(short, long)]
        skip: Option<u32>,
        /// Write an annotated mp4
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Stop after this many frames
        #[arg(short, long)]
        max_frames: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// List enrolled people
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove an enrolled person
    Remove {
        name: String,
    },
    /// Remove everyone and delete the database
    Clear,
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { name, images, json } => cmd_enroll(config, name, images, json),
        Commands::EnrollVideo {
            name,
            video,
            interval,
            max_frames,
            json,
        } => cmd_enroll_video(config, name, video, interval, max_frames, json),
        Commands::Recognize { image, output, json } => cmd_recognize(config, image, output, json),
        Commands::Scan {
            video,
            camera,
            skip,
            output,
            max_frames,
            json,
        } => {
            let source = match video {
                Some(path) if !camera => VideoSource::File(path),
                _ => VideoSource::Camera(config.camera.clone()),
            };
            cmd_scan(config, source, skip, output, max_frames, json)
        }
        Commands::List { json } => cmd_list(config, json),
        Commands::Remove { name } => cmd_remove(config, name),
        Commands::Clear => cmd_clear(config),
        Commands::Config { validate } => cmd_config(config, validate),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::load()?),
    }
}

fn cmd_enroll(config: Config, name: String, images: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    let recognizer = Recognizer::new(config)?;

    let start = Instant::now();
    let summary = recognizer.enroll_batch_paths(&images, &name);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Enrolled {}: {} successful, {} failed ({:.2}s)",
            name,
            summary.success,
            summary.failed,
            start.elapsed().as_secs_f64()
        );
    }

    if !summary.persisted {
        anyhow::bail!("Face database could not be saved to {}", recognizer.database_path().display());
    }
    if summary.success == 0 {
        anyhow::bail!("No face found in any image for {}", name);
    }
    Ok(())
}

fn cmd_enroll_video(
    config: Config,
    name: String,
    video: PathBuf,
    interval: Option<u32>,
    max_frames: Option<u32>,
    json: bool,
) -> anyhow::Result<()> {
    let interval = interval.unwrap_or(config.video.enroll_frame_interval);
    let max_frames = max_frames.or(config.video.enroll_max_frames);
    let recognizer = Recognizer::new(config)?;

    let summary = recognizer.enroll_from_video(&video, &name, interval, max_frames)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Enrolled {} from {}: {} successful, {} failed",
            name,
            video.display(),
            summary.success,
            summary.failed
        );
    }

    if !summary.persisted {
        anyhow::bail!("Face database could not be saved to {}", recognizer.database_path().display());
    }
    Ok(())
}

fn cmd_recognize(config: Config, path: PathBuf, output: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let recognizer = Recognizer::new(config)?;
    if !recognizer.has_identities() {
        log::warn!("No one is enrolled; every face will be Unknown");
    }

    let start = Instant::now();
    let detections = recognizer.recognize_image_path(&path)?;
    let duration = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&detections)?);
    } else if detections.is_empty() {
        println!("No faces found in {}", path.display());
    } else {
        println!("{} face(s) in {}:", detections.len(), path.display());
        print_detections(&detections);
        println!("Total time: {:.2}ms", duration.as_secs_f64() * 1000.0);
    }

    if let Some(output) = output {
        let mut annotated = image::open(&path)?.to_rgb8();
        facetrail_core::annotate::draw_detections(&mut annotated, &detections);
        annotated.save(&output)?;
        if !json {
            println!("Annotated image saved: {}", output.display());
        }
    }

    Ok(())
}

fn cmd_scan(
    config: Config,
    source: VideoSource,
    skip: Option<u32>,
    output: Option<PathBuf>,
    max_frames: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let skip = skip.unwrap_or(config.video.frame_skip);
    let recognizer = Recognizer::new(config)?;

    let start = Instant::now();
    let summary = match output {
        Some(ref output) => recognizer.annotate_video(&source, skip, output, max_frames)?,
        None => {
            let stream = recognizer.recognize_video(&source, skip)?;
            summarize(stream, max_frames, |result| {
                if result.fresh && !json {
                    println!("Frame {}: {}", result.index, describe(&result.detections));
                }
                Ok(())
            })?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "Processed {} frames ({} analyzed) in {:.2}s",
        summary.frames,
        summary.analyzed,
        start.elapsed().as_secs_f64()
    );
    if let Some(output) = output {
        println!("Annotated video saved: {}", output.display());
    }
    if !summary.sightings.is_empty() {
        println!();
        println!("{:<20} {:>8} {:>8} {:>8}", "Name", "First", "Last", "Frames");
        println!("{}", "-".repeat(47));
        for sighting in &summary.sightings {
            println!(
                "{:<20} {:>8} {:>8} {:>8}",
                sighting.name, sighting.first_frame, sighting.last_frame, sighting.frames_seen
            );
        }
    }

    Ok(())
}

fn cmd_list(config: Config, json: bool) -> anyhow::Result<()> {
    let recognizer = Recognizer::new(config)?;
    let names = recognizer.names();

    if json {
        let entries: Vec<_> = names
            .iter()
            .map(|name| serde_json::json!({ "name": name, "embeddings": recognizer.embedding_count(name) }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if names.is_empty() {
        println!("No one is enrolled");
        return Ok(());
    }

    println!("{:<30} {}", "Name", "Embeddings");
    println!("{}", "-".repeat(42));
    for name in &names {
        println!("{:<30} {}", name, recognizer.embedding_count(name));
    }

    Ok(())
}

fn cmd_remove(config: Config, name: String) -> anyhow::Result<()> {
    let recognizer = Recognizer::new(config)?;

    if recognizer.remove(&name)? {
        println!("✓ Removed {}", name);
    } else {
        println!("{} is not enrolled", name);
    }

    Ok(())
}

fn cmd_clear(config: Config) -> anyhow::Result<()> {
    let recognizer = Recognizer::new(config)?;
    let count = recognizer.names().len();
    recognizer.clear();
    println!("✓ Cleared {} enrolled {}", count, if count == 1 { "person" } else { "people" });
    Ok(())
}

fn cmd_config(config: Config, validate: bool) -> anyhow::Result<()> {
    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("Configuration:");
    println!();

    println!("[recognizer]");
    println!("  threshold = {}", config.recognizer.threshold);
    println!("  model_name = {:?}", config.recognizer.model_name);
    println!();

    println!("[detection]");
    println!("  model = {:?}", config.detection.model_path);
    println!(
        "  confidence_threshold = {}",
        config.detection.confidence_threshold
    );
    println!("  scale = {}", config.detection.scale);
    println!();

    println!("[embedding]");
    println!("  model = {:?}", config.embedding.model_path);
    println!("  normalize = {}", config.embedding.normalize);
    println!();

    println!("[runtime]");
    println!("  intra_threads = {}", config.runtime.intra_threads);
    println!();

    println!("[video]");
    println!("  ffmpeg = {:?}", config.video.ffmpeg);
    println!("  ffprobe = {:?}", config.video.ffprobe);
    println!("  frame_skip = {}", config.video.frame_skip);
    println!("  enroll_frame_interval = {}", config.video.enroll_frame_interval);
    match config.video.enroll_max_frames {
        Some(max) => println!("  enroll_max_frames = {}", max),
        None => println!("  enroll_max_frames = unlimited"),
    }
    println!();

    println!("[camera]");
    println!("  device = {:?}", config.camera.device);
    println!("  resolution = {}x{}", config.camera.width, config.camera.height);
    println!();

    println!("[storage]");
    println!("  database_path = {:?}", config.storage.database_path);

    Ok(())
}

fn print_detections(detections: &[Detection]) {
    println!("{:<20} {:>10} {}", "Name", "Distance", "Box");
    println!("{}", "-".repeat(50));
    for d in detections {
        println!(
            "{:<20} {:>10.4} {}x{} at ({}, {})",
            d.name, d.distance, d.width, d.height, d.x, d.y
        );
    }
}

fn describe(detections: &[Detection]) -> String {
    if detections.is_empty() {
        return "no faces".to_string();
    }
    detections
        .iter()
        .map(|d| format!("{} ({:.3})", d.name, d.distance))
        .collect::<Vec<_>>()
        .join(", ")
}
