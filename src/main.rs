use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use smart_door::{
    AttemptOutcome, CameraManager, Config, DoorError, DoorEvent, FrameSource, HttpBackend,
    OnnxFaceDetector, Orchestrator, RecognitionBackend, StepOutcome,
};

#[derive(Parser)]
#[command(name = "smartdoor")]
#[command(about = "Face-recognition door orchestrator")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream, poll for faces and auto-recognize until Ctrl-C
    Run,
    /// List available cameras
    ListCameras,
    /// Guided enrollment for one person
    Enroll {
        #[arg(short, long)]
        name: String,
        /// Capture the whole variation catalog without asking
        #[arg(long)]
        full: bool,
    },
    /// One-shot recognition attempt
    Recognize,
    /// Capture a single frame to a file
    TestCamera {
        #[arg(short, long, default_value = "test_capture.jpg")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run => run(load_config(&cli.config)?).await,
        Commands::ListCameras => list_cameras(),
        Commands::Enroll { name, full } => enroll(load_config(&cli.config)?, &name, full).await,
        Commands::Recognize => recognize_once(load_config(&cli.config)?).await,
        Commands::TestCamera { output } => test_camera(load_config(&cli.config)?, &output),
    }
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => match Config::load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{e}; using built-in defaults");
                let config = Config::default();
                config.validate()?;
                config
            }
        },
    };
    Ok(config)
}

fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    let camera = Arc::new(CameraManager::new(config.camera.clone()));
    let detector = Arc::new(OnnxFaceDetector::load(&config)?);
    let backend = Arc::new(HttpBackend::new(&config.service)?);
    Ok(Orchestrator::new(config, camera, detector, backend))
}

async fn run(config: Config) -> Result<()> {
    let device_index = config.camera.device_index;
    let orchestrator = build_orchestrator(config)?;

    let device = orchestrator.start_stream(device_index)?;
    println!("Watching /dev/video{} ({})", device.device_id, device.label);

    orchestrator.start_auto_recognition();
    let mut events = orchestrator.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("dropped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("Shutting down");
    orchestrator.shutdown();
    Ok(())
}

fn print_event(event: &DoorEvent) {
    match event {
        DoorEvent::Unlocked { name, at } => println!("🔓 {name} recognized at {at}"),
        DoorEvent::Relocked => println!("🔒 door locked"),
        DoorEvent::AttemptFailed { attempt, max_attempts } => {
            println!("✗ not recognized ({attempt}/{max_attempts})");
        }
        DoorEvent::CooldownArmed { duration } => {
            println!("⏳ too many failures, cooling down for {}s", duration.as_secs());
        }
        DoorEvent::StreamStarted { device_id, .. } => {
            println!("📷 camera /dev/video{device_id} up");
        }
        DoorEvent::StreamStopped => println!("📷 camera stopped"),
        DoorEvent::EnrollmentCaptured { variation, index, total } => {
            println!("📸 captured '{variation}' ({index}/{total})");
        }
        DoorEvent::EnrollmentCompleted { name, captured } => {
            println!("✅ enrolled {name} with {} variations", captured.len());
        }
        DoorEvent::EnrollmentCancelled { name, captured } => {
            println!("⚠ enrollment for {name} cancelled after {captured} captures");
        }
    }
}

fn list_cameras() -> Result<()> {
    let devices = CameraManager::list_devices()?;
    for device in devices {
        println!("/dev/video{}: {}", device.device_id, device.label);
    }
    Ok(())
}

async fn enroll(config: Config, name: &str, full: bool) -> Result<()> {
    let device_index = config.camera.device_index;
    let orchestrator = build_orchestrator(config)?;
    orchestrator.start_stream(device_index)?;

    let mut sequencer = orchestrator.sequencer()?;
    sequencer.start_session(name)?;
    println!("Enrolling {name} ({} variations)", sequencer.catalog().len());

    while let Some(variation) = sequencer.current_variation().map(str::to_string) {
        print!("Position for '{variation}' and press Enter (q to cancel): ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        if line.trim().eq_ignore_ascii_case("q") {
            if let Some(session) = sequencer.cancel() {
                println!(
                    "Cancelled; {} variations kept",
                    session.captured_variations().len()
                );
            }
            break;
        }

        if !sequencer.face_present() {
            println!("No face in view yet, waiting...");
            if !wait_for_face(&orchestrator, Duration::from_secs(10)).await {
                println!("Still no face; try again");
                continue;
            }
        }

        match sequencer.capture_current().await {
            Ok(StepOutcome::Completed { name, captured }) => {
                println!("Done: {name} enrolled with {} variations", captured.len());
                break;
            }
            Ok(StepOutcome::Advanced {
                variation,
                index,
                total,
                offer_full_session,
            }) => {
                println!("Captured '{variation}' ({index}/{total})");
                if offer_full_session && !full {
                    print!("Continue with the remaining variations? [y/N]: ");
                    std::io::stdout().flush()?;
                    let mut answer = String::new();
                    std::io::stdin().read_line(&mut answer)?;
                    if !answer.trim().eq_ignore_ascii_case("y") {
                        sequencer.cancel();
                        println!("Stopped after the default capture");
                        break;
                    }
                }
            }
            Err(e) => println!("Capture failed ({e}); same step will be retried"),
        }
    }

    orchestrator.shutdown();
    Ok(())
}

async fn wait_for_face(orchestrator: &Orchestrator, timeout: Duration) -> bool {
    let mut faces = orchestrator.faces();
    tokio::time::timeout(timeout, async {
        loop {
            if !faces.borrow().is_empty() {
                return;
            }
            if faces.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

async fn recognize_once(config: Config) -> Result<()> {
    let device_index = config.camera.device_index;
    let orchestrator = build_orchestrator(config)?;
    orchestrator.start_stream(device_index)?;

    println!("Look at the camera...");
    if !wait_for_face(&orchestrator, Duration::from_secs(15)).await {
        orchestrator.shutdown();
        anyhow::bail!("no face detected within 15s");
    }

    let frame = orchestrator
        .camera()
        .capture_frame()
        .ok_or(DoorError::FrameUnavailable)?;
    let outcome = orchestrator
        .backend()
        .recognize(&frame.to_base64_jpeg()?)
        .await;

    match outcome {
        AttemptOutcome::Recognized {
            name, confidence, ..
        } => match confidence {
            Some(confidence) => println!("Recognized {name} (confidence {confidence:.2})"),
            None => println!("Recognized {name}"),
        },
        AttemptOutcome::Unknown { message } => {
            println!(
                "Unknown{}",
                message.map(|m| format!(": {m}")).unwrap_or_default()
            );
        }
    }

    orchestrator.shutdown();
    Ok(())
}

fn test_camera(config: Config, output: &std::path::Path) -> Result<()> {
    let camera = CameraManager::new(config.camera.clone());
    camera.start_stream(config.camera.device_index)?;

    let frame = camera.capture_frame().ok_or(DoorError::FrameUnavailable)?;
    frame.image().save(output)?;
    println!(
        "Saved {}x{} frame to {}",
        frame.width(),
        frame.height(),
        output.display()
    );

    camera.stop_stream();
    Ok(())
}
