// =============================================================================
// platformer-pilot: NES platformer agent driven through an external emulator
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train run1.mp4 run2.mp4 --sprites sprites.yaml --model models/pilot.safetensors
//   cargo run --release -- play --rom game.nes --sprites sprites.yaml --model models/pilot.safetensors --stage 3

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use platformer_pilot::{
    ClassTable, ClassifierConfig, EmulatorConfig, EpochExtension, FrameClassifier, Headless,
    Model, NoExtension, PlayConfig, Screen, Stage, StdinPrompt, TrainConfig, TrainingController,
    Window, run_session,
};

fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

// =============================================================================
// Play
// =============================================================================

fn play(args: &PlayArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  PLAYING — platformer-pilot");
    eprintln!("═══════════════════════════════════════════════════════════");

    let stage = args.stage.map(Stage::from_number).transpose()?;
    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    let classes = ClassTable::load(&args.sprites)?;
    let model = FrameClassifier::load(&args.model, &device)?;
    if model.num_classes() != classes.len() {
        anyhow::bail!(
            "model has {} classes but {} defines {}",
            model.num_classes(),
            args.sprites.display(),
            classes.len()
        );
    }

    let emulator = EmulatorConfig {
        executable: args.fceux.clone(),
        rom: args.rom.clone(),
        script: args.script.clone(),
        scale: args.scale,
    };
    let config = PlayConfig {
        time_steps: args.time_steps,
        addr: args.addr.clone(),
        artifact: args.artifact.clone(),
        stage,
        ..PlayConfig::default()
    };

    let outcome = if args.headless {
        run_session(&emulator, &config, &model, &classes, &mut Headless)?
    } else {
        let mut window = Window::new("platformer-pilot — play")?;
        run_session(&emulator, &config, &model, &classes, &mut window)?
    };
    eprintln!(
        "Session ended ({:?}) after {} commands",
        outcome.reason, outcome.cycles
    );
    Ok(())
}

// =============================================================================
// Train
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — platformer-pilot (Rust + candle)");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    let classes = ClassTable::load(&args.sprites)?;
    let excluded = args
        .exclude
        .iter()
        .map(|name| {
            classes
                .index_of(name)
                .or_else(|| name.parse().ok().filter(|&i| i < classes.len()))
                .with_context(|| format!("Unknown class to exclude: {name}"))
        })
        .collect::<Result<Vec<usize>>>()?;

    let model = FrameClassifier::open_or_create(
        &args.model,
        &device,
        classes.len(),
        ClassifierConfig::default(),
    )?;
    let config = TrainConfig {
        batch_size: args.batch_size,
        epochs: args.epochs,
        model_path: args.model.clone(),
        log_dir: args.log_dir.clone(),
        log_name: args.log_name.clone(),
        excluded,
    };
    eprintln!(
        "Classes: {} | batch {} | {} epochs | log {}",
        classes.len(),
        config.batch_size,
        config.epochs,
        config.log_dir.join(format!("{}.jsonl", config.log_name)).display()
    );

    if args.no_prompt {
        train_videos(model, NoExtension, config, &args.videos, args.display)
    } else {
        train_videos(model, StdinPrompt::stdin(), config, &args.videos, args.display)
    }
}

fn train_videos<E: EpochExtension>(
    model: FrameClassifier,
    extension: E,
    config: TrainConfig,
    videos: &[PathBuf],
    display: bool,
) -> Result<()> {
    let mut controller = TrainingController::new(model, extension, config)?;
    let interrupt = controller.interrupt();
    ctrlc::set_handler(move || interrupt.cancel()).context("Failed to install Ctrl-C handler")?;
    let mut screen: Box<dyn Screen> = if display {
        Box::new(Window::new("platformer-pilot — training")?)
    } else {
        Box::new(Headless)
    };
    let summaries = controller.run(videos, screen.as_mut())?;
    let fits: u64 = summaries.iter().map(|s| s.fits).sum();
    let transitions: u64 = summaries.iter().map(|s| s.transitions).sum();
    eprintln!("Done: {} videos, {transitions} transitions, {fits} fits", summaries.len());
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "platformer-pilot", about = "NES platformer agent and training pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the emulator and let the model play
    Play(PlayArgs),
    /// Fit the model on transitions extracted from recorded videos
    Train(TrainArgs),
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long)]
    sprites: PathBuf,
    #[arg(long)]
    model: PathBuf,
    #[arg(long, default_value = "/usr/games/fceux")]
    fceux: PathBuf,
    /// Listener script loaded into the emulator
    #[arg(long, default_value = "server.lua")]
    script: PathBuf,
    #[arg(long, default_value = "2")]
    scale: u32,
    #[arg(long, default_value = "10")]
    time_steps: usize,
    #[arg(long, default_value = "127.0.0.1:4321")]
    addr: String,
    #[arg(long, default_value = "/tmp/.platformer-pilot.screen")]
    artifact: PathBuf,
    /// Boss stage to pick from the select screen (1-8)
    #[arg(long)]
    stage: Option<u32>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long, default_value_t = false)]
    headless: bool,
}

#[derive(Parser)]
struct TrainArgs {
    #[arg(required = true)]
    videos: Vec<PathBuf>,
    #[arg(long)]
    sprites: PathBuf,
    #[arg(long)]
    model: PathBuf,
    #[arg(long, default_value = "50")]
    epochs: usize,
    #[arg(long, default_value = "100")]
    batch_size: usize,
    #[arg(long, default_value = "training")]
    log_name: String,
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    /// Class names (or indices) never used as transition targets
    #[arg(long)]
    exclude: Vec<String>,
    #[arg(long, default_value_t = false)]
    display: bool,
    /// Never ask for extra epochs after a fit
    #[arg(long, default_value_t = false)]
    no_prompt: bool,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Play(args) => play(args),
        Commands::Train(args) => train(args),
    }
}
