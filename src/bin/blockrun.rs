//! Block program runner
//!
//! Dry-runs block programs against the mock robot and prints every step as a
//! JSON event on stdout. Also exposes the command codec and reply decoders
//! for inspecting traffic by hand.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use petoi_blocks::{
    codec::{decode_envelope, encode, to_base64_envelope},
    config::DEFAULT_CONFIG_PATH,
    json_output::output,
    response::{parse_joint_angles, parse_scalar, FrameDecoder},
    BlockExecutor, Config, ConsoleTelemetry, Interpreter, MockTransport, Program,
    SerialLog, SkillRegistry, TransportMode,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Completion tokens the simulated serial link echoes back for matching commands
const SIMULATED_TOKENS: &[&str] = &["k", "d", "m", "i", "B", "K"];

#[derive(Parser)]
#[command(name = "blockrun")]
#[command(about = "Run block programs and inspect robot command encoding")]
#[command(version)]
struct Args {
    /// Path to the runner configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a program file (JSON or YAML) against the mock robot
    Run {
        program: PathBuf,

        /// Transport to simulate: network or serial
        #[arg(short, long)]
        mode: Option<TransportMode>,

        /// Directory of skill files, overriding the configuration
        #[arg(long)]
        skills: Option<PathBuf>,

        /// Pretty-print events
        #[arg(long)]
        pretty: bool,
    },
    /// Print the wire form of a command
    Encode {
        token: String,

        #[arg(allow_hyphen_values = true)]
        params: Vec<i64>,
    },
    /// Decode a device reply; `\n` in the text stands for a line break
    Decode {
        #[arg(value_enum)]
        shape: Shape,

        text: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Scalar,
    Camera,
    Joints,
    Gesture,
    Envelope,
}

impl Args {
    fn get_config_path(&self) -> Option<String> {
        self.config
            .clone()
            .or_else(|| std::env::var("BLOCKRUN_CONFIG").ok())
    }

    /// Explicit paths must exist; the default path is optional
    fn load_config(&self) -> Result<Config> {
        match self.get_config_path() {
            Some(path) => Config::load_from_path(&path).with_context(|| format!("Failed to load config {}", path)),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Config::load_from_path(DEFAULT_CONFIG_PATH).context("Failed to load default config")
            }
            None => {
                info!("No configuration file, using defaults");
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Commands::Run { program, mode, skills, pretty } => {
            let config = args.load_config()?;
            run_program(config, program, *mode, skills.as_deref(), *pretty).await
        }
        Commands::Encode { token, params } => {
            let wire = encode(token, params);
            let readable = petoi_blocks::Command::new(token.clone(), params.clone()).to_string();
            output::encoded(&readable, &wire.to_string(), &to_base64_envelope(&wire));
            Ok(())
        }
        Commands::Decode { shape, text } => decode(*shape, &text.replace("\\n", "\n")),
    }
}

async fn run_program(
    config: Config,
    path: &Path,
    mode: Option<TransportMode>,
    skills_dir: Option<&Path>,
    pretty: bool,
) -> Result<()> {
    let program = Program::load(path).with_context(|| format!("Failed to load program {}", path.display()))?;
    let mode = mode.unwrap_or_else(|| config.mode());
    info!("Dry run of {} over simulated {:?} transport", path.display(), mode);

    let skills = match skills_dir
        .map(Path::to_path_buf)
        .or_else(|| config.skills.directory.as_ref().map(PathBuf::from))
    {
        Some(dir) => SkillRegistry::load_dir(&dir).with_context(|| format!("Failed to load skills from {}", dir.display()))?,
        None => SkillRegistry::new(),
    };

    let telemetry = if pretty { ConsoleTelemetry::pretty() } else { ConsoleTelemetry::new() };
    let mut transport = MockTransport::new(mode);
    let log = if mode == TransportMode::Serial {
        let log = Arc::new(SerialLog::new(config.serial_log.capacity())?);
        for token in SIMULATED_TOKENS {
            transport = transport.echo(token, token);
        }
        transport = transport.with_log(log.clone());
        Some(log)
    } else {
        None
    };

    let mut executor = BlockExecutor::new(Arc::new(transport), config)?
        .with_skills(skills)
        .with_telemetry(Arc::new(telemetry));
    if let Some(log) = log {
        executor = executor.with_serial_log(log);
    }

    // Ctrl+C raises the stop flag; the run ends at its next checkpoint
    let ctx = executor.context().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            ctx.request_stop();
        }
    });

    let mut interpreter = Interpreter::new(executor);
    match interpreter.run(&program).await {
        Ok(()) => {
            info!("Program completed ({} steps)", interpreter.executor().steps_executed());
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            info!("Program stopped");
            Ok(())
        }
        Err(e) => {
            error!("Program failed: {}", e);
            output::error(&e.to_string());
            Err(e.into())
        }
    }
}

fn decode(shape: Shape, text: &str) -> Result<()> {
    match shape {
        Shape::Scalar => output::decoded("scalar", serde_json::json!(parse_scalar(text))),
        Shape::Joints => output::decoded("joints", serde_json::json!(parse_joint_angles(text))),
        Shape::Camera => {
            let frame = FrameDecoder::new()?.parse_camera_frame(text);
            output::decoded("camera", serde_json::to_value(frame)?)
        }
        Shape::Gesture => {
            let code = FrameDecoder::new()?.parse_gesture(text);
            output::decoded("gesture", serde_json::json!(code))
        }
        Shape::Envelope => {
            let value = decode_envelope(text).map(|command| {
                serde_json::json!({
                    "token": command.token,
                    "params": command.params,
                    "binary": command.encoding == petoi_blocks::Encoding::Bytes,
                })
            });
            output::decoded("envelope", serde_json::to_value(value)?)
        }
    }
    Ok(())
}
