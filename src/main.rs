use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use tracing_subscriber::EnvFilter;

use tossmeter::report::EventSink;
use tossmeter::sensor::{self, Stamping, SyntheticThrow};
use tossmeter::{DetectorConfig, Input, JsonLines, Outcome, SessionDriver, SessionOptions};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Measure how high a phone was thrown from its accelerometer",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON detector config; flags below override it
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(flatten)]
    tuning: TuningArgs,

    /// Minimum spacing between gauge events (ms)
    #[arg(long, global = true, default_value_t = 100)]
    gauge_interval_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Arm once and detect a throw from a live JSON-lines sample stream
    Live(LiveArgs),
    /// Run a recorded JSON-lines stream using its own timestamps
    Replay {
        /// Recording to read (`-` for stdin)
        #[arg(default_value = "-", value_hint = ValueHint::FilePath)]
        input: PathBuf,
    },
    /// Generate and detect a synthetic throw
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct LiveArgs {
    /// Sample stream (`-` for stdin)
    #[arg(long, default_value = "-", value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Countdown before arming (ms)
    #[arg(long, default_value_t = 2000)]
    countdown_ms: u64,

    /// Also broadcast events to clients of this Unix socket
    #[arg(long, value_hint = ValueHint::FilePath)]
    socket: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Target height in meters
    #[arg(long, default_value_t = 1.0)]
    height: f64,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 50.0)]
    rate_hz: f64,

    /// Pace samples in real time instead of as fast as possible
    #[arg(long, action = ArgAction::SetTrue)]
    realtime: bool,
}

const MAX_SIM_HEIGHT_M: f64 = 1000.0;
const MAX_SIM_RATE_HZ: f64 = 10_000.0;
const MAX_SIM_REST_MS: u64 = 600_000;

impl SimulateArgs {
    /// Keeps the generated sample count within reason.
    fn check(&self, config: &DetectorConfig) -> Result<()> {
        anyhow::ensure!(
            self.height.is_finite() && self.height > 0.0 && self.height <= MAX_SIM_HEIGHT_M,
            "--height must be in (0, {MAX_SIM_HEIGHT_M}] m"
        );
        anyhow::ensure!(
            self.rate_hz.is_finite() && self.rate_hz > 0.0 && self.rate_hz <= MAX_SIM_RATE_HZ,
            "--rate-hz must be in (0, {MAX_SIM_RATE_HZ}]"
        );
        anyhow::ensure!(
            config.settling_delay_ms <= MAX_SIM_REST_MS,
            "--settling-delay-ms above {MAX_SIM_REST_MS} cannot be simulated"
        );
        Ok(())
    }
}

#[derive(Args, Debug, Default)]
struct TuningArgs {
    #[arg(long, global = true)]
    gravity: Option<f64>,
    #[arg(long, global = true)]
    throw_threshold: Option<f64>,
    #[arg(long, global = true)]
    freefall_threshold: Option<f64>,
    #[arg(long, global = true)]
    impact_threshold: Option<f64>,
    #[arg(long, global = true)]
    max_realistic_height: Option<f64>,
    #[arg(long, global = true)]
    min_freefall_time: Option<f64>,
    #[arg(long, global = true)]
    settling_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    session_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    history_size: Option<usize>,
}

impl TuningArgs {
    fn apply(&self, config: &mut DetectorConfig) {
        if let Some(v) = self.gravity {
            config.gravity = v;
        }
        if let Some(v) = self.throw_threshold {
            config.throw_threshold = v;
        }
        if let Some(v) = self.freefall_threshold {
            config.freefall_threshold = v;
        }
        if let Some(v) = self.impact_threshold {
            config.impact_threshold = v;
        }
        if let Some(v) = self.max_realistic_height {
            config.max_realistic_height = v;
        }
        if let Some(v) = self.min_freefall_time {
            config.min_freefall_time = v;
        }
        if let Some(v) = self.settling_delay_ms {
            config.settling_delay_ms = v;
        }
        if let Some(v) = self.session_timeout_ms {
            config.session_timeout_ms = v;
        }
        if let Some(v) = self.history_size {
            config.history_size = v;
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<DetectorConfig> {
    let mut config = match &cli.config {
        Some(path) => DetectorConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DetectorConfig::default(),
    };
    cli.tuning.apply(&mut config);
    config.validate().context("invalid detector configuration")?;
    Ok(config)
}

fn open_input(path: &Path) -> Result<Box<dyn io::BufRead + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

#[cfg(unix)]
fn attach_socket(sinks: &mut Vec<Box<dyn EventSink + Send>>, path: &Path) -> Result<()> {
    let broadcast = tossmeter::report::SocketBroadcast::bind(path)
        .with_context(|| format!("binding socket {}", path.display()))?;
    tracing::info!("broadcasting events on {}", path.display());
    sinks.push(Box::new(broadcast));
    Ok(())
}

#[cfg(not(unix))]
fn attach_socket(_sinks: &mut Vec<Box<dyn EventSink + Send>>, _path: &Path) -> Result<()> {
    anyhow::bail!("--socket is only supported on unix")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    let mut sinks: Vec<Box<dyn EventSink + Send>> = vec![Box::new(JsonLines::new(io::stdout()))];
    let mut options = SessionOptions {
        gauge_interval_ms: cli.gauge_interval_ms,
        ..Default::default()
    };

    let (tx, rx) = mpsc::channel::<Input>();

    let report = match &cli.command {
        Command::Live(args) => {
            if let Some(path) = &args.socket {
                attach_socket(&mut sinks, path)?;
            }
            options.countdown_ms = args.countdown_ms;
            let epoch = Instant::now();
            sensor::spawn_json_reader(
                open_input(&args.input)?,
                tx.clone(),
                Stamping::Arrival(epoch),
            );
            let mut driver = SessionDriver::new(config, options, sinks)?;
            driver.run_live(&rx, &tx, epoch)
        }
        Command::Replay { input } => {
            sensor::spawn_json_reader(open_input(input)?, tx.clone(), Stamping::Source);
            drop(tx);
            let mut driver = SessionDriver::new(config, options, sinks)?;
            driver.run_replay(&rx)
        }
        Command::Simulate(args) => {
            args.check(&config)?;
            let throw = SyntheticThrow {
                height_m: args.height,
                rate_hz: args.rate_hz,
                // the throw has to land after the settling window
                rest_ms: (config.settling_delay_ms as f64 + 500.0).max(1500.0),
                gravity: config.gravity,
            };
            tracing::info!(height_m = args.height, rate_hz = args.rate_hz, "simulating throw");
            sensor::spawn_synthetic(throw.samples(), tx.clone(), args.realtime);
            drop(tx);
            let mut driver = SessionDriver::new(config, options, sinks)?;
            driver.run_replay(&rx)
        }
    }?;

    match report.outcome {
        Outcome::Success(result) => tracing::info!(
            "throw reached {:.2} m ({:.3} s free-fall, {} samples)",
            result.height_m,
            result.free_fall_s,
            report.samples
        ),
        Outcome::TooShort { free_fall_s } => {
            tracing::info!("throw too short ({free_fall_s:.3} s), try a higher throw")
        }
        Outcome::Timeout => tracing::info!("no complete throw detected, try again"),
    }
    Ok(())
}
