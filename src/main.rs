use tcode_sync::engine::CommandEngine;
use tcode_sync::funscript;
use tcode_sync::playback::PlaybackSimulator;
#[cfg(feature = "hardware")]
use tcode_sync::transport::SerialTransport;
use tcode_sync::transport::{ConsoleTransport, Transport, UdpTransport};
use tcode_sync::types::*;

use clap::Parser;
use log::{error, info, warn};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tcode-sync")]
#[command(about = "Play funscripts to a TCode device in sync with a media clock")]
struct Cli {
    /// Serial port of the device (e.g., /dev/ttyUSB0)
    #[cfg(feature = "hardware")]
    #[arg(long)]
    port: Option<String>,

    /// Send to a network device over UDP (host:port)
    #[arg(long)]
    udp: Option<String>,

    /// Funscript to play. Repeat for multiple axes; the axis comes from the
    /// file name (clip.funscript, clip.twist.funscript, clip.R2.funscript, ...)
    #[arg(long)]
    script: Vec<PathBuf>,

    /// JSON file with a list of per-axis configurations
    #[arg(long)]
    axes: Option<PathBuf>,

    /// Output rate (Hz), 30–200
    #[arg(long, default_value_t = DEFAULT_OUTPUT_RATE_HZ)]
    rate: f64,

    /// Script offset (ms), subtracted from media time
    #[arg(long, default_value_t = 0.0)]
    offset_ms: f64,

    /// Playback speed multiplier
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Media position to start from (ms)
    #[arg(long, default_value_t = 0.0)]
    start_ms: f64,

    /// Stop after this many seconds of wall time (default: end of script,
    /// or 10 s in test mode)
    #[arg(long)]
    duration_s: Option<f64>,

    /// Home every axis before starting
    #[arg(long)]
    home: bool,

    /// Run a manual test on this axis instead of playing scripts
    #[arg(long, value_parser = parse_axis)]
    test_axis: Option<Axis>,

    /// Manual test speed (Hz)
    #[arg(long, default_value_t = 1.0)]
    test_speed: f64,

    /// Seed for random fills (reproducible output)
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_axis(s: &str) -> Result<Axis, String> {
    Axis::from_id(s).ok_or_else(|| {
        format!(
            "unknown axis '{}' (stroke, twist, roll, pitch, L0, R0-R2)",
            s
        )
    })
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn open_transport(cli: &Cli) -> Result<Arc<dyn Transport>, Box<dyn Error>> {
    #[cfg(feature = "hardware")]
    if let Some(port) = &cli.port {
        return Ok(Arc::new(SerialTransport::open(port)?));
    }
    if let Some(target) = &cli.udp {
        return Ok(Arc::new(UdpTransport::connect(target)?));
    }
    info!("No device given; writing commands to stdout");
    Ok(Arc::new(ConsoleTransport::new()))
}

fn load_axis_configs(path: &Path) -> Result<Vec<AxisConfig>, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("read {}: {}", path.display(), e))?;
    let configs: Vec<AxisConfig> = serde_json::from_str(&text)
        .map_err(|e| format!("parse {}: {}", path.display(), e))?;
    Ok(configs)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    info!("═══════════════════════════════════════════════");
    info!("  TCODE SYNC v{}", env!("CARGO_PKG_VERSION"));
    info!("  Rate: {:.0} Hz, offset {} ms", cli.rate, cli.offset_ms);
    info!("═══════════════════════════════════════════════");

    let transport = open_transport(&cli)?;
    let mut engine = CommandEngine::new(transport);
    if let Some(seed) = cli.seed {
        engine = engine.with_seed(seed);
    }
    let engine = Arc::new(engine);

    engine.set_output_rate(cli.rate);
    engine.set_offset(cli.offset_ms);
    if let Some(path) = &cli.axes {
        engine.set_axis_configs(&load_axis_configs(path)?);
    }

    let scripts = funscript::load_all(&cli.script[..])?;
    let script_end_ms = scripts
        .values()
        .filter_map(|s| s.actions.last().map(|a| a.at))
        .max();
    engine.set_scripts(scripts);
    engine.start();

    if cli.home {
        engine.home_axes()?;
        thread::sleep(Duration::from_millis(HOME_INTERVAL_MS as u64));
    }

    if let Some(axis) = cli.test_axis {
        let seconds = cli.duration_s.unwrap_or(10.0).max(0.0);
        engine.start_test_axis(axis, cli.test_speed);
        thread::sleep(Duration::from_secs_f64(seconds));
        engine.stop_test_axis(axis);
        thread::sleep(Duration::from_millis(TEST_STOP_INTERVAL_MS as u64));
    } else if let Some(script_end) = script_end_ms {
        let end_ms = match cli.duration_s {
            Some(d) => {
                let speed = cli.speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED);
                cli.start_ms + d.max(0.0) * 1000.0 * speed
            }
            None => script_end as f64,
        };
        let stop = AtomicBool::new(false);
        PlaybackSimulator::new(Arc::clone(&engine))
            .with_start(cli.start_ms)
            .with_end(Some(end_ms))
            .with_speed(cli.speed)
            .run(&stop);
        // Let the return-to-center animations finish
        thread::sleep(Duration::from_millis(500));
    } else {
        warn!("No scripts and no test axis; nothing to do");
    }

    engine.stop_timer();
    Ok(())
}
