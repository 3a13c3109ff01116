mod log;

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use jack_ir_core::{
    config::{Config, ConfigError, FrequencyRange, Layout, SilenceGap},
    AbortCause, AudioEngine, CaptureScheduler, Deconvolver, ImpulseResponse, LatencyCompensation,
    SessionState, SweepSignal,
};

const WARM_UP: Duration = Duration::from_secs(1);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Measures impulse responses by playing an exponential sweep through JACK.
#[derive(Parser)]
#[clap(author, version)]
struct Cli {
    /// Capture port, every port adds an IR channel
    #[arg(short = 'c', long = "capture", value_name = "PORT")]
    capture: Vec<String>,
    /// Playback port the sweep is sent to
    #[arg(short = 'p', long = "playback", value_name = "PORT")]
    playback: Vec<String>,
    /// Capture length in seconds
    #[arg(short = 'C', long, value_name = "SEC", default_value_t = 15.0)]
    capture_length: f32,
    /// Silence between the passes of a true-stereo capture in seconds
    #[arg(short = 'S', long, value_name = "SEC", default_value_t = 1.0)]
    silence: f32,
    /// Capture a 4 channel true-stereo IR, needs 2 capture and 2 playback ports
    #[arg(short = 'T', long)]
    true_stereo: bool,
    /// Custom round-trip latency in samples, 0 uses the measured latency
    #[arg(short = 'L', long, value_name = "SAMPLES", default_value_t = 0)]
    latency: u32,
    /// JACK client name
    #[arg(short = 'j', long, default_value = "ir")]
    jack_name: String,
    #[arg(long, value_name = "HZ", default_value_t = 20.0)]
    sweep_min: f32,
    #[arg(long, value_name = "HZ", default_value_t = 20_000.0)]
    sweep_max: f32,
    /// Sweep duration in seconds
    #[arg(long, value_name = "SEC", default_value_t = 10.0)]
    sweep_length: f32,
    /// Write the sweep and its inverse to a 2 channel wav file
    #[arg(long, value_name = "FILE")]
    dump_sweep: Option<PathBuf>,
    /// Replace an existing output file
    #[arg(short = 'y', long)]
    overwrite: bool,
    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(short, long)]
    verbose: bool,
    #[arg(value_name = "OUT_FILE", default_value = "ir.wav")]
    out_file: PathBuf,
}

impl Cli {
    fn config(&self) -> Result<Config, ConfigError> {
        let layout = Layout::from_ports(self.capture.len(), self.playback.len(), self.true_stereo)?;
        let sweep_range = FrequencyRange::new(self.sweep_min, self.sweep_max)?;

        Config::new(
            layout,
            sweep_range,
            self.sweep_length,
            self.capture_length,
            SilenceGap::clamped(self.silence),
            LatencyCompensation::manual(self.latency),
        )
    }

    fn log_level(&self) -> Level {
        if self.quiet {
            Level::WARN
        } else if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    log::init(cli.log_level());

    let config = cli.config().map_err(jack_ir_core::Error::from)?;

    if cli.out_file.exists() {
        if !cli.overwrite {
            return Err(
                jack_ir_core::Error::from(ConfigError::OutputExists(cli.out_file.clone())).into(),
            );
        }

        log::warn!("overwriting '{}'", cli.out_file.display());
    }

    let ir = measure(&cli, &config)?;

    ir.write(&cli.out_file)
        .map_err(jack_ir_core::Error::from)
        .with_context(|| format!("could not save impulse response to '{}'", cli.out_file.display()))?;

    log::info!(
        "wrote {} channel(s), {} samples ({:.2} s) to '{}'",
        ir.channels().len(),
        ir.len(),
        ir.len() as f32 / ir.sample_rate() as f32,
        cli.out_file.display()
    );

    Ok(())
}

fn measure(cli: &Cli, config: &Config) -> anyhow::Result<ImpulseResponse> {
    let engine = AudioEngine::new(&cli.jack_name).map_err(jack_ir_core::Error::from)?;

    let sample_rate = engine.sample_rate();
    log::info!("sample rate: {sample_rate} Hz");
    config
        .check_sample_rate(sample_rate)
        .map_err(jack_ir_core::Error::from)?;

    let range = config.sweep_range();
    let sweep = Arc::new(SweepSignal::generate(
        range.from(),
        range.to(),
        config.sweep_secs(),
        sample_rate,
    ));
    log::debug!("sweep length: {} samples", sweep.len());

    if let Some(path) = &cli.dump_sweep {
        sweep
            .write_to_file(path, sample_rate)
            .map_err(jack_ir_core::Error::from)?;
        log::info!("sweep written to '{}'", path.display());
    }

    let scheduler = CaptureScheduler::new(
        Arc::clone(&sweep),
        config.layout(),
        config.record_len(sample_rate),
        config.silence_len(sample_rate),
    )
    .map_err(jack_ir_core::Error::from)?;

    let session = engine.activate(scheduler)?;
    let state = session.state();

    {
        let state = Arc::clone(&state);
        ctrlc::set_handler(move || {
            state.abort(AbortCause::Interrupted);
        })
        .context("could not install signal handler")?;
    }

    let round_trip_latency = session
        .connect(cli.capture.as_slice(), cli.playback.as_slice())
        .map_err(jack_ir_core::Error::from)?;

    let latency = config.latency();
    if latency.is_manual() {
        log::info!("latency: {} samples (custom)", latency.effective(round_trip_latency));
    } else {
        log::info!("round-trip latency: {round_trip_latency} samples");
    }

    if !session.start(WARM_UP) {
        log::debug!("session ended during warm-up");
    }

    let show_progress = !cli.quiet;
    let status = session.wait(PROGRESS_INTERVAL, |state| {
        if show_progress {
            print_progress(state);
        }
    });
    if show_progress {
        println!();
    }
    log::debug!("capture ended with status {status:?}");

    let capture = session.finish().map_err(jack_ir_core::Error::from)?;

    let ir = ImpulseResponse::from_capture(
        capture,
        &sweep,
        sample_rate,
        latency,
        Deconvolver::new(),
    )?;

    Ok(ir)
}

fn print_progress(state: &SessionState) {
    let phase = if state.is_playing() { 'P' } else { 'C' };

    let mut stdout = io::stdout().lock();
    let _ = write!(
        stdout,
        "\x1b[2K\rProcessing: {:3.0}% ({phase})",
        state.progress() * 100.0
    );
    let _ = stdout.flush();
}
