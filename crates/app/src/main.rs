use std::{f32::consts::PI, path::PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use dubline_core::{
    AppConfig, DeviceProvider, ExportFormat, HeadlessTransport, Lesson, ManualTime, Session,
    StaticDevices,
};
use tracing_subscriber::EnvFilter;

fn main() -> dubline_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => run_simulate(args),
        Commands::Devices => run_devices(),
        #[cfg(feature = "device")]
        Commands::Live(args) => live::run(args),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

fn load_config(session: &SessionArgs) -> dubline_core::Result<AppConfig> {
    let mut config = match &session.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(format) = session.format {
        config.export.format = format.into();
    }
    config.validate()?;
    Ok(config)
}

fn lesson(args: &SessionArgs) -> Lesson {
    Lesson {
        year: args.year.clone(),
        title: args.title.clone(),
        language: args.language.clone(),
        video: String::new(),
        duration_seconds: args.duration,
    }
}

/// Records a synthetic tone against a simulated clock and exports it.
fn run_simulate(args: SimulateArgs) -> dubline_core::Result<()> {
    let config = load_config(&args.session)?;
    let sample_rate = config.audio.sample_rate;
    let quantum = config.audio.render_quantum;
    tracing::info!(
        start = args.session.start,
        seconds = args.session.seconds,
        frequency = args.frequency,
        "starting simulated take"
    );

    let time = ManualTime::new();
    let mut session = Session::new(
        config,
        lesson(&args.session),
        HeadlessTransport::new(),
        time.clone(),
        Box::new(StaticDevices::single("Synthetic Microphone")),
    )?;
    let mut engine = session.attach_engine();
    session.refresh_devices()?;
    session.open_microphone()?;
    session.seek(args.session.start)?;
    session.arm_recording();
    session.play()?;
    session.pump()?;

    let block_ms = quantum as f64 * 1000.0 / f64::from(sample_rate);
    let blocks = (args.session.seconds * 1000.0 / block_ms).ceil() as usize;
    let step = 2.0 * PI * args.frequency / sample_rate as f32;
    let mut phase = 0.0_f32;
    let mut capture = vec![0.0_f32; quantum];
    let mut output = vec![0.0_f32; quantum];
    let mut written = 0;

    for _ in 0..blocks {
        for sample in capture.iter_mut() {
            *sample = args.amplitude * phase.sin();
            phase = (phase + step) % (2.0 * PI);
        }
        engine.render(Some(&capture), &mut output);
        time.advance(block_ms);

        let report = session.pump()?;
        written += report.samples_written();
        if !session.state().playing {
            break;
        }
    }

    session.stop()?;
    session.pump()?;
    tracing::info!(written, time = session.time(), "take finished");

    let artifact = session.export()?;
    let path = artifact.save(&args.session.out)?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(feature = "device")]
fn run_devices() -> dubline_core::Result<()> {
    let mut devices = dubline_core::CpalDevices::new();
    for device in devices.input_devices()? {
        println!("{}", device.name);
    }
    Ok(())
}

#[cfg(not(feature = "device"))]
fn run_devices() -> dubline_core::Result<()> {
    let mut devices = StaticDevices::default();
    let listed = devices.input_devices()?;
    tracing::warn!("hardware audio support is not compiled in; rebuild with `--features device`");
    for device in listed {
        println!("{}", device.name);
    }
    Ok(())
}

#[cfg(feature = "device")]
mod live {
    use std::{thread, time::Duration};

    use dubline_core::{CpalDevices, CpalHost, HeadlessTransport, MonotonicTime, Session};

    use super::{lesson, load_config, LiveArgs};

    /// Records from a real microphone for a fixed time.
    pub fn run(args: LiveArgs) -> dubline_core::Result<()> {
        let config = load_config(&args.session)?;
        let audio = config.audio.clone();
        let mut session = Session::new(
            config,
            lesson(&args.session),
            HeadlessTransport::new(),
            MonotonicTime::new(),
            Box::new(CpalDevices::new()),
        )?;
        let engine = session.attach_engine();
        session.refresh_devices()?;
        if let Some(device) = &args.device {
            session.select_device(device)?;
        }
        session.open_microphone()?;
        let host = CpalHost::start(session.mic().map(|mic| mic.device_id.as_str()), &audio, engine)?;

        session.set_playthrough(args.monitor);
        session.seek(args.session.start)?;
        session.arm_recording();
        session.play()?;

        let end = args.session.start + args.session.seconds;
        while session.state().playing && session.time() < end {
            session.pump()?;
            thread::sleep(Duration::from_millis(5));
        }

        session.pump()?;
        session.stop()?;
        session.pump()?;
        host.stop()?;

        let artifact = session.export()?;
        let path = artifact.save(&args.session.out)?;
        println!("{}", path.display());
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Record a dub against a lesson timeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a synthetic tone with a simulated clock and export it.
    Simulate(SimulateArgs),
    /// List capture devices.
    Devices,
    /// Record from a microphone and export the take.
    #[cfg(feature = "device")]
    Live(LiveArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Lesson length in seconds.
    #[arg(long, default_value_t = 10.0)]
    duration: f64,
    /// Timeline position recording starts from.
    #[arg(long, default_value_t = 0.0)]
    start: f64,
    /// How long to record.
    #[arg(long, default_value_t = 3.0)]
    seconds: f64,
    /// Directory the export is written to.
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
    /// Overrides the configured export format.
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    #[arg(long, default_value = "2024")]
    year: String,
    #[arg(long, default_value = "Lesson")]
    title: String,
    #[arg(long, default_value = "en")]
    language: String,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Tone frequency in Hz.
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,
}

#[cfg(feature = "device")]
#[derive(Args, Debug)]
struct LiveArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Capture device name; defaults to the first one.
    #[arg(short, long)]
    device: Option<String>,
    /// Route the microphone to the output while recording.
    #[arg(long)]
    monitor: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Mp3,
    Wav,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Mp3 => ExportFormat::Mp3,
            FormatArg::Wav => ExportFormat::Wav,
        }
    }
}
