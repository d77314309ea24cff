use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use confique::Config;
use log::{info, warn, LevelFilter};
use pico_daq::*;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};
use time::{macros::format_description, OffsetDateTime};

#[derive(Parser, Debug)]
#[command(author, version, about = "PicoScope 5000 Series acquisition", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run against the in-process simulated scope
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Print unit information and channel settings
    Info,
    /// Continuous streaming acquisition
    Stream,
    /// Rapid block capture into device memory segments
    RapidBlock {
        /// Overrides the configured waveform count
        #[arg(short, long)]
        waveforms: Option<u32>,
    },
}

fn init_logging(path: &Path, terminal: bool) -> Result<()> {
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        LevelFilter::Debug,
        config.clone(),
        File::create(path).with_context(|| format!("creating log file {}", path.display()))?,
    )];
    // A full-screen status display owns the terminal.
    if terminal {
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

struct Run {
    conf: Conf,
    out_dir: PathBuf,
    stamp: String,
    tui: bool,
}

impl Run {
    fn output(&self, prefix: &str, ext: &str) -> PathBuf {
        self.out_dir.join(format!("{prefix}_{}.{ext}", self.stamp))
    }

    fn create(&self, prefix: &str, ext: &str) -> Result<BufWriter<File>> {
        let path = self.output(prefix, ext);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        info!("Writing {}", path.display());
        Ok(BufWriter::new(file))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let conf = Conf::builder()
        .env()
        .file(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;

    let out_dir = PathBuf::from(&conf.output.output_dir);
    fs::create_dir_all(&out_dir)?;
    let tui = conf.output.tui && matches!(args.command, Command::Stream);
    init_logging(&out_dir.join(&conf.output.log_file), !tui)?;

    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))?;
    let run = Run {
        conf,
        out_dir,
        stamp,
        tui,
    };
    let resolution = run.conf.device.resolution()?;

    if args.simulate {
        let mut sim = SimConfig {
            resolution,
            ..SimConfig::default()
        };
        if let Some(serial) = &run.conf.device.serial {
            sim.serial = serial.clone();
        }
        let status = sim.power_source;
        return acquire(SimulatedScope::new(sim), status, &run, args.command);
    }
    open_hardware(&run, resolution, args.command)
}

#[cfg(feature = "ps5000a")]
fn open_hardware(run: &Run, resolution: Resolution, command: Command) -> Result<()> {
    let (device, status) = Ps5000a::open(run.conf.device.serial.as_deref(), resolution)
        .map_err(|status| anyhow::anyhow!("Unable to open device: {status}"))?;
    acquire(device, status, run, command)
}

#[cfg(not(feature = "ps5000a"))]
fn open_hardware(_run: &Run, _resolution: Resolution, _command: Command) -> Result<()> {
    anyhow::bail!("built without the `ps5000a` feature; use --simulate")
}

fn acquire<D: Driver>(driver: D, status: PicoStatus, run: &Run, command: Command) -> Result<()> {
    let mut scope = Scope::open(driver, status, Box::new(run.conf.power.policy()))?;
    let outcome = configure(&mut scope, run).and_then(|()| match command {
        Command::Info => scope
            .set_timebase(run.conf.device.timebase)
            .map(|_| ())
            .map_err(Into::into),
        Command::Stream => stream(&mut scope, run),
        Command::RapidBlock { waveforms } => rapid_block(&mut scope, run, waveforms),
    });
    let closed = scope.close();
    outcome?;
    closed?;
    Ok(())
}

fn configure<D: Driver>(scope: &mut Scope<D>, run: &Run) -> Result<()> {
    log_unit_info(scope.driver_mut());

    let device = &run.conf.device;
    let channels = device.channel_map()?;
    let resolution = device.resolution()?;
    // Going up in resolution may need channels switched off first.
    if channels.is_empty() {
        scope.set_resolution(resolution)?;
    } else if resolution > scope.unit().resolution() {
        scope.set_channels(&channels)?;
        scope.set_resolution(resolution)?;
    } else {
        scope.set_resolution(resolution)?;
        scope.set_channels(&channels)?;
    }
    scope.unit_mut().scale_voltages = device.scale_voltages;
    scope.display_settings()?;
    Ok(())
}

fn stream<D: Driver>(scope: &mut Scope<D>, run: &Run) -> Result<()> {
    let settings = run.conf.streaming.settings(scope.unit())?;
    let serial = scope.unit().serial.clone();

    let mut observer: Box<dyn StreamObserver> = if run.conf.output.stream_log {
        Box::new(StreamLog::new(run.create("stream", "txt")?))
    } else {
        Box::new(Discard)
    };

    let (handle, signal) = cancel_pair();
    let stop = Arc::new(AtomicBool::new(false));
    let watcher = spawn_key_watcher(handle, Arc::clone(&stop));

    let mut session = StreamingSession::new(scope, settings);
    let summary = if run.tui {
        let mut terminal = ratatui::init();
        let mut monitor = StreamMonitor::new(observer, &mut terminal, &serial);
        let summary = session.run(&signal, &mut monitor);
        ratatui::restore();
        summary
    } else {
        session.run(&signal, &mut observer)
    };

    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    if watcher.join().is_err() {
        warn!("Key watcher thread panicked");
    }

    let summary = summary?;
    info!(
        "Streaming ended ({:?}): {} samples at {} {:?}, trigger {}",
        summary.end,
        summary.total_samples,
        summary.sample_interval,
        summary.time_units,
        summary
            .trigger_at
            .map_or_else(|| "not seen".to_string(), |at| format!("at sample {at}"))
    );
    if summary.power_changes > 0 {
        warn!("Power source changed {} time(s) during the run", summary.power_changes);
    }
    if summary.overflowed {
        warn!("At least one channel went over range");
    }
    Ok(())
}

fn rapid_block<D: Driver>(scope: &mut Scope<D>, run: &Run, waveforms: Option<u32>) -> Result<()> {
    let timebase = scope.set_timebase(run.conf.device.timebase)?;
    let mut block = run.conf.rapid_block.clone();
    if let Some(n) = waveforms {
        block.waveforms = n;
    }
    let settings = block.settings(scope.unit(), timebase.timebase)?;

    let (handle, signal) = cancel_pair();
    let stop = Arc::new(AtomicBool::new(false));
    let watcher = spawn_key_watcher(handle, Arc::clone(&stop));
    let result = RapidBlockCapture::new(scope, settings).capture(&signal);
    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    if watcher.join().is_err() {
        warn!("Key watcher thread panicked");
    }
    let result = result?;

    info!(
        "Rapid block ended ({:?}) with {} of {} waveforms",
        result.end,
        result.captures(),
        result.requested
    );
    if result.segments.is_empty() {
        return Ok(());
    }

    let unit = scope.unit();
    let interval_ns = result
        .timebase
        .map_or(i64::from(timebase.interval_ns), |t| i64::from(t.interval_ns));

    let mut log = run.create("block", "txt")?;
    write_capture_log(&mut log, &result, unit)?;
    log.flush()?;

    let mut table = run.create("block", "tsv")?;
    write_block_table(&mut table, &result.segments, &result.channels, unit, interval_ns)?;
    table.flush()?;

    if run.conf.output.binary {
        let mut records = BinaryRecordWriter::new(run.create("block", "bin")?);
        for segment in &result.segments {
            records.write_segment(segment, &result.channels, unit, interval_ns)?;
        }
        info!("{} binary records written", records.records());
        records.finish()?;
    }

    if run.conf.output.hdf5 {
        write_hdf5(run, &result)?;
    }
    Ok(())
}

#[cfg(feature = "hdf5")]
fn write_hdf5(run: &Run, result: &RapidBlockResult) -> Result<()> {
    let path = run.output("block", "h5");
    let samples = result.segments[0].data.ncols();
    let mut writer = Hdf5Writer::new(
        &path,
        result.channels.len(),
        samples,
        result.segments.len(),
        50,
    )?;
    for segment in &result.segments {
        writer.append_segment(segment.trigger.timestamp_counter, &segment.data)?;
    }
    writer.flush()?;
    info!("Wrote {}", path.display());
    Ok(())
}

#[cfg(not(feature = "hdf5"))]
fn write_hdf5(_run: &Run, _result: &RapidBlockResult) -> Result<()> {
    warn!("HDF5 output requested but this build has no `hdf5` feature");
    Ok(())
}
