use chrono::DateTime;
use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result, WrapErr};
use schedule_dimmer::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum, Debug)]
enum WindowArg {
    /// Compare HH:MM strings; windows crossing midnight never match
    Lexicographic,
    /// Compare minutes since midnight; start after end wraps midnight
    WrapAware,
}

impl From<WindowArg> for WindowPolicy {
    fn from(arg: WindowArg) -> Self {
        match arg {
            WindowArg::Lexicographic => WindowPolicy::Lexicographic,
            WindowArg::WrapAware => WindowPolicy::WrapAware,
        }
    }
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Control loop period in milliseconds
    #[arg(long, global = true, default_value_t = 100)]
    tick_ms: u64,
    /// Full-scale duty of the output device
    #[arg(long, global = true, default_value_t = 254)]
    max_duty: u16,
    /// Duty at which dimming switches the output off
    #[arg(long, global = true, default_value_t = 1)]
    duty_floor: u16,
    /// Shutdown flashes after switching off (0 disables)
    #[arg(long, global = true, default_value_t = 5)]
    pulses: u8,
    /// Duty change per tick while flashing
    #[arg(long, global = true, default_value_t = 1)]
    pulse_step: u16,
    /// Number of output channels driven by the schedule
    #[arg(long, global = true, default_value_t = 1)]
    channels: u8,
    /// Time window comparison
    #[arg(long, global = true, value_enum, default_value_t = WindowArg::Lexicographic)]
    window: WindowArg,
    /// Select weekdays by the local date instead of the UTC date
    #[arg(long, global = true)]
    local_days: bool,
    /// Channel driven by the red-light window, if the record carries one
    #[arg(long, global = true)]
    red_channel: Option<u8>,
}

impl EngineArgs {
    fn settings(&self) -> Result<EngineSettings> {
        let defaults = EngineSettings::default();
        let settings = EngineSettings {
            tick_period: Duration::from_millis(self.tick_ms),
            poll_timeout: defaults.poll_timeout.min(Duration::from_millis(self.tick_ms / 2)),
            channels: (0..self.channels).map(ChannelId).collect(),
            window_policy: self.window.clone().into(),
            day_boundary: if self.local_days {
                DayBoundary::Local
            } else {
                DayBoundary::Utc
            },
            red_light_channel: self.red_channel.map(ChannelId),
            ramp: RampSettings {
                max_duty: self.max_duty,
                min_duty_floor: self.duty_floor,
                pulse_count: self.pulses,
                pulse_step: self.pulse_step,
            },
            ..defaults
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration record
    Check {
        /// File holding the JSON record
        file: PathBuf,
    },
    /// Run the schedule against a virtual clock and print output changes
    Simulate {
        /// File holding the JSON record
        file: PathBuf,
        /// Simulated duration in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,
        /// Start time in Unix seconds (defaults to the record's timeNow)
        #[arg(long)]
        start: Option<i64>,
    },
    /// Deliver a record in fragments and run the control loop until Ctrl-C
    Run {
        /// File holding the JSON record
        file: PathBuf,
        /// Bytes per prepared-write fragment
        #[arg(long, default_value_t = 20)]
        fragment_size: usize,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("schedule_dimmer=info,dimmer=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");
    let settings = cli.engine.settings()?;

    match cli.command {
        Commands::Check { file } => check(&file),
        Commands::Simulate { file, hours, start } => simulate(&settings, &file, hours, start),
        Commands::Run {
            file,
            fragment_size,
        } => run(settings, &file, fragment_size).await,
    }
}

fn read_record(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))
}

/// Decode and report a record
#[instrument]
fn check(path: &Path) -> Result<()> {
    let bytes = read_record(path)?;
    match decode_message(&bytes) {
        Ok(message) => {
            let config = &message.config;
            println!("OK");
            println!("  intensity : {}%", config.light_intensity);
            println!("  window    : {} - {}", config.window_start, config.window_end);
            println!("  timezone  : UTC{:+}", config.timezone_offset_hours);
            println!("  dst flag  : {}", config.daylight_saving);
            let days: Vec<&str> = WEEKDAY_NAMES
                .iter()
                .zip(config.weekday_active)
                .filter_map(|(name, active)| active.then_some(*name))
                .collect();
            println!("  days      : {}", days.join(", "));
            if let Some(red) = &config.red_light {
                println!(
                    "  red light : {}% from {} - {}",
                    red.light_intensity, red.window_start, red.window_end
                );
            }
            if let Some(sent) = DateTime::from_timestamp(message.time_now, 0) {
                println!("  sent at   : {}", sent.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            Ok(())
        }
        Err(e) => {
            error!("Record rejected: {}", e);
            Err(eyre!("record rejected: {e}"))
        }
    }
}

/// Step the control context with a virtual clock
#[instrument(skip(settings))]
fn simulate(settings: &EngineSettings, path: &Path, hours: u64, start: Option<i64>) -> Result<()> {
    let mut bytes = read_record(path)?;
    if let Some(start) = start {
        let message = decode_message(&bytes)?;
        bytes = message.config.to_message_json(start).into_bytes();
    }

    let mut context = ControlContext::new(&EngineSettings {
        status_every_ticks: 0,
        ..settings.clone()
    });
    context.handle_message(HandoffMessage::new(bytes))?;

    let mut output = RecordingOutput::new(settings.ramp.max_duty);
    let tick_micros = u64::try_from(settings.tick_period.as_micros())?;
    let ticks = hours * 3_600_000_000 / tick_micros.max(1);
    info!("Simulating {} hours in {} ticks", hours, ticks);

    let mut modes: Vec<RampMode> = context.channels().iter().map(|r| r.mode()).collect();
    let mut now = 0;
    for _ in 0..=ticks {
        context.tick(now, &mut output);
        now += tick_micros;

        for (ramp, mode) in context.channels().iter().zip(modes.iter_mut()) {
            if ramp.mode() != *mode {
                let status = context.status();
                let (day, time) = status
                    .evaluation
                    .as_ref()
                    .map_or(("-", "--:--"), |e| (e.day_name(), e.local_time.as_str()));
                println!(
                    "{} {} {}: {:?} -> {:?} (duty {})",
                    day,
                    time,
                    ramp.channel(),
                    mode,
                    ramp.mode(),
                    ramp.current_duty()
                );
                *mode = ramp.mode();
            }
        }
    }

    let status = context.status();
    println!("{}", status);
    println!(
        "{} output commands issued, {} failures",
        output.commands().len(),
        status.output_failures
    );
    Ok(())
}

/// Run both sides concurrently with a logging output
#[instrument(skip(settings))]
async fn run(settings: EngineSettings, path: &Path, fragment_size: usize) -> Result<()> {
    let bytes = read_record(path)?;
    let (producer, consumer) = handoff_queue(settings.queue_depth);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let context = ControlContext::new(&settings);
    let output = LogOutput::new(settings.ramp.max_duty);
    let control = tokio::spawn(run_control_loop(
        context,
        consumer,
        output,
        SystemMonotonic::new(),
        shutdown_rx,
    ));

    let mut ingestion = IngestionAdapter::new(producer, settings.max_message_size);
    let conn = ConnectionId(0);
    ingestion.handle(TransportEvent::Connected { conn });

    let chunks: Vec<&[u8]> = bytes.chunks(fragment_size.max(1)).collect();
    let mut offset = 0;
    for (i, chunk) in chunks.iter().enumerate() {
        let ack = ingestion.handle(TransportEvent::Fragment {
            conn,
            characteristic: SCHEDULE_CHARACTERISTIC_UUID,
            offset,
            payload: chunk.to_vec(),
            is_final_fragment: i + 1 == chunks.len(),
        });
        match ack {
            Some(Ack {
                status: AckStatus::Ok,
                ..
            }) => debug!("Fragment at {} acknowledged", offset),
            Some(ack) => warn!("Fragment at {} refused: {:?}", offset, ack.status),
            None => {}
        }
        offset += chunk.len();
    }
    info!(
        "Delivered {} bytes in {} fragments, press Ctrl-C to stop",
        bytes.len(),
        chunks.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send_replace(true);
    let context = control.await?;
    println!("{}", context.status());
    Ok(())
}
