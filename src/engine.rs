/*!
 # Control side

 [`ControlContext`] owns everything the control loop mutates: the current
 schedule, the software clock and one ramp per output channel. Nothing in it
 is shared with the ingestion side; the only way in is a [`HandoffMessage`]
 popped from the queue.

 Every tick runs clock, evaluator, ramp and output in that order. A missing or
 rejected message never blocks or alters a tick.
*/

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::clock::{ClockKeeper, MonotonicClock};
use crate::config::{decode_message, DecodeError, ScheduleConfig};
use crate::output::{ChannelId, LightOutput};
use crate::queue::{HandoffConsumer, HandoffMessage};
use crate::ramp::{RampController, RampMode};
use crate::schedule::{Evaluation, ScheduleEvaluator, WEEKDAY_NAMES};
use crate::settings::EngineSettings;

/// Per-channel part of a status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub channel: ChannelId,
    pub mode: RampMode,
    pub current_duty: u16,
    pub target_duty: u16,
}

/// Snapshot of what the control loop is doing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleStatus {
    pub configured: bool,
    pub clock_seeded: bool,
    pub epoch_seconds: i64,
    /// Last evaluation, absent until a schedule is in force
    pub evaluation: Option<Evaluation>,
    pub channels: Vec<ChannelStatus>,
    pub accepted_messages: u64,
    pub rejected_messages: u64,
    pub output_failures: u64,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(eval) = &self.evaluation else {
            return write!(f, "awaiting configuration (uptime clock {}s)", self.epoch_seconds);
        };
        write!(
            f,
            "{} {} (epoch {}): day {}, window {}",
            eval.day_name(),
            eval.local_time,
            self.epoch_seconds,
            if eval.day_active { "active" } else { "inactive" },
            if eval.window_active { "active" } else { "inactive" },
        )?;
        for ch in &self.channels {
            write!(
                f,
                ", {} {:?} {}/{}",
                ch.channel, ch.mode, ch.current_duty, ch.target_duty
            )?;
        }
        Ok(())
    }
}

/// State owned solely by the control loop
#[derive(Debug)]
pub struct ControlContext {
    schedule: Option<ScheduleConfig>,
    clock: ClockKeeper,
    evaluator: ScheduleEvaluator,
    channels: Vec<RampController>,
    red_light_channel: Option<ChannelId>,
    last_evaluation: Option<Evaluation>,
    tick_period: Duration,
    poll_timeout: Duration,
    status_every_ticks: u32,
    ticks: u64,
    accepted: u64,
    rejected: u64,
    output_failures: u64,
    status_tx: watch::Sender<ScheduleStatus>,
}

impl ControlContext {
    pub fn new(settings: &EngineSettings) -> Self {
        let channels = settings
            .channels
            .iter()
            .map(|&channel| RampController::new(channel, settings.ramp))
            .collect();
        let (status_tx, _) = watch::channel(ScheduleStatus::default());
        Self {
            schedule: None,
            clock: ClockKeeper::new(),
            evaluator: ScheduleEvaluator::new(settings.window_policy)
                .with_day_boundary(settings.day_boundary),
            channels,
            red_light_channel: settings.red_light_channel,
            last_evaluation: None,
            tick_period: settings.tick_period,
            poll_timeout: settings.poll_timeout,
            status_every_ticks: settings.status_every_ticks,
            ticks: 0,
            accepted: 0,
            rejected: 0,
            output_failures: 0,
            status_tx,
        }
    }

    /// Schedule currently in force, if any record has been accepted
    pub fn schedule(&self) -> Option<&ScheduleConfig> {
        self.schedule.as_ref()
    }

    pub fn clock(&self) -> &ClockKeeper {
        &self.clock
    }

    pub fn channels(&self) -> &[RampController] {
        &self.channels
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Receives a status snapshot after every tick
    pub fn subscribe(&self) -> watch::Receiver<ScheduleStatus> {
        self.status_tx.subscribe()
    }

    /// Decodes a message and, if valid, replaces the schedule.
    ///
    /// The message is consumed and released whatever the outcome. On failure
    /// the previous schedule stays in force.
    #[instrument(skip(self, message), fields(len = message.len()))]
    pub fn handle_message(&mut self, message: HandoffMessage) -> Result<(), DecodeError> {
        let decoded = decode_message(message.as_bytes());
        drop(message);

        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.rejected += 1;
                match &self.schedule {
                    Some(_) => warn!("Record rejected ({}), keeping previous schedule", e),
                    None => warn!("Record rejected ({}), still awaiting configuration", e),
                }
                return Err(e);
            }
        };

        if self.clock.seed(decoded.time_now) {
            debug!("Clock seeded from first accepted record");
        }
        let config = decoded.config;
        info!(
            "Schedule accepted: {}% from {} to {} (UTC{:+}, DST flag {}), days: {}",
            config.light_intensity,
            config.window_start,
            config.window_end,
            config.timezone_offset_hours,
            config.daylight_saving,
            active_days(&config),
        );
        self.schedule = Some(config);
        self.accepted += 1;
        Ok(())
    }

    /// Runs one control tick: clock, evaluator, ramps, output
    pub fn tick(&mut self, now_micros: u64, output: &mut impl LightOutput) {
        self.clock.tick(now_micros);
        self.ticks += 1;

        if let Some(schedule) = &self.schedule {
            let evaluation = self.evaluator.evaluate(schedule, &self.clock.state());
            for ramp in &mut self.channels {
                let red = self.red_light_channel == Some(ramp.channel());
                let active = if red {
                    evaluation.red_window_active
                } else {
                    evaluation.window_active
                };
                let target = ramp
                    .settings()
                    .target_duty(scheduled_intensity(schedule, red));
                if ramp.tick(active, target, &mut *output).is_err() {
                    self.output_failures += 1;
                }
            }
            self.last_evaluation = Some(evaluation);
        }

        let status = self.status();
        if self.status_every_ticks > 0 && self.ticks % u64::from(self.status_every_ticks) == 0 {
            info!("{}", status);
        }
        self.status_tx.send_replace(status);
    }

    /// Builds a status snapshot
    pub fn status(&self) -> ScheduleStatus {
        ScheduleStatus {
            configured: self.schedule.is_some(),
            clock_seeded: self.clock.is_seeded(),
            epoch_seconds: self.clock.epoch_seconds(),
            evaluation: self.last_evaluation.clone(),
            channels: self
                .channels
                .iter()
                .map(|ramp| ChannelStatus {
                    channel: ramp.channel(),
                    mode: ramp.mode(),
                    current_duty: ramp.current_duty(),
                    target_duty: self.schedule.as_ref().map_or(0, |schedule| {
                        let red = self.red_light_channel == Some(ramp.channel());
                        ramp.settings()
                            .target_duty(scheduled_intensity(schedule, red))
                    }),
                })
                .collect(),
            accepted_messages: self.accepted,
            rejected_messages: self.rejected,
            output_failures: self.output_failures,
        }
    }
}

/// Intensity in percent for the main or the red-light channel
fn scheduled_intensity(schedule: &ScheduleConfig, red_light: bool) -> u8 {
    if red_light {
        schedule.red_light.as_ref().map_or(0, |red| red.light_intensity)
    } else {
        schedule.light_intensity
    }
}

fn active_days(config: &ScheduleConfig) -> String {
    let days: Vec<&str> = WEEKDAY_NAMES
        .iter()
        .zip(config.weekday_active)
        .filter(|(_, active)| *active)
        .map(|(name, _)| *name)
        .collect();
    if days.is_empty() {
        "none".into()
    } else {
        days.join(" ")
    }
}

/// Runs the control side until `shutdown` becomes `true` or its sender is
/// dropped, then hands the context back.
///
/// Each tick waits at most the poll timeout for a queued message, so an empty
/// or stalled queue never delays lighting control.
pub async fn run_control_loop<O, C>(
    mut context: ControlContext,
    mut consumer: HandoffConsumer,
    mut output: O,
    clock: C,
    mut shutdown: watch::Receiver<bool>,
) -> ControlContext
where
    O: LightOutput,
    C: MonotonicClock,
{
    let mut interval = time::interval(context.tick_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Control loop started: period {:?}, {} channel(s)",
        context.tick_period,
        context.channels.len()
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if let Some(message) = consumer.poll(context.poll_timeout).await {
            if let Err(e) = context.handle_message(message) {
                debug!("Tick continues on the previous schedule after {}", e);
            }
        }
        context.tick(clock.now_micros(), &mut output);
    }

    info!("Control loop stopped after {} ticks", context.ticks);
    context
}
