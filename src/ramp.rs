/*!
 # Ramp controller

 Moves the output duty toward its target on an exponential law: every tick
 multiplies a floating-point shadow of the duty by `2^(±1/40)`, so forty ticks
 double or halve the brightness. Perceived brightness follows the logarithm of
 duty, so the ramp looks roughly linear to the eye.

 When the schedule ends the light dims down to a floor, is switched off, and
 then optionally flashes a few times to acknowledge the shutdown.
*/

use tracing::{debug, error, info, trace};

use crate::output::{ChannelId, LightOutput, OutputError};

/// Ticks needed to double (or halve) the duty
pub const RAMP_STEPS_PER_DOUBLING: f64 = 40.0;

/// Shadow value a ramp up starts from when the light is dark
pub const RAMP_SEED: f64 = 1.0;

fn up_factor() -> f64 {
    (1.0 / RAMP_STEPS_PER_DOUBLING).exp2()
}

fn down_factor() -> f64 {
    (-1.0 / RAMP_STEPS_PER_DOUBLING).exp2()
}

/// Ramp tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampSettings {
    /// Full-scale duty of the output device
    pub max_duty: u16,
    /// Dimming stops and the output is switched off at this duty
    pub min_duty_floor: u16,
    /// Flashes after switching off; zero disables the effect
    pub pulse_count: u8,
    /// Duty change per tick while flashing
    pub pulse_step: u16,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            max_duty: 254,
            min_duty_floor: 1,
            pulse_count: 5,
            pulse_step: 1,
        }
    }
}

impl RampSettings {
    /// Converts an intensity percentage to device duty units
    pub fn target_duty(&self, intensity_percent: u8) -> u16 {
        let percent = u32::from(intensity_percent.min(100));
        // Never exceeds max_duty, so it fits
        (percent * u32::from(self.max_duty) / 100) as u16
    }
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RampMode {
    /// Dark, nothing scheduled yet or shutdown effect finished
    #[default]
    Idle,
    /// Brightening toward the target, or holding at it
    RampingUp,
    /// Dimming toward the floor or a lowered target
    RampingDown,
    /// Shutdown flashes in progress, schedule not consulted
    Pulsing,
    /// Switched off with no shutdown effect configured
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PulsePhase {
    Up,
    Down,
}

/// Per-channel ramp state machine
#[derive(Debug, Clone)]
pub struct RampController {
    channel: ChannelId,
    settings: RampSettings,
    current_duty: u16,
    current_duty_log: f64,
    mode: RampMode,
    pulses_remaining: u8,
    pulse_phase: PulsePhase,
}

impl RampController {
    pub fn new(channel: ChannelId, settings: RampSettings) -> Self {
        Self {
            channel,
            settings: RampSettings {
                // Exponential dimming never reaches zero on its own
                min_duty_floor: settings.min_duty_floor.max(1),
                pulse_step: settings.pulse_step.max(1),
                ..settings
            },
            current_duty: 0,
            current_duty_log: 0.0,
            mode: RampMode::Idle,
            pulses_remaining: 0,
            pulse_phase: PulsePhase::Up,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn settings(&self) -> &RampSettings {
        &self.settings
    }

    pub fn mode(&self) -> RampMode {
        self.mode
    }

    pub fn current_duty(&self) -> u16 {
        self.current_duty
    }

    pub fn current_duty_log(&self) -> f64 {
        self.current_duty_log
    }

    pub fn pulses_remaining(&self) -> u8 {
        self.pulses_remaining
    }

    /// Advances one control tick.
    ///
    /// `active` is the schedule decision, `target_duty` the scheduled level in
    /// device units. A failed output transaction leaves the state untouched so
    /// the next tick issues the same command again.
    pub fn tick(
        &mut self,
        active: bool,
        target_duty: u16,
        output: &mut impl LightOutput,
    ) -> Result<RampMode, OutputError> {
        let target = target_duty.min(self.settings.max_duty);

        let result = if self.mode == RampMode::Pulsing {
            self.pulse(output)
        } else if active && target > 0 {
            if self.current_duty < target {
                self.ramp_up(target, output)
            } else if self.current_duty > target {
                self.dim_toward(target, output)
            } else {
                trace!("{} holding at {}", self.channel, target);
                Ok(())
            }
        } else if self.current_duty > 0 {
            // Shutdown flashes only when the window closes, not for a zero target
            self.dim_to_off(!active, output)
        } else {
            if matches!(self.mode, RampMode::RampingUp | RampMode::RampingDown) {
                self.mode = RampMode::Idle;
            }
            Ok(())
        };

        match result {
            Ok(()) => Ok(self.mode),
            Err(e) => {
                error!("{} output failed, retrying next tick: {}", self.channel, e);
                Err(e)
            }
        }
    }

    fn ramp_up(&mut self, target: u16, output: &mut impl LightOutput) -> Result<(), OutputError> {
        if self.mode != RampMode::RampingUp {
            debug!("{} ramping up toward {}", self.channel, target);
        }
        self.mode = RampMode::RampingUp;

        let log = (self.current_duty_log.max(RAMP_SEED) * up_factor())
            .clamp(0.0, f64::from(self.settings.max_duty))
            .min(f64::from(target));
        let duty = log.floor() as u16;

        output.set_duty(self.channel, duty)?;
        self.commit(duty, log);
        Ok(())
    }

    fn dim_toward(&mut self, target: u16, output: &mut impl LightOutput) -> Result<(), OutputError> {
        if self.mode != RampMode::RampingDown {
            debug!("{} dimming toward lowered target {}", self.channel, target);
        }
        self.mode = RampMode::RampingDown;

        let log = (self.current_duty_log * down_factor()).max(f64::from(target));
        let duty = (log.floor() as u16).max(target);

        output.set_duty(self.channel, duty)?;
        self.commit(duty, log);
        Ok(())
    }

    fn dim_to_off(
        &mut self,
        shutdown_flashes: bool,
        output: &mut impl LightOutput,
    ) -> Result<(), OutputError> {
        if self.mode != RampMode::RampingDown {
            debug!("{} ramping down from {}", self.channel, self.current_duty);
        }
        self.mode = RampMode::RampingDown;

        let log = (self.current_duty_log * down_factor()).max(0.0);
        let duty = log.floor() as u16;

        if duty > self.settings.min_duty_floor {
            output.set_duty(self.channel, duty)?;
            self.commit(duty, log);
            return Ok(());
        }

        output.off(self.channel)?;
        self.commit(0, 0.0);
        if shutdown_flashes && self.settings.pulse_count > 0 {
            info!(
                "{} off, starting {} shutdown flashes",
                self.channel, self.settings.pulse_count
            );
            self.mode = RampMode::Pulsing;
            self.pulses_remaining = self.settings.pulse_count;
            self.pulse_phase = PulsePhase::Up;
        } else {
            info!("{} off", self.channel);
            self.mode = RampMode::Off;
        }
        Ok(())
    }

    fn pulse(&mut self, output: &mut impl LightOutput) -> Result<(), OutputError> {
        let max = self.settings.max_duty;
        let step = self.settings.pulse_step;

        match self.pulse_phase {
            PulsePhase::Up => {
                let duty = self.current_duty.saturating_add(step).min(max);
                output.set_duty(self.channel, duty)?;
                self.commit(duty, f64::from(duty));
                if duty >= max {
                    self.pulse_phase = PulsePhase::Down;
                }
            }
            PulsePhase::Down => {
                let duty = self.current_duty.saturating_sub(step);
                if duty > 0 {
                    output.set_duty(self.channel, duty)?;
                    self.commit(duty, f64::from(duty));
                    return Ok(());
                }

                let last = self.pulses_remaining <= 1;
                if last {
                    output.off(self.channel)?;
                } else {
                    output.set_duty(self.channel, 0)?;
                }
                self.commit(0, 0.0);
                self.pulses_remaining = self.pulses_remaining.saturating_sub(1);
                trace!(
                    "{} flash done, {} remaining",
                    self.channel,
                    self.pulses_remaining
                );
                if last {
                    info!("{} shutdown flashes complete", self.channel);
                    self.mode = RampMode::Idle;
                } else {
                    self.pulse_phase = PulsePhase::Up;
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self, duty: u16, log: f64) {
        self.current_duty = duty;
        self.current_duty_log = log;
    }
}
