//! Engine tunables with the defaults used on the fixture.

use std::time::Duration;

use crate::output::ChannelId;
use crate::ramp::RampSettings;
use crate::reassembly::MAX_MESSAGE_SIZE;
use crate::schedule::{DayBoundary, WindowPolicy};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Control loop period
    pub tick_period: Duration,
    /// How long each tick waits for a queued message
    pub poll_timeout: Duration,
    /// Completed messages the hand-off queue can hold
    pub queue_depth: usize,
    /// Largest configuration message accepted
    pub max_message_size: usize,
    /// Output channels, each with its own ramp
    pub channels: Vec<ChannelId>,
    /// Log a status line every this many ticks (0 disables)
    pub status_every_ticks: u32,
    pub window_policy: WindowPolicy,
    /// Whether weekday flags follow the UTC or the local date
    pub day_boundary: DayBoundary,
    /// Channel driven by the optional red-light window
    pub red_light_channel: Option<ChannelId>,
    pub ramp: RampSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(10),
            queue_depth: 10,
            max_message_size: MAX_MESSAGE_SIZE,
            channels: vec![ChannelId(0)],
            status_every_ticks: 10,
            window_policy: WindowPolicy::Lexicographic,
            day_boundary: DayBoundary::Utc,
            red_light_channel: None,
            ramp: RampSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Checks the combination of settings is usable
    pub fn validate(&self) -> Result<()> {
        if self.tick_period.is_zero() {
            return Err(Error::InvalidSettings("tick period must be non-zero".into()));
        }
        if self.poll_timeout >= self.tick_period {
            return Err(Error::InvalidSettings(format!(
                "poll timeout {:?} must be shorter than tick period {:?}",
                self.poll_timeout, self.tick_period
            )));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidSettings("queue depth must be at least 1".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidSettings(
                "maximum message size must be non-zero".into(),
            ));
        }
        if self.channels.is_empty() {
            return Err(Error::InvalidSettings("at least one channel is required".into()));
        }
        if let Some(red) = self.red_light_channel {
            if !self.channels.contains(&red) {
                return Err(Error::InvalidSettings(format!(
                    "red-light channel {} is not a configured channel",
                    red
                )));
            }
        }
        if self.ramp.max_duty == 0 {
            return Err(Error::InvalidSettings("max duty must be non-zero".into()));
        }
        if self.ramp.min_duty_floor >= self.ramp.max_duty {
            return Err(Error::InvalidSettings(format!(
                "duty floor {} must be below max duty {}",
                self.ramp.min_duty_floor, self.ramp.max_duty
            )));
        }
        Ok(())
    }
}
