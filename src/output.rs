/*!
 # Light output capability

 The physical transaction (PWM register write, lighting-bus frame) lives
 behind [`LightOutput`]. Two sinks ship with the crate: [`LogOutput`], which
 only traces commands, and [`RecordingOutput`], which keeps a shared log of
 commands and can inject transaction failures.
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Output channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Output transaction failure. Retried implicitly on the next control tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    /// Bus or register transaction failed
    #[error("Output transaction failed on {channel}: {reason}")]
    Transaction { channel: ChannelId, reason: String },

    /// No such channel on this device
    #[error("Channel {0} is not available")]
    ChannelUnavailable(ChannelId),
}

/// One command issued to the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCommand {
    SetDuty { channel: ChannelId, duty: u16 },
    Off { channel: ChannelId },
}

/// Something that changes physical brightness
pub trait LightOutput {
    /// Full-scale duty of the device
    fn max_duty_units(&self) -> u16;

    fn set_duty(&mut self, channel: ChannelId, duty: u16) -> Result<(), OutputError>;

    fn off(&mut self, channel: ChannelId) -> Result<(), OutputError>;
}

/// Output that only traces what it would do
#[derive(Debug)]
pub struct LogOutput {
    max_duty: u16,
    last: HashMap<ChannelId, u16>,
}

impl LogOutput {
    pub fn new(max_duty: u16) -> Self {
        Self {
            max_duty,
            last: HashMap::new(),
        }
    }
}

impl LightOutput for LogOutput {
    fn max_duty_units(&self) -> u16 {
        self.max_duty
    }

    fn set_duty(&mut self, channel: ChannelId, duty: u16) -> Result<(), OutputError> {
        let previous = self.last.insert(channel, duty);
        // Only milestones at info, the ramp itself is noisy
        if previous.is_none() || duty == self.max_duty || duty == 0 {
            info!("{} duty -> {}/{}", channel, duty, self.max_duty);
        } else {
            debug!("{} duty -> {}/{}", channel, duty, self.max_duty);
        }
        Ok(())
    }

    fn off(&mut self, channel: ChannelId) -> Result<(), OutputError> {
        self.last.insert(channel, 0);
        info!("{} off", channel);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Recording {
    commands: Vec<OutputCommand>,
    failures_pending: usize,
    failed: usize,
}

/// Output that records every successful command.
///
/// Clones share the same log, so a test or status reporter can observe what
/// the control loop sent.
#[derive(Debug, Clone)]
pub struct RecordingOutput {
    max_duty: u16,
    inner: Arc<Mutex<Recording>>,
}

impl RecordingOutput {
    pub fn new(max_duty: u16) -> Self {
        Self {
            max_duty,
            inner: Arc::new(Mutex::new(Recording::default())),
        }
    }

    /// Makes the next `count` transactions fail
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().failures_pending = count;
    }

    /// Commands accepted so far
    pub fn commands(&self) -> Vec<OutputCommand> {
        self.inner.lock().commands.clone()
    }

    /// Number of transactions that were failed on purpose
    pub fn failed_count(&self) -> usize {
        self.inner.lock().failed
    }

    /// Duty the channel was last driven to, if any command reached it
    pub fn last_duty(&self, channel: ChannelId) -> Option<u16> {
        self.inner
            .lock()
            .commands
            .iter()
            .rev()
            .find_map(|command| match *command {
                OutputCommand::SetDuty { channel: c, duty } if c == channel => Some(duty),
                OutputCommand::Off { channel: c } if c == channel => Some(0),
                _ => None,
            })
    }

    pub fn clear(&self) {
        self.inner.lock().commands.clear();
    }

    fn record(&self, command: OutputCommand) -> Result<(), OutputError> {
        let mut recording = self.inner.lock();
        if recording.failures_pending > 0 {
            recording.failures_pending -= 1;
            recording.failed += 1;
            let channel = match command {
                OutputCommand::SetDuty { channel, .. } | OutputCommand::Off { channel } => channel,
            };
            return Err(OutputError::Transaction {
                channel,
                reason: "injected failure".into(),
            });
        }
        recording.commands.push(command);
        Ok(())
    }
}

impl LightOutput for RecordingOutput {
    fn max_duty_units(&self) -> u16 {
        self.max_duty
    }

    fn set_duty(&mut self, channel: ChannelId, duty: u16) -> Result<(), OutputError> {
        self.record(OutputCommand::SetDuty { channel, duty })
    }

    fn off(&mut self, channel: ChannelId) -> Result<(), OutputError> {
        self.record(OutputCommand::Off { channel })
    }
}
