/*!
 # Schedule Dimmer

 Control core of a networked dimmable light fixture. A schedule record arrives
 in fragments over an unreliable channel, is reassembled and validated, and then
 drives a dimmable output so the light ramps on and off on a weekly time-of-day
 window.

 ## Features

 * Fragment reassembly with a bounded buffer and explicit cancel
 * Ordered validation of the configuration record with fail-safe fallback
 * Drift-free software clock seeded from the first accepted record
 * Weekday and time-window evaluation
 * Exponential ramp up/down with a shutdown pulse effect
 * A single bounded hand-off queue between ingestion and control

 ## Example

 ```rust,no_run
 use schedule_dimmer::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     tracing_subscriber::fmt::init();

     let settings = EngineSettings::default();
     let (producer, consumer) = handoff_queue(settings.queue_depth);
     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

     // Control side: owns the schedule, clock and ramp state
     let context = ControlContext::new(&settings);
     let output = LogOutput::new(settings.ramp.max_duty);
     let control = tokio::spawn(run_control_loop(
         context,
         consumer,
         output,
         SystemMonotonic::new(),
         shutdown_rx,
     ));

     // Ingestion side: translates transport events into core calls
     let mut ingestion = IngestionAdapter::new(producer, settings.max_message_size);
     let record = br#"{"lightIntensity":80,"lightStart":"07:00","lightEnd":"21:00","timeNow":1744893150,
         "timezoneOffsetHours":1,"daylightSavingFlag":false,"Monday":true,"Tuesday":true,
         "Wednesday":true,"Thursday":true,"Friday":true,"Saturday":false,"Sunday":false}"#;
     ingestion.handle(TransportEvent::SingleWrite {
         conn: ConnectionId(0),
         characteristic: SCHEDULE_CHARACTERISTIC_UUID,
         payload: record.to_vec(),
     });

     tokio::signal::ctrl_c().await?;
     shutdown_tx.send_replace(true);
     if let Ok(context) = control.await {
         println!("{}", context.status());
     }
     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Top-level error type for the schedule dimmer library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration record was rejected
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Settings are not usable
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// I/O error from a binary front end
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod clock;
pub mod config;
pub mod engine;
pub mod output;
pub mod queue;
pub mod ramp;
pub mod reassembly;
pub mod schedule;
pub mod settings;
pub mod transport;

// Re-export key types
pub use clock::{
    local_seconds, to_local_time_string, ClockKeeper, ClockState, MonotonicClock,
    SystemMonotonic,
};
pub use config::{
    decode, decode_message, ConfigMessage, DecodeError, RedLightWindow, ScheduleConfig, TimeOfDay,
};
pub use engine::{run_control_loop, ControlContext, ScheduleStatus};
pub use output::{ChannelId, LightOutput, LogOutput, OutputCommand, OutputError, RecordingOutput};
pub use queue::{handoff_queue, HandoffConsumer, HandoffMessage, HandoffProducer};
pub use ramp::{RampController, RampMode, RampSettings};
pub use reassembly::{FragmentOutcome, IngestionError, MessageReassembler};
pub use schedule::{weekday_index, DayBoundary, ScheduleEvaluator, WindowPolicy, WEEKDAY_NAMES};
pub use settings::EngineSettings;
pub use transport::{
    Ack, AckStatus, ConnectionId, IngestionAdapter, TransportEvent, SCHEDULE_CHARACTERISTIC_UUID,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_errors_convert_to_crate_error() {
        let error: Error = decode(b"{}").unwrap_err().into();
        assert!(matches!(
            error,
            Error::Decode(DecodeError::MissingField("lightIntensity"))
        ));

        let settings = EngineSettings {
            channels: Vec::new(),
            ..EngineSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));
    }
}
