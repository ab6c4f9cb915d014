//! End-to-end: link events through reassembly and the hand-off queue into the
//! control loop, observed on a recording output.

use schedule_dimmer::*;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// Thursday 2025-04-17 12:32:30 UTC
const THURSDAY_NOON: i64 = 1_744_893_150;
const CONN: ConnectionId = ConnectionId(7);

/// Clock driven by tokio's (pausable) time
struct TokioClock(Instant);

impl MonotonicClock for TokioClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.0.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

fn record(intensity: u8, start: &str, end: &str) -> Vec<u8> {
    format!(
        r#"{{"lightIntensity":{intensity},"lightStart":"{start}","lightEnd":"{end}",
        "timeNow":{THURSDAY_NOON},"timezoneOffsetHours":0,"daylightSavingFlag":false,
        "Monday":true,"Tuesday":true,"Wednesday":true,"Thursday":true,
        "Friday":true,"Saturday":true,"Sunday":true}}"#
    )
    .into_bytes()
}

fn settings(queue_depth: usize) -> EngineSettings {
    EngineSettings {
        queue_depth,
        status_every_ticks: 0,
        ..EngineSettings::default()
    }
}

fn single_write(payload: Vec<u8>) -> TransportEvent {
    TransportEvent::SingleWrite {
        conn: CONN,
        characteristic: SCHEDULE_CHARACTERISTIC_UUID,
        payload,
    }
}

/// Runs the control loop for `duration` of (paused) time and returns it
async fn run_for(
    settings: &EngineSettings,
    consumer: HandoffConsumer,
    output: RecordingOutput,
    duration: Duration,
) -> ControlContext {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = tokio::spawn(run_control_loop(
        ControlContext::new(settings),
        consumer,
        output,
        TokioClock(Instant::now()),
        shutdown_rx,
    ));
    tokio::time::sleep(duration).await;
    shutdown_tx.send_replace(true);
    control.await.expect("control loop exits cleanly")
}

#[tokio::test(start_paused = true)]
async fn fragmented_record_lights_the_fixture() {
    let settings = settings(4);
    let (producer, consumer) = handoff_queue(settings.queue_depth);
    let mut ingestion = IngestionAdapter::new(producer, settings.max_message_size);
    let output = RecordingOutput::new(settings.ramp.max_duty);

    let bytes = record(100, "12:00", "18:00");
    let chunks: Vec<&[u8]> = bytes.chunks(18).collect();
    assert!(chunks.len() > 1);
    ingestion.handle(TransportEvent::Connected { conn: CONN });
    let mut offset = 0;
    for (i, chunk) in chunks.iter().enumerate() {
        let ack = ingestion
            .handle(TransportEvent::Fragment {
                conn: CONN,
                characteristic: SCHEDULE_CHARACTERISTIC_UUID,
                offset,
                payload: chunk.to_vec(),
                is_final_fragment: i + 1 == chunks.len(),
            })
            .expect("fragments are acknowledged");
        assert_eq!(ack.status, AckStatus::Ok);
        offset += chunk.len();
    }

    let context = run_for(&settings, consumer, output.clone(), Duration::from_secs(60)).await;

    let status = context.status();
    assert!(status.configured && status.clock_seeded);
    assert_eq!(status.accepted_messages, 1);
    assert!(status.epoch_seconds >= THURSDAY_NOON + 59);
    assert_eq!(status.channels[0].current_duty, settings.ramp.max_duty);
    assert_eq!(status.channels[0].mode, RampMode::RampingUp, "holding at full scale");
    assert_eq!(output.last_duty(ChannelId(0)), Some(settings.ramp.max_duty));
    assert_eq!(output.failed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn overflowing_queue_drops_newest_and_keeps_order() {
    let settings = settings(2);
    let (producer, consumer) = handoff_queue(settings.queue_depth);
    let mut ingestion = IngestionAdapter::new(producer, settings.max_message_size);

    let ack = |a: Option<Ack>| a.map(|a| a.status);
    assert_eq!(
        ack(ingestion.handle(single_write(record(40, "12:00", "18:00")))),
        Some(AckStatus::Ok)
    );
    assert_eq!(
        ack(ingestion.handle(single_write(record(60, "12:00", "18:00")))),
        Some(AckStatus::Ok)
    );
    assert_eq!(
        ack(ingestion.handle(single_write(record(90, "12:00", "18:00")))),
        Some(AckStatus::Busy)
    );

    let output = RecordingOutput::new(settings.ramp.max_duty);
    let context = run_for(&settings, consumer, output, Duration::from_secs(2)).await;

    assert_eq!(context.status().accepted_messages, 2);
    assert_eq!(
        context.schedule().map(|s| s.light_intensity),
        Some(60),
        "second record replaced the first, third never arrived"
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_record_leaves_output_dark() {
    let settings = settings(4);
    let (producer, consumer) = handoff_queue(settings.queue_depth);
    let mut ingestion = IngestionAdapter::new(producer, settings.max_message_size);
    let output = RecordingOutput::new(settings.ramp.max_duty);

    // Missing every weekday flag
    let truncated = br#"{"lightIntensity":80,"lightStart":"12:00","lightEnd":"18:00",
        "timeNow":1744893150,"timezoneOffsetHours":0,"daylightSavingFlag":false}"#;
    let status = ingestion
        .handle(single_write(truncated.to_vec()))
        .map(|a| a.status);
    assert_eq!(status, Some(AckStatus::Ok), "validation happens on the control side");

    let context = run_for(&settings, consumer, output.clone(), Duration::from_secs(5)).await;

    let status = context.status();
    assert!(!status.configured);
    assert!(!status.clock_seeded);
    assert_eq!(status.rejected_messages, 1);
    assert!(output.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_subscribers_follow_the_loop() {
    let settings = settings(4);
    let (producer, consumer) = handoff_queue(settings.queue_depth);
    producer
        .push(HandoffMessage::new(record(50, "12:00", "18:00")))
        .expect("queue has room");

    let context = ControlContext::new(&settings);
    let mut status_rx = context.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = tokio::spawn(run_control_loop(
        context,
        consumer,
        RecordingOutput::new(settings.ramp.max_duty),
        TokioClock(Instant::now()),
        shutdown_rx,
    ));

    status_rx.changed().await.expect("loop publishes status");
    let first = status_rx.borrow_and_update().clone();
    assert!(first.configured);
    assert_eq!(first.epoch_seconds, THURSDAY_NOON);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let later = status_rx.borrow().clone();
    assert!(later.epoch_seconds >= THURSDAY_NOON + 2);

    shutdown_tx.send_replace(true);
    control.await.expect("control loop exits cleanly");
}
