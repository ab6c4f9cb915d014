use schedule_dimmer::*;
use std::env;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const USAGE: &str = "Usage: dimmerd [max-duty]

Reads one event per line from stdin:
  connect:<conn>
  write:<conn>:<offset>:<final 0|1>:<payload>
  single:<conn>:<payload>
  cancel:<conn>
  disconnect:<conn>
  status";

#[tokio::main]
async fn main() -> Result<()> {
    // Responses go to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("schedule_dimmer=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args: Vec<_> = env::args().collect();
    if args.len() > 1 && (args[1] == "-h" || args[1] == "--help") {
        eprintln!("{USAGE}");
        std::process::exit(0);
    }

    let mut settings = EngineSettings::default();
    if let Some(max_duty) = args.get(1) {
        settings.ramp.max_duty = max_duty
            .parse()
            .map_err(|_| Error::InvalidSettings(format!("bad max duty: {max_duty}")))?;
    }
    settings.validate()?;

    let (producer, consumer) = handoff_queue(settings.queue_depth);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let context = ControlContext::new(&settings);
    let status_rx = context.subscribe();
    let control = tokio::spawn(run_control_loop(
        context,
        consumer,
        LogOutput::new(settings.ramp.max_duty),
        SystemMonotonic::new(),
        shutdown_rx,
    ));

    let mut ingestion = IngestionAdapter::new(producer, settings.max_message_size);
    println!("OK");

    // Mainloop: one event per line until stdin closes
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "status" {
            println!("STATUS {}", *status_rx.borrow());
            continue;
        }
        match parse_event(line) {
            Ok(event) => match ingestion.handle(event) {
                Some(ack) => println!("ACK {} {} {:?}", ack.conn.0, ack.offset, ack.status),
                None => println!("OK"),
            },
            Err(e) => eprintln!("ERR {e}"),
        }
    }

    shutdown_tx.send_replace(true);
    if let Ok(context) = control.await {
        println!("STATUS {}", context.status());
    }
    Ok(())
}

fn parse_event(line: &str) -> std::result::Result<TransportEvent, String> {
    let mut parts = line.splitn(5, ':');
    let command = parts.next().unwrap_or_default();
    let conn = parts
        .next()
        .ok_or("no connection given")?
        .trim()
        .parse()
        .map(ConnectionId)
        .map_err(|_| "invalid connection id")?;
    let characteristic: Uuid = SCHEDULE_CHARACTERISTIC_UUID;

    match command {
        "connect" => Ok(TransportEvent::Connected { conn }),
        "cancel" => Ok(TransportEvent::Cancel { conn }),
        "disconnect" => Ok(TransportEvent::Disconnected { conn }),
        "single" => {
            // The payload may itself contain ':'
            let payload = line.splitn(3, ':').nth(2).ok_or("no payload given")?;
            Ok(TransportEvent::SingleWrite {
                conn,
                characteristic,
                payload: payload.as_bytes().to_vec(),
            })
        }
        "write" => {
            let offset = parts
                .next()
                .ok_or("no offset given")?
                .trim()
                .parse()
                .map_err(|_| "invalid offset")?;
            let is_final_fragment = match parts.next().map(str::trim) {
                Some("1") => true,
                Some("0") => false,
                _ => return Err("final flag must be 0 or 1".into()),
            };
            let payload = parts.next().unwrap_or_default();
            Ok(TransportEvent::Fragment {
                conn,
                characteristic,
                offset,
                payload: payload.as_bytes().to_vec(),
                is_final_fragment,
            })
        }
        other => Err(format!("Unknown command: {other}")),
    }
}
