/*!
 # Transport boundary

 Translates the events delivered by the wireless link into the three calls the
 core understands: append a fragment, cancel reassembly, and push a complete
 message onto the hand-off queue. Nothing else crosses this boundary.

 This runs on the ingestion side and never touches the schedule.
*/

use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::queue::{HandoffMessage, HandoffProducer};
use crate::reassembly::{FragmentOutcome, IngestionError, MessageReassembler};

/// Characteristic that carries the schedule record (16-bit 0xFF01)
pub const SCHEDULE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ff01_0000_1000_8000_0080_5f9b_34fb);

/// Logical connection handle assigned by the link layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u16);

/// Events delivered by the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A central connected
    Connected { conn: ConnectionId },
    /// One prepared-write fragment of a longer message
    Fragment {
        conn: ConnectionId,
        characteristic: Uuid,
        offset: usize,
        payload: Vec<u8>,
        is_final_fragment: bool,
    },
    /// A complete message in a single write
    SingleWrite {
        conn: ConnectionId,
        characteristic: Uuid,
        payload: Vec<u8>,
    },
    /// The sender aborted its prepared writes
    Cancel { conn: ConnectionId },
    /// The central went away
    Disconnected { conn: ConnectionId },
}

/// Acknowledgement code returned to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    /// Offset outside the message buffer; distinct from a generic failure
    InvalidOffset,
    /// Message larger than the buffer in one write
    InvalidLength,
    /// No memory; the sender must restart the message
    InsufficientResources,
    /// Another message is already being assembled on this connection
    InProgress,
    /// The control side cannot take the message right now
    Busy,
    /// Write to a characteristic this device does not accept
    NotPermitted,
}

impl From<&IngestionError> for AckStatus {
    fn from(error: &IngestionError) -> Self {
        match error {
            IngestionError::OffsetOutOfRange { .. } => AckStatus::InvalidOffset,
            IngestionError::MessageTooLarge { .. } => AckStatus::InvalidLength,
            IngestionError::ResourceExhausted(_) => AckStatus::InsufficientResources,
            IngestionError::ReassemblyInProgress(_) => AckStatus::InProgress,
            IngestionError::QueueFull(_) | IngestionError::QueueClosed => AckStatus::Busy,
        }
    }
}

/// Response to one write event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub conn: ConnectionId,
    pub offset: usize,
    pub status: AckStatus,
}

/// Ingestion side: one reassembler per connection, one producer handle
#[derive(Debug)]
pub struct IngestionAdapter {
    producer: HandoffProducer,
    max_message_size: usize,
    reassemblers: HashMap<ConnectionId, MessageReassembler>,
}

impl IngestionAdapter {
    pub fn new(producer: HandoffProducer, max_message_size: usize) -> Self {
        Self {
            producer,
            max_message_size,
            reassemblers: HashMap::new(),
        }
    }

    /// Whether `conn` has a message being assembled
    pub fn is_pending(&self, conn: ConnectionId) -> bool {
        self.reassemblers
            .get(&conn)
            .is_some_and(MessageReassembler::is_pending)
    }

    /// Handles one link event. Write events get exactly one acknowledgement.
    #[instrument(skip(self, event))]
    pub fn handle(&mut self, event: TransportEvent) -> Option<Ack> {
        match event {
            TransportEvent::Connected { conn } => {
                info!("Connection {:?} opened", conn);
                self.reassemblers
                    .insert(conn, MessageReassembler::new(self.max_message_size));
                None
            }
            TransportEvent::Fragment {
                conn,
                characteristic,
                offset,
                payload,
                is_final_fragment,
            } => {
                if characteristic != SCHEDULE_CHARACTERISTIC_UUID {
                    return Some(Self::not_permitted(conn, offset, characteristic));
                }
                let max = self.max_message_size;
                let reassembler = self
                    .reassemblers
                    .entry(conn)
                    .or_insert_with(|| MessageReassembler::new(max));
                let status = match reassembler.begin_or_append(offset, &payload, is_final_fragment)
                {
                    FragmentOutcome::Pending => AckStatus::Ok,
                    FragmentOutcome::Complete(message) => self.enqueue(message),
                    FragmentOutcome::Rejected(e) => {
                        warn!("Fragment from {:?} rejected: {}", conn, e);
                        AckStatus::from(&e)
                    }
                };
                Some(Ack {
                    conn,
                    offset,
                    status,
                })
            }
            TransportEvent::SingleWrite {
                conn,
                characteristic,
                payload,
            } => {
                if characteristic != SCHEDULE_CHARACTERISTIC_UUID {
                    return Some(Self::not_permitted(conn, 0, characteristic));
                }
                let status = if payload.len() > self.max_message_size {
                    let e = IngestionError::MessageTooLarge {
                        len: payload.len(),
                        max: self.max_message_size,
                    };
                    warn!("Write from {:?} rejected: {}", conn, e);
                    AckStatus::from(&e)
                } else {
                    self.enqueue(HandoffMessage::new(payload))
                };
                Some(Ack {
                    conn,
                    offset: 0,
                    status,
                })
            }
            TransportEvent::Cancel { conn } => {
                debug!("Prepared writes cancelled on {:?}", conn);
                if let Some(reassembler) = self.reassemblers.get_mut(&conn) {
                    reassembler.cancel();
                }
                None
            }
            TransportEvent::Disconnected { conn } => {
                info!("Connection {:?} closed", conn);
                // Dropping the reassembler releases any partial buffer
                self.reassemblers.remove(&conn);
                None
            }
        }
    }

    fn enqueue(&self, message: HandoffMessage) -> AckStatus {
        match self.producer.push(message) {
            Ok(()) => AckStatus::Ok,
            Err(e) => AckStatus::from(&e),
        }
    }

    fn not_permitted(conn: ConnectionId, offset: usize, characteristic: Uuid) -> Ack {
        warn!(
            "Write from {:?} to unknown characteristic {}",
            conn, characteristic
        );
        Ack {
            conn,
            offset,
            status: AckStatus::NotPermitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handoff_queue;

    const CONN: ConnectionId = ConnectionId(1);

    fn fragment(offset: usize, payload: &[u8], last: bool) -> TransportEvent {
        TransportEvent::Fragment {
            conn: CONN,
            characteristic: SCHEDULE_CHARACTERISTIC_UUID,
            offset,
            payload: payload.to_vec(),
            is_final_fragment: last,
        }
    }

    fn status(ack: Option<Ack>) -> AckStatus {
        ack.map(|a| a.status).expect("write events are acknowledged")
    }

    #[test]
    fn fragments_are_acknowledged_and_delivered() {
        let (producer, mut consumer) = handoff_queue(4);
        let mut adapter = IngestionAdapter::new(producer, 64);

        assert!(adapter.handle(TransportEvent::Connected { conn: CONN }).is_none());
        assert_eq!(status(adapter.handle(fragment(0, b"hello ", false))), AckStatus::Ok);
        assert!(adapter.is_pending(CONN));
        assert_eq!(status(adapter.handle(fragment(6, b"world", true))), AckStatus::Ok);
        assert!(!adapter.is_pending(CONN));

        let message = consumer.try_pop().expect("message delivered");
        assert_eq!(message.as_bytes(), b"hello world");
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn invalid_offset_gets_distinct_negative_ack() {
        let (producer, _consumer) = handoff_queue(4);
        let mut adapter = IngestionAdapter::new(producer, 16);
        assert_eq!(
            status(adapter.handle(fragment(100, b"x", false))),
            AckStatus::InvalidOffset
        );
    }

    #[test]
    fn cancel_and_disconnect_drop_partial_message() {
        let (producer, mut consumer) = handoff_queue(4);
        let mut adapter = IngestionAdapter::new(producer, 64);

        adapter.handle(fragment(0, b"partial", false));
        assert!(adapter.handle(TransportEvent::Cancel { conn: CONN }).is_none());
        assert!(!adapter.is_pending(CONN));

        adapter.handle(fragment(0, b"again", false));
        adapter.handle(TransportEvent::Disconnected { conn: CONN });
        assert!(!adapter.is_pending(CONN));
        assert!(consumer.try_pop().is_none(), "nothing reaches the control side");
    }

    #[test]
    fn connections_assemble_independently() {
        let (producer, mut consumer) = handoff_queue(4);
        let mut adapter = IngestionAdapter::new(producer, 64);
        let other = ConnectionId(2);

        adapter.handle(fragment(0, b"aa", false));
        adapter.handle(TransportEvent::Fragment {
            conn: other,
            characteristic: SCHEDULE_CHARACTERISTIC_UUID,
            offset: 0,
            payload: b"bb".to_vec(),
            is_final_fragment: true,
        });
        adapter.handle(fragment(2, b"AA", true));

        assert_eq!(consumer.try_pop().map(|m| m.as_bytes().to_vec()), Some(b"bb".to_vec()));
        assert_eq!(consumer.try_pop().map(|m| m.as_bytes().to_vec()), Some(b"aaAA".to_vec()));
    }

    #[test]
    fn single_writes_bypass_reassembly() {
        let (producer, mut consumer) = handoff_queue(1);
        let mut adapter = IngestionAdapter::new(producer, 8);
        let write = |payload: &[u8]| TransportEvent::SingleWrite {
            conn: CONN,
            characteristic: SCHEDULE_CHARACTERISTIC_UUID,
            payload: payload.to_vec(),
        };

        assert_eq!(status(adapter.handle(write(b"tiny"))), AckStatus::Ok);
        assert_eq!(status(adapter.handle(write(b"full"))), AckStatus::Busy);
        assert_eq!(
            status(adapter.handle(write(b"way too long"))),
            AckStatus::InvalidLength
        );
        assert_eq!(consumer.try_pop().map(|m| m.len()), Some(4));
    }

    #[test]
    fn foreign_characteristic_is_refused() {
        let (producer, mut consumer) = handoff_queue(1);
        let mut adapter = IngestionAdapter::new(producer, 64);
        let ack = adapter.handle(TransportEvent::SingleWrite {
            conn: CONN,
            characteristic: Uuid::nil(),
            payload: b"{}".to_vec(),
        });
        assert_eq!(status(ack), AckStatus::NotPermitted);
        assert!(consumer.try_pop().is_none());
    }
}
