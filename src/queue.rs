/*!
 # Hand-off queue

 The only thing shared between the ingestion side and the control side.
 Completed messages move through it exactly once; the producer never blocks
 and the consumer polls with a short timeout.
*/

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::reassembly::IngestionError;

/// An owned, immutable configuration message.
///
/// Not `Clone`: it moves from producer to consumer exactly once and is
/// released when the consumer drops it.
#[derive(Debug, PartialEq, Eq)]
pub struct HandoffMessage {
    data: Box<[u8]>,
}

impl HandoffMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Creates a bounded hand-off queue holding at most `depth` messages
pub fn handoff_queue(depth: usize) -> (HandoffProducer, HandoffConsumer) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (HandoffProducer { tx }, HandoffConsumer { rx })
}

/// Ingestion-side handle. Cheap to clone, one per connection if needed.
#[derive(Debug, Clone)]
pub struct HandoffProducer {
    tx: mpsc::Sender<HandoffMessage>,
}

impl HandoffProducer {
    /// Pushes a completed message without waiting.
    ///
    /// When the queue is full the newest message (this one) is dropped.
    pub fn push(&self, message: HandoffMessage) -> Result<(), IngestionError> {
        let len = message.len();
        match self.tx.try_send(message) {
            Ok(()) => {
                debug!("Enqueued {} byte message", len);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_dropped)) => {
                warn!("Hand-off queue full, dropping {} byte message", len);
                Err(IngestionError::QueueFull(len))
            }
            Err(mpsc::error::TrySendError::Closed(_dropped)) => {
                warn!("Hand-off queue closed, dropping {} byte message", len);
                Err(IngestionError::QueueClosed)
            }
        }
    }
}

/// Control-side handle
#[derive(Debug)]
pub struct HandoffConsumer {
    rx: mpsc::Receiver<HandoffMessage>,
}

impl HandoffConsumer {
    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `None` on timeout or when every producer is gone.
    pub async fn poll(&mut self, timeout: Duration) -> Option<HandoffMessage> {
        match time::timeout(timeout, self.rx.recv()).await {
            Ok(message) => message,
            Err(_) => {
                trace!("No message within {:?}", timeout);
                None
            }
        }
    }

    /// Takes the next message if one is already waiting
    pub fn try_pop(&mut self) -> Option<HandoffMessage> {
        self.rx.try_recv().ok()
    }
}
