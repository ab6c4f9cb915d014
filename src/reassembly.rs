/*!
 # Fragment reassembly

 Accumulates prepared-write fragments into one complete configuration message.
 The backing buffer is bounded by the maximum message size, allocated on the
 first fragment and released on commit or cancel.
*/

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::queue::HandoffMessage;

/// Maximum size of one configuration message in bytes
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Errors raised on the ingestion side. All of them are non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    /// Fragment lands outside the bounded message buffer
    #[error("Fragment at offset {offset} (+{len} bytes) exceeds maximum message size {max}")]
    OffsetOutOfRange { offset: usize, len: usize, max: usize },

    /// Backing buffer could not be allocated; reassembly must restart
    #[error("No memory for a {0} byte reassembly buffer")]
    ResourceExhausted(usize),

    /// A new message started while another one is still pending
    #[error("Reassembly already in progress ({0} bytes pending)")]
    ReassemblyInProgress(usize),

    /// Unfragmented write larger than the maximum message size
    #[error("Message of {len} bytes exceeds maximum message size {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// Hand-off queue is full, newest message dropped
    #[error("Hand-off queue full, message of {0} bytes dropped")]
    QueueFull(usize),

    /// Control side is gone
    #[error("Hand-off queue closed")]
    QueueClosed,
}

/// Result of feeding one fragment to the reassembler
#[derive(Debug)]
pub enum FragmentOutcome {
    /// More fragments are expected
    Pending,
    /// The message is complete; ownership moves to the caller
    Complete(HandoffMessage),
    /// The fragment was refused
    Rejected(IngestionError),
}

/// In-progress message for one connection
#[derive(Debug)]
struct PendingFragmentBuffer {
    data: Vec<u8>,
    written_len: usize,
}

/// Reassembles one logical message at a time from prepared-write fragments
#[derive(Debug)]
pub struct MessageReassembler {
    max_size: usize,
    pending: Option<PendingFragmentBuffer>,
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MessageReassembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            pending: None,
        }
    }

    /// Maximum message size accepted by this reassembler
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whether a message is currently being assembled
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes accumulated so far for the pending message
    pub fn written_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.written_len)
    }

    /// Feeds one fragment.
    ///
    /// Bytes are copied at `offset`; the accumulated length grows by the
    /// fragment length even when offsets are not contiguous. A gap leaves
    /// zero bytes in the buffer, which the decoder rejects.
    pub fn begin_or_append(
        &mut self,
        offset: usize,
        bytes: &[u8],
        is_final_fragment: bool,
    ) -> FragmentOutcome {
        let end = offset.saturating_add(bytes.len());
        if offset > self.max_size || end > self.max_size {
            warn!(
                "Rejecting fragment at offset {} ({} bytes), limit is {}",
                offset,
                bytes.len(),
                self.max_size
            );
            return FragmentOutcome::Rejected(IngestionError::OffsetOutOfRange {
                offset,
                len: bytes.len(),
                max: self.max_size,
            });
        }

        if offset == 0 {
            if let Some(pending) = &self.pending {
                if pending.written_len > 0 {
                    warn!(
                        "New message started with {} bytes still pending",
                        pending.written_len
                    );
                    return FragmentOutcome::Rejected(IngestionError::ReassemblyInProgress(
                        pending.written_len,
                    ));
                }
            }
        }

        if self.pending.is_none() {
            let mut data = Vec::new();
            if data.try_reserve_exact(self.max_size).is_err() {
                warn!("Reassembly buffer allocation failed, abandoning message");
                return FragmentOutcome::Rejected(IngestionError::ResourceExhausted(
                    self.max_size,
                ));
            }
            data.resize(self.max_size, 0);
            debug!("Allocated {} byte reassembly buffer", self.max_size);
            self.pending = Some(PendingFragmentBuffer {
                data,
                written_len: 0,
            });
        }

        let Some(pending) = self.pending.as_mut() else {
            return FragmentOutcome::Rejected(IngestionError::ResourceExhausted(self.max_size));
        };
        pending.data[offset..end].copy_from_slice(bytes);
        pending.written_len = (pending.written_len + bytes.len()).min(self.max_size);
        trace!(
            "Fragment accepted: offset={}, len={}, total={}",
            offset,
            bytes.len(),
            pending.written_len
        );

        if !is_final_fragment {
            return FragmentOutcome::Pending;
        }

        match self.pending.take() {
            Some(mut done) => {
                done.data.truncate(done.written_len);
                debug!("Message complete: {} bytes", done.written_len);
                FragmentOutcome::Complete(HandoffMessage::new(done.data))
            }
            None => FragmentOutcome::Pending,
        }
    }

    /// Discards the in-progress buffer, if any, without decoding it
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Reassembly cancelled, {} bytes discarded", pending.written_len);
        }
    }
}
