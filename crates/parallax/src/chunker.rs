//! Turns the inbound byte stream into routed frames.
//!
//! [`FrameAccumulator`] does the reassembly; the chunker decides where each
//! finished frame goes. Server acks are forwarded to the TX manager, every
//! other accepted frame is parked in the RX ledger and announced to the
//! orchestrator, with a device ack sent back when the server asked for one.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use frame_acc::{FeedResult, FrameAccumulator};
use tokio::{sync::mpsc, time::timeout};

use crate::{
    fatal::{Restart, RestartReason},
    ledger::Ledger,
    logging::{error, trace, warn},
    transport::AckEvent,
    wire::{AckReason, DecodeError, MAX_FRAME_LEN, Packet, PacketType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChunkError {
    /// A frame started with a tag the device does not accept.
    UnknownType(u8),
    Oversized(u8),
    Malformed(DecodeError),
    /// A downstream queue or the RX ledger did not accept the frame in time.
    Stalled,
    /// The server asked for a crash; the restart has been requested.
    Crashed,
}

/// Frame length for the tags the device accepts from the server.
pub fn inbound_frame_len(tag: u8) -> Option<usize> {
    let ty = PacketType::from_u8(tag)?;
    match ty {
        PacketType::Data | PacketType::Cmd | PacketType::ServerAck | PacketType::Fota => {
            Some(ty.frame_len())
        }
        PacketType::Echo if cfg!(feature = "test-mode") => Some(ty.frame_len()),
        // Only the tag is consumed, the device does not wait for more.
        PacketType::Crash if cfg!(feature = "test-mode") => Some(1),
        _ => None,
    }
}

/// Where routed frames go.
#[derive(Clone)]
pub struct ChunkerSinks {
    pub rx_ledger: Arc<Ledger>,
    /// Type of each frame parked in the RX ledger, in arrival order.
    pub processed: mpsc::Sender<PacketType>,
    pub host_acks: mpsc::Sender<AckEvent>,
    pub device_acks: mpsc::Sender<Packet>,
    /// One-shot: swallow the device ack of the next frame.
    pub skip_next_ack: Arc<AtomicBool>,
    pub restart: Arc<dyn Restart>,
    pub qcore_timeout: Duration,
}

pub struct Chunker {
    acc: FrameAccumulator<Box<[u8]>>,
    sinks: ChunkerSinks,
}

// ---- impls ----

impl Chunker {
    pub fn new(sinks: ChunkerSinks) -> Self {
        Self {
            acc: FrameAccumulator::new_boxslice(MAX_FRAME_LEN, inbound_frame_len),
            sinks,
        }
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.acc.reset();
    }

    pub fn in_frame(&self) -> bool {
        self.acc.in_frame()
    }

    /// Feeds one read worth of bytes, routing every frame it completes.
    ///
    /// Returns the number of frames routed. On error the partial frame is
    /// gone and the stream should be considered out of sync.
    pub async fn feed(&mut self, input: &[u8]) -> Result<usize, ChunkError> {
        let mut window = input;
        let mut routed = 0;

        while !window.is_empty() {
            let (frame, remaining) = match self.acc.feed(window) {
                FeedResult::Consumed => break,
                FeedResult::Success { data, remaining } => (data.to_vec(), remaining),
                FeedResult::SuccessInput { data, remaining } => (data.to_vec(), remaining),
                FeedResult::UnknownTag { tag, .. } => {
                    error!("Out of sync, unknown packet type {tag}");
                    return Err(ChunkError::UnknownType(tag));
                }
                FeedResult::OverFull { tag, .. } => {
                    error!("Packet type {tag} does not fit the receive buffer");
                    return Err(ChunkError::Oversized(tag));
                }
            };
            window = remaining;
            self.sinks.route(&frame).await?;
            routed += 1;
        }
        Ok(routed)
    }
}

impl ChunkerSinks {
    async fn route(&self, frame: &[u8]) -> Result<(), ChunkError> {
        if frame.first() == Some(&(PacketType::Crash as u8)) {
            warn!("Server requested a crash");
            self.restart.restart(RestartReason::CrashRequested);
            return Err(ChunkError::Crashed);
        }

        let pkt = Packet::from_bytes(frame).map_err(ChunkError::Malformed)?;
        let ty = pkt.packet_type();
        let id = pkt.txn_id();
        trace!("Routing {ty:?} id {id}");

        if ty == PacketType::ServerAck {
            let ack = AckEvent {
                txn_id: id,
                reason: pkt.ack_reason(),
            };
            return self.forward(&self.host_acks, ack).await;
        }

        match timeout(self.qcore_timeout, self.rx_ledger.add(frame, id, true)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!("RX ledger refused {id}: {e:?}");
                return Err(ChunkError::Stalled);
            }
            Err(_) => {
                error!("RX ledger stayed full");
                return Err(ChunkError::Stalled);
            }
        }
        self.forward(&self.processed, ty).await?;

        if pkt.consumer_ack_required() {
            if self.skip_next_ack.swap(false, Ordering::AcqRel) {
                warn!("Not acking {id}, as requested");
            } else {
                let ack = Packet::ack(PacketType::DeviceAck, id, AckReason::GOOD);
                self.forward(&self.device_acks, ack).await?;
            }
        }
        Ok(())
    }

    async fn forward<T>(&self, tx: &mpsc::Sender<T>, msg: T) -> Result<(), ChunkError> {
        match timeout(self.qcore_timeout, tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                error!("Queue closed while routing");
                Err(ChunkError::Stalled)
            }
            Err(_) => {
                error!("Queue full for {:?}", self.qcore_timeout);
                Err(ChunkError::Stalled)
            }
        }
    }
}
