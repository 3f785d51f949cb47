//! The device side of the backend connection.
//!
//! ```text
//!  orchestrator ──send()──▶ gate ──▶ TX ledger ──▶ socket queue ──▶ tx_worker ──▶ TCP
//!       ▲                    │                                          │
//!       │                    └─ NAK while DOWN                          │ WriteAck
//!       │                                                               ▼
//!       └──────────── AckEvent ◀──────────── tx_manager ◀── host acks ◀─ RxWorker ◀── TCP
//!                                              (sweep)
//! ```
//!
//! [`Transport::new`] builds the pieces, [`Transport::spawn`] starts the
//! session supervisor, the send gate and the TX manager. Upper layers only
//! ever see a [`TransportHandle`] and the two receivers in
//! [`TransportEvents`].

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use maitake_sync::WaitQueue;
use tokio::{sync::mpsc, time::timeout};

use crate::{
    Guarded,
    chunker::ChunkerSinks,
    fatal::Restart,
    ledger::{Ledger, LedgerKind},
    link::Link,
    logging::{debug, error},
    settings::Settings,
    wire::{AckReason, Packet, PacketType},
};

mod gate;
mod session;
mod tx_manager;

/// The outcome of one outbound packet, as seen by whoever sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEvent {
    pub txn_id: u16,
    pub reason: AckReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The send queue stayed full for the whole core timeout.
    Stalled,
    /// The transport tasks are gone.
    Closed,
}

/// Counters, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub sessions: u32,
    pub frames_in: u64,
    pub frames_out: u64,
    pub host_acks: u64,
    pub timeouts: u64,
    pub naks: u64,
    pub resends: u64,
}

/// Local delivery result of one frame, reported by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteAck {
    pub txn_id: u16,
    pub written: bool,
    pub consumer_ack_req: bool,
}

pub(crate) struct Shared {
    status: Guarded<TransportStatus>,
    /// Bumped on every DOWN -> UP edge.
    up_edges: Guarded<u32>,
    up_wq: WaitQueue,
    threads_destroyed: Guarded<u8>,
    destroyed_wq: WaitQueue,
    tx_ledger: Arc<Ledger>,
    rx_ledger: Arc<Ledger>,
    skip_next_ack: Arc<AtomicBool>,
    stats: Guarded<TransportStats>,
}

/// Cheap, cloneable access to a running transport.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Packet>,
    qcore_timeout: Duration,
}

/// What the transport hands upwards.
pub struct TransportEvents {
    /// Type of every frame parked in the RX ledger, in order.
    pub processed: mpsc::Receiver<PacketType>,
    /// One event per packet given to [`TransportHandle::send`].
    pub acks: mpsc::Receiver<AckEvent>,
}

pub struct Transport {
    session: session::Supervisor,
    gate: gate::Gate,
    tx_manager: tx_manager::TxManager,
}

// ---- impls ----

impl Shared {
    pub(crate) fn status(&self) -> TransportStatus {
        self.status.with_lock(|s| *s)
    }

    fn set_status(&self, status: TransportStatus) {
        let edge = self.status.with_lock(|s| {
            let edge = *s == TransportStatus::Down && status == TransportStatus::Up;
            *s = status;
            edge
        });
        if edge {
            self.up_edges.with_lock(|n| *n = n.wrapping_add(1));
        }
        self.up_wq.wake_all();
    }

    fn thread_destroyed(&self) {
        self.threads_destroyed.with_lock(|n| *n += 1);
        self.destroyed_wq.wake_all();
    }

    fn stats(&self, f: impl FnOnce(&mut TransportStats)) {
        self.stats.with_lock(f)
    }
}

impl TransportHandle {
    pub fn status(&self) -> TransportStatus {
        self.shared.status()
    }

    pub fn is_up(&self) -> bool {
        self.status() == TransportStatus::Up
    }

    /// Queues `pkt` for the send gate.
    ///
    /// Exactly one [`AckEvent`] for `pkt.txn_id()` will come out of
    /// [`TransportEvents::acks`] later, even when the transport is down.
    pub async fn send(&self, pkt: Packet) -> Result<(), TransportError> {
        match timeout(self.qcore_timeout, self.outbound.send(pkt)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                error!("Send gate did not take a packet for {:?}", self.qcore_timeout);
                Err(TransportError::Stalled)
            }
        }
    }

    /// Waits for an UP edge newer than `seen`, then records it.
    pub async fn wait_up(&self, seen: &mut u32) -> Result<(), TransportError> {
        let shared = &self.shared;
        let edge = shared
            .up_wq
            .wait_for_value(|| {
                let edge = shared.up_edges.with_lock(|n| *n);
                (edge != *seen && shared.status() == TransportStatus::Up).then_some(edge)
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        *seen = edge;
        Ok(())
    }

    pub fn rx_ledger(&self) -> &Arc<Ledger> {
        &self.shared.rx_ledger
    }

    pub fn tx_ledger(&self) -> &Arc<Ledger> {
        &self.shared.tx_ledger
    }

    /// Swallow the device ack of the next server frame.
    pub fn skip_next_device_ack(&self) {
        self.shared.skip_next_ack.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats.with_lock(|s| *s)
    }
}

impl Transport {
    /// `server` is `ip:port`.
    pub fn new(
        settings: &Settings,
        server: String,
        link: Arc<Link>,
        restart: Arc<dyn Restart>,
    ) -> (Self, TransportHandle, TransportEvents) {
        let shared = Arc::new(Shared {
            status: Guarded::new(TransportStatus::Down),
            up_edges: Guarded::new(0),
            up_wq: WaitQueue::new(),
            threads_destroyed: Guarded::new(0),
            destroyed_wq: WaitQueue::new(),
            tx_ledger: Arc::new(Ledger::new(LedgerKind::Tx, settings.ledger_capacity)),
            rx_ledger: Arc::new(Ledger::new(LedgerKind::Rx, settings.ledger_capacity)),
            skip_next_ack: Arc::new(AtomicBool::new(false)),
            stats: Guarded::new(TransportStats::default()),
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(settings.send_queue_depth);
        let (socket_tx, socket_rx) = mpsc::channel(settings.send_queue_depth);
        let (processed_tx, processed_rx) = mpsc::channel(settings.queue_depth);
        let (acks_tx, acks_rx) = mpsc::channel(settings.queue_depth);
        let (host_tx, host_rx) = mpsc::channel(settings.queue_depth);
        let (write_ack_tx, write_ack_rx) = mpsc::channel(settings.queue_depth);

        let sinks = ChunkerSinks {
            rx_ledger: shared.rx_ledger.clone(),
            processed: processed_tx,
            host_acks: host_tx,
            device_acks: socket_tx.clone(),
            skip_next_ack: shared.skip_next_ack.clone(),
            restart: restart.clone(),
            qcore_timeout: settings.qcore_timeout,
        };

        let session = session::Supervisor::new(
            settings,
            server,
            shared.clone(),
            link,
            restart.clone(),
            sinks,
            socket_rx,
            write_ack_tx,
        );
        let gate = gate::Gate {
            shared: shared.clone(),
            outbound: outbound_rx,
            socket: socket_tx.clone(),
            acks: acks_tx.clone(),
            restart: restart.clone(),
            qcore_timeout: settings.qcore_timeout,
        };
        let tx_manager = tx_manager::TxManager {
            shared: shared.clone(),
            host_acks: host_rx,
            write_acks: write_ack_rx,
            socket: socket_tx,
            acks: acks_tx,
            restart,
            settings: settings.clone(),
        };

        let handle = TransportHandle {
            shared,
            outbound: outbound_tx,
            qcore_timeout: settings.qcore_timeout,
        };
        let events = TransportEvents {
            processed: processed_rx,
            acks: acks_rx,
        };
        (
            Self {
                session,
                gate,
                tx_manager,
            },
            handle,
            events,
        )
    }

    /// Starts the supervisor, gate and TX manager on the current runtime.
    pub fn spawn(self) {
        debug!("Spawning transport tasks");
        tokio::task::spawn(self.session.run());
        tokio::task::spawn(self.gate.run());
        tokio::task::spawn(self.tx_manager.run());
    }
}

/// Hands an [`AckEvent`] to the orchestrator within the core timeout.
pub(crate) async fn report(
    acks: &mpsc::Sender<AckEvent>,
    qcore_timeout: Duration,
    event: AckEvent,
) -> Result<(), TransportError> {
    match timeout(qcore_timeout, acks.send(event)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::Stalled),
    }
}
