//! The send gate: the only way into the TX ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::{sync::mpsc, time::timeout};

use super::{AckEvent, Shared, TransportError, TransportStatus, report};
use crate::{
    fatal::{Restart, RestartReason},
    logging::{debug, error, trace, warn},
    wire::{AckReason, Packet},
};

pub(super) struct Gate {
    pub(super) shared: Arc<Shared>,
    pub(super) outbound: mpsc::Receiver<Packet>,
    pub(super) socket: mpsc::Sender<Packet>,
    pub(super) acks: mpsc::Sender<AckEvent>,
    pub(super) restart: Arc<dyn Restart>,
    pub(super) qcore_timeout: Duration,
}

impl Gate {
    pub(super) async fn run(mut self) {
        while let Some(pkt) = self.outbound.recv().await {
            if let Err(e) = self.admit(pkt).await {
                error!("Send gate wedged: {e:?}");
                self.restart.restart(RestartReason::Stalled);
                return;
            }
        }
        debug!("Send gate closed");
    }

    /// Tracks `pkt` in the TX ledger and queues it for the writer, or NAKs
    /// it straight back when there is no session to write it to.
    async fn admit(&self, pkt: Packet) -> Result<(), TransportError> {
        let id = pkt.txn_id();
        if self.shared.status() == TransportStatus::Down {
            warn!("Transport down, NAKing {id}");
            return self.nak(id).await;
        }

        // Retransmission needs the bytes, plain tracking does not.
        let store = cfg!(feature = "retry");
        if let Err(e) = self.shared.tx_ledger.add(pkt.as_bytes(), id, store).await {
            warn!("TX ledger refused {id}: {e:?}");
            return self.nak(id).await;
        }

        trace!("Queueing {:?} {id} for the writer", pkt.packet_type());
        match timeout(self.qcore_timeout, self.socket.send(pkt)).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                warn!("Writer did not take {id}");
                // The sweep may have resolved it already.
                match self.shared.tx_ledger.delete(id) {
                    Ok(_) => self.nak(id).await,
                    Err(_) => Ok(()),
                }
            }
        }
    }

    async fn nak(&self, txn_id: u16) -> Result<(), TransportError> {
        self.shared.stats(|s| s.naks += 1);
        let event = AckEvent {
            txn_id,
            reason: AckReason::TCP_DOWN,
        };
        report(&self.acks, self.qcore_timeout, event).await
    }
}
