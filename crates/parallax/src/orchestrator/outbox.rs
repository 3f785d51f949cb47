//! Everything the orchestrator sends goes through here.
//!
//! A packet is parked in the CR ledger before it reaches the transport, so
//! its ack always has something to match against.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::{
    Guarded,
    fatal::{Fatal, RestartReason},
    fota::FotaAcks,
    ledger::{Ledger, LedgerKind},
    logging::{error, trace},
    transport::TransportHandle,
    wire::{CmdResp, CmdStatus, FotaAck, FotaKind, FotaStatus, Packet, PacketType, Payload},
};

/// Device transaction ids wrap below this.
const DEVICE_ID_SPAN: u16 = 1000;

#[derive(Clone)]
pub struct Outbox {
    cr: Arc<Ledger>,
    transport: TransportHandle,
    last_id: Arc<Guarded<u16>>,
    qcore_timeout: Duration,
}

impl Outbox {
    pub(crate) fn new(transport: TransportHandle, capacity: usize, qcore_timeout: Duration) -> Self {
        Self {
            cr: Arc::new(Ledger::new(LedgerKind::Cr, capacity)),
            transport,
            last_id: Arc::new(Guarded::new(0)),
            qcore_timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.cr
    }

    pub fn next_id(&self) -> u16 {
        self.last_id.with_lock(|id| {
            *id = (*id + 1) % DEVICE_ID_SPAN;
            *id
        })
    }

    /// Tracks `pkt` in the CR ledger and hands it to the transport.
    pub async fn send(&self, pkt: Packet) -> Result<u16, Fatal> {
        let id = pkt.txn_id();
        match timeout(self.qcore_timeout, self.cr.add(pkt.as_bytes(), id, true)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!("CR ledger refused {id}: {e:?}");
                return Err(Fatal::invariant("CR ledger refused a packet"));
            }
            Err(_) => {
                error!("CR ledger stayed full for {:?}", self.qcore_timeout);
                return Err(Fatal(RestartReason::Stalled));
            }
        }
        trace!("Sending {:?} {id}", pkt.packet_type());
        self.transport.send(pkt).await.map_err(|e| {
            error!("Transport did not take {id}: {e:?}");
            Fatal(RestartReason::Stalled)
        })?;
        Ok(id)
    }

    /// A fresh transaction carrying `payload`.
    pub async fn send_payload<P: Payload>(&self, ty: PacketType, payload: &P) -> Result<u16, Fatal> {
        let pkt = Packet::with_payload(ty, self.next_id(), true, payload);
        self.send(pkt).await
    }

    pub async fn respond(&self, orig: u16, status: CmdStatus) -> Result<(), Fatal> {
        self.respond_with(&CmdResp::status(status, orig)).await
    }

    pub async fn respond_with(&self, resp: &CmdResp) -> Result<(), Fatal> {
        self.send_payload(PacketType::CmdResp, resp).await.map(drop)
    }
}

impl FotaAcks for Outbox {
    async fn ack(&self, kind: FotaKind, status: FotaStatus) -> Result<(), Fatal> {
        self.send_payload(PacketType::FotaAck, &FotaAck { kind, status })
            .await
            .map(drop)
    }
}
