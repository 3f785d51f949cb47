//! Resolves every TX-ledger entry exactly once.
//!
//! Three things can end an entry: a host ack from the chunker, a failed (or
//! ack-less) local write reported by the writer, or the sweep deciding the
//! server is never going to answer. Whichever deletes the entry first
//! reports to the orchestrator; the others find nothing and stay quiet.

use std::sync::Arc;

use tokio::{
    select,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval},
};

use super::{AckEvent, Shared, TransportError, WriteAck, report};
use crate::{
    fatal::{Restart, RestartReason},
    ledger::WalkAction,
    logging::{debug, error, trace, warn},
    settings::Settings,
    wire::{AckReason, Packet},
};

pub(super) struct TxManager {
    pub(super) shared: Arc<Shared>,
    pub(super) host_acks: mpsc::Receiver<AckEvent>,
    pub(super) write_acks: mpsc::Receiver<WriteAck>,
    #[cfg_attr(not(feature = "retry"), allow(dead_code))]
    pub(super) socket: mpsc::Sender<Packet>,
    pub(super) acks: mpsc::Sender<AckEvent>,
    pub(super) restart: Arc<dyn Restart>,
    pub(super) settings: Settings,
}

impl TxManager {
    pub(super) async fn run(mut self) {
        let mut tick = interval(self.settings.sweep_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let res = select! {
                ack = self.host_acks.recv() => match ack {
                    Some(ack) => self.host_ack(ack).await,
                    None => break,
                },
                wa = self.write_acks.recv() => match wa {
                    Some(wa) => self.write_ack(wa).await,
                    None => break,
                },
                _ = tick.tick() => self.sweep().await,
            };
            if let Err(e) = res {
                error!("TX manager could not report: {e:?}");
                self.restart.restart(RestartReason::Stalled);
                return;
            }
        }
        debug!("TX manager closed");
    }

    async fn host_ack(&self, ack: AckEvent) -> Result<(), TransportError> {
        self.shared.stats(|s| s.host_acks += 1);
        match self.shared.tx_ledger.delete(ack.txn_id) {
            Ok(_) => {
                trace!("Host acked {} ({:?})", ack.txn_id, ack.reason);
                self.report(ack).await
            }
            Err(_) => {
                debug!("Host ack for {} matches nothing", ack.txn_id);
                Ok(())
            }
        }
    }

    async fn write_ack(&self, wa: WriteAck) -> Result<(), TransportError> {
        let ledger = &self.shared.tx_ledger;
        if !wa.written {
            if ledger.delete(wa.txn_id).is_err() {
                return Ok(());
            }
            warn!("Write of {} failed", wa.txn_id);
            self.shared.stats(|s| s.naks += 1);
            return self.report_reason(wa.txn_id, AckReason::TCP_DOWN).await;
        }

        if !wa.consumer_ack_req {
            if ledger.delete(wa.txn_id).is_err() {
                return Ok(());
            }
            return self.report_reason(wa.txn_id, AckReason::GOOD).await;
        }

        // Resolved already when the host ack beat the write ack here.
        if ledger.mark_internally_acked(wa.txn_id).is_ok() {
            trace!("{} on the wire, waiting for the host", wa.txn_id);
        }
        Ok(())
    }

    /// Expires entries past the failure deadline and, with the `retry`
    /// feature, re-queues stored entries past the retry deadline.
    async fn sweep(&self) -> Result<(), TransportError> {
        let now = Instant::now();
        let fail_after = self.settings.fail_after;
        let retry_after = self.settings.retry_after;
        let max_retries = self.settings.max_retries;

        let mut expired = Vec::new();
        let mut resend: Vec<Vec<u8>> = Vec::new();

        self.shared.tx_ledger.walk(|t| {
            let age = t.age(now);
            if age < retry_after {
                return WalkAction::Keep;
            }
            if age >= fail_after {
                expired.push(t.id);
                return WalkAction::Remove;
            }
            if !t.internally_acked {
                warn!("{} not on the wire after {:?}", t.id, age);
                return WalkAction::Keep;
            }
            let due = retry_after * (u32::from(t.retries) + 1);
            if cfg!(feature = "retry") && age >= due && t.retries < max_retries {
                if let Some(bytes) = &t.payload {
                    t.retries += 1;
                    t.internally_acked = false;
                    resend.push(bytes.clone());
                }
            }
            WalkAction::Keep
        });

        for bytes in resend {
            self.resend(&bytes);
        }
        for id in expired {
            warn!("No host ack for {id} within {fail_after:?}, giving up");
            self.shared.stats(|s| s.timeouts += 1);
            self.report_reason(id, AckReason::SERVER_TIMED_OUT).await?;
        }
        Ok(())
    }

    #[cfg(feature = "retry")]
    fn resend(&self, bytes: &[u8]) {
        let Ok(pkt) = Packet::from_bytes(bytes) else {
            return;
        };
        warn!("Resending {}", pkt.txn_id());
        if self.socket.try_send(pkt).is_ok() {
            self.shared.stats(|s| s.resends += 1);
        }
    }

    #[cfg(not(feature = "retry"))]
    fn resend(&self, _bytes: &[u8]) {}

    async fn report_reason(&self, txn_id: u16, reason: AckReason) -> Result<(), TransportError> {
        self.report(AckEvent { txn_id, reason }).await
    }

    async fn report(&self, ack: AckEvent) -> Result<(), TransportError> {
        report(&self.acks, self.settings.qcore_timeout, ack).await
    }
}
