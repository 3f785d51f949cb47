//! The device's single point of decision.
//!
//! The orchestrator consumes three event streams: frames the chunker parked
//! in the RX ledger, ack outcomes from the transport, and login events from
//! the sensor. Server commands run one at a time in their own task; a
//! command that arrives while another is running is answered with FAILED.
//!
//! Anything that leaves device state inconsistent is not repaired in
//! process. The handler returns a [`Fatal`], the task that ran it asks the
//! injected [`Restart`] to reboot, and the boot path ([`Orchestrator::boot`])
//! cleans up from the user journal.

use std::future::Future;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use rand::Rng;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};

use crate::{
    Guarded,
    config::{BrickedCode, DeviceConfig},
    fatal::{Fatal, Restart, RestartReason},
    fota::{self, FotaAcks, FotaOutcome, FotaSession},
    ledger::Ledger,
    logging::{debug, error, info, trace, warn},
    peripherals::{Display, FirmwareTarget, LoginEvent, Sensor, UserStore},
    settings::{MANUFACTURING_DEVICE_ID, Settings},
    transport::{AckEvent, TransportEvents, TransportHandle},
    wire::{FotaDescriptor, FotaKind, FotaStatus, Hello, Login, Packet, PacketType},
};

mod commands;
mod outbox;
mod users;

pub use outbox::Outbox;
pub use users::JOURNAL_ALL;

/// Server ids sit this far above device ids.
const SERVER_ID_OFFSET: u16 = 2000;

const NO_CONNECTION: &str = "Failed - no connection";
const BRICKED_LOGIN: &str = "Device Bricked... Login failed";
const LOGIN_FAILED: &str = "Login failed    SERVER DOWN";

/// The hardware collaborators.
#[derive(Clone)]
pub struct Peripherals {
    pub sensor: Arc<dyn Sensor>,
    pub display: Arc<dyn Display>,
    pub users: Arc<dyn UserStore>,
    pub firmware: Arc<dyn FirmwareTarget>,
}

pub struct Orchestrator {
    ctx: Arc<Context>,
    processed: mpsc::Receiver<PacketType>,
    acks: mpsc::Receiver<AckEvent>,
    logins: mpsc::Receiver<LoginEvent>,
}

/// Read-only view of a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    ctx: Arc<Context>,
}

struct Context {
    settings: Settings,
    config: DeviceConfig,
    periph: Peripherals,
    transport: TransportHandle,
    outbox: Outbox,
    restart: Arc<dyn Restart>,
    registered: Guarded<bool>,
    busy: AtomicBool,
    /// Command code the next command must have.
    chain: Guarded<Option<u8>>,
    sync_defuse: Guarded<Option<oneshot::Sender<()>>>,
    /// Inbox of the running update; `Some` while one is underway.
    fota: Guarded<Option<mpsc::Sender<Packet>>>,
}

/// Holds the single outstanding-command slot.
struct BusyGuard(Arc<Context>);

// ---- impls ----

impl Orchestrator {
    pub fn new(
        settings: Settings,
        config: DeviceConfig,
        periph: Peripherals,
        transport: TransportHandle,
        events: TransportEvents,
        logins: mpsc::Receiver<LoginEvent>,
        restart: Arc<dyn Restart>,
    ) -> Self {
        let outbox = Outbox::new(
            transport.clone(),
            settings.ledger_capacity,
            settings.qcore_timeout,
        );
        let ctx = Arc::new(Context {
            settings,
            config,
            periph,
            transport,
            outbox,
            restart,
            registered: Guarded::new(false),
            busy: AtomicBool::new(false),
            chain: Guarded::new(None),
            sync_defuse: Guarded::new(None),
            fota: Guarded::new(None),
        });
        Self {
            ctx,
            processed: events.processed,
            acks: events.acks,
            logins,
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            ctx: self.ctx.clone(),
        }
    }

    /// Undoes an interrupted user edit, commits freshly installed firmware
    /// and waits a random while so a fleet does not reconnect in lockstep.
    ///
    /// Run this before the transport is spawned.
    pub async fn boot(&self) -> Result<(), Fatal> {
        let ctx = &self.ctx;
        users::recover_journal(ctx).await?;
        if fota::check_new_firmware(&ctx.config, ctx.periph.firmware.as_ref())? {
            info!("Firmware {} committed", ctx.settings.fw_version);
        }

        let range = ctx.settings.boot_delay_secs.clone();
        let secs = if range.is_empty() {
            0
        } else {
            rand::rng().random_range(range)
        };
        info!("Sleeping {secs}s before attaching");
        sleep(Duration::from_secs(secs)).await;
        Ok(())
    }

    /// Runs until the transport and the sensor both go away, or until a
    /// fatal condition has been handed to the restart capability.
    pub async fn run(self) {
        let Self {
            ctx,
            mut processed,
            acks,
            mut logins,
        } = self;

        ctx.spawn(registration(ctx.clone()));
        ctx.spawn(process_acks(ctx.clone(), acks));

        loop {
            let res = select! {
                Some(ty) = processed.recv() => ctx.handle_server_packet(ty).await,
                Some(login) = logins.recv() => ctx.handle_login(login).await,
                else => break,
            };
            if let Err(fatal) = res {
                ctx.die(fatal);
                return;
            }
        }
        debug!("Orchestrator inputs closed");
    }
}

impl OrchestratorHandle {
    pub fn is_registered(&self) -> bool {
        self.ctx.registered()
    }

    pub fn is_busy(&self) -> bool {
        self.ctx.busy.load(Ordering::Acquire)
    }

    pub fn fota_underway(&self) -> bool {
        self.ctx.fota.with_lock(|f| f.is_some())
    }

    pub fn cr_ledger(&self) -> &Arc<Ledger> {
        self.ctx.outbox.ledger()
    }
}

impl Context {
    fn registered(&self) -> bool {
        self.registered.with_lock(|r| *r)
    }

    fn set_registered(&self, registered: bool) {
        self.registered.with_lock(|r| *r = registered);
    }

    fn die(&self, Fatal(reason): Fatal) {
        error!("Unrecoverable: {reason:?}");
        self.restart.restart(reason);
    }

    /// Runs `fut` on its own task; a fatal result restarts the device.
    fn spawn<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = Result<(), Fatal>> + Send + 'static,
    {
        let ctx = self.clone();
        tokio::task::spawn(async move {
            if let Err(fatal) = fut.await {
                ctx.die(fatal);
            }
        });
    }

    fn process_ack(&self, ack: AckEvent) -> Result<(), Fatal> {
        let cr = self.outbox.ledger();
        let id = ack.txn_id;
        let raw = cr.peek(id).map_err(|e| {
            error!("Ack for {id}, which was never sent: {e:?}");
            Fatal::invariant("ack for an unknown transaction")
        })?;
        let ty = raw.first().copied().and_then(PacketType::from_u8);
        let good = ack.reason.is_good();

        match ty {
            Some(PacketType::Login) => {
                if good {
                    debug!("Login {id} delivered");
                } else {
                    warn!("Login {id} not delivered: {:?}", ack.reason);
                    self.periph.display.show(LOGIN_FAILED);
                }
                let _ = cr.delete(id);
                Ok(())
            }
            Some(
                ty @ (PacketType::Hello
                | PacketType::CmdResp
                | PacketType::FotaAck
                | PacketType::Void
                | PacketType::Echo),
            ) => {
                if !good {
                    error!("{ty:?} {id} failed with {:?}", ack.reason);
                    return Err(Fatal(RestartReason::AckFailed));
                }
                let _ = cr.delete(id);
                if ty == PacketType::Hello {
                    info!("Registered with the server");
                    self.set_registered(true);
                } else {
                    trace!("{ty:?} {id} acked");
                }
                Ok(())
            }
            other => {
                error!("Ack for {id} of untracked type {other:?}");
                Err(Fatal::invariant("ack for an untracked packet type"))
            }
        }
    }

    async fn handle_login(self: &Arc<Self>, login: LoginEvent) -> Result<(), Fatal> {
        info!(
            "Slot {} signing {}",
            login.slot,
            if login.sign_in { "in" } else { "out" }
        );
        let display = &self.periph.display;
        if !self.transport.is_up() || !self.registered() {
            display.show(NO_CONNECTION);
            return Ok(());
        }
        if self.config.bricked().is_bricked() {
            display.show(BRICKED_LOGIN);
            return Ok(());
        }

        let Some(user) = self.periph.users.get(login.slot) else {
            error!("Slot {} matched a finger but holds no user, bricking", login.slot);
            if let Err(e) = self.config.set_bricked(BrickedCode::UNKNOWN_LOGIN) {
                error!("Could not persist the bricked code: {e:?}");
            }
            return Err(Fatal(RestartReason::UnknownLogin));
        };

        self.greet(user.name.clone(), login.sign_in);
        let pkt = Login {
            temperature: 0,
            sign_in: login.sign_in,
            uid: user.uid,
            name: user.name,
        };
        self.outbox.send_payload(PacketType::Login, &pkt).await.map(drop)
    }

    fn greet(self: &Arc<Self>, name: String, sign_in: bool) {
        let display = self.periph.display.clone();
        let pause = self.settings.display_pause;
        tokio::task::spawn(async move {
            display.show(if sign_in { "Welcome:" } else { "Goodbye:" });
            sleep(pause).await;
            display.show(&name);
        });
    }

    async fn handle_server_packet(self: &Arc<Self>, ty: PacketType) -> Result<(), Fatal> {
        let txn = self.transport.rx_ledger().pop_head().map_err(|e| {
            error!("{ty:?} announced but the RX ledger is {e:?}");
            Fatal::invariant("RX ledger out of step")
        })?;
        let bytes = txn
            .payload
            .ok_or(Fatal::invariant("RX ledger entry without a frame"))?;
        let pkt = Packet::from_bytes(&bytes).map_err(|e| {
            error!("RX frame {} does not parse: {e:?}", txn.id);
            Fatal::invariant("malformed frame in the RX ledger")
        })?;
        if pkt.packet_type() != ty {
            error!("Expected {ty:?}, popped {:?}", pkt.packet_type());
            return Err(Fatal::invariant("RX ledger out of order"));
        }

        match ty {
            PacketType::Cmd => commands::dispatch(self, pkt).await,
            PacketType::Echo => self.echo(pkt).await,
            PacketType::Fota => self.handle_fota(pkt).await,
            PacketType::Data => match self.fota_inbox() {
                Some(inbox) => self.forward_to_fota(inbox, pkt).await,
                None => {
                    error!("DATA {} with no update underway", pkt.txn_id());
                    Err(Fatal::invariant("DATA outside an update"))
                }
            },
            other => {
                error!("No handler for {other:?}");
                Err(Fatal::invariant("unhandled server packet"))
            }
        }
    }

    /// Sends the frame straight back under a device id.
    async fn echo(&self, mut pkt: Packet) -> Result<(), Fatal> {
        let id = pkt.txn_id().wrapping_sub(SERVER_ID_OFFSET);
        debug!("Echoing {} as {id}", pkt.txn_id());
        pkt.set_txn_id(id);
        pkt.stamp_crc();
        self.outbox.send(pkt).await.map(drop)
    }

    fn fota_inbox(&self) -> Option<mpsc::Sender<Packet>> {
        self.fota.with_lock(|f| f.clone())
    }

    async fn handle_fota(self: &Arc<Self>, pkt: Packet) -> Result<(), Fatal> {
        let desc = pkt
            .decode::<FotaDescriptor>(PacketType::Fota)
            .map_err(|_| Fatal::invariant("malformed FOTA frame"))?;

        if let Some(inbox) = self.fota_inbox() {
            if desc.kind == FotaKind::START {
                error!("START while an update is underway");
                return Err(Fatal::invariant("second update started"));
            }
            return self.forward_to_fota(inbox, pkt).await;
        }
        if desc.kind != FotaKind::START {
            error!("FOTA {:?} with no update underway", desc.kind);
            return Err(Fatal::invariant("FOTA frame outside an update"));
        }

        if desc.fw_version == self.settings.fw_version {
            warn!("Already running {}, refusing the update", desc.fw_version);
            return self
                .outbox
                .ack(FotaKind::START_ACK, FotaStatus::FAILED_SAME_FW)
                .await;
        }

        let (tx, rx) = mpsc::channel(self.settings.queue_depth);
        self.fota.with_lock(|f| *f = Some(tx));
        let session = FotaSession::new(
            desc,
            rx,
            self.periph.firmware.clone(),
            self.config.clone(),
            self.outbox.clone(),
            self.settings.fota_packet_wait,
        );
        let ctx = self.clone();
        self.spawn(async move {
            let outcome = session.run().await;
            ctx.fota.with_lock(|f| *f = None);
            match outcome? {
                FotaOutcome::Staged => {
                    info!("Rebooting into the new image");
                    sleep(ctx.settings.fota_reboot_delay).await;
                    Err(Fatal(RestartReason::FirmwareUpdated))
                }
                FotaOutcome::TestPassed => Ok(()),
                FotaOutcome::Aborted(status) => {
                    warn!("Update aborted with {status:?}");
                    Ok(())
                }
            }
        });

        self.outbox.ack(FotaKind::START_ACK, FotaStatus::GOOD).await
    }

    async fn forward_to_fota(&self, inbox: mpsc::Sender<Packet>, pkt: Packet) -> Result<(), Fatal> {
        match timeout(self.settings.qcore_timeout, inbox.send(pkt)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                warn!("Update ended, dropping its frame");
                Ok(())
            }
            Err(_) => {
                error!("Update task stopped taking frames");
                Err(Fatal(RestartReason::Stalled))
            }
        }
    }

    /// Checks `code` against a pending chain and records the next link.
    fn follow_chain(&self, code: u8, next: Option<u8>) -> Result<(), Fatal> {
        let expected = self.chain.with_lock(|c| std::mem::replace(c, next));
        match expected {
            Some(want) if want != code => {
                error!("Chain broken, expected command {want}, got {code}");
                Err(Fatal(RestartReason::ChainBroken))
            }
            _ => Ok(()),
        }
    }

    /// Disables logins until SYNC defuses the timer. A timer that runs out
    /// restarts the device.
    fn arm_sync_timer(self: &Arc<Self>) {
        self.periph.sensor.set_login_irq(false);
        let (tx, rx) = oneshot::channel();
        if self.sync_defuse.with_lock(|d| d.replace(tx)).is_some() {
            warn!("Sync timer re-armed");
        }

        let deadline = self.settings.sync_deadline;
        let sensor = self.periph.sensor.clone();
        self.spawn(async move {
            select! {
                _ = sleep(deadline) => {
                    error!("No SYNC within {deadline:?}");
                    Err(Fatal(RestartReason::SyncTimeout))
                }
                _ = rx => {
                    info!("Sync timer defused, logins enabled");
                    sensor.set_login_irq(true);
                    Ok(())
                }
            }
        });
    }

    fn defuse_sync_timer(&self) {
        match self.sync_defuse.with_lock(|d| d.take()) {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!("SYNC without a running sync timer"),
        }
    }
}

impl BusyGuard {
    fn try_acquire(ctx: &Arc<Context>) -> Option<Self> {
        ctx.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(ctx.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Sends HELLO on every new session.
async fn registration(ctx: Arc<Context>) -> Result<(), Fatal> {
    let mut seen = 0;
    loop {
        if ctx.transport.wait_up(&mut seen).await.is_err() {
            debug!("Transport gone, registration stops");
            return Ok(());
        }
        ctx.set_registered(false);

        let device_id = ctx.config.device_id();
        if device_id == MANUFACTURING_DEVICE_ID {
            warn!("No device id assigned yet, not registering");
            continue;
        }
        let hello = Hello {
            device_id,
            fw_version: ctx.settings.fw_version,
            bricked: ctx.config.bricked().0,
            name: ctx.config.device_name().unwrap_or_default(),
        };
        info!("Sending HELLO as {device_id} (bricked {})", hello.bricked);
        ctx.outbox.send_payload(PacketType::Hello, &hello).await?;
    }
}

async fn process_acks(ctx: Arc<Context>, mut acks: mpsc::Receiver<AckEvent>) -> Result<(), Fatal> {
    while let Some(ack) = acks.recv().await {
        ctx.process_ack(ack)?;
    }
    debug!("Ack stream closed");
    Ok(())
}
