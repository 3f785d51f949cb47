#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use parallax::{
    Settings,
    config::{DeviceConfig, MemConfigStore},
    link::{Link, LinkEvent},
    orchestrator::{Orchestrator, OrchestratorHandle, Peripherals},
    sim::{MemFirmware, MemUserStore, RecordingRestart, SimDisplay, SimSensor},
    transport::{Transport, TransportEvents, TransportHandle},
    wire::{AckReason, CmdResp, Command, Packet, PacketType, packet_get_size},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Reference timings scaled down so a whole session fits in a test.
pub fn fast_settings() -> Settings {
    Settings {
        sweep_tick: ms(20),
        retry_after: ms(100),
        fail_after: ms(400),
        reconnect_backoff: ms(100),
        probe_wait: ms(50),
        teardown_delay: ms(20),
        qcore_timeout: Duration::from_secs(2),
        sync_deadline: ms(500),
        disconnect_delay: ms(50),
        fota_packet_wait: ms(300),
        fota_reboot_delay: ms(20),
        boot_delay_secs: 0..=0,
        display_pause: ms(10),
        ack_stress_count: 5,
        ..Settings::default()
    }
}

/// Plays the backend on a local port.
///
/// Every frame the device sends is handed to the test. Frames that ask for
/// a consumer ack get a SERVER_ACK straight away unless `auto_ack` is off.
pub struct FakeServer {
    pub addr: String,
    frames: mpsc::Receiver<Packet>,
    to_device: mpsc::Sender<Packet>,
    auto_ack: Arc<AtomicBool>,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (frames_tx, frames) = mpsc::channel(64);
        let (to_device, to_device_rx) = mpsc::channel(64);
        let auto_ack = Arc::new(AtomicBool::new(true));

        tokio::spawn(serve(listener, frames_tx, to_device_rx, auto_ack.clone()));
        Self {
            addr,
            frames,
            to_device,
            auto_ack,
        }
    }

    pub fn set_auto_ack(&self, on: bool) {
        self.auto_ack.store(on, Ordering::Release);
    }

    pub async fn send(&self, pkt: Packet) {
        self.to_device.send(pkt).await.unwrap();
    }

    pub async fn command(&self, cmd: &Command, txn_id: u16) {
        self.send(cmd.to_packet(txn_id)).await;
    }

    /// Next frame of type `ty`, skipping anything else.
    pub async fn next_of(&mut self, ty: PacketType) -> Packet {
        timeout(WAIT, async {
            loop {
                let pkt = self.frames.recv().await.unwrap();
                if pkt.packet_type() == ty {
                    return pkt;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {ty:?} from the device"))
    }

    pub async fn next_resp(&mut self) -> CmdResp {
        self.next_of(PacketType::CmdResp)
            .await
            .decode(PacketType::CmdResp)
            .unwrap()
    }

    /// Collects frames of type `ty` until the line has been quiet for `quiet`.
    pub async fn drain_of(&mut self, ty: PacketType, quiet: Duration) -> Vec<Packet> {
        let mut out = vec![];
        while let Ok(Some(pkt)) = timeout(quiet, self.frames.recv()).await {
            if pkt.packet_type() == ty {
                out.push(pkt);
            }
        }
        out
    }
}

async fn serve(
    listener: TcpListener,
    frames: mpsc::Sender<Packet>,
    mut to_device: mpsc::Receiver<Packet>,
    auto_ack: Arc<AtomicBool>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if !connection(stream, &frames, &mut to_device, &auto_ack).await {
            return;
        }
    }
}

/// Returns `false` once the test side has gone away.
async fn connection(
    mut stream: TcpStream,
    frames: &mpsc::Sender<Packet>,
    to_device: &mut mpsc::Receiver<Packet>,
    auto_ack: &AtomicBool,
) -> bool {
    let mut pending: Vec<u8> = vec![];
    let mut buf = [0u8; 1024];
    loop {
        select! {
            rd = stream.read(&mut buf) => {
                let n = match rd {
                    Ok(0) | Err(_) => return true,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(len) = pending.first().and_then(|t| packet_get_size(*t)) {
                    if pending.len() < len {
                        break;
                    }
                    let frame: Vec<u8> = pending.drain(..len).collect();
                    let pkt = Packet::from_bytes(&frame).unwrap();
                    if pkt.consumer_ack_required() && auto_ack.load(Ordering::Acquire) {
                        let ack = Packet::ack(PacketType::ServerAck, pkt.txn_id(), AckReason::GOOD);
                        if stream.write_all(ack.as_bytes()).await.is_err() {
                            return true;
                        }
                    }
                    if frames.send(pkt).await.is_err() {
                        return false;
                    }
                }
            }
            out = to_device.recv() => {
                let Some(pkt) = out else {
                    return false;
                };
                if stream.write_all(pkt.as_bytes()).await.is_err() {
                    return true;
                }
            }
        }
    }
}

/// The simulated collaborators of one device. They outlive a restart.
#[derive(Clone)]
pub struct Parts {
    pub config: DeviceConfig,
    pub store: Arc<MemConfigStore>,
    pub sensor: Arc<SimSensor>,
    pub display: Arc<SimDisplay>,
    pub users: Arc<MemUserStore>,
    pub firmware: Arc<MemFirmware>,
}

impl Parts {
    /// A device that already has its id, so it registers on connect.
    pub fn new() -> (Self, mpsc::Receiver<parallax::peripherals::LoginEvent>) {
        let store = Arc::new(MemConfigStore::new());
        let config = DeviceConfig::new(store.clone());
        config.set_device_id(7).unwrap();
        config.set_device_name("lobby").unwrap();
        let (sensor, logins) = SimSensor::new();
        let parts = Self {
            config,
            store,
            sensor: Arc::new(sensor),
            display: Arc::new(SimDisplay::new()),
            users: Arc::new(MemUserStore::new()),
            firmware: Arc::new(MemFirmware::new()),
        };
        (parts, logins)
    }

    pub fn peripherals(&self) -> Peripherals {
        Peripherals {
            sensor: self.sensor.clone(),
            display: self.display.clone(),
            users: self.users.clone(),
            firmware: self.firmware.clone(),
        }
    }
}

/// A transport whose link is already up, not yet spawned.
pub fn transport(
    settings: &Settings,
    addr: &str,
    parts: &Parts,
    restart: Arc<RecordingRestart>,
) -> (Transport, TransportHandle, TransportEvents) {
    let link = Arc::new(Link::new(parts.display.clone(), parts.config.clone()));
    link.handle(LinkEvent::GotIp);
    Transport::new(settings, addr.to_string(), link, restart)
}

pub struct Device {
    pub parts: Parts,
    pub restart: Arc<RecordingRestart>,
    pub handle: OrchestratorHandle,
    pub transport: TransportHandle,
}

impl Device {
    /// Boots a device against `addr` and runs it in the background.
    pub async fn start(
        settings: Settings,
        addr: &str,
        parts: Parts,
        logins: mpsc::Receiver<parallax::peripherals::LoginEvent>,
    ) -> Self {
        let restart = Arc::new(RecordingRestart::new());
        let (transport, handle, events) = transport(&settings, addr, &parts, restart.clone());
        let orch = Orchestrator::new(
            settings,
            parts.config.clone(),
            parts.peripherals(),
            handle.clone(),
            events,
            logins,
            restart.clone(),
        );
        orch.boot().await.unwrap();
        transport.spawn();
        let orch_handle = orch.handle();
        tokio::spawn(orch.run());
        Self {
            parts,
            restart,
            handle: orch_handle,
            transport: handle,
        }
    }

    /// Waits for the HELLO and its ack to land.
    pub async fn registered(&self, server: &mut FakeServer) {
        server.next_of(PacketType::Hello).await;
        timeout(WAIT, async {
            while !self.handle.is_registered() {
                tokio::time::sleep(ms(5)).await;
            }
        })
        .await
        .expect("device never registered");
    }
}

/// Runs the boot path of a freshly restarted device over the same parts.
pub async fn reboot(settings: Settings, parts: &Parts) -> Arc<RecordingRestart> {
    let restart = Arc::new(RecordingRestart::new());
    let (_transport, handle, events) = transport(&settings, "127.0.0.1:9", parts, restart.clone());
    let (_tx, logins) = mpsc::channel(1);
    let orch = Orchestrator::new(
        settings,
        parts.config.clone(),
        parts.peripherals(),
        handle,
        events,
        logins,
        restart.clone(),
    );
    orch.boot().await.unwrap();
    restart
}
