//! A terminal without hardware.
//!
//! Config lives in the file named by the first argument. Fingerprint
//! touches are typed on stdin as `in <slot>` or `out <slot>`.

use std::io::BufRead;
use std::sync::Arc;

use log::{info, warn};
use parallax::{
    Settings,
    config::{DeviceConfig, FileConfigStore, StoreError},
    fatal::{ProcessRestart, Restart},
    link::{Link, LinkEvent},
    orchestrator::{Orchestrator, Peripherals},
    sim::{MemFirmware, MemUserStore, SimDisplay, SimSensor},
    transport::Transport,
};

const DEFAULT_SERVER: (&str, u16) = ("127.0.0.1", 2025);

#[tokio::main]
async fn main() -> Result<(), StoreError> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "parallax-device.cfg".into());
    let config = DeviceConfig::new(Arc::new(FileConfigStore::open(&path)?));
    for missing in config.verify_required() {
        warn!("{path}: {missing:?} not set");
    }
    let (ip, port) = match config.server_addr() {
        Some(addr) => addr,
        None => {
            let (ip, port) = DEFAULT_SERVER;
            config.set_server_addr(ip, port)?;
            (ip.to_string(), port)
        }
    };

    let settings = Settings::default();
    let restart = Arc::new(ProcessRestart);
    let display = Arc::new(SimDisplay::new());
    let (sensor, logins) = SimSensor::new();
    let sensor = Arc::new(sensor);
    let periph = Peripherals {
        sensor: sensor.clone(),
        display: display.clone(),
        users: Arc::new(MemUserStore::new()),
        firmware: Arc::new(MemFirmware::new()),
    };

    // The host's network is up before we are.
    let link = Arc::new(Link::new(display, config.clone()));
    link.handle(LinkEvent::GotIp);

    let (transport, handle, events) =
        Transport::new(&settings, format!("{ip}:{port}"), link, restart.clone());
    let orch = Orchestrator::new(
        settings,
        config,
        periph,
        handle,
        events,
        logins,
        restart.clone(),
    );
    if let Err(fatal) = orch.boot().await {
        restart.restart(fatal.0);
    }

    info!("Attaching to {ip}:{port}");
    transport.spawn();
    tokio::task::spawn_blocking(move || touches(&sensor));
    orch.run().await;
    Ok(())
}

fn touches(sensor: &SimSensor) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let mut words = line.split_whitespace();
        let sign_in = match words.next() {
            Some("in") => true,
            Some("out") => false,
            _ => {
                warn!("Expected `in <slot>` or `out <slot>`");
                continue;
            }
        };
        match words.next().and_then(|s| s.parse().ok()) {
            Some(slot) => {
                if !sensor.touch(slot, sign_in) {
                    warn!("Touch on {slot} dropped");
                }
            }
            None => warn!("Expected a slot number"),
        }
    }
}
