mod common;

use std::sync::Arc;

use common::{FakeServer, Parts, WAIT, fast_settings, ms, transport};
use parallax::{
    sim::RecordingRestart,
    transport::{AckEvent, TransportEvents, TransportHandle},
    wire::{AckReason, Command, Packet, PacketType},
};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{sleep, timeout},
};

struct Rig {
    handle: TransportHandle,
    events: TransportEvents,
    restart: Arc<RecordingRestart>,
}

fn spawn_transport(addr: &str) -> Rig {
    let (parts, _logins) = Parts::new();
    let restart = Arc::new(RecordingRestart::new());
    let (transport, handle, events) = transport(&fast_settings(), addr, &parts, restart.clone());
    transport.spawn();
    Rig {
        handle,
        events,
        restart,
    }
}

async fn up(handle: &TransportHandle) {
    let mut seen = 0;
    timeout(WAIT, handle.wait_up(&mut seen))
        .await
        .expect("no session")
        .unwrap();
}

async fn next_ack(acks: &mut mpsc::Receiver<AckEvent>) -> AckEvent {
    timeout(WAIT, acks.recv())
        .await
        .expect("no ack event")
        .unwrap()
}

fn login(id: u16) -> Packet {
    Packet::with_raw(PacketType::Login, id, true, &[0; 8])
}

#[tokio::test]
async fn host_ack_resolves_the_entry() {
    let mut server = FakeServer::bind().await;
    let mut rig = spawn_transport(&server.addr);
    up(&rig.handle).await;

    rig.handle.send(login(1)).await.unwrap();
    assert_eq!(server.next_of(PacketType::Login).await.txn_id(), 1);
    let ack = next_ack(&mut rig.events.acks).await;
    assert_eq!((ack.txn_id, ack.reason), (1, AckReason::GOOD));
    assert!(rig.handle.tx_ledger().is_empty());
    assert_eq!(rig.handle.stats().host_acks, 1);
}

#[tokio::test]
async fn silent_server_gets_exactly_one_timeout_nak() {
    let mut server = FakeServer::bind().await;
    server.set_auto_ack(false);
    let mut rig = spawn_transport(&server.addr);
    up(&rig.handle).await;

    rig.handle.send(login(7)).await.unwrap();
    server.next_of(PacketType::Login).await;

    let ack = next_ack(&mut rig.events.acks).await;
    assert_eq!((ack.txn_id, ack.reason), (7, AckReason::SERVER_TIMED_OUT));
    assert!(rig.handle.tx_ledger().is_empty());

    // Several sweeps later, still nothing more.
    assert!(
        timeout(fast_settings().fail_after * 2, rig.events.acks.recv())
            .await
            .is_err()
    );
    assert_eq!(rig.handle.stats().timeouts, 1);
}

#[tokio::test]
async fn late_host_ack_is_ignored() {
    let mut server = FakeServer::bind().await;
    server.set_auto_ack(false);
    let mut rig = spawn_transport(&server.addr);
    up(&rig.handle).await;

    rig.handle.send(login(3)).await.unwrap();
    server.next_of(PacketType::Login).await;
    let ack = next_ack(&mut rig.events.acks).await;
    assert_eq!(ack.reason, AckReason::SERVER_TIMED_OUT);

    server
        .send(Packet::ack(PacketType::ServerAck, 3, AckReason::GOOD))
        .await;
    assert!(timeout(ms(200), rig.events.acks.recv()).await.is_err());
}

#[tokio::test]
async fn ackless_frames_resolve_on_write() {
    let mut server = FakeServer::bind().await;
    server.set_auto_ack(false);
    let mut rig = spawn_transport(&server.addr);
    up(&rig.handle).await;

    let void = Packet::with_raw(PacketType::Void, 9, false, &[]);
    rig.handle.send(void).await.unwrap();
    server.next_of(PacketType::Void).await;
    let ack = next_ack(&mut rig.events.acks).await;
    assert_eq!((ack.txn_id, ack.reason), (9, AckReason::GOOD));
}

#[tokio::test]
async fn sends_without_a_session_are_nakked() {
    // A port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut rig = spawn_transport(&addr);
    sleep(ms(50)).await;
    assert!(!rig.handle.is_up());

    rig.handle.send(login(4)).await.unwrap();
    let ack = next_ack(&mut rig.events.acks).await;
    assert_eq!((ack.txn_id, ack.reason), (4, AckReason::TCP_DOWN));
    assert!(rig.handle.tx_ledger().is_empty());
    assert!(rig.restart.reasons().is_empty());
}

#[tokio::test]
async fn server_frames_are_parked_and_device_acked() {
    let mut server = FakeServer::bind().await;
    let mut rig = spawn_transport(&server.addr);
    up(&rig.handle).await;

    server.command(&Command::GetAllUsers, 2001).await;
    let ty = timeout(WAIT, rig.events.processed.recv()).await.unwrap();
    assert_eq!(ty, Some(PacketType::Cmd));

    let dack = server.next_of(PacketType::DeviceAck).await;
    assert_eq!(dack.txn_id(), 2001);
    assert!(dack.ack_reason().is_good());

    let txn = rig.handle.rx_ledger().pop_head().unwrap();
    assert_eq!(txn.id, 2001);
}

#[tokio::test]
async fn skipped_device_ack() {
    let mut server = FakeServer::bind().await;
    let mut rig = spawn_transport(&server.addr);
    up(&rig.handle).await;

    rig.handle.skip_next_device_ack();
    server.command(&Command::GetAllUsers, 2001).await;
    server.command(&Command::GetAllUsers, 2002).await;
    for _ in 0..2 {
        timeout(WAIT, rig.events.processed.recv()).await.unwrap();
    }

    let dack = server.next_of(PacketType::DeviceAck).await;
    assert_eq!(dack.txn_id(), 2002);
}

#[tokio::test]
async fn reconnects_after_the_server_hangs_up() {
    // One connection is accepted and dropped at once, the next one stays.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (kept_tx, mut kept_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        sleep(ms(150)).await;
        drop(first);
        let (second, _) = listener.accept().await.unwrap();
        kept_tx.send(second).await.unwrap();
    });

    let rig = spawn_transport(&addr);
    let mut seen = 0;
    timeout(WAIT, rig.handle.wait_up(&mut seen))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, rig.handle.wait_up(&mut seen))
        .await
        .expect("no second session")
        .unwrap();
    let _second = kept_rx.recv().await;
    assert!(rig.handle.stats().sessions >= 2);
}
