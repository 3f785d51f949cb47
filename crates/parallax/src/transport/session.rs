//! Socket lifecycle: connect, run a reader and a writer, tear down, repeat.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use maitake_sync::WaitQueue;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, mpsc},
    time::{sleep, timeout},
};

use super::{Shared, TransportStatus, WriteAck};
use crate::{
    chunker::{ChunkError, Chunker, ChunkerSinks},
    fatal::{Restart, RestartReason},
    link::{Link, LinkEvent},
    logging::{debug, error, info, trace, warn},
    settings::Settings,
    wire::{Packet, PacketType},
};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    PeerClosed,
    Read(io::ErrorKind),
    Write(io::ErrorKind),
    Desync(ChunkError),
}

pub(super) struct Supervisor {
    shared: Arc<Shared>,
    server: String,
    link: Arc<Link>,
    restart: Arc<dyn Restart>,
    sinks: ChunkerSinks,
    socket: Arc<Mutex<mpsc::Receiver<Packet>>>,
    write_acks: mpsc::Sender<WriteAck>,
    reconnect_backoff: Duration,
    probe_wait: Duration,
    teardown_delay: Duration,
    connect_timeout: Duration,
}

struct RxWorker {
    skt: OwnedReadHalf,
    chunker: Chunker,
    closer: Arc<WaitQueue>,
    ends: mpsc::Sender<SessionEnd>,
    shared: Arc<Shared>,
    restart: Arc<dyn Restart>,
}

// ---- impls ----

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        settings: &Settings,
        server: String,
        shared: Arc<Shared>,
        link: Arc<Link>,
        restart: Arc<dyn Restart>,
        sinks: ChunkerSinks,
        socket: mpsc::Receiver<Packet>,
        write_acks: mpsc::Sender<WriteAck>,
    ) -> Self {
        Self {
            shared,
            server,
            link,
            restart,
            sinks,
            socket: Arc::new(Mutex::new(socket)),
            write_acks,
            reconnect_backoff: settings.reconnect_backoff,
            probe_wait: settings.probe_wait,
            teardown_delay: settings.teardown_delay,
            connect_timeout: settings.qcore_timeout,
        }
    }

    pub(super) async fn run(self) {
        loop {
            self.link.handle(LinkEvent::SocketClosed);
            if !self.link.wifi_ready() {
                debug!("Wifi down, not connecting");
                sleep(self.reconnect_backoff).await;
                continue;
            }

            let connect = TcpStream::connect(self.server.as_str());
            let stream = match timeout(self.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Connecting to {} failed: {e}", self.server);
                    sleep(self.reconnect_backoff).await;
                    continue;
                }
                Err(_) => {
                    warn!("Connecting to {} timed out", self.server);
                    sleep(self.reconnect_backoff).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Could not set TCP_NODELAY: {e}");
            }

            self.session(stream).await;
            sleep(self.teardown_delay).await;
            sleep(self.reconnect_backoff).await;
        }
    }

    /// Runs one connection until either worker gives up.
    async fn session(&self, stream: TcpStream) {
        let (rd, wr) = stream.into_split();
        let closer = Arc::new(WaitQueue::new());
        let (ends_tx, mut ends_rx) = mpsc::channel(2);
        self.shared.threads_destroyed.with_lock(|n| *n = 0);

        let rx_worker = RxWorker {
            skt: rd,
            chunker: Chunker::new(self.sinks.clone()),
            closer: closer.clone(),
            ends: ends_tx.clone(),
            shared: self.shared.clone(),
            restart: self.restart.clone(),
        };
        tokio::task::spawn(rx_worker.run());
        tokio::task::spawn(tx_worker(
            wr,
            self.socket.clone(),
            self.write_acks.clone(),
            closer.clone(),
            ends_tx,
            self.shared.clone(),
        ));

        // A refused or reset connection shows up within the probe window.
        let early = select! {
            _ = sleep(self.probe_wait) => false,
            _ = closer.wait() => true,
        };
        if early {
            warn!("Session to {} died during the probe", self.server);
        } else {
            info!("Session to {} up", self.server);
            self.shared.stats(|s| s.sessions += 1);
            self.shared.set_status(TransportStatus::Up);
            self.link.handle(LinkEvent::SocketOpened);
            let _ = closer.wait().await;
        }

        self.shared.set_status(TransportStatus::Down);
        closer.close();

        let shared = &self.shared;
        let _ = shared
            .destroyed_wq
            .wait_for(|| shared.threads_destroyed.with_lock(|n| *n >= 2))
            .await;

        while let Ok(end) = ends_rx.try_recv() {
            info!("Session ended: {end:?}");
        }
        // Frames queued for the dead socket are not replayed; the sweep
        // NAKs their TX entries.
        if let Ok(mut queue) = self.socket.try_lock() {
            let mut dropped = 0;
            while queue.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!("Dropped {dropped} queued frames");
            }
        }
        info!("Session to {} torn down", self.server);
    }
}

impl RxWorker {
    async fn run(mut self) {
        if let Err(end) = self.run_inner().await {
            let _ = self.ends.try_send(end);
        }
        self.closer.close();
        self.shared.thread_destroyed();
    }

    async fn run_inner(&mut self) -> Result<(), SessionEnd> {
        let mut raw_buf = [0u8; 1024];

        loop {
            let rd = self.skt.read(&mut raw_buf);
            let close = self.closer.wait();

            let ct = select! {
                r = rd => match r {
                    Ok(0) => {
                        warn!("Server closed the connection");
                        return Err(SessionEnd::PeerClosed);
                    }
                    Ok(ct) => ct,
                    Err(e) => {
                        warn!("recv failed: {e}");
                        return Err(SessionEnd::Read(e.kind()));
                    }
                },
                _c = close => return Ok(()),
            };

            match self.chunker.feed(&raw_buf[..ct]).await {
                Ok(frames) => self.shared.stats(|s| s.frames_in += frames as u64),
                Err(ChunkError::Stalled) => {
                    error!("Inbound path stalled");
                    self.restart.restart(RestartReason::Stalled);
                    return Err(SessionEnd::Desync(ChunkError::Stalled));
                }
                Err(e) => return Err(SessionEnd::Desync(e)),
            }
        }
    }
}

async fn tx_worker(
    mut skt: OwnedWriteHalf,
    queue: Arc<Mutex<mpsc::Receiver<Packet>>>,
    write_acks: mpsc::Sender<WriteAck>,
    closer: Arc<WaitQueue>,
    ends: mpsc::Sender<SessionEnd>,
    shared: Arc<Shared>,
) {
    info!("Started tx_worker");
    let mut queue = queue.lock_owned().await;

    loop {
        let next = queue.recv();
        let close = closer.wait();

        let pkt = select! {
            p = next => match p {
                Some(p) => p,
                None => break,
            },
            _c = close => break,
        };

        let ty = pkt.packet_type();
        let txn_id = pkt.txn_id();
        trace!("sending {ty:?} {txn_id} len:{}", pkt.len());
        let res = skt.write_all(pkt.as_bytes()).await;

        // Device acks are not tracked in the TX ledger.
        if ty != PacketType::DeviceAck {
            let wa = WriteAck {
                txn_id,
                written: res.is_ok(),
                consumer_ack_req: pkt.consumer_ack_required(),
            };
            if write_acks.send(wa).await.is_err() {
                break;
            }
        }

        match res {
            Ok(()) => shared.stats(|s| s.frames_out += 1),
            Err(e) => {
                error!("Err: {e:?}");
                let _ = ends.try_send(SessionEnd::Write(e.kind()));
                break;
            }
        }
    }

    warn!("Closing tx_worker");
    drop(queue);
    closer.close();
    shared.thread_destroyed();
}
