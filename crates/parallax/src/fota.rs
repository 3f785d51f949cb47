//! Over-the-air firmware update.
//!
//! The server streams an image as a START descriptor, then per 4 KiB block
//! one META (carrying the block CRC16) followed by eight DATA segments, and
//! finally a FINAL (or FINAL_TEST_ONLY) frame. The device acks every META
//! and the FINAL; any timeout or surprise ends the session with a failure
//! ack and no retry. A staged image only becomes permanent once the new
//! firmware boots and calls [`check_new_firmware`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parallax_crc::{crc16, crc32};
use tokio::{sync::mpsc, time::timeout};

use crate::{
    config::DeviceConfig,
    fatal::{Fatal, RestartReason},
    logging::{error, info, warn},
    peripherals::FirmwareTarget,
    settings::FW_TEST_VERSION_THRESHOLD,
    wire::{FotaDescriptor, FotaKind, FotaStatus, LARGE_PAYLOAD, Packet, PacketType},
};

pub const SEGMENTS_PER_BLOCK: usize = 8;
pub const BLOCK_LEN: usize = SEGMENTS_PER_BLOCK * LARGE_PAYLOAD;

/// Firmware cookie values.
pub const NO_PENDING_FW: u8 = 0;
pub const RUNNING_NEW_FW: u8 = 1;

/// Where the session's FOTA_ACKs go.
pub trait FotaAcks: Send + Sync + 'static {
    fn ack(
        &self,
        kind: FotaKind,
        status: FotaStatus,
    ) -> impl Future<Output = Result<(), Fatal>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaOutcome {
    /// The image is written and marked bootable; reboot into it.
    Staged,
    /// FINAL_TEST_ONLY: the image checked out, nothing was switched.
    TestPassed,
    /// The session ended early with this status sent to the server.
    Aborted(FotaStatus),
}

pub struct FotaSession<A> {
    start: FotaDescriptor,
    inbox: mpsc::Receiver<Packet>,
    firmware: Arc<dyn FirmwareTarget>,
    config: DeviceConfig,
    acks: A,
    packet_wait: Duration,
}

// ---- impls ----

impl<A: FotaAcks> FotaSession<A> {
    /// `inbox` yields the FOTA and DATA frames that follow `start`.
    pub fn new(
        start: FotaDescriptor,
        inbox: mpsc::Receiver<Packet>,
        firmware: Arc<dyn FirmwareTarget>,
        config: DeviceConfig,
        acks: A,
        packet_wait: Duration,
    ) -> Self {
        Self {
            start,
            inbox,
            firmware,
            config,
            acks,
            packet_wait,
        }
    }

    pub async fn run(mut self) -> Result<FotaOutcome, Fatal> {
        let start = self.start;
        info!(
            "Starting update to {} ({} blocks, crc32 {:#010x})",
            start.fw_version, start.fw_blocks, start.fw_crc32
        );
        if self.is_test_image() {
            info!("Test image, written raw");
        }
        self.firmware.begin().map_err(|e| {
            error!("Could not prepare the update partition: {e:?}");
            Fatal::invariant("update partition unavailable")
        })?;

        for block in 0..start.fw_blocks {
            if let Some(status) = self.receive_block(block).await? {
                return Ok(FotaOutcome::Aborted(status));
            }
        }
        self.finish().await
    }

    /// One META and its eight segments. `Some(status)` ends the session.
    async fn receive_block(&mut self, block: u16) -> Result<Option<FotaStatus>, Fatal> {
        let Some(pkt) = self.next().await else {
            error!("Timed out waiting for META of block {block}");
            return self.abort(FotaKind::META_ACK, FotaStatus::TIMEDOUT).await;
        };
        let meta = match pkt.decode::<FotaDescriptor>(PacketType::Fota) {
            Ok(meta) if meta.kind == FotaKind::META => meta,
            _ => {
                error!("Expected META for block {block}, got {pkt:?}");
                return self.abort(FotaKind::META_ACK, FotaStatus::UNKNOWN).await;
            }
        };

        let mut buf = Vec::with_capacity(BLOCK_LEN);
        for segment in 0..SEGMENTS_PER_BLOCK {
            let Some(pkt) = self.next().await else {
                error!("Timed out waiting for segment {segment} of block {block}");
                return self.abort(FotaKind::META_ACK, FotaStatus::FAILED_CRC16).await;
            };
            if pkt.packet_type() != PacketType::Data {
                error!("Expected DATA, got {:?}", pkt.packet_type());
                return self.abort(FotaKind::META_ACK, FotaStatus::TIMEDOUT).await;
            }
            buf.extend_from_slice(pkt.payload());
        }

        let local = crc16(&buf);
        if local != meta.fw_crc16 {
            error!(
                "Block {block} crc16 {local:#06x}, expected {:#06x}",
                meta.fw_crc16
            );
            return self.abort(FotaKind::META_ACK, FotaStatus::FAILED_CRC16).await;
        }
        self.acks.ack(FotaKind::META_ACK, FotaStatus::GOOD).await?;

        let written = if self.is_test_image() {
            self.firmware.write_raw(block, &buf)
        } else {
            self.firmware.write_block(block, &buf)
        };
        written.map_err(|e| {
            error!("Writing block {block} failed: {e:?}");
            Fatal::invariant("firmware block write failed")
        })?;
        info!("Committed block {block}");
        Ok(None)
    }

    async fn finish(&mut self) -> Result<FotaOutcome, Fatal> {
        let Some(pkt) = self.next().await else {
            error!("Timed out waiting for FINAL");
            return self.abort_outcome(FotaKind::FINAL_ACK, FotaStatus::TIMEDOUT).await;
        };
        let kind = match pkt.decode::<FotaDescriptor>(PacketType::Fota) {
            Ok(d) if d.kind == FotaKind::FINAL || d.kind == FotaKind::FINAL_TEST_ONLY => d.kind,
            _ => {
                error!("Expected FINAL, got {pkt:?}");
                return self.abort_outcome(FotaKind::FINAL_ACK, FotaStatus::FAILED).await;
            }
        };

        let len = self.start.fw_blocks as usize * BLOCK_LEN;
        let image = self.firmware.read_image(len).map_err(|e| {
            error!("Reading back the image failed: {e:?}");
            Fatal::invariant("firmware read back failed")
        })?;
        let local = crc32(&image);
        if local != self.start.fw_crc32 {
            error!(
                "Image crc32 {local:#010x}, expected {:#010x}",
                self.start.fw_crc32
            );
            return self
                .abort_outcome(FotaKind::FINAL_ACK, FotaStatus::FAILED_CRC32)
                .await;
        }

        if kind == FotaKind::FINAL_TEST_ONLY {
            self.acks.ack(FotaKind::FINAL_TEST_ACK, FotaStatus::GOOD).await?;
            info!("Test update verified, not switching partitions");
            return Ok(FotaOutcome::TestPassed);
        }
        self.acks.ack(FotaKind::FINAL_ACK, FotaStatus::GOOD).await?;

        if let Err(e) = self.firmware.set_boot() {
            error!("Could not switch the boot partition: {e:?}");
            return Ok(FotaOutcome::Aborted(FotaStatus::FAILED));
        }
        self.config.set_fw_cookie(RUNNING_NEW_FW).map_err(|e| {
            error!("Could not persist the firmware cookie: {e:?}");
            Fatal::invariant("firmware cookie write failed")
        })?;
        info!("Update to {} staged", self.start.fw_version);
        Ok(FotaOutcome::Staged)
    }

    fn is_test_image(&self) -> bool {
        self.start.fw_version >= FW_TEST_VERSION_THRESHOLD
    }

    async fn next(&mut self) -> Option<Packet> {
        timeout(self.packet_wait, self.inbox.recv()).await.ok().flatten()
    }

    async fn abort(
        &self,
        kind: FotaKind,
        status: FotaStatus,
    ) -> Result<Option<FotaStatus>, Fatal> {
        self.acks.ack(kind, status).await?;
        Ok(Some(status))
    }

    async fn abort_outcome(
        &self,
        kind: FotaKind,
        status: FotaStatus,
    ) -> Result<FotaOutcome, Fatal> {
        self.acks.ack(kind, status).await?;
        Ok(FotaOutcome::Aborted(status))
    }
}

/// Commits a freshly booted image, if the last update left the cookie set.
pub fn check_new_firmware(
    config: &DeviceConfig,
    firmware: &dyn FirmwareTarget,
) -> Result<bool, Fatal> {
    if config.fw_cookie() != RUNNING_NEW_FW {
        return Ok(false);
    }
    info!("Running new firmware, marking it valid");
    if let Err(e) = firmware.mark_valid() {
        warn!("Could not cancel rollback: {e:?}");
    }
    config
        .set_fw_cookie(NO_PENDING_FW)
        .map_err(|_| Fatal(RestartReason::Invariant("firmware cookie write failed")))?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Guarded;
    use crate::config::MemConfigStore;
    use crate::sim::MemFirmware;
    use crate::wire::FotaAck;

    struct Acks(Arc<Guarded<Vec<FotaAck>>>);

    impl Default for Acks {
        fn default() -> Self {
            Self(Arc::new(Guarded::new(Vec::new())))
        }
    }

    impl FotaAcks for Acks {
        async fn ack(&self, kind: FotaKind, status: FotaStatus) -> Result<(), Fatal> {
            self.0.with_lock(|a| a.push(FotaAck { kind, status }));
            Ok(())
        }
    }

    fn fota(kind: FotaKind, crc16: u16) -> Packet {
        let d = FotaDescriptor {
            kind,
            fw_crc16: crc16,
            ..Default::default()
        };
        Packet::with_payload(PacketType::Fota, 2000, true, &d)
    }

    fn data(fill: u8) -> Packet {
        Packet::with_raw(PacketType::Data, 2001, true, &[fill; LARGE_PAYLOAD])
    }

    struct Rig {
        tx: mpsc::Sender<Packet>,
        acks: Arc<Guarded<Vec<FotaAck>>>,
        firmware: Arc<MemFirmware>,
        config: DeviceConfig,
        session: FotaSession<Acks>,
    }

    fn rig(blocks: u16, image: &[u8]) -> Rig {
        rig_version(13, blocks, image)
    }

    fn rig_version(fw_version: u16, blocks: u16, image: &[u8]) -> Rig {
        let (tx, rx) = mpsc::channel(64);
        let acks = Acks::default();
        let log = acks.0.clone();
        let firmware = Arc::new(MemFirmware::new());
        let config = DeviceConfig::new(Arc::new(MemConfigStore::new()));
        let start = FotaDescriptor {
            kind: FotaKind::START,
            fw_version,
            fw_crc32: crc32(image),
            fw_blocks: blocks,
            ..Default::default()
        };
        let session = FotaSession::new(
            start,
            rx,
            firmware.clone(),
            config.clone(),
            acks,
            Duration::from_secs(10),
        );
        Rig {
            tx,
            acks: log,
            firmware,
            config,
            session,
        }
    }

    async fn push_block(tx: &mpsc::Sender<Packet>, fill: u8) {
        let block = vec![fill; BLOCK_LEN];
        tx.send(fota(FotaKind::META, crc16(&block))).await.unwrap();
        for _ in 0..SEGMENTS_PER_BLOCK {
            tx.send(data(fill)).await.unwrap();
        }
    }

    fn ack(kind: FotaKind, status: FotaStatus) -> FotaAck {
        FotaAck { kind, status }
    }

    #[tokio::test]
    async fn full_update_stages_image() {
        let mut image = vec![1u8; BLOCK_LEN];
        image.extend(vec![2u8; BLOCK_LEN]);
        let r = rig(2, &image);
        push_block(&r.tx, 1).await;
        push_block(&r.tx, 2).await;
        r.tx.send(fota(FotaKind::FINAL, 0)).await.unwrap();

        assert_eq!(r.session.run().await, Ok(FotaOutcome::Staged));
        assert_eq!(
            r.acks.with_lock(|a| a.clone()),
            vec![
                ack(FotaKind::META_ACK, FotaStatus::GOOD),
                ack(FotaKind::META_ACK, FotaStatus::GOOD),
                ack(FotaKind::FINAL_ACK, FotaStatus::GOOD),
            ]
        );
        let fw = r.firmware.image();
        assert_eq!(fw.data, image);
        assert!(fw.raw_blocks.is_empty());
        assert!(fw.boot_set);
        assert_eq!(r.config.fw_cookie(), RUNNING_NEW_FW);
    }

    #[tokio::test]
    async fn test_images_are_written_raw() {
        let mut image = vec![5u8; BLOCK_LEN];
        image.extend(vec![6u8; BLOCK_LEN]);
        let r = rig_version(FW_TEST_VERSION_THRESHOLD, 2, &image);
        push_block(&r.tx, 5).await;
        push_block(&r.tx, 6).await;
        r.tx.send(fota(FotaKind::FINAL_TEST_ONLY, 0)).await.unwrap();

        assert_eq!(r.session.run().await, Ok(FotaOutcome::TestPassed));
        let fw = r.firmware.image();
        assert_eq!(fw.raw_blocks, vec![0, 1]);
        assert_eq!(fw.data, image);
    }

    #[tokio::test]
    async fn test_only_final_does_not_switch() {
        let image = vec![7u8; BLOCK_LEN];
        let r = rig(1, &image);
        push_block(&r.tx, 7).await;
        r.tx.send(fota(FotaKind::FINAL_TEST_ONLY, 0)).await.unwrap();

        assert_eq!(r.session.run().await, Ok(FotaOutcome::TestPassed));
        assert!(!r.firmware.image().boot_set);
        assert_eq!(r.config.fw_cookie(), NO_PENDING_FW);
        assert_eq!(
            r.acks.with_lock(|a| a.last().copied()),
            Some(ack(FotaKind::FINAL_TEST_ACK, FotaStatus::GOOD))
        );
    }

    #[tokio::test]
    async fn bad_block_crc_stops_writing() {
        let r = rig(10, &[]);
        push_block(&r.tx, 1).await;
        push_block(&r.tx, 2).await;
        r.tx.send(fota(FotaKind::META, 0xBEEF)).await.unwrap();
        for _ in 0..SEGMENTS_PER_BLOCK {
            r.tx.send(data(3)).await.unwrap();
        }
        push_block(&r.tx, 4).await;

        assert_eq!(
            r.session.run().await,
            Ok(FotaOutcome::Aborted(FotaStatus::FAILED_CRC16))
        );
        assert_eq!(r.firmware.image().data.len(), 2 * BLOCK_LEN);
        assert!(!r.firmware.image().boot_set);
        assert_eq!(
            r.acks.with_lock(|a| a.last().copied()),
            Some(ack(FotaKind::META_ACK, FotaStatus::FAILED_CRC16))
        );
    }

    #[tokio::test]
    async fn image_crc_mismatch_fails_final() {
        let r = rig(1, &[0u8; 4]);
        push_block(&r.tx, 9).await;
        r.tx.send(fota(FotaKind::FINAL, 0)).await.unwrap();

        assert_eq!(
            r.session.run().await,
            Ok(FotaOutcome::Aborted(FotaStatus::FAILED_CRC32))
        );
        assert!(!r.firmware.image().boot_set);
    }

    #[tokio::test]
    async fn surprises_abort() {
        let r = rig(1, &[]);
        r.tx.send(fota(FotaKind::FINAL, 0)).await.unwrap();
        assert_eq!(
            r.session.run().await,
            Ok(FotaOutcome::Aborted(FotaStatus::UNKNOWN))
        );

        let r = rig(1, &[]);
        r.tx.send(fota(FotaKind::META, 0)).await.unwrap();
        r.tx.send(fota(FotaKind::META, 0)).await.unwrap();
        assert_eq!(
            r.session.run().await,
            Ok(FotaOutcome::Aborted(FotaStatus::TIMEDOUT))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let r = rig(1, &[]);
        let tx = r.tx.clone();
        assert_eq!(
            r.session.run().await,
            Ok(FotaOutcome::Aborted(FotaStatus::TIMEDOUT))
        );
        drop(tx);

        let r = rig(1, &[]);
        r.tx.send(fota(FotaKind::META, 0)).await.unwrap();
        let acks = r.acks.clone();
        let _tx = r.tx.clone();
        assert_eq!(
            r.session.run().await,
            Ok(FotaOutcome::Aborted(FotaStatus::FAILED_CRC16))
        );
        assert_eq!(
            acks.with_lock(|a| a.clone()),
            vec![ack(FotaKind::META_ACK, FotaStatus::FAILED_CRC16)]
        );
    }

    #[test]
    fn boot_commits_cookie() {
        let config = DeviceConfig::new(Arc::new(MemConfigStore::new()));
        let fw = MemFirmware::new();
        assert_eq!(check_new_firmware(&config, &fw), Ok(false));

        config.set_fw_cookie(RUNNING_NEW_FW).unwrap();
        assert_eq!(check_new_firmware(&config, &fw), Ok(true));
        assert!(fw.image().marked_valid);
        assert_eq!(config.fw_cookie(), NO_PENDING_FW);
    }
}
