//! In-memory collaborators.
//!
//! Used by the tests and by the std demo device, which has no fingerprint
//! sensor, display or flash to drive.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use maitake_sync::WaitQueue;
use tokio::sync::mpsc;

use crate::{
    Guarded,
    config::StoreError,
    fatal::{Restart, RestartReason},
    fota::BLOCK_LEN,
    logging::{info, warn},
    peripherals::{
        Display, DisplayState, FirmwareTarget, LoginEvent, Sensor, SensorStatus, UserStore,
    },
    settings::MAX_EMPLOYEE,
    wire::EmployeeRecord,
};

/// Records restart requests instead of acting on them.
pub struct RecordingRestart {
    reasons: Guarded<Vec<RestartReason>>,
    wq: WaitQueue,
}

/// Remembers what it was asked to show.
pub struct SimDisplay {
    messages: Guarded<Vec<String>>,
    state: Guarded<Option<DisplayState>>,
    wq: WaitQueue,
}

#[derive(Default)]
struct SensorInner {
    enrolled: BTreeSet<u16>,
    enroll_result: Option<SensorStatus>,
    delete_failures: u32,
    delete_attempts: u32,
    resets: u32,
}

/// A fingerprint sensor that enrols instantly.
pub struct SimSensor {
    inner: Guarded<SensorInner>,
    irq: AtomicBool,
    logins: mpsc::Sender<LoginEvent>,
}

/// User table kept in a map.
pub struct MemUserStore {
    users: Guarded<BTreeMap<u16, EmployeeRecord>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub data: Vec<u8>,
    pub begun: bool,
    pub boot_set: bool,
    pub marked_valid: bool,
    /// Blocks that went through `write_raw`.
    pub raw_blocks: Vec<u16>,
}

/// A firmware partition in RAM.
pub struct MemFirmware {
    image: Guarded<FirmwareImage>,
}

// ---- impls ----

impl RecordingRestart {
    pub fn new() -> Self {
        Self {
            reasons: Guarded::new(Vec::new()),
            wq: WaitQueue::new(),
        }
    }

    pub fn reasons(&self) -> Vec<RestartReason> {
        self.reasons.with_lock(|r| r.clone())
    }

    /// Waits for the first restart request.
    pub async fn wait(&self) -> RestartReason {
        let res = self
            .wq
            .wait_for_value(|| self.reasons.with_lock(|r| r.first().copied()))
            .await;
        // the queue is never closed
        res.unwrap_or(RestartReason::Invariant("restart queue closed"))
    }
}

impl Default for RecordingRestart {
    fn default() -> Self {
        Self::new()
    }
}

impl Restart for RecordingRestart {
    fn restart(&self, reason: RestartReason) {
        warn!("Restart requested: {reason:?}");
        self.reasons.with_lock(|r| r.push(reason));
        self.wq.wake_all();
    }
}

impl SimDisplay {
    pub fn new() -> Self {
        Self {
            messages: Guarded::new(Vec::new()),
            state: Guarded::new(None),
            wq: WaitQueue::new(),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.with_lock(|m| m.clone())
    }

    pub fn state(&self) -> Option<DisplayState> {
        self.state.with_lock(|s| *s)
    }

    /// Waits until `text` has been shown at least once.
    pub async fn wait_shown(&self, text: &str) {
        let _ = self
            .wq
            .wait_for(|| self.messages.with_lock(|m| m.iter().any(|s| s == text)))
            .await;
    }
}

impl Default for SimDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SimDisplay {
    fn show(&self, text: &str) {
        info!("[display] {text}");
        self.messages.with_lock(|m| m.push(text.to_string()));
        self.wq.wake_all();
    }

    fn set_state(&self, state: DisplayState) {
        info!("[display] {}", state.text());
        self.state.with_lock(|s| *s = Some(state));
        self.wq.wake_all();
    }
}

impl SimSensor {
    /// The receiver yields a [`LoginEvent`] for every accepted touch.
    pub fn new() -> (Self, mpsc::Receiver<LoginEvent>) {
        let (logins, rx) = mpsc::channel(5);
        let sensor = Self {
            inner: Guarded::new(SensorInner::default()),
            irq: AtomicBool::new(true),
            logins,
        };
        (sensor, rx)
    }

    /// A finger matched `slot`. Ignored while the login interrupt is off.
    pub fn touch(&self, slot: u16, sign_in: bool) -> bool {
        if !self.irq.load(Ordering::Acquire) {
            warn!("Touch on slot {slot} ignored, interrupt disabled");
            return false;
        }
        self.logins.try_send(LoginEvent { slot, sign_in }).is_ok()
    }

    pub fn login_irq_enabled(&self) -> bool {
        self.irq.load(Ordering::Acquire)
    }

    /// Make enrolment fail with `status`, or succeed again with `None`.
    pub fn fail_enroll(&self, status: Option<SensorStatus>) {
        self.inner.with_lock(|i| i.enroll_result = status);
    }

    /// Make the next `count` deletes fail.
    pub fn fail_deletes(&self, count: u32) {
        self.inner.with_lock(|i| i.delete_failures = count);
    }

    pub fn enrolled(&self) -> Vec<u16> {
        self.inner.with_lock(|i| i.enrolled.iter().copied().collect())
    }

    pub fn resets(&self) -> u32 {
        self.inner.with_lock(|i| i.resets)
    }

    pub fn delete_attempts(&self) -> u32 {
        self.inner.with_lock(|i| i.delete_attempts)
    }
}

impl Sensor for SimSensor {
    fn enroll(&self, slot: u16) -> Result<(), SensorStatus> {
        self.inner.with_lock(|i| {
            if let Some(status) = i.enroll_result {
                return Err(status);
            }
            if !i.enrolled.insert(slot) {
                return Err(SensorStatus::ID_EXISTS);
            }
            Ok(())
        })
    }

    fn delete(&self, slot: u16) -> Result<(), SensorStatus> {
        self.inner.with_lock(|i| {
            i.delete_attempts += 1;
            if i.delete_failures > 0 {
                i.delete_failures -= 1;
                return Err(SensorStatus::FAIL);
            }
            i.enrolled.remove(&slot);
            Ok(())
        })
    }

    fn delete_all(&self) -> Result<(), SensorStatus> {
        self.inner.with_lock(|i| i.enrolled.clear());
        Ok(())
    }

    fn reset(&self) {
        self.inner.with_lock(|i| i.resets += 1);
    }

    fn set_login_irq(&self, enabled: bool) {
        self.irq.store(enabled, Ordering::Release);
    }
}

impl MemUserStore {
    pub fn new() -> Self {
        Self {
            users: Guarded::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.users.with_lock(|u| u.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemUserStore {
    fn get(&self, slot: u16) -> Option<EmployeeRecord> {
        self.users.with_lock(|u| u.get(&slot).cloned())
    }

    fn find_uid(&self, uid: u32) -> Option<u16> {
        self.users
            .with_lock(|u| u.values().find(|r| r.uid == uid).map(|r| r.slot))
    }

    fn free_slot(&self) -> Option<u16> {
        self.users
            .with_lock(|u| (0..MAX_EMPLOYEE as u16).find(|s| !u.contains_key(s)))
    }

    fn write(&self, record: &EmployeeRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StoreError::WriteFailed);
        }
        if record.slot as usize >= MAX_EMPLOYEE {
            return Err(StoreError::NoSpace);
        }
        self.users.with_lock(|u| u.insert(record.slot, record.clone()));
        Ok(())
    }

    fn delete(&self, slot: u16) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::Acquire) {
            return Err(StoreError::WriteFailed);
        }
        self.users
            .with_lock(|u| u.remove(&slot))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::Acquire) {
            return Err(StoreError::WriteFailed);
        }
        self.users.with_lock(|u| u.clear());
        Ok(())
    }

    fn list(&self) -> Vec<EmployeeRecord> {
        self.users.with_lock(|u| u.values().cloned().collect())
    }
}

impl MemFirmware {
    pub fn new() -> Self {
        Self {
            image: Guarded::new(FirmwareImage::default()),
        }
    }

    pub fn image(&self) -> FirmwareImage {
        self.image.with_lock(|i| i.clone())
    }
}

impl FirmwareImage {
    fn put(&mut self, index: u16, data: &[u8]) -> Result<(), StoreError> {
        if !self.begun {
            return Err(StoreError::WriteFailed);
        }
        let start = index as usize * BLOCK_LEN;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0xFF);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}

impl Default for MemFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareTarget for MemFirmware {
    fn begin(&self) -> Result<(), StoreError> {
        self.image.with_lock(|i| {
            i.data.clear();
            i.begun = true;
            i.boot_set = false;
        });
        Ok(())
    }

    fn write_block(&self, index: u16, data: &[u8]) -> Result<(), StoreError> {
        self.image.with_lock(|i| i.put(index, data))
    }

    fn write_raw(&self, index: u16, data: &[u8]) -> Result<(), StoreError> {
        self.image.with_lock(|i| {
            i.put(index, data)?;
            i.raw_blocks.push(index);
            Ok(())
        })
    }

    fn read_image(&self, len: usize) -> Result<Vec<u8>, StoreError> {
        self.image.with_lock(|i| {
            let mut out = i.data.clone();
            out.resize(len, 0xFF);
            Ok(out)
        })
    }

    fn set_boot(&self) -> Result<(), StoreError> {
        self.image.with_lock(|i| {
            if !i.begun {
                return Err(StoreError::NotFound);
            }
            i.boot_set = true;
            Ok(())
        })
    }

    fn mark_valid(&self) -> Result<(), StoreError> {
        self.image.with_lock(|i| i.marked_valid = true);
        Ok(())
    }
}
