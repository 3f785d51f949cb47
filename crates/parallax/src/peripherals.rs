//! Hardware the orchestrator drives.
//!
//! These are request/response gates: each call returns once the device has
//! answered. Drivers that talk to real hardware own their bus and thread and
//! hand the answer back through these calls.

use crate::{config::StoreError, wire::EmployeeRecord};

/// Status byte of the fingerprint sensor, forwarded verbatim to the
/// server when an enrolment fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorStatus(pub u8);

impl SensorStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const FAIL: Self = Self(0x01);
    pub const FULL: Self = Self(0x04);
    pub const NO_USER: Self = Self(0x05);
    pub const ID_EXISTS: Self = Self(0x06);
    pub const USER_EXISTS: Self = Self(0x07);
    pub const TIMEOUT: Self = Self(0x08);
}

/// A finger was matched against an enrolled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginEvent {
    pub slot: u16,
    pub sign_in: bool,
}

pub trait Sensor: Send + Sync + 'static {
    /// Enrols a finger into `slot`, blocking until the user is done.
    fn enroll(&self, slot: u16) -> Result<(), SensorStatus>;
    fn delete(&self, slot: u16) -> Result<(), SensorStatus>;
    fn delete_all(&self) -> Result<(), SensorStatus>;
    /// Power cycles the sensor.
    fn reset(&self);
    /// Gates the touch interrupt that produces [`LoginEvent`]s.
    fn set_login_irq(&self, enabled: bool);
}

/// Idle screens of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Booting,
    MissingConfig,
    ConnectingWifi,
    ConnectingCloud,
    Ready,
    Bricked,
}

impl DisplayState {
    pub fn text(&self) -> &'static str {
        match self {
            DisplayState::Booting => "Booting...",
            DisplayState::MissingConfig => "Error: not      configured",
            DisplayState::ConnectingWifi => "Connecting WiFi",
            DisplayState::ConnectingCloud => "Connecting Cloud",
            DisplayState::Ready => "  ...ready!...  <-out      in->",
            DisplayState::Bricked => "Device Bricked",
        }
    }
}

/// The two-line character display.
pub trait Display: Send + Sync + 'static {
    /// Shows a transient message over the idle screen.
    fn show(&self, text: &str);
    /// Switches the idle screen.
    fn set_state(&self, state: DisplayState);
}

/// Persistent table of enrolled users, one record per slot.
pub trait UserStore: Send + Sync + 'static {
    fn get(&self, slot: u16) -> Option<EmployeeRecord>;
    fn find_uid(&self, uid: u32) -> Option<u16>;
    fn free_slot(&self) -> Option<u16>;
    fn write(&self, record: &EmployeeRecord) -> Result<(), StoreError>;
    fn delete(&self, slot: u16) -> Result<(), StoreError>;
    fn delete_all(&self) -> Result<(), StoreError>;
    /// Every record, in slot order.
    fn list(&self) -> Vec<EmployeeRecord>;
}

/// The firmware partition an update is written to.
pub trait FirmwareTarget: Send + Sync + 'static {
    /// Prepares (erases) the inactive partition.
    fn begin(&self) -> Result<(), StoreError>;
    /// Writes one 4 KiB block at `index`.
    fn write_block(&self, index: u16, data: &[u8]) -> Result<(), StoreError>;
    /// Writes one block straight to the partition, skipping the image
    /// header checks. Test images carry no valid header.
    fn write_raw(&self, index: u16, data: &[u8]) -> Result<(), StoreError>;
    /// Reads back the first `len` bytes written.
    fn read_image(&self, len: usize) -> Result<Vec<u8>, StoreError>;
    /// Boots from the new partition next time.
    fn set_boot(&self) -> Result<(), StoreError>;
    /// Commits the running image so the bootloader stops offering rollback.
    fn mark_valid(&self) -> Result<(), StoreError>;
}
