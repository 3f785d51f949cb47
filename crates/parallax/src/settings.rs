//! Timing and capacity knobs.
//!
//! [`Settings::default`] matches what deployed terminals run with. Tests
//! shrink the long waits with the `with_*` setters.

use std::{ops::RangeInclusive, time::Duration};

/// Firmware version reported in HELLO and compared against FOTA START.
pub const FW_VERSION: u16 = 12;

/// FOTA versions at or above this only exercise the download path.
pub const FW_TEST_VERSION_THRESHOLD: u16 = 0xFF00;

/// Number of user slots on the device and on the sensor.
pub const MAX_EMPLOYEE: usize = 128;

/// Device id burned in at the factory, before the server assigned one.
pub const MANUFACTURING_DEVICE_ID: u64 = 0xFFFF_FFFF;

/// Longest user name stored or sent, terminator included.
pub const MAX_NAME_LEN: usize = 49;

/// Longest device name, terminator included.
pub const MAX_DEVICE_NAME: usize = 50;

/// Longest server host string.
pub const MAX_SERVER_IP: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Slots in each of the RX, TX and CR ledgers.
    pub ledger_capacity: usize,
    /// Depth of the orchestrator -> transport send queue.
    pub send_queue_depth: usize,
    /// Depth of every other internal queue.
    pub queue_depth: usize,

    pub sweep_tick: Duration,
    pub retry_after: Duration,
    pub fail_after: Duration,
    pub max_retries: u8,

    pub reconnect_backoff: Duration,
    pub probe_wait: Duration,
    pub teardown_delay: Duration,

    /// Bound on any wait for an internal queue or ledger slot.
    pub qcore_timeout: Duration,
    pub sync_deadline: Duration,
    pub disconnect_delay: Duration,
    pub fota_packet_wait: Duration,
    pub fota_reboot_delay: Duration,
    /// Seconds to wait before attaching to the network at boot.
    pub boot_delay_secs: RangeInclusive<u64>,
    /// Pause between the two halves of a two-line display message.
    pub display_pause: Duration,

    pub fw_version: u16,
    /// Number of VOID frames sent by the ACK_STRESS diagnostic.
    pub ack_stress_count: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ledger_capacity: 16,
            send_queue_depth: 8,
            queue_depth: 16,
            sweep_tick: Duration::from_millis(250),
            retry_after: Duration::from_millis(500),
            fail_after: Duration::from_millis(3500),
            max_retries: 3,
            reconnect_backoff: Duration::from_secs(5),
            probe_wait: Duration::from_secs(1),
            teardown_delay: Duration::from_secs(1),
            qcore_timeout: Duration::from_secs(10),
            sync_deadline: Duration::from_secs(250),
            disconnect_delay: Duration::from_secs(3),
            fota_packet_wait: Duration::from_secs(10),
            fota_reboot_delay: Duration::from_secs(5),
            boot_delay_secs: 15..=60,
            display_pause: Duration::from_millis(1500),
            fw_version: FW_VERSION,
            ack_stress_count: 1500,
        }
    }
}

impl Settings {
    pub fn with_ledger_capacity(mut self, slots: usize) -> Self {
        self.ledger_capacity = slots;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_qcore_timeout(mut self, timeout: Duration) -> Self {
        self.qcore_timeout = timeout;
        self
    }

    pub fn with_boot_delay_secs(mut self, secs: RangeInclusive<u64>) -> Self {
        self.boot_delay_secs = secs;
        self
    }

    pub fn with_fw_version(mut self, version: u16) -> Self {
        self.fw_version = version;
        self
    }

    pub fn with_ack_stress_count(mut self, count: u16) -> Self {
        self.ack_stress_count = count;
        self
    }

    pub fn with_display_pause(mut self, pause: Duration) -> Self {
        self.display_pause = pause;
        self
    }
}
