//! The restart pathway.
//!
//! The terminal does not try to limp along after an invariant breaks: the
//! owning task logs, asks the injected [`Restart`] to reboot the device, and
//! stops. On a real device that is a reset; in a std process it is an exit;
//! in tests it is a recording.

use crate::logging::error;

/// Why the device is restarting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RestartReason {
    /// The server sent DISCONNECT.
    Commanded,
    /// A fingerprint matched a slot that has no user record.
    UnknownLogin,
    /// The sensor refused to forget a fingerprint three times.
    FailedToDeleteThumb,
    /// Writing a user record to storage failed mid-transaction.
    StorageCommitFailed,
    /// A sync session was started and never finished.
    SyncTimeout,
    /// A new firmware image is staged and marked bootable.
    FirmwareUpdated,
    /// The server asked for a crash.
    CrashRequested,
    /// A chained command was followed by the wrong command.
    ChainBroken,
    /// The server refused something the device must not lose.
    AckFailed,
    /// Internal queues stopped draining.
    Stalled,
    Invariant(&'static str),
}

impl RestartReason {
    /// Process exit status used by [`ProcessRestart`].
    pub fn exit_code(&self) -> i32 {
        match self {
            RestartReason::Commanded | RestartReason::FirmwareUpdated => 0,
            _ => 1,
        }
    }
}

/// A handler hit a condition the device does not recover from in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fatal(pub RestartReason);

impl Fatal {
    pub const fn invariant(what: &'static str) -> Self {
        Fatal(RestartReason::Invariant(what))
    }
}

impl From<RestartReason> for Fatal {
    fn from(value: RestartReason) -> Self {
        Fatal(value)
    }
}

/// Reboot capability handed to every task that can hit a fatal condition.
pub trait Restart: Send + Sync + 'static {
    fn restart(&self, reason: RestartReason);
}

/// Ends the process, the std stand-in for a device reset.
///
/// Meant to run under a supervisor (systemd, a container runtime) that
/// brings the process back up.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&self, reason: RestartReason) {
        error!("Restarting: {reason:?}");
        log::logger().flush();
        std::process::exit(reason.exit_code());
    }
}
