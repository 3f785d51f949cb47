//! # Parallax
//!
//! Device core of the parallax access terminal.
//!
//! A terminal keeps one TCP session to its backend. Everything on that
//! session is a fixed-size frame whose first byte names its type (see
//! [`wire`]). Frames are carved out of the byte stream by the [`chunker`],
//! tracked until acknowledged in a bounded [`ledger`], and dispatched by the
//! [`orchestrator`], which owns the command set, user enrolment, login
//! reporting and the [`fota`] firmware update flow.
//!
//! The pieces talk over bounded tokio channels and are started as separate
//! tasks:
//!
//! ```text
//!   socket ──► rx worker ──► chunker ──► RX ledger ──► orchestrator
//!                                 └─► host acks ──► tx manager ──► acks
//!   orchestrator ──► write adaptor ──► TX ledger ──► tx worker ──► socket
//! ```
//!
//! Collaborators that touch hardware (fingerprint sensor, display, user
//! storage, firmware partitions, persistent config) are traits in
//! [`peripherals`] and [`config`]; [`sim`] holds in-memory versions.

pub mod chunker;
pub mod config;
pub mod fatal;
pub mod fota;
pub mod ledger;
pub mod link;
pub(crate) mod logging;
pub mod orchestrator;
pub mod peripherals;
pub mod settings;
pub mod sim;
pub mod transport;
pub mod wire;

pub use fatal::{Fatal, Restart, RestartReason};
pub use settings::Settings;

use mutex::{BlockingMutex, raw_impls::cs::CriticalSectionRawMutex};

/// State shared between tasks, guarded by a short critical section.
pub(crate) type Guarded<T> = BlockingMutex<CriticalSectionRawMutex, T>;
