//! Access-control terminal core.
//!
//! This crate re-exports [`parallax`], the device side of the terminal:
//! wire codec, transaction ledgers, the TCP transport, the command
//! orchestrator and the firmware update flow. The `test-mode` and `retry`
//! features are forwarded.

pub use parallax::*;
