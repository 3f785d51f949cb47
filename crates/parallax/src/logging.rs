//! Here we make logging macros available.
//!
//! The wrappers forward to the `log` facade. Records keep the emitting
//! module path as their target, so `RUST_LOG=parallax::transport=trace`
//! selects a single component.

#![allow(unused_macros, unused_imports)]

macro_rules! debug {
    ($($arg:tt)+) => (log::debug!(target: module_path!(), $($arg)+))
}

macro_rules! error {
    ($($arg:tt)+) => (log::error!(target: module_path!(), $($arg)+))
}

macro_rules! info {
    ($($arg:tt)+) => (log::info!(target: module_path!(), $($arg)+))
}

macro_rules! trace {
    ($($arg:tt)+) => (log::trace!(target: module_path!(), $($arg)+))
}

macro_rules! warni {
    ($($arg:tt)+) => (log::warn!(target: module_path!(), $($arg)+))
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use info;
pub(crate) use trace;
pub(crate) use warni as warn;
