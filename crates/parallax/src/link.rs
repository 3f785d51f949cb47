//! Network link state, as shown on the display.

use std::sync::Arc;

use crate::{
    Guarded,
    config::DeviceConfig,
    logging::{debug, info},
    peripherals::{Display, DisplayState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    WifiDown,
    /// Wifi is up, the backend session is not.
    Connecting,
    ConnectedServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    GotIp,
    WifiDisconnect,
    SocketOpened,
    SocketClosed,
}

pub struct Link {
    state: Guarded<LinkState>,
    display: Arc<dyn Display>,
    config: DeviceConfig,
}

// ---- impls ----

impl LinkState {
    /// Events that make no sense in the current state leave it unchanged.
    pub fn next(self, event: LinkEvent) -> Self {
        use LinkEvent::*;
        use LinkState::*;

        match (self, event) {
            (WifiDown, GotIp) => Connecting,
            (Connecting | ConnectedServer, WifiDisconnect) => WifiDown,
            (Connecting, SocketOpened) => ConnectedServer,
            (ConnectedServer, SocketClosed) => Connecting,
            (same, _) => same,
        }
    }
}

impl Link {
    pub fn new(display: Arc<dyn Display>, config: DeviceConfig) -> Self {
        Self {
            state: Guarded::new(LinkState::WifiDown),
            display,
            config,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.with_lock(|s| *s)
    }

    /// Can a connection to the backend be attempted?
    pub fn wifi_ready(&self) -> bool {
        self.state() != LinkState::WifiDown
    }

    /// Applies `event` and refreshes the idle screen, even when the state
    /// did not change.
    pub fn handle(&self, event: LinkEvent) -> LinkState {
        let bricked = self.config.bricked().is_bricked();
        self.state.with_lock(|state| {
            let next = state.next(event);
            if next != *state {
                info!("Link {:?} -> {:?} on {:?}", *state, next, event);
            } else {
                debug!("Link stays {:?} on {:?}", next, event);
            }
            *state = next;

            let screen = match next {
                LinkState::WifiDown => DisplayState::ConnectingWifi,
                LinkState::Connecting => DisplayState::ConnectingCloud,
                LinkState::ConnectedServer if bricked => DisplayState::Bricked,
                LinkState::ConnectedServer => DisplayState::Ready,
            };
            self.display.set_state(screen);
            next
        })
    }
}
