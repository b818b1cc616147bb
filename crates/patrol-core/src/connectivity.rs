//! Connectivity monitor

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

/// A connectivity transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub const fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Current connectivity plus an ordered stream of transitions.
///
/// Platform adapters report state with [`ConnectivityMonitor::set_online`];
/// repeated reports of the same state are ignored.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
    transitions: broadcast::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        let (transitions, _) = broadcast::channel(32);
        Self {
            state: Arc::new(state),
            transitions,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the current state. Returns whether this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
            // No subscribers is fine
            let _ = self.transitions.send(Connectivity::from_online(online));
        }
        changed
    }

    /// Watch the current state
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Receive every transition from now on, in order
    pub fn transitions(&self) -> broadcast::Receiver<Connectivity> {
        self.transitions.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
