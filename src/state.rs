//! Connection state shared between the agent and observers on other threads.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Connectivity lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Gathering,
    ConnectingDirect,
    ConnectingRelay,
    PerformingHandshake,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Gathering => "gathering",
            ConnectionState::ConnectingDirect => "connecting-direct",
            ConnectionState::ConnectingRelay => "connecting-relay",
            ConnectionState::PerformingHandshake => "performing-handshake",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

type Listener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct StateCell {
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<Listener>>,
}

/// Cloneable handle to the state: one mutex around the value, plus a
/// synchronous fan-out to listeners on every change.
#[derive(Clone)]
pub struct StateHandle {
    cell: Arc<StateCell>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(StateCell {
                state: Mutex::new(ConnectionState::New),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.cell.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener. It runs on whichever thread changes the state.
    pub fn subscribe(&self, listener: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.cell
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    /// Move to `next`, notifying listeners if the state actually changed.
    /// Returns the previous state.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let previous = {
            let mut state = self.cell.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, next)
        };
        if previous == next {
            return previous;
        }

        tracing::info!("ICE state {} -> {}", previous, next);
        // Listeners run outside both locks so they may read the state or
        // subscribe further listeners.
        let listeners: Vec<Listener> = self
            .cell
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(next);
        }
        previous
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle").field("state", &self.get()).finish()
    }
}
