use tokio::sync::watch;
use tracing::debug;

use crate::net::wire::Key;

/// Where a run is in its lifecycle. `Quitting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Executing,
    Paused,
    Quitting,
}

impl ControlState {
    /// The state after `key`, or `None` when the key doesn't change state.
    /// Transitions that make no sense (resuming a running run, pausing a
    /// quitting one) are ignored rather than rejected.
    pub fn after(self, key: Key) -> Option<ControlState> {
        use ControlState::*;
        match (self, key) {
            (Executing, Key::Pause) => Some(Paused),
            (Paused, Key::Resume) => Some(Executing),
            (Executing | Paused, Key::Quit | Key::Kill) => Some(Quitting),
            _ => None,
        }
    }
}

/// The control state of one run. Key handlers write it, the turn loop reads
/// it at turn boundaries and parks on it while paused.
pub struct Control {
    tx: watch::Sender<ControlState>,
}

impl Control {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlState::Executing);
        Self { tx }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    /// Applies a key and returns the resulting state.
    pub fn apply(&self, key: Key) -> ControlState {
        self.tx.send_if_modified(|state| match state.after(key) {
            Some(next) => {
                debug!(from = ?*state, to = ?next, ?key, "control state changed");
                *state = next;
                true
            }
            None => false,
        });
        self.state()
    }

    /// Returns the state to act on at a turn boundary. While paused this
    /// waits until the run is resumed or quit.
    pub async fn checkpoint(&self) -> ControlState {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| *s != ControlState::Paused).await {
            Ok(state) => *state,
            // the sender lives in self, so this can't happen
            Err(_) => ControlState::Quitting,
        };
        state
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}
