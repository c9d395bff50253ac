//! Process-wide lifecycle state with monotonic transitions.

use std::fmt::{Display, Formatter};
use tokio::sync::watch;
use tracing::debug;

const LIFECYCLE_TAG: &str = "Lifecycle:";
const LIFECYCLE_FN_ADVANCE_TAG: &str = "advance():";

/// Ordered so that a legal transition always moves to a greater value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerLifecycleState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl Display for ServerLifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerLifecycleState::New => "New",
            ServerLifecycleState::Starting => "Starting",
            ServerLifecycleState::Running => "Running",
            ServerLifecycleState::Stopping => "Stopping",
            ServerLifecycleState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

pub(crate) struct LifecycleCell {
    state: watch::Sender<ServerLifecycleState>,
}

impl LifecycleCell {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ServerLifecycleState::New);
        Self { state }
    }

    pub(crate) fn current(&self) -> ServerLifecycleState {
        *self.state.borrow()
    }

    /// Compare-and-set: moves `from -> to` only if the cell still holds `from`.
    /// On failure returns the state actually observed.
    pub(crate) fn advance(
        &self,
        from: ServerLifecycleState,
        to: ServerLifecycleState,
    ) -> Result<(), ServerLifecycleState> {
        let mut observed = from;
        let advanced = self.state.send_if_modified(|state| {
            observed = *state;
            if *state == from && to > from {
                *state = to;
                true
            } else {
                false
            }
        });

        if advanced {
            debug!("{LIFECYCLE_TAG}:{LIFECYCLE_FN_ADVANCE_TAG} {from} -> {to}");
            Ok(())
        } else {
            Err(observed)
        }
    }

    /// Moves forward to `to` from whatever earlier state the cell is in.
    pub(crate) fn advance_to(&self, to: ServerLifecycleState) -> bool {
        let mut from = to;
        let advanced = self.state.send_if_modified(|state| {
            from = *state;
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        });
        if advanced {
            debug!("{LIFECYCLE_TAG}:{LIFECYCLE_FN_ADVANCE_TAG} {from} -> {to}");
        }
        advanced
    }

    /// Resolves once the cell has reached `target` or any later state.
    pub(crate) async fn reached(&self, target: ServerLifecycleState) -> ServerLifecycleState {
        let mut receiver = self.state.subscribe();
        let reached = match receiver.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            // the sender lives in `self`, so it cannot be gone while we borrow it
            Err(_) => self.current(),
        };
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleCell;
    use super::ServerLifecycleState::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn advance_requires_expected_state() {
        let cell = LifecycleCell::new();

        assert_eq!(cell.advance(Running, Stopping), Err(New));
        assert!(cell.advance(New, Starting).is_ok());
        assert!(cell.advance(Starting, Running).is_ok());
        assert_eq!(cell.current(), Running);
    }

    #[test]
    fn back_edges_are_refused() {
        let cell = LifecycleCell::new();
        cell.advance(New, Starting).unwrap();
        cell.advance(Starting, Running).unwrap();

        assert_eq!(cell.advance(Running, Starting), Err(Running));
        assert!(!cell.advance_to(New));
        assert_eq!(cell.current(), Running);
    }

    #[test]
    fn advance_to_can_skip_states() {
        let cell = LifecycleCell::new();
        cell.advance(New, Starting).unwrap();

        assert!(cell.advance_to(Stopped));
        assert!(!cell.advance_to(Stopped));
        assert_eq!(cell.current(), Stopped);
    }

    #[tokio::test]
    async fn reached_wakes_on_later_state() {
        let cell = Arc::new(LifecycleCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.reached(Stopping).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.advance_to(Stopped);

        assert_eq!(waiter.await.unwrap(), Stopped);
    }

    #[tokio::test]
    async fn reached_returns_at_once_when_already_past_target() {
        let cell = LifecycleCell::new();
        cell.advance_to(Stopped);

        assert_eq!(cell.reached(Running).await, Stopped);
    }
}
