//! The outcome a reconciler returns to its caller: either "come back after
//! this long" or "don't requeue on a timer, wait for the next watch event".

use std::time::Duration;

/// What a reconciler wants to happen next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Requeue after the given duration has elapsed.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Don't requeue on a timer; rely on a future watch event to wake the
    /// reconciler instead (e.g. after this reconciliation wrote a patch that
    /// will itself trigger a new event).
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// The requested requeue delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    /// Pick whichever action requests the sooner requeue, preferring a
    /// concrete delay over `await_change`.
    pub fn join(self, other: Self) -> Self {
        match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Self::requeue(a.min(b)),
            (Some(a), None) => Self::requeue(a),
            (None, Some(b)) => Self::requeue(b),
            (None, None) => Self::await_change(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_prefers_the_sooner_requeue() {
        let a = Action::requeue(Duration::from_secs(30));
        let b = Action::requeue(Duration::from_secs(5));
        assert_eq!(a.join(b).requeue_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn join_prefers_a_concrete_delay_over_await_change() {
        let a = Action::await_change();
        let b = Action::requeue(Duration::from_secs(5));
        assert_eq!(a.join(b).requeue_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn join_of_two_await_changes_is_await_change() {
        let a = Action::await_change();
        let b = Action::await_change();
        assert_eq!(a.join(b).requeue_after(), None);
    }
}
