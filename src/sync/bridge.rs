use crate::client::CoordError;
use std::sync::Mutex;
use tokio::sync::Notify;

enum Cell<T> {
    Empty,
    Value(T),
    Failed(CoordError),
    /// A value was supplied and already taken by `pop`; the cycle is still
    /// terminal until `clear` is called.
    Taken,
}

///
/// A single-slot drop box adapting an asynchronous single-callback operation
/// into a call that suspends the issuing task until the callback fires.
///
/// The slot transitions from empty to terminal exactly once per cycle:
/// whichever of [`push`](SyncBridge::push) or [`fail`](SyncBridge::fail)
/// lands first wins, later supplies are no-ops. A fresh cycle requires an
/// explicit [`clear`](SyncBridge::clear). Only one waiter is supported per
/// cycle.
///
pub struct SyncBridge<T> {
    cell: Mutex<Cell<T>>,
    notify: Notify,
}

impl<T> Default for SyncBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncBridge<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(Cell::Empty),
            notify: Notify::new(),
        }
    }

    ///
    /// Supplies the value for this cycle. Returns `false` without touching
    /// the slot if a terminal result was already supplied.
    ///
    pub fn push(&self, value: T) -> bool {
        let mut cell = self.cell.lock().expect("bridge mutex poisoned");
        if !matches!(*cell, Cell::Empty) {
            return false;
        }
        *cell = Cell::Value(value);
        drop(cell);
        self.notify.notify_one();
        true
    }

    ///
    /// Fails this cycle. The error is re-surfaced, with its original variant
    /// and message, to the task blocked in [`pop`](SyncBridge::pop).
    /// Returns `false` if a terminal result was already supplied.
    ///
    pub fn fail(&self, error: CoordError) -> bool {
        let mut cell = self.cell.lock().expect("bridge mutex poisoned");
        if !matches!(*cell, Cell::Empty) {
            return false;
        }
        *cell = Cell::Failed(error);
        drop(cell);
        self.notify.notify_one();
        true
    }

    /// Whether a terminal result has been supplied this cycle.
    pub fn is_done(&self) -> bool {
        !matches!(
            *self.cell.lock().expect("bridge mutex poisoned"),
            Cell::Empty
        )
    }

    /// Resets the slot to empty so the bridge can run another cycle.
    pub fn clear(&self) {
        *self.cell.lock().expect("bridge mutex poisoned") = Cell::Empty;
    }

    ///
    /// Suspends until a terminal result is supplied, then returns it. A
    /// supplied value is taken out of the slot; a supplied error stays and
    /// is cloned out. Calling `pop` again on a cycle whose value was already
    /// taken is a programming error and panics.
    ///
    pub async fn pop(&self) -> Result<T, CoordError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for a wakeup before re-inspecting the slot, so a
            // supply landing in between is never missed.
            notified.as_mut().enable();
            {
                let mut cell = self.cell.lock().expect("bridge mutex poisoned");
                match &*cell {
                    Cell::Empty => {}
                    Cell::Failed(err) => return Err(err.clone()),
                    Cell::Taken => panic!("bridge value already taken, call clear() before reuse"),
                    Cell::Value(_) => {
                        let Cell::Value(value) = std::mem::replace(&mut *cell, Cell::Taken) else {
                            unreachable!()
                        };
                        return Ok(value);
                    }
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn pop_should_await_until_value_is_pushed() {
        let bridge = Arc::new(SyncBridge::<i32>::new());
        let bridge2 = Arc::clone(&bridge);
        let h = tokio::spawn(async move { bridge2.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.push(42));
        let val = h.await.expect("pop task failed");
        assert_eq!(val, Ok(42));
    }

    #[tokio::test]
    async fn pop_should_return_immediately_if_already_done() {
        let bridge = SyncBridge::new();
        bridge.push(7);
        assert_eq!(bridge.pop().await, Ok(7));
    }

    #[tokio::test]
    async fn fail_should_resurface_the_original_error() {
        let bridge = SyncBridge::<()>::new();
        assert!(bridge.fail(CoordError::SessionExpired));
        assert_eq!(bridge.pop().await, Err(CoordError::SessionExpired));
        // The error is sticky until cleared.
        assert_eq!(bridge.pop().await, Err(CoordError::SessionExpired));
    }

    #[tokio::test]
    async fn second_supply_should_not_overwrite_the_first() {
        let bridge = SyncBridge::new();
        assert!(bridge.push(1));
        assert!(!bridge.push(2));
        assert!(!bridge.fail(CoordError::ConnectionLoss));
        assert_eq!(bridge.pop().await, Ok(1));
    }

    #[tokio::test]
    async fn clear_should_reset_done_and_allow_a_new_cycle() {
        let bridge = SyncBridge::new();
        bridge.push(1);
        assert!(bridge.is_done());
        assert_eq!(bridge.pop().await, Ok(1));
        assert!(bridge.is_done());

        bridge.clear();
        assert!(!bridge.is_done());
        bridge.push(2);
        assert_eq!(bridge.pop().await, Ok(2));
    }

    #[tokio::test]
    #[should_panic(expected = "already taken")]
    async fn popping_a_taken_cycle_should_panic() {
        let bridge = SyncBridge::new();
        bridge.push(1);
        let _ = bridge.pop().await;
        let _ = bridge.pop().await;
    }
}
