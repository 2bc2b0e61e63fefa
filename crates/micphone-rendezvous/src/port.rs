//! Write-once holder for the rendezvous port.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// The listening port, unassigned (`None`) until the socket is bound.
///
/// Assigned at most once; every later read observes the same value.
#[derive(Debug, Default)]
pub struct PortCell {
    port: Mutex<Option<u16>>,
    assigned: Condvar,
}

impl PortCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<u16> {
        *self.lock()
    }

    /// Publish the port. Returns `false` if one was already assigned.
    pub fn set(&self, port: u16) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(port);
        self.assigned.notify_all();
        true
    }

    /// Block until the port is assigned or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<u16> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slot = self
                .assigned
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *slot
    }

    fn lock(&self) -> MutexGuard<'_, Option<u16>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn unassigned_until_set() {
        let cell = PortCell::new();
        assert_eq!(cell.get(), None);
        assert_eq!(cell.wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn set_once() {
        let cell = PortCell::new();
        assert!(cell.set(5004));
        assert!(!cell.set(6000));
        assert_eq!(cell.get(), Some(5004));
    }

    #[test]
    fn wait_wakes_on_set() {
        let cell = Arc::new(PortCell::new());
        let setter = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cell.set(40_000);
            })
        };
        assert_eq!(cell.wait(Duration::from_secs(5)), Some(40_000));
        setter.join().unwrap();
    }
}
