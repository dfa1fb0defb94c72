use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Signalled,
    TimedOut,
    Interrupted,
}

/// Per-cursor wait state: its own lock and condition, so producers never
/// signal under the buffer lock.
pub(crate) struct Waiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

struct WaiterState {
    signalled: bool,
    interrupted: bool,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState {
                signalled: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn signal(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.signalled = true;
            self.cond.notify_all();
        }
    }

    /// Marks the waiter interrupted; sticky until the owning cursor is done.
    pub fn interrupt(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.interrupted = true;
            self.cond.notify_all();
        }
    }

    /// Consumes a pending signal so the caller can re-probe before sleeping.
    pub fn clear_signal(&self) -> Result<()> {
        self.lock()?.signalled = false;
        Ok(())
    }

    /// Blocks until signalled, interrupted or past `deadline` (`None` waits
    /// indefinitely).
    pub fn wait(&self, deadline: Option<Instant>) -> Result<WaitOutcome> {
        let mut state = self.lock()?;
        loop {
            if state.interrupted {
                return Ok(WaitOutcome::Interrupted);
            }
            if state.signalled {
                return Ok(WaitOutcome::Signalled);
            }
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .map_err(|_| Error::Corrupt("waiter lock poisoned"))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Corrupt("waiter lock poisoned"))?
                        .0
                }
            };
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, WaiterState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("waiter lock poisoned"))
    }
}

/// Registry of blocked cursors: a growable sparse array whose empty slots are
/// reused. Appenders snapshot the live entries and signal them outside every
/// other lock.
pub(crate) struct WaiterList {
    slots: Mutex<Vec<Option<Arc<Waiter>>>>,
}

impl WaiterList {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, waiter: Arc<Waiter>) -> Result<usize> {
        let mut slots = self.lock()?;
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(waiter);
                return Ok(i);
            }
        }
        slots.push(Some(waiter));
        Ok(slots.len() - 1)
    }

    pub fn deregister(&self, slot: usize) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(entry) = slots.get_mut(slot) {
                *entry = None;
            }
        }
    }

    pub fn snapshot(&self) -> Result<Vec<Arc<Waiter>>> {
        let slots = self.lock()?;
        Ok(slots.iter().flatten().cloned().collect())
    }

    pub fn interrupt_all(&self) -> Result<()> {
        for waiter in self.snapshot()? {
            waiter.interrupt();
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Option<Arc<Waiter>>>>> {
        self.slots
            .lock()
            .map_err(|_| Error::Corrupt("waiter list lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_wakes_waiter() {
        let waiter = Waiter::new();
        let worker = {
            let waiter = Arc::clone(&waiter);
            std::thread::spawn(move || waiter.wait(None).expect("wait"))
        };
        std::thread::sleep(Duration::from_millis(10));
        waiter.signal();
        assert_eq!(worker.join().expect("join"), WaitOutcome::Signalled);
    }

    #[test]
    fn deadline_times_out() {
        let waiter = Waiter::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(waiter.wait(Some(deadline)).expect("wait"), WaitOutcome::TimedOut);
    }

    #[test]
    fn interrupt_is_sticky() {
        let waiter = Waiter::new();
        waiter.interrupt();
        assert_eq!(waiter.wait(None).expect("wait"), WaitOutcome::Interrupted);
        waiter.clear_signal().expect("clear");
        assert_eq!(waiter.wait(None).expect("wait"), WaitOutcome::Interrupted);
    }

    #[test]
    fn list_reuses_empty_slots() {
        let list = WaiterList::new();
        let first = list.register(Waiter::new()).expect("register");
        let second = list.register(Waiter::new()).expect("register");
        list.deregister(first);
        assert_eq!(list.snapshot().expect("snapshot").len(), 1);
        let third = list.register(Waiter::new()).expect("register");
        assert_eq!(third, first);
        assert_ne!(second, third);
        assert_eq!(list.snapshot().expect("snapshot").len(), 2);
    }
}
