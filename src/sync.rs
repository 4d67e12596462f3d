// src/sync.rs - shared shutdown/stop signalling

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A settable flag that sleeping threads can wait on with a timeout.
///
/// Every long-lived thread in the engine parks on one of these instead of a
/// bare `thread::sleep`, so a stop request is observed at the granularity of
/// the sleep bound rather than after it.
#[derive(Clone)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn set(&self) {
        let (flag, cvar) = &*self.inner;
        let mut set = flag.lock().unwrap();
        *set = true;
        cvar.notify_all();
    }

    pub fn clear(&self) {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap()
    }

    /// Wait until the event is set or `timeout` elapses.
    /// Returns true if the event was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let mut set = flag.lock().unwrap();
        if *set {
            return true;
        }
        let (guard, _res) = cvar
            .wait_timeout_while(set, timeout, |s| !*s)
            .unwrap();
        set = guard;
        *set
    }

    /// Wait with no timeout until the event is set.
    pub fn wait_forever(&self) {
        let (flag, cvar) = &*self.inner;
        let mut set = flag.lock().unwrap();
        while !*set {
            set = cvar.wait(set).unwrap();
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_when_unset() {
        let ev = Event::new();
        assert!(!ev.wait(Duration::from_millis(20)));
        assert!(!ev.is_set());
    }

    #[test]
    fn set_wakes_waiter() {
        let ev = Event::new();
        let ev2 = ev.clone();
        let h = thread::spawn(move || ev2.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        ev.set();
        assert!(h.join().unwrap());
    }

    #[test]
    fn clear_resets() {
        let ev = Event::new();
        ev.set();
        assert!(ev.is_set());
        ev.clear();
        assert!(!ev.is_set());
    }
}
