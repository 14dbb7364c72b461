//! Totally-ordered admission monitors.
//!
//! One `Monitor` instance each serves local order (single-slot admission of
//! group actions), apply order and commit order. An action `enter`s its slot
//! once every preceding slot has left, `leave`s it to admit the successor,
//! or `self_cancel`s a slot it will never occupy. `drain` waits until every
//! slot up to a boundary has completed.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use crate::core::Seqno;

#[derive(Debug)]
struct Inner {
    /// Highest seqno up to which every slot has completed.
    last_left: i64,
    /// Out-of-order completions waiting to be folded into `last_left`.
    finished: BTreeSet<i64>,
}

impl Inner {
    fn fold_finished(&mut self) {
        while self.finished.remove(&(self.last_left + 1)) {
            self.last_left += 1;
        }
    }
}

#[derive(Debug)]
pub struct Monitor {
    name: &'static str,
    /// Slots tolerated past `last_left` before `would_block` reports true.
    window: i64,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Monitor {
    pub fn new(name: &'static str, window: i64) -> Self {
        Monitor {
            name,
            window,
            inner: Mutex::new(Inner {
                last_left: Seqno::UNDEFINED.get(),
                finished: BTreeSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reset the monitor to a freshly installed position. Pending
    /// out-of-order completions are discarded.
    pub fn set_initial_position(&self, seqno: Seqno) {
        let mut inner = self.lock();
        inner.last_left = seqno.get();
        inner.finished.clear();
        self.cond.notify_all();
    }

    /// Block until `seqno` is the next admissible slot.
    pub fn enter(&self, seqno: Seqno) {
        let mut inner = self.lock();
        while inner.last_left != seqno.get() - 1 {
            inner = self
                .cond
                .wait(inner)
                .expect("monitor condvar wait poisoned");
        }
    }

    /// Release the slot held by `enter`, admitting the successor.
    pub fn leave(&self, seqno: Seqno) {
        let mut inner = self.lock();
        debug_assert_eq!(
            inner.last_left,
            seqno.get() - 1,
            "{} monitor leave out of order",
            self.name
        );
        inner.last_left = seqno.get();
        inner.fold_finished();
        self.cond.notify_all();
    }

    /// Complete a slot without occupying it. May run ahead of the current
    /// admission point; the completion is folded in when its turn comes.
    pub fn self_cancel(&self, seqno: Seqno) {
        let mut inner = self.lock();
        if inner.last_left == seqno.get() - 1 {
            inner.last_left = seqno.get();
            inner.fold_finished();
            self.cond.notify_all();
        } else if inner.last_left < seqno.get() {
            inner.finished.insert(seqno.get());
        }
    }

    /// Block until every slot up to and including `upto` has completed.
    pub fn drain(&self, upto: Seqno) {
        let mut inner = self.lock();
        while inner.last_left < upto.get() {
            inner = self
                .cond
                .wait(inner)
                .expect("monitor condvar wait poisoned");
        }
    }

    /// Whether entering `seqno` now would exceed the admission window.
    pub fn would_block(&self, seqno: Seqno) -> bool {
        let inner = self.lock();
        seqno.get() - inner.last_left > self.window
    }

    pub fn last_left(&self) -> Seqno {
        Seqno::new(self.lock().last_left)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("monitor lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn slots_admit_in_order() {
        let monitor = Arc::new(Monitor::new("test", 16));
        monitor.set_initial_position(Seqno::new(0));

        let m = Arc::clone(&monitor);
        let worker = thread::spawn(move || {
            m.enter(Seqno::new(2));
            m.leave(Seqno::new(2));
        });

        // Slot 2 cannot be admitted until slot 1 leaves.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(monitor.last_left(), Seqno::new(0));

        monitor.enter(Seqno::new(1));
        monitor.leave(Seqno::new(1));
        worker.join().unwrap();
        assert_eq!(monitor.last_left(), Seqno::new(2));
    }

    #[test]
    fn self_cancel_ahead_folds_in_later() {
        let monitor = Monitor::new("test", 16);
        monitor.set_initial_position(Seqno::new(0));

        monitor.self_cancel(Seqno::new(3));
        monitor.self_cancel(Seqno::new(2));
        assert_eq!(monitor.last_left(), Seqno::new(0));

        monitor.self_cancel(Seqno::new(1));
        assert_eq!(monitor.last_left(), Seqno::new(3));
    }

    #[test]
    fn drain_waits_for_boundary() {
        let monitor = Arc::new(Monitor::new("test", 16));
        monitor.set_initial_position(Seqno::new(10));

        let m = Arc::clone(&monitor);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for s in 11..=13 {
                m.self_cancel(Seqno::new(s));
            }
        });

        monitor.drain(Seqno::new(13));
        assert_eq!(monitor.last_left(), Seqno::new(13));
        worker.join().unwrap();
    }

    #[test]
    fn would_block_reflects_window() {
        let monitor = Monitor::new("test", 4);
        monitor.set_initial_position(Seqno::new(0));
        assert!(!monitor.would_block(Seqno::new(4)));
        assert!(monitor.would_block(Seqno::new(5)));
    }

    #[test]
    fn set_initial_position_discards_pending() {
        let monitor = Monitor::new("test", 16);
        monitor.set_initial_position(Seqno::new(0));
        monitor.self_cancel(Seqno::new(5));
        monitor.set_initial_position(Seqno::new(100));
        monitor.self_cancel(Seqno::new(101));
        assert_eq!(monitor.last_left(), Seqno::new(101));
    }
}
