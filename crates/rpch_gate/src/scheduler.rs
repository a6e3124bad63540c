// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The cooperative scheduler driving the context pool.
//!
//! Worker threads pull slots off a run queue and invoke the step function;
//! the verdict tells the scheduler what to do with the slot next. Parked
//! sockets live in the readiness queue, sleeping slots wait for a signal,
//! idle slots are re-run every tick.

use std::collections::{HashSet, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::readiness::{Interest, Readiness, Wait};
use crate::vconn::SlotId;

/// How often idle slots are re-dispatched.
pub const IDLE_TICK: Duration = Duration::from_millis(100);

/// What a context step tells the scheduler to do with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Re-dispatch immediately.
    Cont,
    /// Internal step consumed; re-enter the same state function. Never
    /// escapes the process loop.
    Loop,
    /// Nothing to do now; re-dispatch after a short tick.
    Idle,
    /// Park until the socket is readable.
    PollRead,
    /// Park until the socket is writable.
    PollWrite,
    /// Park until signalled.
    Sleep,
    /// End the tunnel; the step function has not cleaned up yet.
    Runoff,
    /// End the tunnel; transport released.
    Close,
}

struct Queues {
    run: VecDeque<SlotId>,
    sleeping: HashSet<SlotId>,
    idle: Vec<SlotId>,
    shutdown: bool,
}

pub struct Scheduler {
    queues: Mutex<Queues>,
    available: Condvar,
    /// Signals that raced with a running context; consumed when its verdict
    /// is routed.
    pending: Vec<AtomicBool>,
    readiness: Arc<dyn Readiness>,
}

impl Scheduler {
    pub fn new(slots: usize, readiness: Arc<dyn Readiness>) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            queues: Mutex::new(Queues {
                run: VecDeque::new(),
                sleeping: HashSet::new(),
                idle: Vec::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            pending: (0..slots).map(|_| AtomicBool::new(false)).collect(),
            readiness,
        })
    }

    /// Makes `slot` runnable now.
    pub fn enqueue(&self, slot: SlotId) {
        let mut q = self.queues.lock().unwrap();
        q.sleeping.remove(&slot);
        q.run.push_back(slot);
        drop(q);
        self.available.notify_one();
    }

    /// Blocks until a slot is runnable; None on shutdown.
    pub fn next(&self) -> Option<SlotId> {
        let mut q = self.queues.lock().unwrap();
        loop {
            if let Some(slot) = q.run.pop_front() {
                return Some(slot);
            }
            if q.shutdown {
                return None;
            }
            q = self.available.wait(q).unwrap();
        }
    }

    /// Wakes a sleeping or idle slot; remembered if the slot is mid-step.
    pub fn signal(&self, slot: SlotId) {
        self.pending[slot].store(true, Ordering::Release);
        let mut q = self.queues.lock().unwrap();
        let was_waiting = q.sleeping.remove(&slot) || {
            let before = q.idle.len();
            q.idle.retain(|&s| s != slot);
            q.idle.len() != before
        };
        if was_waiting {
            self.pending[slot].store(false, Ordering::Release);
            q.run.push_back(slot);
            drop(q);
            self.available.notify_one();
        }
    }

    /// Routes a step verdict. `fd` and `deadline` back the polling verdicts.
    pub fn route(&self, slot: SlotId, verdict: Verdict, fd: Option<RawFd>, deadline: Instant) {
        match verdict {
            Verdict::Cont => self.enqueue(slot),
            Verdict::Idle => {
                if self.pending[slot].swap(false, Ordering::AcqRel) {
                    self.enqueue(slot);
                } else {
                    self.queues.lock().unwrap().idle.push(slot);
                }
            }
            Verdict::Sleep => {
                if self.pending[slot].swap(false, Ordering::AcqRel) {
                    self.enqueue(slot);
                } else {
                    self.queues.lock().unwrap().sleeping.insert(slot);
                }
            }
            Verdict::PollRead | Verdict::PollWrite => {
                let interest = if verdict == Verdict::PollRead {
                    Interest::Read
                } else {
                    Interest::Write
                };
                match fd {
                    Some(fd) => self.readiness.arm(slot, fd, interest, deadline),
                    // No socket to wait on; degrade to a tick.
                    None => self.queues.lock().unwrap().idle.push(slot),
                }
            }
            Verdict::Close => {}
            // Consumed by the process loop before routing.
            Verdict::Loop | Verdict::Runoff => unreachable!("unrouted verdict {verdict:?}"),
        }
    }

    /// The poller body: runs until shutdown, feeding readiness and tick
    /// wakeups back into the run queue.
    pub fn poll_loop(&self) {
        let mut last_tick = Instant::now();
        loop {
            match self.readiness.wait(IDLE_TICK) {
                Wait::Shutdown => break,
                Wait::Ready(tokens) => {
                    let mut q = self.queues.lock().unwrap();
                    for t in tokens {
                        q.run.push_back(t);
                    }
                    drop(q);
                    self.available.notify_all();
                }
                Wait::Timeout => {}
            }
            if last_tick.elapsed() >= IDLE_TICK {
                last_tick = Instant::now();
                let mut q = self.queues.lock().unwrap();
                if q.shutdown {
                    break;
                }
                let idle = std::mem::take(&mut q.idle);
                let any = !idle.is_empty();
                q.run.extend(idle);
                drop(q);
                if any {
                    self.available.notify_all();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        {
            let mut q = self.queues.lock().unwrap();
            q.shutdown = true;
        }
        self.readiness.shutdown();
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.queues.lock().unwrap().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::PollReadiness;

    fn sched(slots: usize) -> Arc<Scheduler> {
        Scheduler::new(slots, Arc::new(PollReadiness::new().unwrap()))
    }

    #[test]
    fn enqueue_and_next() {
        let s = sched(4);
        s.enqueue(2);
        s.enqueue(3);
        assert_eq!(s.next(), Some(2));
        assert_eq!(s.next(), Some(3));
    }

    #[test]
    fn signal_wakes_a_sleeper() {
        let s = sched(4);
        s.route(1, Verdict::Sleep, None, Instant::now());
        s.signal(1);
        assert_eq!(s.next(), Some(1));
    }

    #[test]
    fn signal_before_sleep_is_not_lost() {
        let s = sched(4);
        // The signal lands while the context is still mid-step.
        s.signal(1);
        // When the verdict is routed, the pending signal converts the sleep
        // into an immediate re-dispatch.
        s.route(1, Verdict::Sleep, None, Instant::now());
        assert_eq!(s.next(), Some(1));
    }

    #[test]
    fn shutdown_unblocks_next() {
        let s = sched(1);
        let s2 = s.clone();
        let t = std::thread::spawn(move || s2.next());
        std::thread::sleep(Duration::from_millis(30));
        s.shutdown();
        assert_eq!(t.join().unwrap(), None);
    }

    #[test]
    fn idle_slots_come_back_on_tick() {
        let s = sched(2);
        let s2 = s.clone();
        let poller = std::thread::spawn(move || s2.poll_loop());
        s.route(0, Verdict::Idle, None, Instant::now());
        let start = Instant::now();
        assert_eq!(s.next(), Some(0));
        assert!(start.elapsed() >= Duration::from_millis(1));
        s.shutdown();
        poller.join().unwrap();
    }
}
