// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Socket readiness as an abstract queue.
//!
//! Contexts that would block park themselves here; the poller thread waits
//! for readiness (or deadline expiry, or shutdown) and hands the tokens back
//! to the scheduler. The production implementation sits on `poll(2)` with a
//! self-pipe for wakeups.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

pub type Token = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// What a wait produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Wait {
    /// These tokens are ready (or past their deadline) and were disarmed.
    Ready(Vec<Token>),
    Timeout,
    Shutdown,
}

pub trait Readiness: Send + Sync {
    /// Parks `fd` until it is ready for `interest`, its `deadline` passes,
    /// or shutdown.
    fn arm(&self, token: Token, fd: RawFd, interest: Interest, deadline: Instant);
    fn wait(&self, max: Duration) -> Wait;
    fn wake(&self);
    fn shutdown(&self);
}

struct Armed {
    fd: RawFd,
    interest: Interest,
    deadline: Instant,
}

pub struct PollReadiness {
    armed: Mutex<HashMap<Token, Armed>>,
    stop: AtomicBool,
    wake_rx: Mutex<File>,
    wake_rx_fd: RawFd,
    wake_tx: Mutex<File>,
}

impl PollReadiness {
    pub fn new() -> std::io::Result<PollReadiness> {
        let (rx, tx) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        let rx = File::from(rx);
        let rx_fd = rx.as_raw_fd();
        Ok(PollReadiness {
            armed: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            wake_rx: Mutex::new(rx),
            wake_rx_fd: rx_fd,
            wake_tx: Mutex::new(File::from(tx)),
        })
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        // A pipe read after POLLIN returns whatever is there without
        // blocking for the full buffer.
        let _ = self.wake_rx.lock().unwrap().read(&mut buf);
    }
}

impl Readiness for PollReadiness {
    fn arm(&self, token: Token, fd: RawFd, interest: Interest, deadline: Instant) {
        self.armed.lock().unwrap().insert(
            token,
            Armed {
                fd,
                interest,
                deadline,
            },
        );
        self.wake();
    }

    fn wait(&self, max: Duration) -> Wait {
        if self.stop.load(Ordering::Acquire) {
            return Wait::Shutdown;
        }

        let now = Instant::now();
        let (snapshot, nearest_deadline): (Vec<(Token, RawFd, Interest)>, Option<Instant>) = {
            let armed = self.armed.lock().unwrap();
            (
                armed.iter().map(|(&t, a)| (t, a.fd, a.interest)).collect(),
                armed.values().map(|a| a.deadline).min(),
            )
        };

        let mut timeout = max;
        if let Some(deadline) = nearest_deadline {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;

        let mut fds = Vec::with_capacity(snapshot.len() + 1);
        // Index 0 is always the wake pipe.
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(self.wake_rx_fd) },
            PollFlags::POLLIN,
        ));
        for &(_, fd, interest) in &snapshot {
            let flags = match interest {
                Interest::Read => PollFlags::POLLIN,
                Interest::Write => PollFlags::POLLOUT,
            };
            fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, flags));
        }

        let _ = poll(&mut fds, PollTimeout::from(ms));

        if self.stop.load(Ordering::Acquire) {
            return Wait::Shutdown;
        }
        if fds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false)
        {
            self.drain_wakeups();
        }

        let fired = PollFlags::POLLIN
            | PollFlags::POLLOUT
            | PollFlags::POLLERR
            | PollFlags::POLLHUP
            | PollFlags::POLLNVAL;
        let now = Instant::now();
        let mut ready = Vec::new();
        {
            let mut armed = self.armed.lock().unwrap();
            for (i, &(token, _, _)) in snapshot.iter().enumerate() {
                let io_ready = fds[i + 1]
                    .revents()
                    .map(|r| r.intersects(fired))
                    .unwrap_or(false);
                let expired = armed
                    .get(&token)
                    .map(|a| a.deadline <= now)
                    .unwrap_or(false);
                if io_ready || expired {
                    armed.remove(&token);
                    ready.push(token);
                }
            }
        }
        if ready.is_empty() {
            Wait::Timeout
        } else {
            Wait::Ready(ready)
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.lock().unwrap().write(&[1]);
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_pair() -> (File, File) {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        (File::from(rx), File::from(tx))
    }

    #[test]
    fn readable_fd_is_reported_ready() {
        let readiness = PollReadiness::new().unwrap();
        let (rx, mut tx) = fd_pair();
        tx.write_all(b"x").unwrap();
        readiness.arm(
            7,
            rx.as_raw_fd(),
            Interest::Read,
            Instant::now() + Duration::from_secs(10),
        );
        match readiness.wait(Duration::from_millis(500)) {
            Wait::Ready(tokens) => assert_eq!(tokens, vec![7]),
            other => panic!("expected ready, got {other:?}"),
        }
        // Disarmed after firing.
        assert_eq!(readiness.wait(Duration::from_millis(10)), Wait::Timeout);
    }

    #[test]
    fn deadline_expiry_counts_as_ready() {
        let readiness = PollReadiness::new().unwrap();
        let (rx, _tx) = fd_pair();
        readiness.arm(
            3,
            rx.as_raw_fd(),
            Interest::Read,
            Instant::now() + Duration::from_millis(30),
        );
        match readiness.wait(Duration::from_millis(500)) {
            Wait::Ready(tokens) => assert_eq!(tokens, vec![3]),
            other => panic!("expected deadline fire, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_interrupts_wait() {
        let readiness = std::sync::Arc::new(PollReadiness::new().unwrap());
        let r2 = readiness.clone();
        let t = std::thread::spawn(move || r2.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        readiness.shutdown();
        assert_eq!(t.join().unwrap(), Wait::Shutdown);
    }

    #[test]
    fn empty_wait_times_out() {
        let readiness = PollReadiness::new().unwrap();
        assert_eq!(readiness.wait(Duration::from_millis(20)), Wait::Timeout);
    }
}
