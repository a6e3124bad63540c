// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Dispatch instrumentation: optional serialization, rate limiting, and wire
//! taps.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hexview::{printable_prefix, HexView};

/// Parsed `ews_debug` CSV: `sequential` forces one dispatch at a time,
/// `rate_limit=<N>` caps dispatches per second.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugOptions {
    pub sequential: bool,
    pub rate_limit: Option<u32>,
}

impl DebugOptions {
    pub fn parse(csv: &str) -> DebugOptions {
        let mut opts = DebugOptions::default();
        for item in csv.split(',') {
            let item = item.trim();
            if item == "sequential" {
                opts.sequential = true;
            } else if let Some(n) = item.strip_prefix("rate_limit=") {
                match n.parse() {
                    Ok(n) if n > 0 => opts.rate_limit = Some(n),
                    _ => tracing::warn!("ignoring bad rate_limit value {n:?}"),
                }
            } else if !item.is_empty() {
                tracing::warn!("unknown ews_debug option {item:?}");
            }
        }
        opts
    }
}

struct RateWindow {
    start: Instant,
    count: u32,
}

pub struct DebugControl {
    opts: DebugOptions,
    http_debug: u8,
    pub request_logging: u8,
    pub response_logging: u8,
    dispatch_lock: Mutex<()>,
    rate: Mutex<RateWindow>,
}

impl DebugControl {
    pub fn new(
        opts: DebugOptions,
        http_debug: u8,
        request_logging: u8,
        response_logging: u8,
    ) -> DebugControl {
        DebugControl {
            opts,
            http_debug,
            request_logging,
            response_logging,
            dispatch_lock: Mutex::new(()),
            rate: Mutex::new(RateWindow {
                start: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn wire_taps(&self) -> bool {
        self.http_debug > 0
    }

    /// Serializes dispatch when `sequential` is set.
    pub fn dispatch_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if self.opts.sequential {
            Some(self.dispatch_lock.lock().unwrap())
        } else {
            None
        }
    }

    /// Sleeps as needed to hold dispatch to the configured per-second cap.
    pub fn throttle(&self) {
        let Some(limit) = self.opts.rate_limit else {
            return;
        };
        let mut sleep_for = None;
        {
            let mut window = self.rate.lock().unwrap();
            let elapsed = window.start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                window.start = Instant::now();
                window.count = 0;
            }
            if window.count >= limit {
                sleep_for = Some(Duration::from_secs(1).saturating_sub(elapsed));
                window.start = Instant::now();
                window.count = 0;
            }
            window.count += 1;
        }
        if let Some(d) = sleep_for {
            std::thread::sleep(d);
        }
    }

    /// Logs inbound wire traffic: printable runs verbatim, binary tails as a
    /// hex dump.
    pub fn dump_read(&self, peer: Option<SocketAddr>, local: Option<SocketAddr>, data: &[u8]) {
        if !self.wire_taps() {
            return;
        }
        Self::dump("<<", peer, local, data);
    }

    pub fn dump_write(&self, peer: Option<SocketAddr>, local: Option<SocketAddr>, data: &[u8]) {
        if !self.wire_taps() {
            return;
        }
        Self::dump(">>", local, peer, data);
    }

    fn dump(arrow: &str, from: Option<SocketAddr>, to: Option<SocketAddr>, data: &[u8]) {
        let from = from.map(|a| a.to_string()).unwrap_or_default();
        let to = to.map(|a| a.to_string()).unwrap_or_default();
        let mut pfx = printable_prefix(data);
        if pfx == data.len() {
            tracing::debug!(
                "{arrow} {from}->{to} {} bytes\n{}",
                data.len(),
                String::from_utf8_lossy(data)
            );
            return;
        }
        // The buffer may hold HTTP headers followed by PDU bytes; keep the
        // text part readable and only dump the rest.
        while pfx > 0 && data[pfx - 1] != b'\r' && data[pfx - 1] != b'\n' {
            pfx -= 1;
        }
        tracing::debug!(
            "{arrow} {from}->{to} {} bytes\n{}{}",
            data.len(),
            String::from_utf8_lossy(&data[..pfx]),
            HexView::new(&data[pfx..])
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv() {
        assert_eq!(
            DebugOptions::parse("sequential,rate_limit=7"),
            DebugOptions {
                sequential: true,
                rate_limit: Some(7)
            }
        );
        assert_eq!(DebugOptions::parse(""), DebugOptions::default());
        assert_eq!(
            DebugOptions::parse("rate_limit=bogus"),
            DebugOptions::default()
        );
    }

    #[test]
    fn sequential_guard_only_when_asked() {
        let ctl = DebugControl::new(DebugOptions::default(), 0, 0, 0);
        assert!(ctl.dispatch_guard().is_none());
        let ctl = DebugControl::new(DebugOptions::parse("sequential"), 0, 0, 0);
        assert!(ctl.dispatch_guard().is_some());
    }

    #[test]
    fn throttle_caps_a_burst() {
        let ctl = DebugControl::new(DebugOptions::parse("rate_limit=1000"), 0, 0, 0);
        let start = Instant::now();
        for _ in 0..10 {
            ctl.throttle();
        }
        // Well under the cap: no sleeping.
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
