// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The two MS-RPCH channel variants and their lifecycle state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::pdu::{PduQueue, RtsCall};

/// Response budget of one OUT channel before it must be replaced.
pub const OUT_CHANNEL_MAX_LENGTH: u64 = 0x4000_0000;

/// When no more than this much of the budget remains, recycling begins.
pub const MAX_RECYCLING_REMAINING: u64 = 0x400_0000;

/// How long an OUT channel may sit waiting for its IN peer or its recycled
/// successor.
pub const OUT_CHANNEL_MAX_WAIT: Duration = Duration::from_secs(10);

/// Below this many bytes of send credit the OUT channel does not bother
/// writing.
pub const WINDOW_FLOOR: u32 = 1024;

/// OUT-channel lifecycle. IN channels only use `OpenStart`, `Opened` and
/// `Recycled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    OpenStart,
    WaitInChannel,
    Recycling,
    WaitRecycled,
    Opened,
    Recycled,
}

/// Client→server half of a tunnel.
#[derive(Default)]
pub struct RpcInChannel {
    pub connection_cookie: String,
    pub channel_cookie: String,
    pub life_time: u32,
    pub client_keepalive: Duration,
    /// Remaining inbound flow credit.
    pub available_window: u32,
    pub bytes_received: u32,
    pub assoc_group_id: String,
    /// Length of the fragment currently being assembled, 0 between PDUs.
    pub frag_length: u16,
    /// PDUs produced for the peer while the paired OUT channel is obsolete;
    /// drained by the successor.
    pub queue: PduQueue,
    pub state: ChannelState,
}

/// Server→client half of a tunnel.
#[derive(Default)]
pub struct RpcOutChannel {
    pub connection_cookie: String,
    pub channel_cookie: String,
    /// Set once OUTR2/A2 went out; the channel then expects a successor.
    pub obsolete: bool,
    pub client_keepalive: Duration,
    /// Outbound flow credit. Atomic: refilled by the IN context's
    /// FlowControlAck path while the OUT context debits it.
    pub available_window: AtomicU32,
    pub window_size: u32,
    /// Total non-RTS bytes sent.
    pub bytes_sent: AtomicU32,
    pub frag_length: u16,
    /// The call that opened the channel, retained to emit control PDUs.
    pub call: Option<Box<dyn RtsCall>>,
    pub queue: PduQueue,
    pub state: ChannelState,
}

impl RpcOutChannel {
    pub fn window(&self) -> u32 {
        self.available_window.load(Ordering::Acquire)
    }

    /// Debits the window and credits the sent counter for non-RTS bytes.
    pub fn account_sent(&self, n: u32) {
        self.available_window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(w.saturating_sub(n))
            })
            .ok();
        self.bytes_sent.fetch_add(n, Ordering::AcqRel);
    }
}

/// Whether an OUT channel that has `bytes_rw` of its `total_length` budget
/// behind it should begin recycling.
pub fn recycling_due(total_length: u64, bytes_rw: u64, obsolete: bool) -> bool {
    total_length > 0 && total_length.saturating_sub(bytes_rw) <= MAX_RECYCLING_REMAINING && !obsolete
}
