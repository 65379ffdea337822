//! Side effects requested by hub handlers.
//!
//! Hub handlers are synchronous. Anything that touches the outside world
//! (network, timers, bootstrap, waiters) is pushed onto a [Ctx] and
//! carried out by the node event loop after the handler returns.

use mercury_api::{message::Message, *};
use std::time::Duration;
use tokio::time::Instant;

/// Identifies one scheduled timer of a hub. Scheduling a key that is
/// already pending replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    JoinRetry,
    SuccMaintenance,
    PingPeers,
    PingBatch,
    LongNbrRepair,
    NeighborRequest(u32),
    ExpirySweep,
    LoadWindow,
    LoadBalanceCheck,
    ResetLocalLb,
    LeaveJoinTracker,
    LeaveCheck,
    FinishLeave,
    BootstrapHeartbeat,
}

#[derive(Debug)]
pub(crate) enum Effect {
    Send {
        to: PeerAddr,
        hop_count: u32,
        msg: Message,
    },
    Timer {
        key: TimerKey,
        after: Duration,
    },
    Cancel(TimerKey),
    CancelAll,

    /// Ask the bootstrap for a representative, then call `start_join`.
    FindRepresentative,
    JoinComplete,
    JoinFailed(MercError),
    LeaveComplete,

    /// Advertise our range with the bootstrap.
    Announce(NodeRange),
    Withdraw,
}

#[derive(Debug)]
pub(crate) struct Ctx {
    pub now: Instant,
    pub effects: Vec<Effect>,
}

impl Ctx {
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            effects: Vec::new(),
        }
    }

    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn send(&mut self, to: PeerAddr, msg: Message) {
        self.send_hop(to, 0, msg);
    }

    pub fn send_hop(&mut self, to: PeerAddr, hop_count: u32, msg: Message) {
        self.effects.push(Effect::Send { to, hop_count, msg });
    }

    pub fn timer(&mut self, key: TimerKey, after: Duration) {
        self.effects.push(Effect::Timer { key, after });
    }

    pub fn cancel(&mut self, key: TimerKey) {
        self.effects.push(Effect::Cancel(key));
    }
}
