//! Known peers of one attribute ring, indexed by role.
//!
//! Every [Peer] lives in a single map keyed by address. The four role
//! lists only hold addresses, and a peer carries the role bit for every
//! list it appears in. A peer whose last role is removed is evicted.

use mercury_api::{message::PeerInfo, *};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// The relationship a peer has with the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Successor,
    Predecessor,
    LongNeighbor,
    ReverseLongNeighbor,
}

impl Role {
    const ALL: [Role; 4] = [
        Role::Successor,
        Role::Predecessor,
        Role::LongNeighbor,
        Role::ReverseLongNeighbor,
    ];

    fn bit(self) -> u8 {
        match self {
            Role::Successor => 0x01,
            Role::Predecessor => 0x02,
            Role::LongNeighbor => 0x04,
            Role::ReverseLongNeighbor => 0x08,
        }
    }

    fn idx(self) -> usize {
        match self {
            Role::Successor => 0,
            Role::Predecessor => 1,
            Role::LongNeighbor => 2,
            Role::ReverseLongNeighbor => 3,
        }
    }
}

const RTT_SAMPLES: usize = 20;

/// Liveness bookkeeping for one peer.
///
/// Successors and long neighbors are probed by us, so they are judged
/// by `last_msg`. A predecessor is judged by the pings it sends us as
/// its successor, a reverse long neighbor by the pings it sends us as
/// its long neighbor.
#[derive(Debug)]
pub(crate) struct Liveness {
    pub last_msg: Instant,
    succ_ping_recv: Instant,
    lnbr_ping_recv: Instant,
    pub last_ping_sent: Option<Instant>,
    pub seqno: u8,
    outstanding: Option<(u8, Instant)>,
    rtt: VecDeque<Duration>,
}

impl Liveness {
    fn new(now: Instant) -> Self {
        Self {
            last_msg: now,
            succ_ping_recv: now,
            lnbr_ping_recv: now,
            last_ping_sent: None,
            seqno: 0,
            outstanding: None,
            rtt: VecDeque::new(),
        }
    }

    /// Record an incoming ping under the kinds it was sent as.
    pub fn ping_recv(&mut self, succ: bool, lnbr: bool, now: Instant) {
        if succ {
            self.succ_ping_recv = now;
        }
        if lnbr {
            self.lnbr_ping_recv = now;
        }
    }

    /// When the peer last confirmed `role` with its own probing.
    pub fn last_ping_recv(&self, role: Role) -> Instant {
        match role {
            Role::Predecessor => self.succ_ping_recv,
            Role::ReverseLongNeighbor => self.lnbr_ping_recv,
            Role::Successor | Role::LongNeighbor => self.last_msg,
        }
    }

    /// A newly granted role starts its ping clock at the last contact.
    fn role_gained(&mut self, role: Role) {
        match role {
            Role::Predecessor => self.succ_ping_recv = self.last_msg,
            Role::ReverseLongNeighbor => self.lnbr_ping_recv = self.last_msg,
            Role::Successor | Role::LongNeighbor => (),
        }
    }

    /// Record an outgoing ping, returning its sequence number.
    pub fn ping_sent(&mut self, now: Instant) -> u8 {
        self.seqno = self.seqno.wrapping_add(1);
        self.last_ping_sent = Some(now);
        self.outstanding = Some((self.seqno, now));
        self.seqno
    }

    /// Record a pong. Only the pong for the latest ping yields a sample.
    pub fn pong_recv(&mut self, seqno: u8, now: Instant) {
        if let Some((s, at)) = self.outstanding {
            if s == seqno {
                self.outstanding = None;
                self.rtt.push_back(now - at);
                while self.rtt.len() > RTT_SAMPLES {
                    self.rtt.pop_front();
                }
            }
        }
    }

    /// Mean round-trip time over the recent samples.
    pub fn rtt(&self) -> Option<Duration> {
        if self.rtt.is_empty() {
            return None;
        }
        let total: Duration = self.rtt.iter().sum();
        Some(total / self.rtt.len() as u32)
    }
}

#[derive(Debug)]
pub(crate) struct Peer {
    pub addr: PeerAddr,
    pub range: Option<NodeRange>,
    roles: u8,
    pub live: Liveness,
}

impl Peer {
    pub fn has(&self, role: Role) -> bool {
        self.roles & role.bit() != 0
    }

    pub fn info(&self) -> Option<PeerInfo> {
        self.range.map(|range| PeerInfo {
            addr: self.addr.clone(),
            range,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    peers: HashMap<PeerAddr, Peer>,
    lists: [Vec<PeerAddr>; 4],
}

impl Registry {
    /// Look up or create a peer. A supplied range replaces the known one.
    pub fn register(
        &mut self,
        addr: &PeerAddr,
        range: Option<NodeRange>,
        now: Instant,
    ) -> &mut Peer {
        let peer = self.peers.entry(addr.clone()).or_insert_with(|| Peer {
            addr: addr.clone(),
            range: None,
            roles: 0,
            live: Liveness::new(now),
        });
        if let Some(range) = range {
            if !range.is_empty() || peer.range.is_none() {
                peer.range = Some(range);
            }
        }
        peer
    }

    /// Append `addr` to a role list. Must be registered first.
    pub fn add_role(&mut self, addr: &PeerAddr, role: Role) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if peer.has(role) {
            return;
        }
        peer.roles |= role.bit();
        peer.live.role_gained(role);
        self.lists[role.idx()].push(addr.clone());
    }

    /// Put `addr` at the front of a role list, adding the role if needed.
    pub fn set_front(&mut self, addr: &PeerAddr, role: Role) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if !peer.has(role) {
            peer.roles |= role.bit();
            peer.live.role_gained(role);
        }
        let list = &mut self.lists[role.idx()];
        list.retain(|a| a != addr);
        list.insert(0, addr.clone());
    }

    /// Replace a role list wholesale. Peers dropped from the list lose the
    /// role and may be evicted.
    pub fn replace_list(&mut self, role: Role, addrs: Vec<PeerAddr>) {
        let old = std::mem::take(&mut self.lists[role.idx()]);
        for addr in old.iter().filter(|a| !addrs.contains(a)) {
            self.clear_bit(addr, role);
        }
        let mut list = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if let Some(peer) = self.peers.get_mut(&addr) {
                if !list.contains(&addr) {
                    if !peer.has(role) {
                        peer.roles |= role.bit();
                        peer.live.role_gained(role);
                    }
                    list.push(addr);
                }
            }
        }
        self.lists[role.idx()] = list;
    }

    /// Returns true if the role was held.
    pub fn remove_role(&mut self, addr: &PeerAddr, role: Role) -> bool {
        let list = &mut self.lists[role.idx()];
        let len = list.len();
        list.retain(|a| a != addr);
        if list.len() == len {
            return false;
        }
        self.clear_bit(addr, role);
        true
    }

    /// Drop every role, and with them the peer.
    pub fn remove_peer(&mut self, addr: &PeerAddr) -> Option<Peer> {
        for role in Role::ALL {
            self.lists[role.idx()].retain(|a| a != addr);
        }
        self.peers.remove(addr)
    }

    /// Forget a registered peer that ended up without any role.
    pub fn prune(&mut self, addr: &PeerAddr) {
        if self.peers.get(addr).map(|p| p.roles == 0).unwrap_or(false) {
            self.peers.remove(addr);
        }
    }

    fn clear_bit(&mut self, addr: &PeerAddr, role: Role) {
        let evict = match self.peers.get_mut(addr) {
            None => false,
            Some(peer) => {
                peer.roles &= !role.bit();
                peer.roles == 0
            }
        };
        if evict {
            self.peers.remove(addr);
        }
    }

    pub fn lookup(&self, addr: &PeerAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn lookup_mut(&mut self, addr: &PeerAddr) -> Option<&mut Peer> {
        self.peers.get_mut(addr)
    }

    pub fn has_role(&self, addr: &PeerAddr, role: Role) -> bool {
        self.peers.get(addr).map(|p| p.has(role)).unwrap_or(false)
    }

    pub fn list(&self, role: Role) -> &[PeerAddr] {
        &self.lists[role.idx()]
    }

    pub fn first(&self, role: Role) -> Option<&Peer> {
        self.lists[role.idx()]
            .first()
            .and_then(|a| self.peers.get(a))
    }

    pub fn infos(&self, role: Role) -> Vec<PeerInfo> {
        self.lists[role.idx()]
            .iter()
            .filter_map(|a| self.peers.get(a).and_then(Peer::info))
            .collect()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers with a known range, ordered by range start.
    pub fn sorted_view(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> =
            self.peers.values().filter_map(Peer::info).collect();
        out.sort_by(|a, b| {
            a.range.min.cmp(&b.range.min).then(a.addr.cmp(&b.addr))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        for list in self.lists.iter_mut() {
            list.clear();
        }
    }

    /// Every listed address is a known peer carrying the role, and every
    /// role bit is backed by exactly one list entry.
    #[cfg(test)]
    pub fn check_consistency(&self) {
        for role in Role::ALL {
            let list = &self.lists[role.idx()];
            for addr in list {
                let peer = self.peers.get(addr).expect("listed peer missing");
                assert!(peer.has(role), "{addr} listed without {role:?}");
                assert_eq!(1, list.iter().filter(|a| *a == addr).count());
            }
        }
        for peer in self.peers.values() {
            assert_ne!(0, peer.roles, "{} has no roles", peer.addr);
            for role in Role::ALL {
                if peer.has(role) {
                    assert!(self.lists[role.idx()].contains(&peer.addr));
                }
            }
        }
    }
}
