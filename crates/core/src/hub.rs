//! One attribute ring ("hub") as seen by the local node.
//!
//! A [Hub] is plain synchronous state. Handlers mutate it and request
//! side effects through a [Ctx]; the node event loop owns the hub and
//! executes those effects. This keeps every handler run-to-completion
//! and lets the protocol be tested without a runtime.

use crate::MercuryNodeConfig;
use mercury_api::{app::DynApplication, message::*, sampler::DynSampler, *};
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

mod ctx;
pub(crate) use ctx::*;

mod registry;
use registry::*;

mod store;
use store::*;

mod load_balance;
mod long_nbr;
mod ring;
mod router;

pub(crate) use router::RangeCache;

/// Ring membership status of a hub.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum HubStatus {
    /// Not part of the ring.
    Unjoined,

    /// A join request is outstanding.
    Joining,

    /// Owning a range.
    Joined,
}

/// A point-in-time view of a hub, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSnapshot {
    /// The attribute.
    pub attr: AttrId,

    /// Membership status.
    pub status: HubStatus,

    /// The owned range, once joined.
    pub range: Option<NodeRange>,

    /// Successors, nearest first.
    pub successors: Vec<PeerInfo>,

    /// Predecessors, current first.
    pub predecessors: Vec<PeerInfo>,

    /// Long-distance shortcuts.
    pub long_neighbors: Vec<PeerInfo>,

    /// Peers holding us as a long neighbor.
    pub reverse_long_neighbors: Vec<PeerInfo>,

    /// Current long neighbor repair round.
    pub epoch: u32,

    /// Stored subscriptions.
    pub interests: usize,

    /// Stored triggers.
    pub events: usize,

    /// Current routing load.
    pub load: f64,
}

#[derive(Debug)]
struct Leaving {
    pred: Option<(PeerAddr, NodeRange)>,
    rejoin_at: Option<PeerAddr>,
}

pub(crate) struct Hub {
    attr: AttrId,
    space: AttrSpace,
    me: PeerAddr,
    config: Arc<MercuryNodeConfig>,
    app: DynApplication,
    sampler: DynSampler,
    rng: rand::rngs::StdRng,

    status: HubStatus,
    range: Option<NodeRange>,
    range_changed_at: Option<Instant>,
    reg: Registry,
    cache: RangeCache,

    join_target: Option<PeerAddr>,
    join_backoff: Option<backon::ExponentialBackoff>,
    join_attempts: u32,
    pending_joins: HashMap<PeerAddr, Instant>,
    leaving: Option<Leaving>,

    ping_queue: Vec<PeerAddr>,

    epoch: u32,
    next_nonce: u32,
    outstanding: HashMap<u32, Value>,

    store: Store,
    load: RoutingLoad,
    lb: load_balance::LoadBalancer,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("attr", &self.attr)
            .field("me", &self.me)
            .field("status", &self.status)
            .field("range", &self.range)
            .finish()
    }
}

/// How long after a range change routed items are answered with a pong.
const QUICK_PONG_WINDOW: Duration = Duration::from_secs(1);

impl Hub {
    pub fn new(
        attr: AttrId,
        space: AttrSpace,
        me: PeerAddr,
        config: Arc<MercuryNodeConfig>,
        app: DynApplication,
        sampler: DynSampler,
    ) -> Self {
        Self::with_rng(
            attr,
            space,
            me,
            config,
            app,
            sampler,
            rand::rngs::StdRng::from_entropy(),
        )
    }

    pub fn with_rng(
        attr: AttrId,
        space: AttrSpace,
        me: PeerAddr,
        config: Arc<MercuryNodeConfig>,
        app: DynApplication,
        sampler: DynSampler,
        rng: rand::rngs::StdRng,
    ) -> Self {
        Self {
            attr,
            space,
            me,
            config,
            app,
            sampler,
            rng,
            status: HubStatus::Unjoined,
            range: None,
            range_changed_at: None,
            reg: Registry::default(),
            cache: RangeCache::default(),
            join_target: None,
            join_backoff: None,
            join_attempts: 0,
            pending_joins: HashMap::new(),
            leaving: None,
            ping_queue: Vec::new(),
            epoch: 0,
            next_nonce: 1,
            outstanding: HashMap::new(),
            store: Store::default(),
            load: RoutingLoad::default(),
            lb: load_balance::LoadBalancer::default(),
        }
    }

    pub fn status(&self) -> HubStatus {
        self.status
    }

    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            attr: self.attr,
            status: self.status,
            range: self.range,
            successors: self.reg.infos(Role::Successor),
            predecessors: self.reg.infos(Role::Predecessor),
            long_neighbors: self.reg.infos(Role::LongNeighbor),
            reverse_long_neighbors: self
                .reg
                .infos(Role::ReverseLongNeighbor),
            epoch: self.epoch,
            interests: self.store.interest_count(),
            events: self.store.event_count(),
            load: self.current_load(),
        }
    }

    fn am_rightmost(&self, range: &NodeRange) -> bool {
        range.max == self.space.abs_max
    }

    fn current_load(&self) -> f64 {
        self.sampler
            .current_load(self.attr, &self.me)
            .unwrap_or_else(|| self.load.load())
    }

    /// Dispatch one incoming message.
    pub fn handle(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        hop_count: u32,
        msg: Message,
    ) {
        tracing::trace!(hub = %self.attr, %from, msg = msg.name(), "recv");

        if let Some(peer) = self.reg.lookup_mut(&from) {
            peer.live.last_msg = ctx.now;
        }

        match msg {
            Message::JoinRequest => self.on_join_request(ctx, from),
            Message::JoinResponse(resp) => {
                self.on_join_response(ctx, from, resp)
            }
            Message::NotifySuccessor { range } => {
                self.on_notify_successor(ctx, from, range)
            }
            Message::GetPredecessor => self.on_get_predecessor(ctx, from),
            Message::PredecessorInfo { pred, range } => {
                self.on_predecessor_info(ctx, from, pred, range)
            }
            Message::GetSuccessorList => self.on_get_successor_list(ctx, from),
            Message::SuccessorList { list } => {
                self.on_successor_list(ctx, from, list)
            }
            Message::LinkBreak => self.on_link_break(ctx, from),
            Message::LivenessPing {
                succ,
                lnbr,
                seqno,
                range,
            } => self.on_ping(ctx, from, succ, lnbr, seqno, range),
            Message::LivenessPong { seqno, range } => {
                self.on_pong(ctx, from, seqno, range)
            }
            Message::NeighborRequest {
                origin,
                origin_range,
                target,
                epoch,
                nonce,
            } => self.on_neighbor_request(
                ctx,
                from,
                hop_count,
                origin,
                origin_range,
                target,
                epoch,
                nonce,
            ),
            Message::NeighborResponse {
                range,
                epoch,
                nonce,
            } => self.on_neighbor_response(ctx, from, range, epoch, nonce),
            Message::LeaveNotification {
                range,
                interests,
                events,
            } => self.on_leave_notification(ctx, from, range, interests, events),
            Message::Publication { event, mode } => {
                self.route(ctx, from, hop_count, Item::Event(event), mode)
            }
            Message::Subscription { interest, mode } => {
                self.route(ctx, from, hop_count, Item::Interest(interest), mode)
            }
            Message::MatchedPublication { event, interests } => {
                self.app.deliver(event, interests)
            }
            Message::SubscriptionList { interests } => {
                self.absorb(ctx, interests, Vec::new())
            }
            Message::TriggerList { events } => {
                self.absorb(ctx, Vec::new(), events)
            }
            Message::LocalLoadBalanceRequest { range, load } => {
                self.on_local_lb_request(ctx, from, range, load)
            }
            Message::LocalLoadBalanceResponse {
                peer_new_range,
                assigned_range,
                new_load,
            } => self.on_local_lb_response(
                ctx,
                from,
                peer_new_range,
                assigned_range,
                new_load,
            ),
            Message::LeaveJoinLoadBalanceRequest { range, load } => {
                self.on_leave_join_request(ctx, from, range, load)
            }
            Message::LeaveJoinDenial => self.on_leave_join_denial(ctx, from),
            Message::LeaveCheckRequest => self.on_leave_check_request(ctx, from),
            Message::LeaveCheckResponse { ok } => {
                self.on_leave_check_response(ctx, from, ok)
            }
        }
    }

    /// Dispatch one fired timer.
    pub fn on_timer(&mut self, ctx: &mut Ctx, key: TimerKey) {
        tracing::trace!(hub = %self.attr, ?key, "timer");
        match key {
            TimerKey::JoinRetry => self.on_join_retry(ctx),
            TimerKey::SuccMaintenance => self.on_succ_maintenance(ctx),
            TimerKey::PingPeers => self.on_ping_peers(ctx),
            TimerKey::PingBatch => self.on_ping_batch(ctx),
            TimerKey::LongNbrRepair => self.on_long_nbr_repair(ctx),
            TimerKey::NeighborRequest(nonce) => {
                self.on_neighbor_request_timeout(ctx, nonce)
            }
            TimerKey::ExpirySweep => self.on_expiry_sweep(ctx),
            TimerKey::LoadWindow => {
                self.load.roll();
                ctx.timer(
                    TimerKey::LoadWindow,
                    self.config.load_aggregation_interval(),
                );
            }
            TimerKey::LoadBalanceCheck => self.on_load_balance_check(ctx),
            TimerKey::ResetLocalLb => self.on_reset_local_lb(ctx),
            TimerKey::LeaveJoinTracker => self.on_leave_join_tracker(ctx),
            TimerKey::LeaveCheck => self.on_leave_check_timeout(ctx),
            TimerKey::FinishLeave => self.finish_leave(ctx),
            TimerKey::BootstrapHeartbeat => {
                if let (HubStatus::Joined, Some(range)) =
                    (self.status, self.range)
                {
                    ctx.push(Effect::Announce(range));
                    ctx.timer(
                        TimerKey::BootstrapHeartbeat,
                        self.config.bootstrap_heartbeat_interval(),
                    );
                }
            }
        }
    }

    /// Route a locally published event toward its rendezvous nodes.
    pub fn publish(&mut self, ctx: &mut Ctx, event: Event) -> MercResult<()> {
        self.check_local(event.constraint(self.attr))?;
        let me = self.me.clone();
        self.route(ctx, me, 0, Item::Event(event), RouteMode::Greedy);
        Ok(())
    }

    /// Route a local subscription toward its rendezvous nodes.
    pub fn subscribe(
        &mut self,
        ctx: &mut Ctx,
        interest: Interest,
    ) -> MercResult<()> {
        self.check_local(interest.constraint(self.attr))?;
        let me = self.me.clone();
        self.route(ctx, me, 0, Item::Interest(interest), RouteMode::Greedy);
        Ok(())
    }

    fn check_local(&self, c: Option<&Constraint>) -> MercResult<()> {
        if self.status != HubStatus::Joined {
            return Err(MercError::other(format!(
                "hub {} is not joined",
                self.attr
            )));
        }
        match c {
            None => Err(MercError::other(format!(
                "item has no constraint for hub {}",
                self.attr
            ))),
            Some(c) if !c.clamp(&self.space).is_valid() => {
                Err(MercError::other(format!("inverted constraint {c}")))
            }
            Some(_) => Ok(()),
        }
    }

    /// The transport lost its connection to `addr`.
    pub fn peer_gone(&mut self, ctx: &mut Ctx, addr: &PeerAddr) {
        if self.reg.lookup(addr).is_some() {
            self.on_peer_death(ctx, addr);
        }
    }

    fn on_expiry_sweep(&mut self, ctx: &mut Ctx) {
        let now = ctx.now;
        let gone = self.store.sweep(now);
        if gone > 0 {
            tracing::debug!(hub = %self.attr, gone, "expired items swept");
        }
        self.pending_joins.retain(|_, exp| *exp > now);
        self.lb.sweep(now);
        ctx.timer(TimerKey::ExpirySweep, self.config.expiry_sweep_interval());
    }

    /// Remember a range learned from a peer.
    fn learn(&mut self, addr: &PeerAddr, range: NodeRange) {
        if addr == &self.me || range.attr != self.attr {
            return;
        }
        if let Some(peer) = self.reg.lookup_mut(addr) {
            peer.range = Some(range);
        }
        self.cache.note(addr.clone(), range);
    }

    /// Replace our range, notify the application and hand items that
    /// fell outside it to the neighbors now owning them.
    fn change_range(&mut self, ctx: &mut Ctx, new: NodeRange) {
        let Some(old) = self.range.replace(new) else {
            return;
        };
        if old == new {
            return;
        }
        self.range_changed_at = Some(ctx.now);

        let old_span = old.span(&self.space);
        let new_span = new.span(&self.space);
        if old_span.get() > 0 {
            self.load.scale(new_span.ratio(old_span));
        }

        if new_span >= old_span {
            tracing::info!(hub = %self.attr, %old, %new, "range expanded");
            self.app.range_expanded(old, new);
        } else {
            tracing::info!(hub = %self.attr, %old, %new, "range contracted");
            self.app.range_contracted(old, new);
        }

        self.hand_over(ctx, &new);
        if self.status == HubStatus::Joined {
            ctx.push(Effect::Announce(new));
        }
    }

    /// Send items we no longer fully own to the adjacent owners, then
    /// forget those outside our range.
    fn hand_over(&mut self, ctx: &mut Ctx, mine: &NodeRange) {
        let now = ctx.now;
        let mut targets = Vec::new();
        for role in [Role::Predecessor, Role::Successor] {
            if let Some(info) = self.reg.first(role).and_then(|p| p.info()) {
                if !targets.iter().any(|t: &PeerInfo| t.addr == info.addr) {
                    targets.push(info);
                }
            }
        }
        for target in targets {
            let (interests, events) =
                self.store.export(self.attr, &target.range, now);
            let interests: Vec<_> = interests
                .into_iter()
                .filter(|s| !self.fully_inside(&s.interest.constraints, mine))
                .collect();
            let events: Vec<_> = events
                .into_iter()
                .filter(|s| !self.fully_inside(&s.event.constraints, mine))
                .collect();
            if !interests.is_empty() {
                tracing::debug!(
                    hub = %self.attr,
                    to = %target.addr,
                    count = interests.len(),
                    "handing over subscriptions",
                );
                ctx.send(
                    target.addr.clone(),
                    Message::SubscriptionList { interests },
                );
            }
            if !events.is_empty() {
                ctx.send(target.addr, Message::TriggerList { events });
            }
        }
        self.store.retain_overlapping(self.attr, mine);
    }

    fn fully_inside(&self, cs: &[Constraint], range: &NodeRange) -> bool {
        let Some(c) = cs.iter().find(|c| c.attr == self.attr) else {
            return false;
        };
        if range.is_wrapped() {
            return c.min >= range.min || c.max < range.max;
        }
        c.min >= range.min
            && (c.max < range.max
                || (self.am_rightmost(range) && c.max <= range.max))
    }

    /// Store handed-over items that touch our range.
    fn absorb(
        &mut self,
        ctx: &mut Ctx,
        interests: Vec<StoredInterest>,
        events: Vec<StoredEvent>,
    ) {
        let Some(range) = self.range else {
            return;
        };
        let touches = |cs: &[Constraint]| {
            cs.iter()
                .any(|c| c.attr == range.attr && c.overlaps_range(&range))
        };
        for s in interests {
            if s.remaining_ms > 0 && touches(&s.interest.constraints) {
                let death = ctx.now + Duration::from_millis(s.remaining_ms as u64);
                self.store.add_interest(s.interest, death);
            }
        }
        for s in events {
            if s.remaining_ms > 0 && touches(&s.event.constraints) {
                let death = ctx.now + Duration::from_millis(s.remaining_ms as u64);
                self.store.add_event(s.event, death);
            }
        }
    }

    /// Within a second of a range change, tell whoever routes to us.
    fn maybe_quick_pong(&self, ctx: &mut Ctx, from: &PeerAddr) {
        let (Some(at), Some(range)) = (self.range_changed_at, self.range)
        else {
            return;
        };
        if from == &self.me || ctx.now.duration_since(at) > QUICK_PONG_WINDOW {
            return;
        }
        ctx.send(
            from.clone(),
            Message::LivenessPong {
                seqno: None,
                range: Some(range),
            },
        );
    }

    /// Drop all ring state. Stored items are discarded.
    fn reset(&mut self, ctx: &mut Ctx) {
        ctx.push(Effect::CancelAll);
        if self.range.is_some() {
            ctx.push(Effect::Withdraw);
        }
        self.status = HubStatus::Unjoined;
        self.range = None;
        self.range_changed_at = None;
        self.reg.clear();
        self.cache.clear();
        self.join_target = None;
        self.join_backoff = None;
        self.join_attempts = 0;
        self.pending_joins.clear();
        self.leaving = None;
        self.ping_queue.clear();
        self.outstanding.clear();
        self.store.clear();
        self.load.clear();
    }
}

#[cfg(test)]
mod test;
