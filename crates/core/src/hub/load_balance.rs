//! Load balancing between ring nodes.
//!
//! Two mechanisms run off the periodic [TimerKey::LoadBalanceCheck]:
//!
//! - Local: a node much lighter than an adjacent node asks it to shed
//!   part of its range. The heavier side moves the shared boundary and
//!   replies with both new ranges.
//! - Remote: a node much heavier than the ring average asks a sampled
//!   light node to leave and rejoin as its predecessor. The light node
//!   first confirms with its successor that the neighbourhood is stable.

use super::*;
use rand::seq::SliceRandom;

/// Loads below this count as this.
const EPSILON: f64 = 1.0e-5;

#[derive(Debug, Clone, Default, PartialEq)]
enum LbState {
    #[default]
    Idle,
    SentLocalRequest {
        to: PeerAddr,
    },
    CheckingSucc {
        requestor: PeerAddr,
    },
    WaitingRemoteResponse {
        candidate: PeerAddr,
    },
    PerformingLeaveJoin,
}

/// Load balancing state of one hub.
#[derive(Debug, Default)]
pub(super) struct LoadBalancer {
    state: LbState,
    unstable_until: Option<Instant>,
    local_requests: HashMap<PeerAddr, Instant>,
    tried: Vec<PeerAddr>,
}

impl LoadBalancer {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn sweep(&mut self, now: Instant) {
        self.local_requests.retain(|_, exp| *exp > now);
        if self.unstable_until.map(|t| t <= now).unwrap_or(false) {
            self.unstable_until = None;
        }
    }

    /// Refuse leave-joins around us for `dur`.
    pub fn mark_unstable(&mut self, now: Instant, dur: Duration) {
        let until = now + dur;
        self.unstable_until = Some(match self.unstable_until {
            Some(cur) if cur > until => cur,
            _ => until,
        });
    }

    pub fn is_unstable(&self, now: Instant) -> bool {
        self.unstable_until.map(|t| t > now).unwrap_or(false)
    }

    pub fn is_busy(&self) -> bool {
        self.state != LbState::Idle
    }

    /// A light node we asked to leave-join has come back as our
    /// predecessor.
    pub fn on_joined_by(&mut self, ctx: &mut Ctx, joiner: &PeerAddr) {
        if let LbState::WaitingRemoteResponse { candidate } = &self.state {
            if candidate == joiner {
                tracing::info!(%joiner, "leave-join load balance completed");
                ctx.cancel(TimerKey::LeaveJoinTracker);
                self.state = LbState::Idle;
                self.tried.clear();
            }
        }
    }
}

impl Hub {
    fn my_load(&self) -> f64 {
        self.current_load().max(EPSILON)
    }

    fn neighbor_load(&self, role: Role) -> Option<f64> {
        let peer = self.reg.first(role)?;
        self.sampler
            .neighborhood_load(self.attr, &peer.addr)
            .map(|l| l.max(EPSILON))
    }

    fn average_load(&self) -> f64 {
        let samples = self.sampler.load_samples(self.attr);
        if samples.is_empty() {
            return EPSILON / 2.0;
        }
        samples.iter().map(|s| s.load).sum::<f64>() / samples.len() as f64
    }

    fn am_heavy(&self) -> bool {
        let my = self.my_load();
        let avg = self.average_load();
        if my < EPSILON || avg < EPSILON {
            return false;
        }
        my / avg >= self.config.load_balance_delta
    }

    pub(super) fn on_load_balance_check(&mut self, ctx: &mut Ctx) {
        if self.status != HubStatus::Joined || !self.config.load_balancing {
            return;
        }
        ctx.timer(
            TimerKey::LoadBalanceCheck,
            self.config.check_load_balance_interval(),
        );
        let Some(my_range) = self.range else {
            return;
        };
        if self.leaving.is_some() || self.lb.is_busy() {
            return;
        }
        let (Some(pred), Some(succ)) = (
            self.reg.first(Role::Predecessor).map(|p| p.addr.clone()),
            self.reg.first(Role::Successor).map(|p| p.addr.clone()),
        ) else {
            return;
        };

        // an unsettled neighbourhood has not reported yet
        let (Some(pred_load), Some(succ_load)) = (
            self.neighbor_load(Role::Predecessor),
            self.neighbor_load(Role::Successor),
        ) else {
            return;
        };

        let my = self.my_load();
        let delta = self.config.load_balance_delta;

        // the lighter side starts a local exchange
        let local = if succ_load / my > delta {
            Some(succ)
        } else if pred_load / my > delta {
            Some(pred)
        } else {
            None
        };
        if let Some(to) = local {
            tracing::debug!(hub = %self.attr, %to, my, "requesting local load balance");
            ctx.send(
                to.clone(),
                Message::LocalLoadBalanceRequest {
                    range: my_range,
                    load: my,
                },
            );
            self.lb.state = LbState::SentLocalRequest { to };
            ctx.timer(TimerKey::ResetLocalLb, self.config.tcp_failure_timeout());
            return;
        }

        if !self.am_heavy() {
            return;
        }
        if pred_load * delta < my || succ_load * delta < my {
            tracing::debug!(hub = %self.attr, my, pred_load, succ_load, "heavy, waiting for neighbors");
            return;
        }
        if !self.app.is_leave_join_ok() {
            tracing::debug!(hub = %self.attr, "application refused leave-join load balance");
            return;
        }
        self.request_leave_join(ctx);
    }

    /// Ask a random light node to leave-join next to us.
    fn request_leave_join(&mut self, ctx: &mut Ctx) {
        let Some(my_range) = self.range else {
            return;
        };
        let my = self.my_load();
        let delta = self.config.load_balance_delta;
        let light: Vec<PeerAddr> = self
            .sampler
            .load_samples(self.attr)
            .into_iter()
            .filter(|s| s.addr != self.me && delta * s.load <= my)
            .filter(|s| !self.lb.tried.contains(&s.addr))
            .map(|s| s.addr)
            .collect();
        let Some(candidate) = light.choose(&mut self.rng).cloned() else {
            tracing::debug!(hub = %self.attr, my, "heavy, but no light node known");
            self.lb.tried.clear();
            return;
        };

        tracing::info!(hub = %self.attr, %candidate, my, "requesting leave-join load balance");
        self.lb.tried.push(candidate.clone());
        ctx.send(
            candidate.clone(),
            Message::LeaveJoinLoadBalanceRequest {
                range: my_range,
                load: my,
            },
        );
        self.lb.state = LbState::WaitingRemoteResponse { candidate };
        ctx.timer(
            TimerKey::LeaveJoinTracker,
            self.config.leave_join_response_timeout(),
        );
    }

    pub(super) fn on_reset_local_lb(&mut self, _ctx: &mut Ctx) {
        if matches!(self.lb.state, LbState::SentLocalRequest { .. }) {
            tracing::debug!(hub = %self.attr, "local load balance request unanswered");
            self.lb.state = LbState::Idle;
        }
    }

    /// Leave-join requests that were never denied time out here. A
    /// successful one has already reset the state through
    /// [LoadBalancer::on_joined_by].
    pub(super) fn on_leave_join_tracker(&mut self, _ctx: &mut Ctx) {
        if matches!(self.lb.state, LbState::WaitingRemoteResponse { .. }) {
            self.lb.state = LbState::Idle;
        }
    }

    pub(super) fn on_local_lb_request(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        range: NodeRange,
        load: f64,
    ) {
        let (HubStatus::Joined, Some(my_range)) = (self.status, self.range)
        else {
            return;
        };
        if self.lb.is_busy() || self.leaving.is_some() {
            tracing::warn!(hub = %self.attr, %from, "local load balance request while busy");
            return;
        }
        let from_pred = self.reg.first(Role::Predecessor).map(|p| &p.addr)
            == Some(&from);
        let from_succ =
            self.reg.first(Role::Successor).map(|p| &p.addr) == Some(&from);
        if !from_pred && !from_succ {
            tracing::warn!(hub = %self.attr, %from, "local load balance request from non-neighbor");
            return;
        }

        let now = ctx.now;
        self.lb.local_requests.retain(|_, exp| *exp > now);
        if self.lb.local_requests.contains_key(&from) {
            tracing::debug!(hub = %self.attr, %from, "duplicate local load balance request");
            return;
        }

        let my = self.my_load();
        let nbr = load.max(EPSILON);
        if my / nbr < self.config.load_balance_delta {
            tracing::debug!(hub = %self.attr, %from, my, nbr, "load not imbalanced");
            return;
        }

        let shed = my_range.span(&self.space).scale((my - nbr) / (2.0 * my));
        let (mine, theirs) = if from_succ {
            let max = self.space.backward(my_range.max, shed);
            (
                NodeRange::new(self.attr, my_range.min, max),
                NodeRange::new(self.attr, max, range.max),
            )
        } else {
            let min = self.space.forward(my_range.min, shed);
            (
                NodeRange::new(self.attr, min, my_range.max),
                NodeRange::new(self.attr, range.min, min),
            )
        };
        if shed.get() == 0 || mine.is_empty() || theirs.is_empty() {
            tracing::debug!(hub = %self.attr, %from, %my_range, "nothing to shed");
            return;
        }

        let new_load = (my + nbr) / 2.0;
        tracing::info!(hub = %self.attr, %from, %mine, %theirs, "shedding range to neighbor");
        ctx.send(
            from.clone(),
            Message::LocalLoadBalanceResponse {
                peer_new_range: mine,
                assigned_range: theirs,
                new_load,
            },
        );
        self.lb
            .local_requests
            .insert(from.clone(), now + self.config.tcp_failure_timeout());
        self.learn(&from, theirs);
        self.change_range(ctx, mine);
    }

    pub(super) fn on_local_lb_response(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        peer_new_range: NodeRange,
        assigned_range: NodeRange,
        new_load: f64,
    ) {
        match &self.lb.state {
            LbState::SentLocalRequest { to } if to == &from => (),
            _ => {
                tracing::warn!(hub = %self.attr, %from, "unexpected local load balance response");
                return;
            }
        }
        let adjacent = self.reg.has_role(&from, Role::Predecessor)
            || self.reg.has_role(&from, Role::Successor);
        if !adjacent {
            tracing::warn!(hub = %self.attr, %from, "local load balance response from non-neighbor");
            return;
        }

        ctx.cancel(TimerKey::ResetLocalLb);
        self.lb.state = LbState::Idle;
        tracing::info!(hub = %self.attr, %from, %assigned_range, new_load, "taking range from neighbor");
        self.learn(&from, peer_new_range);
        self.change_range(ctx, assigned_range);
    }

    fn deny_leave_join(&self, ctx: &mut Ctx, to: PeerAddr, reason: &str) {
        tracing::debug!(hub = %self.attr, %to, reason, "denying leave-join request");
        ctx.send(to, Message::LeaveJoinDenial);
    }

    pub(super) fn on_leave_join_request(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        _range: NodeRange,
        load: f64,
    ) {
        if self.status != HubStatus::Joined || self.leaving.is_some() {
            return self.deny_leave_join(ctx, from, "not joined");
        }
        if self.lb.is_busy() || !self.app.is_leave_join_ok() {
            return self.deny_leave_join(ctx, from, "busy");
        }
        let succ = self.reg.first(Role::Successor).map(|p| p.addr.clone());
        let has_pred = self.reg.first(Role::Predecessor).is_some();
        let (Some(succ), true, false) =
            (succ, has_pred, self.lb.is_unstable(ctx.now))
        else {
            return self.deny_leave_join(ctx, from, "ring unstable");
        };

        let my = self.my_load();
        let delta = self.config.load_balance_delta;
        if delta * my > load {
            return self.deny_leave_join(ctx, from, "not relatively light");
        }

        // our load goes to the neighbors when we leave
        let avg = self.average_load();
        let pred_load =
            self.neighbor_load(Role::Predecessor).unwrap_or(EPSILON) + my / 2.0;
        let succ_load =
            self.neighbor_load(Role::Successor).unwrap_or(EPSILON) + my / 2.0;
        if pred_load > avg * delta || succ_load > avg * delta {
            return self.deny_leave_join(ctx, from, "neighbors would be heavy");
        }

        tracing::debug!(hub = %self.attr, %from, %succ, "checking with successor before leave-join");
        ctx.send(succ, Message::LeaveCheckRequest);
        self.lb.state = LbState::CheckingSucc { requestor: from };
        ctx.timer(TimerKey::LeaveCheck, self.config.join_request_timeout());
    }

    pub(super) fn on_leave_check_timeout(&mut self, ctx: &mut Ctx) {
        if let LbState::CheckingSucc { requestor } =
            std::mem::take(&mut self.lb.state)
        {
            self.deny_leave_join(ctx, requestor, "successor did not answer");
        }
    }

    pub(super) fn on_leave_join_denial(&mut self, ctx: &mut Ctx, from: PeerAddr) {
        match &self.lb.state {
            LbState::WaitingRemoteResponse { candidate } if candidate == &from => {
            }
            _ => {
                tracing::debug!(hub = %self.attr, %from, "stale leave-join denial");
                return;
            }
        }
        ctx.cancel(TimerKey::LeaveJoinTracker);
        self.lb.state = LbState::Idle;
        tracing::debug!(hub = %self.attr, %from, "leave-join denied");
        if self.status == HubStatus::Joined && self.am_heavy() {
            self.request_leave_join(ctx);
        }
    }

    pub(super) fn on_leave_check_request(&mut self, ctx: &mut Ctx, from: PeerAddr) {
        let Some(pred) = self.reg.first(Role::Predecessor) else {
            tracing::warn!(hub = %self.attr, %from, "leave check without a predecessor");
            return;
        };
        if pred.addr != from {
            tracing::warn!(hub = %self.attr, %from, "leave check from non-predecessor");
            return;
        }
        let ok = self.status == HubStatus::Joined
            && self.leaving.is_none()
            && !self.lb.is_busy()
            && !self.lb.is_unstable(ctx.now)
            && self.app.is_leave_join_ok();
        ctx.send(from, Message::LeaveCheckResponse { ok });
        if ok {
            self.lb
                .mark_unstable(ctx.now, self.config.join_request_timeout());
        }
    }

    pub(super) fn on_leave_check_response(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        ok: bool,
    ) {
        let LbState::CheckingSucc { requestor } = self.lb.state.clone() else {
            tracing::warn!(hub = %self.attr, %from, "unexpected leave check response");
            return;
        };
        ctx.cancel(TimerKey::LeaveCheck);
        if !ok {
            self.lb.state = LbState::Idle;
            self.deny_leave_join(ctx, requestor, "successor refused");
            return;
        }
        tracing::info!(hub = %self.attr, %requestor, "performing leave-join");
        self.lb.state = LbState::PerformingLeaveJoin;
        self.leave(ctx, Some(requestor));
    }
}
