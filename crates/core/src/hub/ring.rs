//! Ring membership: join, successor and predecessor maintenance,
//! liveness probing, failure repair and graceful leave.

use super::*;
use backon::BackoffBuilder;

/// Pings sent per batch.
const PING_BATCH: usize = 10;

/// Upper bound on the spacing between ping batches.
const MAX_PING_SPACING: Duration = Duration::from_millis(750);

impl Hub {
    fn new_join_backoff(&self) -> backon::ExponentialBackoff {
        backon::ExponentialBuilder::default()
            .with_factor(self.config.join_backoff_factor)
            .with_min_delay(self.config.join_request_timeout())
            .with_max_delay(self.config.max_join_backoff())
            .with_max_times(self.config.max_join_attempts as usize)
            .build()
    }

    /// Begin joining through `rep`. Without a representative this node
    /// founds the ring and owns the whole key space.
    pub fn start_join(&mut self, ctx: &mut Ctx, rep: Option<PeerAddr>) {
        if self.status != HubStatus::Unjoined {
            tracing::debug!(hub = %self.attr, status = ?self.status, "join already in progress");
            return;
        }
        self.app.join_begin(self.attr);

        match rep.filter(|r| r != &self.me) {
            None => {
                let range = NodeRange::full(self.attr, &self.space);
                tracing::info!(hub = %self.attr, %range, "founding ring");
                self.range = Some(range);
                self.range_changed_at = Some(ctx.now);
                self.status = HubStatus::Joined;
                self.on_join_complete(ctx);
            }
            Some(rep) => {
                tracing::info!(hub = %self.attr, %rep, "joining");
                self.status = HubStatus::Joining;
                self.join_target = Some(rep);
                self.join_backoff = Some(self.new_join_backoff());
                self.join_attempts = 0;
                self.send_join_request(ctx);
            }
        }
    }

    fn send_join_request(&mut self, ctx: &mut Ctx) {
        let Some(target) = self.join_target.clone() else {
            return;
        };
        match self.join_backoff.as_mut().and_then(|b| b.next()) {
            Some(delay) => {
                self.join_attempts += 1;
                tracing::debug!(
                    hub = %self.attr,
                    %target,
                    attempt = self.join_attempts,
                    ?delay,
                    "sending join request",
                );
                ctx.send(target, Message::JoinRequest);
                ctx.timer(TimerKey::JoinRetry, delay);
            }
            None => {
                let attempts = self.join_attempts;
                tracing::error!(hub = %self.attr, %target, attempts, "join attempts exhausted");
                self.status = HubStatus::Unjoined;
                self.join_target = None;
                self.join_backoff = None;
                self.lb.reset();
                self.app.join_failed(self.attr);
                ctx.push(Effect::JoinFailed(MercError::JoinExhausted {
                    attr: self.attr,
                    attempts,
                }));
            }
        }
    }

    pub(super) fn on_join_retry(&mut self, ctx: &mut Ctx) {
        if self.status == HubStatus::Joining {
            self.send_join_request(ctx);
        }
    }

    pub(super) fn on_join_request(&mut self, ctx: &mut Ctx, from: PeerAddr) {
        let my = match (self.status, self.range, self.leaving.is_some()) {
            (HubStatus::Joined, Some(my), false) => my,
            _ => {
                ctx.send(from, Message::JoinResponse(JoinResponse::Unjoined));
                return;
            }
        };

        let now = ctx.now;
        self.pending_joins.retain(|_, exp| *exp > now);
        if self.pending_joins.contains_key(&from) {
            tracing::warn!(hub = %self.attr, %from, "ignoring duplicate join request");
            return;
        }

        let mid = self.space.forward(my.min, my.span(&self.space) / 2);
        let assigned =
            NodeRange::new(self.attr, my.min, self.space.normalize_max(mid));
        let kept = NodeRange::new(self.attr, mid, my.max);
        if assigned.is_empty() || kept.is_empty() || mid == my.min {
            tracing::warn!(hub = %self.attr, %my, %from, "range too small to split");
            ctx.send(from, Message::JoinResponse(JoinResponse::Unjoined));
            return;
        }

        self.pending_joins
            .insert(from.clone(), now + self.config.tcp_failure_timeout());
        self.lb.on_joined_by(ctx, &from);

        let only_node = self.reg.list(Role::Successor).is_empty();
        let mut successors = vec![PeerInfo {
            addr: self.me.clone(),
            range: kept,
        }];
        successors.extend(
            self.reg
                .infos(Role::Successor)
                .into_iter()
                .filter(|p| p.addr != from),
        );
        successors.truncate(self.config.n_successors_to_keep as usize);

        tracing::info!(hub = %self.attr, %from, %assigned, %kept, "accepting joiner");
        self.reg.register(&from, Some(assigned), now);
        self.reg.set_front(&from, Role::Predecessor);
        if only_node {
            self.reg.add_role(&from, Role::Successor);
        }
        self.cache.note(from.clone(), assigned);

        ctx.send(
            from,
            Message::JoinResponse(JoinResponse::Accepted {
                assigned,
                successors,
                only_node,
            }),
        );
        self.change_range(ctx, kept);
    }

    pub(super) fn on_join_response(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        resp: JoinResponse,
    ) {
        if self.status != HubStatus::Joining {
            tracing::debug!(hub = %self.attr, %from, "stale join response");
            return;
        }
        let (assigned, successors, only_node) = match resp {
            JoinResponse::Unjoined => {
                tracing::debug!(hub = %self.attr, %from, "representative not joined, will retry");
                return;
            }
            JoinResponse::Accepted {
                assigned,
                successors,
                only_node,
            } => (assigned, successors, only_node),
        };

        ctx.cancel(TimerKey::JoinRetry);
        self.join_target = None;
        self.join_backoff = None;

        self.range = Some(assigned);
        self.range_changed_at = Some(ctx.now);

        let n = self.config.n_successors_to_keep as usize;
        let mut list = Vec::new();
        for s in successors {
            if s.addr == self.me || list.contains(&s.addr) {
                continue;
            }
            self.reg.register(&s.addr, Some(s.range), ctx.now);
            self.cache.note(s.addr.clone(), s.range);
            list.push(s.addr);
            if list.len() >= n {
                break;
            }
        }
        self.reg.replace_list(Role::Successor, list);

        if only_node {
            self.reg.register(&from, None, ctx.now);
            self.reg.set_front(&from, Role::Predecessor);
        }

        self.status = HubStatus::Joined;
        self.on_join_complete(ctx);
    }

    /// Start maintenance and tell everyone we are in.
    fn on_join_complete(&mut self, ctx: &mut Ctx) {
        let Some(range) = self.range else {
            return;
        };
        tracing::info!(hub = %self.attr, %range, "joined");

        let c = self.config.clone();
        ctx.timer(TimerKey::SuccMaintenance, c.successor_maintenance_timeout());
        ctx.timer(TimerKey::PingPeers, c.peer_ping_interval());
        ctx.timer(TimerKey::LongNbrRepair, c.successor_maintenance_timeout());
        ctx.timer(TimerKey::ExpirySweep, c.expiry_sweep_interval());
        ctx.timer(TimerKey::LoadWindow, c.load_aggregation_interval());
        if c.load_balancing {
            ctx.timer(TimerKey::LoadBalanceCheck, c.check_load_balance_interval());
        }
        ctx.timer(TimerKey::BootstrapHeartbeat, c.bootstrap_heartbeat_interval());
        ctx.push(Effect::Announce(range));

        let succ = self.reg.first(Role::Successor).map(|p| p.addr.clone());
        if let Some(succ) = succ.clone() {
            ctx.send(succ, Message::NotifySuccessor { range });
        }

        self.lb.reset();
        self.app.join_end(self.attr, succ);
        ctx.push(Effect::JoinComplete);
    }

    pub(super) fn on_notify_successor(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        n: NodeRange,
    ) {
        let (HubStatus::Joined, Some(my)) = (self.status, self.range) else {
            return;
        };
        if from == self.me {
            return;
        }
        self.reg.register(&from, Some(n), ctx.now);
        self.cache.note(from.clone(), n);

        let install = match self.reg.first(Role::Predecessor) {
            None => true,
            Some(c) if c.addr == from => false,
            Some(c) => match c.range {
                None => true,
                Some(c) => {
                    (n.max == c.max && is_between(n.min, c.min, my.min))
                        || is_between(n.max, c.max, my.max)
                }
            },
        };

        if install {
            tracing::debug!(hub = %self.attr, %from, range = %n, "new predecessor");
            self.reg.set_front(&from, Role::Predecessor);
        }

        // a lone node takes its first predecessor as successor as well
        if self.reg.list(Role::Successor).is_empty() {
            self.reg.add_role(&from, Role::Successor);
            ctx.send(from.clone(), Message::NotifySuccessor { range: my });
        }

        self.reg.prune(&from);
    }

    pub(super) fn on_succ_maintenance(&mut self, ctx: &mut Ctx) {
        if self.status != HubStatus::Joined {
            return;
        }
        ctx.timer(
            TimerKey::SuccMaintenance,
            self.config.successor_maintenance_timeout(),
        );
        let Some(my) = self.range else {
            return;
        };
        let Some(succ) = self.reg.first(Role::Successor) else {
            return;
        };
        if let Some(sr) = succ.range {
            if self.space.normalize_max(sr.min) != self.space.normalize_max(my.max)
            {
                tracing::warn!(
                    hub = %self.attr,
                    %my,
                    succ = %succ.addr,
                    succ_range = %sr,
                    "range does not abut successor",
                );
            }
        }
        let succ = succ.addr.clone();
        ctx.send(succ.clone(), Message::GetPredecessor);
        ctx.send(succ, Message::GetSuccessorList);
    }

    pub(super) fn on_get_predecessor(&mut self, ctx: &mut Ctx, from: PeerAddr) {
        let (HubStatus::Joined, Some(range)) = (self.status, self.range) else {
            return;
        };
        let pred = self.reg.first(Role::Predecessor).and_then(Peer::info);
        ctx.send(from, Message::PredecessorInfo { pred, range });
    }

    pub(super) fn on_predecessor_info(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        pred: Option<PeerInfo>,
        succ_range: NodeRange,
    ) {
        let (HubStatus::Joined, Some(my)) = (self.status, self.range) else {
            return;
        };
        if self.reg.first(Role::Successor).map(|p| &p.addr) != Some(&from) {
            tracing::debug!(hub = %self.attr, %from, "predecessor info from non-successor");
            return;
        }
        self.learn(&from, succ_range);

        match pred {
            None => {
                ctx.send(from, Message::NotifySuccessor { range: my });
            }
            Some(p) if p.addr == self.me => {
                let max = self.space.normalize_max(succ_range.min);
                if max != my.max {
                    let new = NodeRange::new(self.attr, my.min, max);
                    if new.is_empty() {
                        tracing::warn!(hub = %self.attr, %my, %succ_range, "refusing zero-width boundary correction");
                    } else {
                        tracing::warn!(hub = %self.attr, %my, %new, "correcting boundary to successor");
                        self.change_range(ctx, new);
                    }
                }
            }
            Some(p) => {
                if self.leaving.is_none()
                    && is_between_right_inclusive(
                        p.range.min,
                        my.min,
                        succ_range.min,
                    )
                {
                    tracing::debug!(hub = %self.attr, new_succ = %p.addr, "closer successor found");
                    self.reg.register(&p.addr, Some(p.range), ctx.now);
                    self.cache.note(p.addr.clone(), p.range);
                    self.reg.set_front(&p.addr, Role::Successor);
                    self.trim_successors();
                    ctx.send(p.addr, Message::NotifySuccessor { range: my });
                } else {
                    ctx.send(from, Message::NotifySuccessor { range: my });
                }
            }
        }
    }

    fn trim_successors(&mut self) {
        let n = self.config.n_successors_to_keep as usize;
        let list = self.reg.list(Role::Successor);
        if list.len() > n {
            let keep = list[..n].to_vec();
            self.reg.replace_list(Role::Successor, keep);
        }
    }

    pub(super) fn on_get_successor_list(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
    ) {
        let (HubStatus::Joined, Some(range)) = (self.status, self.range) else {
            return;
        };
        if !self.reg.has_role(&from, Role::Predecessor) {
            tracing::debug!(hub = %self.attr, %from, "successor list requested by non-predecessor");
            return;
        }
        let mut list = vec![PeerInfo {
            addr: self.me.clone(),
            range,
        }];
        list.extend(self.reg.infos(Role::Successor));
        list.truncate(self.config.n_successors_to_keep as usize);
        ctx.send(from, Message::SuccessorList { list });
    }

    pub(super) fn on_successor_list(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        list: Vec<PeerInfo>,
    ) {
        if self.status != HubStatus::Joined
            || self.reg.first(Role::Successor).map(|p| &p.addr) != Some(&from)
        {
            return;
        }
        let n = self.config.n_successors_to_keep as usize;
        let mut merged = vec![from.clone()];
        for p in list {
            if p.addr == self.me {
                break;
            }
            if merged.len() >= n {
                break;
            }
            if merged.contains(&p.addr) {
                if p.addr == from {
                    self.learn(&from, p.range);
                }
                continue;
            }
            // existing peers keep their liveness history
            self.reg.register(&p.addr, Some(p.range), ctx.now);
            self.cache.note(p.addr.clone(), p.range);
            merged.push(p.addr);
        }
        self.reg.replace_list(Role::Successor, merged);
    }

    pub(super) fn on_ping_peers(&mut self, ctx: &mut Ctx) {
        if self.status != HubStatus::Joined {
            return;
        }
        let interval = self.config.peer_ping_interval();
        let timeout = self.config.peer_pong_timeout();
        ctx.timer(TimerKey::PingPeers, interval);

        let now = ctx.now;
        let mut dead = Vec::new();
        let mut aged = Vec::new();
        for peer in self.reg.peers() {
            let active =
                peer.has(Role::Successor) || peer.has(Role::LongNeighbor);
            if active && now.duration_since(peer.live.last_msg) > timeout {
                dead.push(peer.addr.clone());
                continue;
            }
            for role in [Role::Predecessor, Role::ReverseLongNeighbor] {
                if peer.has(role)
                    && now.duration_since(peer.live.last_ping_recv(role))
                        > timeout
                {
                    aged.push((peer.addr.clone(), role));
                }
            }
        }
        for (addr, role) in aged {
            tracing::warn!(hub = %self.attr, %addr, ?role, "no pings received, dropping");
            self.reg.remove_role(&addr, role);
        }
        for addr in dead {
            self.on_peer_death(ctx, &addr);
            if self.status != HubStatus::Joined {
                return;
            }
        }

        let mut due = Vec::new();
        for role in [Role::Successor, Role::LongNeighbor] {
            for addr in self.reg.list(role) {
                if !due.contains(addr) {
                    due.push(addr.clone());
                }
            }
        }
        due.reverse();
        self.ping_queue = due;
        if !self.ping_queue.is_empty() {
            self.on_ping_batch(ctx);
        }
    }

    pub(super) fn on_ping_batch(&mut self, ctx: &mut Ctx) {
        let range = self.range;
        let total = self.ping_queue.len();
        for _ in 0..PING_BATCH {
            let Some(addr) = self.ping_queue.pop() else {
                break;
            };
            let Some(peer) = self.reg.lookup_mut(&addr) else {
                continue;
            };
            let succ = peer.has(Role::Successor);
            let lnbr = peer.has(Role::LongNeighbor);
            let seqno = peer.live.ping_sent(ctx.now);
            ctx.send(
                addr,
                Message::LivenessPing {
                    succ,
                    lnbr,
                    seqno,
                    range,
                },
            );
        }
        if !self.ping_queue.is_empty() {
            let batches = (total / PING_BATCH + 1) as u32;
            let spacing =
                (self.config.peer_ping_interval() / batches).min(MAX_PING_SPACING);
            ctx.timer(TimerKey::PingBatch, spacing);
        }
    }

    pub(super) fn on_ping(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        succ: bool,
        lnbr: bool,
        seqno: u8,
        range: Option<NodeRange>,
    ) {
        let (HubStatus::Joined, Some(my)) = (self.status, self.range) else {
            return;
        };
        if let Some(r) = range {
            self.learn(&from, r);
        }

        let known = self.reg.lookup(&from).is_some();
        if succ
            && !self.reg.has_role(&from, Role::Predecessor)
            && !self.reg.list(Role::Predecessor).is_empty()
        {
            self.reg.register(&from, range, ctx.now);
            self.reg.add_role(&from, Role::Predecessor);
        }
        if lnbr && !known {
            tracing::debug!(hub = %self.attr, %from, "long neighbor ping from unknown peer");
        }

        let Some(peer) = self.reg.lookup_mut(&from) else {
            return;
        };
        peer.live.ping_recv(succ, lnbr, ctx.now);
        if peer.has(Role::Predecessor) || peer.has(Role::ReverseLongNeighbor) {
            ctx.send(
                from,
                Message::LivenessPong {
                    seqno: Some(seqno),
                    range: Some(my),
                },
            );
        }
    }

    pub(super) fn on_pong(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        seqno: Option<u8>,
        range: Option<NodeRange>,
    ) {
        let Some(peer) = self.reg.lookup_mut(&from) else {
            if let Some(r) = range {
                self.cache.note(from, r);
            }
            return;
        };
        if let Some(seqno) = seqno {
            peer.live.pong_recv(seqno, ctx.now);
        }
        let Some(new) = range else {
            return;
        };
        let moved = peer
            .range
            .map(|old| old.min != new.min && old.max != new.max)
            .unwrap_or(false);
        if moved {
            tracing::warn!(hub = %self.attr, %from, range = %new, "peer moved, dropping links");
            self.cache.note(from.clone(), new);
            self.on_peer_death(ctx, &from);
        } else {
            self.learn(&from, new);
        }
    }

    /// Drop a peer in every role and repair what it held.
    pub(super) fn on_peer_death(&mut self, ctx: &mut Ctx, addr: &PeerAddr) {
        let Some(peer) = self.reg.remove_peer(addr) else {
            return;
        };
        self.cache.forget(addr);
        tracing::warn!(hub = %self.attr, %addr, "peer dead");

        if peer.has(Role::LongNeighbor) {
            self.repair_pointer(ctx);
        }

        if peer.has(Role::Successor) {
            match self.reg.first(Role::Successor) {
                Some(next) => {
                    if let Some(range) = self.range {
                        ctx.send(
                            next.addr.clone(),
                            Message::NotifySuccessor { range },
                        );
                    }
                }
                None => {
                    tracing::error!(hub = %self.attr, "successor list exhausted, rejoining");
                    self.reset(ctx);
                    self.lb.reset();
                    ctx.push(Effect::FindRepresentative);
                }
            }
        }
    }

    pub(super) fn on_link_break(&mut self, ctx: &mut Ctx, from: PeerAddr) {
        tracing::debug!(hub = %self.attr, %from, "link break");
        self.on_peer_death(ctx, &from);
    }

    /// Leave the ring gracefully, optionally rejoining next to `rejoin_at`.
    pub fn leave(&mut self, ctx: &mut Ctx, rejoin_at: Option<PeerAddr>) {
        let leaving = self.leaving.is_some();
        let (HubStatus::Joined, Some(my), false) =
            (self.status, self.range, leaving)
        else {
            tracing::debug!(hub = %self.attr, status = ?self.status, "leave while not joined");
            if !leaving {
                let joining = self.status == HubStatus::Joining;
                self.reset(ctx);
                if joining {
                    self.app.join_failed(self.attr);
                }
                ctx.push(Effect::JoinFailed(MercError::other(
                    "left before join completed",
                )));
                ctx.push(Effect::LeaveComplete);
            }
            return;
        };
        tracing::info!(hub = %self.attr, %my, "leaving");
        self.app.leave_begin(self.attr);

        let pred = self.reg.first(Role::Predecessor).and_then(Peer::info);
        let succ = self.reg.first(Role::Successor).and_then(Peer::info);
        let Some(succ) = succ else {
            // sole node
            self.reset(ctx);
            self.app.leave_end(self.attr);
            ctx.push(Effect::LeaveComplete);
            return;
        };

        let now = ctx.now;
        let mid = self.space.midpoint(my.min, my.max);
        let (succ_new, pred_new) = match pred {
            Some(ref p) if p.addr != succ.addr => (
                NodeRange::new(self.attr, mid, succ.range.max),
                Some((
                    p.addr.clone(),
                    NodeRange::new(
                        self.attr,
                        p.range.min,
                        self.space.normalize_max(mid),
                    ),
                )),
            ),
            _ => (NodeRange::full(self.attr, &self.space), None),
        };

        let mut broken = Vec::new();
        for role in [Role::Predecessor, Role::ReverseLongNeighbor] {
            for addr in self.reg.list(role) {
                let keep = addr == &succ.addr
                    || pred_new.as_ref().map(|(p, _)| p == addr).unwrap_or(false);
                if !keep && !broken.contains(addr) {
                    broken.push(addr.clone());
                }
            }
        }
        for addr in broken {
            ctx.send(addr, Message::LinkBreak);
        }

        let (interests, events) = self.store.export(self.attr, &succ_new, now);
        ctx.send(
            succ.addr.clone(),
            Message::LeaveNotification {
                range: succ_new,
                interests,
                events,
            },
        );

        self.leaving = Some(Leaving {
            pred: pred_new,
            rejoin_at,
        });
        ctx.timer(TimerKey::FinishLeave, self.config.peer_ping_interval());
    }

    pub(super) fn finish_leave(&mut self, ctx: &mut Ctx) {
        let Some(leaving) = self.leaving.take() else {
            return;
        };
        if let Some((pred, range)) = leaving.pred {
            let (interests, events) =
                self.store.export(self.attr, &range, ctx.now);
            ctx.send(
                pred,
                Message::LeaveNotification {
                    range,
                    interests,
                    events,
                },
            );
        }
        self.reset(ctx);
        tracing::info!(hub = %self.attr, "left ring");
        self.app.leave_end(self.attr);

        match leaving.rejoin_at {
            Some(target) => self.start_join(ctx, Some(target)),
            None => ctx.push(Effect::LeaveComplete),
        }
    }

    pub(super) fn on_leave_notification(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        range: NodeRange,
        interests: Vec<StoredInterest>,
        events: Vec<StoredEvent>,
    ) {
        if self.status != HubStatus::Joined || range.attr != self.attr {
            return;
        }
        tracing::info!(hub = %self.attr, %from, %range, "absorbing range of leaving peer");
        self.lb.mark_unstable(
            ctx.now,
            self.config.successor_maintenance_timeout().mul_f64(1.5),
        );

        let was_succ = self.reg.has_role(&from, Role::Successor);
        self.reg.remove_peer(&from);
        self.cache.forget(&from);

        self.change_range(ctx, range);
        self.absorb(ctx, interests, events);

        if was_succ {
            if let Some(next) = self.reg.first(Role::Successor) {
                ctx.send(next.addr.clone(), Message::NotifySuccessor { range });
            }
        }
    }
}
