//! Overlay routing of publications and subscriptions, rendezvous
//! matching and trigger replay.

use super::*;
use std::collections::{BTreeMap, VecDeque};

/// Ranges remembered from peers we are not linked to.
const RANGE_CACHE_SIZE: usize = 32;

/// Hops before the ttl at which routed items start being logged.
const TTL_WARN_MARGIN: u32 = 5;

/// Recently seen peer ranges, most recent first.
///
/// Ranges of distinct nodes never overlap, so noting a range evicts any
/// older entry it overlaps.
#[derive(Debug, Default)]
pub(crate) struct RangeCache {
    entries: VecDeque<(PeerAddr, NodeRange)>,
}

fn ranges_overlap(a: &NodeRange, b: &NodeRange) -> bool {
    a.covers(b.min) || b.covers(a.min)
}

impl RangeCache {
    pub fn note(&mut self, addr: PeerAddr, range: NodeRange) {
        if range.is_empty() {
            return;
        }
        self.entries
            .retain(|(a, r)| a != &addr && !ranges_overlap(r, &range));
        self.entries.push_front((addr, range));
        self.entries.truncate(RANGE_CACHE_SIZE);
    }

    pub fn forget(&mut self, addr: &PeerAddr) {
        self.entries.retain(|(a, _)| a != addr);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The peer last seen owning `v`. A hit becomes most recent.
    pub fn covering(&mut self, v: Value) -> Option<PeerAddr> {
        let idx = self.entries.iter().position(|(_, r)| r.covers(v))?;
        let entry = self.entries.remove(idx)?;
        let addr = entry.0.clone();
        self.entries.push_front(entry);
        Some(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Hub {
    /// Route one item arriving from `from` (ourselves for local
    /// publish and subscribe).
    pub(crate) fn route(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        hop_count: u32,
        item: Item,
        mode: RouteMode,
    ) {
        let (HubStatus::Joined, Some(my)) = (self.status, self.range) else {
            tracing::debug!(hub = %self.attr, %from, "not joined, dropping routed item");
            return;
        };
        let Some(c) = item.constraint(self.attr).copied() else {
            tracing::warn!(hub = %self.attr, %from, "item has no constraint for this hub");
            return;
        };
        let c = c.clamp(&self.space);
        if !c.is_valid() {
            tracing::warn!(hub = %self.attr, %from, %c, "inverted constraint, dropping");
            return;
        }

        let ttl = self.config.max_message_ttl;
        if hop_count >= ttl {
            tracing::warn!(hub = %self.attr, %from, %c, hop_count, "route loop, dropping item");
            return;
        }
        if hop_count + TTL_WARN_MARGIN >= ttl {
            tracing::warn!(hub = %self.attr, %from, %c, hop_count, %my, "item close to ttl");
        }

        self.load.count();
        self.maybe_quick_pong(ctx, &from);

        let rightmost = self.am_rightmost(&my);
        let dirs = c.route_directions(&my, rightmost);
        tracing::trace!(hub = %self.attr, %c, %my, ?dirs, ?mode, "route");

        match mode {
            RouteMode::Greedy => {
                if !dirs.left && dirs.center {
                    self.at_rendezvous(ctx, &item, dirs);
                    if dirs.right {
                        self.spread_right(ctx, hop_count, item, &c, &my);
                    }
                    return;
                }
                let Some(next) = self.compute_next_hop(c.min) else {
                    tracing::debug!(hub = %self.attr, %c, "no next hop");
                    return;
                };
                if !self.app_allows(&item, &next, false) {
                    return;
                }
                ctx.send_hop(
                    next,
                    hop_count + 1,
                    item.into_message(RouteMode::Greedy),
                );
            }
            RouteMode::Linear => {
                if dirs.center {
                    self.at_rendezvous(ctx, &item, dirs);
                }
                if dirs.right {
                    self.forward_linear(ctx, hop_count, item);
                }
            }
            RouteMode::Fanout { stop } => {
                if dirs.center {
                    self.at_rendezvous(ctx, &item, dirs);
                }
                if !my.is_wrapped() && !rightmost && stop >= my.max {
                    let span = Constraint::new(self.attr, my.max, stop);
                    self.do_fanout(ctx, hop_count, item, span);
                }
            }
        }
    }

    fn app_allows(&self, item: &Item, next: &PeerAddr, linear: bool) -> bool {
        match (item, linear) {
            (Item::Event(e), false) => self.app.event_route(e, next),
            (Item::Interest(i), false) => self.app.interest_route(i, next),
            (Item::Event(e), true) => self.app.event_linear(e, next),
            (Item::Interest(i), true) => self.app.interest_linear(i, next),
        }
    }

    /// Cover the part of `c` beyond our range.
    fn spread_right(
        &mut self,
        ctx: &mut Ctx,
        hop_count: u32,
        item: Item,
        c: &Constraint,
        my: &NodeRange,
    ) {
        if self.config.fanout_pubs && !my.is_wrapped() {
            let span = Constraint::new(self.attr, my.max, c.max);
            self.do_fanout(ctx, hop_count, item, span);
        } else {
            self.forward_linear(ctx, hop_count, item);
        }
    }

    fn forward_linear(&mut self, ctx: &mut Ctx, hop_count: u32, item: Item) {
        let Some(succ) = self.reg.first(Role::Successor).map(|p| p.addr.clone())
        else {
            tracing::debug!(hub = %self.attr, "no successor for linear spread");
            return;
        };
        if !self.app_allows(&item, &succ, true) {
            return;
        }
        ctx.send_hop(succ, hop_count + 1, item.into_message(RouteMode::Linear));
    }

    /// Split `span` among the known peers starting inside it, each told
    /// where to stop. Falls back to linear spread when the known peers
    /// do not start exactly at the span.
    fn do_fanout(
        &mut self,
        ctx: &mut Ctx,
        hop_count: u32,
        item: Item,
        span: Constraint,
    ) {
        let mut targets: Vec<PeerInfo> = self
            .reg
            .sorted_view()
            .into_iter()
            .filter(|p| {
                !p.range.is_wrapped()
                    && p.range.min >= span.min
                    && p.range.min <= span.max
            })
            .collect();
        targets.dedup_by(|a, b| a.range.min == b.range.min);

        if targets.first().map(|p| p.range.min) != Some(span.min) {
            tracing::debug!(hub = %self.attr, %span, "fanout has a gap, spreading linearly");
            self.forward_linear(ctx, hop_count, item);
            return;
        }

        for (i, target) in targets.iter().enumerate() {
            let stop = match targets.get(i + 1) {
                Some(next) => next.range.min - Value(1),
                None => span.max,
            };
            if !self.app_allows(&item, &target.addr, true) {
                continue;
            }
            ctx.send_hop(
                target.addr.clone(),
                hop_count + 1,
                item.clone().into_message(RouteMode::Fanout { stop }),
            );
        }
    }

    /// The peer to forward to for key `v`.
    ///
    /// Picks the known node whose range starts closest below `v`,
    /// preferring a cached owner of `v` when our links fall short.
    /// Never returns ourselves. A predecessor that does not own `v` is
    /// never a next hop: the item is dropped instead.
    pub(super) fn compute_next_hop(&mut self, v: Value) -> Option<PeerAddr> {
        let my = self.range?;
        let mut view = self.reg.sorted_view();
        view.push(PeerInfo {
            addr: self.me.clone(),
            range: my,
        });
        view.sort_by(|a, b| a.range.min.cmp(&b.range.min));

        let nearest = view
            .iter()
            .rev()
            .find(|p| p.range.min <= v)
            .or_else(|| view.last())?
            .clone();

        let is_me = nearest.addr == self.me;
        if !is_me && nearest.range.covers(v) {
            return Some(nearest.addr);
        }
        if let Some(addr) = self.cache.covering(v) {
            if addr != self.me {
                return Some(addr);
            }
        }

        let pred_only = self
            .reg
            .lookup(&nearest.addr)
            .map(|p| {
                p.has(Role::Predecessor)
                    && !p.has(Role::Successor)
                    && !p.has(Role::LongNeighbor)
            })
            .unwrap_or(false);
        if pred_only {
            tracing::warn!(hub = %self.attr, %v, pred = %nearest.addr, "route failure, ring looks unstable");
            return None;
        }
        if is_me {
            return self.reg.first(Role::Successor).map(|p| p.addr.clone());
        }
        Some(nearest.addr)
    }

    fn at_rendezvous(&mut self, ctx: &mut Ctx, item: &Item, dirs: RouteDirections) {
        let now = ctx.now;
        match item {
            Item::Event(event) => {
                let action = self.app.event_at_rendezvous(event);
                tracing::trace!(hub = %self.attr, id = event.id, ?action, "event at rendezvous");
                if action.matches() {
                    self.match_event(ctx, event, dirs);
                }
                if action.stores()
                    && self.config.enable_pub_triggers
                    && event.lifetime_ms > 0
                {
                    self.store.add_event(event.clone(), now + event.lifetime());
                }
            }
            Item::Interest(interest) => {
                let action = self.app.interest_at_rendezvous(interest);
                tracing::trace!(hub = %self.attr, id = interest.id, ?action, "interest at rendezvous");
                if action.stores() && interest.lifetime_ms > 0 {
                    self.store
                        .add_interest(interest.clone(), now + interest.lifetime());
                }
                if action.triggers() && self.config.enable_pub_triggers {
                    self.trigger(ctx, interest, dirs);
                }
            }
        }
    }

    /// Whether a stored item whose constraint also starts left of our
    /// range was already paired with the routed item upstream.
    fn matched_upstream(&self, routed_left: bool, other: &[Constraint]) -> bool {
        let (Some(my), true) = (self.range, routed_left) else {
            return false;
        };
        let rightmost = self.am_rightmost(&my);
        other
            .iter()
            .find(|c| c.attr == self.attr)
            .map(|c| c.clamp(&self.space).route_directions(&my, rightmost).left)
            .unwrap_or(false)
    }

    fn match_event(&mut self, ctx: &mut Ctx, event: &Event, dirs: RouteDirections) {
        let now = ctx.now;
        let mut by_sub: BTreeMap<PeerAddr, (Vec<u64>, u32)> = BTreeMap::new();
        for s in self.store.interests(now) {
            let interest = &s.item;
            if !interest.matches(event) {
                continue;
            }
            if interest.subscriber == event.creator && !self.config.send_back_pub
            {
                continue;
            }
            if self.matched_upstream(dirs.left, &interest.constraints) {
                continue;
            }
            let entry = by_sub
                .entry(interest.subscriber.clone())
                .or_insert_with(|| (Vec::new(), 0));
            entry.0.push(interest.id);
            entry.1 = entry.1.max(s.remaining_ms(now));
        }

        for (sub, (interests, max_ttl)) in by_sub {
            let mut event = event.clone();
            event.lifetime_ms = event.lifetime_ms.min(max_ttl);
            tracing::debug!(hub = %self.attr, id = event.id, %sub, count = interests.len(), "matched publication");
            self.deliver(ctx, sub, event, interests);
        }
    }

    /// Replay stored events matching a newly arrived subscription.
    fn trigger(&mut self, ctx: &mut Ctx, interest: &Interest, dirs: RouteDirections) {
        let now = ctx.now;
        let hits: Vec<Event> = self
            .store
            .events(now)
            .filter(|s| interest.matches(&s.item))
            .filter(|s| {
                s.item.creator != interest.subscriber || self.config.send_back_pub
            })
            .filter(|s| !self.matched_upstream(dirs.left, &s.item.constraints))
            .map(|s| {
                let mut event = s.item.clone();
                event.lifetime_ms = s.remaining_ms(now);
                event
            })
            .collect();
        for event in hits {
            tracing::debug!(hub = %self.attr, id = event.id, sub = %interest.subscriber, "triggered publication");
            self.deliver(ctx, interest.subscriber.clone(), event, vec![interest.id]);
        }
    }

    fn deliver(
        &mut self,
        ctx: &mut Ctx,
        to: PeerAddr,
        event: Event,
        interests: Vec<u64>,
    ) {
        if to == self.me {
            self.app.deliver(event, interests);
        } else {
            ctx.send(to, Message::MatchedPublication { event, interests });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const A: AttrId = AttrId(0);

    fn r(min: u64, max: u64) -> NodeRange {
        NodeRange::new(A, Value(min), Value(max))
    }

    #[test]
    fn cache_evicts_overlapping_and_old() {
        let mut cache = RangeCache::default();
        cache.note("a".into(), r(0, 10));
        cache.note("b".into(), r(10, 20));
        cache.note("c".into(), r(5, 15));
        assert_eq!(1, cache.len());
        assert_eq!(Some(PeerAddr::from("c")), cache.covering(Value(7)));
        assert_eq!(None, cache.covering(Value(2)));

        for i in 0..40u64 {
            cache.note(format!("p{i}").as_str().into(), r(100 + i, 101 + i));
        }
        assert_eq!(RANGE_CACHE_SIZE, cache.len());
        assert_eq!(None, cache.covering(Value(100)));
        assert_eq!(Some(PeerAddr::from("p39")), cache.covering(Value(139)));
    }

    #[test]
    fn cache_forget() {
        let mut cache = RangeCache::default();
        cache.note("a".into(), r(0, 10));
        cache.forget(&"a".into());
        assert_eq!(None, cache.covering(Value(1)));
        cache.note("a".into(), r(90, 10));
        assert_eq!(Some(PeerAddr::from("a")), cache.covering(Value(95)));
        cache.clear();
        assert_eq!(0, cache.len());
    }
}
