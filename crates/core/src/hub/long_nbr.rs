//! Small-world long-distance links.

use super::*;
use rand::Rng;

/// Harmonic draws that land in our own range before giving up.
const MAX_DRAWS: usize = 3;

/// Links wanted for an estimated population of `n`.
pub(super) fn desired_links(n: usize) -> usize {
    if n < 2 {
        return 0;
    }
    (n as f64).log2().ceil() as usize
}

/// A rank distance drawn with density proportional to 1/d over
/// `[1, n - 1]`, as a fraction of `n`.
pub(super) fn harmonic_fraction(u: f64, n: usize) -> f64 {
    let d = (u * ((n - 1) as f64).ln()).exp();
    d / n as f64
}

impl Hub {
    pub(super) fn on_long_nbr_repair(&mut self, ctx: &mut Ctx) {
        if self.status != HubStatus::Joined {
            return;
        }
        ctx.timer(
            TimerKey::LongNbrRepair,
            self.config.long_neighbor_repair_interval(),
        );
        self.repair_long_pointers(ctx);
    }

    /// Start a new round: stale replies from the previous one are ignored.
    pub(super) fn repair_long_pointers(&mut self, ctx: &mut Ctx) {
        self.epoch = self.epoch.wrapping_add(1);
        for nonce in self.outstanding.drain().map(|(n, _)| n) {
            ctx.cancel(TimerKey::NeighborRequest(nonce));
        }

        let n = self.sampler.estimate_node_count(self.attr);
        let k = desired_links(n);
        if k < 3 {
            tracing::trace!(hub = %self.attr, n, "ring too small for long neighbors");
            return;
        }
        tracing::debug!(hub = %self.attr, n, k, epoch = self.epoch, "repairing long neighbors");
        for _ in 0..k {
            self.repair_pointer(ctx);
        }
    }

    /// Ask for one new long neighbor at a harmonically sampled distance.
    pub(super) fn repair_pointer(&mut self, ctx: &mut Ctx) {
        let (HubStatus::Joined, Some(my)) = (self.status, self.range) else {
            return;
        };
        let n = self.sampler.estimate_node_count(self.attr);
        if n < 2 {
            return;
        }
        for _ in 0..MAX_DRAWS {
            let frac = harmonic_fraction(self.rng.gen::<f64>(), n);
            let Some(target) =
                self.sampler.value_at_rank_distance(self.attr, &my, frac)
            else {
                continue;
            };
            if my.covers(target) {
                continue;
            }
            self.send_neighbor_request(ctx, my, target);
            return;
        }
        tracing::debug!(hub = %self.attr, "long neighbor draws all landed locally");
    }

    fn send_neighbor_request(
        &mut self,
        ctx: &mut Ctx,
        my: NodeRange,
        target: Value,
    ) {
        let Some(next) = self.compute_next_hop(target) else {
            return;
        };
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.outstanding.insert(nonce, target);
        ctx.send_hop(
            next,
            1,
            Message::NeighborRequest {
                origin: self.me.clone(),
                origin_range: my,
                target,
                epoch: self.epoch,
                nonce,
            },
        );
        ctx.timer(
            TimerKey::NeighborRequest(nonce),
            self.config.long_neighbor_response_timeout(),
        );
    }

    pub(super) fn on_neighbor_request_timeout(
        &mut self,
        ctx: &mut Ctx,
        nonce: u32,
    ) {
        if self.outstanding.remove(&nonce).is_some() {
            tracing::debug!(hub = %self.attr, nonce, "neighbor request timed out, retrying");
            self.repair_pointer(ctx);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn on_neighbor_request(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        hop_count: u32,
        origin: PeerAddr,
        origin_range: NodeRange,
        target: Value,
        epoch: u32,
        nonce: u32,
    ) {
        let (HubStatus::Joined, Some(my)) = (self.status, self.range) else {
            return;
        };

        let owns = my.covers(target)
            || (self.am_rightmost(&my) && target == my.max);
        if owns {
            ctx.send(
                origin.clone(),
                Message::NeighborResponse {
                    range: my,
                    epoch,
                    nonce,
                },
            );
            if origin != self.me {
                self.reg.register(&origin, Some(origin_range), ctx.now);
                self.reg.add_role(&origin, Role::ReverseLongNeighbor);
                self.cache.note(origin, origin_range);
            }
            return;
        }

        if from != self.me {
            ctx.send(
                from,
                Message::LivenessPong {
                    seqno: None,
                    range: Some(my),
                },
            );
        }

        if hop_count >= self.config.max_message_ttl {
            tracing::warn!(hub = %self.attr, %origin, %target, hop_count, "neighbor request over ttl, dropping");
            return;
        }

        match self.compute_next_hop(target) {
            Some(next) => ctx.send_hop(
                next,
                hop_count + 1,
                Message::NeighborRequest {
                    origin,
                    origin_range,
                    target,
                    epoch,
                    nonce,
                },
            ),
            None => {
                tracing::debug!(hub = %self.attr, %target, "no next hop for neighbor request");
            }
        }
    }

    pub(super) fn on_neighbor_response(
        &mut self,
        ctx: &mut Ctx,
        from: PeerAddr,
        range: NodeRange,
        epoch: u32,
        nonce: u32,
    ) {
        ctx.cancel(TimerKey::NeighborRequest(nonce));
        self.outstanding.remove(&nonce);

        if epoch != self.epoch {
            tracing::warn!(hub = %self.attr, %from, epoch, current = self.epoch, "stale neighbor response");
            return;
        }
        if self.status != HubStatus::Joined || from == self.me {
            return;
        }
        if self.reg.has_role(&from, Role::LongNeighbor) {
            tracing::debug!(hub = %self.attr, %from, "duplicate long neighbor");
            self.learn(&from, range);
            return;
        }

        self.reg.register(&from, Some(range), ctx.now);
        self.reg.add_role(&from, Role::LongNeighbor);
        self.cache.note(from.clone(), range);

        let k = desired_links(self.sampler.estimate_node_count(self.attr))
            .max(1);
        while self.reg.list(Role::LongNeighbor).len() > k {
            let oldest = self.reg.list(Role::LongNeighbor)[0].clone();
            self.reg.remove_role(&oldest, Role::LongNeighbor);
        }
        tracing::debug!(hub = %self.attr, %from, %range, "long neighbor added");
    }
}
