use super::*;
use crate::AttrConfig;
use mercury_api::{app::Application, sampler::*};
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

const A: AttrId = AttrId(0);
const SPACE: AttrSpace = AttrSpace::new(0, 1000);

fn r(min: u64, max: u64) -> NodeRange {
    NodeRange::new(A, Value(min), Value(max))
}

fn event(id: u64, creator: &PeerAddr, min: u64, max: u64, life: u32) -> Event {
    Event {
        id,
        creator: creator.clone(),
        constraints: vec![Constraint::new(A, Value(min), Value(max))],
        payload: bytes::Bytes::from_static(b"payload"),
        lifetime_ms: life,
    }
}

fn interest(id: u64, sub: &PeerAddr, min: u64, max: u64) -> Interest {
    Interest {
        id,
        subscriber: sub.clone(),
        constraints: vec![Constraint::new(A, Value(min), Value(max))],
        lifetime_ms: 10_000,
    }
}

#[derive(Debug, Default)]
struct RecApp {
    delivered: Mutex<Vec<(u64, Vec<u64>)>>,
    expanded: Mutex<Vec<NodeRange>>,
    contracted: Mutex<Vec<NodeRange>>,
    failed: Mutex<u32>,
}

impl Application for RecApp {
    fn join_failed(&self, _attr: AttrId) {
        *self.failed.lock().unwrap() += 1;
    }

    fn range_expanded(&self, _old: NodeRange, new: NodeRange) {
        self.expanded.lock().unwrap().push(new);
    }

    fn range_contracted(&self, _old: NodeRange, new: NodeRange) {
        self.contracted.lock().unwrap().push(new);
    }

    fn deliver(&self, event: Event, interests: Vec<u64>) {
        self.delivered.lock().unwrap().push((event.id, interests));
    }
}

#[derive(Debug, Default)]
struct FixedSampler {
    n: usize,
    target: Mutex<Option<Value>>,
    loads: Mutex<HashMap<PeerAddr, f64>>,
}

impl Sampler for FixedSampler {
    fn estimate_node_count(&self, _attr: AttrId) -> usize {
        self.n.max(1)
    }

    fn value_at_rank_distance(
        &self,
        _attr: AttrId,
        _origin: &NodeRange,
        _distance: f64,
    ) -> Option<Value> {
        *self.target.lock().unwrap()
    }

    fn current_load(&self, _attr: AttrId, local: &PeerAddr) -> Option<f64> {
        self.loads.lock().unwrap().get(local).copied()
    }

    fn neighborhood_load(
        &self,
        _attr: AttrId,
        neighbor: &PeerAddr,
    ) -> Option<f64> {
        self.loads.lock().unwrap().get(neighbor).copied()
    }

    fn load_samples(&self, _attr: AttrId) -> Vec<LoadSample> {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, load)| LoadSample {
                addr: addr.clone(),
                load: *load,
            })
            .collect()
    }
}

/// A set of hubs exchanging messages synchronously. Timers never fire on
/// their own; tests fire them explicitly.
struct Net {
    now: Instant,
    space: AttrSpace,
    config: Arc<MercuryNodeConfig>,
    sampler: Arc<FixedSampler>,
    hubs: BTreeMap<PeerAddr, Hub>,
    apps: HashMap<PeerAddr, Arc<RecApp>>,
    queue: VecDeque<(PeerAddr, PeerAddr, u32, Message)>,
    effects: Vec<(PeerAddr, Effect)>,
    lost: Vec<(PeerAddr, Message)>,
}

impl Net {
    fn new(config: MercuryNodeConfig, sampler: FixedSampler) -> Self {
        let space = config
            .attributes
            .first()
            .map(|a| a.space())
            .unwrap_or(SPACE);
        Self {
            now: Instant::now(),
            space,
            config: Arc::new(config),
            sampler: Arc::new(sampler),
            hubs: BTreeMap::new(),
            apps: HashMap::new(),
            queue: VecDeque::new(),
            effects: Vec::new(),
            lost: Vec::new(),
        }
    }

    fn add(&mut self, name: &str) -> PeerAddr {
        let addr = PeerAddr::from(name);
        let app = Arc::new(RecApp::default());
        let hub = Hub::with_rng(
            A,
            self.space,
            addr.clone(),
            self.config.clone(),
            app.clone(),
            self.sampler.clone(),
            rand::rngs::StdRng::seed_from_u64(self.hubs.len() as u64),
        );
        self.hubs.insert(addr.clone(), hub);
        self.apps.insert(addr.clone(), app);
        addr
    }

    fn with<R>(
        &mut self,
        addr: &PeerAddr,
        f: impl FnOnce(&mut Hub, &mut Ctx) -> R,
    ) -> R {
        let mut ctx = Ctx::new(self.now);
        let hub = self.hubs.get_mut(addr).expect("no such hub");
        let out = f(hub, &mut ctx);
        for effect in ctx.effects {
            match effect {
                Effect::Send { to, hop_count, msg } => {
                    self.queue.push_back((addr.clone(), to, hop_count, msg))
                }
                other => self.effects.push((addr.clone(), other)),
            }
        }
        out
    }

    fn pump(&mut self) {
        for _ in 0..10_000 {
            let Some((from, to, hop_count, msg)) = self.queue.pop_front()
            else {
                return;
            };
            if self.hubs.contains_key(&to) {
                self.with(&to, |h, ctx| h.handle(ctx, from, hop_count, msg));
            } else {
                self.lost.push((to, msg));
            }
        }
        panic!("message storm");
    }

    fn timer(&mut self, addr: &PeerAddr, key: TimerKey) {
        self.with(addr, |h, ctx| h.on_timer(ctx, key));
        self.pump();
    }

    fn found(&mut self, name: &str) -> PeerAddr {
        let addr = self.add(name);
        self.with(&addr, |h, ctx| h.start_join(ctx, None));
        self.pump();
        addr
    }

    fn join(&mut self, name: &str, via: &PeerAddr) -> PeerAddr {
        let addr = self.add(name);
        self.with(&addr, |h, ctx| h.start_join(ctx, Some(via.clone())));
        self.pump();
        addr
    }

    fn stabilize(&mut self, rounds: usize) {
        let addrs: Vec<PeerAddr> = self.hubs.keys().cloned().collect();
        for _ in 0..rounds {
            for addr in addrs.iter() {
                if self.hubs.contains_key(addr) {
                    self.timer(addr, TimerKey::SuccMaintenance);
                }
            }
        }
    }

    fn hub(&self, addr: &PeerAddr) -> &Hub {
        &self.hubs[addr]
    }

    fn range(&self, addr: &PeerAddr) -> NodeRange {
        self.hub(addr).range.expect("hub has no range")
    }

    fn app(&self, addr: &PeerAddr) -> &RecApp {
        &self.apps[addr]
    }

    fn effect(&self, addr: &PeerAddr, f: impl Fn(&Effect) -> bool) -> bool {
        self.effects.iter().any(|(a, e)| a == addr && f(e))
    }
}

fn config() -> MercuryNodeConfig {
    config_over(1000)
}

fn config_over(abs_max: u64) -> MercuryNodeConfig {
    MercuryNodeConfig {
        attributes: vec![AttrConfig {
            id: A,
            name: "test".into(),
            abs_min: 0,
            abs_max,
        }],
        ..Default::default()
    }
}

/// a: [750, 1000), b: [0, 500), c: [500, 750)
fn three_ring(net: &mut Net) -> (PeerAddr, PeerAddr, PeerAddr) {
    let a = net.found("a");
    let b = net.join("b", &a);
    let c = net.join("c", &a);
    net.stabilize(2);
    (a, b, c)
}

/// a: [0, 50), b: [50, 100) on a [0, 100] ring.
fn two_ring(net: &mut Net) -> (PeerAddr, PeerAddr) {
    let b = net.found("b");
    let a = net.join("a", &b);
    net.stabilize(2);
    (a, b)
}

#[test]
fn founding_node_owns_everything() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");

    assert_eq!(HubStatus::Joined, net.hub(&a).status());
    assert_eq!(r(0, 1000), net.range(&a));
    assert!(net.effect(&a, |e| matches!(e, Effect::JoinComplete)));
    assert!(net.effect(&a, |e| matches!(e, Effect::Announce(x) if *x == r(0, 1000))));
}

#[test]
fn join_splits_representative_range() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let b = net.join("b", &a);

    assert_eq!(r(500, 1000), net.range(&a));
    assert_eq!(r(0, 500), net.range(&b));
    assert_eq!(vec![r(500, 1000)], *net.app(&a).contracted.lock().unwrap());

    for (me, other) in [(&a, &b), (&b, &a)] {
        let snap = net.hub(me).snapshot();
        assert_eq!(other, &snap.successors[0].addr);
        assert_eq!(other, &snap.predecessors[0].addr);
        net.hub(me).reg.check_consistency();
    }
}

#[test]
fn three_nodes_close_the_ring() {
    let mut net = Net::new(config(), FixedSampler::default());
    let (a, b, c) = three_ring(&mut net);

    assert_eq!(r(750, 1000), net.range(&a));
    assert_eq!(r(0, 500), net.range(&b));
    assert_eq!(r(500, 750), net.range(&c));

    for (me, succ) in [(&a, &b), (&b, &c), (&c, &a)] {
        let snap = net.hub(me).snapshot();
        let first = &snap.successors[0];
        assert_eq!(succ, &first.addr, "successor of {me}");
        assert_eq!(
            SPACE.normalize_max(first.range.min),
            net.range(me).max,
            "{me} does not abut its successor",
        );
        assert_eq!(me, &net.hub(succ).snapshot().predecessors[0].addr);
    }

    // b learns the rest of the ring through c
    let snap = net.hub(&b).snapshot();
    let succs: Vec<_> = snap.successors.iter().map(|p| p.addr.clone()).collect();
    assert_eq!(vec![c.clone(), a.clone()], succs);
    assert_eq!(r(750, 1000), snap.successors[1].range);
}

#[test]
fn duplicate_join_request_is_ignored() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let x = PeerAddr::from("x");

    let accepted = |net: &Net| {
        net.queue
            .iter()
            .filter(|(_, to, _, m)| {
                to == &x
                    && matches!(
                        m,
                        Message::JoinResponse(JoinResponse::Accepted { .. })
                    )
            })
            .count()
    };

    net.with(&a, |h, ctx| h.handle(ctx, x.clone(), 0, Message::JoinRequest));
    assert_eq!(1, accepted(&net));
    match &net.queue[0].3 {
        Message::JoinResponse(JoinResponse::Accepted {
            assigned,
            successors,
            only_node,
        }) => {
            assert_eq!(r(0, 500), *assigned);
            assert_eq!(a, successors[0].addr);
            assert_eq!(r(500, 1000), successors[0].range);
            assert!(*only_node);
        }
        other => panic!("unexpected {other:?}"),
    }

    net.with(&a, |h, ctx| h.handle(ctx, x.clone(), 0, Message::JoinRequest));
    assert_eq!(1, accepted(&net));
    assert_eq!(r(500, 1000), net.range(&a));
}

#[test]
fn unjoined_hub_refuses_joiners() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.add("a");
    net.with(&a, |h, ctx| h.handle(ctx, "x".into(), 0, Message::JoinRequest));
    assert!(matches!(
        net.queue[0].3,
        Message::JoinResponse(JoinResponse::Unjoined)
    ));
}

#[test]
fn join_gives_up_after_max_attempts() {
    let mut net = Net::new(
        MercuryNodeConfig {
            max_join_attempts: 2,
            ..config()
        },
        FixedSampler::default(),
    );
    let b = net.join("b", &"ghost".into());
    assert_eq!(HubStatus::Joining, net.hub(&b).status());

    net.timer(&b, TimerKey::JoinRetry);
    assert_eq!(HubStatus::Joining, net.hub(&b).status());
    assert_eq!(2, net.lost.len());

    net.timer(&b, TimerKey::JoinRetry);
    assert_eq!(HubStatus::Unjoined, net.hub(&b).status());
    assert!(net.effect(&b, |e| matches!(
        e,
        Effect::JoinFailed(MercError::JoinExhausted { attempts: 2, .. })
    )));
    assert_eq!(1, *net.app(&b).failed.lock().unwrap());
}

#[test]
fn predecessor_is_replaced_only_by_closer_nodes() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let b = net.join("b", &a);
    let pred = |net: &Net| {
        net.hub(&a).reg.first(Role::Predecessor).unwrap().addr.clone()
    };
    assert_eq!(b, pred(&net));

    // starts left of a but further away than b's end
    net.with(&a, |h, ctx| {
        h.handle(ctx, "far".into(), 0, Message::NotifySuccessor { range: r(0, 300) })
    });
    assert_eq!(b, pred(&net));

    // same end as b, starting closer
    net.with(&a, |h, ctx| {
        h.handle(ctx, "near".into(), 0, Message::NotifySuccessor { range: r(200, 500) })
    });
    assert_eq!(PeerAddr::from("near"), pred(&net));
    net.hub(&a).reg.check_consistency();
}

#[test]
fn routed_items_past_ttl_are_dropped() {
    let mut net = Net::new(
        MercuryNodeConfig {
            max_message_ttl: 10,
            ..config()
        },
        FixedSampler::default(),
    );
    let a = net.found("a");
    let x = PeerAddr::from("x");

    let sub = |id| Message::Subscription {
        interest: interest(id, &x, 10, 20),
        mode: RouteMode::Greedy,
    };
    net.with(&a, |h, ctx| h.handle(ctx, x.clone(), 10, sub(1)));
    assert_eq!(0, net.hub(&a).snapshot().interests);
    net.with(&a, |h, ctx| h.handle(ctx, x.clone(), 9, sub(2)));
    assert_eq!(1, net.hub(&a).snapshot().interests);
}

#[test]
fn publications_reach_local_subscribers() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let p = PeerAddr::from("p");

    net.with(&a, |h, ctx| h.subscribe(ctx, interest(1, &a, 0, 200)))
        .unwrap();
    net.with(&a, |h, ctx| h.publish(ctx, event(7, &p, 100, 100, 0)))
        .unwrap();
    // own publications are not sent back
    net.with(&a, |h, ctx| h.publish(ctx, event(8, &a, 100, 100, 0)))
        .unwrap();
    // out of range
    net.with(&a, |h, ctx| h.publish(ctx, event(9, &p, 300, 400, 0)))
        .unwrap();
    net.pump();

    assert_eq!(vec![(7, vec![1])], *net.app(&a).delivered.lock().unwrap());
}

#[test]
fn local_items_are_validated() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.add("a");
    assert!(net
        .with(&a, |h, ctx| h.publish(ctx, event(1, &a, 1, 2, 0)))
        .is_err());

    net.with(&a, |h, ctx| h.start_join(ctx, None));
    assert!(net
        .with(&a, |h, ctx| h.publish(ctx, event(1, &a, 5, 2, 0)))
        .is_err());
    let mut other = event(2, &a, 1, 2, 0);
    other.constraints[0].attr = AttrId(3);
    assert!(net.with(&a, |h, ctx| h.publish(ctx, other)).is_err());
}

#[test]
fn stored_events_trigger_later_subscriptions() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let p = PeerAddr::from("p");
    let s = PeerAddr::from("s");

    net.with(&a, |h, ctx| h.publish(ctx, event(1, &p, 100, 100, 5_000)))
        .unwrap();
    assert_eq!(1, net.hub(&a).snapshot().events);

    net.now += Duration::from_secs(1);
    net.with(&a, |h, ctx| h.subscribe(ctx, interest(4, &s, 50, 150)))
        .unwrap();
    net.pump();
    match net.lost.as_slice() {
        [(to, Message::MatchedPublication { event, interests })] => {
            assert_eq!(&s, to);
            assert_eq!(1, event.id);
            assert_eq!(4_000, event.lifetime_ms);
            assert_eq!(&vec![4], interests);
        }
        other => panic!("unexpected {other:?}"),
    }

    net.now += Duration::from_secs(5);
    net.with(&a, |h, ctx| h.subscribe(ctx, interest(5, &s, 50, 150)))
        .unwrap();
    net.pump();
    assert_eq!(1, net.lost.len());
}

#[test]
fn spanning_match_is_delivered_once() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let b = net.join("b", &a);

    net.with(&b, |h, ctx| h.subscribe(ctx, interest(1, &b, 400, 600)))
        .unwrap();
    net.pump();
    assert_eq!(1, net.hub(&a).snapshot().interests);
    assert_eq!(1, net.hub(&b).snapshot().interests);

    net.with(&a, |h, ctx| h.publish(ctx, event(2, &a, 450, 550, 0)))
        .unwrap();
    net.pump();
    assert_eq!(vec![(2, vec![1])], *net.app(&b).delivered.lock().unwrap());
}

#[test]
fn fanout_splits_span_among_known_peers() {
    let mut net = Net::new(
        MercuryNodeConfig {
            fanout_pubs: true,
            ..config()
        },
        FixedSampler::default(),
    );
    let (a, b, c) = three_ring(&mut net);
    net.queue.clear();

    net.with(&b, |h, ctx| h.publish(ctx, event(1, &b, 100, 900, 0)))
        .unwrap();
    let fanned: Vec<(PeerAddr, Value)> = net
        .queue
        .iter()
        .filter_map(|(_, to, _, m)| match m {
            Message::Publication {
                mode: RouteMode::Fanout { stop },
                ..
            } => Some((to.clone(), *stop)),
            _ => None,
        })
        .collect();
    assert_eq!(vec![(c, Value(749)), (a, Value(900))], fanned);
}

#[test]
fn losing_last_successor_rejoins() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let b = net.join("b", &a);

    net.hubs.remove(&a);
    net.with(&b, |h, ctx| h.peer_gone(ctx, &a));
    assert_eq!(HubStatus::Unjoined, net.hub(&b).status());
    assert!(net.effect(&b, |e| matches!(e, Effect::FindRepresentative)));
    assert!(net.effect(&b, |e| matches!(e, Effect::Withdraw)));
}

#[test]
fn silent_successor_is_declared_dead() {
    let mut net = Net::new(config(), FixedSampler::default());
    let (a, b, c) = three_ring(&mut net);

    net.hubs.remove(&c);
    net.now += net.config.peer_pong_timeout() + Duration::from_secs(1);
    // a is still talking to and probing b
    net.timer(&a, TimerKey::SuccMaintenance);
    net.timer(&a, TimerKey::PingPeers);
    net.with(&b, |h, ctx| h.on_timer(ctx, TimerKey::PingPeers));

    let hub = net.hub(&b);
    assert_eq!(HubStatus::Joined, hub.status());
    assert!(hub.reg.lookup(&c).is_none());
    assert_eq!(a, hub.reg.first(Role::Successor).unwrap().addr);
    assert!(hub.reg.has_role(&a, Role::Predecessor));
    hub.reg.check_consistency();
    assert!(net.queue.iter().any(|(_, to, _, m)| {
        to == &a && matches!(m, Message::NotifySuccessor { .. })
    }));
}

#[test]
fn leave_hands_range_and_items_over() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let b = net.join("b", &a);

    net.with(&b, |h, ctx| h.subscribe(ctx, interest(1, &b, 700, 800)))
        .unwrap();
    net.pump();
    assert_eq!(1, net.hub(&a).snapshot().interests);
    assert_eq!(0, net.hub(&b).snapshot().interests);

    net.with(&a, |h, ctx| h.leave(ctx, None));
    net.pump();
    assert_eq!(r(0, 1000), net.range(&b));
    assert_eq!(1, net.hub(&b).snapshot().interests);
    assert!(net.hub(&b).reg.lookup(&a).is_none());
    assert_eq!(vec![r(0, 1000)], *net.app(&b).expanded.lock().unwrap());

    net.timer(&a, TimerKey::FinishLeave);
    assert_eq!(HubStatus::Unjoined, net.hub(&a).status());
    assert!(net.effect(&a, |e| matches!(e, Effect::LeaveComplete)));
}

#[test]
fn light_node_takes_range_from_heavy_neighbor() {
    let sampler = FixedSampler::default();
    sampler.loads.lock().unwrap().insert("a".into(), 10.0);
    sampler.loads.lock().unwrap().insert("b".into(), 2.0);
    let mut net = Net::new(
        MercuryNodeConfig {
            load_balancing: true,
            ..config()
        },
        sampler,
    );
    let a = net.found("a");
    let b = net.join("b", &a);

    net.timer(&b, TimerKey::LoadBalanceCheck);

    assert_eq!(r(500, 800), net.range(&a));
    assert_eq!(r(800, 500), net.range(&b));
    assert!(!net.hub(&b).lb.is_busy());
    assert_eq!(
        Some(r(800, 500)),
        net.hub(&a).reg.lookup(&b).and_then(|p| p.range)
    );

    // the same neighbor cannot ask again straight away
    net.with(&a, |h, ctx| {
        h.handle(
            ctx,
            b.clone(),
            0,
            Message::LocalLoadBalanceRequest {
                range: r(800, 500),
                load: 0.1,
            },
        )
    });
    assert!(net.queue.is_empty());
    assert_eq!(r(500, 800), net.range(&a));
}

#[test]
fn long_neighbors_are_capped() {
    let mut net = Net::new(
        config(),
        FixedSampler {
            n: 16,
            ..Default::default()
        },
    );
    let a = net.found("a");
    let resp = |epoch, nonce| Message::NeighborResponse {
        range: r(100 * nonce as u64, 100 * nonce as u64 + 50),
        epoch,
        nonce,
    };

    for i in 1..=5 {
        let from = PeerAddr::from(format!("n{i}").as_str());
        net.with(&a, |h, ctx| h.handle(ctx, from, 0, resp(0, i)));
    }
    let names: Vec<String> = net
        .hub(&a)
        .snapshot()
        .long_neighbors
        .iter()
        .map(|p| p.addr.to_string())
        .collect();
    // ceil(log2(16)) links, oldest evicted
    assert_eq!(vec!["n2", "n3", "n4", "n5"], names);
    net.hub(&a).reg.check_consistency();
}

#[test]
fn owner_answers_neighbor_request() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let o = PeerAddr::from("o");

    net.with(&a, |h, ctx| {
        h.handle(
            ctx,
            "hop".into(),
            3,
            Message::NeighborRequest {
                origin: o.clone(),
                origin_range: r(2000, 2100),
                target: Value(300),
                epoch: 4,
                nonce: 9,
            },
        )
    });
    net.pump();

    match net.lost.as_slice() {
        [(to, Message::NeighborResponse { range, epoch, nonce })] => {
            assert_eq!(&o, to);
            assert_eq!(r(0, 1000), *range);
            assert_eq!((4, 9), (*epoch, *nonce));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(net.hub(&a).reg.has_role(&o, Role::ReverseLongNeighbor));
}

#[test]
fn repair_round_ignores_previous_round_responses() {
    let mut net = Net::new(
        config(),
        FixedSampler {
            n: 16,
            ..Default::default()
        },
    );
    let (a, b, _c) = three_ring(&mut net);
    *net.sampler.target.lock().unwrap() = Some(Value(100));
    net.queue.clear();

    let requests = |net: &Net| -> Vec<(u32, u32)> {
        net.queue
            .iter()
            .filter_map(|(from, to, _, m)| match m {
                Message::NeighborRequest { epoch, nonce, .. }
                    if from == &a && to == &b =>
                {
                    Some((*epoch, *nonce))
                }
                _ => None,
            })
            .collect()
    };

    net.with(&a, |h, ctx| h.on_timer(ctx, TimerKey::LongNbrRepair));
    let first = requests(&net);
    // ceil(log2(16)) requests, all routed through the owner of 100
    assert_eq!(4, first.len());
    net.queue.clear();

    net.with(&a, |h, ctx| h.on_timer(ctx, TimerKey::LongNbrRepair));
    let second = requests(&net);
    assert_eq!(4, second.len());
    assert_eq!(first[0].0 + 1, second[0].0);
    net.queue.clear();

    let respond = |(epoch, nonce): (u32, u32)| Message::NeighborResponse {
        range: r(0, 500),
        epoch,
        nonce,
    };
    net.with(&a, |h, ctx| h.handle(ctx, b.clone(), 0, respond(first[0])));
    let hub = net.hub(&a);
    assert!(!hub.reg.has_role(&b, Role::LongNeighbor));
    let mut outstanding: Vec<u32> = hub.outstanding.keys().copied().collect();
    outstanding.sort();
    let mut current: Vec<u32> = second.iter().map(|(_, n)| *n).collect();
    current.sort();
    assert_eq!(current, outstanding);

    net.with(&a, |h, ctx| h.handle(ctx, b.clone(), 0, respond(second[0])));
    let hub = net.hub(&a);
    assert!(hub.reg.has_role(&b, Role::LongNeighbor));
    assert_eq!(3, hub.outstanding.len());
    hub.reg.check_consistency();
}

#[test]
fn fanout_spreads_wide_subscriptions_once() {
    let mut net = Net::new(
        MercuryNodeConfig {
            fanout_pubs: true,
            ..config()
        },
        FixedSampler::default(),
    );
    let (a, b, c) = three_ring(&mut net);
    net.queue.clear();

    net.with(&b, |h, ctx| h.subscribe(ctx, interest(1, &b, 100, 900)))
        .unwrap();
    let modes: Vec<RouteMode> = net
        .queue
        .iter()
        .filter_map(|(_, _, _, m)| match m {
            Message::Subscription { mode, .. } => Some(*mode),
            _ => None,
        })
        .collect();
    assert_eq!(
        vec![
            RouteMode::Fanout { stop: Value(749) },
            RouteMode::Fanout { stop: Value(900) },
        ],
        modes
    );

    net.pump();
    for x in [&a, &b, &c] {
        assert_eq!(1, net.hub(x).snapshot().interests, "{x}");
    }
}

#[test]
fn publication_routes_greedily_to_its_owner() {
    let mut net = Net::new(config_over(100), FixedSampler::default());
    let (a, b) = two_ring(&mut net);
    assert_eq!(r(0, 50), net.range(&a));
    assert_eq!(r(50, 100), net.range(&b));

    let s = PeerAddr::from("s");
    net.with(&b, |h, ctx| h.subscribe(ctx, interest(1, &s, 60, 80)))
        .unwrap();
    net.pump();
    net.queue.clear();
    net.lost.clear();

    net.with(&a, |h, ctx| h.publish(ctx, event(2, &a, 70, 70, 5_000)))
        .unwrap();
    net.queue.retain(|(_, _, _, m)| m.is_routed());
    let (from, to, hop_count, msg) = match net.queue.pop_front() {
        Some(hop @ (_, _, _, Message::Publication { mode: RouteMode::Greedy, .. })) => hop,
        other => panic!("unexpected {other:?}"),
    };
    assert!(net.queue.is_empty());
    assert_eq!((&a, &b, 1), (&from, &to, hop_count));

    net.with(&to, |h, ctx| h.handle(ctx, from, hop_count, msg));
    // b is the rendezvous, nothing travels further
    assert!(net.queue.iter().all(|(_, _, _, m)| !m.is_routed()));
    assert_eq!(1, net.hub(&b).snapshot().events);

    net.pump();
    match net.lost.as_slice() {
        [(to, Message::MatchedPublication { event, interests })] => {
            assert_eq!(&s, to);
            assert_eq!(2, event.id);
            assert_eq!(&vec![1], interests);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn joiner_splits_a_non_founder() {
    let mut net = Net::new(config_over(100), FixedSampler::default());
    let (a, b) = two_ring(&mut net);
    let c = net.join("c", &a);

    assert_eq!(r(0, 25), net.range(&c));
    assert_eq!(r(25, 50), net.range(&a));
    assert_eq!(c, net.hub(&a).reg.first(Role::Predecessor).unwrap().addr);

    net.stabilize(3);
    assert_eq!(r(0, 25), net.range(&c));
    assert_eq!(r(25, 50), net.range(&a));
    assert_eq!(r(50, 100), net.range(&b));
    for (me, succ) in [(&c, &a), (&a, &b), (&b, &c)] {
        let snap = net.hub(me).snapshot();
        assert_eq!(succ, &snap.successors[0].addr, "successor of {me}");
        assert_eq!(me, &net.hub(succ).snapshot().predecessors[0].addr);
        net.hub(me).reg.check_consistency();
    }
}

#[test]
fn leave_while_joining_fails_the_join() {
    let mut net = Net::new(config(), FixedSampler::default());
    let b = net.join("b", &"ghost".into());
    assert_eq!(HubStatus::Joining, net.hub(&b).status());

    net.with(&b, |h, ctx| h.leave(ctx, None));
    assert_eq!(HubStatus::Unjoined, net.hub(&b).status());
    assert!(net.effect(&b, |e| matches!(e, Effect::CancelAll)));
    assert!(net.effect(&b, |e| matches!(e, Effect::JoinFailed(MercError::Other { .. }))));
    assert!(net.effect(&b, |e| matches!(e, Effect::LeaveComplete)));
    assert_eq!(1, *net.app(&b).failed.lock().unwrap());

    // a late retry timer does nothing
    net.timer(&b, TimerKey::JoinRetry);
    assert_eq!(HubStatus::Unjoined, net.hub(&b).status());
}

#[test]
fn predecessor_is_never_a_next_hop() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let b = net.join("b", &a);
    let p = PeerAddr::from("p");
    let now = net.now;

    // a stale view: p starts closest below 250 but does not own it
    let hub = net.hubs.get_mut(&a).unwrap();
    hub.reg.register(&p, Some(r(100, 200)), now);
    hub.reg.set_front(&p, Role::Predecessor);
    hub.cache.clear();

    assert_eq!(None, hub.compute_next_hop(Value(250)));
    // b is successor as well as predecessor
    assert_eq!(Some(b), hub.compute_next_hop(Value(50)));
}

#[test]
fn each_ping_kind_keeps_its_own_role() {
    let mut net = Net::new(config(), FixedSampler::default());
    let a = net.found("a");
    let p = PeerAddr::from("p");
    let now = net.now;

    let hub = net.hubs.get_mut(&a).unwrap();
    hub.reg.register(&p, Some(r(0, 10)), now);
    hub.reg.add_role(&p, Role::Predecessor);
    hub.reg.add_role(&p, Role::ReverseLongNeighbor);

    // p keeps probing us as its long neighbor only
    net.now += net.config.peer_pong_timeout();
    net.with(&a, |h, ctx| {
        h.handle(
            ctx,
            p.clone(),
            0,
            Message::LivenessPing {
                succ: false,
                lnbr: true,
                seqno: 1,
                range: None,
            },
        )
    });
    net.now += Duration::from_secs(1);
    net.with(&a, |h, ctx| h.on_timer(ctx, TimerKey::PingPeers));

    let reg = &net.hub(&a).reg;
    assert!(!reg.has_role(&p, Role::Predecessor));
    assert!(reg.has_role(&p, Role::ReverseLongNeighbor));
    reg.check_consistency();
}
