//! The mercury node: one event loop owning a hub per attribute.
//!
//! All hub state lives inside a single actor task. Transport frames,
//! timer expiries and api calls are funneled into it through one
//! channel, so hub handlers never race each other. Effects requested by
//! the hubs are executed by the actor after each handler returns.

use crate::hub::*;
use mercury_api::{
    bootstrap::DynBootstrap, builder::Builder, message::*,
    transport::*, *,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// MercuryNode configuration types.
pub mod config {
    use mercury_api::*;
    use std::time::Duration;

    /// One attribute ring a node participates in.
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AttrConfig {
        /// Identifier carried on the wire.
        pub id: AttrId,

        /// Human readable name.
        pub name: String,

        /// Smallest key.
        pub abs_min: u64,

        /// Largest key.
        pub abs_max: u64,
    }

    impl AttrConfig {
        /// The key space of this attribute.
        pub fn space(&self) -> AttrSpace {
            AttrSpace::new(self.abs_min, self.abs_max)
        }
    }

    /// Configuration parameters for [MercuryNode](super::MercuryNode).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MercuryNodeConfig {
        /// The attribute rings this node hosts a hub for.
        ///
        /// Default: a single attribute 0 named "default" over
        /// `[0, u32::MAX]`.
        pub attributes: Vec<AttrConfig>,

        /// Join requests sent before giving up. Default: 25.
        pub max_join_attempts: u32,

        /// First join retry delay. Default: 2s.
        pub join_request_timeout_ms: u32,

        /// Growth of the join retry delay per attempt. Default: 1.2.
        pub join_backoff_factor: f32,

        /// Cap on the join retry delay. Default: 60s.
        pub max_join_backoff_ms: u32,

        /// Window for duplicate join and load balance requests.
        /// Default: 10s.
        pub tcp_failure_timeout_ms: u32,

        /// Successor stabilization period. Default: 1s.
        pub successor_maintenance_timeout_ms: u32,

        /// How long a long neighbor request may stay unanswered.
        /// Default: 1s.
        pub long_neighbor_response_timeout_ms: u32,

        /// How often long neighbors are rebuilt. Default: 30s.
        pub long_neighbor_repair_interval_ms: u32,

        /// How often successors and long neighbors are pinged.
        /// Default: 15s.
        pub peer_ping_interval_ms: u32,

        /// Silence after which a peer is dead. Default: 45s.
        pub peer_pong_timeout_ms: u32,

        /// Length of the successor list. Default: 10.
        pub n_successors_to_keep: u32,

        /// Hops after which routed messages are dropped. Default: 1000.
        pub max_message_ttl: u32,

        /// How often expired items are swept. Default: 1s.
        pub expiry_sweep_interval_ms: u32,

        /// Routing load window length. Default: 1s.
        pub load_aggregation_interval_ms: u32,

        /// How often load balance is considered. Default: 8s.
        pub check_load_balance_interval_ms: u32,

        /// How long a leave-join request may stay unanswered.
        /// Default: 60s.
        pub leave_join_response_timeout_ms: u32,

        /// How often a joined hub re-advertises itself with the
        /// bootstrap. Default: 5s.
        pub bootstrap_heartbeat_interval_ms: u32,

        /// Load ratio considered imbalanced. Default: 2.0.
        pub load_balance_delta: f64,

        /// Spread range publications and subscriptions right of the
        /// rendezvous in parallel instead of along the successor chain.
        /// Default: false.
        pub fanout_pubs: bool,

        /// Store publications as triggers for later subscriptions.
        /// Default: true.
        pub enable_pub_triggers: bool,

        /// Deliver a publication back to subscriptions of its creator.
        /// Default: false.
        pub send_back_pub: bool,

        /// Run the load balancer. Default: false.
        pub load_balancing: bool,
    }

    impl Default for MercuryNodeConfig {
        fn default() -> Self {
            Self {
                attributes: vec![AttrConfig {
                    id: AttrId(0),
                    name: "default".into(),
                    abs_min: 0,
                    abs_max: u32::MAX as u64,
                }],
                max_join_attempts: 25,
                join_request_timeout_ms: 2000,
                join_backoff_factor: 1.2,
                max_join_backoff_ms: 60_000,
                tcp_failure_timeout_ms: 10_000,
                successor_maintenance_timeout_ms: 1000,
                long_neighbor_response_timeout_ms: 1000,
                long_neighbor_repair_interval_ms: 30_000,
                peer_ping_interval_ms: 15_000,
                peer_pong_timeout_ms: 45_000,
                n_successors_to_keep: 10,
                max_message_ttl: 1000,
                expiry_sweep_interval_ms: 1000,
                load_aggregation_interval_ms: 1000,
                check_load_balance_interval_ms: 8000,
                leave_join_response_timeout_ms: 60_000,
                bootstrap_heartbeat_interval_ms: 5000,
                load_balance_delta: 2.0,
                fanout_pubs: false,
                enable_pub_triggers: true,
                send_back_pub: false,
                load_balancing: false,
            }
        }
    }

    fn ms(v: u32) -> Duration {
        Duration::from_millis(v as u64)
    }

    impl MercuryNodeConfig {
        /// Check the parameters for consistency.
        pub fn validate(&self) -> MercResult<()> {
            let fail = |msg: &str| Err(MercError::other(msg));
            if self.peer_ping_interval_ms >= self.peer_pong_timeout_ms {
                return fail("peerPingIntervalMs must be below peerPongTimeoutMs");
            }
            if self.max_join_attempts == 0 {
                return fail("maxJoinAttempts must be positive");
            }
            if self.n_successors_to_keep == 0 {
                return fail("nSuccessorsToKeep must be positive");
            }
            if self.max_message_ttl <= 5 {
                return fail("maxMessageTtl must be above 5");
            }
            if self.load_balance_delta <= 1.0 {
                return fail("loadBalanceDelta must be above 1.0");
            }
            if self.join_backoff_factor < 1.0 {
                return fail("joinBackoffFactor must be at least 1.0");
            }
            if self.attributes.is_empty() {
                return fail("at least one attribute is required");
            }
            for (i, a) in self.attributes.iter().enumerate() {
                if a.abs_min >= a.abs_max {
                    return Err(MercError::other(format!(
                        "attribute {} has an empty key space",
                        a.name
                    )));
                }
                if self.attributes[..i].iter().any(|b| b.id == a.id) {
                    return Err(MercError::other(format!(
                        "duplicate attribute id {}",
                        a.id
                    )));
                }
            }
            Ok(())
        }

        /// First join retry delay.
        pub fn join_request_timeout(&self) -> Duration {
            ms(self.join_request_timeout_ms)
        }

        /// Cap on the join retry delay.
        pub fn max_join_backoff(&self) -> Duration {
            ms(self.max_join_backoff_ms)
        }

        /// Duplicate request window.
        pub fn tcp_failure_timeout(&self) -> Duration {
            ms(self.tcp_failure_timeout_ms)
        }

        /// Successor stabilization period.
        pub fn successor_maintenance_timeout(&self) -> Duration {
            ms(self.successor_maintenance_timeout_ms)
        }

        /// Long neighbor request timeout.
        pub fn long_neighbor_response_timeout(&self) -> Duration {
            ms(self.long_neighbor_response_timeout_ms)
        }

        /// Long neighbor rebuild period.
        pub fn long_neighbor_repair_interval(&self) -> Duration {
            ms(self.long_neighbor_repair_interval_ms)
        }

        /// Ping period.
        pub fn peer_ping_interval(&self) -> Duration {
            ms(self.peer_ping_interval_ms)
        }

        /// Death timeout.
        pub fn peer_pong_timeout(&self) -> Duration {
            ms(self.peer_pong_timeout_ms)
        }

        /// Expiry sweep period.
        pub fn expiry_sweep_interval(&self) -> Duration {
            ms(self.expiry_sweep_interval_ms)
        }

        /// Routing load window.
        pub fn load_aggregation_interval(&self) -> Duration {
            ms(self.load_aggregation_interval_ms)
        }

        /// Load balance period.
        pub fn check_load_balance_interval(&self) -> Duration {
            ms(self.check_load_balance_interval_ms)
        }

        /// Leave-join request timeout.
        pub fn leave_join_response_timeout(&self) -> Duration {
            ms(self.leave_join_response_timeout_ms)
        }

        /// Bootstrap heartbeat period.
        pub fn bootstrap_heartbeat_interval(&self) -> Duration {
            ms(self.bootstrap_heartbeat_interval_ms)
        }
    }

    /// Module-level configuration for MercuryNode.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MercuryNodeModConfig {
        /// MercuryNode configuration.
        pub mercury_node: MercuryNodeConfig,
    }
}

pub use config::*;

type Res<T> = oneshot::Sender<MercResult<T>>;

enum Cmd {
    Recv(PeerAddr, Envelope),
    Disconnect(PeerAddr),
    Timer {
        attr: AttrId,
        key: TimerKey,
        generation: u64,
    },
    StartJoin {
        attr: AttrId,
        lookup: u64,
        rep: Option<PeerAddr>,
    },
    RetryLookup {
        attr: AttrId,
        lookup: u64,
    },
    Join(AttrId, Res<()>),
    Leave(AttrId, Res<()>),
    Publish(AttrId, Event, Res<()>),
    Subscribe(AttrId, Interest, Res<()>),
    Snapshot(AttrId, Res<HubSnapshot>),
}

type CmdSend = mpsc::UnboundedSender<Cmd>;
type CmdRecv = mpsc::UnboundedReceiver<Cmd>;

#[derive(Debug)]
struct NodeTxHandler {
    cmd_send: CmdSend,
}

impl TxHandler for NodeTxHandler {
    fn recv_data(&self, peer: PeerAddr, data: bytes::Bytes) -> MercResult<()> {
        let env = match Envelope::decode(&data) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(?err, %peer, "dropping undecodable frame");
                return Err(err);
            }
        };
        self.cmd_send
            .send(Cmd::Recv(peer, env))
            .map_err(|_| MercError::other("node closed"))
    }

    fn peer_disconnect(&self, peer: PeerAddr, reason: Option<String>) {
        tracing::debug!(%peer, ?reason, "peer disconnected");
        let _ = self.cmd_send.send(Cmd::Disconnect(peer));
    }
}

/// A participant in one or more attribute rings.
///
/// Dropping the node stops all of its tasks and withdraws it from the
/// bootstrap. Peers notice the departure through liveness probing; use
/// [MercuryNode::leave] for a graceful exit.
#[derive(Debug)]
pub struct MercuryNode {
    addr: PeerAddr,
    attrs: Vec<AttrId>,
    cmd_send: CmdSend,
    bootstrap: DynBootstrap,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _transport: DynTransport,
}

impl Drop for MercuryNode {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.abort();
        }
        for attr in self.attrs.iter() {
            self.bootstrap.remove(*attr, self.addr.clone());
        }
    }
}

impl MercuryNode {
    /// Construct a node from a builder. The node hosts an unjoined hub
    /// for every configured attribute.
    pub async fn create(builder: Arc<Builder>) -> MercResult<Self> {
        let config: MercuryNodeModConfig = builder.config.get_module_config()?;
        let config = Arc::new(config.mercury_node);
        config.validate()?;
        builder.validate_config()?;

        let (cmd_send, cmd_recv) = mpsc::unbounded_channel();
        let handler: DynTxHandler = Arc::new(NodeTxHandler {
            cmd_send: cmd_send.clone(),
        });
        let transport =
            builder.transport.create(builder.clone(), handler).await?;
        let bootstrap = builder.bootstrap.create(builder.clone()).await?;
        let sampler = builder.sampler.create(builder.clone()).await?;
        let addr = transport.local_addr();

        let mut hubs = HashMap::new();
        for attr in config.attributes.iter() {
            hubs.insert(
                attr.id,
                Hub::new(
                    attr.id,
                    attr.space(),
                    addr.clone(),
                    config.clone(),
                    builder.app.clone(),
                    sampler.clone(),
                ),
            );
        }
        let attrs = config.attributes.iter().map(|a| a.id).collect();

        let (out_send, out_recv) = mpsc::unbounded_channel();
        let send_task = tokio::task::spawn(send_task(
            transport.clone(),
            out_recv,
            cmd_send.clone(),
        ));

        let actor = Actor {
            me: addr.clone(),
            config,
            hubs,
            bootstrap: bootstrap.clone(),
            cmd_send: cmd_send.clone(),
            out_send,
            timers: HashMap::new(),
            next_generation: 1,
            tasks: tokio::task::JoinSet::new(),
            local: VecDeque::new(),
            lookups: HashMap::new(),
            join_waiters: HashMap::new(),
            leave_waiters: HashMap::new(),
        };
        let actor_task = tokio::task::spawn(actor.run(cmd_recv));

        tracing::info!(%addr, "mercury node started");

        Ok(Self {
            addr,
            attrs,
            cmd_send,
            bootstrap,
            tasks: vec![actor_task, send_task],
            _transport: transport,
        })
    }

    /// The address peers reach this node at.
    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    /// The attributes this node hosts hubs for.
    pub fn attrs(&self) -> &[AttrId] {
        &self.attrs
    }

    async fn call<T>(
        &self,
        f: impl FnOnce(Res<T>) -> Cmd,
    ) -> MercResult<T> {
        let (s, r) = oneshot::channel();
        self.cmd_send
            .send(f(s))
            .map_err(|_| MercError::other("node closed"))?;
        r.await.map_err(|_| MercError::other("node closed"))?
    }

    /// Join the `attr` ring through a representative from the
    /// bootstrap, founding the ring if there is none. Resolves once the
    /// hub owns a range.
    pub async fn join(&self, attr: AttrId) -> MercResult<()> {
        self.call(|s| Cmd::Join(attr, s)).await
    }

    /// Gracefully leave the `attr` ring, handing the range and stored
    /// items to the neighbors.
    pub async fn leave(&self, attr: AttrId) -> MercResult<()> {
        self.call(|s| Cmd::Leave(attr, s)).await
    }

    /// Publish an event, routed by its constraint on `attr`.
    pub async fn publish(&self, attr: AttrId, event: Event) -> MercResult<()> {
        self.call(|s| Cmd::Publish(attr, event, s)).await
    }

    /// Register a subscription, routed by its constraint on `attr`.
    pub async fn subscribe(
        &self,
        attr: AttrId,
        interest: Interest,
    ) -> MercResult<()> {
        self.call(|s| Cmd::Subscribe(attr, interest, s)).await
    }

    /// A point-in-time view of the `attr` hub.
    pub async fn snapshot(&self, attr: AttrId) -> MercResult<HubSnapshot> {
        self.call(|s| Cmd::Snapshot(attr, s)).await
    }
}

/// Frames are sent in order from one task, off the actor loop.
async fn send_task(
    transport: DynTransport,
    mut out_recv: mpsc::UnboundedReceiver<(PeerAddr, bytes::Bytes)>,
    cmd_send: CmdSend,
) {
    while let Some((peer, data)) = out_recv.recv().await {
        if let Err(err) = transport.send(peer.clone(), data).await {
            tracing::debug!(?err, %peer, "send failed");
            if cmd_send.send(Cmd::Disconnect(peer)).is_err() {
                break;
            }
        }
    }
}

struct Actor {
    me: PeerAddr,
    config: Arc<MercuryNodeConfig>,
    hubs: HashMap<AttrId, Hub>,
    bootstrap: DynBootstrap,
    cmd_send: CmdSend,
    out_send: mpsc::UnboundedSender<(PeerAddr, bytes::Bytes)>,
    timers: HashMap<(AttrId, TimerKey), u64>,
    next_generation: u64,
    tasks: tokio::task::JoinSet<()>,
    local: VecDeque<(AttrId, u32, Message)>,
    /// The representative lookup currently allowed to start a join.
    lookups: HashMap<AttrId, u64>,
    join_waiters: HashMap<AttrId, Vec<Res<()>>>,
    leave_waiters: HashMap<AttrId, Vec<Res<()>>>,
}

impl Actor {
    async fn run(mut self, mut cmd_recv: CmdRecv) {
        while let Some(cmd) = cmd_recv.recv().await {
            self.cmd(cmd);
            while let Some((attr, hop_count, msg)) = self.local.pop_front() {
                let me = self.me.clone();
                self.with_hub(attr, |hub, ctx| {
                    hub.handle(ctx, me, hop_count, msg)
                });
            }
            while self.tasks.try_join_next().is_some() {}
        }
    }

    /// Run `f` against the `attr` hub and execute the effects it
    /// requested. False if there is no such hub.
    fn with_hub(
        &mut self,
        attr: AttrId,
        f: impl FnOnce(&mut Hub, &mut Ctx),
    ) -> bool {
        let Some(hub) = self.hubs.get_mut(&attr) else {
            return false;
        };
        let mut ctx = Ctx::new(Instant::now());
        f(hub, &mut ctx);
        self.apply(attr, ctx.effects);
        true
    }

    fn cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Recv(from, env) => {
                let Envelope {
                    hub,
                    hop_count,
                    body,
                } = env;
                if !self.with_hub(hub, |h, ctx| {
                    h.handle(ctx, from.clone(), hop_count, body)
                }) {
                    tracing::warn!(%hub, %from, "message for unknown hub");
                }
            }
            Cmd::Disconnect(peer) => {
                let attrs: Vec<AttrId> = self.hubs.keys().copied().collect();
                for attr in attrs {
                    self.with_hub(attr, |h, ctx| h.peer_gone(ctx, &peer));
                }
            }
            Cmd::Timer {
                attr,
                key,
                generation,
            } => {
                if self.timers.get(&(attr, key)) != Some(&generation) {
                    return;
                }
                self.timers.remove(&(attr, key));
                self.with_hub(attr, |h, ctx| h.on_timer(ctx, key));
            }
            Cmd::StartJoin { attr, lookup, rep } => {
                if self.lookups.get(&attr) != Some(&lookup) {
                    tracing::debug!(%attr, lookup, "stale representative lookup");
                    return;
                }
                self.lookups.remove(&attr);
                self.with_hub(attr, |h, ctx| h.start_join(ctx, rep));
            }
            Cmd::RetryLookup { attr, lookup } => {
                if self.lookups.get(&attr) == Some(&lookup) {
                    self.find_representative(attr);
                }
            }
            Cmd::Join(attr, res) => {
                let Some(status) = self.hubs.get(&attr).map(Hub::status) else {
                    let _ = res.send(Err(MercError::UnknownAttr(attr)));
                    return;
                };
                match status {
                    HubStatus::Joined => {
                        let _ = res.send(Ok(()));
                    }
                    HubStatus::Joining => {
                        self.join_waiters.entry(attr).or_default().push(res);
                    }
                    HubStatus::Unjoined => {
                        let first = !self.join_waiters.contains_key(&attr);
                        self.join_waiters.entry(attr).or_default().push(res);
                        if first {
                            self.apply(attr, vec![Effect::FindRepresentative]);
                        }
                    }
                }
            }
            Cmd::Leave(attr, res) => {
                if !self.hubs.contains_key(&attr) {
                    let _ = res.send(Err(MercError::UnknownAttr(attr)));
                    return;
                }
                self.lookups.remove(&attr);
                self.leave_waiters.entry(attr).or_default().push(res);
                self.with_hub(attr, |h, ctx| h.leave(ctx, None));
            }
            Cmd::Publish(attr, event, res) => {
                let mut out = Err(MercError::UnknownAttr(attr));
                self.with_hub(attr, |h, ctx| out = h.publish(ctx, event));
                let _ = res.send(out);
            }
            Cmd::Subscribe(attr, interest, res) => {
                let mut out = Err(MercError::UnknownAttr(attr));
                self.with_hub(attr, |h, ctx| out = h.subscribe(ctx, interest));
                let _ = res.send(out);
            }
            Cmd::Snapshot(attr, res) => {
                let out = self
                    .hubs
                    .get(&attr)
                    .map(Hub::snapshot)
                    .ok_or(MercError::UnknownAttr(attr));
                let _ = res.send(out);
            }
        }
    }

    fn apply(&mut self, attr: AttrId, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, hop_count, msg } => {
                    self.send(attr, to, hop_count, msg)
                }
                Effect::Timer { key, after } => self.schedule(attr, key, after),
                Effect::Cancel(key) => {
                    self.timers.remove(&(attr, key));
                }
                Effect::CancelAll => {
                    self.timers.retain(|(a, _), _| *a != attr);
                }
                Effect::FindRepresentative => self.find_representative(attr),
                Effect::JoinComplete => {
                    for w in self.join_waiters.remove(&attr).unwrap_or_default()
                    {
                        let _ = w.send(Ok(()));
                    }
                }
                Effect::JoinFailed(err) => {
                    for w in self.join_waiters.remove(&attr).unwrap_or_default()
                    {
                        let _ = w.send(Err(err.clone()));
                    }
                }
                Effect::LeaveComplete => {
                    for w in
                        self.leave_waiters.remove(&attr).unwrap_or_default()
                    {
                        let _ = w.send(Ok(()));
                    }
                }
                Effect::Announce(range) => {
                    self.bootstrap.put(attr, self.me.clone(), range)
                }
                Effect::Withdraw => self.bootstrap.remove(attr, self.me.clone()),
            }
        }
    }

    fn send(&mut self, attr: AttrId, to: PeerAddr, hop_count: u32, msg: Message) {
        if to == self.me {
            self.local.push_back((attr, hop_count, msg));
            return;
        }
        let env = Envelope {
            hub: attr,
            hop_count,
            body: msg,
        };
        match env.encode() {
            Ok(data) => {
                let _ = self.out_send.send((to, data));
            }
            Err(err) => {
                tracing::warn!(?err, %to, "failed to encode message");
            }
        }
    }

    fn schedule(&mut self, attr: AttrId, key: TimerKey, after: std::time::Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timers.insert((attr, key), generation);
        let cmd_send = self.cmd_send.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(after).await;
            let _ = cmd_send.send(Cmd::Timer {
                attr,
                key,
                generation,
            });
        });
    }

    /// Look up a representative off the actor loop. Lookup errors are
    /// retried after a join request timeout. Only the latest lookup for
    /// an attribute may start a join, and a leave cancels it.
    fn find_representative(&mut self, attr: AttrId) {
        let lookup = self.next_generation;
        self.next_generation += 1;
        self.lookups.insert(attr, lookup);
        let bootstrap = self.bootstrap.clone();
        let me = self.me.clone();
        let cmd_send = self.cmd_send.clone();
        let retry = self.config.join_request_timeout();
        self.tasks.spawn(async move {
            match bootstrap.representative(attr, me).await {
                Ok(rep) => {
                    let _ = cmd_send.send(Cmd::StartJoin { attr, lookup, rep });
                }
                Err(err) => {
                    tracing::warn!(?err, %attr, "representative lookup failed");
                    tokio::time::sleep(retry).await;
                    let _ = cmd_send.send(Cmd::RetryLookup { attr, lookup });
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config_is_valid() {
        MercuryNodeConfig::default().validate().unwrap();
    }

    #[test]
    fn config_validation_rules() {
        let bad: Vec<fn(&mut MercuryNodeConfig)> = vec![
            |c| c.peer_ping_interval_ms = c.peer_pong_timeout_ms,
            |c| c.max_join_attempts = 0,
            |c| c.n_successors_to_keep = 0,
            |c| c.max_message_ttl = 5,
            |c| c.load_balance_delta = 1.0,
            |c| c.attributes.clear(),
            |c| c.attributes[0].abs_max = c.attributes[0].abs_min,
            |c| {
                let dup = c.attributes[0].clone();
                c.attributes.push(dup);
            },
        ];
        for f in bad {
            let mut c = MercuryNodeConfig::default();
            f(&mut c);
            assert!(c.validate().is_err(), "{c:?}");
        }
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let mut config = mercury_api::config::Config::default();
        config
            .set_module_config(&serde_json::json!({
                "mercuryNode": { "fanoutPubs": true, "maxMessageTtl": 64 }
            }))
            .unwrap();
        let c: MercuryNodeModConfig = config.get_module_config().unwrap();
        assert!(c.mercury_node.fanout_pubs);
        assert_eq!(64, c.mercury_node.max_message_ttl);
        assert_eq!(25, c.mercury_node.max_join_attempts);
        assert_eq!(1, c.mercury_node.attributes.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_attr_is_an_error() {
        let node = MercuryNode::create(
            crate::default_builder().with_default_config().unwrap().build(),
        )
            .await
            .unwrap();
        assert!(matches!(
            node.join(AttrId(9)).await,
            Err(MercError::UnknownAttr(AttrId(9)))
        ));
        assert!(node.snapshot(AttrId(9)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_before_join_fails() {
        let node = MercuryNode::create(
            crate::default_builder().with_default_config().unwrap().build(),
        )
            .await
            .unwrap();
        let event = Event {
            id: 1,
            creator: node.addr().clone(),
            constraints: vec![Constraint::point(AttrId(0), Value(5))],
            payload: bytes::Bytes::new(),
            lifetime_ms: 0,
        };
        assert!(node.publish(AttrId(0), event).await.is_err());
    }

    const A: AttrId = AttrId(0);

    fn builder(test_id: &str, config: MercuryNodeConfig) -> Arc<Builder> {
        let mut builder =
            crate::default_builder().with_default_config().unwrap();
        builder
            .config
            .set_module_config(&MercuryNodeModConfig {
                mercury_node: config,
            })
            .unwrap();
        builder
            .config
            .set_module_config(&serde_json::json!({
                "memBootstrap": { "testId": test_id }
            }))
            .unwrap();
        builder.build()
    }

    /// Advertise a member nobody can reach.
    async fn plant_ghost(builder: &Arc<Builder>) {
        let boot = builder.bootstrap.create(builder.clone()).await.unwrap();
        boot.put(A, "ghost".into(), NodeRange::new(A, Value(0), Value(100)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn leave_during_lookup_cancels_join() {
        let node = MercuryNode::create(builder(
            "node-leave-during-lookup",
            MercuryNodeConfig::default(),
        ))
        .await
        .unwrap();

        // the lookup answers after the leave, and must not found a ring
        let (joined, left) = tokio::join!(node.join(A), node.leave(A));
        assert!(joined.is_err());
        left.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = node.snapshot(A).await.unwrap();
        assert_eq!(HubStatus::Unjoined, snap.status);
        assert!(snap.range.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leave_while_joining_fails_join() {
        let builder = builder(
            "node-leave-while-joining",
            MercuryNodeConfig::default(),
        );
        plant_ghost(&builder).await;
        let node = MercuryNode::create(builder).await.unwrap();

        let (joined, left) = tokio::time::timeout(
            Duration::from_secs(3),
            async {
                tokio::join!(node.join(A), async {
                    mercury_test_utils::iter_check!(1000, {
                        let snap = node.snapshot(A).await.unwrap();
                        if snap.status == HubStatus::Joining {
                            break;
                        }
                    });
                    node.leave(A).await
                })
            },
        )
        .await
        .unwrap();

        assert!(joined.is_err());
        left.unwrap();
        assert_eq!(
            HubStatus::Unjoined,
            node.snapshot(A).await.unwrap().status
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_representative_exhausts_join() {
        let builder = builder(
            "node-join-exhausted",
            MercuryNodeConfig {
                max_join_attempts: 2,
                join_request_timeout_ms: 50,
                ..Default::default()
            },
        );
        plant_ghost(&builder).await;
        let node = MercuryNode::create(builder).await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), node.join(A))
            .await
            .unwrap();
        assert!(matches!(
            res,
            Err(MercError::JoinExhausted { attempts: 2, .. })
        ));
        assert_eq!(
            HubStatus::Unjoined,
            node.snapshot(A).await.unwrap().status
        );
    }
}
