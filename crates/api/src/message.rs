//! Mercury wire protocol types.
//!
//! Every frame is an [Envelope] addressed to one attribute hub. The body
//! is a tagged [Message] so that handlers can dispatch with one `match`.

use crate::*;

/// A frame as it travels over the transport.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The attribute ring this message belongs to.
    pub hub: AttrId,

    /// Number of overlay hops taken so far. Only routed messages grow it.
    pub hop_count: u32,

    /// The message itself.
    pub body: Message,
}

impl Envelope {
    /// Construct a fresh envelope.
    pub fn new(hub: AttrId, body: Message) -> Self {
        Self {
            hub,
            hop_count: 0,
            body,
        }
    }

    /// Encode for the transport.
    pub fn encode(&self) -> MercResult<bytes::Bytes> {
        serde_json::to_vec(self)
            .map(bytes::Bytes::from)
            .map_err(|e| MercError::other_src("encode envelope", e))
    }

    /// Decode a frame received from the transport.
    pub fn decode(data: &[u8]) -> MercResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| MercError::other_src("decode envelope", e))
    }
}

/// A peer reference carried inside protocol messages.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerInfo {
    /// Where the peer can be reached.
    pub addr: PeerAddr,

    /// The range the peer claims.
    pub range: NodeRange,
}

/// Answer to a [Message::JoinRequest].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum JoinResponse {
    /// The representative is not part of a ring. Try again later.
    Unjoined,

    /// The representative gave up part of its range.
    #[serde(rename_all = "camelCase")]
    Accepted {
        /// The range handed to the joiner.
        assigned: NodeRange,

        /// The responder first, then its successors.
        successors: Vec<PeerInfo>,

        /// The responder had no successor of its own.
        only_node: bool,
    },
}

/// How a routed item should be handled by the next node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RouteMode {
    /// Still looking for the rendezvous node; route by next-hop.
    Greedy,

    /// Past the rendezvous node; walk the successor chain.
    Linear,

    /// Sent in parallel by the rendezvous node. The receiver handles the
    /// sub-range ending at `stop` and fans out itself if it reaches
    /// further right.
    Fanout {
        /// The last key this copy is responsible for.
        stop: Value,
    },
}

/// Every message understood by a hub.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Ask a ring member for a piece of its range.
    JoinRequest,

    /// Reply to a join request.
    JoinResponse(JoinResponse),

    /// "I believe I am your predecessor."
    NotifySuccessor {
        /// The sender's range.
        range: NodeRange,
    },

    /// Ask a successor who it believes its predecessor is.
    GetPredecessor,

    /// Reply to [Message::GetPredecessor].
    PredecessorInfo {
        /// The responder's predecessor, if it has one.
        pred: Option<PeerInfo>,

        /// The responder's range.
        range: NodeRange,
    },

    /// Ask a successor for its successor list.
    GetSuccessorList,

    /// Reply to [Message::GetSuccessorList]. The responder comes first.
    SuccessorList {
        /// The ordered list.
        list: Vec<PeerInfo>,
    },

    /// The sender is leaving and drops all links to the receiver.
    LinkBreak,

    /// Active liveness probe.
    #[serde(rename_all = "camelCase")]
    LivenessPing {
        /// The receiver is the sender's successor.
        succ: bool,

        /// The receiver is the sender's long neighbor.
        lnbr: bool,

        /// Probe sequence number, echoed in the pong.
        seqno: u8,

        /// The sender's range.
        range: Option<NodeRange>,
    },

    /// Answer to a ping. Without a seqno this is an unsolicited
    /// range update.
    LivenessPong {
        /// Echoed probe sequence number.
        seqno: Option<u8>,

        /// The responder's range.
        range: Option<NodeRange>,
    },

    /// Greedily routed request for a long-distance contact.
    #[serde(rename_all = "camelCase")]
    NeighborRequest {
        /// The node that wants a long neighbor.
        origin: PeerAddr,

        /// The origin's range.
        origin_range: NodeRange,

        /// The key the contact should own.
        target: Value,

        /// The origin's repair round.
        epoch: u32,

        /// Identifies the outstanding request.
        nonce: u32,
    },

    /// Sent directly to the origin by the node owning the target.
    NeighborResponse {
        /// The responder's range.
        range: NodeRange,

        /// Echoed repair round.
        epoch: u32,

        /// Echoed request identifier.
        nonce: u32,
    },

    /// The sender is leaving and hands its range and items over.
    LeaveNotification {
        /// The receiver's new range.
        range: NodeRange,

        /// Subscriptions to absorb.
        interests: Vec<StoredInterest>,

        /// Triggers to absorb.
        events: Vec<StoredEvent>,
    },

    /// A routed publication.
    Publication {
        /// The event.
        event: Event,

        /// Routing phase.
        mode: RouteMode,
    },

    /// A routed subscription.
    Subscription {
        /// The subscription.
        interest: Interest,

        /// Routing phase.
        mode: RouteMode,
    },

    /// Delivered to a subscriber when an event matched.
    MatchedPublication {
        /// The matched event.
        event: Event,

        /// Ids of the receiver's interests that matched.
        interests: Vec<u64>,
    },

    /// Bulk subscription handover after a range change.
    SubscriptionList {
        /// Subscriptions with their remaining lifetime.
        interests: Vec<StoredInterest>,
    },

    /// Bulk trigger handover after a range change.
    TriggerList {
        /// Triggers with their remaining lifetime.
        events: Vec<StoredEvent>,
    },

    /// A lighter neighbor offers to take part of the receiver's range.
    LocalLoadBalanceRequest {
        /// The sender's range.
        range: NodeRange,

        /// The sender's load.
        load: f64,
    },

    /// Answer to a local load balance request.
    #[serde(rename_all = "camelCase")]
    LocalLoadBalanceResponse {
        /// The responder's new range.
        peer_new_range: NodeRange,

        /// The requester's new range.
        assigned_range: NodeRange,

        /// The responder's load after the shift.
        new_load: f64,
    },

    /// A heavy node asks a light one to leave and rejoin next to it.
    LeaveJoinLoadBalanceRequest {
        /// The sender's range.
        range: NodeRange,

        /// The sender's load.
        load: f64,
    },

    /// The light node refused.
    LeaveJoinDenial,

    /// Ask a successor whether it can absorb our range.
    LeaveCheckRequest,

    /// Answer to [Message::LeaveCheckRequest].
    LeaveCheckResponse {
        /// Whether the leave may proceed.
        ok: bool,
    },
}

impl Message {
    /// Publications and subscriptions are routed through the overlay.
    pub fn is_routed(&self) -> bool {
        matches!(
            self,
            Message::Publication { .. }
                | Message::Subscription { .. }
                | Message::NeighborRequest { .. }
        )
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::JoinRequest => "JoinRequest",
            Message::JoinResponse(_) => "JoinResponse",
            Message::NotifySuccessor { .. } => "NotifySuccessor",
            Message::GetPredecessor => "GetPredecessor",
            Message::PredecessorInfo { .. } => "PredecessorInfo",
            Message::GetSuccessorList => "GetSuccessorList",
            Message::SuccessorList { .. } => "SuccessorList",
            Message::LinkBreak => "LinkBreak",
            Message::LivenessPing { .. } => "LivenessPing",
            Message::LivenessPong { .. } => "LivenessPong",
            Message::NeighborRequest { .. } => "NeighborRequest",
            Message::NeighborResponse { .. } => "NeighborResponse",
            Message::LeaveNotification { .. } => "LeaveNotification",
            Message::Publication { .. } => "Publication",
            Message::Subscription { .. } => "Subscription",
            Message::MatchedPublication { .. } => "MatchedPublication",
            Message::SubscriptionList { .. } => "SubscriptionList",
            Message::TriggerList { .. } => "TriggerList",
            Message::LocalLoadBalanceRequest { .. } => {
                "LocalLoadBalanceRequest"
            }
            Message::LocalLoadBalanceResponse { .. } => {
                "LocalLoadBalanceResponse"
            }
            Message::LeaveJoinLoadBalanceRequest { .. } => {
                "LeaveJoinLoadBalanceRequest"
            }
            Message::LeaveJoinDenial => "LeaveJoinDenial",
            Message::LeaveCheckRequest => "LeaveCheckRequest",
            Message::LeaveCheckResponse { .. } => "LeaveCheckResponse",
        }
    }
}

/// A subscription being handed over, with the lifetime it has left.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredInterest {
    /// The subscription.
    pub interest: Interest,

    /// Remaining lifetime.
    pub remaining_ms: u32,
}

/// A trigger being handed over, with the lifetime it has left.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// The publication.
    pub event: Event,

    /// Remaining lifetime.
    pub remaining_ms: u32,
}
