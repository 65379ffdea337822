//! Application callbacks and routing policy hooks.

use crate::*;
use std::sync::Arc;

/// What a rendezvous node does with an arriving publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Drop it.
    Nuke,

    /// Match against stored subscriptions only.
    Match,

    /// Store as a trigger only.
    Store,

    /// Match, then store as a trigger.
    MatchAndStore,
}

impl EventAction {
    /// Whether stored subscriptions should be matched.
    pub fn matches(self) -> bool {
        matches!(self, Self::Match | Self::MatchAndStore)
    }

    /// Whether the event should be kept as a trigger.
    pub fn stores(self) -> bool {
        matches!(self, Self::Store | Self::MatchAndStore)
    }
}

/// What a rendezvous node does with an arriving subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestAction {
    /// Drop it.
    Nuke,

    /// Store it only.
    Store,

    /// Reply with matching triggers only.
    Trigger,

    /// Store it, then reply with matching triggers.
    StoreAndTrigger,
}

impl InterestAction {
    /// Whether the subscription should be kept.
    pub fn stores(self) -> bool {
        matches!(self, Self::Store | Self::StoreAndTrigger)
    }

    /// Whether stored triggers should be matched.
    pub fn triggers(self) -> bool {
        matches!(self, Self::Trigger | Self::StoreAndTrigger)
    }
}

/// Handler for events coming out of a mercury node.
///
/// All methods have defaults, so an application only overrides what
/// it cares about. Handlers run on the node's event loop and must not
/// block.
pub trait Application: 'static + Send + Sync + std::fmt::Debug {
    /// A join of the `attr` ring has started.
    fn join_begin(&self, attr: AttrId) {
        drop(attr);
    }

    /// The `attr` ring was joined. `succ` is our first successor, if any.
    fn join_end(&self, attr: AttrId, succ: Option<PeerAddr>) {
        drop((attr, succ));
    }

    /// Every join attempt went unanswered.
    fn join_failed(&self, attr: AttrId) {
        drop(attr);
    }

    /// A graceful leave has started.
    fn leave_begin(&self, attr: AttrId) {
        drop(attr);
    }

    /// A graceful leave finished.
    fn leave_end(&self, attr: AttrId) {
        drop(attr);
    }

    /// Our range grew.
    fn range_expanded(&self, old: NodeRange, new: NodeRange) {
        drop((old, new));
    }

    /// Our range shrank.
    fn range_contracted(&self, old: NodeRange, new: NodeRange) {
        drop((old, new));
    }

    /// A publication is about to be forwarded greedily. Return false to
    /// stop it here.
    fn event_route(&self, event: &Event, next: &PeerAddr) -> bool {
        drop((event, next));
        true
    }

    /// A subscription is about to be forwarded greedily. Return false to
    /// stop it here.
    fn interest_route(&self, interest: &Interest, next: &PeerAddr) -> bool {
        drop((interest, next));
        true
    }

    /// A publication is about to be passed along the successor chain.
    fn event_linear(&self, event: &Event, next: &PeerAddr) -> bool {
        drop((event, next));
        true
    }

    /// A subscription is about to be passed along the successor chain.
    fn interest_linear(&self, interest: &Interest, next: &PeerAddr) -> bool {
        drop((interest, next));
        true
    }

    /// A publication arrived at a rendezvous node.
    fn event_at_rendezvous(&self, event: &Event) -> EventAction {
        drop(event);
        EventAction::MatchAndStore
    }

    /// A subscription arrived at a rendezvous node.
    fn interest_at_rendezvous(&self, interest: &Interest) -> InterestAction {
        drop(interest);
        InterestAction::StoreAndTrigger
    }

    /// A publication matched some of our subscriptions.
    fn deliver(&self, event: Event, interests: Vec<u64>) {
        drop((event, interests));
    }

    /// Whether this node may leave and rejoin elsewhere to even out load.
    fn is_leave_join_ok(&self) -> bool {
        true
    }
}

/// Trait-object [Application].
pub type DynApplication = Arc<dyn Application>;

/// An [Application] that takes every default.
#[derive(Debug, Default)]
pub struct NoopApplication;

impl Application for NoopApplication {}
