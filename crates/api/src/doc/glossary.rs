//! A glossary of terms used in the Mercury overlay.
//!
//! ## Attribute
//! One indexed dimension of the data. Every attribute has a bounded
//! integer key space `[absMin, absMax]` and is identified on the wire by
//! an [AttrId](crate::AttrId).
//!
//! ## Hub
//! The ring of nodes partitioning one attribute's key space, and the
//! local state a node keeps about that ring. A node hosts one hub per
//! attribute it participates in. Hubs of different attributes share the
//! node's transport but nothing else.
//!
//! ## Range
//! The half-open slice `[min, max)` of a hub's key space owned by one
//! node. A range whose `min` is greater than its `max` wraps past
//! `absMax`. The node whose range ends at `absMax` is the rightmost node
//! and also owns `absMax` itself.
//!
//! ## Constraint
//! A closed interval `[min, max]` over one attribute carried by an event
//! or interest. Constraints never wrap.
//!
//! ## Rendezvous point
//! A node whose range overlaps an item's constraint on the hub the item
//! is routed through. Interests are stored and events are matched there.
//!
//! ## Successor, predecessor
//! The nodes owning the ranges immediately clockwise and
//! counter-clockwise of the local range. A node keeps a list of
//! successors so it can survive the failure of the nearest one.
//!
//! ## Long neighbor
//! A randomized long-distance link used to shorten routing paths. The
//! distance to each long neighbor is drawn by harmonic sampling: small
//! distances on a log scale are favored, giving the ring the small-world
//! property.
//!
//! ## Reverse long neighbor
//! A peer that holds the local node as its long neighbor. These peers
//! probe us, so we do not probe them.
//!
//! ## Epoch
//! A counter bumped on every long neighbor repair round. Responses
//! tagged with an older epoch are ignored.
//!
//! ## Trigger
//! An event stored at its rendezvous points for its lifetime so that
//! interests arriving later still see it.
//!
//! ## Leave-join
//! A graceful departure immediately followed by a join next to a heavily
//! loaded node. This is how the load balancer moves light nodes to where
//! the load is.
