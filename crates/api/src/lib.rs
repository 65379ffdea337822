#![deny(missing_docs)]
//! Mercury API contains the overlay module traits and the basic types
//! required to define the api of those traits.
//!
//! The overlay partitions one circular key space per attribute among the
//! participating nodes. Publications and subscriptions carry range
//! constraints over those attributes and are routed to the node(s) whose
//! range covers them.
//!
//! If you want to run a node, please see the mercury_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub mod app;
pub mod bootstrap;
pub mod builder;
pub mod config;
pub mod doc;
pub mod message;
pub mod sampler;
pub mod transport;

mod error;
pub use error::*;

pub mod id;
pub use id::{AttrId, PeerAddr};

mod value;
pub use value::*;

mod range;
pub use range::*;

mod item;
pub use item::*;
