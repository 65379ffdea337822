#![deny(missing_docs)]
//! Mercury attribute pub/sub overlay core.
//!
//! A [MercuryNode] joins one ring per configured attribute, stores
//! subscriptions at the nodes whose ranges they cover, and routes
//! publications to those rendezvous points.

use mercury_api::{app::NoopApplication, builder::Builder, config::Config};

/// Construct a default builder wired to the in-process modules.
///
/// - `app` - The default application is [NoopApplication].
/// - `transport` - The default transport is [factories::MemTransportFactory].
/// - `bootstrap` - The default bootstrap is [factories::MemBootstrapFactory].
/// - `sampler` - The default sampler is [factories::MemSamplerFactory].
pub fn default_builder() -> Builder {
    Builder {
        config: Config::default(),
        app: std::sync::Arc::new(NoopApplication),
        transport: factories::MemTransportFactory::create(),
        bootstrap: factories::MemBootstrapFactory::create(),
        sampler: factories::MemSamplerFactory::create(),
    }
}

mod hub;
pub use hub::{HubSnapshot, HubStatus};

mod node;
pub use node::*;

pub mod factories;
