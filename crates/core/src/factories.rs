//! Factories for generating instances of Mercury modules.

mod mem_transport;
pub use mem_transport::*;

pub mod mem_bootstrap;
pub use mem_bootstrap::MemBootstrapFactory;

mod mem_sampler;
pub use mem_sampler::*;
