//! Mercury sampling oracle types.
//!
//! The overlay never measures the whole ring itself. Population, key
//! density and load estimates come from a [Sampler].

use crate::*;
use std::sync::Arc;

/// One node's reported load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSample {
    /// The sampled node.
    pub addr: PeerAddr,

    /// Its load.
    pub load: f64,
}

/// Estimates of global ring properties.
pub trait Sampler: 'static + Send + Sync + std::fmt::Debug {
    /// Estimated number of nodes in the `attr` ring.
    fn estimate_node_count(&self, attr: AttrId) -> usize;

    /// The key roughly `distance` nodes clockwise from `origin`.
    ///
    /// `distance` is a fraction of the ring population. `None` when no
    /// estimate is available.
    fn value_at_rank_distance(
        &self,
        attr: AttrId,
        origin: &NodeRange,
        distance: f64,
    ) -> Option<Value>;

    /// Override for the local node's load. `None` means the hub's own
    /// routing load count is used.
    fn current_load(&self, attr: AttrId, local: &PeerAddr) -> Option<f64>;

    /// The load most recently reported by a neighbor.
    fn neighborhood_load(&self, attr: AttrId, neighbor: &PeerAddr)
        -> Option<f64>;

    /// Recent load samples from across the ring.
    fn load_samples(&self, attr: AttrId) -> Vec<LoadSample>;
}

/// Trait-object [Sampler].
pub type DynSampler = Arc<dyn Sampler>;

/// A factory for constructing Sampler instances.
pub trait SamplerFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> MercResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> MercResult<()>;

    /// Construct a sampler instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, MercResult<DynSampler>>;
}

/// Trait-object [SamplerFactory].
pub type DynSamplerFactory = Arc<dyn SamplerFactory>;
