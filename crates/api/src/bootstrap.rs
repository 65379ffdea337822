//! Mercury bootstrap related types.

use crate::*;
use std::sync::Arc;

/// Rendezvous helper used to find a ring member to join through.
///
/// Nodes that are part of a ring advertise themselves with [Bootstrap::put]
/// on a heartbeat, so stale entries age out on their own.
pub trait Bootstrap: 'static + Send + Sync + std::fmt::Debug {
    /// Pick a current member of the `attr` ring, other than `exclude`.
    fn representative(
        &self,
        attr: AttrId,
        exclude: PeerAddr,
    ) -> BoxFut<'_, MercResult<Option<PeerAddr>>>;

    /// Advertise `addr` as a member of the `attr` ring owning `range`.
    fn put(&self, attr: AttrId, addr: PeerAddr, range: NodeRange);

    /// Withdraw an advertisement.
    fn remove(&self, attr: AttrId, addr: PeerAddr);
}

/// Trait-object [Bootstrap].
pub type DynBootstrap = Arc<dyn Bootstrap>;

/// A factory for constructing Bootstrap instances.
pub trait BootstrapFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> MercResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> MercResult<()>;

    /// Construct a bootstrap instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, MercResult<DynBootstrap>>;
}

/// Trait-object [BootstrapFactory].
pub type DynBootstrapFactory = Arc<dyn BootstrapFactory>;
