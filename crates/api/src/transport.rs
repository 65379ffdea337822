//! Mercury transport related types.

use crate::*;
use std::sync::Arc;

/// Low-level frame delivery between overlay participants.
///
/// Sends are fire-and-forget: the future resolves once the frame was
/// handed to the backend. Delivery is at most once.
pub trait Transport: 'static + Send + Sync + std::fmt::Debug {
    /// The address peers use to reach this node.
    fn local_addr(&self) -> PeerAddr;

    /// Send one frame to a peer.
    fn send(
        &self,
        peer: PeerAddr,
        data: bytes::Bytes,
    ) -> BoxFut<'_, MercResult<()>>;
}

/// Trait-object [Transport].
pub type DynTransport = Arc<dyn Transport>;

/// Handler for transport events.
pub trait TxHandler: 'static + Send + Sync + std::fmt::Debug {
    /// A frame arrived from a peer. If this returns an error the frame
    /// is dropped.
    fn recv_data(&self, peer: PeerAddr, data: bytes::Bytes) -> MercResult<()>;

    /// A peer became unreachable.
    fn peer_disconnect(&self, peer: PeerAddr, reason: Option<String>) {
        drop((peer, reason));
    }
}

/// Trait-object [TxHandler].
pub type DynTxHandler = Arc<dyn TxHandler>;

/// A factory for constructing Transport instances.
pub trait TransportFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> MercResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> MercResult<()>;

    /// Construct a transport instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
        handler: DynTxHandler,
    ) -> BoxFut<'static, MercResult<DynTransport>>;
}

/// Trait-object [TransportFactory].
pub type DynTransportFactory = Arc<dyn TransportFactory>;
