//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The general mercury builder.
/// This contains both configuration and factory instances,
/// allowing construction of runtime module instances.
#[derive(Debug)]
pub struct Builder {
    /// The module configuration to be used when building modules.
    /// This can be loaded from disk or modified before freezing the builder.
    pub config: config::Config,

    /// The [app::Application] receiving node callbacks.
    pub app: app::DynApplication,

    /// The [transport::TransportFactory] to be used for creating
    /// [transport::Transport] instances.
    pub transport: transport::DynTransportFactory,

    /// The [bootstrap::BootstrapFactory] to be used for creating
    /// [bootstrap::Bootstrap] instances.
    pub bootstrap: bootstrap::DynBootstrapFactory,

    /// The [sampler::SamplerFactory] to be used for creating
    /// [sampler::Sampler] instances.
    pub sampler: sampler::DynSamplerFactory,
}

impl Builder {
    /// Construct a default config given the configured module factories.
    /// Note, this should be called before freezing the Builder instance
    /// in an Arc<>.
    pub fn set_default_config(&mut self) -> MercResult<()> {
        let Self {
            config,
            app: _,
            transport,
            bootstrap,
            sampler,
        } = self;

        transport.default_config(config)?;
        bootstrap.default_config(config)?;
        sampler.default_config(config)?;

        Ok(())
    }

    /// Chainable form of [Builder::set_default_config].
    pub fn with_default_config(mut self) -> MercResult<Self> {
        self.set_default_config()?;
        Ok(self)
    }

    /// Validate the current configuration.
    pub fn validate_config(&self) -> MercResult<()> {
        self.transport.validate_config(&self.config)?;
        self.bootstrap.validate_config(&self.config)?;
        self.sampler.validate_config(&self.config)?;

        Ok(())
    }

    /// Freeze the builder so module factories can share it.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}
