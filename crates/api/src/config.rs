//! Types for use when configuring mercury modules.

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> MercResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| MercError::other_src("encode", e))?,
    )
    .map_err(|e| MercError::other_src("decode", e))
}

/// Denotes a type used to configure a specific mercury module.
///
/// A module config is a struct with a single camelCase field named after
/// the module, holding that module's parameters. This lets every module
/// write its own top-level section of one shared [Config].
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

impl<T> ModConfig for T where
    T: 'static
        + Sized
        + Default
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
{
}

/// Mercury configuration.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// Write the top-level sections of a module config into this config,
    /// replacing any sections of the same name.
    ///
    /// Factories call this from `default_config` with their defaults.
    /// Tests call it to override individual parameters.
    pub fn set_module_config<M: ModConfig>(
        &mut self,
        module_config: &M,
    ) -> MercResult<()> {
        let map: serde_json::Map<String, serde_json::Value> =
            tc(module_config)?;
        for (k, v) in map {
            self.0.insert(k, v);
        }
        Ok(())
    }

    /// Extract a module config. Sections missing from this config take
    /// the module's defaults. Unrelated sections are ignored.
    pub fn get_module_config<M: ModConfig>(&self) -> MercResult<M> {
        let mut map: serde_json::Map<String, serde_json::Value> =
            tc(&M::default())?;
        for (k, v) in map.iter_mut() {
            if let Some(set) = self.0.get(k) {
                merge(v, set);
            }
        }
        tc(&map)
    }
}

/// Overlay `set` onto `base`, keeping base values for absent keys.
fn merge(base: &mut serde_json::Value, set: &serde_json::Value) {
    match (base, set) {
        (serde_json::Value::Object(base), serde_json::Value::Object(set)) => {
            for (k, v) in set {
                match base.get_mut(k) {
                    Some(b) => merge(b, v),
                    None => {
                        base.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, set) => *base = set.clone(),
    }
}
