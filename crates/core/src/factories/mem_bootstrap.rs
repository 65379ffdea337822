//! The mem bootstrap implementation provided by mercury_core.

use mercury_api::{bootstrap::*, config::*, *};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// MemBootstrap configuration types.
mod config {
    /// Configuration parameters for [MemBootstrapFactory](super::MemBootstrapFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MemBootstrapConfig {
        /// Since rust test runs multiple tests in the same process,
        /// we cannot just have a single global bootstrap test store.
        /// This defaults to the current thread id when this config instance
        /// is constructed. This should be sufficient for most needs.
        /// However, if you are creating mercury nodes in tests from
        /// different tasks, you may need to pick an explicit id for this value.
        pub test_id: String,

        /// How long an advertisement stays valid without a refresh.
        ///
        /// Default: 60s.
        pub entry_ttl_ms: u32,
    }

    impl Default for MemBootstrapConfig {
        fn default() -> Self {
            Self {
                test_id: format!("{:?}", std::thread::current().id()),
                entry_ttl_ms: 60_000,
            }
        }
    }

    /// Module-level configuration for MemBootstrap.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MemBootstrapModConfig {
        /// MemBootstrap configuration.
        pub mem_bootstrap: MemBootstrapConfig,
    }
}

pub use config::*;

/// The mem bootstrap implementation provided by mercury_core.
/// Ring members are shared through a process-global registry.
#[derive(Debug)]
pub struct MemBootstrapFactory {}

impl MemBootstrapFactory {
    /// Construct a new MemBootstrapFactory.
    pub fn create() -> DynBootstrapFactory {
        let out: DynBootstrapFactory = Arc::new(MemBootstrapFactory {});
        out
    }
}

impl BootstrapFactory for MemBootstrapFactory {
    fn default_config(&self, config: &mut Config) -> MercResult<()> {
        config.set_module_config(&MemBootstrapModConfig::default())
    }

    fn validate_config(&self, config: &Config) -> MercResult<()> {
        let config: MemBootstrapModConfig = config.get_module_config()?;
        if config.mem_bootstrap.entry_ttl_ms == 0 {
            return Err(MercError::other("entryTtlMs must be positive"));
        }
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, MercResult<DynBootstrap>> {
        Box::pin(async move {
            let config: MemBootstrapModConfig =
                builder.config.get_module_config()?;
            let out: DynBootstrap =
                Arc::new(MemBootstrap::new(config.mem_bootstrap));
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct MemBootstrap {
    test_id: TestId,
    ttl: Duration,
}

impl MemBootstrap {
    fn new(config: MemBootstrapConfig) -> Self {
        Self {
            test_id: config.test_id.into_boxed_str().into(),
            ttl: Duration::from_millis(config.entry_ttl_ms as u64),
        }
    }
}

impl Bootstrap for MemBootstrap {
    fn representative(
        &self,
        attr: AttrId,
        exclude: PeerAddr,
    ) -> BoxFut<'_, MercResult<Option<PeerAddr>>> {
        Box::pin(async move {
            let candidates: Vec<PeerAddr> = members(&self.test_id, attr)
                .into_iter()
                .filter(|(addr, _)| addr != &exclude)
                .map(|(addr, _)| addr)
                .collect();
            Ok(candidates.choose(&mut rand::thread_rng()).cloned())
        })
    }

    fn put(&self, attr: AttrId, addr: PeerAddr, range: NodeRange) {
        let expires_at = Instant::now() + self.ttl;
        stat_process(&self.test_id, attr, |store| {
            store.retain(|e| e.addr != addr);
            store.push(Entry {
                addr,
                range,
                expires_at,
            });
        });
    }

    fn remove(&self, attr: AttrId, addr: PeerAddr) {
        stat_process(&self.test_id, attr, |store| {
            store.retain(|e| e.addr != addr)
        });
    }
}

#[derive(Debug, Clone)]
struct Entry {
    addr: PeerAddr,
    range: NodeRange,
    expires_at: Instant,
}

type TestId = Arc<str>;
type Store = Vec<Entry>;
type AttrMap = HashMap<AttrId, Store>;
type TestMap = HashMap<TestId, AttrMap>;
static STAT: std::sync::OnceLock<Mutex<TestMap>> = std::sync::OnceLock::new();

/// Run `f` on the live entries of one ring.
fn stat_process<R>(
    test_id: &TestId,
    attr: AttrId,
    f: impl FnOnce(&mut Store) -> R,
) -> R {
    let mut lock = STAT.get_or_init(Default::default).lock().unwrap();
    let store = lock
        .entry(test_id.clone())
        .or_default()
        .entry(attr)
        .or_default();
    let now = Instant::now();
    store.retain(|e| e.expires_at > now);
    f(store)
}

/// Live advertisements of the `attr` ring, sorted by range start.
pub(crate) fn members(
    test_id: &TestId,
    attr: AttrId,
) -> Vec<(PeerAddr, NodeRange)> {
    let mut out: Vec<(PeerAddr, NodeRange)> = stat_process(test_id, attr, |s| {
        s.iter().map(|e| (e.addr.clone(), e.range)).collect()
    });
    out.sort_by(|a, b| a.1.min.cmp(&b.1.min));
    out
}
