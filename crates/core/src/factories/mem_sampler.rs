//! The mem sampler implementation provided by mercury_core.
//!
//! Estimates are read straight out of the [MemBootstrapFactory]
//! registry, so this sampler only makes sense next to the mem bootstrap
//! and shares its `testId`. Loads are reported through a process-global
//! table that tests fill with [MemSamplerFactory::set_load].
//!
//! [MemBootstrapFactory]: super::MemBootstrapFactory

use super::mem_bootstrap::{members, MemBootstrapModConfig};
use mercury_api::{config::*, sampler::*, *};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// The mem sampler implementation provided by mercury_core.
#[derive(Debug)]
pub struct MemSamplerFactory {}

impl MemSamplerFactory {
    /// Construct a new MemSamplerFactory.
    pub fn create() -> DynSamplerFactory {
        let out: DynSamplerFactory = Arc::new(MemSamplerFactory {});
        out
    }

    /// Report `load` for `addr` in the `attr` ring, for samplers whose
    /// test id is the current thread id.
    pub fn set_load(attr: AttrId, addr: PeerAddr, load: f64) {
        let test_id = format!("{:?}", std::thread::current().id());
        Self::set_load_for(&test_id, attr, addr, load);
    }

    /// Report `load` for `addr` under an explicit test id.
    pub fn set_load_for(test_id: &str, attr: AttrId, addr: PeerAddr, load: f64) {
        loads()
            .lock()
            .unwrap()
            .entry(test_id.into())
            .or_default()
            .insert((attr, addr), load);
    }

    /// Forget every load reported under the current thread id.
    pub fn clear_loads() {
        let test_id = format!("{:?}", std::thread::current().id());
        loads().lock().unwrap().remove(test_id.as_str());
    }
}

impl SamplerFactory for MemSamplerFactory {
    fn default_config(&self, _config: &mut Config) -> MercResult<()> {
        Ok(())
    }

    fn validate_config(&self, _config: &Config) -> MercResult<()> {
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, MercResult<DynSampler>> {
        Box::pin(async move {
            let config: MemBootstrapModConfig =
                builder.config.get_module_config()?;
            let out: DynSampler = Arc::new(MemSampler {
                test_id: config.mem_bootstrap.test_id.into_boxed_str().into(),
            });
            Ok(out)
        })
    }
}

type TestId = Arc<str>;
type LoadMap = HashMap<TestId, HashMap<(AttrId, PeerAddr), f64>>;

fn loads() -> &'static Mutex<LoadMap> {
    static LOADS: OnceLock<Mutex<LoadMap>> = OnceLock::new();
    LOADS.get_or_init(Default::default)
}

#[derive(Debug)]
struct MemSampler {
    test_id: TestId,
}

impl MemSampler {
    fn load_of(&self, attr: AttrId, addr: &PeerAddr) -> Option<f64> {
        loads()
            .lock()
            .unwrap()
            .get(&self.test_id)?
            .get(&(attr, addr.clone()))
            .copied()
    }
}

impl Sampler for MemSampler {
    fn estimate_node_count(&self, attr: AttrId) -> usize {
        members(&self.test_id, attr).len().max(1)
    }

    fn value_at_rank_distance(
        &self,
        attr: AttrId,
        origin: &NodeRange,
        distance: f64,
    ) -> Option<Value> {
        let ring = members(&self.test_id, attr);
        if ring.is_empty() {
            return None;
        }
        let n = ring.len();
        let at = ring
            .iter()
            .position(|(_, r)| r.min >= origin.min)
            .unwrap_or(0);
        let steps = ((distance * n as f64).round() as usize).clamp(1, n);
        Some(ring[(at + steps) % n].1.min)
    }

    fn current_load(&self, attr: AttrId, local: &PeerAddr) -> Option<f64> {
        self.load_of(attr, local)
    }

    fn neighborhood_load(
        &self,
        attr: AttrId,
        neighbor: &PeerAddr,
    ) -> Option<f64> {
        self.load_of(attr, neighbor)
    }

    fn load_samples(&self, attr: AttrId) -> Vec<LoadSample> {
        loads()
            .lock()
            .unwrap()
            .get(&self.test_id)
            .map(|m| {
                m.iter()
                    .filter(|((a, _), _)| *a == attr)
                    .map(|((_, addr), load)| LoadSample {
                        addr: addr.clone(),
                        load: *load,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mercury_api::bootstrap::Bootstrap;

    const A: AttrId = AttrId(0);

    fn r(min: u64, max: u64) -> NodeRange {
        NodeRange::new(A, Value(min), Value(max))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn estimates_follow_bootstrap() {
        let builder = Arc::new(
            crate::default_builder().with_default_config().unwrap(),
        );
        let boot = builder.bootstrap.create(builder.clone()).await.unwrap();
        let sampler = builder.sampler.create(builder.clone()).await.unwrap();

        assert_eq!(1, sampler.estimate_node_count(A));
        assert_eq!(None, sampler.value_at_rank_distance(A, &r(0, 10), 0.5));

        for (i, addr) in ["a", "b", "c", "d"].iter().enumerate() {
            let min = i as u64 * 25;
            boot.put(A, (*addr).into(), r(min, min + 25));
        }
        assert_eq!(4, sampler.estimate_node_count(A));

        // two nodes clockwise of [25, 50)
        assert_eq!(
            Some(Value(75)),
            sampler.value_at_rank_distance(A, &r(25, 50), 0.5)
        );
        // at least one step, wrapping past the top
        assert_eq!(
            Some(Value(0)),
            sampler.value_at_rank_distance(A, &r(75, 100), 0.0)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loads_are_per_test_and_attr() {
        let builder = Arc::new(
            crate::default_builder().with_default_config().unwrap(),
        );
        let sampler = builder.sampler.create(builder.clone()).await.unwrap();

        MemSamplerFactory::clear_loads();
        MemSamplerFactory::set_load(A, "a".into(), 3.0);
        MemSamplerFactory::set_load(AttrId(1), "a".into(), 9.0);
        MemSamplerFactory::set_load_for("elsewhere", A, "b".into(), 1.0);

        assert_eq!(Some(3.0), sampler.current_load(A, &"a".into()));
        assert_eq!(None, sampler.neighborhood_load(A, &"b".into()));
        assert_eq!(
            vec![LoadSample {
                addr: "a".into(),
                load: 3.0
            }],
            sampler.load_samples(A)
        );
    }
}
