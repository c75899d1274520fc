use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::allocation::AllocResult;
use crate::allocation::allocator::{AllocFuture, Allocator, WorkerHandle};
use crate::allocation::probe::{CapabilityProbe, SystemProbe};
use crate::allocation::request::{ResourceKey, ResourceRequest};
use crate::allocation::score::{Criteria, Rating, Score};
use crate::worker::launcher::{ProcessLauncher, WorkerLauncher};

pub const LOCAL_ALLOCATOR_NAME: &str = "LocalAllocator";
pub const DEFAULT_TOTAL_CPUS: u32 = 1;
pub const DEFAULT_MAX_LOAD: f64 = 2.0;

/// Allocator that starts workers on a single host.
pub struct LocalAllocator {
    name: String,
    total_cpus: u32,
    max_load: f64,
    probe: Arc<dyn CapabilityProbe>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl LocalAllocator {
    pub fn new(
        name: String,
        total_cpus: u32,
        max_load: f64,
        probe: Arc<dyn CapabilityProbe>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            name,
            total_cpus,
            max_load,
            probe,
            launcher,
        }
    }

    /// Allocator of the current host that starts workers from the current executable.
    pub fn for_current_host() -> Self {
        Self::new(
            LOCAL_ALLOCATOR_NAME.to_string(),
            DEFAULT_TOTAL_CPUS,
            DEFAULT_MAX_LOAD,
            Arc::new(SystemProbe::new(BTreeMap::new(), None)),
            Arc::new(ProcessLauncher::current_exe()),
        )
    }

    pub fn total_cpus(&self) -> u32 {
        self.total_cpus
    }

    pub fn max_load(&self) -> f64 {
        self.max_load
    }

    /// Returns a refusal if some constraint of `request` cannot be met by this host.
    fn check_constraints(&self, request: &ResourceRequest) -> Option<Rating> {
        for key in request.keys() {
            let refused = match key {
                ResourceKey::LocalhostOnly => request.localhost_only() == Some(false),
                ResourceKey::MaxCpus => request
                    .max_cpus()
                    .is_some_and(|cpus| cpus > self.total_cpus),
                ResourceKey::RequiredDistributions => {
                    let missing = request
                        .required_distributions()
                        .map(|requirements| self.probe.missing_distributions(requirements))
                        .unwrap_or_default();
                    if !missing.is_empty() {
                        return Some(Rating::unsupported(
                            key.as_str(),
                            Value::from_iter(missing),
                        ));
                    }
                    false
                }
                ResourceKey::OrphanModules => {
                    let missing = request
                        .orphan_modules()
                        .map(|modules| self.probe.missing_modules(modules))
                        .unwrap_or_default();
                    if !missing.is_empty() {
                        return Some(Rating::unsupported(
                            key.as_str(),
                            Value::from_iter(missing),
                        ));
                    }
                    false
                }
                ResourceKey::RuntimeVersion => request
                    .runtime_version()
                    .is_some_and(|version| version != self.probe.runtime_version()),
            };
            if refused {
                let value = request.value_of(key).unwrap_or(Value::Null);
                return Some(Rating::unsupported(key.as_str(), value));
            }
        }
        None
    }

    fn rate_load(&self) -> Rating {
        let Some(load) = self.probe.load_average() else {
            return Rating::no_estimate();
        };
        log::debug!(
            "{}: load averages {:.2}, {:.2}, {:.2}, max load {:.2}",
            self.name,
            load.one,
            load.five,
            load.fifteen,
            self.max_load
        );
        let mut criteria = Criteria::new();
        criteria.insert(
            "loadavgs".to_string(),
            Value::from(vec![load.one, load.five, load.fifteen]),
        );
        criteria.insert("max_load".to_string(), Value::from(self.max_load));
        let score = if load.one < self.max_load {
            Score::NoEstimate
        } else {
            Score::Unavailable
        };
        Rating::new(score, criteria)
    }
}

impl Allocator for LocalAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate<'a>(&'a self, request: &'a ResourceRequest) -> AllocFuture<'a, Rating> {
        Box::pin(async move {
            match self.check_constraints(request) {
                Some(refusal) => refusal,
                None => self.rate_load(),
            }
        })
    }

    fn deploy<'a>(
        &'a self,
        name: &'a str,
        _request: &'a ResourceRequest,
    ) -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>> {
        self.launcher.launch(name)
    }
}
