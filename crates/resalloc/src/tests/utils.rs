use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use derive_builder::Builder;

use crate::allocation::AllocResult;
use crate::allocation::allocator::{AllocFuture, Allocator, WorkerHandle};
use crate::allocation::cluster::{ClusterTransport, HostContext, MachineDescriptor};
use crate::allocation::request::ResourceRequest;
use crate::allocation::score::{Criteria, Rating, Score};
use crate::worker::launcher::WorkerLauncher;

#[derive(Copy, Clone)]
enum CleanupBehavior {
    Succeed,
    Fail,
    Panic,
}

/// Worker that only counts how many times it was cleaned up.
pub struct TestWorker {
    name: String,
    host: String,
    behavior: CleanupBehavior,
    cleanups: Arc<AtomicUsize>,
}

impl TestWorker {
    pub fn new(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            behavior: CleanupBehavior::Succeed,
            cleanups: Default::default(),
        }
    }

    pub fn failing_cleanup(mut self) -> Self {
        self.behavior = CleanupBehavior::Fail;
        self
    }

    pub fn panicking_cleanup(mut self) -> Self {
        self.behavior = CleanupBehavior::Panic;
        self
    }

    pub fn cleanup_counter(&self) -> Arc<AtomicUsize> {
        self.cleanups.clone()
    }
}

impl WorkerHandle for TestWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn cleanup(&self) -> AllocFuture<'_, AllocResult<()>> {
        Box::pin(async move {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                CleanupBehavior::Succeed => Ok(()),
                CleanupBehavior::Fail => Err(anyhow!("cleanup of {} failed", self.name)),
                CleanupBehavior::Panic => panic!("cleanup of {} panicked", self.name),
            }
        })
    }
}

/// Allocator with scripted ratings and deployments.
#[derive(Builder)]
#[builder(name = "TestAllocatorBuilder", pattern = "owned", build_fn(name = "finish"))]
pub struct TestAllocatorSpec {
    #[builder(default = "\"test\".to_string()", setter(into))]
    name: String,
    /// Scores returned by successive ratings. The last one repeats.
    #[builder(default = "vec![Score::NoEstimate]")]
    scores: Vec<Score>,
    /// Number of deployments that fail before deployments start to succeed.
    #[builder(default)]
    failing_deploys: usize,
    #[builder(default)]
    panic_on_deploy: bool,
    #[builder(default)]
    panic_on_rate: bool,
    #[builder(default)]
    deploy_delay: Option<Duration>,
    #[builder(default = "\"testhost\".to_string()", setter(into))]
    host: String,
}

impl TestAllocatorBuilder {
    pub fn score(self, score: Score) -> Self {
        self.scores(vec![score])
    }

    pub fn build(self) -> Arc<TestAllocator> {
        Arc::new(TestAllocator {
            spec: self.finish().unwrap(),
            rate_calls: Default::default(),
            deploy_calls: Default::default(),
            deployed: Default::default(),
        })
    }
}

pub struct TestAllocator {
    spec: TestAllocatorSpec,
    rate_calls: AtomicUsize,
    deploy_calls: AtomicUsize,
    deployed: Mutex<Vec<String>>,
}

impl TestAllocator {
    pub fn rate_calls(&self) -> usize {
        self.rate_calls.load(Ordering::SeqCst)
    }

    pub fn deploy_calls(&self) -> usize {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    pub fn deployed_names(&self) -> Vec<String> {
        self.deployed.lock().unwrap().clone()
    }
}

impl Allocator for TestAllocator {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn rate<'a>(&'a self, _request: &'a ResourceRequest) -> AllocFuture<'a, Rating> {
        Box::pin(async move {
            let call = self.rate_calls.fetch_add(1, Ordering::SeqCst);
            if self.spec.panic_on_rate {
                panic!("rating of {} panicked", self.spec.name);
            }
            let scores = &self.spec.scores;
            let score = scores[call.min(scores.len() - 1)];
            let mut criteria = Criteria::new();
            criteria.insert("allocator".to_string(), self.spec.name.clone().into());
            Rating::new(score, criteria)
        })
    }

    fn deploy<'a>(
        &'a self,
        name: &'a str,
        _request: &'a ResourceRequest,
    ) -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>> {
        Box::pin(async move {
            let call = self.deploy_calls.fetch_add(1, Ordering::SeqCst);
            self.deployed.lock().unwrap().push(name.to_string());
            if self.spec.panic_on_deploy {
                panic!("deployment of {name} panicked");
            }
            if let Some(delay) = self.spec.deploy_delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.spec.failing_deploys {
                return Err(anyhow!("deployment of {name} failed"));
            }
            Ok(Box::new(TestWorker::new(name, &self.spec.host)) as Box<dyn WorkerHandle>)
        })
    }
}

/// Launcher that records launched names and returns [`TestWorker`]s.
pub struct RecordingLauncher {
    host: String,
    launched: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            launched: Default::default(),
        }
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn launch<'a>(
        &'a self,
        name: &'a str,
    ) -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>> {
        Box::pin(async move {
            self.launched.lock().unwrap().push(name.to_string());
            Ok(Box::new(TestWorker::new(name, &self.host)) as Box<dyn WorkerHandle>)
        })
    }
}

/// Transport whose hosts create [`TestAllocator`]s reporting the machine hostname as their host.
#[derive(Default)]
pub struct FakeTransport {
    shared_address: Option<String>,
    creation_delay: Option<Duration>,
    failing_connects: HashSet<String>,
    failing_creates: HashSet<String>,
    created: Arc<AtomicUsize>,
}

impl FakeTransport {
    /// All hosts report `address`, so they resolve to the same host identity.
    pub fn with_shared_address(mut self, address: &str) -> Self {
        self.shared_address = Some(address.to_string());
        self
    }

    pub fn with_creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay = Some(delay);
        self
    }

    pub fn fail_connect(mut self, hostname: &str) -> Self {
        self.failing_connects.insert(hostname.to_string());
        self
    }

    pub fn fail_create(mut self, hostname: &str) -> Self {
        self.failing_creates.insert(hostname.to_string());
        self
    }

    pub fn created_allocators(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ClusterTransport for FakeTransport {
    fn connect<'a>(
        &'a self,
        machine: &'a MachineDescriptor,
    ) -> AllocFuture<'a, AllocResult<Arc<dyn HostContext>>> {
        Box::pin(async move {
            if self.failing_connects.contains(&machine.hostname) {
                return Err(anyhow!("cannot reach {}", machine.hostname));
            }
            let address = self
                .shared_address
                .clone()
                .unwrap_or_else(|| format!("Host-{}:22", machine.hostname));
            Ok(Arc::new(FakeHost {
                hostname: machine.hostname.clone(),
                address,
                creation_delay: self.creation_delay,
                fail_create: self.failing_creates.contains(&machine.hostname),
                created: self.created.clone(),
            }) as Arc<dyn HostContext>)
        })
    }
}

struct FakeHost {
    hostname: String,
    address: String,
    creation_delay: Option<Duration>,
    fail_create: bool,
    created: Arc<AtomicUsize>,
}

impl HostContext for FakeHost {
    fn address(&self) -> Option<&str> {
        Some(&self.address)
    }

    fn create_allocator(&self) -> AllocFuture<'_, AllocResult<Arc<dyn Allocator>>> {
        Box::pin(async move {
            if let Some(delay) = self.creation_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_create {
                return Err(anyhow!("cannot create allocator on {}", self.hostname));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TestAllocatorBuilder::default()
                .name(format!("LocalAllocator@{}", self.hostname))
                .host(self.hostname.clone())
                .build() as Arc<dyn Allocator>)
        })
    }
}
