use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::allocation::AllocResult;
use crate::allocation::allocator::{AllocFuture, Allocator, WorkerHandle};
use crate::allocation::request::ResourceRequest;
use crate::allocation::score::Rating;

/// Identity used for hosts whose address is unknown.
pub const LOCAL_HOST_IDENTITY: &str = "127.0.0.1";

/// A machine of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineDescriptor {
    /// `host` or `host:port`
    pub hostname: String,
    /// Path to the `resalloc` executable on the machine.
    pub runtime: PathBuf,
}

/// Connection to a single remote host.
pub trait HostContext: Send + Sync {
    /// Address of the host in the form `Host-<ip>:<port>`, if known.
    fn address(&self) -> Option<&str>;

    /// Creates an allocator that starts workers on this host.
    fn create_allocator(&self) -> AllocFuture<'_, AllocResult<Arc<dyn Allocator>>>;
}

/// Establishes host contexts for machines of a cluster.
pub trait ClusterTransport: Send + Sync {
    fn connect<'a>(
        &'a self,
        machine: &'a MachineDescriptor,
    ) -> AllocFuture<'a, AllocResult<Arc<dyn HostContext>>>;
}

/// Extracts the host identity (`<ip>`) out of a `Host-<ip>:<port>` address.
pub fn resolve_host_identity(address: Option<&str>) -> String {
    let Some(address) = address else {
        return LOCAL_HOST_IDENTITY.to_string();
    };
    let host = address.strip_prefix("Host-").unwrap_or(address);
    let host = host.rsplit_once(':').map(|(host, _)| host).unwrap_or(host);
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Allocator spreading workers over the machines of a cluster.
///
/// Fitness of a request is not assessed cluster-wide. Each deployment picks the next machine and
/// forwards to an allocator of that host, created on first use and shared by all machines that
/// resolve to the same host.
pub struct ClusterAllocator {
    name: String,
    machines: Vec<MachineDescriptor>,
    hosts: Vec<Arc<dyn HostContext>>,
    next_host: AtomicUsize,
    host_allocators: tokio::sync::Mutex<HashMap<String, Arc<dyn Allocator>>>,
}

impl ClusterAllocator {
    pub async fn connect(
        name: String,
        machines: Vec<MachineDescriptor>,
        transport: &dyn ClusterTransport,
    ) -> AllocResult<Self> {
        if machines.is_empty() {
            bail!("Cluster {name} has no machines");
        }
        let mut hosts = Vec::with_capacity(machines.len());
        for machine in &machines {
            log::debug!("{name}: initializing {}", machine.hostname);
            let host = transport
                .connect(machine)
                .await
                .with_context(|| anyhow!("Cannot connect to {}", machine.hostname))?;
            hosts.push(host);
        }
        Ok(Self {
            name,
            machines,
            hosts,
            next_host: AtomicUsize::new(0),
            host_allocators: Default::default(),
        })
    }

    pub fn machines(&self) -> &[MachineDescriptor] {
        &self.machines
    }

    /// Number of per-host allocators created so far.
    pub async fn host_allocator_count(&self) -> usize {
        self.host_allocators.lock().await.len()
    }

    fn pick_host(&self) -> &Arc<dyn HostContext> {
        let index = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        &self.hosts[index]
    }

    async fn get_host_allocator(&self, host: &dyn HostContext) -> AllocResult<Arc<dyn Allocator>> {
        let identity = resolve_host_identity(host.address());
        // Held across creation, so that concurrent deployments to an unseen host create a single
        // allocator.
        let mut allocators = self.host_allocators.lock().await;
        if let Some(allocator) = allocators.get(&identity) {
            return Ok(allocator.clone());
        }
        let allocator = host.create_allocator().await.with_context(|| {
            anyhow!("Cannot create an allocator for host {identity} of {}", self.name)
        })?;
        log::debug!(
            "{}: created allocator {} for {} ({identity})",
            self.name,
            allocator.name(),
            host.address().unwrap_or("localhost")
        );
        allocators.insert(identity, allocator.clone());
        Ok(allocator)
    }
}

impl Allocator for ClusterAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate<'a>(&'a self, _request: &'a ResourceRequest) -> AllocFuture<'a, Rating> {
        Box::pin(async move { Rating::no_estimate() })
    }

    fn deploy<'a>(
        &'a self,
        name: &'a str,
        request: &'a ResourceRequest,
    ) -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>> {
        Box::pin(async move {
            let host = self.pick_host().clone();
            let allocator = self.get_host_allocator(host.as_ref()).await?;
            allocator.deploy(name, request).await
        })
    }
}
