use std::ffi::OsString;
use std::sync::Arc;

use crate::allocation::AllocResult;
use crate::allocation::cluster::{ClusterAllocator, ClusterTransport};
use crate::allocation::local::{LOCAL_ALLOCATOR_NAME, LocalAllocator};
use crate::allocation::manager::AllocationManager;
use crate::allocation::probe::SystemProbe;
use crate::common::config::{LocalConfig, ResAllocConfig};
use crate::worker::launcher::ProcessLauncher;

/// Creates the local allocator of the current host.
pub fn create_local_allocator(config: &LocalConfig) -> crate::Result<LocalAllocator> {
    let probe = SystemProbe::from_versions(
        &config.distributions,
        config.module_path.as_ref().map(OsString::from),
    )?;
    Ok(LocalAllocator::new(
        LOCAL_ALLOCATOR_NAME.to_string(),
        config.total_cpus,
        config.max_load,
        Arc::new(probe),
        Arc::new(ProcessLauncher::current_exe()),
    ))
}

/// Creates a manager with the local allocator first, followed by the configured clusters in
/// the order in which they appear in `config`.
pub async fn create_allocation_manager(
    config: &ResAllocConfig,
    transport: &dyn ClusterTransport,
) -> AllocResult<AllocationManager> {
    let local = create_local_allocator(&config.local)?;
    let mut manager = AllocationManager::with_allocator(Arc::new(local));
    if let Some(poll_interval) = config.poll_interval {
        manager = manager.with_poll_interval(poll_interval);
    }
    for cluster in &config.clusters {
        let allocator =
            ClusterAllocator::connect(cluster.name.clone(), cluster.machines.clone(), transport)
                .await?;
        log::debug!(
            "Cluster {} connected with {} machine(s)",
            cluster.name,
            allocator.machines().len()
        );
        manager.add_allocator(Arc::new(allocator));
    }
    Ok(manager)
}
