use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::allocation::allocator::{Allocator, WorkerHandle, WorkerInfo};
use crate::allocation::config::{MAX_DEPLOYMENT_RETRIES, WORKER_NAME_PREFIX, get_poll_interval};
use crate::allocation::local::LocalAllocator;
use crate::allocation::request::ResourceRequest;
use crate::allocation::score::{BestFit, Criteria, Rating, Score};
use crate::common::idcounter::IdCounter;

/// Reason why no worker was allocated.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("No allocator can serve the request: {}", serde_json::Value::Object(.criteria.clone()))]
    Unsupported { criteria: Criteria },
    #[error("Deployment has failed {attempts} times")]
    DeploymentFailed { attempts: u32 },
    #[error("Allocation was cancelled")]
    Cancelled,
}

/// Result of a successful allocation. The caller owns the worker and should hand it back to
/// [`AllocationManager::release`] once it is no longer needed.
#[derive(Debug)]
pub struct AllocatedWorker {
    pub info: WorkerInfo,
    pub handle: Box<dyn WorkerHandle>,
}

struct ManagerState {
    allocators: Vec<Arc<dyn Allocator>>,
    allocation_counter: IdCounter,
}

/// Registry of allocators that picks the best one for each allocation request.
///
/// Allocators are kept in registration order, which decides ties between equally rated
/// allocators. The state lock is only held to read or modify the registry and the name counter;
/// rating and deployment run without it.
pub struct AllocationManager {
    state: Mutex<ManagerState>,
    poll_interval: Duration,
}

impl Default for AllocationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationManager {
    /// Creates a manager with a local allocator of the current host.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(LocalAllocator::for_current_host()))
    }

    /// Creates a manager whose first allocator is `allocator`.
    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                allocators: vec![allocator],
                allocation_counter: IdCounter::new(1),
            }),
            poll_interval: get_poll_interval(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        // The state is consistent after every statement, so a poisoned lock can be reused
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_allocator(&self, allocator: Arc<dyn Allocator>) {
        log::debug!("Adding allocator {}", allocator.name());
        self.lock_state().allocators.push(allocator);
    }

    /// Inserts `allocator` at `index`. Indices past the end append.
    pub fn insert_allocator(&self, index: usize, allocator: Arc<dyn Allocator>) {
        log::debug!("Inserting allocator {} at {index}", allocator.name());
        let mut state = self.lock_state();
        let index = index.min(state.allocators.len());
        state.allocators.insert(index, allocator);
    }

    pub fn allocator_names(&self) -> Vec<String> {
        self.lock_state()
            .allocators
            .iter()
            .map(|allocator| allocator.name().to_string())
            .collect()
    }

    fn allocators(&self) -> Vec<Arc<dyn Allocator>> {
        self.lock_state().allocators.clone()
    }

    fn next_worker_name(&self) -> String {
        let id = self.lock_state().allocation_counter.increment();
        format!("{WORKER_NAME_PREFIX}-{id}")
    }

    /// Rates `request` with every allocator, in registration order.
    pub async fn rate_all(&self, request: &ResourceRequest) -> Vec<(String, Rating)> {
        let allocators = self.allocators();
        let ratings = rate_allocators(&allocators, request).await;
        allocators
            .iter()
            .map(|allocator| allocator.name().to_string())
            .zip(ratings)
            .collect()
    }

    /// Finds the allocator best suited for `request`.
    pub async fn select(&self, request: &ResourceRequest) -> BestFit<Arc<dyn Allocator>> {
        let allocators = self.allocators();
        let ratings = rate_allocators(&allocators, request).await;
        let mut best = BestFit::new();
        for (allocator, rating) in allocators.into_iter().zip(ratings) {
            log::debug!("Allocator {} returned {}", allocator.name(), rating.score);
            best.offer(rating, allocator);
        }
        best
    }

    /// Allocates a worker for `request`.
    ///
    /// Waits as long as it takes when no allocator has free capacity.
    pub async fn allocate(
        &self,
        request: &ResourceRequest,
    ) -> Result<AllocatedWorker, AllocationError> {
        self.allocate_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Allocates a worker for `request`, giving up on waiting for free capacity once `cancel`
    /// is cancelled.
    pub async fn allocate_with_cancel(
        &self,
        request: &ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<AllocatedWorker, AllocationError> {
        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(AllocationError::Cancelled);
            }
            let (score, criteria, allocator) = self.select(request).await.into_parts();
            let allocator = match (score, allocator) {
                (Score::Unavailable, _) => {
                    log::debug!(
                        "No allocator has free capacity, retrying in {}",
                        humantime::format_duration(self.poll_interval)
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                        _ = cancel.cancelled() => return Err(AllocationError::Cancelled),
                    }
                }
                (Score::Estimate(_) | Score::NoEstimate, Some(allocator)) => allocator,
                _ => {
                    log::info!(
                        "No allocator can serve request {}: {}",
                        serde_json::to_string(request).unwrap_or_default(),
                        serde_json::Value::Object(criteria.clone())
                    );
                    return Err(AllocationError::Unsupported { criteria });
                }
            };

            let name = self.next_worker_name();
            log::debug!("Deploying {name} on {} (score {score})", allocator.name());
            let result = AssertUnwindSafe(async { allocator.deploy(&name, request).await })
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(handle)) => {
                    let info = handle.info();
                    log::info!(
                        "Allocated {} pid {} on {} using {}",
                        info.name,
                        info.pid,
                        info.host,
                        allocator.name()
                    );
                    return Ok(AllocatedWorker { info, handle });
                }
                Ok(Err(error)) => {
                    log::warn!(
                        "Deployment of {name} on {} has failed: {error:?}",
                        allocator.name()
                    );
                }
                Err(panic) => {
                    log::warn!(
                        "Deployment of {name} on {} has panicked: {}",
                        allocator.name(),
                        panic_message(panic.as_ref())
                    );
                }
            }

            retries += 1;
            if retries > MAX_DEPLOYMENT_RETRIES {
                log::error!(
                    "Giving up on request {} after {retries} failed deployments",
                    serde_json::to_string(request).unwrap_or_default()
                );
                return Err(AllocationError::DeploymentFailed { attempts: retries });
            }
        }
    }

    /// Stops a worker returned by [`AllocationManager::allocate`].
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn release(&self, handle: Box<dyn WorkerHandle>) {
        let name = handle.name().to_string();
        let result = AssertUnwindSafe(async { handle.cleanup().await })
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => log::debug!("Released {name}"),
            Ok(Err(error)) => log::warn!("Cleanup of {name} has failed: {error:?}"),
            Err(panic) => log::warn!(
                "Cleanup of {name} has panicked: {}",
                panic_message(panic.as_ref())
            ),
        }
    }
}

/// Rates all allocators concurrently. Ratings are returned in the order of `allocators`.
async fn rate_allocators(
    allocators: &[Arc<dyn Allocator>],
    request: &ResourceRequest,
) -> Vec<Rating> {
    futures::future::join_all(allocators.iter().map(|allocator| async move {
        match AssertUnwindSafe(async { allocator.rate(request).await })
            .catch_unwind()
            .await
        {
            Ok(rating) => Rating::new(rating.score.normalize(), rating.criteria),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::warn!("Rating by {} has panicked: {message}", allocator.name());
                Rating::unsupported("panic", message.into())
            }
        }
    }))
    .await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{AllocationError, AllocationManager};
    use crate::allocation::allocator::Allocator;
    use crate::allocation::config::MAX_DEPLOYMENT_RETRIES;
    use crate::allocation::local::{LOCAL_ALLOCATOR_NAME, LocalAllocator};
    use crate::allocation::probe::{LoadAverage, StaticProbe};
    use crate::allocation::request::ResourceRequest;
    use crate::allocation::score::Score;
    use crate::common::utils::network::get_hostname;
    use crate::tests::utils::{RecordingLauncher, TestAllocatorBuilder, TestWorker};

    fn manager(first: Arc<dyn Allocator>) -> AllocationManager {
        AllocationManager::with_allocator(first).with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn default_manager_has_local_allocator() {
        let manager = AllocationManager::new();
        assert_eq!(manager.allocator_names(), vec![LOCAL_ALLOCATOR_NAME]);
    }

    #[test]
    fn insert_allocator_positions() {
        let manager = manager(TestAllocatorBuilder::default().name("a").build());
        manager.add_allocator(TestAllocatorBuilder::default().name("b").build());
        manager.insert_allocator(0, TestAllocatorBuilder::default().name("c").build());
        manager.insert_allocator(100, TestAllocatorBuilder::default().name("d").build());
        manager.insert_allocator(2, TestAllocatorBuilder::default().name("e").build());
        assert_eq!(manager.allocator_names(), vec!["c", "a", "e", "b", "d"]);
    }

    #[tokio::test]
    async fn first_registered_wins_ties() {
        let a = TestAllocatorBuilder::default().name("a").build();
        let b = TestAllocatorBuilder::default().name("b").build();
        let manager = manager(a.clone());
        manager.add_allocator(b.clone());

        for _ in 0..5 {
            let worker = manager.allocate(&ResourceRequest::new()).await.unwrap();
            manager.release(worker.handle).await;
        }
        assert_eq!(a.deploy_calls(), 5);
        assert_eq!(b.deploy_calls(), 0);

        let c = TestAllocatorBuilder::default().name("c").build();
        manager.insert_allocator(0, c.clone());
        manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(c.deploy_calls(), 1);
        assert_eq!(a.deploy_calls(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ties_are_stable_under_concurrency() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .deploy_delay(Some(Duration::from_millis(5)))
            .build();
        let b = TestAllocatorBuilder::default().name("b").build();
        let manager = Arc::new(manager(a.clone()));
        manager.add_allocator(b.clone());

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.allocate(&ResourceRequest::new()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(a.deploy_calls(), 10);
        assert_eq!(b.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn lowest_estimate_wins() {
        let manager = manager(TestAllocatorBuilder::default().name("none").build());
        let slow = TestAllocatorBuilder::default()
            .name("slow")
            .score(Score::Estimate(30.0))
            .build();
        let fast = TestAllocatorBuilder::default()
            .name("fast")
            .score(Score::Estimate(10.0))
            .build();
        manager.add_allocator(slow.clone());
        manager.add_allocator(fast.clone());

        manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(fast.deploy_calls(), 1);
        assert_eq!(slow.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn busy_first_allocator_causes_shortage() {
        let busy = TestAllocatorBuilder::default()
            .name("busy")
            .scores(vec![Score::Unavailable, Score::Unavailable, Score::NoEstimate])
            .build();
        let free = TestAllocatorBuilder::default().name("free").build();
        let manager = manager(busy.clone());
        manager.add_allocator(free.clone());

        let worker = manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(worker.info.name, "Sim-1");
        assert_eq!(busy.rate_calls(), 3);
        assert_eq!(free.rate_calls(), 3);
        assert_eq!(busy.deploy_calls(), 1);
        assert_eq!(free.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn busy_first_allocator_is_not_bypassed() {
        let busy = TestAllocatorBuilder::default()
            .name("busy")
            .score(Score::Unavailable)
            .build();
        let free = TestAllocatorBuilder::default().name("free").build();
        let manager = manager(busy.clone());
        manager.add_allocator(free.clone());

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };
        let result = manager
            .allocate_with_cancel(&ResourceRequest::new(), &token)
            .await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(AllocationError::Cancelled)));
        assert!(free.rate_calls() > 1);
        assert_eq!(free.deploy_calls(), 0);
        assert_eq!(busy.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_estimate_does_not_block_selection() {
        let broken = TestAllocatorBuilder::default()
            .name("broken")
            .score(Score::Estimate(f64::NAN))
            .build();
        let fast = TestAllocatorBuilder::default()
            .name("fast")
            .score(Score::Estimate(5.0))
            .build();
        let manager = manager(broken.clone());
        manager.add_allocator(fast.clone());

        let ratings = manager.rate_all(&ResourceRequest::new()).await;
        assert_eq!(ratings[0].1.score, Score::Unsupported);

        manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(fast.deploy_calls(), 1);
        assert_eq!(broken.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_fails_immediately() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .score(Score::Unsupported)
            .build();
        let manager = manager(a.clone());

        let result = manager.allocate(&ResourceRequest::new()).await;
        match result {
            Err(AllocationError::Unsupported { criteria }) => {
                assert_eq!(criteria["allocator"], "a");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(a.rate_calls(), 1);
        assert_eq!(a.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn deployment_retry_bound() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .failing_deploys(usize::MAX)
            .build();
        let manager = manager(a.clone());

        let result = manager.allocate(&ResourceRequest::new()).await;
        assert!(matches!(
            result,
            Err(AllocationError::DeploymentFailed { attempts: 11 })
        ));
        assert_eq!(a.deploy_calls(), MAX_DEPLOYMENT_RETRIES as usize + 1);
        assert_eq!(a.rate_calls(), MAX_DEPLOYMENT_RETRIES as usize + 1);
    }

    #[tokio::test]
    async fn deployment_panics_are_retried() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .panic_on_deploy(true)
            .build();
        let manager = manager(a.clone());

        let result = manager.allocate(&ResourceRequest::new()).await;
        assert!(matches!(
            result,
            Err(AllocationError::DeploymentFailed { attempts: 11 })
        ));
        assert_eq!(a.deploy_calls(), 11);
    }

    #[tokio::test]
    async fn failed_attempts_consume_names() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .failing_deploys(2)
            .build();
        let manager = manager(a.clone());

        let worker = manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(worker.info.name, "Sim-3");
        assert_eq!(a.deployed_names(), vec!["Sim-1", "Sim-2", "Sim-3"]);

        let worker = manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(worker.info.name, "Sim-4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_have_unique_names() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .deploy_delay(Some(Duration::from_millis(1)))
            .build();
        let manager = Arc::new(manager(a));

        let count = 32;
        let tasks: Vec<_> = (0..count)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .allocate(&ResourceRequest::new())
                        .await
                        .map(|worker| worker.info.name)
                })
            })
            .collect();
        let mut names = BTreeSet::new();
        for task in tasks {
            names.insert(task.await.unwrap().unwrap());
        }
        let expected: BTreeSet<String> = (1..=count).map(|id| format!("Sim-{id}")).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn shortage_is_polled() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .scores(vec![Score::Unavailable, Score::Unavailable, Score::NoEstimate])
            .build();
        let manager = manager(a.clone());

        let worker = manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(worker.info.name, "Sim-1");
        assert_eq!(a.rate_calls(), 3);
        assert_eq!(a.deploy_calls(), 1);
    }

    #[tokio::test]
    async fn shortage_can_be_cancelled() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .score(Score::Unavailable)
            .build();
        let manager = manager(a.clone()).with_poll_interval(Duration::from_secs(3600));

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };
        let result = manager
            .allocate_with_cancel(&ResourceRequest::new(), &token)
            .await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(AllocationError::Cancelled)));
        assert_eq!(a.rate_calls(), 1);
        assert_eq!(a.deploy_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_token_skips_rating() {
        let a = TestAllocatorBuilder::default().name("a").build();
        let manager = manager(a.clone());
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            manager
                .allocate_with_cancel(&ResourceRequest::new(), &token)
                .await,
            Err(AllocationError::Cancelled)
        ));
        assert_eq!(a.rate_calls(), 0);
    }

    #[tokio::test]
    async fn rate_all_in_registration_order() {
        let manager = manager(
            TestAllocatorBuilder::default()
                .name("a")
                .score(Score::Unavailable)
                .build(),
        );
        manager.add_allocator(
            TestAllocatorBuilder::default()
                .name("b")
                .score(Score::Estimate(5.0))
                .build(),
        );
        let ratings = manager.rate_all(&ResourceRequest::new()).await;
        let summary: Vec<_> = ratings
            .iter()
            .map(|(name, rating)| (name.as_str(), rating.score))
            .collect();
        assert_eq!(
            summary,
            vec![("a", Score::Unavailable), ("b", Score::Estimate(5.0))]
        );
    }

    #[tokio::test]
    async fn rating_panic_counts_as_unsupported() {
        let a = TestAllocatorBuilder::default()
            .name("a")
            .panic_on_rate(true)
            .build();
        let b = TestAllocatorBuilder::default().name("b").build();
        let manager = manager(a);
        manager.add_allocator(b.clone());

        manager.allocate(&ResourceRequest::new()).await.unwrap();
        assert_eq!(b.deploy_calls(), 1);
    }

    #[tokio::test]
    async fn release_cleans_up_worker() {
        let manager = manager(TestAllocatorBuilder::default().name("a").build());
        let worker = TestWorker::new("Sim-1", "testhost");
        let cleanups = worker.cleanup_counter();
        manager.release(Box::new(worker)).await;
        assert_eq!(cleanups.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_swallows_cleanup_failures() {
        let manager = manager(TestAllocatorBuilder::default().name("a").build());
        manager
            .release(Box::new(TestWorker::new("Sim-1", "testhost").failing_cleanup()))
            .await;
        manager
            .release(Box::new(TestWorker::new("Sim-2", "testhost").panicking_cleanup()))
            .await;
    }

    fn local_allocator(launcher: Arc<RecordingLauncher>) -> Arc<LocalAllocator> {
        Arc::new(LocalAllocator::new(
            LOCAL_ALLOCATOR_NAME.to_string(),
            1,
            2.0,
            Arc::new(StaticProbe::default().with_load_average(Some(LoadAverage {
                one: 0.1,
                five: 0.1,
                fifteen: 0.1,
            }))),
            launcher,
        ))
    }

    #[tokio::test]
    async fn allocate_on_local_host() {
        let hostname = get_hostname(None);
        let launcher = Arc::new(RecordingLauncher::new(&hostname));
        let manager = manager(local_allocator(launcher.clone()));

        let worker = manager
            .allocate(&ResourceRequest::new().with_max_cpus(1))
            .await
            .unwrap();
        let id = worker.info.name.strip_prefix("Sim-").unwrap();
        assert!(id.parse::<u64>().unwrap() > 0);
        assert_eq!(worker.info.host, hostname);
        assert_eq!(worker.info, worker.handle.info());
        assert_eq!(launcher.launched(), vec![worker.info.name.clone()]);
        manager.release(worker.handle).await;
    }

    #[tokio::test]
    async fn local_allocator_refuses_remote_request() {
        let launcher = Arc::new(RecordingLauncher::new("localhost"));
        let manager = manager(local_allocator(launcher.clone()));

        let result = manager
            .allocate(&ResourceRequest::new().with_localhost_only(false))
            .await;
        match result {
            Err(AllocationError::Unsupported { criteria }) => {
                assert_eq!(criteria["localhost-only"], false);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(launcher.launched().is_empty());
    }
}
