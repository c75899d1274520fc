use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::allocation::AllocResult;
use crate::allocation::request::ResourceRequest;
use crate::allocation::score::Rating;

pub type AllocFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Provider of worker processes.
///
/// Allocators are shared between concurrent allocations, so both methods take `&self` and may be
/// called in parallel.
pub trait Allocator: Send + Sync {
    /// Unique name of the allocator.
    fn name(&self) -> &str;

    /// Rates how well this allocator can serve `request`.
    ///
    /// Refusals are expressed through the returned score, never through an error.
    fn rate<'a>(&'a self, request: &'a ResourceRequest) -> AllocFuture<'a, Rating>;

    /// Starts a worker called `name`.
    ///
    /// An error means that the worker could not be provisioned even though the allocator rated
    /// the request favorably.
    fn deploy<'a>(
        &'a self,
        name: &'a str,
        request: &'a ResourceRequest,
    ) -> AllocFuture<'a, AllocResult<Box<dyn WorkerHandle>>>;
}

/// A live worker owned by the caller of a successful allocation.
pub trait WorkerHandle: Send + Sync {
    fn name(&self) -> &str;
    fn pid(&self) -> u32;
    fn host(&self) -> &str;

    /// Stops the worker and releases everything associated with it.
    fn cleanup(&self) -> AllocFuture<'_, AllocResult<()>>;

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            name: self.name().to_string(),
            pid: self.pid(),
            host: self.host().to_string(),
        }
    }
}

impl Debug for dyn WorkerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name())
            .field("pid", &self.pid())
            .field("host", &self.host())
            .finish()
    }
}

/// Metadata describing a started worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerInfo {
    pub name: String,
    pub pid: u32,
    pub host: String,
}
