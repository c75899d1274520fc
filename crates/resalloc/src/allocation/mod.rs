pub mod allocator;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod local;
pub mod manager;
pub mod probe;
pub mod request;
pub mod score;

pub use allocator::{Allocator, WorkerHandle, WorkerInfo};
pub use manager::{AllocatedWorker, AllocationError, AllocationManager};
pub use request::{ResourceKey, ResourceRequest};
pub use score::{Criteria, Rating, Score};

pub type AllocResult<T> = anyhow::Result<T>;
