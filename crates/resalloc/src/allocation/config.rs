use std::time::Duration;

/// Maximum number of deployment retries of a single allocation.
/// The allocation is attempted at most `MAX_DEPLOYMENT_RETRIES + 1` times.
pub const MAX_DEPLOYMENT_RETRIES: u32 = 10;

/// Prefix of generated worker names.
pub const WORKER_NAME_PREFIX: &str = "Sim";

/// How long to wait before rating allocators again when none of them has free capacity.
pub fn get_poll_interval() -> Duration {
    get_duration_from_env("RESALLOC_POLL_INTERVAL_MS").unwrap_or_else(|| Duration::from_secs(1))
}

/// How long to wait for a started worker to report itself.
pub fn get_worker_startup_timeout() -> Duration {
    get_duration_from_env("RESALLOC_WORKER_STARTUP_TIMEOUT_MS")
        .unwrap_or_else(|| Duration::from_secs(30))
}

/// How long to wait for a worker to stop after SIGTERM before it is killed.
pub fn get_worker_stop_timeout() -> Duration {
    get_duration_from_env("RESALLOC_WORKER_STOP_TIMEOUT_MS")
        .unwrap_or_else(|| Duration::from_secs(5))
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
