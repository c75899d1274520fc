pub mod allocation;
pub mod common;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ResAllocError;
pub type Result<T> = std::result::Result<T, Error>;

pub const RESALLOC_VERSION: &str = {
    match option_env!("RESALLOC_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};
