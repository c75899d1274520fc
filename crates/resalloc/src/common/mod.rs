pub mod cli;
pub mod config;
pub mod error;
pub mod idcounter;
pub mod setup;
pub mod utils;
