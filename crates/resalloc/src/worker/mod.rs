pub mod launcher;
pub mod start;
