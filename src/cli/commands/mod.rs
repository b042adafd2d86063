//! CLI command implementations

pub mod config;
pub mod describe;
pub mod resolve;
pub mod sweep;

pub use config::execute as config;
pub use describe::execute as describe;
pub use resolve::execute as resolve;
pub use sweep::execute as sweep;
