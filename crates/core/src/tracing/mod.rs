//! Tracing setup shared by farmreg binaries
//!
//! Library crates only emit events through the `tracing` macros; installing a
//! subscriber is left to whichever binary embeds them.

pub mod config;
pub mod init;

pub use config::InstrumentationConfig;
pub use init::init_tracing;
