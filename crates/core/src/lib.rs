//! farmreg core types and utilities
//!
//! Holds the session data model shared by the HTTP client and the CLI,
//! along with client configuration loading and tracing setup.

pub mod config;
pub mod error;
pub mod session;
#[cfg(feature = "subscriber")]
pub mod tracing;

pub use config::ClientConfig;
pub use error::{CoreError, CoreResult};
pub use session::{Session, UserProfile, roles};
