//! scanlogin core - Shared types, configuration and protocol definitions
//!
//! This crate provides the foundational types used by the client and auth crates.

pub mod backoff;
pub mod config;
pub mod error;
pub mod protocol;

pub use backoff::{BackoffPolicy, BackoffTier};
pub use config::{ApiRoutes, AuthConfig, PollConfig, DEFAULT_BASE_URL};
pub use error::{Error, Result};
pub use protocol::{
    ApiEnvelope, AuthEvent, LoginStatus, Phase, PollStatusResponse, ProviderParams,
    SessionStatus, UserInfo, CORRELATION_HEADER,
};
