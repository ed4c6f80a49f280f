//! nw-core: Core abstractions and configuration for netwarden
//!
//! This crate provides the shared types, error taxonomy, collaborator traits
//! and configuration structures used by the orchestrator.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConnectionError, WardenError};
pub use types::{ActiveMode, CommandOutput, DeviceId, DeviceRef, GroupId, Phase, SessionId};
