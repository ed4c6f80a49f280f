//! nw-orchestrator: keeps routers in sync with access and bandwidth policy
//!
//! Policy changes are turned into idempotent iptables and tc commands and run
//! over pooled SSH sessions. The router holds the authoritative state document
//! and its live firewall configuration decides which access list is active.

pub mod commands;
pub mod connection;
pub mod infra;
pub mod mode;
pub mod shell;
pub mod state;
pub mod store;
pub mod sync;

pub use state::Controller;
pub use sync::{GroupSync, GroupSyncRequest, RouterCommandBundle};
