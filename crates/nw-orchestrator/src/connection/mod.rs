//! Connection management

mod pool;
mod reaper;
mod resolver;
mod ssh;

pub use pool::{ConnectionPool, ReapSummary};
pub use reaper::{run_reaper, spawn_reaper};
pub use resolver::StaticResolver;
pub use ssh::{SshConnector, SshExecutor};
