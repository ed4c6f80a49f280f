//! Router scaffolding checks and setup

mod reconciler;

pub use reconciler::{
    legacy_cleanup_commands, setup_commands, Component, InfrastructureReport, Reconciler,
    SetupReport,
};
