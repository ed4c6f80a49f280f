//! Access-list mode control

mod engine;

pub use engine::{parse_active_mode, ModeEngine};
