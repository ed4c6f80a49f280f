//! Policy state persisted on the router

mod delta;
mod document;
mod locks;
mod remote;
mod validate;

pub use delta::{compute_delta, DeviceChange, DeviceDelta};
pub use document::{
    ClassSlot, DocumentError, GroupPolicy, InfrastructureState, PolicyGroup, RemoteStateDocument,
    CLASS_CEILING, FIRST_MINTED_CLASS, RESERVED_CLASS, SCHEMA_VERSION,
};
pub use locks::DeviceLocks;
pub use remote::{verify_against, DeviceVerificationResult, RemoteStateStore};
pub use validate::{is_valid_ip, is_valid_mac, normalize_mac, validate_devices};
