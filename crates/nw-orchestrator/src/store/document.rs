//! The remote state document
//!
//! Serialized as JSON at a fixed path on the router. Groups are keyed by id;
//! `serde_json` writes the integer keys as strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nw_core::error::WardenError;
use nw_core::types::{DeviceRef, GroupId, DEFAULT_GROUP};

/// Current document layout
pub const SCHEMA_VERSION: u32 = 1;
/// Class and mark permanently held by group 0
pub const RESERVED_CLASS: u32 = 100;
/// First id handed out by the counter
pub const FIRST_MINTED_CLASS: u32 = 101;
/// Exclusive upper bound of minted ids
pub const CLASS_CEILING: u32 = 999;

/// Why a fetched document was rejected
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing top-level key `{0}`")]
    MissingKey(&'static str),

    #[error("default group: {0}")]
    DefaultGroup(String),
}

/// A traffic-control class handle and its packet mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassSlot {
    pub tc_class_id: u32,
    pub mark_value: u32,
}

impl ClassSlot {
    pub fn new(tc_class_id: u32, mark_value: u32) -> Self {
        Self {
            tc_class_id,
            mark_value,
        }
    }

    pub fn reserved() -> Self {
        Self::new(RESERVED_CLASS, RESERVED_CLASS)
    }

    pub fn is_reserved(&self) -> bool {
        self.tc_class_id == RESERVED_CLASS || self.mark_value == RESERVED_CLASS
    }
}

/// Bandwidth and access policy of a group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    /// `None` means unrestricted: no shaping class installed
    pub bandwidth_limit_mbps: Option<f64>,
    pub blocked_sites: Vec<String>,
    pub block_all: bool,
}

/// A set of devices sharing one policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyGroup {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub devices: Vec<DeviceRef>,
    #[serde(default)]
    pub tc_class_id: Option<u32>,
    #[serde(default)]
    pub mark_value: Option<u32>,
    #[serde(default)]
    pub policy: GroupPolicy,
    #[serde(default)]
    pub infrastructure_created: bool,
    /// Unix milliseconds
    #[serde(default)]
    pub last_sync: Option<u64>,
}

fn default_active() -> bool {
    true
}

impl PolicyGroup {
    pub fn new(group_id: GroupId, name: impl Into<String>) -> Self {
        Self {
            group_id,
            name: name.into(),
            active: true,
            devices: Vec::new(),
            tc_class_id: None,
            mark_value: None,
            policy: GroupPolicy::default(),
            infrastructure_created: false,
            last_sync: None,
        }
    }

    /// The reserved default group
    pub fn default_group() -> Self {
        let mut group = Self::new(DEFAULT_GROUP, "default");
        group.assign_class(ClassSlot::reserved());
        group
    }

    /// Assigned class pair, if both halves are set
    pub fn class_slot(&self) -> Option<ClassSlot> {
        match (self.tc_class_id, self.mark_value) {
            (Some(class), Some(mark)) => Some(ClassSlot::new(class, mark)),
            _ => None,
        }
    }

    pub fn assign_class(&mut self, slot: ClassSlot) {
        self.tc_class_id = Some(slot.tc_class_id);
        self.mark_value = Some(slot.mark_value);
    }

    pub fn clear_class(&mut self) -> Option<ClassSlot> {
        let slot = self.class_slot();
        self.tc_class_id = None;
        self.mark_value = None;
        slot
    }
}

/// Router-wide scaffolding and class bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureState {
    pub base_setup_complete: bool,
    /// Released pairs, sorted by class id
    pub available_class_pool: Vec<ClassSlot>,
    pub next_class_id: u32,
    /// Group whose devices populate the active access list
    pub access_list_group: Option<GroupId>,
}

impl Default for InfrastructureState {
    fn default() -> Self {
        Self {
            base_setup_complete: false,
            available_class_pool: Vec::new(),
            next_class_id: FIRST_MINTED_CLASS,
            access_list_group: None,
        }
    }
}

/// Everything netwarden persists on a router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStateDocument {
    #[serde(default = "default_schema")]
    pub schema_version: u32,
    /// Incremented on every write
    #[serde(default)]
    pub revision: u64,
    pub groups: BTreeMap<GroupId, PolicyGroup>,
    pub infrastructure: InfrastructureState,
}

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

impl Default for RemoteStateDocument {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(DEFAULT_GROUP, PolicyGroup::default_group());
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            groups,
            infrastructure: InfrastructureState::default(),
        }
    }
}

impl RemoteStateDocument {
    /// Parse and structurally check a fetched document
    pub fn from_json(contents: &str) -> Result<Self, DocumentError> {
        let value: serde_json::Value = serde_json::from_str(contents)?;
        for key in ["groups", "infrastructure"] {
            if value.get(key).is_none() {
                return Err(DocumentError::MissingKey(key));
            }
        }

        let document: Self = serde_json::from_value(value)?;
        match document.groups.get(&DEFAULT_GROUP) {
            None => Err(DocumentError::DefaultGroup("missing".to_string())),
            Some(group) if group.group_id != DEFAULT_GROUP => Err(DocumentError::DefaultGroup(
                format!("stored under id {}", group.group_id),
            )),
            Some(_) => Ok(document),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn group(&self, group_id: GroupId) -> Option<&PolicyGroup> {
        self.groups.get(&group_id)
    }

    /// Take a class pair: lowest released pair first, then the counter
    pub fn allocate_class(&mut self) -> Result<ClassSlot, WardenError> {
        let infra = &mut self.infrastructure;
        if !infra.available_class_pool.is_empty() {
            return Ok(infra.available_class_pool.remove(0));
        }
        if infra.next_class_id >= CLASS_CEILING {
            return Err(WardenError::PoolExhausted {
                ceiling: CLASS_CEILING,
            });
        }
        let id = infra.next_class_id;
        infra.next_class_id += 1;
        Ok(ClassSlot::new(id, id))
    }

    /// Return a class pair to the pool.
    ///
    /// The reserved pair, ids the counter never handed out and pairs already
    /// in the pool are ignored. Returns whether the pool changed. Releasing the
    /// most recently minted id winds the counter back, so an allocate/release
    /// pair leaves the document as it was.
    pub fn release_class(&mut self, slot: ClassSlot) -> bool {
        let infra = &mut self.infrastructure;
        if slot.is_reserved()
            || slot.tc_class_id < FIRST_MINTED_CLASS
            || slot.tc_class_id >= infra.next_class_id
        {
            return false;
        }
        let pool = &mut infra.available_class_pool;
        if pool.iter().any(|s| s.tc_class_id == slot.tc_class_id) {
            return false;
        }
        let at = pool.partition_point(|s| s.tc_class_id < slot.tc_class_id);
        pool.insert(at, slot);

        while infra.next_class_id > FIRST_MINTED_CLASS {
            match pool.last() {
                Some(last) if last.tc_class_id + 1 == infra.next_class_id => {
                    pool.pop();
                    infra.next_class_id -= 1;
                }
                _ => break,
            }
        }
        true
    }

    /// Drop a group and release its class pair
    pub fn remove_group(&mut self, group_id: GroupId) -> Result<Option<PolicyGroup>, WardenError> {
        if group_id == DEFAULT_GROUP {
            return Err(WardenError::ProtectedGroup(group_id));
        }
        let removed = self.groups.remove(&group_id);
        if let Some(slot) = removed.as_ref().and_then(PolicyGroup::class_slot) {
            self.release_class(slot);
        }
        if self.infrastructure.access_list_group == Some(group_id) {
            self.infrastructure.access_list_group = None;
        }
        Ok(removed)
    }

    /// First other group holding the IP or MAC, with the colliding value
    pub fn find_conflict(
        &self,
        exclude: GroupId,
        device: &DeviceRef,
    ) -> Option<(GroupId, String)> {
        self.groups
            .values()
            .filter(|group| group.group_id != exclude)
            .find_map(|group| {
                group.devices.iter().find_map(|stored| {
                    if stored.ip == device.ip {
                        Some((group.group_id, device.ip.clone()))
                    } else if stored.mac.eq_ignore_ascii_case(&device.mac) {
                        Some((group.group_id, device.mac.clone()))
                    } else {
                        None
                    }
                })
            })
    }
}
