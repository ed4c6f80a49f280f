//! Remote-backed state store
//!
//! Every operation reads the document from the router; nothing is cached
//! between calls. Writes replace the whole file. Updates hold the router's
//! [`DeviceLocks`] entry for the full load-modify-write cycle and re-read the
//! revision just before writing, so a concurrent writer in another process
//! surfaces as [`WardenError::StaleRevision`] instead of a silent overwrite.

use std::sync::Arc;

use serde::Serialize;

use nw_core::error::WardenError;
use nw_core::types::{DeviceRef, GroupId, Phase, DEFAULT_GROUP};

use super::delta::{compute_delta, DeviceChange, DeviceDelta};
use super::document::{ClassSlot, PolicyGroup, RemoteStateDocument, SCHEMA_VERSION};
use super::locks::DeviceLocks;
use super::validate::validate_devices;
use crate::commands::RemoteCommand;
use crate::shell::DeviceShell;

/// Outcome of checking a proposed device list for a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceVerificationResult {
    pub is_valid: bool,
    pub error: Option<String>,
    pub added_devices: Vec<DeviceRef>,
    pub removed_devices: Vec<DeviceRef>,
    pub ip_changed: Vec<DeviceChange>,
    pub mac_changed: Vec<DeviceChange>,
    pub unchanged: Vec<DeviceRef>,
}

impl DeviceVerificationResult {
    fn valid(delta: DeviceDelta) -> Self {
        Self {
            is_valid: true,
            error: None,
            added_devices: delta.added,
            removed_devices: delta.removed,
            ip_changed: delta.ip_changed,
            mac_changed: delta.mac_changed,
            unchanged: delta.unchanged,
        }
    }

    fn invalid(err: &WardenError) -> Self {
        Self {
            is_valid: false,
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

/// Check a validated device list against every other group, then diff it
/// against the group's stored list.
pub fn verify_against(
    document: &RemoteStateDocument,
    group_id: GroupId,
    devices: &[DeviceRef],
) -> Result<DeviceDelta, WardenError> {
    for device in devices {
        if let Some((owner, value)) = document.find_conflict(group_id, device) {
            return Err(WardenError::DuplicateDevice {
                value,
                group_id: owner,
            });
        }
    }
    let stored = document
        .group(group_id)
        .map(|group| group.devices.as_slice())
        .unwrap_or_default();
    Ok(compute_delta(stored, devices))
}

enum Fetched {
    Valid(RemoteStateDocument),
    Unusable(String),
}

/// The state document on one router
#[derive(Clone)]
pub struct RemoteStateStore {
    shell: DeviceShell,
    path: String,
    locks: Arc<DeviceLocks>,
}

impl RemoteStateStore {
    pub fn new(shell: DeviceShell, path: impl Into<String>, locks: Arc<DeviceLocks>) -> Self {
        Self {
            shell,
            path: path.into(),
            locks,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn fetch(&self) -> Result<Fetched, WardenError> {
        let read = RemoteCommand::ReadFile {
            path: self.path.clone(),
        };
        let output = match self.shell.run(Phase::State, &read).await {
            Ok(output) => output,
            Err(WardenError::CommandFailure { stderr, .. }) => {
                return Ok(Fetched::Unusable(format!("unreadable: {}", stderr)))
            }
            Err(err) => return Err(err),
        };
        if output.stdout.trim().is_empty() {
            return Ok(Fetched::Unusable("absent".to_string()));
        }
        Ok(match RemoteStateDocument::from_json(&output.stdout) {
            Ok(document) => Fetched::Valid(document),
            Err(err) => Fetched::Unusable(err.to_string()),
        })
    }

    async fn write(&self, document: &RemoteStateDocument) -> Result<(), WardenError> {
        let write = RemoteCommand::WriteFile {
            path: self.path.clone(),
            contents: document.to_json()?,
        };
        let output = self.shell.run(Phase::State, &write).await?;
        match output.exit_status {
            Some(0) | None => Ok(()),
            Some(code) => Err(WardenError::CommandFailure {
                phase: Phase::State,
                command: format!("write {}", self.path),
                stderr: if output.stderr.trim().is_empty() {
                    format!("exited with status {}", code)
                } else {
                    output.stderr.trim().to_string()
                },
            }),
        }
    }

    async fn load_locked(&self) -> Result<RemoteStateDocument, WardenError> {
        match self.fetch().await? {
            Fetched::Valid(document) => {
                if document.schema_version > SCHEMA_VERSION {
                    tracing::warn!(
                        "[{}] State document has schema {} (newer than {}); unknown fields will be dropped on write",
                        self.shell.device(),
                        document.schema_version,
                        SCHEMA_VERSION
                    );
                }
                Ok(document)
            }
            Fetched::Unusable(reason) => {
                tracing::warn!(
                    "[{}] State document {} is {}; writing defaults",
                    self.shell.device(),
                    self.path,
                    reason
                );
                let document = RemoteStateDocument::default();
                self.write(&document).await?;
                Ok(document)
            }
        }
    }

    /// Fetch the document, writing a default one back if it is absent or malformed
    pub async fn load(&self) -> Result<RemoteStateDocument, WardenError> {
        let _guard = self.locks.acquire(self.shell.device()).await;
        self.load_locked().await
    }

    /// Fetch the document without repairing it
    pub async fn peek(&self) -> Result<Option<RemoteStateDocument>, WardenError> {
        Ok(match self.fetch().await? {
            Fetched::Valid(document) => Some(document),
            Fetched::Unusable(_) => None,
        })
    }

    /// Load, mutate and write back the whole document.
    ///
    /// Nothing is written if `mutate` fails.
    pub async fn update<T, F>(&self, mutate: F) -> Result<T, WardenError>
    where
        F: FnOnce(&mut RemoteStateDocument) -> Result<T, WardenError>,
    {
        let _guard = self.locks.acquire(self.shell.device()).await;
        let mut document = self.load_locked().await?;
        let expected = document.revision;

        let value = mutate(&mut document)?;

        match self.fetch().await? {
            Fetched::Valid(current) if current.revision != expected => {
                return Err(WardenError::StaleRevision {
                    expected,
                    found: current.revision,
                });
            }
            Fetched::Valid(_) => {}
            Fetched::Unusable(reason) => {
                tracing::warn!(
                    "[{}] State document became {} during update; overwriting",
                    self.shell.device(),
                    reason
                );
            }
        }

        document.schema_version = SCHEMA_VERSION;
        document.revision = expected + 1;
        self.write(&document).await?;
        tracing::debug!(
            "[{}] State document written at revision {}",
            self.shell.device(),
            document.revision
        );
        Ok(value)
    }

    /// Replace a group's entry wholesale. Group 0 always keeps the reserved pair.
    pub async fn save_group(&self, group_id: GroupId, mut group: PolicyGroup) -> Result<(), WardenError> {
        group.group_id = group_id;
        if group_id == DEFAULT_GROUP {
            group.assign_class(ClassSlot::reserved());
        }
        self.update(|document| {
            document.groups.insert(group_id, group);
            Ok(())
        })
        .await
    }

    /// Remove a group and release its class pair
    pub async fn delete_group(&self, group_id: GroupId) -> Result<Option<PolicyGroup>, WardenError> {
        if group_id == DEFAULT_GROUP {
            return Err(WardenError::ProtectedGroup(group_id));
        }
        self.update(|document| document.remove_group(group_id)).await
    }

    pub async fn allocate_class(&self) -> Result<ClassSlot, WardenError> {
        let slot = self.update(RemoteStateDocument::allocate_class).await?;
        tracing::debug!("[{}] Allocated class 1:{}", self.shell.device(), slot.tc_class_id);
        Ok(slot)
    }

    /// Return a pair to the pool. The reserved pair is never accepted.
    pub async fn release_class(&self, slot: ClassSlot) -> Result<bool, WardenError> {
        if slot.is_reserved() {
            tracing::warn!(
                "[{}] Refusing to release reserved class 1:{}",
                self.shell.device(),
                slot.tc_class_id
            );
            return Ok(false);
        }
        self.update(|document| Ok(document.release_class(slot))).await
    }

    /// Diff a device list against the group's stored list, without validation
    pub async fn get_device_changes(
        &self,
        group_id: GroupId,
        devices: &[DeviceRef],
    ) -> Result<DeviceDelta, WardenError> {
        let document = self.load().await?;
        let stored = document
            .group(group_id)
            .map(|group| group.devices.as_slice())
            .unwrap_or_default();
        Ok(compute_delta(stored, devices))
    }

    /// Validate a proposed device list, failing on the first problem
    pub async fn check_devices(
        &self,
        group_id: GroupId,
        ips: &[String],
        macs: &[String],
    ) -> Result<(Vec<DeviceRef>, DeviceDelta), WardenError> {
        let devices = validate_devices(ips, macs)?;
        let document = self.load().await?;
        let delta = verify_against(&document, group_id, &devices)?;
        Ok((devices, delta))
    }

    /// Validate a proposed device list, reporting caller errors in the result
    pub async fn verify_devices(
        &self,
        group_id: GroupId,
        ips: &[String],
        macs: &[String],
    ) -> Result<DeviceVerificationResult, WardenError> {
        match self.check_devices(group_id, ips, macs).await {
            Ok((_, delta)) => Ok(DeviceVerificationResult::valid(delta)),
            Err(err) if err.is_caller_error() => Ok(DeviceVerificationResult::invalid(&err)),
            Err(err) => Err(err),
        }
    }
}
