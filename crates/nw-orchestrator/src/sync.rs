//! Group synchronization
//!
//! [`GroupSync`] is what the policy layer calls. A sync validates the request
//! before touching the router, makes sure scaffolding exists, applies the
//! group's shaping and access rules, moves the access list if asked to, and
//! finally commits the group to the state document.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use nw_core::config::ShapingConfig;
use nw_core::error::WardenError;
use nw_core::time::{current_time_millis, in_window, local_time_of_day, parse_clock};
use nw_core::types::{ActiveMode, DeviceRef, GroupId, Phase, DEFAULT_GROUP};

use crate::commands::{
    group_access_commands, group_access_removal, group_mark_rules, group_shaping_commands,
    group_shaping_removal, member_rules_delete, member_rules_insert, ListMode, RemoteCommand,
    Teardown,
};
use crate::infra::Reconciler;
use crate::mode::ModeEngine;
use crate::shell::DeviceShell;
use crate::store::{
    validate_devices, verify_against, ClassSlot, DeviceDelta, DeviceVerificationResult,
    GroupPolicy, PolicyGroup, RemoteStateDocument, RemoteStateStore,
};

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthPolicy {
    /// Mbps; `None` removes the group's shaping class
    pub limit_mbps: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Access list to put this group's devices on. `None` leaves the live mode
    /// alone; `Some(ActiveMode::None)` tears the list down.
    pub mode: Option<ActiveMode>,
    pub blocked_sites: Vec<String>,
    pub block_all: bool,
}

/// A policy that applies during a daily window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeOverride {
    /// `HH:MM`
    pub start: String,
    /// `HH:MM`; at or before `start` means the window crosses midnight
    pub end: String,
    #[serde(default)]
    pub limit_mbps: Option<f64>,
    #[serde(default)]
    pub block_all: Option<bool>,
}

impl TimeOverride {
    fn window(&self) -> Result<(NaiveTime, NaiveTime), WardenError> {
        let parse = |value: &str| {
            parse_clock(value)
                .ok_or_else(|| WardenError::InvalidFormat(format!("invalid time of day: {}", value)))
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }
}

/// Desired state of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSyncRequest {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub macs: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub bandwidth: BandwidthPolicy,
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub overrides: Vec<TimeOverride>,
    /// Recreate all scaffolding instead of probing for it
    #[serde(default)]
    pub restart: bool,
    /// Compute the commands without running any mutation
    #[serde(default)]
    pub dry_run: bool,
}

impl GroupSyncRequest {
    pub fn new(group_id: GroupId, name: impl Into<String>) -> Self {
        Self {
            group_id,
            name: name.into(),
            ips: Vec::new(),
            macs: Vec::new(),
            active: true,
            bandwidth: BandwidthPolicy::default(),
            access: AccessPolicy::default(),
            overrides: Vec::new(),
            restart: false,
            dry_run: false,
        }
    }

    pub fn with_device(mut self, ip: impl Into<String>, mac: impl Into<String>) -> Self {
        self.ips.push(ip.into());
        self.macs.push(mac.into());
        self
    }
}

/// Commands a sync ran, or would run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterCommandBundle {
    pub tc_commands: Vec<String>,
    pub chain_commands: Vec<String>,
    pub cleanup_commands: Vec<String>,
    /// Scaffolding was (re)created or the access list was rebuilt from scratch
    pub requires_restart: bool,
    /// False for dry runs
    pub executed: bool,
    /// Mode live on the router afterwards
    pub active_mode: ActiveMode,
}

impl RouterCommandBundle {
    fn new(executed: bool) -> Self {
        Self {
            tc_commands: Vec::new(),
            chain_commands: Vec::new(),
            cleanup_commands: Vec::new(),
            requires_restart: false,
            executed,
            active_mode: ActiveMode::None,
        }
    }

    fn record<'a>(&mut self, commands: impl IntoIterator<Item = &'a RemoteCommand>) {
        for command in commands {
            if command.is_traffic_control() {
                self.tc_commands.push(command.to_string());
            } else {
                self.chain_commands.push(command.to_string());
            }
        }
    }

    fn record_cleanup<'a>(&mut self, commands: impl IntoIterator<Item = &'a RemoteCommand>) {
        self.cleanup_commands
            .extend(commands.into_iter().map(ToString::to_string));
    }

    pub fn len(&self) -> usize {
        self.tc_commands.len() + self.chain_commands.len() + self.cleanup_commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The policy in force at `now`: the request's base policy with the first
/// matching override applied.
pub fn effective_policy(
    request: &GroupSyncRequest,
    now: NaiveTime,
) -> Result<GroupPolicy, WardenError> {
    let mut policy = GroupPolicy {
        bandwidth_limit_mbps: request.bandwidth.limit_mbps,
        blocked_sites: request
            .access
            .blocked_sites
            .iter()
            .map(|site| site.trim().to_string())
            .filter(|site| !site.is_empty())
            .collect(),
        block_all: request.access.block_all,
    };

    let mut matched = false;
    for rule in &request.overrides {
        let (start, end) = rule.window()?;
        if !matched && in_window(now, start, end) {
            matched = true;
            if let Some(limit) = rule.limit_mbps {
                policy.bandwidth_limit_mbps = Some(limit);
            }
            if let Some(block_all) = rule.block_all {
                policy.block_all = block_all;
            }
        }
    }

    if let Some(limit) = policy.bandwidth_limit_mbps {
        if !limit.is_finite() || limit <= 0.0 {
            return Err(WardenError::InvalidFormat(format!(
                "bandwidth limit must be positive, got {}",
                limit
            )));
        }
    }
    Ok(policy)
}

/// Member rule changes for a live list, from a device delta
fn incremental_commands(mode: ListMode, delta: &DeviceDelta) -> Vec<RemoteCommand> {
    let mut commands = Vec::new();
    for device in delta.outgoing() {
        commands.extend(member_rules_delete(mode, device));
    }
    for device in delta.incoming() {
        commands.extend(member_rules_delete(mode, device));
        commands.extend(member_rules_insert(mode, device));
    }
    commands
}

fn has_access_rules(policy: &GroupPolicy) -> bool {
    policy.block_all || !policy.blocked_sites.is_empty()
}

/// Group-level operations against one router
#[derive(Clone)]
pub struct GroupSync {
    shell: DeviceShell,
    store: RemoteStateStore,
    engine: ModeEngine,
    reconciler: Reconciler,
    shaping: ShapingConfig,
}

impl GroupSync {
    pub fn new(shell: DeviceShell, store: RemoteStateStore, shaping: ShapingConfig) -> Self {
        Self {
            engine: ModeEngine::new(shell.clone(), store.clone(), shaping.clone()),
            reconciler: Reconciler::new(shell.clone(), store.clone(), shaping.clone()),
            shell,
            store,
            shaping,
        }
    }

    pub fn store(&self) -> &RemoteStateStore {
        &self.store
    }

    pub fn engine(&self) -> &ModeEngine {
        &self.engine
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn get_active_mode(&self) -> Result<ActiveMode, WardenError> {
        self.engine.active_mode().await
    }

    pub async fn verify_devices(
        &self,
        group_id: GroupId,
        ips: &[String],
        macs: &[String],
    ) -> Result<DeviceVerificationResult, WardenError> {
        self.store.verify_devices(group_id, ips, macs).await
    }

    async fn run(
        &self,
        dry_run: bool,
        phase: Phase,
        commands: &[RemoteCommand],
    ) -> Result<(), WardenError> {
        if dry_run {
            return Ok(());
        }
        self.shell.run_all(phase, commands).await
    }

    /// Bring the router in line with a group's desired state
    pub async fn sync_group(
        &self,
        request: &GroupSyncRequest,
    ) -> Result<RouterCommandBundle, WardenError> {
        self.sync_group_at(request, local_time_of_day()).await
    }

    /// [`sync_group`](Self::sync_group) with an explicit local time for overrides
    pub async fn sync_group_at(
        &self,
        request: &GroupSyncRequest,
        now: NaiveTime,
    ) -> Result<RouterCommandBundle, WardenError> {
        let group_id = request.group_id;
        let dry_run = request.dry_run;

        // Everything the caller can get wrong is checked before any mutation
        let policy = effective_policy(request, now)?;
        let devices = validate_devices(&request.ips, &request.macs)?;
        let document = if dry_run {
            self.store.peek().await?.unwrap_or_default()
        } else {
            self.store.load().await?
        };
        let delta = verify_against(&document, group_id, &devices)?;
        let previous = document.group(group_id).cloned();

        tracing::info!(
            "[{}] Syncing group {} '{}' ({} devices{})",
            self.shell.device(),
            group_id,
            request.name,
            devices.len(),
            if dry_run { ", dry run" } else { "" }
        );

        let shaped = request.active && policy.bandwidth_limit_mbps.is_some();
        let mut fresh_slot = None;
        let slot = if group_id == DEFAULT_GROUP {
            Some(ClassSlot::reserved())
        } else if let Some(slot) = previous.as_ref().and_then(PolicyGroup::class_slot) {
            Some(slot)
        } else if shaped {
            if dry_run {
                Some(document.clone().allocate_class()?)
            } else {
                let slot = self.store.allocate_class().await?;
                fresh_slot = Some(slot);
                Some(slot)
            }
        } else {
            None
        };

        let mut bundle = RouterCommandBundle::new(!dry_run);
        let result: Result<(), WardenError> = async {
            let owner = self
                .apply(request, &policy, &devices, &delta, previous.as_ref(), slot, &document, &mut bundle)
                .await?;
            if !dry_run {
                self.commit(request, policy.clone(), devices.clone(), shaped, slot, owner)
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            if let Some(slot) = fresh_slot {
                if let Err(release_err) = self.store.release_class(slot).await {
                    tracing::warn!(
                        "[{}] Could not release class 1:{} after failed sync: {}",
                        self.shell.device(),
                        slot.tc_class_id,
                        release_err
                    );
                }
            }
            return Err(err);
        }

        tracing::info!(
            "[{}] Group {} synced: {} commands, mode {}",
            self.shell.device(),
            group_id,
            bundle.len(),
            bundle.active_mode
        );
        Ok(bundle)
    }

    /// Router side of a sync. Returns the new access list owner, if it changes.
    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        request: &GroupSyncRequest,
        policy: &GroupPolicy,
        devices: &[DeviceRef],
        delta: &DeviceDelta,
        previous: Option<&PolicyGroup>,
        slot: Option<ClassSlot>,
        document: &RemoteStateDocument,
        bundle: &mut RouterCommandBundle,
    ) -> Result<Option<Option<GroupId>>, WardenError> {
        let group_id = request.group_id;
        let dry_run = request.dry_run;

        let setup = if dry_run {
            self.reconciler.preview(request.restart).await?
        } else {
            self.reconciler.ensure(request.restart).await?
        };
        if !setup.is_empty() {
            bundle.requires_restart = true;
        }
        bundle.record(&setup.commands);
        bundle.record_cleanup(&setup.cleanup);

        let interfaces = self.shell.interfaces(&self.shaping).await?;

        // Shaping
        let previous_marks = previous
            .filter(|group| group.active && group.policy.bandwidth_limit_mbps.is_some())
            .and_then(|group| {
                group
                    .class_slot()
                    .map(|slot| (slot, group.devices.as_slice()))
            });
        match (policy.bandwidth_limit_mbps, slot) {
            (Some(limit), Some(slot)) if request.active => {
                let tc = group_shaping_commands(slot.tc_class_id, slot.mark_value, limit, &interfaces);
                let rules = group_mark_rules(
                    previous_marks.map(|(old, devices)| (old.mark_value, devices)),
                    Some((slot.mark_value, devices)),
                );
                bundle.record(&tc);
                bundle.record(&rules);
                self.run(dry_run, Phase::GroupShaping, &tc).await?;
                self.run(dry_run, Phase::GroupShaping, &rules).await?;
            }
            _ => {
                if let Some((old, old_devices)) = previous_marks {
                    let mut removal = group_mark_rules(Some((old.mark_value, old_devices)), None);
                    removal.extend(group_shaping_removal(
                        old.tc_class_id,
                        old.mark_value,
                        &interfaces,
                    ));
                    bundle.record_cleanup(&removal);
                    self.run(dry_run, Phase::GroupShaping, &removal).await?;
                }
            }
        }

        // Access control
        if request.active && !devices.is_empty() && has_access_rules(policy) {
            let commands = group_access_commands(
                group_id,
                devices,
                policy.block_all,
                &policy.blocked_sites,
            );
            bundle.record(&commands);
            self.run(dry_run, Phase::AccessControl, &commands).await?;
        } else if previous.map_or(false, |group| has_access_rules(&group.policy)) {
            let commands = group_access_removal(group_id);
            bundle.record_cleanup(&commands);
            self.run(dry_run, Phase::AccessControl, &commands).await?;
        }

        // Access list mode
        let live = self.engine.active_mode().await?;
        let current_owner = document.infrastructure.access_list_group;
        let owns = current_owner == Some(group_id);
        bundle.active_mode = live;

        let requested = if request.active {
            request.access.mode.map(ListMode::from_active)
        } else if owns {
            // An inactive group cannot hold the list
            Some(None)
        } else {
            None
        };

        let mut owner_change = None;
        match requested {
            Some(None) => {
                if live != ActiveMode::None && (owns || current_owner.is_none()) {
                    let plan = Teardown::new().finish();
                    bundle.record_cleanup(plan.commands());
                    if !dry_run {
                        self.engine.execute_plan(&plan).await?;
                    }
                    bundle.active_mode = ActiveMode::None;
                    owner_change = Some(None);
                } else if live != ActiveMode::None {
                    tracing::warn!(
                        "[{}] Access list belongs to group {:?}; not tearing it down for group {}",
                        self.shell.device(),
                        current_owner,
                        group_id
                    );
                } else if owns {
                    owner_change = Some(None);
                }
            }
            Some(Some(mode)) => {
                // A restart emptied the chains, so the list is rebuilt in full
                if live == mode.active_mode() && owns && !request.restart {
                    let commands = incremental_commands(mode, delta);
                    bundle.record(&commands);
                    self.run(dry_run, Phase::Rebuild, &commands).await?;
                } else {
                    let plan = self.engine.plan_activation(mode, devices).await?;
                    bundle.record(plan.commands());
                    if !dry_run {
                        self.engine.execute_plan(&plan).await?;
                    }
                    bundle.requires_restart = true;
                    owner_change = Some(Some(group_id));
                }
                bundle.active_mode = mode.active_mode();
            }
            None => {
                if let (true, Some(mode)) = (owns, ListMode::from_active(live)) {
                    if request.restart {
                        let plan = self.engine.plan_activation(mode, devices).await?;
                        bundle.record(plan.commands());
                        if !dry_run {
                            self.engine.execute_plan(&plan).await?;
                        }
                    } else {
                        let commands = incremental_commands(mode, delta);
                        bundle.record(&commands);
                        self.run(dry_run, Phase::Rebuild, &commands).await?;
                    }
                }
            }
        }
        Ok(owner_change)
    }

    async fn commit(
        &self,
        request: &GroupSyncRequest,
        policy: GroupPolicy,
        devices: Vec<DeviceRef>,
        shaped: bool,
        slot: Option<ClassSlot>,
        owner: Option<Option<GroupId>>,
    ) -> Result<(), WardenError> {
        let group_id = request.group_id;
        let mut group = PolicyGroup::new(group_id, request.name.clone());
        group.active = request.active;
        group.devices = devices;
        group.policy = policy;
        group.infrastructure_created = true;
        group.last_sync = Some(current_time_millis());

        self.store
            .update(move |document| {
                // Another caller may have claimed a device since validation
                verify_against(document, group_id, &group.devices)?;

                if group_id == DEFAULT_GROUP {
                    group.assign_class(ClassSlot::reserved());
                } else if let (true, Some(slot)) = (shaped, slot) {
                    group.assign_class(slot);
                } else if let Some(slot) = slot {
                    document.release_class(slot);
                }
                document.groups.insert(group_id, group);
                if let Some(owner) = owner {
                    document.infrastructure.access_list_group = owner;
                }
                Ok(())
            })
            .await
    }

    /// Remove a group's footprint from the router, then from the state document
    pub async fn remove_group(
        &self,
        group_id: GroupId,
        dry_run: bool,
    ) -> Result<RouterCommandBundle, WardenError> {
        if group_id == DEFAULT_GROUP {
            return Err(WardenError::ProtectedGroup(group_id));
        }

        let document = self.store.load().await?;
        let mut bundle = RouterCommandBundle::new(!dry_run);
        let live = self.engine.active_mode().await?;
        bundle.active_mode = live;

        let Some(group) = document.group(group_id).cloned() else {
            tracing::debug!("[{}] Group {} not present", self.shell.device(), group_id);
            return Ok(bundle);
        };

        if let Some(slot) = group.class_slot() {
            let interfaces = self.shell.interfaces(&self.shaping).await?;
            let mut commands = group_mark_rules(Some((slot.mark_value, group.devices.as_slice())), None);
            commands.extend(group_shaping_removal(
                slot.tc_class_id,
                slot.mark_value,
                &interfaces,
            ));
            bundle.record_cleanup(&commands);
            self.run(dry_run, Phase::Cleanup, &commands).await?;
        }

        let commands = group_access_removal(group_id);
        bundle.record_cleanup(&commands);
        self.run(dry_run, Phase::Cleanup, &commands).await?;

        if document.infrastructure.access_list_group == Some(group_id) && live != ActiveMode::None {
            let plan = Teardown::new().finish();
            bundle.record_cleanup(plan.commands());
            if !dry_run {
                self.engine.execute_plan(&plan).await?;
            }
            bundle.active_mode = ActiveMode::None;
        }

        if !dry_run {
            self.store.delete_group(group_id).await?;
            tracing::info!("[{}] Group {} '{}' removed", self.shell.device(), group_id, group.name);
        }
        Ok(bundle)
    }
}
