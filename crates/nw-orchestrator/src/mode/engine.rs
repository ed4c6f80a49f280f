//! Mode activation engine
//!
//! Switching modes always goes through a full teardown followed by a rebuild
//! from scratch; there is no direct allow-to-deny edge. The sequence is not
//! atomic with respect to live traffic. Between the teardown phase and the
//! activate phase no list chain is hooked into `FORWARD`, so for that window
//! forwarded packets are classified only by the qdisc default (class `1:10`,
//! unrestricted). If a later phase fails, the router stays in that unmanaged
//! state until the next successful activation; nothing is rolled back.
//!
//! Rate limits are applied last and best effort. A failure there is logged and
//! the mode still counts as active.

use nw_core::config::ShapingConfig;
use nw_core::error::WardenError;
use nw_core::types::{ActiveMode, DeviceRef, GroupId, Phase};

use crate::commands::{
    member_rules_delete, member_rules_insert, ActivationPlan, ListMode, RemoteCommand, Table,
    Teardown, ALLOW_CHAIN, DENY_CHAIN, HOOK_CHAIN,
};
use crate::shell::DeviceShell;
use crate::store::RemoteStateStore;

/// Infer the active mode from `iptables -t mangle -S FORWARD` output.
///
/// The first hooked list chain wins.
pub fn parse_active_mode(rules: &str) -> ActiveMode {
    for line in rules.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("-A") || tokens.next() != Some(HOOK_CHAIN) {
            continue;
        }
        let mut rest = tokens.skip_while(|t| *t != "-j");
        rest.next();
        match rest.next() {
            Some(ALLOW_CHAIN) => return ActiveMode::AllowList,
            Some(DENY_CHAIN) => return ActiveMode::DenyList,
            _ => {}
        }
    }
    ActiveMode::None
}

/// Drives a router between disabled, allow-list and deny-list modes
#[derive(Clone)]
pub struct ModeEngine {
    shell: DeviceShell,
    store: RemoteStateStore,
    shaping: ShapingConfig,
}

impl ModeEngine {
    pub fn new(shell: DeviceShell, store: RemoteStateStore, shaping: ShapingConfig) -> Self {
        Self {
            shell,
            store,
            shaping,
        }
    }

    /// Read the live mode from the router
    pub async fn active_mode(&self) -> Result<ActiveMode, WardenError> {
        let list = RemoteCommand::ListRules {
            table: Table::Mangle,
            chain: HOOK_CHAIN.to_string(),
        };
        let output = self.shell.run(Phase::Probe, &list).await?;
        Ok(parse_active_mode(&output.stdout))
    }

    /// Listed devices unrestricted, everything else limited
    pub async fn activate_allow_list(&self, group_id: GroupId) -> Result<ActivationPlan, WardenError> {
        self.activate_group(ListMode::Allow, group_id).await
    }

    /// Listed devices limited, everything else unrestricted
    pub async fn activate_deny_list(&self, group_id: GroupId) -> Result<ActivationPlan, WardenError> {
        self.activate_group(ListMode::Deny, group_id).await
    }

    async fn activate_group(
        &self,
        mode: ListMode,
        group_id: GroupId,
    ) -> Result<ActivationPlan, WardenError> {
        let document = self.store.load().await?;
        let members = document
            .group(group_id)
            .map(|group| group.devices.clone())
            .unwrap_or_default();

        let plan = self.plan_activation(mode, &members).await?;
        self.execute_plan(&plan).await?;
        self.store
            .update(|document| {
                document.infrastructure.access_list_group = Some(group_id);
                Ok(())
            })
            .await?;
        tracing::info!(
            "[{}] {} active for group {} ({} devices)",
            self.shell.device(),
            plan.target(),
            group_id,
            members.len()
        );
        Ok(plan)
    }

    /// Activate a mode for an explicit member list without touching the store
    pub async fn activate_with(
        &self,
        mode: ListMode,
        members: &[DeviceRef],
    ) -> Result<ActivationPlan, WardenError> {
        self.store.load().await?;
        let plan = self.plan_activation(mode, members).await?;
        self.execute_plan(&plan).await?;
        Ok(plan)
    }

    /// Build the full teardown, rebuild, attach and rate-limit sequence
    pub async fn plan_activation(
        &self,
        mode: ListMode,
        members: &[DeviceRef],
    ) -> Result<ActivationPlan, WardenError> {
        let interfaces = self.shell.interfaces(&self.shaping).await?;
        Ok(Teardown::new()
            .rebuild(mode, members)
            .attach()
            .with_rate_limits(&interfaces, &self.shaping))
    }

    /// Run a plan phase by phase, stopping at the first failing phase
    pub async fn execute_plan(&self, plan: &ActivationPlan) -> Result<(), WardenError> {
        for phase in plan.phases() {
            if phase.phase == Phase::RateLimit {
                let failures = self
                    .shell
                    .run_best_effort(phase.phase, &phase.commands)
                    .await?;
                if failures > 0 {
                    tracing::warn!(
                        "[{}] {} rate-limit commands failed; previous rates stay in effect",
                        self.shell.device(),
                        failures
                    );
                }
            } else {
                self.shell.run_all(phase.phase, &phase.commands).await?;
            }
        }
        Ok(())
    }

    /// Tear down both list chains, leaving forwarding unmanaged
    pub async fn deactivate(&self) -> Result<ActivationPlan, WardenError> {
        let plan = Teardown::new().finish();
        self.execute_plan(&plan).await?;
        self.store
            .update(|document| {
                document.infrastructure.access_list_group = None;
                Ok(())
            })
            .await?;
        tracing::info!("[{}] Access lists deactivated", self.shell.device());
        Ok(plan)
    }

    /// Add one device's rules to the live list chain.
    ///
    /// Returns false without touching the router when no mode is active.
    pub async fn add_device_to_active_list(&self, device: &DeviceRef) -> Result<bool, WardenError> {
        let Some(mode) = ListMode::from_active(self.active_mode().await?) else {
            return Ok(false);
        };
        // Delete first so a repeated add leaves a single copy
        self.shell
            .run_all(Phase::Rebuild, &member_rules_delete(mode, device))
            .await?;
        self.shell
            .run_all(Phase::Rebuild, &member_rules_insert(mode, device))
            .await?;
        tracing::debug!("[{}] Added {} to {}", self.shell.device(), device, mode.chain());
        Ok(true)
    }

    /// Remove one device's rules from the live list chain
    pub async fn remove_device_from_active_list(
        &self,
        device: &DeviceRef,
    ) -> Result<bool, WardenError> {
        let Some(mode) = ListMode::from_active(self.active_mode().await?) else {
            return Ok(false);
        };
        self.shell
            .run_all(Phase::Rebuild, &member_rules_delete(mode, device))
            .await?;
        tracing::debug!("[{}] Removed {} from {}", self.shell.device(), device, mode.chain());
        Ok(true)
    }
}
