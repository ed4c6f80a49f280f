//! Infrastructure reconciler
//!
//! Probes the router for each piece of scaffolding separately and creates only
//! what is missing. `restart` skips the probes and recreates everything.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use nw_core::config::ShapingConfig;
use nw_core::error::WardenError;
use nw_core::types::Phase;

use crate::commands::{
    RemoteCommand, Rule, Table, ALLOW_CHAIN, DENY_CHAIN, GROUP_CHAIN, HOOK_CHAIN, LEGACY_CHAINS,
    LIMITED_CLASS, ROOT_CLASS, UNRESTRICTED_CLASS,
};
use crate::shell::DeviceShell;
use crate::store::RemoteStateStore;

/// Minimum `class` lines expected on the probe interface
const MIN_SHAPING_CLASSES: usize = 2;

/// A piece of router scaffolding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    StateDocument,
    AllowChain,
    DenyChain,
    GroupChain,
    ShapingClasses,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::StateDocument,
        Component::AllowChain,
        Component::DenyChain,
        Component::GroupChain,
        Component::ShapingClasses,
    ];
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::StateDocument => "state document",
            Component::AllowChain => "allow-list chain",
            Component::DenyChain => "deny-list chain",
            Component::GroupChain => "group chain",
            Component::ShapingClasses => "shaping classes",
        };
        f.write_str(name)
    }
}

/// What [`Reconciler::check_existing`] found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfrastructureReport {
    pub all_satisfied: bool,
    pub missing: Vec<Component>,
    pub details: BTreeMap<Component, String>,
}

/// Components to create and the commands that create them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReport {
    pub created: Vec<Component>,
    pub commands: Vec<RemoteCommand>,
    /// Legacy scaffolding removal, run best effort after any creation
    pub cleanup: Vec<RemoteCommand>,
    pub cleanup_failures: usize,
}

impl SetupReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}

fn chain_for(component: Component) -> Option<&'static str> {
    match component {
        Component::AllowChain => Some(ALLOW_CHAIN),
        Component::DenyChain => Some(DENY_CHAIN),
        Component::GroupChain => Some(GROUP_CHAIN),
        _ => None,
    }
}

fn create_chain(chain: &str, reset: bool) -> Vec<RemoteCommand> {
    let mut commands = vec![RemoteCommand::NewChain {
        table: Table::Mangle,
        chain: chain.to_string(),
    }];
    if reset {
        commands.push(RemoteCommand::FlushChain {
            table: Table::Mangle,
            chain: chain.to_string(),
        });
    }
    commands
}

/// Commands that create one component. The state document has none; it is
/// created by a self-healing load.
///
/// With `reset`, chains that already exist are also emptied.
pub fn setup_commands(
    component: Component,
    interfaces: &[String],
    shaping: &ShapingConfig,
    reset: bool,
) -> Vec<RemoteCommand> {
    match component {
        Component::StateDocument => Vec::new(),
        Component::AllowChain | Component::DenyChain => chain_for(component)
            .map(|chain| create_chain(chain, reset))
            .unwrap_or_default(),
        Component::GroupChain => {
            let mut commands = create_chain(GROUP_CHAIN, reset);
            commands.extend([
                RemoteCommand::DeleteRule {
                    table: Table::Mangle,
                    chain: HOOK_CHAIN.to_string(),
                    rule: Rule::Jump(GROUP_CHAIN.to_string()),
                },
                RemoteCommand::AppendRule {
                    table: Table::Mangle,
                    chain: HOOK_CHAIN.to_string(),
                    rule: Rule::Jump(GROUP_CHAIN.to_string()),
                },
            ]);
            commands
        }
        Component::ShapingClasses => {
            let link = shaping.link_rate_mbit.saturating_mul(1000);
            let mut commands = Vec::new();
            for iface in interfaces {
                commands.push(RemoteCommand::ReplaceQdisc {
                    iface: iface.clone(),
                    default_class: UNRESTRICTED_CLASS,
                });
                commands.push(RemoteCommand::ReplaceClass {
                    iface: iface.clone(),
                    parent: "1:".to_string(),
                    class_id: 1,
                    rate_kbit: link,
                    ceil_kbit: link,
                });
                for (class_id, rate) in [
                    (UNRESTRICTED_CLASS, shaping.unrestricted_rate_mbit),
                    (LIMITED_CLASS, shaping.limited_rate_mbit),
                ] {
                    let kbit = rate.saturating_mul(1000);
                    commands.push(RemoteCommand::ReplaceClass {
                        iface: iface.clone(),
                        parent: ROOT_CLASS.to_string(),
                        class_id,
                        rate_kbit: kbit,
                        ceil_kbit: kbit,
                    });
                }
                for class_id in [UNRESTRICTED_CLASS, LIMITED_CLASS] {
                    commands.push(RemoteCommand::ReplaceFilter {
                        iface: iface.clone(),
                        mark: class_id,
                        class_id,
                    });
                }
            }
            commands
        }
    }
}

/// Unhook, clear and delete the superseded whitelist/blacklist chains
pub fn legacy_cleanup_commands() -> Vec<RemoteCommand> {
    LEGACY_CHAINS
        .iter()
        .flat_map(|chain| {
            [
                RemoteCommand::DeleteRule {
                    table: Table::Filter,
                    chain: HOOK_CHAIN.to_string(),
                    rule: Rule::Jump((*chain).to_string()),
                },
                RemoteCommand::FlushChain {
                    table: Table::Filter,
                    chain: (*chain).to_string(),
                },
                RemoteCommand::DeleteChain {
                    table: Table::Filter,
                    chain: (*chain).to_string(),
                },
            ]
        })
        .collect()
}

fn count_classes(stdout: &str) -> usize {
    stdout
        .lines()
        .filter(|line| line.trim_start().starts_with("class "))
        .count()
}

/// Checks and creates router scaffolding
#[derive(Clone)]
pub struct Reconciler {
    shell: DeviceShell,
    store: RemoteStateStore,
    shaping: ShapingConfig,
}

impl Reconciler {
    pub fn new(shell: DeviceShell, store: RemoteStateStore, shaping: ShapingConfig) -> Self {
        Self {
            shell,
            store,
            shaping,
        }
    }

    /// Probe a component. `Ok(Err(detail))` means missing.
    async fn probe(&self, component: Component) -> Result<Result<String, String>, WardenError> {
        let command = match component {
            Component::StateDocument => RemoteCommand::FileExists {
                path: self.store.path().to_string(),
            },
            Component::ShapingClasses => RemoteCommand::ShowClasses {
                iface: self.shaping.probe_interface.clone(),
            },
            other => RemoteCommand::ChainExists {
                table: Table::Mangle,
                chain: chain_for(other).unwrap_or_default().to_string(),
            },
        };

        let output = match self.shell.run(Phase::Probe, &command).await {
            Ok(output) => output,
            Err(err @ WardenError::SessionExpired(_)) => return Err(err),
            Err(err) => return Ok(Err(format!("probe failed: {}", err))),
        };

        Ok(match component {
            Component::ShapingClasses => {
                let found = count_classes(&output.stdout);
                if found >= MIN_SHAPING_CLASSES {
                    Ok(format!("{} classes on {}", found, self.shaping.probe_interface))
                } else {
                    Err(format!(
                        "{} classes on {}, expected at least {}",
                        found, self.shaping.probe_interface, MIN_SHAPING_CLASSES
                    ))
                }
            }
            _ if output.stdout.trim() == "present" => Ok("present".to_string()),
            _ => Err("missing".to_string()),
        })
    }

    /// Probe every component. One failing probe never hides the others.
    pub async fn check_existing(&self) -> Result<InfrastructureReport, WardenError> {
        let mut missing = Vec::new();
        let mut details = BTreeMap::new();
        for component in Component::ALL {
            let detail = match self.probe(component).await? {
                Ok(detail) => detail,
                Err(detail) => {
                    missing.push(component);
                    detail
                }
            };
            details.insert(component, detail);
        }
        Ok(InfrastructureReport {
            all_satisfied: missing.is_empty(),
            missing,
            details,
        })
    }

    async fn plan(&self, missing: &[Component], reset: bool) -> Result<SetupReport, WardenError> {
        let mut report = SetupReport::default();
        if missing.is_empty() {
            return Ok(report);
        }
        let interfaces = if missing.contains(&Component::ShapingClasses) {
            self.shell.interfaces(&self.shaping).await?
        } else {
            Vec::new()
        };
        for component in Component::ALL {
            if missing.contains(&component) {
                report.created.push(component);
                report
                    .commands
                    .extend(setup_commands(component, &interfaces, &self.shaping, reset));
            }
        }
        report.cleanup = legacy_cleanup_commands();
        Ok(report)
    }

    /// Create exactly the listed components. `reset` also empties existing chains.
    pub async fn setup(
        &self,
        missing: &[Component],
        reset: bool,
    ) -> Result<SetupReport, WardenError> {
        let mut report = self.plan(missing, reset).await?;
        if report.is_empty() {
            return Ok(report);
        }

        if report.created.contains(&Component::StateDocument) {
            self.store.load().await?;
        }
        self.shell
            .run_all(Phase::Infrastructure, &report.commands)
            .await?;
        for component in &report.created {
            tracing::info!("[{}] Created {}", self.shell.device(), component);
        }

        report.cleanup_failures = self
            .shell
            .run_best_effort(Phase::Cleanup, &report.cleanup)
            .await?;

        self.store
            .update(|document| {
                document.infrastructure.base_setup_complete = true;
                Ok(())
            })
            .await?;
        Ok(report)
    }

    /// Components `ensure` would create
    async fn needed(&self, restart: bool) -> Result<Vec<Component>, WardenError> {
        if restart {
            return Ok(Component::ALL.to_vec());
        }
        let report = self.check_existing().await?;
        if !report.all_satisfied {
            tracing::info!(
                "[{}] Missing infrastructure: {:?}",
                self.shell.device(),
                report.missing
            );
        }
        Ok(report.missing)
    }

    /// Make sure all scaffolding exists. `restart` recreates every component.
    pub async fn ensure(&self, restart: bool) -> Result<SetupReport, WardenError> {
        let missing = self.needed(restart).await?;
        if missing.is_empty() {
            tracing::debug!("[{}] Infrastructure already in place", self.shell.device());
        }
        self.setup(&missing, restart).await
    }

    /// What `ensure` would do, without running any mutation
    pub async fn preview(&self, restart: bool) -> Result<SetupReport, WardenError> {
        let missing = self.needed(restart).await?;
        self.plan(&missing, restart).await
    }
}
