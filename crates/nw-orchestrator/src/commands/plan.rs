//! Command plans
//!
//! Mode activation is always teardown, rebuild, attach, then rate limits. The
//! plan types form a chain (`Teardown -> Rebuilt -> Attached -> ActivationPlan`)
//! so a plan cannot be assembled out of that order.

use nw_core::config::ShapingConfig;
use nw_core::types::{ActiveMode, DeviceRef, GroupId, Phase};

use super::remote::{mbit_to_kbit, RemoteCommand, Rule, Table};
use super::{
    access_chain, ALLOW_CHAIN, DENY_CHAIN, GROUP_CHAIN, HOOK_CHAIN, LIMITED_CLASS, ROOT_CLASS,
    TEARDOWN_HOOKS, UNRESTRICTED_CLASS,
};

/// Commands that belong to one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub phase: Phase,
    pub commands: Vec<RemoteCommand>,
}

/// Polarity of an access list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    Allow,
    Deny,
}

impl ListMode {
    pub fn from_active(mode: ActiveMode) -> Option<Self> {
        match mode {
            ActiveMode::AllowList => Some(ListMode::Allow),
            ActiveMode::DenyList => Some(ListMode::Deny),
            ActiveMode::None => None,
        }
    }

    pub fn active_mode(self) -> ActiveMode {
        match self {
            ListMode::Allow => ActiveMode::AllowList,
            ListMode::Deny => ActiveMode::DenyList,
        }
    }

    pub fn chain(self) -> &'static str {
        match self {
            ListMode::Allow => ALLOW_CHAIN,
            ListMode::Deny => DENY_CHAIN,
        }
    }

    /// Mark applied to traffic no member rule matched
    pub fn default_mark(self) -> u32 {
        match self {
            ListMode::Allow => LIMITED_CLASS,
            ListMode::Deny => UNRESTRICTED_CLASS,
        }
    }

    /// Mark applied to listed devices
    pub fn member_mark(self) -> u32 {
        match self {
            ListMode::Allow => UNRESTRICTED_CLASS,
            ListMode::Deny => LIMITED_CLASS,
        }
    }
}

/// First stage: detach both list chains from every hook and clear them
#[derive(Debug, Clone)]
pub struct Teardown {
    phases: Vec<PhasePlan>,
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

impl Teardown {
    pub fn new() -> Self {
        let mut commands = Vec::new();
        for chain in [ALLOW_CHAIN, DENY_CHAIN] {
            for hook in TEARDOWN_HOOKS {
                commands.push(RemoteCommand::DeleteRule {
                    table: Table::Mangle,
                    chain: (*hook).to_string(),
                    rule: Rule::Jump(chain.to_string()),
                });
            }
        }
        for chain in [ALLOW_CHAIN, DENY_CHAIN] {
            commands.push(RemoteCommand::FlushChain {
                table: Table::Mangle,
                chain: chain.to_string(),
            });
        }
        Self {
            phases: vec![PhasePlan {
                phase: Phase::Teardown,
                commands,
            }],
        }
    }

    /// Repopulate the target chain: default rule first, member overrides above it.
    ///
    /// The chain is created if an earlier setup never ran.
    pub fn rebuild(mut self, mode: ListMode, members: &[DeviceRef]) -> Rebuilt {
        let chain = mode.chain();
        let mut commands = vec![
            RemoteCommand::NewChain {
                table: Table::Mangle,
                chain: chain.to_string(),
            },
            RemoteCommand::FlushChain {
                table: Table::Mangle,
                chain: chain.to_string(),
            },
            RemoteCommand::AppendRule {
                table: Table::Mangle,
                chain: chain.to_string(),
                rule: Rule::MarkAll {
                    mark: mode.default_mark(),
                },
            },
        ];
        for device in members {
            commands.extend(member_rules_insert(mode, device));
        }
        self.phases.push(PhasePlan {
            phase: Phase::Rebuild,
            commands,
        });
        Rebuilt {
            phases: self.phases,
            mode,
        }
    }

    /// Stop after teardown (deactivation)
    pub fn finish(self) -> ActivationPlan {
        ActivationPlan {
            target: ActiveMode::None,
            phases: self.phases,
        }
    }
}

/// Second stage: the target chain is populated but not attached
#[derive(Debug, Clone)]
pub struct Rebuilt {
    phases: Vec<PhasePlan>,
    mode: ListMode,
}

impl Rebuilt {
    /// Attach the chain at the single hook point
    pub fn attach(mut self) -> Attached {
        self.phases.push(PhasePlan {
            phase: Phase::Activate,
            commands: vec![RemoteCommand::InsertRule {
                table: Table::Mangle,
                chain: HOOK_CHAIN.to_string(),
                position: 1,
                rule: Rule::Jump(self.mode.chain().to_string()),
            }],
        });
        Attached {
            phases: self.phases,
            mode: self.mode,
        }
    }
}

/// Third stage: the chain is live
#[derive(Debug, Clone)]
pub struct Attached {
    phases: Vec<PhasePlan>,
    mode: ListMode,
}

impl Attached {
    /// Push the configured rates to both standard classes on every interface
    pub fn with_rate_limits(mut self, interfaces: &[String], shaping: &ShapingConfig) -> ActivationPlan {
        let mut commands = Vec::new();
        for iface in interfaces {
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
        }
        self.phases.push(PhasePlan {
            phase: Phase::RateLimit,
            commands,
        });
        self.finish()
    }

    pub fn finish(self) -> ActivationPlan {
        ActivationPlan {
            target: self.mode.active_mode(),
            phases: self.phases,
        }
    }
}

/// A complete, ordered activation or deactivation
#[derive(Debug, Clone)]
pub struct ActivationPlan {
    target: ActiveMode,
    phases: Vec<PhasePlan>,
}

impl ActivationPlan {
    pub fn target(&self) -> ActiveMode {
        self.target
    }

    pub fn phases(&self) -> &[PhasePlan] {
        &self.phases
    }

    pub fn commands(&self) -> impl Iterator<Item = &RemoteCommand> {
        self.phases.iter().flat_map(|p| p.commands.iter())
    }

    pub fn rendered(&self) -> Vec<String> {
        self.commands().map(ToString::to_string).collect()
    }
}

fn member_rules(mode: ListMode, device: &DeviceRef) -> [Rule; 4] {
    let mark = mode.member_mark();
    [
        Rule::MarkMac {
            mac: device.mac.clone(),
            mark,
        },
        Rule::ReturnMac {
            mac: device.mac.clone(),
        },
        Rule::MarkIp {
            ip: device.ip.clone(),
            mark,
        },
        Rule::ReturnIp {
            ip: device.ip.clone(),
        },
    ]
}

/// Insert a member's mark-and-return rules at the top of the list chain.
///
/// Rules are inserted in reverse so they end up in mark, return order.
pub fn member_rules_insert(mode: ListMode, device: &DeviceRef) -> Vec<RemoteCommand> {
    member_rules(mode, device)
        .into_iter()
        .rev()
        .map(|rule| RemoteCommand::InsertRule {
            table: Table::Mangle,
            chain: mode.chain().to_string(),
            position: 1,
            rule,
        })
        .collect()
}

/// Remove a member's rules from the list chain
pub fn member_rules_delete(mode: ListMode, device: &DeviceRef) -> Vec<RemoteCommand> {
    member_rules(mode, device)
        .into_iter()
        .map(|rule| RemoteCommand::DeleteRule {
            table: Table::Mangle,
            chain: mode.chain().to_string(),
            rule,
        })
        .collect()
}

/// HTB class and fw filter for a group on every interface
pub fn group_shaping_commands(
    class_id: u32,
    mark: u32,
    limit_mbps: f64,
    interfaces: &[String],
) -> Vec<RemoteCommand> {
    let kbit = mbit_to_kbit(limit_mbps);
    interfaces
        .iter()
        .flat_map(|iface| {
            [
                RemoteCommand::ReplaceClass {
                    iface: iface.clone(),
                    parent: ROOT_CLASS.to_string(),
                    class_id,
                    rate_kbit: kbit,
                    ceil_kbit: kbit,
                },
                RemoteCommand::ReplaceFilter {
                    iface: iface.clone(),
                    mark,
                    class_id,
                },
            ]
        })
        .collect()
}

/// Remove a group's filter and class from every interface
pub fn group_shaping_removal(class_id: u32, mark: u32, interfaces: &[String]) -> Vec<RemoteCommand> {
    interfaces
        .iter()
        .flat_map(|iface| {
            [
                RemoteCommand::DeleteFilter {
                    iface: iface.clone(),
                    mark,
                },
                RemoteCommand::DeleteClass {
                    iface: iface.clone(),
                    class_id,
                },
            ]
        })
        .collect()
}

fn group_marks(mark: u32, device: &DeviceRef) -> [Rule; 2] {
    [
        Rule::MarkMac {
            mac: device.mac.clone(),
            mark,
        },
        Rule::MarkIp {
            ip: device.ip.clone(),
            mark,
        },
    ]
}

/// Replace a group's mark rules in the group chain.
///
/// `previous` rules are deleted, then each `current` rule is deleted and
/// re-appended so repeated syncs never duplicate rules.
pub fn group_mark_rules(
    previous: Option<(u32, &[DeviceRef])>,
    current: Option<(u32, &[DeviceRef])>,
) -> Vec<RemoteCommand> {
    let delete = |rule: Rule| RemoteCommand::DeleteRule {
        table: Table::Mangle,
        chain: GROUP_CHAIN.to_string(),
        rule,
    };

    let mut commands = Vec::new();
    if let Some((mark, devices)) = previous {
        for device in devices {
            commands.extend(group_marks(mark, device).into_iter().map(delete));
        }
    }
    if let Some((mark, devices)) = current {
        for device in devices {
            for rule in group_marks(mark, device) {
                commands.push(delete(rule.clone()));
                commands.push(RemoteCommand::mangle_rule(GROUP_CHAIN, rule));
            }
        }
    }
    commands
}

/// (Re)build a group's filter chain and hook it into `FORWARD`
pub fn group_access_commands(
    group_id: GroupId,
    devices: &[DeviceRef],
    block_all: bool,
    blocked_sites: &[String],
) -> Vec<RemoteCommand> {
    let chain = access_chain(group_id);
    let mut commands = vec![
        RemoteCommand::NewChain {
            table: Table::Filter,
            chain: chain.clone(),
        },
        RemoteCommand::FlushChain {
            table: Table::Filter,
            chain: chain.clone(),
        },
    ];

    for device in devices {
        let rules: Vec<Rule> = if block_all {
            vec![
                Rule::DropMac {
                    mac: device.mac.clone(),
                },
                Rule::DropIp {
                    ip: device.ip.clone(),
                },
            ]
        } else {
            blocked_sites
                .iter()
                .map(|site| Rule::DropSite {
                    ip: device.ip.clone(),
                    site: site.clone(),
                })
                .collect()
        };
        commands.extend(rules.into_iter().map(|rule| RemoteCommand::AppendRule {
            table: Table::Filter,
            chain: chain.clone(),
            rule,
        }));
    }

    commands.push(RemoteCommand::DeleteRule {
        table: Table::Filter,
        chain: HOOK_CHAIN.to_string(),
        rule: Rule::Jump(chain.clone()),
    });
    commands.push(RemoteCommand::InsertRule {
        table: Table::Filter,
        chain: HOOK_CHAIN.to_string(),
        position: 1,
        rule: Rule::Jump(chain),
    });
    commands
}

/// Unhook, clear and delete a group's filter chain
pub fn group_access_removal(group_id: GroupId) -> Vec<RemoteCommand> {
    let chain = access_chain(group_id);
    vec![
        RemoteCommand::DeleteRule {
            table: Table::Filter,
            chain: HOOK_CHAIN.to_string(),
            rule: Rule::Jump(chain.clone()),
        },
        RemoteCommand::FlushChain {
            table: Table::Filter,
            chain: chain.clone(),
        },
        RemoteCommand::DeleteChain {
            table: Table::Filter,
            chain,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceRef {
        DeviceRef::new("10.0.0.5", "aa:bb:cc:dd:ee:01")
    }

    #[test]
    fn test_teardown_covers_every_hook() {
        let plan = Teardown::new().finish();
        assert_eq!(plan.target(), ActiveMode::None);
        let rendered = plan.rendered();
        for hook in TEARDOWN_HOOKS {
            assert!(rendered.contains(&format!("iptables -t mangle -D {} -j NW_ALLOW", hook)));
            assert!(rendered.contains(&format!("iptables -t mangle -D {} -j NW_DENY", hook)));
        }
        assert_eq!(
            rendered.last().unwrap(),
            "iptables -t mangle -F NW_DENY"
        );
    }

    #[test]
    fn test_activation_phase_order() {
        let shaping = ShapingConfig::default();
        let plan = Teardown::new()
            .rebuild(ListMode::Allow, &[device()])
            .attach()
            .with_rate_limits(&["br-lan".to_string()], &shaping);

        let phases: Vec<Phase> = plan.phases().iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![Phase::Teardown, Phase::Rebuild, Phase::Activate, Phase::RateLimit]
        );
        assert_eq!(plan.target(), ActiveMode::AllowList);

        let activate = &plan.phases()[2].commands;
        assert_eq!(activate.len(), 1);
        assert_eq!(
            activate[0].to_string(),
            "iptables -t mangle -I FORWARD 1 -j NW_ALLOW"
        );
    }

    #[test]
    fn test_rebuild_inserts_default_before_members() {
        let plan = Teardown::new()
            .rebuild(ListMode::Deny, &[device()])
            .attach()
            .finish();
        let rebuild = &plan.phases()[1].commands;
        assert_eq!(rebuild[0].to_string(), "iptables -t mangle -N NW_DENY");
        assert_eq!(rebuild[1].to_string(), "iptables -t mangle -F NW_DENY");
        assert_eq!(
            rebuild[2].to_string(),
            "iptables -t mangle -A NW_DENY -j MARK --set-mark 10"
        );
        // Four inserts per member, last insert ends up first
        assert_eq!(rebuild.len(), 7);
        assert_eq!(
            rebuild[6].to_string(),
            "iptables -t mangle -I NW_DENY 1 -m mac --mac-source aa:bb:cc:dd:ee:01 -j MARK --set-mark 20"
        );
    }

    #[test]
    fn test_polarity() {
        assert_eq!(ListMode::Allow.member_mark(), UNRESTRICTED_CLASS);
        assert_eq!(ListMode::Allow.default_mark(), LIMITED_CLASS);
        assert_eq!(ListMode::Deny.member_mark(), LIMITED_CLASS);
        assert_eq!(ListMode::Deny.default_mark(), UNRESTRICTED_CLASS);
        assert_eq!(ListMode::from_active(ActiveMode::None), None);
    }

    #[test]
    fn test_group_mark_rules_readd_idempotently() {
        let devices = [device()];
        let commands = group_mark_rules(None, Some((101, &devices[..])));
        let rendered: Vec<String> = commands.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "iptables -t mangle -D NW_GROUPS -m mac --mac-source aa:bb:cc:dd:ee:01 -j MARK --set-mark 101",
                "iptables -t mangle -A NW_GROUPS -m mac --mac-source aa:bb:cc:dd:ee:01 -j MARK --set-mark 101",
                "iptables -t mangle -D NW_GROUPS -d 10.0.0.5 -j MARK --set-mark 101",
                "iptables -t mangle -A NW_GROUPS -d 10.0.0.5 -j MARK --set-mark 101",
            ]
        );
    }

    #[test]
    fn test_group_access_block_all() {
        let commands = group_access_commands(4, &[device()], true, &["ignored.example".into()]);
        let rendered: Vec<String> = commands.iter().map(ToString::to_string).collect();
        assert!(rendered.contains(&"iptables -t filter -A NW_G4 -d 10.0.0.5 -j DROP".to_string()));
        assert!(!rendered.iter().any(|c| c.contains("ignored.example")));
        assert_eq!(
            rendered.last().unwrap(),
            "iptables -t filter -I FORWARD 1 -j NW_G4"
        );
    }

    #[test]
    fn test_group_shaping_per_interface() {
        let ifaces = vec!["br-lan".to_string(), "eth0".to_string()];
        assert_eq!(group_shaping_commands(101, 101, 5.0, &ifaces).len(), 4);
        assert_eq!(group_shaping_removal(101, 101, &ifaces).len(), 4);
    }
}
