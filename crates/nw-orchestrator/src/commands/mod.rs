//! Remote command construction and failure classification

mod classify;
mod plan;
mod remote;

pub use classify::{classify, Classification, Outcome, SUCCESS_EQUIVALENT};
pub use plan::{
    group_access_commands, group_access_removal, group_mark_rules, group_shaping_commands,
    group_shaping_removal, member_rules_delete, member_rules_insert, ActivationPlan, Attached,
    ListMode, PhasePlan, Rebuilt, Teardown,
};
pub use remote::{mbit_to_kbit, shell_quote, RemoteCommand, Rule, Table, HEREDOC_DELIMITER};

/// Mangle chain holding allow-list membership rules
pub const ALLOW_CHAIN: &str = "NW_ALLOW";
/// Mangle chain holding deny-list membership rules
pub const DENY_CHAIN: &str = "NW_DENY";
/// Mangle chain holding per-group shaping marks
pub const GROUP_CHAIN: &str = "NW_GROUPS";
/// The hook point access lists are attached to
pub const HOOK_CHAIN: &str = "FORWARD";
/// Everywhere a list chain may have been attached by earlier runs
pub const TEARDOWN_HOOKS: &[&str] = &["FORWARD", "PREROUTING", "POSTROUTING"];
/// Filter chains left behind by the old whitelist/blacklist scaffolding
pub const LEGACY_CHAINS: &[&str] = &["NW_WHITELIST", "NW_BLACKLIST"];

/// Unrestricted class `1:10` and its mark
pub const UNRESTRICTED_CLASS: u32 = 10;
/// Limited class `1:20` and its mark
pub const LIMITED_CLASS: u32 = 20;
/// Root class `1:1` every other class hangs off
pub const ROOT_CLASS: &str = "1:1";

/// Filter-table chain holding a group's access-control rules
pub fn access_chain(group_id: nw_core::GroupId) -> String {
    format!("NW_G{}", group_id)
}
