//! Typed remote commands
//!
//! Every command sent to a router is built as a [`RemoteCommand`] value and only
//! turned into a shell string by its `Display` impl. Caller-supplied strings
//! (paths, interface names, blocked sites) are single-quoted.

use std::fmt;

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Mangle,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Filter => f.write_str("filter"),
            Table::Mangle => f.write_str("mangle"),
        }
    }
}

/// A single iptables rule specification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Rule {
    /// Jump to a chain
    Jump(String),
    /// Mark everything reaching this rule
    MarkAll { mark: u32 },
    /// Mark traffic sent by a MAC
    MarkMac { mac: String, mark: u32 },
    /// Mark traffic destined to an IP
    MarkIp { ip: String, mark: u32 },
    ReturnMac { mac: String },
    ReturnIp { ip: String },
    DropMac { mac: String },
    DropIp { ip: String },
    /// Drop traffic from `ip` whose payload contains `site`
    DropSite { ip: String, site: String },
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Jump(chain) => write!(f, "-j {}", chain),
            Rule::MarkAll { mark } => write!(f, "-j MARK --set-mark {}", mark),
            Rule::MarkMac { mac, mark } => {
                write!(f, "-m mac --mac-source {} -j MARK --set-mark {}", mac, mark)
            }
            Rule::MarkIp { ip, mark } => write!(f, "-d {} -j MARK --set-mark {}", ip, mark),
            Rule::ReturnMac { mac } => write!(f, "-m mac --mac-source {} -j RETURN", mac),
            Rule::ReturnIp { ip } => write!(f, "-d {} -j RETURN", ip),
            Rule::DropMac { mac } => write!(f, "-m mac --mac-source {} -j DROP", mac),
            Rule::DropIp { ip } => write!(f, "-d {} -j DROP", ip),
            Rule::DropSite { ip, site } => write!(
                f,
                "-s {} -m string --algo bm --string {} -j DROP",
                ip,
                shell_quote(site)
            ),
        }
    }
}

/// A shell-level operation on the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    NewChain { table: Table, chain: String },
    FlushChain { table: Table, chain: String },
    DeleteChain { table: Table, chain: String },
    AppendRule { table: Table, chain: String, rule: Rule },
    InsertRule { table: Table, chain: String, position: u32, rule: Rule },
    DeleteRule { table: Table, chain: String, rule: Rule },
    ListRules { table: Table, chain: String },
    /// Prints `present` or `missing`
    ChainExists { table: Table, chain: String },
    ReplaceQdisc { iface: String, default_class: u32 },
    ReplaceClass {
        iface: String,
        parent: String,
        class_id: u32,
        rate_kbit: u32,
        ceil_kbit: u32,
    },
    DeleteClass { iface: String, class_id: u32 },
    ReplaceFilter { iface: String, mark: u32, class_id: u32 },
    DeleteFilter { iface: String, mark: u32 },
    ShowClasses { iface: String },
    ListInterfaces,
    ReadFile { path: String },
    /// Writes to `<path>.tmp` and renames over `path`
    WriteFile { path: String, contents: String },
    /// Prints `present` or `missing`
    FileExists { path: String },
}

/// Heredoc terminator for [`RemoteCommand::WriteFile`]
pub const HEREDOC_DELIMITER: &str = "NW_STATE_EOF";

impl RemoteCommand {
    pub fn mangle_rule(chain: &str, rule: Rule) -> Self {
        RemoteCommand::AppendRule {
            table: Table::Mangle,
            chain: chain.to_string(),
            rule,
        }
    }

    /// Whether this is a `tc` command
    pub fn is_traffic_control(&self) -> bool {
        matches!(
            self,
            RemoteCommand::ReplaceQdisc { .. }
                | RemoteCommand::ReplaceClass { .. }
                | RemoteCommand::DeleteClass { .. }
                | RemoteCommand::ReplaceFilter { .. }
                | RemoteCommand::DeleteFilter { .. }
                | RemoteCommand::ShowClasses { .. }
        )
    }

    /// Whether running the command changes router state
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            RemoteCommand::ListRules { .. }
                | RemoteCommand::ChainExists { .. }
                | RemoteCommand::ShowClasses { .. }
                | RemoteCommand::ListInterfaces
                | RemoteCommand::ReadFile { .. }
                | RemoteCommand::FileExists { .. }
        )
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommand::NewChain { table, chain } => {
                write!(f, "iptables -t {} -N {}", table, chain)
            }
            RemoteCommand::FlushChain { table, chain } => {
                write!(f, "iptables -t {} -F {}", table, chain)
            }
            RemoteCommand::DeleteChain { table, chain } => {
                write!(f, "iptables -t {} -X {}", table, chain)
            }
            RemoteCommand::AppendRule { table, chain, rule } => {
                write!(f, "iptables -t {} -A {} {}", table, chain, rule)
            }
            RemoteCommand::InsertRule {
                table,
                chain,
                position,
                rule,
            } => write!(f, "iptables -t {} -I {} {} {}", table, chain, position, rule),
            RemoteCommand::DeleteRule { table, chain, rule } => {
                write!(f, "iptables -t {} -D {} {}", table, chain, rule)
            }
            RemoteCommand::ListRules { table, chain } => {
                write!(f, "iptables -t {} -S {}", table, chain)
            }
            RemoteCommand::ChainExists { table, chain } => write!(
                f,
                "iptables -t {} -nL {} >/dev/null 2>&1 && echo present || echo missing",
                table, chain
            ),
            RemoteCommand::ReplaceQdisc {
                iface,
                default_class,
            } => write!(
                f,
                "tc qdisc replace dev {} root handle 1: htb default {}",
                shell_quote(iface),
                default_class
            ),
            RemoteCommand::ReplaceClass {
                iface,
                parent,
                class_id,
                rate_kbit,
                ceil_kbit,
            } => write!(
                f,
                "tc class replace dev {} parent {} classid 1:{} htb rate {}kbit ceil {}kbit",
                shell_quote(iface),
                parent,
                class_id,
                rate_kbit,
                ceil_kbit
            ),
            RemoteCommand::DeleteClass { iface, class_id } => write!(
                f,
                "tc class del dev {} classid 1:{}",
                shell_quote(iface),
                class_id
            ),
            RemoteCommand::ReplaceFilter {
                iface,
                mark,
                class_id,
            } => write!(
                f,
                "tc filter replace dev {} parent 1: protocol ip prio 1 handle {} fw flowid 1:{}",
                shell_quote(iface),
                mark,
                class_id
            ),
            RemoteCommand::DeleteFilter { iface, mark } => write!(
                f,
                "tc filter del dev {} parent 1: protocol ip prio 1 handle {} fw",
                shell_quote(iface),
                mark
            ),
            RemoteCommand::ShowClasses { iface } => {
                write!(f, "tc class show dev {}", shell_quote(iface))
            }
            RemoteCommand::ListInterfaces => f.write_str("ls /sys/class/net"),
            RemoteCommand::ReadFile { path } => write!(f, "cat {}", shell_quote(path)),
            RemoteCommand::WriteFile { path, contents } => {
                let tmp = format!("{}.tmp", path);
                write!(
                    f,
                    "mkdir -p {} && cat > {} <<'{}' && mv {} {}\n{}\n{}",
                    shell_quote(parent_dir(path)),
                    shell_quote(&tmp),
                    HEREDOC_DELIMITER,
                    shell_quote(&tmp),
                    shell_quote(path),
                    contents,
                    HEREDOC_DELIMITER
                )
            }
            RemoteCommand::FileExists { path } => write!(
                f,
                "test -f {} && echo present || echo missing",
                shell_quote(path)
            ),
        }
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Megabits per second to whole kilobits, never below 1
pub fn mbit_to_kbit(mbit: f64) -> u32 {
    let kbit = (mbit * 1000.0).round();
    if kbit < 1.0 {
        1
    } else if kbit > u32::MAX as f64 {
        u32::MAX
    } else {
        kbit as u32
    }
}
