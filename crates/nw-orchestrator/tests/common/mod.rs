//! In-memory router used by the integration tests
//!
//! Interprets the exact shell lines the orchestrator sends: the state file,
//! iptables chains and rules, and tc classes and filters. Errors are reported
//! on stderr with the same wording the real tools use.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use nw_core::config::WardenConfig;
use nw_core::error::ConnectionError;
use nw_core::traits::{
    CommandExecutor, ConnectionParams, ConnectionResolver, Connector, Credential,
};
use nw_core::types::{CommandOutput, DeviceId, SessionId};
use nw_orchestrator::{Controller, GroupSync};

pub const ROUTER: &str = "home";
pub const SESSION: &str = "test-session";
pub const UNKNOWN_ROUTER: &str = "nowhere";

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

#[derive(Debug, Default)]
pub struct RouterState {
    pub files: HashMap<String, String>,
    /// (table, chain) to rules in order
    pub chains: HashMap<(String, String), Vec<String>>,
    pub interfaces: Vec<String>,
    pub qdiscs: HashSet<String>,
    /// (iface, class id) to `parent`
    pub classes: BTreeMap<(String, u32), String>,
    /// (iface, mark) to class id
    pub filters: BTreeMap<(String, u32), u32>,
    pub log: Vec<String>,
    transport_failures: usize,
    /// Substring to match and stderr to report once
    injected: Vec<(String, String)>,
}

impl RouterState {
    fn builtin(table: &str, chain: &str) -> bool {
        match table {
            "mangle" => matches!(
                chain,
                "PREROUTING" | "INPUT" | "FORWARD" | "OUTPUT" | "POSTROUTING"
            ),
            _ => matches!(chain, "INPUT" | "FORWARD" | "OUTPUT"),
        }
    }

    fn fresh() -> Self {
        let mut state = Self {
            interfaces: vec!["br-lan".into(), "eth0".into(), "lo".into()],
            ..Self::default()
        };
        for chain in ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"] {
            state
                .chains
                .insert(("mangle".into(), chain.into()), Vec::new());
        }
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            state
                .chains
                .insert(("filter".into(), chain.into()), Vec::new());
        }
        state
    }

    fn run(&mut self, command: &str) -> CommandOutput {
        let first = command.lines().next().unwrap_or_default();
        if first.starts_with("mkdir -p ") {
            return self.write_file(command);
        }
        let words = split_words(first);
        match words.first().map(String::as_str) {
            Some("cat") => match words.get(1).and_then(|path| self.files.get(path)) {
                Some(contents) => CommandOutput::ok(contents.clone()),
                None => CommandOutput::failed(format!(
                    "cat: can't open '{}': No such file or directory",
                    words.get(1).cloned().unwrap_or_default()
                )),
            },
            Some("test") => {
                let present = words.get(2).is_some_and(|path| self.files.contains_key(path));
                CommandOutput::ok(if present { "present\n" } else { "missing\n" })
            }
            Some("ls") => CommandOutput::ok(format!("{}\n", self.interfaces.join("\n"))),
            Some("iptables") => self.iptables(&words),
            Some("tc") => self.tc(&words),
            _ => CommandOutput::failed(format!("sh: {}: not found", first)),
        }
    }

    fn write_file(&mut self, command: &str) -> CommandOutput {
        let lines: Vec<&str> = command.lines().collect();
        let path = split_words(lines[0]).pop().unwrap_or_default();
        let body = lines[1..lines.len().saturating_sub(1)].join("\n");
        self.files.insert(path, body);
        CommandOutput::ok("")
    }

    fn iptables(&mut self, words: &[String]) -> CommandOutput {
        let (Some(table), Some(op), Some(chain)) = (words.get(2), words.get(3), words.get(4))
        else {
            return CommandOutput::failed("iptables: bad arguments");
        };
        let key = (table.clone(), chain.clone());
        let exists = self.chains.contains_key(&key);
        match op.as_str() {
            "-nL" => CommandOutput::ok(if exists { "present\n" } else { "missing\n" }),
            "-N" if exists => CommandOutput::failed("iptables: Chain already exists."),
            "-N" => {
                self.chains.insert(key, Vec::new());
                CommandOutput::ok("")
            }
            _ if !exists => CommandOutput::failed(NO_CHAIN),
            "-F" => {
                self.chains.insert(key, Vec::new());
                CommandOutput::ok("")
            }
            "-X" => {
                let target = format!("-j {}", chain);
                let referenced = self
                    .chains
                    .iter()
                    .any(|((t, _), rules)| t == table && rules.contains(&target));
                if Self::builtin(table, chain) {
                    CommandOutput::failed("iptables: Invalid argument. Run `dmesg' for more information.")
                } else if referenced {
                    CommandOutput::failed("iptables: Too many links.")
                } else if !self.chains[&key].is_empty() {
                    CommandOutput::failed("iptables: Directory not empty.")
                } else {
                    self.chains.remove(&key);
                    CommandOutput::ok("")
                }
            }
            "-A" => {
                let rule = words[5..].join(" ");
                if let Some(rules) = self.chains.get_mut(&key) {
                    rules.push(rule);
                }
                CommandOutput::ok("")
            }
            "-I" => {
                let position: usize = words
                    .get(5)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(1);
                let rule = words[6..].join(" ");
                if let Some(rules) = self.chains.get_mut(&key) {
                    let index = position.saturating_sub(1).min(rules.len());
                    rules.insert(index, rule);
                }
                CommandOutput::ok("")
            }
            "-D" => {
                let rule = words[5..].join(" ");
                let Some(rules) = self.chains.get_mut(&key) else {
                    return CommandOutput::failed(NO_CHAIN);
                };
                match rules.iter().position(|r| *r == rule) {
                    Some(index) => {
                        rules.remove(index);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(BAD_RULE),
                }
            }
            "-S" => {
                let mut out = if Self::builtin(table, chain) {
                    format!("-P {} ACCEPT\n", chain)
                } else {
                    format!("-N {}\n", chain)
                };
                for rule in &self.chains[&key] {
                    out.push_str(&format!("-A {} {}\n", chain, rule));
                }
                CommandOutput::ok(out)
            }
            _ => CommandOutput::failed(format!("iptables: unknown option {}", op)),
        }
    }

    fn tc(&mut self, words: &[String]) -> CommandOutput {
        let object = words.get(1).map(String::as_str).unwrap_or_default();
        let action = words.get(2).map(String::as_str).unwrap_or_default();
        let Some(iface) = arg_after(words, "dev") else {
            return CommandOutput::failed("Command line is not complete. Try option \"help\"");
        };
        if !self.interfaces.iter().any(|name| *name == iface) {
            return CommandOutput::failed(format!("Cannot find device \"{}\"", iface));
        }
        let class_id = |flag: &str| {
            arg_after(words, flag)
                .and_then(|id| id.strip_prefix("1:").and_then(|n| n.parse::<u32>().ok()))
        };
        let mark = arg_after(words, "handle").and_then(|m| m.parse::<u32>().ok());

        match (object, action) {
            ("qdisc", "replace") => {
                self.qdiscs.insert(iface);
                CommandOutput::ok("")
            }
            ("class", "replace") => match class_id("classid") {
                Some(id) if self.qdiscs.contains(&iface) => {
                    let parent = arg_after(words, "parent").unwrap_or_default();
                    self.classes.insert((iface, id), parent);
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed("RTNETLINK answers: Invalid argument"),
            },
            ("class", "del") => match class_id("classid")
                .and_then(|id| self.classes.remove(&(iface, id)))
            {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed("RTNETLINK answers: No such file or directory"),
            },
            ("class", "show") => {
                let out: String = self
                    .classes
                    .iter()
                    .filter(|((name, _), _)| *name == iface)
                    .map(|((_, id), parent)| {
                        format!("class htb 1:{} parent {} prio 0 rate 1Mbit\n", id, parent)
                    })
                    .collect();
                CommandOutput::ok(out)
            }
            ("filter", "replace") => match (mark, class_id("flowid")) {
                (Some(mark), Some(id)) if self.qdiscs.contains(&iface) => {
                    self.filters.insert((iface, mark), id);
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed("RTNETLINK answers: Invalid argument"),
            },
            ("filter", "del") => match mark.and_then(|mark| self.filters.remove(&(iface, mark))) {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed(
                    "Error: Filter with specified priority/protocol not found.",
                ),
            },
            _ => CommandOutput::failed("Command line is not complete. Try option \"help\""),
        }
    }
}

fn arg_after(words: &[String], flag: &str) -> Option<String> {
    words
        .iter()
        .position(|word| word == flag)
        .and_then(|index| words.get(index + 1))
        .cloned()
}

/// Split a shell line on whitespace, honouring single quotes and `\'`
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if quoted {
            if c == '\'' {
                quoted = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '\'' => {
                quoted = true;
                in_word = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Whether a logged command only reads router state
pub fn is_probe(command: &str) -> bool {
    command.starts_with("cat ")
        || command.starts_with("test -f ")
        || command.starts_with("ls ")
        || command.starts_with("tc class show ")
        || command.contains(" -nL ")
        || command.contains(" -S ")
}

/// Shared fake router; also its own resolver and connector
#[derive(Default)]
pub struct FakeRouter {
    state: Arc<Mutex<RouterState>>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    refuse_connect: AtomicBool,
}

impl FakeRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(RouterState::fresh())),
            ..Self::default()
        })
    }

    pub fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `count` commands at the transport level
    pub fn fail_transport(&self, count: usize) {
        self.state().transport_failures = count;
    }

    /// Report `stderr` for the next command containing `pattern`, without applying it
    pub fn fail_command(&self, pattern: &str, stderr: &str) {
        self.state()
            .injected
            .push((pattern.to_string(), stderr.to_string()));
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Logged commands that change router state
    pub fn mutations(&self) -> Vec<String> {
        self.log().into_iter().filter(|c| !is_probe(c)).collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.log().iter().any(|c| c.contains(pattern))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn set_file(&self, path: &str, contents: &str) {
        self.state()
            .files
            .insert(path.to_string(), contents.to_string());
    }

    pub fn state_document(&self) -> serde_json::Value {
        let contents = self
            .file(nw_core::config::DEFAULT_STATE_PATH)
            .expect("state document written");
        serde_json::from_str(&contents).expect("state document is JSON")
    }

    pub fn chain(&self, table: &str, chain: &str) -> Option<Vec<String>> {
        self.state()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
    }

    pub fn remove_chain(&self, table: &str, chain: &str) {
        self.state()
            .chains
            .remove(&(table.to_string(), chain.to_string()));
    }

    pub fn add_rule(&self, table: &str, chain: &str, rule: &str) {
        self.state()
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(rule.to_string());
    }

    pub fn class_ids(&self, iface: &str) -> Vec<u32> {
        self.state()
            .classes
            .keys()
            .filter(|(name, _)| name == iface)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn filter_class(&self, iface: &str, mark: u32) -> Option<u32> {
        self.state()
            .filters
            .get(&(iface.to_string(), mark))
            .copied()
    }
}

struct FakeExecutor {
    state: Arc<Mutex<RouterState>>,
    closes: Arc<AtomicUsize>,
    alive: AtomicBool,
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, ConnectionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("channel closed".into()));
        }
        let mut state = self.state.lock().unwrap();
        if state.transport_failures > 0 {
            state.transport_failures -= 1;
            return Err(ConnectionError::Transport("connection reset by peer".into()));
        }
        let first = command.lines().next().unwrap_or_default().to_string();
        state.log.push(first);
        if let Some(index) = state
            .injected
            .iter()
            .position(|(pattern, _)| command.contains(pattern.as_str()))
        {
            let (_, stderr) = state.injected.remove(index);
            return Ok(CommandOutput::failed(stderr));
        }
        Ok(state.run(command))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connector for FakeRouter {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn CommandExecutor>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectFailed {
                address: params.endpoint(),
                reason: "Connection refused".into(),
            });
        }
        Ok(Arc::new(FakeExecutor {
            state: Arc::clone(&self.state),
            closes: Arc::clone(&self.closes),
            alive: AtomicBool::new(true),
        }))
    }
}

#[async_trait]
impl ConnectionResolver for FakeRouter {
    async fn resolve(&self, device_id: &DeviceId) -> Result<ConnectionParams, ConnectionError> {
        if device_id.as_str() == UNKNOWN_ROUTER {
            return Err(ConnectionError::DeviceNotFound(device_id.to_string()));
        }
        Ok(ConnectionParams {
            address: "10.8.0.2".into(),
            port: 22,
            username: "root".into(),
            credential: Credential::Password("secret".into()),
            host_key: None,
        })
    }
}

pub fn session() -> SessionId {
    SessionId::new(SESSION)
}

pub fn device() -> DeviceId {
    DeviceId::new(ROUTER)
}

/// Controller wired to the fake, with the test session started
pub fn controller(router: &Arc<FakeRouter>) -> Controller {
    controller_with(router, WardenConfig::default())
}

pub fn controller_with(router: &Arc<FakeRouter>, config: WardenConfig) -> Controller {
    let resolver: Arc<dyn ConnectionResolver> = router.clone();
    let connector: Arc<dyn Connector> = router.clone();
    let controller = Controller::new(config, resolver, connector);
    controller.connection_pool().start_session(&session());
    controller
}

pub fn group_sync(router: &Arc<FakeRouter>) -> (Controller, GroupSync) {
    let controller = controller(router);
    let sync = controller.group_sync(&session(), &device());
    (controller, sync)
}

