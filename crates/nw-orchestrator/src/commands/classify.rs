//! Classification of remote command failures
//!
//! Teardown and setup commands are written to be re-runnable, so some error
//! messages mean the desired end state already holds. Those messages live in
//! one table, [`SUCCESS_EQUIVALENT`]; any stderr line not matched by it is a
//! real failure. Lines matching [`ALWAYS_FAILURE`], or printed by the shell
//! itself, are failures even when they also contain an idempotent phrase.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Why a reported error is success-equivalent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The object to create is already there
    AlreadyPresent,
    /// The object to remove is already gone
    AlreadyAbsent,
    /// Tool chatter that does not indicate failure
    Benign,
}

/// Case-insensitive stderr substrings and what they mean
pub const SUCCESS_EQUIVALENT: &[(&str, Outcome)] = &[
    ("already exists", Outcome::AlreadyPresent),
    ("file exists", Outcome::AlreadyPresent),
    ("no chain/target/match by that name", Outcome::AlreadyAbsent),
    ("does a matching rule exist", Outcome::AlreadyAbsent),
    ("does not exist", Outcome::AlreadyAbsent),
    ("not found", Outcome::AlreadyAbsent),
    ("cannot find", Outcome::AlreadyAbsent),
    ("no such file or directory", Outcome::AlreadyAbsent),
    ("cannot delete qdisc with handle of zero", Outcome::AlreadyAbsent),
    ("warning:", Outcome::Benign),
];

/// Case-insensitive stderr substrings that are never success-equivalent
pub const ALWAYS_FAILURE: &[&str] = &[
    "command not found",
    "cannot stat",
    "can't stat",
    "couldn't load",
    "permission denied",
    "read-only file system",
    "no space left on device",
];

static SHELL_PREFIX: OnceLock<Regex> = OnceLock::new();

/// `sh: tc: not found`, `-ash: iptables: not found` and the like
fn shell_prefix() -> &'static Regex {
    SHELL_PREFIX.get_or_init(|| {
        Regex::new(r"^-?(?:sh|ash|bash|dash|zsh)(?:: line \d+)?: ")
            .expect("shell prefix pattern compiles")
    })
}

/// Result of inspecting a command's stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Nothing on stderr
    Clean,
    /// Every stderr line matched the table; the first match is reported
    Equivalent(Outcome),
    /// At least one stderr line is a real error
    Failure(String),
}

impl Classification {
    pub fn is_success(&self) -> bool {
        !matches!(self, Classification::Failure(_))
    }
}

fn match_line(line: &str) -> Option<Outcome> {
    let lowered = line.to_ascii_lowercase();
    if shell_prefix().is_match(&lowered)
        || ALWAYS_FAILURE.iter().any(|pattern| lowered.contains(pattern))
    {
        return None;
    }
    SUCCESS_EQUIVALENT
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(_, outcome)| *outcome)
}

/// Classify a command's stderr
pub fn classify(stderr: &str) -> Classification {
    let mut first = None;
    for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match match_line(line) {
            Some(outcome) => {
                // Prefer a meaningful outcome over warnings
                if first.is_none() || first == Some(Outcome::Benign) {
                    first = Some(outcome);
                }
            }
            None => return Classification::Failure(line.to_string()),
        }
    }
    match first {
        Some(outcome) => Classification::Equivalent(outcome),
        None => Classification::Clean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stderr_is_clean() {
        assert_eq!(classify(""), Classification::Clean);
        assert_eq!(classify("\n  \n"), Classification::Clean);
    }

    #[test]
    fn test_iptables_idempotent_messages() {
        assert_eq!(
            classify("iptables: Chain already exists."),
            Classification::Equivalent(Outcome::AlreadyPresent)
        );
        assert_eq!(
            classify("iptables: No chain/target/match by that name."),
            Classification::Equivalent(Outcome::AlreadyAbsent)
        );
        assert_eq!(
            classify("iptables: Bad rule (does a matching rule exist in that chain?)."),
            Classification::Equivalent(Outcome::AlreadyAbsent)
        );
    }

    #[test]
    fn test_tc_idempotent_messages() {
        assert_eq!(
            classify("RTNETLINK answers: No such file or directory"),
            Classification::Equivalent(Outcome::AlreadyAbsent)
        );
        assert_eq!(
            classify("Error: Filter with specified priority/protocol not found."),
            Classification::Equivalent(Outcome::AlreadyAbsent)
        );
    }

    #[test]
    fn test_warning_with_real_outcome() {
        let stderr = "# Warning: iptables-legacy tables present, use iptables-legacy to see them\niptables: Chain already exists.";
        assert_eq!(
            classify(stderr),
            Classification::Equivalent(Outcome::AlreadyPresent)
        );
    }

    #[test]
    fn test_unknown_error_is_failure() {
        let result = classify("iptables: Permission denied (you must be root).");
        assert_eq!(
            result,
            Classification::Failure("iptables: Permission denied (you must be root).".to_string())
        );
        assert!(!result.is_success());
    }

    #[test]
    fn test_missing_binary_is_failure() {
        for stderr in [
            "sh: tc: not found",
            "-ash: iptables: not found",
            "bash: tc: command not found",
            "bash: line 1: tc: command not found",
        ] {
            assert!(
                matches!(classify(stderr), Classification::Failure(_)),
                "{stderr}"
            );
        }
    }

    #[test]
    fn test_failed_move_is_failure() {
        let stderr =
            "mv: cannot stat '/etc/netwarden/state.json.tmp': No such file or directory";
        assert_eq!(classify(stderr), Classification::Failure(stderr.to_string()));
        assert!(!classify("mv: can't stat '/tmp/x': No such file or directory").is_success());
    }

    #[test]
    fn test_module_load_failure_is_failure() {
        let stderr = "iptables v1.8.7 (legacy): Couldn't load match `string':No such file or directory";
        assert!(!classify(stderr).is_success());
    }

    #[test]
    fn test_missing_file_from_cat_is_still_absent() {
        assert_eq!(
            classify("cat: can't open '/etc/netwarden/state.json': No such file or directory"),
            Classification::Equivalent(Outcome::AlreadyAbsent)
        );
    }

    #[test]
    fn test_any_unmatched_line_fails() {
        let stderr = "iptables: Chain already exists.\niptables: Too many links.";
        assert!(matches!(classify(stderr), Classification::Failure(l) if l.contains("Too many links")));
    }
}
