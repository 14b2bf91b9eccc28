//! Command gating before anything is spawned.
//!
//! A command is split into segments on shell separators outside quotes, each
//! segment is reduced to its root command (`/usr/bin/git status` → `git`),
//! and `bash -c "<script>"` wrappers are unwrapped so nested scripts are held
//! to the same rules. Every check fails closed.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use shellwarden_config::PolicyConfig;
use tracing::debug;

use crate::error::{ExecError, Result};

const MAX_UNWRAP_DEPTH: usize = 8;
const WRAPPER_SHELLS: &[&str] = &["bash", "sh", "zsh"];
const WRAPPER_FLAGS: &[&str] = &["-c", "-lc", "-ilc"];
const SUBSTITUTION_MARKERS: &[&str] = &["$(", "`", "<(", ">("];

static FORK_BOMB: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:").ok());
static ASSIGNMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").ok());

/// Outcome of [`CommandPolicy::is_allowed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed_roots: HashSet<String>,
    blocked_roots: HashSet<String>,
    deny_patterns: Vec<Regex>,
    builtin_denylist: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            allowed_roots: HashSet::new(),
            blocked_roots: HashSet::new(),
            deny_patterns: Vec::new(),
            builtin_denylist: true,
        }
    }
}

impl CommandPolicy {
    pub fn from_config(config: &PolicyConfig) -> std::result::Result<Self, regex::Error> {
        let deny_patterns = config
            .deny_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed_roots: config.allowed_roots.iter().cloned().collect(),
            blocked_roots: config.blocked_roots.iter().cloned().collect(),
            deny_patterns,
            builtin_denylist: !config.disable_builtin_denylist,
        })
    }

    /// Decide whether `command` may run.
    pub fn is_allowed(&self, command: &str) -> PolicyDecision {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return PolicyDecision::deny("command is empty");
        }

        if let Some(marker) = SUBSTITUTION_MARKERS
            .iter()
            .find(|marker| trimmed.contains(**marker))
        {
            return PolicyDecision::deny(format!(
                "command substitution (`{marker}`) is not allowed"
            ));
        }

        if let Some(pattern) = self.deny_patterns.iter().find(|re| re.is_match(trimmed)) {
            return PolicyDecision::deny(format!(
                "command matches deny pattern `{}`",
                pattern.as_str()
            ));
        }

        if self.builtin_denylist
            && FORK_BOMB
                .as_ref()
                .is_none_or(|fork_bomb| fork_bomb.is_match(trimmed))
        {
            return PolicyDecision::deny("fork bomb detected");
        }

        let invocations = collect_invocations(trimmed, 0);
        if invocations.is_empty() {
            return PolicyDecision::deny("could not identify a root command");
        }

        for tokens in &invocations {
            let Some(root) = tokens.first().map(|token| root_name(token)) else {
                continue;
            };

            if self.builtin_denylist && is_destructive(tokens) {
                return PolicyDecision::deny(format!(
                    "`{}` is a destructive command",
                    tokens.join(" ")
                ));
            }
            if self.blocked_roots.contains(root) {
                return PolicyDecision::deny(format!("`{root}` is blocked by policy"));
            }
            if !self.allowed_roots.is_empty() && !self.allowed_roots.contains(root) {
                return PolicyDecision::deny(format!(
                    "`{root}` is not in the allowed command list"
                ));
            }
        }

        debug!(command = trimmed, "command allowed by policy");
        PolicyDecision::allow()
    }

    /// [`is_allowed`](Self::is_allowed) mapped onto [`ExecError`].
    pub fn check(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let decision = self.is_allowed(command);
        if decision.allowed {
            return Ok(());
        }
        if Self::extract_root_commands(command).is_empty()
            && !SUBSTITUTION_MARKERS.iter().any(|m| command.contains(m))
        {
            return Err(ExecError::NoIdentifiableRoot);
        }
        Err(ExecError::PolicyDenied {
            reason: decision
                .reason
                .unwrap_or_else(|| "command denied".to_string()),
        })
    }

    /// Distinct root commands of every segment, after unwrapping shell wrappers.
    pub fn extract_root_commands(command: &str) -> BTreeSet<String> {
        collect_invocations(command, 0)
            .iter()
            .filter_map(|tokens| tokens.first())
            .map(|token| root_name(token).to_string())
            .collect()
    }

    /// Roots of `command` that the caller has not yet approved.
    pub fn confirmation_needed(command: &str, approved: &HashSet<String>) -> BTreeSet<String> {
        Self::extract_root_commands(command)
            .into_iter()
            .filter(|root| !approved.contains(root))
            .collect()
    }
}

/// Tokenized invocations of `command`, one per segment, with leading
/// assignments removed and shell wrappers expanded.
fn collect_invocations(command: &str, depth: usize) -> Vec<Vec<String>> {
    let mut invocations = Vec::new();
    for segment in split_segments(command) {
        let tokens = strip_prefix_tokens(tokenize(&segment));
        if tokens.is_empty() {
            continue;
        }

        if depth < MAX_UNWRAP_DEPTH
            && let Some(script) = wrapped_script(&tokens)
        {
            invocations.extend(collect_invocations(script, depth + 1));
            continue;
        }
        invocations.push(tokens);
    }
    invocations
}

fn wrapped_script(tokens: &[String]) -> Option<&str> {
    let shell = root_name(tokens.first()?);
    if !WRAPPER_SHELLS.contains(&shell) {
        return None;
    }
    let flag = tokens.get(1)?;
    if !WRAPPER_FLAGS.contains(&flag.as_str()) {
        return None;
    }
    tokens.get(2).map(String::as_str)
}

/// Split on `;`, `&&`, `||`, `|`, `&` and newlines outside quotes.
///
/// `&` that belongs to a redirection (`2>&1`, `&>file`) is not a separator.
fn split_segments(command: &str) -> Vec<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        let next = chars.get(index + 1).copied();

        if escaped {
            current.push(ch);
            escaped = false;
            index += 1;
            continue;
        }

        match ch {
            '\\' if !in_single => {
                escaped = true;
                current.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            '&' if !in_single && !in_double => {
                let previous = current.chars().last();
                if matches!(previous, Some('>' | '<')) || next == Some('>') {
                    current.push(ch);
                } else {
                    segments.push(std::mem::take(&mut current));
                    if next == Some('&') {
                        index += 1;
                    }
                }
            }
            '|' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
                if next == Some('|') {
                    index += 1;
                }
            }
            ';' | '\n' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
        index += 1;
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn tokenize(segment: &str) -> Vec<String> {
    shell_words::split(segment)
        .unwrap_or_else(|_| segment.split_whitespace().map(str::to_string).collect())
}

/// Drop grouping punctuation, negation and `VAR=value` prefixes.
fn strip_prefix_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut tokens = tokens.into_iter();
    let mut stripped = Vec::new();

    while let Some(token) = tokens.next() {
        let token = token.trim_start_matches(['(', '{']).to_string();
        if token.trim_end_matches([')', '}']).is_empty() || token == "!" || is_assignment(&token)
        {
            continue;
        }
        stripped.push(token);
        stripped.extend(tokens.by_ref());
    }
    stripped
}

fn is_assignment(token: &str) -> bool {
    ASSIGNMENT
        .as_ref()
        .is_some_and(|assignment| assignment.is_match(token))
}

fn root_name(token: &str) -> &str {
    let token = token.trim_end_matches([')', '}']);
    Path::new(token)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(token)
}

fn is_destructive(tokens: &[String]) -> bool {
    let Some(first) = tokens.first() else {
        return false;
    };
    let root = root_name(first);
    let arg = |index: usize| tokens.get(index).map(String::as_str);

    match root {
        "git" => matches!(arg(1), Some("reset" | "rm" | "clean"))
            || (arg(1) == Some("push")
                && tokens[1..]
                    .iter()
                    .any(|token| token == "--force" || token == "-f")),
        "rm" => tokens[1..].iter().any(|token| is_forceful_rm_flag(token)),
        "dd" | "shutdown" | "reboot" | "halt" | "poweroff" | "init" => true,
        _ if root.starts_with("mkfs") => true,
        "sudo" | "doas" => {
            let rest: Vec<String> = tokens[1..]
                .iter()
                .skip_while(|token| token.starts_with('-'))
                .cloned()
                .collect();
            is_destructive(&rest)
        }
        _ => false,
    }
}

fn is_forceful_rm_flag(token: &str) -> bool {
    match token.strip_prefix("--") {
        Some(long) => matches!(long, "recursive" | "force"),
        None => {
            token.starts_with('-')
                && token.len() > 1
                && token[1..].chars().any(|c| matches!(c, 'r' | 'R' | 'f'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roots(command: &str) -> Vec<String> {
        CommandPolicy::extract_root_commands(command)
            .into_iter()
            .collect()
    }

    #[test]
    fn extracts_roots_across_separators() {
        assert_eq!(
            roots("git status && cargo check || make; ls | wc -l & echo done"),
            vec!["cargo", "echo", "git", "ls", "make", "wc"]
        );
    }

    #[test]
    fn separators_inside_quotes_are_literal() {
        assert_eq!(roots("echo 'a && b; c | d'"), vec!["echo"]);
        assert_eq!(roots(r#"grep "x|y" file"#), vec!["grep"]);
    }

    #[test]
    fn redirection_ampersand_is_not_a_separator() {
        assert_eq!(roots("cargo build 2>&1 | tee log"), vec!["cargo", "tee"]);
        assert_eq!(roots("make &>out.txt"), vec!["make"]);
    }

    #[test]
    fn strips_assignments_and_paths() {
        assert_eq!(roots("RUST_LOG=debug FOO=1 /usr/bin/cargo test"), vec!["cargo"]);
        assert_eq!(roots("(cd src && ls)"), vec!["cd", "ls"]);
        assert_eq!(roots("{ make; }"), vec!["make"]);
    }

    #[test]
    fn unwraps_nested_shell_wrappers() {
        assert_eq!(
            roots(r#"bash -lc "sh -c 'git log && npm test'""#),
            vec!["git", "npm"]
        );
        assert_eq!(roots("bash script.sh"), vec!["bash"]);
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(roots("ls; ls -la; ls"), vec!["ls"]);
    }

    #[test]
    fn empty_and_rootless_commands_are_denied() {
        let policy = CommandPolicy::default();
        assert!(!policy.is_allowed("   ").allowed);
        assert!(!policy.is_allowed(" ; && ").allowed);
        assert!(matches!(policy.check(""), Err(ExecError::EmptyCommand)));
        assert!(matches!(
            policy.check(" ;; "),
            Err(ExecError::NoIdentifiableRoot)
        ));
    }

    #[test]
    fn command_substitution_is_denied() {
        let policy = CommandPolicy::default();
        for command in ["echo $(whoami)", "echo `id`", "diff <(ls a) <(ls b)", "tee >(cat)"] {
            let decision = policy.is_allowed(command);
            assert!(!decision.allowed, "{command} should be denied");
            assert!(decision.reason.unwrap().contains("substitution"));
        }
    }

    #[test]
    fn builtin_destructive_commands_are_denied() {
        let policy = CommandPolicy::default();
        for command in [
            "rm -rf /",
            "rm -f file.txt",
            "rm --recursive build",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
            "sudo reboot",
            "sudo -E git reset --hard",
            "git clean -fdx",
            "git push --force origin main",
            ":(){ :|:& };:",
            "bash -c 'ls && rm -rf target'",
        ] {
            assert!(!policy.is_allowed(command).allowed, "{command} should be denied");
        }
    }

    #[test]
    fn ordinary_commands_are_allowed() {
        let policy = CommandPolicy::default();
        for command in ["ls -la", "git status", "rm notes.txt", "cargo test 2>&1", "sudo ls"] {
            assert_eq!(policy.is_allowed(command), PolicyDecision::allow(), "{command}");
        }
    }

    #[test]
    fn configured_lists_are_enforced() {
        let policy = CommandPolicy::from_config(&PolicyConfig {
            allowed_roots: vec!["git".into(), "ls".into()],
            blocked_roots: vec!["ls".into()],
            deny_patterns: vec![r"--no-verify".into()],
            disable_builtin_denylist: false,
        })
        .unwrap();

        assert!(policy.is_allowed("git status").allowed);
        assert!(policy.is_allowed("ls").reason.unwrap().contains("blocked"));
        assert!(policy.is_allowed("cargo build").reason.unwrap().contains("allowed"));
        assert!(
            policy
                .is_allowed("git commit --no-verify")
                .reason
                .unwrap()
                .contains("deny pattern")
        );
        assert!(matches!(
            policy.check("cargo build"),
            Err(ExecError::PolicyDenied { .. })
        ));
    }

    #[test]
    fn builtin_denylist_can_be_disabled() {
        let policy = CommandPolicy::from_config(&PolicyConfig {
            disable_builtin_denylist: true,
            ..PolicyConfig::default()
        })
        .unwrap();
        assert!(policy.is_allowed("rm -rf target").allowed);
        assert!(!policy.is_allowed("echo $(id)").allowed);
    }

    #[test]
    fn confirmation_needed_excludes_approved_roots() {
        let approved: HashSet<String> = ["git".to_string()].into_iter().collect();
        let pending = CommandPolicy::confirmation_needed("git pull && cargo test", &approved);
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec!["cargo"]);
    }
}
