//! Safety classifier.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::safety::rules::{HazardClass, RuleTable};
use crate::tools::{Action, FileOp};

/// Risk assessment of one action, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskVerdict {
    Safe,
    RequiresConfirmation,
    /// Never executes, regardless of mode or confirmation.
    Forbidden,
}

impl RiskVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::Forbidden => "forbidden",
        }
    }
}

impl std::fmt::Display for RiskVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub verdict: RiskVerdict,
    /// Id of the matching rule; `None` for the default `Safe`.
    pub rule: Option<String>,
    pub hazard: Option<HazardClass>,
    pub reason: String,
}

impl Classification {
    fn safe() -> Self {
        Self {
            verdict: RiskVerdict::Safe,
            rule: None,
            hazard: None,
            reason: "no rule matched".to_string(),
        }
    }

    fn matched(
        verdict: RiskVerdict,
        rule: &str,
        hazard: Option<HazardClass>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            verdict,
            rule: Some(rule.to_string()),
            hazard,
            reason: reason.into(),
        }
    }
}

/// How deep shell strings inside shell strings are followed.
const MAX_NESTING: usize = 4;

/// Constructs that hand a string to another shell: `sh -c`, `su -c`,
/// `eval`, `ssh`, `watch`, and piping into `sh`.
static SHELL_STRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:ba|z|da|k|fi|tc|c)?sh\s+(?:\S+\s+)*?-\w*c\b",
        r"|\bsu\s+(?:\S+\s+)*?-c\b",
        r"|\b(?:eval|ssh|watch)\b",
        r"|\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b",
    ))
    .expect("Invalid built-in shell string regex")
});

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'([^']*)'|"((?:[^"\\]|\\.)*)""#).expect("Invalid built-in quote regex")
});

/// Command strings a shell would run on behalf of `command`: the contents of
/// its quoted arguments and, unquoted, whatever follows `-c`/`eval`.
fn shell_strings(command: &str) -> Vec<String> {
    if !SHELL_STRING.is_match(command) {
        return Vec::new();
    }

    let mut inner: Vec<String> = QUOTED
        .captures_iter(command)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().replace("\\\"", "\""))
        .collect();
    for m in SHELL_STRING.find_iter(command) {
        let tail: String = command[m.end()..]
            .chars()
            .map(|c| if c == '\'' || c == '"' { ' ' } else { c })
            .collect();
        inner.push(tail.trim().to_string());
    }
    inner.retain(|s| !s.trim().is_empty() && s != command);
    inner
}

/// Maps a concrete action to a [`RiskVerdict`] using a static rule table.
///
/// Families are evaluated in order and the first match wins:
/// 1. forbidden paths (file targets and command working directories)
/// 2. forbidden commands
/// 3. dangerous commands
/// 4. file deletes need confirmation
///
/// Command rules also run over the strings a command hands to another shell
/// (`bash -c '...'`, `eval`, `... | sh`), and the most severe verdict wins.
///
/// Anything else is `Safe`. The result depends only on the action, the table
/// and the workspace root.
#[derive(Debug, Clone, Default)]
pub struct SafetyClassifier {
    rules: RuleTable,
    workspace: Option<PathBuf>,
}

impl SafetyClassifier {
    pub fn new(rules: RuleTable) -> Self {
        Self {
            rules,
            workspace: None,
        }
    }

    /// Workspace root the tools are confined to.
    ///
    /// When the workspace itself lives below a protected directory (a home
    /// under `/root`, a checkout under `/var/lib`), paths inside it are not
    /// treated as protected. A workspace that is or contains a protected
    /// directory gets no exemption.
    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace = Some(root.into());
        self
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Classify an action.
    pub fn classify(&self, action: &Action) -> Classification {
        match action {
            Action::File { op, path } => self.classify_file(*op, path),
            Action::Command {
                command,
                working_dir,
            } => self.classify_command(command, working_dir.as_deref()),
        }
    }

    /// The protected directory `path` falls under, after the workspace exemption.
    fn protected_dir(&self, path: &Path) -> Option<&Path> {
        let protected = self.rules.forbidden_path_for(path)?;
        match &self.workspace {
            Some(root)
                if root.as_path() != protected
                    && root.starts_with(protected)
                    && path.starts_with(root) =>
            {
                None
            }
            _ => Some(protected),
        }
    }

    fn classify_file(&self, op: FileOp, path: &Path) -> Classification {
        if let Some(protected) = self.protected_dir(path) {
            return Classification::matched(
                RiskVerdict::Forbidden,
                "forbidden_path",
                None,
                format!(
                    "{} of {} is not allowed: {} is a protected system directory",
                    op.as_str(),
                    path.display(),
                    protected.display()
                ),
            );
        }

        if op == FileOp::Delete {
            return Classification::matched(
                RiskVerdict::RequiresConfirmation,
                "file_delete",
                Some(HazardClass::DestructiveFilesystem),
                format!("deletes {}", path.display()),
            );
        }

        Classification::safe()
    }

    fn classify_command(&self, command: &str, working_dir: Option<&Path>) -> Classification {
        if let Some(protected) = working_dir.and_then(|d| self.protected_dir(d)) {
            return Classification::matched(
                RiskVerdict::Forbidden,
                "forbidden_path",
                None,
                format!(
                    "commands may not run inside protected directory {}",
                    protected.display()
                ),
            );
        }

        self.classify_command_text(command, 0)
    }

    fn classify_command_text(&self, command: &str, depth: usize) -> Classification {
        let mut result = self.match_command_rules(command);
        if result.verdict == RiskVerdict::Forbidden || depth >= MAX_NESTING {
            return result;
        }

        for inner in shell_strings(command) {
            let nested = self.classify_command_text(&inner, depth + 1);
            if nested.verdict > result.verdict {
                result = nested;
                if result.verdict == RiskVerdict::Forbidden {
                    break;
                }
            }
        }
        result
    }

    fn match_command_rules(&self, command: &str) -> Classification {
        if let Some(rule) = self
            .rules
            .forbidden_commands
            .iter()
            .find(|r| r.matches(command))
        {
            return Classification::matched(
                RiskVerdict::Forbidden,
                &rule.id,
                Some(rule.hazard),
                rule.description.clone(),
            );
        }

        if let Some(rule) = self
            .rules
            .dangerous_commands
            .iter()
            .find(|r| r.matches(command))
        {
            return Classification::matched(
                RiskVerdict::RequiresConfirmation,
                &rule.id,
                Some(rule.hazard),
                rule.description.clone(),
            );
        }

        Classification::safe()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn command(c: &str) -> Action {
        Action::Command {
            command: c.to_string(),
            working_dir: None,
        }
    }

    fn file(op: FileOp, path: &str) -> Action {
        Action::File {
            op,
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_forbidden_path_wins_over_everything() {
        let classifier = SafetyClassifier::default();
        let result = classifier.classify(&file(FileOp::Delete, "/etc/passwd"));
        assert_eq!(result.verdict, RiskVerdict::Forbidden);
        assert_eq!(result.rule.as_deref(), Some("forbidden_path"));

        let result = classifier.classify(&file(FileOp::Read, "/proc/1/environ"));
        assert_eq!(result.verdict, RiskVerdict::Forbidden);
    }

    #[test]
    fn test_file_operations() {
        let classifier = SafetyClassifier::default();
        assert_eq!(
            classifier
                .classify(&file(FileOp::Write, "/home/me/app/config.yml"))
                .verdict,
            RiskVerdict::Safe
        );
        let delete = classifier.classify(&file(FileOp::Delete, "/home/me/app/old.log"));
        assert_eq!(delete.verdict, RiskVerdict::RequiresConfirmation);
        assert_eq!(delete.hazard, Some(HazardClass::DestructiveFilesystem));
    }

    #[test]
    fn test_command_families_in_order() {
        let classifier = SafetyClassifier::default();

        let forbidden = classifier.classify(&command("rm -rf /"));
        assert_eq!(forbidden.verdict, RiskVerdict::Forbidden);
        assert_eq!(forbidden.rule.as_deref(), Some("root_wipe"));

        let dangerous = classifier.classify(&command("rm -rf /tmp/x"));
        assert_eq!(dangerous.verdict, RiskVerdict::RequiresConfirmation);
        assert_eq!(dangerous.rule.as_deref(), Some("destructive_filesystem"));

        assert_eq!(
            classifier.classify(&command("df -h && uptime")).verdict,
            RiskVerdict::Safe
        );
    }

    #[test]
    fn test_command_in_protected_directory() {
        let classifier = SafetyClassifier::default();
        let result = classifier.classify(&Action::Command {
            command: "ls".into(),
            working_dir: Some(PathBuf::from("/boot/grub")),
        });
        assert_eq!(result.verdict, RiskVerdict::Forbidden);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = SafetyClassifier::default();
        for action in [
            command("systemctl restart nginx"),
            command("echo hi"),
            command(":(){ :|:& };:"),
            file(FileOp::Delete, "/tmp/x"),
        ] {
            assert_eq!(classifier.classify(&action), classifier.classify(&action));
        }
    }

    #[test]
    fn test_custom_table() {
        let rules = RuleTable::from_toml_str(
            r#"
            [[dangerous_commands]]
            id = "git_push"
            hazard = "remote_code_execution"
            pattern = '\bgit\s+push\b'
            "#,
        )
        .unwrap();
        let classifier = SafetyClassifier::new(rules);

        assert_eq!(
            classifier.classify(&command("git push origin main")).verdict,
            RiskVerdict::RequiresConfirmation
        );
        // The default table is gone entirely.
        assert_eq!(
            classifier.classify(&file(FileOp::Write, "/etc/hosts")).verdict,
            RiskVerdict::Safe
        );
    }

    #[test]
    fn test_shell_wrapped_commands_are_classified() {
        let classifier = SafetyClassifier::default();
        for wrapped in [
            "bash -c 'rm -rf /tmp/x'",
            "sh -c \"rm -rf ./data\"",
            "bash -lc 'cd /srv && rm -rf ./data'",
            "echo 'rm -rf ./data' | sh",
            "su deploy -c 'systemctl restart app'",
            "ssh web-1 'sudo reboot'",
            "kubectl exec web-1 -- sh -c 'kill 1'",
        ] {
            assert_eq!(
                classifier.classify(&command(wrapped)).verdict,
                RiskVerdict::RequiresConfirmation,
                "{wrapped}"
            );
        }
    }

    #[test]
    fn test_shell_wrapped_root_wipe_is_forbidden() {
        let classifier = SafetyClassifier::default();
        for wrapped in [
            "bash -c 'rm -rf /'",
            "sh -c \"rm -rf /\"",
            "bash -c \"bash -c 'rm -rf /'\"",
            "echo 'rm -rf /' | bash",
        ] {
            let result = classifier.classify(&command(wrapped));
            assert_eq!(result.verdict, RiskVerdict::Forbidden, "{wrapped}");
            assert_eq!(result.rule.as_deref(), Some("root_wipe"), "{wrapped}");
        }
    }

    #[test]
    fn test_quoted_text_outside_a_shell_string_stays_safe() {
        let classifier = SafetyClassifier::default();
        for text in [
            "grep -r 'rm -rf' scripts/",
            "git commit -m \"rm stale fixtures\"",
            "bash -c 'df -h'",
        ] {
            assert_eq!(
                classifier.classify(&command(text)).verdict,
                RiskVerdict::Safe,
                "{text}"
            );
        }
    }

    #[test]
    fn test_workspace_below_protected_dir_is_usable() {
        let classifier = SafetyClassifier::default().with_workspace("/root/project");

        assert_eq!(
            classifier
                .classify(&file(FileOp::Read, "/root/project/notes.txt"))
                .verdict,
            RiskVerdict::Safe
        );
        assert_eq!(
            classifier
                .classify(&Action::Command {
                    command: "ls".into(),
                    working_dir: Some(PathBuf::from("/root/project/src")),
                })
                .verdict,
            RiskVerdict::Safe
        );
        // Outside the workspace the prefix still applies.
        assert_eq!(
            classifier
                .classify(&file(FileOp::Read, "/root/.ssh/id_rsa"))
                .verdict,
            RiskVerdict::Forbidden
        );
        assert_eq!(
            classifier
                .classify(&file(FileOp::Read, "/etc/shadow"))
                .verdict,
            RiskVerdict::Forbidden
        );
    }

    #[test]
    fn test_workspace_containing_protected_dir_gets_no_exemption() {
        for root in ["/", "/etc"] {
            let classifier = SafetyClassifier::default().with_workspace(root);
            assert_eq!(
                classifier
                    .classify(&file(FileOp::Write, "/etc/hosts"))
                    .verdict,
                RiskVerdict::Forbidden,
                "{root}"
            );
        }
    }
}
