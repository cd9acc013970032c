//! Safety rule table.
//!
//! The table is data: the built-in defaults below can be replaced wholesale by
//! a TOML file of the same shape.
//!
//! ```toml
//! forbidden_paths = ["/etc", "/boot"]
//!
//! [[forbidden_commands]]
//! id = "root_wipe"
//! hazard = "destructive_filesystem"
//! pattern = '\brm\s+(-\S+\s+)*/(\s|$)'
//! description = "Recursive delete of the filesystem root"
//!
//! [[dangerous_commands]]
//! id = "service_lifecycle"
//! hazard = "service_lifecycle"
//! pattern = '\bsystemctl\b'
//! description = "Service start/stop/restart"
//! ```

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hazard class a command rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardClass {
    DestructiveFilesystem,
    PrivilegeChange,
    ServiceLifecycle,
    ClusterMutation,
    PermissionChange,
    ProcessControl,
    Scheduling,
    RemoteCodeExecution,
}

impl HazardClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DestructiveFilesystem => "destructive_filesystem",
            Self::PrivilegeChange => "privilege_change",
            Self::ServiceLifecycle => "service_lifecycle",
            Self::ClusterMutation => "cluster_mutation",
            Self::PermissionChange => "permission_change",
            Self::ProcessControl => "process_control",
            Self::Scheduling => "scheduling",
            Self::RemoteCodeExecution => "remote_code_execution",
        }
    }
}

impl std::fmt::Display for HazardClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matches a word only where a shell would treat it as the command being
/// run: line start, after a separator, subshell opener or `!`, after a shell
/// keyword (`then`, `do`, `eval`, ...) or a wrapper such as `sudo`/`xargs`
/// with its options. Leading `VAR=value` assignments, a `\` alias escape and
/// a directory prefix (`/bin/rm`) are skipped.
const COMMAND_POSITION: &str = concat!(
    r"(?:^|[;&|(`{!]|\b(?:xargs|exec|sudo|doas|nohup|env|time|watch|nice|then|do|else|elif|eval|command|builtin)",
    r"(?:\s+-\S+(?:\s+[^-\s;&|]\S*)?)*\s)",
    r"\s*(?:\w+=\S*\s+)*\\?(?:\S*/)?",
);

/// Word terminator for [`COMMAND_POSITION`] patterns.
const WORD_END: &str = r#"(?:\s|$|[;&|)'"`])"#;

/// A regex rule over command strings.
#[derive(Debug, Clone)]
pub struct CommandRule {
    /// Rule identifier, reported in verdicts and audit logs.
    pub id: String,
    pub hazard: HazardClass,
    pattern: Regex,
    /// Human-readable description.
    pub description: String,
}

impl CommandRule {
    /// Create a rule from a user-supplied regex.
    pub fn new(
        id: impl Into<String>,
        hazard: HazardClass,
        pattern: &str,
        description: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            hazard,
            pattern: Regex::new(pattern)?,
            description: description.into(),
        })
    }

    /// Built-in rule from a literal pattern.
    fn builtin(id: &str, hazard: HazardClass, pattern: &str, description: &str) -> Self {
        Self::new(id, hazard, pattern, description).expect("Invalid built-in safety regex")
    }

    /// Built-in rule matching any of `words` in command position, case-insensitive.
    fn keywords(id: &str, hazard: HazardClass, words: &[&str], description: &str) -> Self {
        let alternatives = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = ["(?im)", COMMAND_POSITION, "(?:", &alternatives, ")", WORD_END].concat();
        Self::builtin(id, hazard, &pattern, description)
    }

    /// Check if a command matches this rule.
    pub fn matches(&self, command: &str) -> bool {
        self.pattern.is_match(command)
    }

    /// The regex source.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Ordered rule families consulted by the classifier.
#[derive(Debug, Clone)]
pub struct RuleTable {
    /// File actions under these directories are never allowed.
    pub forbidden_paths: Vec<PathBuf>,
    /// Commands that never run, whatever the user says.
    pub forbidden_commands: Vec<CommandRule>,
    /// Commands that need confirmation.
    pub dangerous_commands: Vec<CommandRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRuleTable {
    #[serde(default)]
    forbidden_paths: Vec<PathBuf>,
    #[serde(default)]
    forbidden_commands: Vec<RawCommandRule>,
    #[serde(default)]
    dangerous_commands: Vec<RawCommandRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommandRule {
    id: String,
    hazard: HazardClass,
    pattern: String,
    #[serde(default)]
    description: String,
}

impl RawCommandRule {
    fn compile(self, family: &str) -> Result<CommandRule, ConfigError> {
        CommandRule::new(&self.id, self.hazard, &self.pattern, self.description).map_err(|e| {
            ConfigError::InvalidValue {
                key: format!("{}.{}", family, self.id),
                message: e.to_string(),
            }
        })
    }
}

impl RuleTable {
    /// Parse a TOML rule table. Regexes are compiled here, so a bad pattern
    /// fails at load time rather than during classification.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawRuleTable =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        for path in &raw.forbidden_paths {
            if !path.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    key: "forbidden_paths".to_string(),
                    message: format!("{} is not an absolute path", path.display()),
                });
            }
        }

        Ok(Self {
            forbidden_paths: raw.forbidden_paths,
            forbidden_commands: raw
                .forbidden_commands
                .into_iter()
                .map(|r| r.compile("forbidden_commands"))
                .collect::<Result<_, _>>()?,
            dangerous_commands: raw
                .dangerous_commands
                .into_iter()
                .map(|r| r.compile("dangerous_commands"))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Load a TOML rule table from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let table = Self::from_toml_str(&contents)?;
        tracing::info!(
            path = %path.display(),
            forbidden_paths = table.forbidden_paths.len(),
            forbidden_commands = table.forbidden_commands.len(),
            dangerous_commands = table.dangerous_commands.len(),
            "Loaded safety rule table"
        );
        Ok(table)
    }

    /// The protected directory containing `path`, if any.
    pub fn forbidden_path_for(&self, path: &Path) -> Option<&Path> {
        self.forbidden_paths
            .iter()
            .find(|p| path.starts_with(p))
            .map(PathBuf::as_path)
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        use HazardClass::*;

        let forbidden_paths = [
            "/etc", "/sys", "/proc", "/dev", "/boot", "/root", "/var/log", "/var/lib", "/usr/bin",
            "/usr/sbin", "/bin", "/sbin",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect();

        let forbidden_commands = vec![
            CommandRule::builtin(
                "root_wipe",
                DestructiveFilesystem,
                r#"(?i)\brm\s+(?:-{1,2}[\w-]+\s+)*['"]?(?:/\*?|~/?\*?)['"]?(?:\s|$|[;&|)`'"])"#,
                "Delete of the filesystem root or home directory",
            ),
            CommandRule::builtin(
                "fork_bomb",
                ProcessControl,
                r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
                "Fork bomb",
            ),
            CommandRule::builtin(
                "format_device",
                DestructiveFilesystem,
                r"(?i)\bmkfs(?:\.\w+)?\b[^;&|]*\s/dev/",
                "Creating a filesystem on a block device",
            ),
            CommandRule::builtin(
                "overwrite_device",
                DestructiveFilesystem,
                r"(?i)(?:\bdd\b[^;&|]*\bof=|>\s*)/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
                "Raw write to a block device",
            ),
            CommandRule::builtin(
                "pipe_to_shell",
                RemoteCodeExecution,
                r"(?i)\b(?:curl|wget)\b[^|;&]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b",
                "Piping a download straight into a shell",
            ),
            CommandRule::builtin(
                "chmod_root",
                PermissionChange,
                r"(?i)\bchmod\s+(?:-\w+\s+)*-\w*R\w*\s+(?:-\w+\s+)*0?777\s+/(?:\s|$)",
                "World-writable permissions on the whole filesystem",
            ),
        ];

        let dangerous_commands = vec![
            CommandRule::keywords(
                "destructive_filesystem",
                DestructiveFilesystem,
                &[
                    "rm", "rmdir", "shred", "del", "delete", "format", "fdisk", "mkfs", "dd",
                    "truncate", "wipefs",
                ],
                "Deletes or overwrites data",
            ),
            CommandRule::keywords(
                "privilege_change",
                PrivilegeChange,
                &["sudo", "su", "doas", "passwd", "chown", "chgrp", "useradd", "userdel", "usermod"],
                "Changes users or runs with elevated privileges",
            ),
            CommandRule::keywords(
                "service_lifecycle",
                ServiceLifecycle,
                &["systemctl", "service", "init", "shutdown", "reboot", "halt", "poweroff"],
                "Starts, stops or restarts services or the host",
            ),
            CommandRule::builtin(
                "cluster_mutation",
                ClusterMutation,
                &[
                    "(?im)",
                    COMMAND_POSITION,
                    r"(?:kubectl\s+(?:\S+\s+)*?(?:delete|apply|create|replace|patch|scale|drain|cordon|uncordon|rollout|edit|label|annotate|set|taint)",
                    r"|helm\s+(?:\S+\s+)*?(?:install|upgrade|uninstall|delete|rollback)",
                    r"|docker\s+(?:\S+\s+)*?(?:rm|rmi|kill|stop|restart|prune))",
                    WORD_END,
                ]
                .concat(),
                "Mutates cluster or container state",
            ),
            CommandRule::builtin(
                "permission_change",
                PermissionChange,
                &[
                    "(?im)",
                    COMMAND_POSITION,
                    r"chmod\s+(?:-\S+\s+)*(?:0?777|a\+rwx|[ugoa]*\+s)",
                    WORD_END,
                ]
                .concat(),
                "Makes files world-writable or setuid",
            ),
            CommandRule::keywords(
                "process_control",
                ProcessControl,
                &["kill", "killall", "pkill"],
                "Signals running processes",
            ),
            CommandRule::keywords(
                "scheduling",
                Scheduling,
                &["crontab", "at", "batch", "nohup"],
                "Schedules work that outlives the session",
            ),
            CommandRule::builtin(
                "shell_interpreter",
                RemoteCodeExecution,
                r"(?i)\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b|\beval\b",
                "Runs generated text through a shell interpreter",
            ),
        ];

        Self {
            forbidden_paths,
            forbidden_commands,
            dangerous_commands,
        }
    }
}
