//! Spawn parameters for agent sessions and their translation into a PTY
//! command line.

use pty_manager::PtyConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::SessionConfig;

/// Model selector accepted by the agent CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Opus,
    Sonnet,
    Haiku,
}

impl Model {
    pub fn canonical_name(self) -> &'static str {
        match self {
            Model::Opus => "opus",
            Model::Sonnet => "sonnet",
            Model::Haiku => "haiku",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownModel(pub String);

impl FromStr for Model {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opus" => Ok(Model::Opus),
            "sonnet" => Ok(Model::Sonnet),
            "haiku" => Ok(Model::Haiku),
            _ => Err(UnknownModel(s.to_string())),
        }
    }
}

/// Immutable snapshot of how a session's process is launched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnParams {
    pub command: String,
    pub cwd: String,
    #[serde(default)]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub bypass_permissions: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub model: Option<Model>,
}

impl SpawnParams {
    /// Agent CLI flags in the order the agent expects them.
    pub fn agent_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(resume_id) = self.resume_id.as_deref().filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(resume_id.to_string());
        }
        if self.bypass_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }
        if let Some(model) = self.model {
            args.push("--model".to_string());
            args.push(model.canonical_name().to_string());
        }
        args
    }

    /// Build the PTY launch description at the given geometry.
    ///
    /// A command containing whitespace (`npx claude`, `pnpm run agent`) runs
    /// through `$SHELL -c`, with flags shell-quoted onto the end.
    pub fn to_pty_config(&self, cols: u16, rows: u16) -> PtyConfig {
        let command = self.command.trim();
        let agent_args = self.agent_args();

        let (program, args) = if command.contains(char::is_whitespace) {
            let shell = std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string());
            let mut line = command.to_string();
            for arg in &agent_args {
                line.push(' ');
                line.push_str(&shell_quote(arg));
            }
            (shell, vec!["-c".to_string(), line])
        } else {
            (command.to_string(), agent_args)
        };

        PtyConfig {
            command: program,
            args,
            working_dir: Some(self.cwd.clone()),
            env: Vec::new(),
            rows,
            cols,
        }
    }
}

/// Optional spawn fields as supplied by a caller; blanks fall back to
/// configured defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub bypass_permissions: Option<bool>,
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default)]
    pub model: Option<Model>,
}

impl SpawnRequest {
    /// Fill a fresh set of params, taking unset fields from configuration.
    pub fn resolve(self, defaults: &SessionConfig) -> SpawnParams {
        SpawnParams {
            command: non_blank(self.command).unwrap_or_else(|| defaults.default_command.clone()),
            cwd: non_blank(self.cwd).unwrap_or_else(|| defaults.default_cwd.clone()),
            resume_id: non_blank(self.resume_id),
            bypass_permissions: self.bypass_permissions.unwrap_or(false),
            verbose: self.verbose.unwrap_or(false),
            model: self.model,
        }
    }

    /// Override only the fields that were supplied.
    pub fn amend(self, base: &SpawnParams) -> SpawnParams {
        SpawnParams {
            command: non_blank(self.command).unwrap_or_else(|| base.command.clone()),
            cwd: non_blank(self.cwd).unwrap_or_else(|| base.cwd.clone()),
            resume_id: self.resume_id.or_else(|| base.resume_id.clone()),
            bypass_permissions: self.bypass_permissions.unwrap_or(base.bypass_permissions),
            verbose: self.verbose.unwrap_or(base.verbose),
            model: self.model.or(base.model),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Quote a single word for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(command: &str) -> SpawnParams {
        SpawnParams {
            command: command.to_string(),
            cwd: "/tmp".to_string(),
            resume_id: None,
            bypass_permissions: false,
            verbose: false,
            model: None,
        }
    }

    #[test]
    fn no_flags_by_default() {
        assert!(params("claude").agent_args().is_empty());
    }

    #[test]
    fn all_flags_in_order() {
        let p = SpawnParams {
            resume_id: Some("abc-123".into()),
            bypass_permissions: true,
            verbose: true,
            model: Some(Model::Sonnet),
            ..params("claude")
        };
        assert_eq!(
            p.agent_args(),
            vec![
                "--resume",
                "abc-123",
                "--dangerously-skip-permissions",
                "--verbose",
                "--model",
                "sonnet"
            ]
        );
    }

    #[test]
    fn blank_resume_id_is_ignored() {
        let p = SpawnParams {
            resume_id: Some(String::new()),
            ..params("claude")
        };
        assert!(p.agent_args().is_empty());
    }

    #[test]
    fn simple_command_runs_directly() {
        let p = SpawnParams {
            verbose: true,
            ..params("claude")
        };
        let config = p.to_pty_config(120, 40);
        assert_eq!(config.command, "claude");
        assert_eq!(config.args, vec!["--verbose"]);
        assert_eq!(config.working_dir.as_deref(), Some("/tmp"));
        assert_eq!((config.cols, config.rows), (120, 40));
    }

    #[test]
    fn compound_command_runs_through_shell() {
        let p = SpawnParams {
            resume_id: Some("it's".into()),
            ..params("npx claude")
        };
        let config = p.to_pty_config(80, 24);
        assert_eq!(config.args[0], "-c");
        assert_eq!(config.args[1], r"npx claude --resume 'it'\''s'");
    }

    #[test]
    fn model_parsing() {
        assert_eq!("opus".parse::<Model>(), Ok(Model::Opus));
        assert_eq!(" Haiku ".parse::<Model>(), Ok(Model::Haiku));
        assert!("gpt".parse::<Model>().is_err());
    }

    #[test]
    fn shell_quote_cases() {
        assert_eq!(shell_quote("plain-word"), "plain-word");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn request_falls_back_to_defaults() {
        let defaults = SessionConfig::for_tests();
        let resolved = SpawnRequest {
            command: Some("  ".into()),
            cwd: None,
            model: Some(Model::Opus),
            ..Default::default()
        }
        .resolve(&defaults);
        assert_eq!(resolved.command, defaults.default_command);
        assert_eq!(resolved.cwd, defaults.default_cwd);
        assert_eq!(resolved.model, Some(Model::Opus));
        assert!(!resolved.verbose);
    }

    #[test]
    fn amend_keeps_unset_fields() {
        let base = SpawnParams {
            resume_id: Some("r1".into()),
            bypass_permissions: true,
            ..params("claude")
        };
        let amended = SpawnRequest {
            verbose: Some(true),
            model: Some(Model::Haiku),
            ..Default::default()
        }
        .amend(&base);
        assert_eq!(amended.command, "claude");
        assert_eq!(amended.resume_id.as_deref(), Some("r1"));
        assert!(amended.bypass_permissions);
        assert!(amended.verbose);
        assert_eq!(amended.model, Some(Model::Haiku));

        // An empty resume id clears it
        let cleared = SpawnRequest {
            resume_id: Some(String::new()),
            ..Default::default()
        }
        .amend(&base);
        assert_eq!(cleared.resume_id.as_deref(), Some(""));
        assert!(cleared.agent_args().iter().all(|a| a != "--resume"));
    }
}
