//! Static registry of the external AI CLIs the environment can host.
//!
//! Argument conventions (resume flags, install commands) are looked up
//! here; the core never parses tool output.

use serde::Serialize;
use ts_rs::TS;

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct ToolDefinition {
    /// Stable identifier used in launch history and the command surface.
    pub id: &'static str,
    /// Tab display name ("Claude", "Gemini", …).
    pub display_name: &'static str,
    /// Executable looked up on PATH.
    pub binary: &'static str,
    /// Appended when the tool has been launched into the project before.
    /// Tools without a resume concept always launch fresh.
    pub resume_flag: Option<&'static str>,
    pub install_command: &'static [&'static str],
    pub update_command: &'static [&'static str],
    pub version_args: &'static [&'static str],
}

impl ToolDefinition {
    /// Shell command for launching into a project, resume flag included
    /// when the launch history says so.
    pub fn launch_command(&self, resume: bool) -> String {
        match (resume, self.resume_flag) {
            (true, Some(flag)) => format!("{} {}", self.binary, flag),
            _ => self.binary.to_string(),
        }
    }
}

static TOOLS: &[ToolDefinition] = &[
    ToolDefinition {
        id: "claude-code",
        display_name: "Claude",
        binary: "claude",
        resume_flag: Some("--continue"),
        install_command: &["npm", "install", "-g", "@anthropic-ai/claude-code"],
        update_command: &["npm", "update", "-g", "@anthropic-ai/claude-code"],
        version_args: &["--version"],
    },
    ToolDefinition {
        id: "gemini-cli",
        display_name: "Gemini",
        binary: "gemini",
        resume_flag: None,
        install_command: &["npm", "install", "-g", "@google/gemini-cli"],
        update_command: &["npm", "update", "-g", "@google/gemini-cli"],
        version_args: &["--version"],
    },
    ToolDefinition {
        id: "openai-codex",
        display_name: "Codex",
        binary: "codex",
        resume_flag: Some("resume"),
        install_command: &["npm", "install", "-g", "@openai/codex"],
        update_command: &["npm", "update", "-g", "@openai/codex"],
        version_args: &["--version"],
    },
    ToolDefinition {
        id: "aider",
        display_name: "Aider",
        binary: "aider",
        resume_flag: Some("--restore-chat-history"),
        install_command: &["python3", "-m", "pip", "install", "--upgrade", "aider-chat"],
        update_command: &["python3", "-m", "pip", "install", "--upgrade", "aider-chat"],
        version_args: &["--version"],
    },
];

pub fn all() -> &'static [ToolDefinition] {
    TOOLS
}

pub fn find(id: &str) -> Option<&'static ToolDefinition> {
    TOOLS.iter().find(|tool| tool.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let mut ids: Vec<&str> = all().iter().map(|t| t.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), all().len());
    }

    #[test]
    fn test_display_names_are_unique() {
        let mut names: Vec<&str> = all().iter().map(|t| t.display_name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn test_find_known_tool() {
        let tool = find("claude-code").unwrap();
        assert_eq!(tool.display_name, "Claude");
        assert_eq!(tool.binary, "claude");
    }

    #[test]
    fn test_find_unknown_tool() {
        assert!(find("emacs").is_none());
    }

    #[test]
    fn test_launch_command_with_resume() {
        let tool = find("claude-code").unwrap();
        assert_eq!(tool.launch_command(false), "claude");
        assert_eq!(tool.launch_command(true), "claude --continue");
    }

    #[test]
    fn test_launch_command_without_resume_concept() {
        let tool = find("gemini-cli").unwrap();
        assert_eq!(tool.launch_command(true), "gemini");
    }
}
