//! 命令执行工具：命令名白名单 + 危险子串拦截
//!
//! 命令名取第一个空白分隔的 token，按精确匹配查表。
//! `execute` 受配置中的 allowed_commands 约束（为空时不限制命令名，但仍拦截危险子串）；
//! `execute_safe` 额外要求命令名在内置安全列表中，否则返回 requires_confirmation。
//! 执行通过 sh -c / cmd /C，带超时。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::tools::filesystem::SafeFs;
use crate::tools::registry::{required_str, str_param, Capability};
use crate::workflow::Params;

/// 禁止的子串（无论白名单如何配置）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// execute_safe 允许的命令名
const SAFE_COMMANDS: &[&str] = &[
    "git", "npm", "pip", "python", "python3", "node", "npx", "yarn", "pnpm", "ls", "pwd", "cd",
    "mkdir", "echo",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandOp {
    Execute,
    ExecuteSafe,
}

impl CommandOp {
    const ALL: [CommandOp; 2] = [CommandOp::Execute, CommandOp::ExecuteSafe];

    fn as_str(self) -> &'static str {
        match self {
            CommandOp::Execute => "execute",
            CommandOp::ExecuteSafe => "execute_safe",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

/// 命令执行工具（`command_executor`）
pub struct CommandExecutor {
    allowed_commands: HashSet<String>,
    timeout: Duration,
    fs: SafeFs,
}

impl CommandExecutor {
    pub fn new(base_path: impl AsRef<Path>, allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            allowed_commands: allowed_commands
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            timeout: Duration::from_secs(timeout_secs),
            fs: SafeFs::new(base_path),
        }
    }

    fn check(&self, command: &str) -> Result<(), String> {
        let lower = command.to_lowercase();
        if lower.trim().is_empty() {
            return Err("Empty command".to_string());
        }
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {forbidden}"));
        }
        let name = command_name(&lower);
        if !self.allowed_commands.is_empty() && !self.allowed_commands.contains(name) {
            return Err(format!("Command '{name}' not in allowed list"));
        }
        Ok(())
    }

    fn working_dir(&self, params: &Params) -> Result<PathBuf, String> {
        match str_param(params, "cwd") {
            Some(cwd) => self.fs.resolve(cwd),
            None => Ok(self.fs.root().to_path_buf()),
        }
    }

    /// 执行命令并返回 {success, returncode, stdout, stderr, command}
    pub async fn run(&self, command: &str, cwd: &Path) -> Value {
        if let Err(e) = self.check(command) {
            return json!({"success": false, "error": e, "command": command});
        }
        tracing::info!(command = %command, cwd = %cwd.display(), "command execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(cwd).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => json!({
                "success": output.status.success(),
                "returncode": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
                "command": command,
            }),
            Ok(Err(e)) => json!({"success": false, "error": e.to_string(), "command": command}),
            Err(_) => json!({
                "success": false,
                "error": format!("Command timed out after {} seconds", self.timeout.as_secs()),
                "command": command,
            }),
        }
    }

    async fn execute_safe(&self, command: &str, cwd: &Path) -> Value {
        let lower = command.to_lowercase();
        let name = command_name(&lower);
        if !SAFE_COMMANDS.iter().any(|safe| *safe == name) {
            return json!({
                "success": false,
                "error": format!("Command not in safe list: {command}"),
                "requires_confirmation": true,
            });
        }
        self.run(command, cwd).await
    }
}

/// 只取第一个 token 作为命令名
fn command_name(raw: &str) -> &str {
    raw.split_whitespace().next().unwrap_or("")
}

#[async_trait]
impl Capability for CommandExecutor {
    fn name(&self) -> &str {
        "command_executor"
    }

    fn description(&self) -> &str {
        "Run allow-listed shell commands inside the workspace"
    }

    fn operations(&self) -> Vec<&'static str> {
        CommandOp::ALL.iter().map(|op| op.as_str()).collect()
    }

    fn default_operation(&self, _description: &str) -> Option<&'static str> {
        Some(CommandOp::ExecuteSafe.as_str())
    }

    async fn execute(&self, operation: &str, params: &Params) -> Result<Value, String> {
        let op = CommandOp::parse(operation).ok_or_else(|| format!("Unsupported operation: {operation}"))?;
        let command = required_str(params, "command")?;
        let cwd = match self.working_dir(params) {
            Ok(cwd) => cwd,
            Err(e) => return Ok(json!({"success": false, "error": e})),
        };
        Ok(match op {
            CommandOp::Execute => self.run(command, &cwd).await,
            CommandOp::ExecuteSafe => self.execute_safe(command, &cwd).await,
        })
    }
}
