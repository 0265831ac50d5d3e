//! Git 操作工具：直接以参数列表调用 git，不经过 shell

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::tools::filesystem::SafeFs;
use crate::tools::registry::{mentions_any, required_str, str_param, Capability};
use crate::workflow::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GitOp {
    InitializeRepo,
    CreateBranch,
    Commit,
    GetStatus,
    GetCurrentBranch,
}

impl GitOp {
    const ALL: [GitOp; 5] = [
        GitOp::InitializeRepo,
        GitOp::CreateBranch,
        GitOp::Commit,
        GitOp::GetStatus,
        GitOp::GetCurrentBranch,
    ];

    fn as_str(self) -> &'static str {
        match self {
            GitOp::InitializeRepo => "initialize_repo",
            GitOp::CreateBranch => "create_branch",
            GitOp::Commit => "commit",
            GitOp::GetStatus => "get_status",
            GitOp::GetCurrentBranch => "get_current_branch",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

/// Git 工具（`git_operations`）
pub struct GitOperations {
    fs: SafeFs,
}

impl GitOperations {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(base_path),
        }
    }

    fn repo_path(&self, params: &Params) -> Result<PathBuf, String> {
        self.fs.resolve(str_param(params, "repo_path").unwrap_or("."))
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Value {
        tracing::info!(repo = %repo.display(), args = ?args, "git");
        match Command::new("git").args(args).current_dir(repo).output().await {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let mut value = json!({
                    "success": output.status.success(),
                    "returncode": output.status.code(),
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": stderr,
                    "command": format!("git {}", args.join(" ")),
                });
                if !output.status.success() {
                    value["error"] = Value::String(format!("git {} failed: {}", args[0], stderr.trim()));
                }
                value
            }
            Err(e) => json!({"success": false, "error": format!("Failed to run git: {e}")}),
        }
    }

    async fn run(&self, op: GitOp, params: &Params) -> Result<Value, String> {
        let repo = self.repo_path(params)?;
        let value = match op {
            GitOp::InitializeRepo => {
                tokio::fs::create_dir_all(&repo)
                    .await
                    .map_err(|e| format!("Create directory failed: {e}"))?;
                with_message(self.git(&repo, &["init"]).await, "Git repository initialized")
            }
            GitOp::CreateBranch => {
                let branch = required_str(params, "branch_name")?;
                with_message(
                    self.git(&repo, &["checkout", "-b", branch]).await,
                    &format!("Branch '{branch}' created"),
                )
            }
            GitOp::Commit => {
                let message = required_str(params, "message")?;
                let add_all = params.get("add_all").and_then(Value::as_bool).unwrap_or(true);
                let mut details = Vec::new();
                if add_all {
                    details.push(self.git(&repo, &["add", "-A"]).await);
                }
                let commit = self.git(&repo, &["commit", "-m", message]).await;
                let success = commit["success"].as_bool().unwrap_or(false);
                let error = commit.get("error").cloned();
                details.push(commit);
                if success {
                    json!({"success": true, "message": format!("Changes committed: {message}"), "details": details})
                } else {
                    json!({
                        "success": false,
                        "error": error.unwrap_or_else(|| Value::String("Commit failed".into())),
                        "details": details,
                    })
                }
            }
            GitOp::GetStatus => self.git(&repo, &["status"]).await,
            GitOp::GetCurrentBranch => {
                let out = self.git(&repo, &["branch", "--show-current"]).await;
                if out["success"].as_bool().unwrap_or(false) {
                    let branch = out["stdout"].as_str().unwrap_or("").trim().to_string();
                    json!({"success": true, "branch": branch})
                } else {
                    out
                }
            }
        };
        Ok(value)
    }
}

fn with_message(mut value: Value, message: &str) -> Value {
    if value["success"].as_bool().unwrap_or(false) {
        value["message"] = Value::String(message.to_string());
    }
    value
}

#[async_trait]
impl Capability for GitOperations {
    fn name(&self) -> &str {
        "git_operations"
    }

    fn description(&self) -> &str {
        "Initialize repositories, create branches, commit and inspect status"
    }

    fn operations(&self) -> Vec<&'static str> {
        GitOp::ALL.iter().map(|op| op.as_str()).collect()
    }

    fn default_operation(&self, description: &str) -> Option<&'static str> {
        let op = if mentions_any(description, &["init", "initialize"]) {
            GitOp::InitializeRepo
        } else if mentions_any(description, &["branch"]) {
            GitOp::CreateBranch
        } else if mentions_any(description, &["commit"]) {
            GitOp::Commit
        } else if mentions_any(description, &["status"]) {
            GitOp::GetStatus
        } else {
            return None;
        };
        Some(op.as_str())
    }

    async fn execute(&self, operation: &str, params: &Params) -> Result<Value, String> {
        let op = GitOp::parse(operation).ok_or_else(|| format!("Unsupported operation: {operation}"))?;
        Ok(self
            .run(op, params)
            .await
            .unwrap_or_else(|e| json!({"success": false, "error": e})))
    }
}
