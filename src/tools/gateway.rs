//! 工具调用网关
//!
//! 把任务上的 (tool, operation, params) 路由到已注册的 Capability，施加超时，
//! 并把四类结果（找不到工具、找不到操作、工具报错、超时）统一归一化为 `{success:false, error}` 形态的 ToolOutcome，
//! 调度器因此可以对它们一视同仁地重试。每次调用输出一条 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::EngineError;
use crate::tools::registry::{mentions_any, ToolRegistry};
use crate::workflow::{Params, Task};

/// 工具推断关键词表：按顺序匹配，先中先得
const INFERENCE_TABLE: &[(&str, &[&str])] = &[
    ("file_operations", &["file", "write", "directory"]),
    ("git_operations", &["git", "commit", "branch", "repository"]),
    ("web_operations", &["download", "fetch", "request", "http", "url"]),
    ("command_executor", &["run", "execute", "command", "install", "python", "npm"]),
];

/// 未绑定工具时，按描述关键词推断工具名
pub fn infer_tool(description: &str) -> Option<&'static str> {
    INFERENCE_TABLE
        .iter()
        .find(|(_, keywords)| mentions_any(description, keywords))
        .map(|(tool, _)| *tool)
}

/// 归一化后的工具结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    /// 工具返回的完整对象（含 success 键）
    pub payload: Params,
    pub error: Option<String>,
}

impl ToolOutcome {
    /// 工具返回值必须是带布尔 `success` 键的对象，否则按失败处理
    pub fn from_value(value: Value) -> Self {
        let Value::Object(payload) = value else {
            return Self::failed("Tool returned a non-object outcome");
        };
        let success = payload.get("success").and_then(Value::as_bool);
        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        match success {
            Some(true) => Self {
                success: true,
                payload,
                error: None,
            },
            Some(false) => Self {
                success: false,
                error: Some(error.unwrap_or_else(|| "Tool reported failure".to_string())),
                payload,
            },
            None => Self {
                success: false,
                error: Some(error.unwrap_or_else(|| "Tool outcome is missing 'success'".to_string())),
                payload,
            },
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        let mut payload = Params::new();
        payload.insert("success".into(), Value::Bool(false));
        payload.insert("error".into(), Value::String(error.clone()));
        Self {
            success: false,
            payload,
            error: Some(error),
        }
    }

    /// 成功结果的可读输出
    pub fn message(&self) -> String {
        ["message", "content", "stdout"]
            .iter()
            .find_map(|k| self.payload.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| "Task completed".to_string())
    }

    pub fn error_text(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

impl From<EngineError> for ToolOutcome {
    fn from(err: EngineError) -> Self {
        Self::failed(err.to_string())
    }
}

/// 一次工具调用的三元组
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub tool: String,
    /// None 时由工具按任务描述推断默认操作
    pub operation: Option<String>,
    pub params: Params,
}

impl Invocation {
    /// 从任务解析调用：`tool` 可写成 `name.operation`，`tool_params.operation` 优先；
    /// 任务未绑定工具时按描述推断，推断不出返回 None
    pub fn for_task(task: &Task) -> Option<Self> {
        let raw = match task.tool.as_deref() {
            Some(tool) if !tool.trim().is_empty() => tool.trim().to_string(),
            _ => infer_tool(&task.description)?.to_string(),
        };
        let (tool, mut operation) = match raw.split_once('.') {
            Some((name, op)) => (name.to_string(), Some(op.to_string())),
            None => (raw, None),
        };

        let mut params = task.tool_params.clone();
        if let Some(op) = params.remove("operation") {
            if let Some(op) = op.as_str() {
                operation = Some(op.to_string());
            }
        }

        Some(Self {
            tool,
            operation,
            params,
        })
    }
}

/// 工具网关：持有显式构建的注册表与统一超时
pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 调用工具；所有失败都以 `success=false` 的 ToolOutcome 返回，不抛错
    pub async fn invoke(&self, invocation: &Invocation, description: &str) -> ToolOutcome {
        let start = Instant::now();
        let Some(capability) = self.registry.get(&invocation.tool) else {
            let outcome = ToolOutcome::from(EngineError::ToolNotFound(invocation.tool.clone()));
            audit(invocation, None, "not_found", &start);
            return outcome;
        };

        let operation = match invocation.operation.as_deref() {
            Some(op) => op.to_string(),
            None => match capability.default_operation(description) {
                Some(op) => op.to_string(),
                None => {
                    audit(invocation, None, "no_operation", &start);
                    return ToolOutcome::failed(format!(
                        "Could not determine operation for tool '{}'",
                        invocation.tool
                    ));
                }
            },
        };

        if !capability.supports(&operation) {
            audit(invocation, Some(&operation), "not_found", &start);
            return ToolOutcome::from(EngineError::OperationNotFound {
                tool: invocation.tool.clone(),
                operation,
            });
        }

        let result = timeout(self.timeout, capability.execute(&operation, &invocation.params)).await;
        let (outcome, label) = match result {
            Ok(Ok(value)) => {
                let outcome = ToolOutcome::from_value(value);
                let label = if outcome.success { "ok" } else { "failed" };
                (outcome, label)
            }
            Ok(Err(message)) => (
                ToolOutcome::from(EngineError::InvocationError {
                    tool: invocation.tool.clone(),
                    operation: operation.clone(),
                    message,
                }),
                "error",
            ),
            Err(_) => (
                ToolOutcome::failed(format!(
                    "Tool '{}' timed out after {}s",
                    invocation.tool,
                    self.timeout.as_secs_f64()
                )),
                "timeout",
            ),
        };
        audit(invocation, Some(&operation), label, &start);
        outcome
    }
}

fn audit(invocation: &Invocation, operation: Option<&str>, outcome: &str, start: &Instant) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": invocation.tool,
        "operation": operation,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "params_preview": params_preview(&invocation.params),
    });
    tracing::info!(audit = %audit, "tool");
}

fn params_preview(params: &Params) -> String {
    let s = Value::Object(params.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
