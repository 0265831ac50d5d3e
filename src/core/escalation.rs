//! 人工升级
//!
//! 判断任务是否需要人工确认（破坏性操作、需求含糊、存在多种可行方案、调用方显式要求），
//! 生成问题文本与 HumanInputRequest，并把人工回复解析为继续执行的决定。
//! 每个任务同一时刻最多一个未关闭的请求。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{EngineError, EngineResult};
use crate::workflow::{Goal, GoalId, Params, Task, TaskId};

/// 上下文中携带固定选项的键
pub const OPTIONS_KEY: &str = "escalation_options";
/// 上下文 / 工具参数中要求确认的键
pub const REQUIRES_CONFIRMATION_KEY: &str = "requires_confirmation";

static DESTRUCTIVE_RE: OnceLock<Regex> = OnceLock::new();
static AMBIGUOUS_RE: OnceLock<Regex> = OnceLock::new();

fn destructive_re() -> &'static Regex {
    DESTRUCTIVE_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(delete|remove|drop|destroy|format|wipe|truncate|uninstall)").unwrap()
    })
}

fn ambiguous_re() -> &'static Regex {
    AMBIGUOUS_RE.get_or_init(|| Regex::new(r"(?i)\b(maybe|perhaps|might|unclear|vague|not\s+sure)\b").unwrap())
}

/// 人工输入请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputRequest {
    pub id: String,
    pub goal_id: GoalId,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub question: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub context: Params,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub response: Option<Value>,
}

/// 解析后的人工回复
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 从固定选项中选中（index 为 1 起始）
    Selected { option: String, index: usize },
    /// 自由回复
    Response(Value),
}

/// 升级原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    Destructive,
    Ambiguous,
    MultipleApproaches,
    Requested,
}

impl EscalationReason {
    pub fn message(self) -> &'static str {
        match self {
            EscalationReason::Destructive => {
                "This task performs a destructive operation and requires human confirmation"
            }
            EscalationReason::Ambiguous => "The task requirements are ambiguous and need clarification",
            EscalationReason::MultipleApproaches => {
                "There are multiple valid approaches; please choose how to proceed"
            }
            EscalationReason::Requested => "This task requires human confirmation or input",
        }
    }
}

/// 判断是否存在多种可行方案（外部启发式，通常由 LLM 实现）
#[async_trait]
pub trait ApproachAdvisor: Send + Sync {
    async fn has_multiple_approaches(&self, task: &Task) -> bool;
}

/// 同步人工回复通道：阻塞直到人给出回复
#[async_trait]
pub trait HumanChannel: Send + Sync {
    async fn ask(&self, request: &HumanInputRequest) -> Result<Value, String>;
}

/// 升级管理器
#[derive(Default)]
pub struct EscalationManager {
    advisor: Option<Arc<dyn ApproachAdvisor>>,
    /// 未关闭请求：(goal_id, task_id) -> request_id；不同目标可以有同名任务
    outstanding: Mutex<HashMap<(GoalId, TaskId), String>>,
}

impl EscalationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn ApproachAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn is_destructive(task: &Task) -> bool {
        destructive_re().is_match(&task.description)
    }

    pub fn is_ambiguous(task: &Task) -> bool {
        ambiguous_re().is_match(&task.description)
    }

    /// 返回第一个命中的升级原因；None 表示无需人工介入
    pub async fn assess(&self, task: &Task, context: &Params) -> Option<EscalationReason> {
        if Self::is_destructive(task) {
            return Some(EscalationReason::Destructive);
        }
        if Self::is_ambiguous(task) {
            return Some(EscalationReason::Ambiguous);
        }
        if let Some(advisor) = &self.advisor {
            if advisor.has_multiple_approaches(task).await {
                return Some(EscalationReason::MultipleApproaches);
            }
        }
        let flagged = |p: &Params| p.get(REQUIRES_CONFIRMATION_KEY).and_then(Value::as_bool) == Some(true);
        if flagged(context) || flagged(&task.tool_params) {
            return Some(EscalationReason::Requested);
        }
        None
    }

    pub async fn should_escalate(&self, task: &Task, context: &Params) -> bool {
        self.assess(task, context).await.is_some()
    }

    /// 生成请求；任务已有未关闭请求时返回 EscalationPending
    pub fn create_request(
        &self,
        goal: &Goal,
        task: Option<&Task>,
        reason: &str,
        options: Option<Vec<String>>,
        context: Params,
    ) -> EngineResult<HumanInputRequest> {
        let id = uuid::Uuid::new_v4().to_string();
        if let Some(task) = task {
            let key = (goal.id.clone(), task.id.clone());
            let mut outstanding = self.outstanding();
            if let Some(existing) = outstanding.get(&key) {
                return Err(EngineError::EscalationPending {
                    task_id: task.id.clone(),
                    request_id: existing.clone(),
                });
            }
            outstanding.insert(key, id.clone());
        }

        let options = options.filter(|o| !o.is_empty());
        let question = question_text(goal, task, reason, options.as_deref());
        tracing::info!(request_id = %id, goal_id = %goal.id, task_id = ?task.map(|t| &t.id), "human input requested");
        Ok(HumanInputRequest {
            id,
            goal_id: goal.id.clone(),
            task_id: task.map(|t| t.id.clone()),
            question,
            options,
            context,
            created_at: Utc::now(),
            resolved: false,
            response: None,
        })
    }

    /// 解析回复：有固定选项时必须是精确匹配的选项文本或 1 起始的序号，否则 InvalidSelection。
    /// 无论是否有效，请求都会被关闭并记录原始回复。
    pub fn resolve_response(&self, request: &mut HumanInputRequest, response: Value) -> EngineResult<Resolution> {
        request.resolved = true;
        request.response = Some(response.clone());
        self.release(request);

        let Some(options) = &request.options else {
            return Ok(Resolution::Response(response));
        };

        if let Some(text) = response.as_str() {
            if let Some(pos) = options.iter().position(|o| o == text) {
                return Ok(Resolution::Selected {
                    option: options[pos].clone(),
                    index: pos + 1,
                });
            }
        }
        let index = match &response {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match index {
            Some(i) if i >= 1 && (i as usize) <= options.len() => Ok(Resolution::Selected {
                option: options[i as usize - 1].clone(),
                index: i as usize,
            }),
            _ => Err(EngineError::InvalidSelection(format!(
                "{response} is not one of {} options",
                options.len()
            ))),
        }
    }

    /// 放弃请求（回复通道失败）：关闭但不记录回复
    pub fn abandon(&self, request: &mut HumanInputRequest) {
        request.resolved = true;
        self.release(request);
    }

    pub fn open_request(&self, goal_id: &str, task_id: &str) -> Option<String> {
        self.outstanding()
            .get(&(goal_id.to_string(), task_id.to_string()))
            .cloned()
    }

    fn release(&self, request: &HumanInputRequest) {
        if let Some(task_id) = &request.task_id {
            let key = (request.goal_id.clone(), task_id.clone());
            let mut outstanding = self.outstanding();
            if outstanding.get(&key) == Some(&request.id) {
                outstanding.remove(&key);
            }
        }
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, HashMap<(GoalId, TaskId), String>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 从上下文读取固定选项
pub fn options_from(context: &Params) -> Option<Vec<String>> {
    let items = context.get(OPTIONS_KEY)?.as_array()?;
    let options: Vec<String> = items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    (!options.is_empty()).then_some(options)
}

fn question_text(goal: &Goal, task: Option<&Task>, reason: &str, options: Option<&[String]>) -> String {
    let mut question = match task {
        Some(task) => format!("Task: {}\n\n{}\n\n", task.description, reason),
        None => format!("Goal: {}\n\n{}\n\n", goal.description, reason),
    };
    match options {
        Some(options) => {
            question.push_str("Please choose one of the following options:\n");
            for (idx, option) in options.iter().enumerate() {
                question.push_str(&format!("{}. {}\n", idx + 1, option));
            }
        }
        None => question.push_str("Please provide your input:"),
    }
    question
}
