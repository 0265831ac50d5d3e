//! 任务图数据模型
//!
//! Task / Goal / ExecutionResult 以及共享任务句柄 TaskHandle。
//! Goal 与 ExecutionPlan 持有同一批 TaskHandle，调度器原地修改状态，两边都能看到。

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::core::{EngineError, EngineResult};

pub type GoalId = String;
pub type TaskId = String;

/// 工具参数 / 上下文 / 元数据统一使用 JSON 对象
pub type Params = serde_json::Map<String, Value>;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 任务状态（Goal 复用同一枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    WaitingForHuman,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::WaitingForHuman => "waiting_for_human",
        }
    }

    /// 状态机：Pending → InProgress → {Completed, Failed}；升级路径 Pending ↔ WaitingForHuman；
    /// 人工拒绝时 Pending / WaitingForHuman 可直接 → Failed
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::{Completed, Failed, InProgress, Pending, WaitingForHuman};
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, WaitingForHuman)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (WaitingForHuman, Pending)
                | (WaitingForHuman, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务优先级；Ord 顺序为 Low < Medium < High < Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        };
        f.write_str(s)
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// 单个原子任务：工具绑定、依赖、状态与重试计数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    /// 依赖的任务 ID（必须存在于同一 Goal 中）
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// 工具名，可写成 `tool.operation`
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub tool_params: Params,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            tool: None,
            tool_params: Params::new(),
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tool_params.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 无依赖时恒为 true；否则所有依赖都必须已在 executed 集合中
    pub fn can_execute(&self, executed: &HashSet<TaskId>) -> bool {
        self.dependencies.iter().all(|dep| executed.contains(dep))
    }

    /// 按状态机迁移，并维护开始 / 完成时间
    pub fn transition(&mut self, to: TaskStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            TaskStatus::InProgress => {
                self.started_at = Some(Utc::now());
                self.error = None;
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }
}

/// 共享任务句柄：Goal 与 ExecutionPlan 持有同一实例
///
/// 序列化时写出任务快照；反序列化得到新实例，需要时由 `GoalSession::relink` 重新对齐。
#[derive(Debug, Clone)]
pub struct TaskHandle(Arc<RwLock<Task>>);

impl TaskHandle {
    pub fn new(task: Task) -> Self {
        Self(Arc::new(RwLock::new(task)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Task> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Task> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Task {
        self.read().clone()
    }

    pub fn id(&self) -> TaskId {
        self.read().id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.read().status
    }

    /// 是否与另一个句柄指向同一个任务实例
    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Task> for TaskHandle {
    fn from(task: Task) -> Self {
        Self::new(task)
    }
}

impl Serialize for TaskHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Task::deserialize(deserializer).map(TaskHandle::new)
    }
}

/// 高层目标：由分解协作者产出任务集合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub tasks: Vec<TaskHandle>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// 结果摘要
    #[serde(default)]
    pub result: Option<Value>,
}

impl Goal {
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), description)
    }

    pub fn with_id(id: impl Into<GoalId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            tasks: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// 装入任务并校验依赖是否都指向本 Goal 内的任务
    pub fn with_tasks(mut self, tasks: Vec<Task>) -> EngineResult<Self> {
        self.tasks = tasks.into_iter().map(TaskHandle::new).collect();
        self.validate()?;
        Ok(self)
    }

    /// 任务 ID 唯一、依赖可达（循环检测在计划构建时进行）
    pub fn validate(&self) -> EngineResult<()> {
        let mut ids = HashSet::new();
        for handle in &self.tasks {
            let id = handle.id();
            if !ids.insert(id.clone()) {
                return Err(EngineError::DuplicateTask(id));
            }
        }
        for handle in &self.tasks {
            let task = handle.read();
            if let Some(missing) = task.dependencies.iter().find(|d| !ids.contains(*d)) {
                return Err(EngineError::UnreachableTask {
                    task_id: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<TaskHandle> {
        self.tasks.iter().find(|h| h.read().id == id).cloned()
    }

    /// 汇总状态：全部完成 → Completed；全部失败 → Failed；否则仍为 InProgress
    pub fn aggregate_status(&self) -> TaskStatus {
        let statuses: Vec<TaskStatus> = self.tasks.iter().map(TaskHandle::status).collect();
        if statuses.iter().all(|s| *s == TaskStatus::Completed) {
            TaskStatus::Completed
        } else if statuses.iter().all(|s| *s == TaskStatus::Failed) {
            TaskStatus::Failed
        } else {
            TaskStatus::InProgress
        }
    }

    pub fn mark_started(&mut self) {
        self.status = TaskStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// 根据任务结果落定 Goal 状态与结果摘要
    pub fn settle(&mut self, result_count: usize) {
        self.status = self.aggregate_status();
        self.result = match self.status {
            TaskStatus::Completed => Some(serde_json::json!({
                "success": true,
                "tasks_completed": result_count,
            })),
            TaskStatus::Failed => Some(serde_json::json!({
                "success": false,
                "tasks_failed": result_count,
            })),
            _ => None,
        };
        self.completed_at = Some(Utc::now());
    }
}

/// 单次任务执行的最终结果（重试只产生一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// 耗时（秒）
    pub execution_time: f64,
    #[serde(default)]
    pub metadata: Params,
}

impl ExecutionResult {
    pub fn success(task_id: impl Into<TaskId>, output: impl Into<String>, execution_time: f64, metadata: Params) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            output: Some(output.into()),
            error: None,
            execution_time: execution_time.max(0.0),
            metadata,
        }
    }

    pub fn failure(task_id: impl Into<TaskId>, error: impl Into<String>, execution_time: f64, metadata: Params) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time: execution_time.max(0.0),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_execute_without_dependencies() {
        let task = Task::new("a", "create file notes.txt");
        assert!(task.can_execute(&HashSet::new()));
    }

    #[test]
    fn test_can_execute_waits_for_all_dependencies() {
        let task = Task::new("c", "commit").depends_on(["a", "b"]);
        let mut executed = HashSet::new();
        executed.insert("a".to_string());
        assert!(!task.can_execute(&executed));
        executed.insert("b".to_string());
        assert!(task.can_execute(&executed));
    }

    #[test]
    fn test_transition_rules() {
        let mut task = Task::new("a", "run tests");
        assert!(task.transition(TaskStatus::Completed).is_err());
        task.transition(TaskStatus::InProgress).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        assert!(matches!(
            task.transition(TaskStatus::Pending),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_goal_rejects_unknown_dependency() {
        let err = Goal::new("ship it")
            .with_tasks(vec![Task::new("b", "commit").depends_on(["missing"])])
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::UnreachableTask {
                task_id: "b".into(),
                dependency: "missing".into()
            }
        );
    }

    #[test]
    fn test_goal_rejects_duplicate_ids() {
        let err = Goal::new("dup")
            .with_tasks(vec![Task::new("a", "one"), Task::new("a", "two")])
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateTask("a".into()));
    }

    #[test]
    fn test_aggregate_status_mixed_stays_in_progress() {
        let goal = Goal::new("mixed")
            .with_tasks(vec![Task::new("a", "one"), Task::new("b", "two")])
            .unwrap();
        goal.tasks[0].write().status = TaskStatus::Completed;
        goal.tasks[1].write().status = TaskStatus::Failed;
        assert_eq!(goal.aggregate_status(), TaskStatus::InProgress);

        goal.tasks[0].write().status = TaskStatus::Failed;
        assert_eq!(goal.aggregate_status(), TaskStatus::Failed);
    }

    #[test]
    fn test_task_handle_serializes_snapshot() {
        let handle = TaskHandle::new(Task::new("a", "create file").with_tool("file_operations"));
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["max_retries"], 3);
        let back: TaskHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back.snapshot(), handle.snapshot());
        assert!(!back.ptr_eq(&handle));
    }
}
