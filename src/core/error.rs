//! 引擎错误类型
//!
//! 任务级失败不会穿透调度器：调度器把它们统一转成失败的 ExecutionResult，
//! 错误文本即为这里的 Display。只有计划构建阶段的编程错误（引用不存在的任务、循环依赖等）会作为硬错误返回。

use thiserror::Error;

use crate::workflow::{TaskId, TaskStatus};

/// 引擎运行过程中可能出现的错误（工具路由、人工升级、重试、存储、计划校验）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Operation '{operation}' not found on tool '{tool}'")]
    OperationNotFound { tool: String, operation: String },

    /// 工具执行时自身报错（相当于抛出异常）
    #[error("Error executing {tool}.{operation}: {message}")]
    InvocationError {
        tool: String,
        operation: String,
        message: String,
    },

    /// 升级未被解决或被拒绝
    #[error("Human input required: {0}")]
    HumanInputRequired(String),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Task '{task_id}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        task_id: TaskId,
        attempts: u32,
        last_error: String,
    },

    /// 模式 / 会话持久化失败：只记日志，不向上传播
    #[error("Storage degraded: {0}")]
    StorageDegraded(String),

    #[error("Cyclic dependency detected among tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<TaskId>),

    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnreachableTask { task_id: TaskId, dependency: TaskId },

    #[error("Plan references unknown task '{0}'")]
    UnknownTask(TaskId),

    #[error("Duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    #[error("Task '{0}' appears in more than one parallel group")]
    TaskInMultipleGroups(TaskId),

    #[error("Parallel group members '{task_id}' and '{dependency}' depend on each other")]
    GroupDependency { task_id: TaskId, dependency: TaskId },

    #[error("Invalid status transition for task '{task_id}': {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task '{task_id}' already has an open human input request '{request_id}'")]
    EscalationPending { task_id: TaskId, request_id: String },

    #[error("Human input request not found: {0}")]
    RequestNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 外部协作者（分解 / 规划 / 模式增强）失败
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_dependency_lists_tasks() {
        let err = EngineError::CyclicDependency(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Cyclic dependency detected among tasks: a, b");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = EngineError::InvalidTransition {
            task_id: "t1".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::InProgress,
        };
        assert!(err.to_string().contains("completed -> in_progress"));
    }
}
