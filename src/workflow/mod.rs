//! 任务图模型：Task / Goal / ExecutionPlan 与依赖图

pub mod graph;
pub mod plan;
pub mod types;

pub use graph::DependencyGraph;
pub use plan::{ExecutionPlan, PlanDraft};
pub use types::{
    ExecutionResult, Goal, GoalId, Params, Task, TaskHandle, TaskId, TaskPriority, TaskStatus,
    DEFAULT_MAX_RETRIES,
};
