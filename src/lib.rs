//! Autotask - 目标驱动的任务自动化引擎
//!
//! 模块划分：
//! - **adaptation**: 执行结果分析，产出模式与建议
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、人工升级、调度器、会话与目标编排器
//! - **memory**: 学习到的模式与目标会话的持久化
//! - **observability**: tracing 初始化
//! - **planning**: 目标分解 / 执行排序的协作者接口与默认实现
//! - **tools**: 工具注册表、网关与内置工具（文件、git、命令、HTTP）
//! - **workflow**: 任务图模型（Task / Goal / ExecutionPlan）

pub mod adaptation;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod planning;
pub mod tools;
pub mod workflow;

pub use crate::core::{EngineError, EngineResult, GoalSession, Orchestrator, OrchestratorBuilder};
pub use crate::workflow::{ExecutionPlan, ExecutionResult, Goal, PlanDraft, Task, TaskStatus};
