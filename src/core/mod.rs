//! 核心编排层：错误、人工升级、计划调度、会话与进度、目标编排

pub mod builder;
pub mod error;
pub mod escalation;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod session;

pub use builder::OrchestratorBuilder;
pub use error::{EngineError, EngineResult};
pub use escalation::{
    ApproachAdvisor, EscalationManager, EscalationReason, HumanChannel, HumanInputRequest, Resolution,
};
pub use orchestrator::Orchestrator;
pub use progress::{GoalProgress, TaskStatusRow};
pub use scheduler::{Dispatch, PlanRun, Scheduler};
pub use session::{GoalSession, ReasoningStep, ReasoningTrace};
