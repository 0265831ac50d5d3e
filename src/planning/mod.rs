//! 规划协作者接口
//!
//! 目标分解（Decomposer）与执行排序（Planner）由外部实现（通常是 LLM），引擎只依赖这两个 trait。
//! Planner 输出的依赖必须直接是任务 ID；引擎不做描述到 ID 的猜测匹配。

use async_trait::async_trait;

use crate::memory::LearnedPattern;
use crate::workflow::{Goal, Params, PlanDraft, Task, TaskHandle, TaskPriority, TaskId};

/// 把目标描述分解成带依赖的任务集合
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, description: &str, context: &Params) -> Result<Goal, String>;
}

/// 根据历史模式给出任务顺序与并行组
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &Goal, patterns: &[LearnedPattern]) -> Result<PlanDraft, String>;
}

/// 按优先级排序（Critical 在前，同级保持原顺序），不设并行组
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialPlanner;

impl SequentialPlanner {
    pub fn draft(goal: &Goal) -> PlanDraft {
        let mut tasks: Vec<(TaskPriority, TaskId)> = goal
            .tasks
            .iter()
            .map(|h| {
                let task = h.read();
                (task.priority, task.id.clone())
            })
            .collect();
        tasks.sort_by(|a, b| b.0.cmp(&a.0));
        PlanDraft {
            reasoning: Some("Sequential plan ordered by priority".to_string()),
            ..PlanDraft::sequential(tasks.into_iter().map(|(_, id)| id))
        }
    }
}

#[async_trait]
impl Planner for SequentialPlanner {
    async fn plan(&self, goal: &Goal, _patterns: &[LearnedPattern]) -> Result<PlanDraft, String> {
        Ok(Self::draft(goal))
    }
}

/// 分解失败时的兜底：整个目标作为单个任务
pub fn fallback_goal(description: &str) -> Goal {
    let mut goal = Goal::new(description);
    goal.tasks = vec![TaskHandle::new(Task::new(
        uuid::Uuid::new_v4().to_string(),
        description,
    ))];
    goal
}
