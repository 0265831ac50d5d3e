//! 进度快照：按状态计数、完成百分比、耗时与剩余时间估计

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::session::GoalSession;
use crate::workflow::{GoalId, TaskHandle, TaskId, TaskPriority, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalProgress {
    pub goal_id: GoalId,
    pub goal_status: TaskStatus,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub waiting_for_human: usize,
    /// 0 ~ 100
    pub completion_percentage: f64,
    pub elapsed_seconds: Option<f64>,
    pub estimated_remaining_seconds: Option<f64>,
    /// 已结束任务中成功的比例（0 ~ 1）
    pub success_rate: f64,
    pub tasks: Vec<TaskStatusRow>,
}

/// 单个任务的状态行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRow {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TaskHandle> for TaskStatusRow {
    fn from(handle: &TaskHandle) -> Self {
        let task = handle.read();
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            retry_count: task.retry_count,
            started_at: task.started_at,
            completed_at: task.completed_at,
            error: task.error.clone(),
        }
    }
}

impl GoalProgress {
    /// 优先按计划顺序列出任务；没有计划时按 Goal 顺序
    pub fn of(session: &GoalSession) -> Self {
        let tasks = session
            .execution_plan
            .as_ref()
            .map(|p| p.tasks.as_slice())
            .unwrap_or(session.goal.tasks.as_slice());
        let rows: Vec<TaskStatusRow> = tasks.iter().map(TaskStatusRow::from).collect();

        let count = |status: TaskStatus| rows.iter().filter(|r| r.status == status).count();
        let total_tasks = rows.len();
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);

        let completion_percentage = if total_tasks == 0 {
            0.0
        } else {
            completed as f64 / total_tasks as f64 * 100.0
        };
        let success_rate = if completed + failed == 0 {
            0.0
        } else {
            completed as f64 / (completed + failed) as f64
        };

        let end = session.goal.completed_at.unwrap_or_else(Utc::now);
        let elapsed_seconds = session
            .goal
            .started_at
            .map(|start| (end - start).num_milliseconds().max(0) as f64 / 1000.0);
        let estimated_remaining_seconds = session
            .execution_plan
            .as_ref()
            .and_then(|p| p.estimated_duration)
            .zip(elapsed_seconds)
            .map(|(minutes, elapsed)| (minutes * 60.0 - elapsed).max(0.0));

        Self {
            goal_id: session.goal.id.clone(),
            goal_status: session.goal.status,
            total_tasks,
            completed,
            failed,
            in_progress: count(TaskStatus::InProgress),
            pending: count(TaskStatus::Pending),
            waiting_for_human: count(TaskStatus::WaitingForHuman),
            completion_percentage,
            elapsed_seconds,
            estimated_remaining_seconds,
            success_rate,
            tasks: rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ExecutionPlan, Goal, PlanDraft, Task};

    #[test]
    fn test_progress_counts_and_estimate() {
        let mut goal = Goal::with_id("g", "ship")
            .with_tasks(vec![
                Task::new("a", "one"),
                Task::new("b", "two"),
                Task::new("c", "three"),
                Task::new("d", "four"),
            ])
            .unwrap();
        goal.mark_started();
        goal.tasks[0].write().status = TaskStatus::Completed;
        goal.tasks[1].write().status = TaskStatus::Failed;
        goal.tasks[2].write().status = TaskStatus::WaitingForHuman;

        let mut draft = PlanDraft::default();
        draft.estimated_duration_minutes = Some(10.0);
        let plan = ExecutionPlan::build(&goal, draft).unwrap();
        let mut session = GoalSession::new(goal);
        session.execution_plan = Some(plan);

        let progress = GoalProgress::of(&session);
        assert_eq!(progress.total_tasks, 4);
        assert_eq!(progress.completion_percentage, 25.0);
        assert_eq!(progress.success_rate, 0.5);
        assert_eq!(progress.waiting_for_human, 1);
        assert_eq!(progress.pending, 1);
        let remaining = progress.estimated_remaining_seconds.unwrap();
        assert!(remaining > 590.0 && remaining <= 600.0);
        assert_eq!(progress.tasks[1].status, TaskStatus::Failed);
    }

    #[test]
    fn test_empty_goal_progress() {
        let session = GoalSession::new(Goal::new("nothing"));
        let progress = GoalProgress::of(&session);
        assert_eq!(progress.completion_percentage, 0.0);
        assert!(progress.elapsed_seconds.is_none());
        assert!(progress.estimated_remaining_seconds.is_none());
    }
}
