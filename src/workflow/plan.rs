//! 执行计划
//!
//! 规划协作者给出 PlanDraft（任务顺序 + 并行组），`ExecutionPlan::build` 校验后绑定 Goal 的任务句柄。
//! 计划不复制任务：plan.tasks 与 goal.tasks 指向同一批实例。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{EngineError, EngineResult};
use crate::workflow::graph::DependencyGraph;
use crate::workflow::types::{Goal, GoalId, TaskHandle, TaskId};

/// 规划协作者的输出：只引用任务 ID，依赖关系已在任务上
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub task_order: Vec<TaskId>,
    #[serde(default)]
    pub parallel_groups: Vec<Vec<TaskId>>,
    #[serde(default)]
    pub estimated_duration_minutes: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl PlanDraft {
    pub fn sequential<I, S>(task_order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        Self {
            task_order: task_order.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_group<I, S>(mut self, group: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.parallel_groups
            .push(group.into_iter().map(Into::into).collect());
        self
    }
}

/// 一个 Goal 的执行计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub goal_id: GoalId,
    /// 按计划顺序排列的任务（与 Goal 共享实例）
    pub tasks: Vec<TaskHandle>,
    /// 并行组：组内任务互不依赖
    #[serde(default)]
    pub parallel_groups: Vec<Vec<TaskId>>,
    /// 预计耗时（分钟）
    #[serde(default)]
    pub estimated_duration: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// 校验并构建计划
    ///
    /// - Goal 任务 ID 重复、依赖未知、依赖成环 → 报错
    /// - 顺序 / 并行组引用了不存在的任务 → UnknownTask
    /// - 同一任务出现在两个并行组 → TaskInMultipleGroups；组内互相依赖 → GroupDependency
    /// - 顺序中遗漏的任务按 Goal 原顺序追加到末尾
    pub fn build(goal: &Goal, draft: PlanDraft) -> EngineResult<Self> {
        goal.validate()?;
        DependencyGraph::new(&goal.tasks)
            .topological_order()
            .map_err(EngineError::CyclicDependency)?;

        let by_id: HashMap<TaskId, TaskHandle> = goal
            .tasks
            .iter()
            .map(|h| (h.id(), h.clone()))
            .collect();

        let mut tasks = Vec::with_capacity(goal.tasks.len());
        let mut seen = HashSet::new();
        for id in &draft.task_order {
            let handle = by_id
                .get(id)
                .ok_or_else(|| EngineError::UnknownTask(id.clone()))?;
            if seen.insert(id.clone()) {
                tasks.push(handle.clone());
            }
        }
        for handle in &goal.tasks {
            if seen.insert(handle.id()) {
                tasks.push(handle.clone());
            }
        }

        let mut grouped = HashSet::new();
        let mut parallel_groups = Vec::with_capacity(draft.parallel_groups.len());
        for group in draft.parallel_groups {
            let mut members: Vec<TaskId> = Vec::with_capacity(group.len());
            for id in group {
                if !by_id.contains_key(&id) {
                    return Err(EngineError::UnknownTask(id));
                }
                if members.contains(&id) {
                    continue;
                }
                if !grouped.insert(id.clone()) {
                    return Err(EngineError::TaskInMultipleGroups(id));
                }
                members.push(id);
            }
            for id in &members {
                let task = by_id[id].read();
                if let Some(dep) = task.dependencies.iter().find(|d| members.contains(*d)) {
                    return Err(EngineError::GroupDependency {
                        task_id: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if !members.is_empty() {
                parallel_groups.push(members);
            }
        }

        Ok(Self {
            goal_id: goal.id.clone(),
            tasks,
            parallel_groups,
            estimated_duration: draft.estimated_duration_minutes,
            created_at: Utc::now(),
        })
    }

    pub fn task(&self, id: &str) -> Option<&TaskHandle> {
        self.tasks.iter().find(|h| h.read().id == id)
    }

    pub fn task_order(&self) -> Vec<TaskId> {
        self.tasks.iter().map(TaskHandle::id).collect()
    }
}
