//! GoalSession：一次目标执行的完整持久化记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adaptation::AdaptationUpdate;
use crate::core::escalation::HumanInputRequest;
use crate::workflow::{ExecutionPlan, ExecutionResult, Goal, GoalId};

/// 推理链中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step_number: u32,
    pub thought: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

/// 推理协作者产出的推理记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub problem: String,
    #[serde(default)]
    pub steps: Vec<ReasoningStep>,
    pub final_solution: String,
    /// 0.0 ~ 1.0
    pub confidence: f64,
    #[serde(default)]
    pub alternatives_considered: Vec<String>,
}

impl ReasoningTrace {
    pub fn new(problem: impl Into<String>, final_solution: impl Into<String>, confidence: f64) -> Self {
        Self {
            problem: problem.into(),
            steps: Vec::new(),
            final_solution: final_solution.into(),
            confidence: confidence.clamp(0.0, 1.0),
            alternatives_considered: Vec::new(),
        }
    }

    pub fn with_step(mut self, thought: impl Into<String>, conclusion: Option<String>) -> Self {
        self.steps.push(ReasoningStep {
            step_number: self.steps.len() as u32 + 1,
            thought: thought.into(),
            conclusion,
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSession {
    /// 与 goal.id 相同
    pub id: GoalId,
    pub goal: Goal,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub results: Vec<ExecutionResult>,
    #[serde(default)]
    pub adaptations: Vec<AdaptationUpdate>,
    #[serde(default)]
    pub human_inputs: Vec<HumanInputRequest>,
    #[serde(default)]
    pub reasoning_results: Vec<ReasoningTrace>,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GoalSession {
    pub fn new(goal: Goal) -> Self {
        Self {
            id: goal.id.clone(),
            goal,
            execution_plan: None,
            results: Vec::new(),
            adaptations: Vec::new(),
            human_inputs: Vec::new(),
            reasoning_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// 反序列化后 plan 与 goal 各自持有独立的任务实例；按 ID 把 plan 的句柄重新指向 goal 的句柄
    pub fn relink(&mut self) {
        let Some(plan) = self.execution_plan.as_mut() else {
            return;
        };
        for slot in plan.tasks.iter_mut() {
            if let Some(shared) = self.goal.task(&slot.id()) {
                *slot = shared;
            }
        }
    }

    pub fn record_reasoning(&mut self, trace: ReasoningTrace) {
        self.reasoning_results.push(trace);
    }

    /// 按 ID 插入或更新请求记录
    pub fn upsert_request(&mut self, request: HumanInputRequest) {
        match self.human_inputs.iter_mut().find(|r| r.id == request.id) {
            Some(existing) => *existing = request,
            None => self.human_inputs.push(request),
        }
    }

    pub fn request(&self, request_id: &str) -> Option<&HumanInputRequest> {
        self.human_inputs.iter().find(|r| r.id == request_id)
    }
}
