//! 目标编排器：分解 → 规划 → 调度 → 适应分析 → 持久化
//!
//! 每个目标对应一个 GoalSession。没有同步人工通道时，升级的任务停在 WaitingForHuman，
//! 请求 ID 记入 pending 表；`provide_human_input` 用它找回 (goal, task) 并从单任务路径继续执行，
//! 之后接着跑计划中被它阻塞的任务，重新汇总状态并再次持久化。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::Value;

use crate::adaptation::AdaptationAnalyzer;
use crate::core::escalation::{options_from, EscalationReason, HumanInputRequest, OPTIONS_KEY};
use crate::core::progress::GoalProgress;
use crate::core::scheduler::Scheduler;
use crate::core::session::{GoalSession, ReasoningTrace};
use crate::core::{EngineError, EngineResult};
use crate::memory::PatternMemory;
use crate::planning::{fallback_goal, Decomposer, Planner, SequentialPlanner};
use crate::workflow::{ExecutionPlan, ExecutionResult, Goal, GoalId, Params, PlanDraft, TaskId, TaskStatus};

type SharedSession = Arc<tokio::sync::Mutex<GoalSession>>;

/// 等待人工回复的升级
#[derive(Debug, Clone)]
struct PendingEscalation {
    goal_id: GoalId,
    task_id: TaskId,
    context: Params,
}

pub struct Orchestrator {
    scheduler: Scheduler,
    memory: Arc<PatternMemory>,
    analyzer: AdaptationAnalyzer,
    decomposer: Option<Arc<dyn Decomposer>>,
    planner: Arc<dyn Planner>,
    sessions: tokio::sync::RwLock<HashMap<GoalId, SharedSession>>,
    pending: Mutex<HashMap<String, PendingEscalation>>,
}

impl Orchestrator {
    pub fn new(scheduler: Scheduler, memory: Arc<PatternMemory>, analyzer: AdaptationAnalyzer) -> Self {
        Self {
            scheduler,
            memory,
            analyzer,
            decomposer: None,
            planner: Arc::new(SequentialPlanner),
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn memory(&self) -> &Arc<PatternMemory> {
        &self.memory
    }

    /// 从目标描述开始：分解失败退化为单任务目标，规划失败退化为按优先级的顺序计划
    pub async fn execute_goal(&self, description: &str, context: Params) -> EngineResult<GoalSession> {
        let goal = match &self.decomposer {
            Some(decomposer) => match decomposer.decompose(description, &context).await {
                Ok(goal) => goal,
                Err(message) => {
                    let err = EngineError::Collaborator {
                        collaborator: "decomposer",
                        message,
                    };
                    tracing::warn!(error = %err, "falling back to single-task goal");
                    fallback_goal(description)
                }
            },
            None => fallback_goal(description),
        };

        let patterns = self.memory.get(None, None);
        for pattern in patterns
            .iter()
            .filter(|p| p.context.get("goal_type").and_then(Value::as_str) == Some(goal.description.as_str()))
        {
            self.memory.touch(&pattern.id);
        }

        let draft = match self.planner.plan(&goal, &patterns).await {
            Ok(draft) => draft,
            Err(message) => {
                let err = EngineError::Collaborator {
                    collaborator: "planner",
                    message,
                };
                tracing::warn!(error = %err, "falling back to sequential plan");
                SequentialPlanner::draft(&goal)
            }
        };
        self.execute(goal, draft, context).await
    }

    /// 执行已分解、已规划的目标；计划校验失败是唯一的硬错误
    pub async fn execute(&self, mut goal: Goal, draft: PlanDraft, context: Params) -> EngineResult<GoalSession> {
        let plan = ExecutionPlan::build(&goal, draft)?;
        goal.mark_started();
        tracing::info!(goal_id = %goal.id, tasks = goal.tasks.len(), "goal started");

        let mut session = GoalSession::new(goal);
        let run = self.scheduler.run_plan(&session.goal, &plan, &context).await;
        session.execution_plan = Some(plan);
        self.track_requests(&session.goal.id, &context, &run.human_inputs);
        session.human_inputs.extend(run.human_inputs);
        session.results.extend(run.results.iter().cloned());

        self.finish(&mut session, &run.results).await;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(tokio::sync::Mutex::new(session.clone())));
        Ok(session)
    }

    /// 提交人工回复并继续执行对应任务
    ///
    /// 选项无效时请求被关闭、任务仍为 WaitingForHuman，返回 InvalidSelection；
    /// 调用方可通过 `reescalate` 重新发起请求。
    pub async fn provide_human_input(&self, request_id: &str, response: Value) -> EngineResult<ExecutionResult> {
        let pending = self
            .pending_requests()
            .get(request_id)
            .cloned()
            .ok_or_else(|| EngineError::RequestNotFound(request_id.to_string()))?;
        let shared = self.session_entry(&pending.goal_id).await?;
        let mut session = shared.lock().await;
        // 会话到手后才消费请求；并发的同一请求只有一个能取到
        if self.pending_requests().remove(request_id).is_none() {
            return Err(EngineError::RequestNotFound(request_id.to_string()));
        }

        let mut request = session
            .request(request_id)
            .cloned()
            .ok_or_else(|| EngineError::RequestNotFound(request_id.to_string()))?;
        let resolution = self.scheduler.escalation().resolve_response(&mut request, response);
        session.upsert_request(request);
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "human input rejected");
                self.memory.save_session(&session);
                return Err(e);
            }
        };

        let handle = session
            .goal
            .task(&pending.task_id)
            .ok_or_else(|| EngineError::UnknownTask(pending.task_id.clone()))?;
        let result = self.scheduler.resume_task(&handle, &resolution).await?;

        let mut new_results = vec![result.clone()];
        let mut new_requests = Vec::new();
        if let Some(plan) = &session.execution_plan {
            let run = self.scheduler.run_plan(&session.goal, plan, &pending.context).await;
            new_results.extend(run.results);
            new_requests = run.human_inputs;
        }
        self.track_requests(&pending.goal_id, &pending.context, &new_requests);
        session.human_inputs.extend(new_requests);
        session.results.extend(new_results.iter().cloned());

        self.finish(&mut session, &new_results).await;
        Ok(result)
    }

    /// 为停在 WaitingForHuman 的任务重新发起请求（沿用上一次请求的上下文与选项）
    pub async fn reescalate(&self, goal_id: &str, task_id: &str) -> EngineResult<HumanInputRequest> {
        let shared = self.session_entry(goal_id).await?;
        let mut session = shared.lock().await;
        let handle = session
            .goal
            .task(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        let task = handle.snapshot();
        if task.status != TaskStatus::WaitingForHuman {
            return Err(EngineError::InvalidTransition {
                task_id: task.id,
                from: task.status,
                to: TaskStatus::WaitingForHuman,
            });
        }

        let previous = session
            .human_inputs
            .iter()
            .rev()
            .find(|r| r.task_id.as_deref() == Some(task_id));
        let mut context = previous.map(|r| r.context.clone()).unwrap_or_default();
        let options = previous.and_then(|r| r.options.clone());
        if let Some(options) = &options {
            context.insert(OPTIONS_KEY.into(), Value::from(options.clone()));
        }

        let escalation = self.scheduler.escalation();
        let reason = escalation
            .assess(&task, &context)
            .await
            .unwrap_or(EscalationReason::Requested);
        let request = escalation.create_request(
            &session.goal,
            Some(&task),
            reason.message(),
            options.or_else(|| options_from(&context)),
            context.clone(),
        )?;

        self.track_requests(goal_id, &context, std::slice::from_ref(&request));
        session.upsert_request(request.clone());
        self.memory.save_session(&session);
        Ok(request)
    }

    /// 当前进程内的会话快照，不在内存中时从存储加载
    pub async fn session(&self, goal_id: &str) -> Option<GoalSession> {
        let shared = self.session_entry(goal_id).await.ok()?;
        let session = shared.lock().await;
        Some(session.clone())
    }

    pub async fn progress(&self, goal_id: &str) -> EngineResult<GoalProgress> {
        let shared = self.session_entry(goal_id).await?;
        let session = shared.lock().await;
        Ok(GoalProgress::of(&session))
    }

    /// 把推理记录附加到会话并持久化
    pub async fn record_reasoning(&self, goal_id: &str, trace: ReasoningTrace) -> EngineResult<()> {
        let shared = self.session_entry(goal_id).await?;
        let mut session = shared.lock().await;
        session.record_reasoning(trace);
        self.memory.save_session(&session);
        Ok(())
    }

    /// 尚未回复的请求 ID
    pub fn pending_request_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending_requests().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn finish(&self, session: &mut GoalSession, new_results: &[ExecutionResult]) {
        let prior = self.memory.get(None, None);
        let update = self.analyzer.analyze(&session.goal, new_results, &prior).await;
        self.memory.save_all(update.patterns_learned.clone());
        session.adaptations.push(update);

        session.goal.settle(session.results.len());
        session.completed_at = Some(Utc::now());
        self.memory.save_session(session);
        tracing::info!(
            goal_id = %session.goal.id,
            status = %session.goal.status,
            results = session.results.len(),
            "goal settled"
        );
    }

    fn track_requests(&self, goal_id: &str, context: &Params, requests: &[HumanInputRequest]) {
        let mut pending = self.pending_requests();
        for request in requests.iter().filter(|r| !r.resolved) {
            let Some(task_id) = &request.task_id else {
                continue;
            };
            pending.insert(
                request.id.clone(),
                PendingEscalation {
                    goal_id: goal_id.to_string(),
                    task_id: task_id.clone(),
                    context: context.clone(),
                },
            );
        }
    }

    async fn session_entry(&self, goal_id: &str) -> EngineResult<SharedSession> {
        if let Some(shared) = self.sessions.read().await.get(goal_id) {
            return Ok(shared.clone());
        }
        let session = self
            .memory
            .load_session(goal_id)
            .ok_or_else(|| EngineError::SessionNotFound(goal_id.to_string()))?;
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(goal_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(session)))
            .clone())
    }

    fn pending_requests(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEscalation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
