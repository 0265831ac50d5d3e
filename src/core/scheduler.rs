//! 计划调度器
//!
//! 先按计划顺序处理并行组（组内任务经 Semaphore 限流后并发执行），再对完整任务序列反复扫描，
//! 直到某一轮没有任何任务被派发。每个任务派发前先过升级检查，再经网关调用工具并按 max_retries 重试。
//! 任务级失败一律转为失败的 ExecutionResult，不向调用方抛错。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::core::escalation::{options_from, EscalationManager, EscalationReason, HumanChannel, HumanInputRequest, Resolution};
use crate::core::{EngineError, EngineResult};
use crate::tools::{Invocation, ToolGateway, ToolOutcome};
use crate::workflow::{ExecutionPlan, ExecutionResult, Goal, Params, Task, TaskHandle, TaskId, TaskStatus};

/// 一次计划执行的产出
#[derive(Debug, Default)]
pub struct PlanRun {
    pub results: Vec<ExecutionResult>,
    /// 本次执行中产生的人工请求
    pub human_inputs: Vec<HumanInputRequest>,
}

/// 单个任务派发的产出
#[derive(Debug)]
pub struct Dispatch {
    pub result: ExecutionResult,
    pub request: Option<HumanInputRequest>,
}

pub struct Scheduler {
    gateway: Arc<ToolGateway>,
    escalation: Arc<EscalationManager>,
    human: Option<Arc<dyn HumanChannel>>,
    semaphore: Arc<Semaphore>,
    retry_backoff: Duration,
}

impl Scheduler {
    pub fn new(
        gateway: Arc<ToolGateway>,
        escalation: Arc<EscalationManager>,
        max_concurrent_tasks: usize,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            gateway,
            escalation,
            human: None,
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            retry_backoff,
        }
    }

    /// 接入同步人工回复通道；接入后升级在派发时内联解决，任务不会停在 WaitingForHuman
    pub fn with_human_channel(mut self, channel: Arc<dyn HumanChannel>) -> Self {
        self.human = Some(channel);
        self
    }

    pub fn has_human_channel(&self) -> bool {
        self.human.is_some()
    }

    pub fn escalation(&self) -> &Arc<EscalationManager> {
        &self.escalation
    }

    /// 执行计划中所有仍为 Pending 且依赖已完成的任务
    pub async fn run_plan(&self, goal: &Goal, plan: &ExecutionPlan, context: &Params) -> PlanRun {
        let mut run = PlanRun::default();
        let mut executed: HashSet<TaskId> = plan
            .tasks
            .iter()
            .filter(|h| h.status() == TaskStatus::Completed)
            .map(TaskHandle::id)
            .collect();
        // 每个任务在一次计划执行中最多派发一次
        let mut dispatched: HashSet<TaskId> = HashSet::new();

        for group in &plan.parallel_groups {
            let ready: Vec<TaskHandle> = group
                .iter()
                .filter_map(|id| plan.task(id))
                .filter(|h| is_ready(h, &executed, &dispatched))
                .cloned()
                .collect();
            if ready.is_empty() {
                continue;
            }
            tracing::info!(goal_id = %goal.id, tasks = ready.len(), "dispatching parallel group");

            let dispatches = join_all(ready.iter().map(|handle| async move {
                let _permit = self.semaphore.acquire().await.ok();
                self.execute_task(goal, handle, context).await
            }))
            .await;
            for (handle, dispatch) in ready.iter().zip(dispatches) {
                dispatched.insert(handle.id());
                record(&mut run, &mut executed, handle, dispatch);
            }
        }

        loop {
            let mut progressed = false;
            for handle in &plan.tasks {
                if !is_ready(handle, &executed, &dispatched) {
                    continue;
                }
                dispatched.insert(handle.id());
                let dispatch = self.execute_task(goal, handle, context).await;
                record(&mut run, &mut executed, handle, dispatch);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        let blocked: Vec<TaskId> = plan
            .tasks
            .iter()
            .filter(|h| h.status() == TaskStatus::Pending)
            .map(TaskHandle::id)
            .collect();
        if !blocked.is_empty() {
            tracing::warn!(goal_id = %goal.id, tasks = ?blocked, "tasks left pending: dependencies did not complete");
        }
        run
    }

    /// 单任务路径：升级检查 → 工具调用（含重试）
    pub async fn execute_task(&self, goal: &Goal, handle: &TaskHandle, context: &Params) -> Dispatch {
        let task = handle.snapshot();
        tracing::debug!(task_id = %task.id, "dispatching task");

        if let Some(reason) = self.escalation.assess(&task, context).await {
            return self.escalate(goal, handle, &task, reason, context).await;
        }
        Dispatch {
            result: self.invoke_with_retries(handle, Params::new()).await,
            request: None,
        }
    }

    /// 人工回复后恢复：WaitingForHuman → Pending，再走不含升级检查的单任务路径
    pub async fn resume_task(&self, handle: &TaskHandle, resolution: &Resolution) -> EngineResult<ExecutionResult> {
        handle.write().transition(TaskStatus::Pending)?;
        tracing::info!(task_id = %handle.id(), "task resumed after human input");
        Ok(self.invoke_with_retries(handle, resolution_metadata(resolution)).await)
    }

    async fn escalate(
        &self,
        goal: &Goal,
        handle: &TaskHandle,
        task: &Task,
        reason: EscalationReason,
        context: &Params,
    ) -> Dispatch {
        let options = options_from(context).or_else(|| options_from(&task.tool_params));
        let mut request = match self
            .escalation
            .create_request(goal, Some(task), reason.message(), options, context.clone())
        {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "escalation could not be opened");
                handle.write().error = Some(e.to_string());
                set_status(handle, TaskStatus::Failed);
                return Dispatch {
                    result: ExecutionResult::failure(&task.id, e.to_string(), 0.0, Params::new()),
                    request: None,
                };
            }
        };
        tracing::warn!(task_id = %task.id, request_id = %request.id, reason = ?reason, "task escalated to human");

        let Some(channel) = &self.human else {
            set_status(handle, TaskStatus::WaitingForHuman);
            let mut metadata = Params::new();
            metadata.insert("request_id".into(), Value::String(request.id.clone()));
            return Dispatch {
                result: ExecutionResult::failure(&task.id, "Waiting for human input", 0.0, metadata),
                request: Some(request),
            };
        };

        let decision = match channel.ask(&request).await {
            Ok(response) => self.escalation.resolve_response(&mut request, response),
            Err(e) => {
                self.escalation.abandon(&mut request);
                Err(EngineError::HumanInputRequired(e))
            }
        };

        match decision {
            Ok(resolution) => {
                let result = self
                    .invoke_with_retries(handle, resolution_metadata(&resolution))
                    .await;
                Dispatch {
                    result,
                    request: Some(request),
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "human input not provided");
                let error = match e {
                    EngineError::HumanInputRequired(_) => e,
                    other => EngineError::HumanInputRequired(other.to_string()),
                };
                handle.write().error = Some(error.to_string());
                set_status(handle, TaskStatus::Failed);
                let mut metadata = Params::new();
                metadata.insert("request_id".into(), Value::String(request.id.clone()));
                Dispatch {
                    result: ExecutionResult::failure(&task.id, "Human input required", 0.0, metadata),
                    request: Some(request),
                }
            }
        }
    }

    /// 调用工具，失败时在 max_retries 内固定退避重试；只产出一条最终结果
    async fn invoke_with_retries(&self, handle: &TaskHandle, mut metadata: Params) -> ExecutionResult {
        let start = Instant::now();
        let (task_id, description) = {
            let mut task = handle.write();
            if let Err(e) = task.transition(TaskStatus::InProgress) {
                return ExecutionResult::failure(&task.id, e.to_string(), 0.0, metadata);
            }
            (task.id.clone(), task.description.clone())
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let invocation = Invocation::for_task(&handle.read());
            let outcome = match &invocation {
                Some(invocation) => {
                    {
                        let mut task = handle.write();
                        if task.tool.is_none() {
                            task.tool = Some(invocation.tool.clone());
                        }
                    }
                    self.gateway.invoke(invocation, &description).await
                }
                None => ToolOutcome::failed(format!("Could not infer tool for task '{task_id}'")),
            };

            if outcome.success {
                {
                    let mut task = handle.write();
                    task.result = Some(Value::Object(outcome.payload.clone()));
                    task.error = None;
                }
                set_status(handle, TaskStatus::Completed);
                tracing::info!(task_id = %task_id, attempts, "task completed");
                metadata.extend(outcome.payload.clone());
                metadata.insert("attempts".into(), Value::from(attempts));
                return ExecutionResult::success(
                    &task_id,
                    outcome.message(),
                    start.elapsed().as_secs_f64(),
                    metadata,
                );
            }

            let error = outcome.error_text();
            let retry = {
                let mut task = handle.write();
                task.error = Some(error.clone());
                if task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    Some((task.retry_count, task.max_retries))
                } else {
                    None
                }
            };

            match retry {
                Some((retry, max_retries)) => {
                    tracing::warn!(task_id = %task_id, retry, max_retries, error = %error, "task failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                None => {
                    set_status(handle, TaskStatus::Failed);
                    let exhausted = EngineError::RetryExhausted {
                        task_id: task_id.clone(),
                        attempts,
                        last_error: error.clone(),
                    };
                    tracing::warn!(error = %exhausted, "task failed");
                    metadata.extend(outcome.payload);
                    metadata.insert("attempts".into(), Value::from(attempts));
                    metadata.insert("failure".into(), Value::String("retry_exhausted".into()));
                    return ExecutionResult::failure(&task_id, error, start.elapsed().as_secs_f64(), metadata);
                }
            }
        }
    }
}

fn is_ready(handle: &TaskHandle, executed: &HashSet<TaskId>, dispatched: &HashSet<TaskId>) -> bool {
    let task = handle.read();
    task.status == TaskStatus::Pending && !dispatched.contains(&task.id) && task.can_execute(executed)
}

fn record(run: &mut PlanRun, executed: &mut HashSet<TaskId>, handle: &TaskHandle, dispatch: Dispatch) {
    if handle.status() == TaskStatus::Completed {
        executed.insert(handle.id());
    }
    run.results.push(dispatch.result);
    run.human_inputs.extend(dispatch.request);
}

fn set_status(handle: &TaskHandle, to: TaskStatus) {
    if let Err(e) = handle.write().transition(to) {
        tracing::warn!(error = %e, "status transition rejected");
    }
}

fn resolution_metadata(resolution: &Resolution) -> Params {
    let mut metadata = Params::new();
    match resolution {
        Resolution::Selected { option, index } => {
            metadata.insert("human_selection".into(), Value::String(option.clone()));
            metadata.insert("human_selection_index".into(), Value::from(*index));
        }
        Resolution::Response(value) => {
            metadata.insert("human_response".into(), value.clone());
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Capability, ToolRegistry};
    use crate::workflow::PlanDraft;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用顺序；名字中含 "bad" 的文件总是失败
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Capability for Arc<Recorder> {
        fn name(&self) -> &str {
            "rec"
        }

        fn description(&self) -> &str {
            "records calls"
        }

        fn operations(&self) -> Vec<&'static str> {
            vec!["run"]
        }

        async fn execute(&self, _operation: &str, params: &Params) -> Result<Value, String> {
            let label = params.get("label").and_then(Value::as_str).unwrap_or("").to_string();
            self.calls.lock().unwrap().push(label.clone());
            Ok(serde_json::json!({"success": !label.contains("bad"), "error": "bad input"}))
        }
    }

    fn scheduler(recorder: &Arc<Recorder>) -> Scheduler {
        let mut registry = ToolRegistry::new();
        registry.register(recorder.clone());
        Scheduler::new(
            Arc::new(ToolGateway::new(registry, 5)),
            Arc::new(EscalationManager::new()),
            2,
            Duration::ZERO,
        )
    }

    fn task(id: &str) -> Task {
        Task::new(id, format!("step {id}"))
            .with_tool("rec.run")
            .with_param("label", id)
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order_despite_plan_order() {
        let recorder = Arc::new(Recorder::default());
        let goal = Goal::with_id("g", "chain")
            .with_tasks(vec![
                task("a"),
                task("b").depends_on(["a"]),
                task("c").depends_on(["b"]),
            ])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::sequential(["c", "b", "a"])).unwrap();

        let run = scheduler(&recorder).run_plan(&goal, &plan, &Params::new()).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(run.results.len(), 3);
        assert_eq!(goal.aggregate_status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_parallel_group_then_dependents() {
        let recorder = Arc::new(Recorder::default());
        let goal = Goal::with_id("g", "fan-in")
            .with_tasks(vec![task("a"), task("b"), task("c").depends_on(["a", "b"])])
            .unwrap();
        let draft = PlanDraft::sequential(["a", "b", "c"]).with_group(["a", "b"]);
        let plan = ExecutionPlan::build(&goal, draft).unwrap();

        let run = scheduler(&recorder).run_plan(&goal, &plan, &Params::new()).await;
        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], "c");
        assert!(run.results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_dependents_of_failed_task_stay_pending() {
        let recorder = Arc::new(Recorder::default());
        let goal = Goal::with_id("g", "broken")
            .with_tasks(vec![
                task("bad").with_max_retries(1),
                task("next").depends_on(["bad"]),
            ])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::default()).unwrap();

        let run = scheduler(&recorder).run_plan(&goal, &plan, &Params::new()).await;
        assert_eq!(run.results.len(), 1);
        let failed = &run.results[0];
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("bad input"));
        assert_eq!(failed.metadata["attempts"], 2);
        assert_eq!(failed.metadata["failure"], "retry_exhausted");
        assert_eq!(goal.task("next").unwrap().status(), TaskStatus::Pending);
        assert_eq!(goal.aggregate_status(), TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_uninferable_task_fails_after_retries() {
        let recorder = Arc::new(Recorder::default());
        let goal = Goal::with_id("g", "vague")
            .with_tasks(vec![Task::new("t", "ponder").with_max_retries(0)])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::default()).unwrap();

        let run = scheduler(&recorder).run_plan(&goal, &plan, &Params::new()).await;
        assert!(run.results[0].error.as_deref().unwrap().contains("Could not infer tool"));
        assert_eq!(goal.task("t").unwrap().status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_destructive_task_waits_without_channel() {
        let recorder = Arc::new(Recorder::default());
        let goal = Goal::with_id("g", "cleanup")
            .with_tasks(vec![Task::new("d", "remove old logs").with_tool("rec.run")])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::default()).unwrap();

        let sched = scheduler(&recorder);
        let run = sched.run_plan(&goal, &plan, &Params::new()).await;
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert_eq!(goal.task("d").unwrap().status(), TaskStatus::WaitingForHuman);
        assert_eq!(run.human_inputs.len(), 1);
        assert_eq!(run.results[0].execution_time, 0.0);
        assert_eq!(sched.escalation().open_request("g", "d"), Some(run.human_inputs[0].id.clone()));

        let result = sched
            .resume_task(&goal.tasks[0], &Resolution::Response(Value::Bool(true)))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["human_response"], true);
        assert_eq!(goal.task("d").unwrap().status(), TaskStatus::Completed);
    }
    #[tokio::test]
    async fn test_same_task_id_in_two_goals_does_not_block() {
        let recorder = Arc::new(Recorder::default());
        let sched = scheduler(&recorder);
        let first = Goal::with_id("g1", "logs")
            .with_tasks(vec![Task::new("task_1", "remove old logs").with_tool("rec.run")])
            .unwrap();
        let second = Goal::with_id("g2", "tmp")
            .with_tasks(vec![Task::new("task_1", "delete tmp dir").with_tool("rec.run")])
            .unwrap();

        let run = async {
            let plan = ExecutionPlan::build(&first, PlanDraft::default()).unwrap();
            sched.run_plan(&first, &plan, &Params::new()).await;
            let plan = ExecutionPlan::build(&second, PlanDraft::default()).unwrap();
            sched.run_plan(&second, &plan, &Params::new()).await
        };
        let run = tokio::time::timeout(Duration::from_secs(3), run).await.unwrap();

        assert_eq!(run.results.len(), 1);
        assert_eq!(run.human_inputs.len(), 1);
        assert_eq!(second.task("task_1").unwrap().status(), TaskStatus::WaitingForHuman);
        assert!(sched.escalation().open_request("g1", "task_1").is_some());
        assert!(sched.escalation().open_request("g2", "task_1").is_some());
    }

    #[tokio::test]
    async fn test_escalation_conflict_fails_task_once() {
        let recorder = Arc::new(Recorder::default());
        let sched = scheduler(&recorder);
        let goal = Goal::with_id("g", "cleanup")
            .with_tasks(vec![Task::new("d", "wipe the cache").with_tool("rec.run")])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::default()).unwrap();
        // 同一 (goal, task) 已有未关闭请求
        let open = sched
            .escalation()
            .create_request(&goal, Some(&goal.tasks[0].snapshot()), "r", None, Params::new())
            .unwrap();

        let run = tokio::time::timeout(Duration::from_secs(3), sched.run_plan(&goal, &plan, &Params::new()))
            .await
            .unwrap();
        assert_eq!(run.results.len(), 1);
        assert!(run.results[0].error.as_deref().unwrap().contains(&open.id));
        assert_eq!(goal.task("d").unwrap().status(), TaskStatus::Failed);
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    /// 两个任务都在同一个 Barrier 上等待，只有并发派发时才能同时通过
    struct Gate {
        barrier: Arc<tokio::sync::Barrier>,
    }

    #[async_trait]
    impl Capability for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn description(&self) -> &str {
            "waits for its sibling"
        }

        fn operations(&self) -> Vec<&'static str> {
            vec!["run"]
        }

        async fn execute(&self, _operation: &str, _params: &Params) -> Result<Value, String> {
            self.barrier.wait().await;
            Ok(serde_json::json!({"success": true}))
        }
    }

    struct GatedChannel {
        barrier: Arc<tokio::sync::Barrier>,
    }

    #[async_trait]
    impl HumanChannel for GatedChannel {
        async fn ask(&self, _request: &HumanInputRequest) -> Result<Value, String> {
            self.barrier.wait().await;
            Ok(Value::String("go".into()))
        }
    }

    fn gated_scheduler(recorder: &Arc<Recorder>, barrier: &Arc<tokio::sync::Barrier>) -> Scheduler {
        let mut registry = ToolRegistry::new();
        registry.register(recorder.clone());
        registry.register(Gate {
            barrier: barrier.clone(),
        });
        Scheduler::new(
            Arc::new(ToolGateway::new(registry, 5)),
            Arc::new(EscalationManager::new()),
            2,
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_parallel_group_members_overlap() {
        let recorder = Arc::new(Recorder::default());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let sched = gated_scheduler(&recorder, &barrier);
        let goal = Goal::with_id("g", "overlap")
            .with_tasks(vec![
                Task::new("a", "first half").with_tool("gate.run").with_max_retries(0),
                Task::new("b", "second half").with_tool("gate.run").with_max_retries(0),
            ])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::sequential(["a", "b"]).with_group(["a", "b"])).unwrap();

        let run = tokio::time::timeout(Duration::from_secs(3), sched.run_plan(&goal, &plan, &Params::new()))
            .await
            .unwrap();
        assert!(run.results.iter().all(|r| r.success));
        assert_eq!(goal.aggregate_status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_blocking_human_channel_does_not_block_sibling() {
        let recorder = Arc::new(Recorder::default());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let sched = gated_scheduler(&recorder, &barrier).with_human_channel(Arc::new(GatedChannel {
            barrier: barrier.clone(),
        }));
        let goal = Goal::with_id("g", "mixed")
            .with_tasks(vec![
                Task::new("old", "remove old artifacts")
                    .with_tool("rec.run")
                    .with_param("label", "old"),
                Task::new("sib", "build the site").with_tool("gate.run").with_max_retries(0),
            ])
            .unwrap();
        let plan = ExecutionPlan::build(&goal, PlanDraft::sequential(["old", "sib"]).with_group(["old", "sib"])).unwrap();

        // old 的人工确认要等 sib 的工具调用到达 Barrier 才返回
        let run = tokio::time::timeout(Duration::from_secs(3), sched.run_plan(&goal, &plan, &Params::new()))
            .await
            .unwrap();
        assert!(run.results.iter().all(|r| r.success));
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["old"]);
        assert_eq!(run.results[0].metadata["human_response"], "go");
        assert_eq!(run.human_inputs.len(), 1);
    }
}
