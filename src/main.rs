//! Autotask 命令行入口
//!
//! 用法：`autotask <plan.json> [config.toml]`
//!
//! 计划文件格式：`{ "goal": <Goal>, "plan": <PlanDraft> }`。使用内置工具执行，不接人工通道，
//! 需要人工确认的任务会停在 waiting_for_human。结束后把目标状态与逐任务状态以 JSON 打印到 stdout。

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};

use autotask::config::{load_config, AppConfig};
use autotask::core::GoalProgress;
use autotask::workflow::{Goal, Params, PlanDraft};
use autotask::{observability, OrchestratorBuilder};

#[derive(Debug, Deserialize)]
struct PlanFile {
    goal: Goal,
    #[serde(default)]
    plan: Option<PlanDraft>,
    #[serde(default)]
    context: Params,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: autotask <plan.json> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    let raw = tokio::fs::read_to_string(&plan_path)
        .await
        .with_context(|| format!("Failed to read plan file {}", plan_path.display()))?;
    let mut value: Value = serde_json::from_str(&raw).context("Plan file is not valid JSON")?;
    fill_default_retries(&mut value, config.engine.default_max_retries);
    let file: PlanFile = serde_json::from_value(value).context("Plan file does not match {goal, plan}")?;

    let draft = file.plan.unwrap_or_else(|| autotask::planning::SequentialPlanner::draft(&file.goal));
    let orchestrator = OrchestratorBuilder::new(config).build();
    let session = orchestrator
        .execute(file.goal, draft, file.context)
        .await
        .context("Plan construction failed")?;

    let progress = GoalProgress::of(&session);
    let pending: Vec<Value> = session
        .human_inputs
        .iter()
        .filter(|r| !r.resolved)
        .map(|r| json!({"request_id": r.id, "task_id": r.task_id, "question": r.question, "options": r.options}))
        .collect();
    let summary = json!({
        "goal_id": session.goal.id,
        "status": session.goal.status,
        "progress": progress,
        "pending_human_inputs": pending,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// 计划文件里未写 max_retries 的任务使用 [engine].default_max_retries
fn fill_default_retries(value: &mut Value, default_max_retries: u32) {
    let Some(tasks) = value.pointer_mut("/goal/tasks").and_then(Value::as_array_mut) else {
        return;
    };
    for task in tasks.iter_mut().filter_map(Value::as_object_mut) {
        task.entry("max_retries").or_insert_with(|| json!(default_max_retries));
    }
}
