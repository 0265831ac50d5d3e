//! 适应分析：从一次执行的结果中提炼模式与建议
//!
//! 确定性部分：成功率、successful_approach / failed_approach 模式、三条规则型建议；
//! 非确定性部分交给可选的 PatternEnricher，其失败只记日志，不影响确定性结果。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::EngineError;
use crate::memory::{LearnedPattern, FAILED_APPROACH, SUCCESSFUL_APPROACH};
use crate::workflow::{ExecutionResult, Goal, GoalId};

/// 一次分析的产出，追加到 GoalSession.adaptations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationUpdate {
    pub goal_id: GoalId,
    #[serde(default)]
    pub patterns_learned: Vec<LearnedPattern>,
    /// 与历史模式对照后调整的策略（如反复出现的错误）
    #[serde(default)]
    pub strategies_updated: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// 外部模式增强（通常由 LLM 对结果做整体解读），产出 general / optimization 类模式
#[async_trait]
pub trait PatternEnricher: Send + Sync {
    async fn enrich(&self, goal: &Goal, results: &[ExecutionResult]) -> Result<Vec<LearnedPattern>, String>;
}

pub struct AdaptationAnalyzer {
    enricher: Option<Arc<dyn PatternEnricher>>,
    slow_task_threshold_secs: f64,
    low_success_rate: f64,
}

impl Default for AdaptationAnalyzer {
    fn default() -> Self {
        Self::new(30.0, 0.5)
    }
}

impl AdaptationAnalyzer {
    pub fn new(slow_task_threshold_secs: f64, low_success_rate: f64) -> Self {
        Self {
            enricher: None,
            slow_task_threshold_secs,
            low_success_rate,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn PatternEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// 结果为空时为 0
    pub fn success_rate(results: &[ExecutionResult]) -> f64 {
        if results.is_empty() {
            return 0.0;
        }
        results.iter().filter(|r| r.success).count() as f64 / results.len() as f64
    }

    pub async fn analyze(&self, goal: &Goal, results: &[ExecutionResult], prior: &[LearnedPattern]) -> AdaptationUpdate {
        let mut patterns = deterministic_patterns(goal, results);

        if let (Some(enricher), false) = (&self.enricher, results.is_empty()) {
            match enricher.enrich(goal, results).await {
                Ok(extra) => patterns.extend(extra),
                Err(message) => {
                    let err = EngineError::Collaborator {
                        collaborator: "pattern enricher",
                        message,
                    };
                    tracing::warn!(goal_id = %goal.id, error = %err, "enrichment skipped");
                }
            }
        }

        let recommendations = self.recommendations(results);
        let strategies_updated = recurring_errors(results, prior);
        tracing::info!(
            goal_id = %goal.id,
            patterns = patterns.len(),
            recommendations = recommendations.len(),
            "adaptation analyzed"
        );

        AdaptationUpdate {
            goal_id: goal.id.clone(),
            patterns_learned: patterns,
            strategies_updated,
            recommendations,
        }
    }

    fn recommendations(&self, results: &[ExecutionResult]) -> Vec<String> {
        let mut out = Vec::new();
        if Self::success_rate(results) < self.low_success_rate {
            out.push("Consider breaking down the goal into smaller, more manageable tasks".to_string());
        }
        if let Some((error, _)) = error_counts(results)
            .into_iter()
            .filter(|(e, _)| e != UNKNOWN_ERROR)
            .fold(None::<(String, usize)>, |best, (e, n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((e, n)),
            })
        {
            out.push(format!("Address common error: {error}"));
        }
        if !results.is_empty() {
            let mean = results.iter().map(|r| r.execution_time).sum::<f64>() / results.len() as f64;
            if mean > self.slow_task_threshold_secs {
                out.push(format!(
                    "Consider optimizing tasks that take longer than {} seconds",
                    self.slow_task_threshold_secs
                ));
            }
        }
        out
    }
}

const UNKNOWN_ERROR: &str = "Unknown error";

/// 失败结果中各错误文本的出现次数（按首次出现顺序）
fn error_counts(results: &[ExecutionResult]) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for result in results.iter().filter(|r| !r.success) {
        let error = result.error.clone().unwrap_or_else(|| UNKNOWN_ERROR.to_string());
        match counts.iter_mut().find(|(e, _)| *e == error) {
            Some((_, n)) => *n += 1,
            None => counts.push((error, 1)),
        }
    }
    counts
}

fn deterministic_patterns(goal: &Goal, results: &[ExecutionResult]) -> Vec<LearnedPattern> {
    let mut patterns = Vec::new();
    let total = results.len();
    let successes = results.iter().filter(|r| r.success).count();
    let now = Utc::now();

    if successes > 0 {
        let mut pattern = LearnedPattern::new(SUCCESSFUL_APPROACH, "success", successes as f64 / total as f64)
            .with_context("goal_type", goal.description.clone())
            .with_context("successful_tasks", successes)
            .with_context("total_tasks", total)
            .with_usage(1);
        pattern.last_used = now;
        patterns.push(pattern);
    }

    let failures = total - successes;
    for (error, count) in error_counts(results) {
        let mut pattern = LearnedPattern::new(FAILED_APPROACH, "failure", count as f64 / failures as f64)
            .with_context("goal_type", goal.description.clone())
            .with_context("error", error)
            .with_context("occurrences", count)
            .with_usage(1);
        pattern.last_used = now;
        patterns.push(pattern);
    }
    patterns
}

/// 本次错误中已在历史 failed_approach 模式里出现过的
fn recurring_errors(results: &[ExecutionResult], prior: &[LearnedPattern]) -> Vec<String> {
    error_counts(results)
        .into_iter()
        .filter(|(error, _)| {
            prior.iter().any(|p| {
                p.pattern_type == FAILED_APPROACH
                    && p.context.get("error").and_then(Value::as_str) == Some(error.as_str())
            })
        })
        .map(|(error, _)| format!("Recurring error: {error}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Params;

    fn ok(id: &str, secs: f64) -> ExecutionResult {
        ExecutionResult::success(id, "done", secs, Params::new())
    }

    fn err(id: &str, error: &str) -> ExecutionResult {
        ExecutionResult::failure(id, error, 1.0, Params::new())
    }

    #[tokio::test]
    async fn test_patterns_and_confidences() {
        let goal = Goal::with_id("g", "set up repo");
        let results = vec![ok("a", 1.0), err("b", "timeout"), err("c", "timeout"), err("d", "denied")];
        let update = AdaptationAnalyzer::default().analyze(&goal, &results, &[]).await;

        let p = &update.patterns_learned;
        assert_eq!(p.len(), 3);
        assert_eq!(p[0].pattern_type, SUCCESSFUL_APPROACH);
        assert_eq!(p[0].confidence, 0.25);
        assert_eq!(p[0].context["goal_type"], "set up repo");
        assert_eq!(p[0].usage_count, 1);
        assert_eq!(p[1].context["error"], "timeout");
        assert!((p[1].confidence - 2.0 / 3.0).abs() < 1e-9);
        assert!((p[2].confidence - 1.0 / 3.0).abs() < 1e-9);

        assert_eq!(
            update.recommendations,
            vec![
                "Consider breaking down the goal into smaller, more manageable tasks".to_string(),
                "Address common error: timeout".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_tasks_recommendation() {
        let goal = Goal::new("crunch");
        let update = AdaptationAnalyzer::default()
            .analyze(&goal, &[ok("a", 45.0), ok("b", 20.0)], &[])
            .await;
        assert_eq!(
            update.recommendations,
            vec!["Consider optimizing tasks that take longer than 30 seconds".to_string()]
        );
    }

    #[tokio::test]
    async fn test_enricher_failure_is_ignored() {
        struct Broken;
        #[async_trait]
        impl PatternEnricher for Broken {
            async fn enrich(&self, _goal: &Goal, _results: &[ExecutionResult]) -> Result<Vec<LearnedPattern>, String> {
                Err("model offline".into())
            }
        }

        let goal = Goal::new("x");
        let analyzer = AdaptationAnalyzer::default().with_enricher(Arc::new(Broken));
        let update = analyzer.analyze(&goal, &[ok("a", 1.0)], &[]).await;
        assert_eq!(update.patterns_learned.len(), 1);
        assert!(update.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_recurring_errors_from_prior_patterns() {
        let goal = Goal::new("x");
        let prior = vec![LearnedPattern::new(FAILED_APPROACH, "failure", 1.0).with_context("error", "denied")];
        let update = AdaptationAnalyzer::default()
            .analyze(&goal, &[err("a", "denied"), err("b", "other")], &prior)
            .await;
        assert_eq!(update.strategies_updated, vec!["Recurring error: denied".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_results() {
        let update = AdaptationAnalyzer::default().analyze(&Goal::new("x"), &[], &[]).await;
        assert!(update.patterns_learned.is_empty());
        assert_eq!(AdaptationAnalyzer::success_rate(&[]), 0.0);
    }
}
