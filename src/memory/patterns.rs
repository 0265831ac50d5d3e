//! 学习到的模式记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::Params;

pub const SUCCESSFUL_APPROACH: &str = "successful_approach";
pub const FAILED_APPROACH: &str = "failed_approach";

/// 从历史执行中总结出的模式；除 usage_count / last_used 外只追加不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: String,
    pub pattern_type: String,
    #[serde(default)]
    pub context: Params,
    pub outcome: String,
    /// 0.0 ~ 1.0
    pub confidence: f64,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default = "Utc::now")]
    pub last_used: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl LearnedPattern {
    pub fn new(pattern_type: impl Into<String>, outcome: impl Into<String>, confidence: f64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern_type: pattern_type.into(),
            context: Params::new(),
            outcome: outcome.into(),
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            usage_count: 0,
            last_used: now,
            created_at: now,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_usage(mut self, usage_count: u32) -> Self {
        self.usage_count = usage_count;
        self
    }

    /// 类型精确匹配，且 filter 中每个键值都在 context 中出现
    pub fn matches(&self, pattern_type: Option<&str>, filter: Option<&Params>) -> bool {
        if pattern_type.is_some_and(|t| t != self.pattern_type) {
            return false;
        }
        filter.map_or(true, |f| f.iter().all(|(k, v)| self.context.get(k) == Some(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(LearnedPattern::new("x", "y", 1.7).confidence, 1.0);
        assert_eq!(LearnedPattern::new("x", "y", -0.2).confidence, 0.0);
        assert_eq!(LearnedPattern::new("x", "y", f64::NAN).confidence, 0.0);
    }

    #[test]
    fn test_matches_type_and_context() {
        let p = LearnedPattern::new(SUCCESSFUL_APPROACH, "ok", 0.9).with_context("goal_type", "git");
        let mut filter = Params::new();
        filter.insert("goal_type".into(), json!("git"));
        assert!(p.matches(Some(SUCCESSFUL_APPROACH), Some(&filter)));
        assert!(p.matches(None, None));
        assert!(!p.matches(Some(FAILED_APPROACH), None));

        filter.insert("goal_type".into(), json!("web"));
        assert!(!p.matches(None, Some(&filter)));
    }
}
