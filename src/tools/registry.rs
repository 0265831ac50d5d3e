//! 工具注册表
//!
//! 所有工具实现 Capability trait（name / operations / execute），由 ToolRegistry 按名注册与查找。
//! 每个工具内部对一组封闭的操作标签分派，不做按方法名的反射调用；
//! ToolGateway 在调用时加超时并统一归一化为 ToolOutcome。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::workflow::Params;

/// 工具能力 trait：固定入口 `execute(operation, params)`
#[async_trait]
pub trait Capability: Send + Sync {
    /// 工具名称（任务上的 `tool` 字段）
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str;

    /// 支持的操作标签（封闭集合）
    fn operations(&self) -> Vec<&'static str>;

    fn supports(&self, operation: &str) -> bool {
        self.operations().contains(&operation)
    }

    /// 未指定操作时，按任务描述里的关键词推断默认操作
    fn default_operation(&self, _description: &str) -> Option<&'static str> {
        None
    }

    /// 执行操作：Ok 为至少包含 `success` 布尔键的 JSON 对象；Err 表示工具自身报错
    async fn execute(&self, operation: &str, params: &Params) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Capability>，由调用方显式构建并传入，不做全局单例
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Capability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Capability + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Capability>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 某工具支持的操作列表；工具不存在时为空
    pub fn list_operations(&self, name: &str) -> Vec<&'static str> {
        self.tools
            .get(name)
            .map(|t| t.operations())
            .unwrap_or_default()
    }
}

/// 从参数中取字符串
pub(crate) fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// 取必需字符串参数，缺失时报错
pub(crate) fn required_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, String> {
    str_param(params, key).ok_or_else(|| format!("Missing required parameter: {key}"))
}

/// 描述中是否包含任一关键词（小写比较）
pub(crate) fn mentions_any(description: &str, keywords: &[&str]) -> bool {
    let lower = description.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Capability for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn description(&self) -> &str {
            "does nothing"
        }

        fn operations(&self) -> Vec<&'static str> {
            vec!["run"]
        }

        async fn execute(&self, _operation: &str, _params: &Params) -> Result<Value, String> {
            Ok(serde_json::json!({"success": true}))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Noop);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list_operations("noop"), vec!["run"]);
        assert!(registry.list_operations("missing").is_empty());
    }

    #[test]
    fn test_supports_uses_closed_operation_set() {
        assert!(Noop.supports("run"));
        assert!(!Noop.supports("delete"));
    }
}
