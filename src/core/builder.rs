//! 编排器构建器：从 AppConfig 统一组装工具注册表、调度器、模式记忆与适应分析器
//!
//! 二进制入口与集成测试共用同一套组装逻辑，差异只在可选协作者（人工通道、规划器等）与额外工具。

use std::sync::Arc;
use std::time::Duration;

use crate::adaptation::{AdaptationAnalyzer, PatternEnricher};
use crate::config::AppConfig;
use crate::core::escalation::{ApproachAdvisor, EscalationManager, HumanChannel};
use crate::core::orchestrator::Orchestrator;
use crate::core::scheduler::Scheduler;
use crate::memory::PatternMemory;
use crate::planning::{Decomposer, Planner};
use crate::tools::{Capability, CommandExecutor, FileOperations, GitOperations, ToolGateway, ToolRegistry, WebOperations};

pub struct OrchestratorBuilder {
    config: AppConfig,
    builtin_tools: bool,
    extra_tools: Vec<Arc<dyn Capability>>,
    memory: Option<Arc<PatternMemory>>,
    human: Option<Arc<dyn HumanChannel>>,
    advisor: Option<Arc<dyn ApproachAdvisor>>,
    decomposer: Option<Arc<dyn Decomposer>>,
    planner: Option<Arc<dyn Planner>>,
    enricher: Option<Arc<dyn PatternEnricher>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            builtin_tools: true,
            extra_tools: Vec::new(),
            memory: None,
            human: None,
            advisor: None,
            decomposer: None,
            planner: None,
            enricher: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 是否注册四个内置工具（默认注册）
    pub fn with_builtin_tools(mut self, enable: bool) -> Self {
        self.builtin_tools = enable;
        self
    }

    /// 追加工具；与内置工具同名时覆盖内置实现
    pub fn with_tool(mut self, tool: Arc<dyn Capability>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// 使用外部提供的模式记忆（默认按 [memory] 段打开磁盘存储）
    pub fn with_memory(mut self, memory: Arc<PatternMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_human_channel(mut self, channel: Arc<dyn HumanChannel>) -> Self {
        self.human = Some(channel);
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn ApproachAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn PatternEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// 构建工具注册表：内置工具共享 [tools].base_path 作为沙箱根
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        let cfg = &self.config.tools;

        if self.builtin_tools {
            tools.register(FileOperations::new(&cfg.base_path));
            tools.register(GitOperations::new(&cfg.base_path));
            tools.register(CommandExecutor::new(
                &cfg.base_path,
                cfg.command.allowed_commands.clone(),
                cfg.tool_timeout_secs,
            ));
            tools.register(WebOperations::new(&cfg.base_path, cfg.web.timeout_secs));
        }
        for tool in &self.extra_tools {
            tools.register_arc(tool.clone());
        }
        tools
    }

    pub fn build_scheduler(&self) -> Scheduler {
        let gateway = ToolGateway::new(self.build_tool_registry(), self.config.tools.tool_timeout_secs);
        let escalation = match &self.advisor {
            Some(advisor) => EscalationManager::new().with_advisor(advisor.clone()),
            None => EscalationManager::new(),
        };
        let scheduler = Scheduler::new(
            Arc::new(gateway),
            Arc::new(escalation),
            self.config.engine.max_concurrent_tasks,
            Duration::from_millis(self.config.engine.retry_backoff_ms),
        );
        match &self.human {
            Some(channel) => scheduler.with_human_channel(channel.clone()),
            None => scheduler,
        }
    }

    pub fn build(self) -> Orchestrator {
        let scheduler = self.build_scheduler();
        let memory = self.memory.clone().unwrap_or_else(|| {
            Arc::new(PatternMemory::open(
                &self.config.memory.memory_dir,
                &self.config.memory.sessions_dir,
            ))
        });

        let mut analyzer = AdaptationAnalyzer::new(
            self.config.adaptation.slow_task_threshold_secs,
            self.config.adaptation.low_success_rate,
        );
        if let Some(enricher) = self.enricher {
            analyzer = analyzer.with_enricher(enricher);
        }

        let mut orchestrator = Orchestrator::new(scheduler, memory, analyzer);
        if let Some(decomposer) = self.decomposer {
            orchestrator = orchestrator.with_decomposer(decomposer);
        }
        if let Some(planner) = self.planner {
            orchestrator = orchestrator.with_planner(planner);
        }
        tracing::info!(
            tools = self.extra_tools.len() + if self.builtin_tools { 4 } else { 0 },
            max_concurrent_tasks = self.config.engine.max_concurrent_tasks,
            "orchestrator built"
        );
        orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = OrchestratorBuilder::new(AppConfig::default()).build_tool_registry();
        assert_eq!(
            registry.tool_names(),
            vec!["command_executor", "file_operations", "git_operations", "web_operations"]
        );
        assert!(registry.get("file_operations").unwrap().supports("delete_file"));
        assert!(registry.get("git_operations").unwrap().supports("get_current_branch"));
    }

    #[test]
    fn test_registry_without_builtins_is_empty() {
        let registry = OrchestratorBuilder::new(AppConfig::default())
            .with_builtin_tools(false)
            .build_tool_registry();
        assert!(registry.tool_names().is_empty());
    }
}
