//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTOTASK__*` 覆盖（双下划线表示嵌套，如 `AUTOTASK__ENGINE__MAX_CONCURRENT_TASKS=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
    pub adaptation: AdaptationSection,
}

/// [engine] 段：并发上限、默认重试次数、重试间隔
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 计划文件中未写 max_retries 的任务使用此值
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_max_retries() -> u32 {
    crate::workflow::DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

/// [tools] 段：沙箱根目录、单次调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub command: CommandSection,
    #[serde(default)]
    pub web: WebSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            tool_timeout_secs: default_tool_timeout_secs(),
            command: CommandSection::default(),
            web: WebSection::default(),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.command] 段：`execute` 允许的命令名（首个 token 精确匹配，空列表表示不限制）
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    [
        "git", "npm", "pip", "python", "python3", "node", "npx", "yarn", "pnpm", "ls", "pwd", "cd",
        "mkdir", "echo",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [tools.web] 段
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_web_timeout_secs(),
        }
    }
}

fn default_web_timeout_secs() -> u64 {
    10
}

/// [memory] 段：模式文件与会话文件的目录
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_memory_dir")]
    pub memory_dir: PathBuf,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            memory_dir: default_memory_dir(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from("data/memory")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("data/sessions")
}

/// [adaptation] 段：建议规则的阈值
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptationSection {
    #[serde(default = "default_slow_task_threshold_secs")]
    pub slow_task_threshold_secs: f64,
    #[serde(default = "default_low_success_rate")]
    pub low_success_rate: f64,
}

impl Default for AdaptationSection {
    fn default() -> Self {
        Self {
            slow_task_threshold_secs: default_slow_task_threshold_secs(),
            low_success_rate: default_low_success_rate(),
        }
    }
}

fn default_slow_task_threshold_secs() -> f64 {
    30.0
}

fn default_low_success_rate() -> f64 {
    0.5
}

/// 从 config 目录加载配置，环境变量 AUTOTASK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTOTASK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTOTASK")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_concurrent_tasks, 4);
        assert_eq!(cfg.engine.default_max_retries, 3);
        assert_eq!(cfg.engine.retry_backoff_ms, 1000);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.tools.web.timeout_secs, 10);
        assert!(cfg.tools.command.allowed_commands.contains(&"git".to_string()));
        assert_eq!(cfg.memory.sessions_dir, PathBuf::from("data/sessions"));
        assert_eq!(cfg.adaptation.low_success_rate, 0.5);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_concurrent_tasks = 2\n\n[tools.command]\nallowed_commands = [\"cargo\"]\n\n[adaptation]\nslow_task_threshold_secs = 5.0"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.max_concurrent_tasks, 2);
        assert_eq!(cfg.engine.default_max_retries, 3);
        assert_eq!(cfg.tools.command.allowed_commands, vec!["cargo".to_string()]);
        assert_eq!(cfg.adaptation.slow_task_threshold_secs, 5.0);
    }
}
