//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MEDSTER__*` 覆盖（双下划线表示嵌套，如 `MEDSTER__LLM__PROVIDER=mock`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::StepBudget;
use crate::llm::RetryConfig;
use crate::react::ContextLimits;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub context: ContextSection,
    pub llm: LlmSection,
    pub data: DataSection,
}

/// [agent] 段：步数预算、补救任务数、调试开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    pub max_steps_per_task: usize,
    /// META_VALIDATING 最多追加的补救任务数
    pub max_corrective_tasks: usize,
    /// TracingSink 以 info 输出完整事件 payload；日志默认级别升为 debug
    pub verbose: bool,
    /// 事件 JSONL 文件（未设置则不写）
    pub debug_log: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let budget = StepBudget::default();
        Self {
            max_steps: budget.max_steps,
            max_steps_per_task: budget.max_steps_per_task,
            max_corrective_tasks: 1,
            verbose: false,
            debug_log: None,
        }
    }
}

impl AgentSection {
    pub fn budget(&self) -> StepBudget {
        StepBudget {
            max_steps: self.max_steps,
            max_steps_per_task: self.max_steps_per_task,
        }
    }
}

/// [context] 段：token 估算与证据大小上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub chars_per_token: f64,
    pub max_output_tokens: usize,
    pub max_single_output_tokens: usize,
    pub max_list_items: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        let limits = ContextLimits::default();
        Self {
            chars_per_token: limits.chars_per_token,
            max_output_tokens: limits.max_output_tokens,
            max_single_output_tokens: limits.max_single_output_tokens,
            max_list_items: limits.max_list_items,
        }
    }
}

impl ContextSection {
    pub fn limits(&self) -> ContextLimits {
        ContextLimits {
            chars_per_token: if self.chars_per_token > 0.0 {
                self.chars_per_token
            } else {
                ContextLimits::default().chars_per_token
            },
            max_output_tokens: self.max_output_tokens,
            max_single_output_tokens: self.max_single_output_tokens,
            max_list_items: self.max_list_items,
        }
    }
}

/// [llm] 段：后端选择、模型、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 缺少 API Key 时回退 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
            max_tokens: 4096,
            retry: RetrySection::default(),
        }
    }
}

impl LlmSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// [llm.retry] 段：推理网关的重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_delay_ms: retry.initial_delay.as_millis() as u64,
            multiplier: retry.multiplier,
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: if self.multiplier >= 1.0 { self.multiplier } else { 1.0 },
        }
    }
}

/// [data] 段：FHIR bundle 与影像目录（工具只能访问这两个根目录之内）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub fhir_root: PathBuf,
    pub image_root: PathBuf,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            fhir_root: PathBuf::from("./coherent_data/fhir"),
            image_root: PathBuf::from("./coherent_data/images"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MEDSTER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MEDSTER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MEDSTER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
