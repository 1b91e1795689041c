//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FORAGER__*` 覆盖（双下划线表示嵌套，如 `FORAGER__LLM__PROVIDER=openai`）。
//! API key 另可由 `FORAGER_API_KEYS`（逗号分隔）提供。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::AgentSettings;
use crate::core::AgentError;
use crate::environment::HttpEnvironmentConfig;
use crate::llm::{CredentialSelection, RotationMode};
use crate::research::ResearchSettings;

/// 逗号分隔的 API key 列表
pub const API_KEYS_ENV: &str = "FORAGER_API_KEYS";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub research: ResearchConfig,
    pub environment: EnvironmentConfig,
}

/// [agent] 段：单任务循环的预算与上下文
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub max_input_tokens: usize,
    pub max_failures: usize,
    pub retry_delay_secs: u64,
    pub max_actions_per_step: usize,
    pub max_error_length: usize,
    pub estimated_chars_per_token: usize,
    /// 每张截图计入的 token 数
    pub image_tokens: usize,
    pub use_vision: bool,
    /// 可选的静态任务上下文（作为受保护消息）
    pub message_context: Option<String>,
    /// 设置后按步保存对话记录
    pub save_conversation_dir: Option<PathBuf>,
    /// done 之后用一次额外的模型调用校验结果
    pub validate_output: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_input_tokens: 128_000,
            max_failures: 3,
            retry_delay_secs: 20,
            max_actions_per_step: 10,
            max_error_length: 400,
            estimated_chars_per_token: 3,
            image_tokens: 800,
            use_vision: true,
            message_context: None,
            save_conversation_dir: None,
            validate_output: false,
        }
    }
}

impl AgentConfig {
    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            max_failures: self.max_failures,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_actions_per_step: self.max_actions_per_step,
            max_error_length: self.max_error_length,
            max_input_tokens: self.max_input_tokens,
            estimated_chars_per_token: self.estimated_chars_per_token,
            image_tokens: self.image_tokens,
            use_vision: self.use_vision,
            message_context: self.message_context.clone(),
            save_conversation_dir: self.save_conversation_dir.clone(),
        }
    }
}

/// [llm] 段：后端选择、凭据与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_keys: Vec<String>,
    /// 单次请求超时（秒），0 表示不限
    pub request_timeout_secs: u64,
    pub retry: LlmRetryConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_keys: Vec::new(),
            request_timeout_secs: 60,
            retry: LlmRetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl LlmConfig {
    /// 配置文件中的 key，加上 FORAGER_API_KEYS 与 OPENAI_API_KEY 中的 key（去重、保序）
    pub fn resolved_api_keys(&self) -> Vec<String> {
        let from_env = std::env::var(API_KEYS_ENV).ok();
        let openai = std::env::var("OPENAI_API_KEY").ok();
        merge_keys(&self.api_keys, from_env.as_deref(), openai.as_deref())
    }
}

fn merge_keys(configured: &[String], list_env: Option<&str>, single_env: Option<&str>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let candidates = configured
        .iter()
        .map(String::as_str)
        .chain(list_env.into_iter().flat_map(|s| s.split(',')))
        .chain(single_env);
    for key in candidates {
        let key = key.trim();
        if !key.is_empty() && !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetryConfig {
    pub max_retries: usize,
    pub base_backoff_secs: u64,
    pub rotation: RotationMode,
    pub selection: CredentialSelection,
}

impl Default for LlmRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_secs: 5,
            rotation: RotationMode::PerCall,
            selection: CredentialSelection::RoundRobin,
        }
    }
}

/// [llm.rate_limit] 段：滚动窗口内的调用上限，max_calls = 0 表示不限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls: usize,
    pub period_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 10,
            period_secs: 60,
        }
    }
}

/// [research] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_search_iterations: usize,
    pub max_query_num: usize,
    pub max_steps_per_query: usize,
    pub save_dir: PathBuf,
    pub cache: CacheConfig,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_search_iterations: 5,
            max_query_num: 3,
            max_steps_per_query: 10,
            save_dir: PathBuf::from("./tmp/deep_research"),
            cache: CacheConfig::default(),
        }
    }
}

impl ResearchConfig {
    pub fn settings(&self) -> ResearchSettings {
        ResearchSettings {
            max_search_iterations: self.max_search_iterations,
            max_query_num: self.max_query_num,
            max_steps_per_query: self.max_steps_per_query,
            save_dir: self.save_dir.clone(),
        }
    }
}

/// [research.cache] 段：path 为空时只用内存缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: Option<PathBuf>,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: 86_400,
        }
    }
}

/// [environment] 段：HTTP 环境的超时、正文长度与域名白名单（空表示不限）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub timeout_secs: u64,
    pub max_content_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_content_chars: 8000,
            allowed_domains: Vec::new(),
        }
    }
}

impl EnvironmentConfig {
    pub fn http(&self) -> HttpEnvironmentConfig {
        HttpEnvironmentConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            max_content_chars: self.max_content_chars,
            allowed_domains: self.allowed_domains.clone(),
        }
    }
}

impl AppConfig {
    /// 拒绝为 0 的预算与上限（致命配置错误，不重试）
    pub fn validate(&self) -> Result<(), AgentError> {
        let checks: [(&str, usize); 8] = [
            ("agent.max_steps", self.agent.max_steps),
            ("agent.max_input_tokens", self.agent.max_input_tokens),
            ("agent.max_failures", self.agent.max_failures),
            ("agent.max_actions_per_step", self.agent.max_actions_per_step),
            ("agent.estimated_chars_per_token", self.agent.estimated_chars_per_token),
            ("llm.retry.max_retries", self.llm.retry.max_retries),
            ("research.max_search_iterations", self.research.max_search_iterations),
            ("research.max_query_num", self.research.max_query_num),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(AgentError::ConfigError(format!("{} must be > 0", name)));
            }
        }
        if self.research.max_steps_per_query == 0 {
            return Err(AgentError::ConfigError(
                "research.max_steps_per_query must be > 0".to_string(),
            ));
        }
        if self.llm.rate_limit.max_calls > 0 && self.llm.rate_limit.period_secs == 0 {
            return Err(AgentError::ConfigError(
                "llm.rate_limit.period_secs must be > 0 when max_calls is set".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(AgentError::ConfigError("llm.model must not be empty".to_string()));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 FORAGER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FORAGER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FORAGER")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.agent.max_error_length, 400);
        assert_eq!(cfg.llm.rate_limit.max_calls, 10);
        assert_eq!(cfg.research.cache.ttl_secs, 86_400);
    }

    #[test]
    fn test_zero_budget_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.agent.max_failures = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(ref m) if m.contains("max_failures")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_failures = 5\nvalidate_output = true\nsave_conversation_dir = \"./tmp/conv\"\n\n[llm.retry]\nrotation = \"per_retry\"\nselection = \"random\"\n\n[research]\nmax_query_num = 2"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_failures, 5);
        assert_eq!(cfg.agent.max_steps, 100);
        assert!(cfg.agent.validate_output);
        assert_eq!(cfg.agent.settings().save_conversation_dir, Some(PathBuf::from("./tmp/conv")));
        assert_eq!(cfg.llm.retry.rotation, RotationMode::PerRetry);
        assert_eq!(cfg.llm.retry.selection, CredentialSelection::Random);
        assert_eq!(cfg.research.max_query_num, 2);
    }

    #[test]
    fn test_merge_keys_dedups_in_order() {
        let keys = merge_keys(&["a".into()], Some("b, a ,,c"), Some("d"));
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_settings_conversion() {
        let cfg = AppConfig::default();
        let settings = cfg.agent.settings();
        assert_eq!(settings.retry_delay, Duration::from_secs(20));
        assert_eq!(cfg.research.settings().max_steps_per_query, 10);
    }
}
