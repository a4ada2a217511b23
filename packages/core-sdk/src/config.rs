use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";

/**
 * \brief 应用配置。所有字段都有默认值，配置文件可以只写需要覆盖的部分。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub openai: OpenAiConfig,
    pub anthropic: AnthropicConfig,
    /** \brief 页面上用户消息的显示名 */
    pub username: String,
    /** \brief 启动时选中的模型 */
    pub default_model: String,
    /** \brief 每次请求附带的系统提示词 */
    pub system_prompts: Vec<String>,
    /** \brief 发给 Provider 的最近消息条数 */
    pub history_window: usize,
    /** \brief 助手显示名后附带模型名 */
    pub show_model_names: bool,
    /** \brief 静态资源目录 */
    pub static_dir: PathBuf,
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            openai: OpenAiConfig::default(),
            anthropic: AnthropicConfig::default(),
            username: "User".to_string(),
            default_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            system_prompts: Vec::new(),
            history_window: 10,
            show_model_names: false,
            static_dir: PathBuf::from("web/static"),
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /** \brief 收到关闭请求后等待进行中请求的秒数 */
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_grace_secs: 1,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub models: Vec<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com".to_string(),
            models: vec![DEFAULT_OPENAI_MODEL.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub models: Vec<String>,
    pub max_tokens: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.anthropic.com".to_string(),
            models: vec![DEFAULT_ANTHROPIC_MODEL.to_string()],
            max_tokens: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    /**
     * \brief 从 YAML 文件加载配置，文件不存在时使用默认值，随后应用环境变量覆盖。
     */
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            AppConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /**
     * \brief 应用环境变量覆盖。lookup 便于测试时注入。
     */
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty("OPENAI_API_KEY").or_else(|| non_empty("OPEN_AI_API_KEY")) {
            self.openai.api_key = Some(key);
        }
        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.anthropic.api_key = Some(key);
        }
        if let Some(name) = non_empty("CHATTERBOX_USERNAME") {
            self.username = name;
        }
        if let Some(dir) = non_empty("CHATTERBOX_STATIC_DIR") {
            self.static_dir = PathBuf::from(dir);
        }
    }

    pub fn openai_key(&self) -> Option<&str> {
        self.openai.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn anthropic_key(&self) -> Option<&str> {
        self.anthropic
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }

    /** \brief 是否至少配置了一个 API Key。 */
    pub fn has_credentials(&self) -> bool {
        self.openai_key().is_some() || self.anthropic_key().is_some()
    }
}
