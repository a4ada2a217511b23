use thiserror::Error;

use crate::models::ProviderKind;

/**
 * \brief 配置加载错误。
 */
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/**
 * \brief 单次转发请求的错误，均终止当前请求且不重试。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /** \brief 启动时没有任何 API Key。 */
    #[error("No API keys configured. Provide an OpenAI or Anthropic API key.")]
    NotConfigured,

    /** \brief 请求的模型不在可用列表中。 */
    #[error("Selected model is not available: {0}")]
    UnavailableModel(String),

    /** \brief 路由到的 Provider 缺少凭据。 */
    #[error("{0} API key is not available.")]
    ProviderUnavailable(ProviderKind),

    /** \brief 上游流式调用失败。 */
    #[error("upstream stream failed: {0}")]
    Upstream(String),
}
