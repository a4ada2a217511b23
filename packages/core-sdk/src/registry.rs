use std::sync::Arc;

use crate::{
    config::AppConfig,
    llm::{AnthropicAdapter, ChatAdapter, OpenAiAdapter},
    models::ProviderKind,
};

/**
 * \brief 单个模型的路由：所属 Provider 与适配器。适配器为空表示该 Provider 缺少凭据。
 */
#[derive(Clone)]
pub struct ModelRoute {
    pub model: String,
    pub kind: ProviderKind,
    /** \brief `from_config` 只为有凭据的 Provider 建路由，因此总是 Some；None 只出现在手工构建的注册表中。 */
    pub adapter: Option<Arc<dyn ChatAdapter>>,
}

impl std::fmt::Debug for ModelRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRoute")
            .field("model", &self.model)
            .field("kind", &self.kind)
            .field("configured", &self.adapter.is_some())
            .finish()
    }
}

/**
 * \brief Provider 注册表，启动时构建一次，之后只读。
 */
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    routes: Vec<ModelRoute>,
}

impl ProviderRegistry {
    pub fn new(routes: Vec<ModelRoute>) -> Self {
        let mut deduped: Vec<ModelRoute> = Vec::with_capacity(routes.len());
        for route in routes {
            if deduped.iter().any(|r| r.model == route.model) {
                tracing::warn!(model = %route.model, "duplicate model route ignored");
                continue;
            }
            deduped.push(route);
        }
        Self { routes: deduped }
    }

    /**
     * \brief 按配置中的凭据构建：只有配置了 API Key 的 Provider 才注册其模型。
     */
    pub fn from_config(config: &AppConfig) -> Self {
        let mut routes = Vec::new();
        if let Some(key) = config.openai_key() {
            let adapter: Arc<dyn ChatAdapter> =
                Arc::new(OpenAiAdapter::new(&config.openai.api_base, key));
            for model in &config.openai.models {
                routes.push(ModelRoute {
                    model: model.clone(),
                    kind: ProviderKind::OpenAI,
                    adapter: Some(adapter.clone()),
                });
            }
        }
        if let Some(key) = config.anthropic_key() {
            let adapter: Arc<dyn ChatAdapter> = Arc::new(AnthropicAdapter::new(
                &config.anthropic.api_base,
                key,
                config.anthropic.max_tokens,
            ));
            for model in &config.anthropic.models {
                routes.push(ModelRoute {
                    model: model.clone(),
                    kind: ProviderKind::Anthropic,
                    adapter: Some(adapter.clone()),
                });
            }
        }
        Self::new(routes)
    }

    /** \brief 是否至少有一个 Provider 可用。 */
    pub fn is_configured(&self) -> bool {
        self.routes.iter().any(|r| r.adapter.is_some())
    }

    /**
     * \brief 可用模型列表，按注册顺序；没有任何凭据时为空。
     */
    pub fn available_models(&self) -> Vec<String> {
        if !self.is_configured() {
            return Vec::new();
        }
        self.routes.iter().map(|r| r.model.clone()).collect()
    }

    pub fn is_available(&self, model: &str) -> bool {
        self.is_configured() && self.routes.iter().any(|r| r.model == model)
    }

    pub fn route(&self, model: &str) -> Option<&ModelRoute> {
        self.routes.iter().find(|r| r.model == model)
    }

    /** \brief 已配置凭据的 Provider，去重后按注册顺序。 */
    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        let mut kinds = Vec::new();
        for route in self.routes.iter().filter(|r| r.adapter.is_some()) {
            if !kinds.contains(&route.kind) {
                kinds.push(route.kind);
            }
        }
        kinds
    }

    /**
     * \brief 模型所属 Provider；未注册的模型按名称约定推断。
     */
    pub fn kind_for(&self, model: &str) -> ProviderKind {
        self.route(model)
            .map(|r| r.kind)
            .unwrap_or_else(|| ProviderKind::classify(model))
    }

    pub fn label_for(&self, model: &str) -> &'static str {
        self.kind_for(model).assistant_label()
    }
}
