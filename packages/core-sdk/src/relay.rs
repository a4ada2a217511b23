use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
    config::AppConfig,
    error::RelayError,
    llm::ChatAdapter,
    models::Turn,
    registry::ProviderRegistry,
    session::ConversationSession,
    telemetry,
};

/** \brief 通道容量为 1：发送方能再次预留槽位时，上一个增量已被接收端取走。 */
const FRAGMENT_BUFFER: usize = 1;

/** \brief 转发结果项：文本增量或终止错误。 */
pub type RelayItem = Result<String, RelayError>;

/**
 * \brief 每次转发附带的提示词设置。
 */
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub system_prompts: Vec<String>,
    pub history_window: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            system_prompts: Vec::new(),
            history_window: 10,
        }
    }
}

impl From<&AppConfig> for RelaySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            system_prompts: config.system_prompts.clone(),
            history_window: config.history_window.max(1),
        }
    }
}

/**
 * \brief 转发核心：校验模型、记录用户消息、驱动上游流并在结束后提交助手消息。
 */
#[derive(Clone)]
pub struct Relay {
    session: Arc<ConversationSession>,
    registry: Arc<ProviderRegistry>,
    settings: Arc<RelaySettings>,
}

impl Relay {
    pub fn new(
        session: Arc<ConversationSession>,
        registry: Arc<ProviderRegistry>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            session,
            registry,
            settings: Arc::new(settings),
        }
    }

    pub fn session(&self) -> &Arc<ConversationSession> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /**
     * \brief 校验模型是否可用，不产生任何副作用。
     */
    pub fn validate(&self, model: &str) -> Result<(), RelayError> {
        if !self.registry.is_configured() {
            return Err(RelayError::NotConfigured);
        }
        if !self.registry.is_available(model) {
            return Err(RelayError::UnavailableModel(model.to_string()));
        }
        Ok(())
    }

    /**
     * \brief 开始一次转发。校验失败时直接返回错误且不修改会话；
     * 成功时用户消息已写入会话，返回按到达顺序产出增量的通道。
     *
     * 通道正常关闭前助手消息已提交；出现错误项或接收端提前丢弃时不提交。
     * 需在 tokio 运行时中调用。
     */
    pub fn start(&self, command: &str, model: &str) -> Result<mpsc::Receiver<RelayItem>, RelayError> {
        if let Err(err) = self.validate(model) {
            telemetry::log_error("relay", &format!("rejected model={} reason={}", model, err));
            return Err(err);
        }

        self.session.select_model(model);
        self.session.append(Turn::user(command));

        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let route = self
            .registry
            .route(model)
            .ok_or_else(|| RelayError::UnavailableModel(model.to_string()))?;

        let adapter = match route.adapter.clone() {
            Some(adapter) => adapter,
            None => {
                let err = RelayError::ProviderUnavailable(route.kind);
                telemetry::log_error("relay", &format!("model={} {}", model, err));
                let _ = tx.try_send(Err(err));
                return Ok(rx);
            }
        };

        let exchange = Exchange {
            adapter,
            session: self.session.clone(),
            model: model.to_string(),
            history: self.session.recent(self.settings.history_window),
            system_prompts: self.settings.system_prompts.clone(),
        };
        tokio::spawn(exchange.run(tx));
        Ok(rx)
    }
}

struct Exchange {
    adapter: Arc<dyn ChatAdapter>,
    session: Arc<ConversationSession>,
    model: String,
    history: Vec<Turn>,
    system_prompts: Vec<String>,
}

impl Exchange {
    async fn run(self, tx: mpsc::Sender<RelayItem>) {
        telemetry::log_event(
            "relay",
            &format!(
                "start provider={} model={} turns={}",
                self.adapter.kind(),
                self.model,
                self.history.len()
            ),
        );

        let opened = tokio::select! {
            res = self.adapter.stream_chat(&self.model, &self.history, &self.system_prompts) => res,
            _ = tx.closed() => {
                tracing::info!(model = %self.model, "client disconnected before upstream responded");
                return;
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                telemetry::log_error("relay", &format!("stream failed: {}", e));
                let _ = tx.send(Err(RelayError::Upstream(e.to_string()))).await;
                return;
            }
        };

        let mut reply = String::new();
        let mut fragments = 0usize;
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = tx.closed() => {
                    tracing::info!(model = %self.model, fragments, "client disconnected mid-stream, discarding reply");
                    return;
                }
            };
            match item {
                Some(Ok(fragment)) => {
                    reply.push_str(&fragment);
                    fragments += 1;
                    if tx.send(Ok(fragment)).await.is_err() {
                        tracing::info!(model = %self.model, fragments, "client disconnected mid-stream, discarding reply");
                        return;
                    }
                }
                Some(Err(e)) => {
                    telemetry::log_error("relay", &format!("stream error: {}", e));
                    let _ = tx.send(Err(RelayError::Upstream(e.to_string()))).await;
                    return;
                }
                None => break,
            }
        }

        // 最后一个增量被取走后才提交
        let permit = match tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::info!(model = %self.model, fragments, "client disconnected before reading the reply, discarding");
                return;
            }
        };

        telemetry::log_event(
            "relay",
            &format!(
                "commit model={} fragments={} chars={}",
                self.model,
                fragments,
                reply.chars().count()
            ),
        );
        self.session.append(Turn::assistant(reply, self.model.clone()));
        drop(permit);
    }
}
