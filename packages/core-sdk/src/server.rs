use std::{future::IntoFuture, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{Form, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    config::AppConfig,
    error::RelayError,
    lifecycle::{self, ShutdownHandle},
    models::MessageRecord,
    page::{self, PageSettings},
    registry::ProviderRegistry,
    relay::{Relay, RelaySettings},
    session::ConversationSession,
    telemetry,
};

/**
 * \brief 各请求处理器共享的状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub page: Arc<PageSettings>,
    pub shutdown: ShutdownHandle,
}

impl AppState {
    pub fn new(relay: Relay, page: PageSettings, shutdown: ShutdownHandle) -> Self {
        Self {
            relay,
            page: Arc::new(page),
            shutdown,
        }
    }

    /**
     * \brief 按配置构建注册表与会话。
     */
    pub fn from_config(config: &AppConfig, shutdown: ShutdownHandle) -> Self {
        let registry = Arc::new(ProviderRegistry::from_config(config));
        let session = Arc::new(ConversationSession::new(config.default_model.clone()));
        let relay = Relay::new(session, registry, RelaySettings::from(config));
        let page = PageSettings {
            username: config.username.clone(),
            show_model_names: config.show_model_names,
        };
        Self::new(relay, page, shutdown)
    }
}

/**
 * \brief 构建路由。
 */
pub fn router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/", get(web_interface).post(web_interface))
        .route("/stream", post(stream_message))
        .route("/get-stored-messages", get(stored_messages))
        .route("/api/models", get(list_models))
        .route("/shutdown", post(shutdown))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务，直到关闭钩子触发；之后最多等待宽限期。
 */
pub async fn run(config: AppConfig, shutdown: ShutdownHandle) -> Result<()> {
    let state = AppState::from_config(&config, shutdown.clone());
    report_providers(state.relay.registry());

    let app = router(state, &config.static_dir);
    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    tokio::spawn(lifecycle::watch_signals(shutdown.clone()));

    let graceful = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait().await })
        .into_future();
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);

    tokio::select! {
        res = server => res?,
        _ = async {
            shutdown.wait().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace_secs = grace.as_secs(), "grace period elapsed, abandoning in-flight requests");
        }
    }
    tracing::info!("server stopped");
    Ok(())
}

fn report_providers(registry: &ProviderRegistry) {
    if !registry.is_configured() {
        tracing::error!(
            "No API keys found. Please provide at least one API key (OpenAI or Anthropic); every message will be rejected."
        );
        return;
    }
    let providers: Vec<String> = registry
        .configured_providers()
        .iter()
        .map(|k| k.to_string())
        .collect();
    tracing::info!(
        providers = ?providers,
        models = ?registry.available_models(),
        "providers configured"
    );
}

#[derive(Deserialize, Debug)]
struct StreamForm {
    /** \brief 用户输入 */
    command: String,
    /** \brief 选中的模型 */
    model: String,
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    models: Vec<String>,
    selected: String,
}

/**
 * \brief 渲染完整页面。
 */
async fn web_interface(State(state): State<AppState>) -> Html<String> {
    Html(page::render_page(
        state.relay.session(),
        state.relay.registry(),
        &state.page,
    ))
}

/**
 * \brief 发送消息并以分块纯文本流式返回回复。
 */
async fn stream_message(State(state): State<AppState>, Form(form): Form<StreamForm>) -> Response {
    let rx = match state.relay.start(&form.command, &form.model) {
        Ok(rx) => rx,
        Err(err) => return rejection(err).into_response(),
    };

    let body = ReceiverStream::new(rx).map(|item| match item {
        Ok(fragment) => Ok(Bytes::from(fragment)),
        Err(err @ RelayError::ProviderUnavailable(_)) => Ok(Bytes::from(format!("Error: {}", err))),
        Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())),
    });

    (
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response()
}

/**
 * \brief 以 JSON 列出当前会话消息。
 */
async fn stored_messages(State(state): State<AppState>) -> Json<Vec<MessageRecord>> {
    Json(page::transcript(
        state.relay.session(),
        state.relay.registry(),
        &state.page,
    ))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.relay.registry().available_models();
    let selected = state.relay.session().effective_model(&models);
    Json(ModelsResponse { models, selected })
}

/**
 * \brief 关闭服务。重复调用同样返回成功。
 */
async fn shutdown(State(state): State<AppState>) -> &'static str {
    if state.shutdown.trigger("http") {
        telemetry::log_event("server.lifecycle", "shutdown requested over http");
    }
    "Server shutting down..."
}

fn rejection(err: RelayError) -> (StatusCode, String) {
    match err {
        RelayError::UnavailableModel(_) => (
            StatusCode::BAD_REQUEST,
            "Error: Selected model is not available.".to_string(),
        ),
        RelayError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, format!("Error: {}", err)),
        other => internal_err(other),
    }
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        llm::ChatAdapter,
        models::{ProviderKind, Turn},
        relay::tests::{relay_with, route, ScriptedAdapter},
    };
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app_with(relay: Relay) -> (Router, AppState) {
        let state = AppState::new(relay, PageSettings::default(), ShutdownHandle::new());
        (router(state.clone(), Path::new("/nonexistent/static")), state)
    }

    fn scenario_relay() -> Relay {
        let openai: Arc<dyn ChatAdapter> =
            Arc::new(ScriptedAdapter::new(ProviderKind::OpenAI, &["Hi", " there"]));
        let anthropic: Arc<dyn ChatAdapter> =
            Arc::new(ScriptedAdapter::new(ProviderKind::Anthropic, &["Hello", "!"]));
        relay_with(vec![
            route("gpt-4o", Some(openai)),
            route("claude-3-5-sonnet-latest", Some(anthropic)),
        ])
    }

    fn form_request(command: &str, model: &str) -> Request<Body> {
        let body = format!("command={}&model={}", command, model);
        Request::builder()
            .method(Method::POST)
            .uri("/stream")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn test_stream_then_list_scenario() {
        let (app, state) = app_with(scenario_relay());

        let resp = app
            .clone()
            .oneshot(form_request("Hello", "gpt-4o"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Hi there");

        assert_eq!(
            state.relay.session().turns(),
            vec![Turn::user("Hello"), Turn::assistant("Hi there", "gpt-4o")]
        );

        let resp = app
            .oneshot(get("/get-stored-messages"))
            .await
            .expect("response");
        let listed: serde_json::Value =
            serde_json::from_str(&body_text(resp).await).expect("json");
        assert_eq!(
            listed,
            serde_json::json!([
                {"sender": "User", "content": "Hello"},
                {"sender": "ChatGPT", "content": "Hi there"}
            ])
        );
    }

    #[tokio::test]
    async fn test_invalid_model_rejected() {
        let (app, state) = app_with(scenario_relay());
        let resp = app
            .oneshot(form_request("X", "not-a-model"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(resp).await,
            "Error: Selected model is not available."
        );
        assert!(state.relay.session().is_empty());
    }

    #[tokio::test]
    async fn test_no_credentials_rejected_as_unavailable_service() {
        let (app, state) = app_with(relay_with(vec![route("gpt-4o", None)]));
        let resp = app
            .oneshot(form_request("Hello", "gpt-4o"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.relay.session().is_empty());
    }

    #[tokio::test]
    async fn test_provider_without_credential_streams_error_fragment() {
        let openai: Arc<dyn ChatAdapter> =
            Arc::new(ScriptedAdapter::new(ProviderKind::OpenAI, &["Hi"]));
        let (app, state) = app_with(relay_with(vec![
            route("gpt-4o", Some(openai)),
            route("claude-3-5-sonnet-latest", None),
        ]));

        let resp = app
            .oneshot(form_request("Hello", "claude-3-5-sonnet-latest"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_text(resp).await,
            "Error: Anthropic API key is not available."
        );
        assert_eq!(state.relay.session().turns(), vec![Turn::user("Hello")]);
    }

    #[tokio::test]
    async fn test_upstream_failure_aborts_body() {
        let mut adapter = ScriptedAdapter::new(ProviderKind::OpenAI, &["partial"]);
        adapter.items.push(Err("boom".to_string()));
        let adapter: Arc<dyn ChatAdapter> = Arc::new(adapter);
        let (app, state) = app_with(relay_with(vec![route("gpt-4o", Some(adapter))]));

        let resp = app
            .oneshot(form_request("Hello", "gpt-4o"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let result = axum::body::to_bytes(resp.into_body(), usize::MAX).await;
        assert!(result.is_err());
        assert_eq!(state.relay.session().len(), 1);
    }

    #[tokio::test]
    async fn test_listing_after_several_exchanges() {
        let (app, _state) = app_with(scenario_relay());
        for (command, model) in [
            ("one", "gpt-4o"),
            ("two", "claude-3-5-sonnet-latest"),
            ("three", "gpt-4o"),
        ] {
            let resp = app
                .clone()
                .oneshot(form_request(command, model))
                .await
                .expect("response");
            body_text(resp).await;
        }

        let resp = app
            .oneshot(get("/get-stored-messages"))
            .await
            .expect("response");
        let listed: Vec<MessageRecord> =
            serde_json::from_str(&body_text(resp).await).expect("json");
        let senders: Vec<&str> = listed.iter().map(|r| r.sender.as_str()).collect();
        assert_eq!(
            senders,
            vec!["User", "ChatGPT", "User", "Claude", "User", "ChatGPT"]
        );
        assert_eq!(listed[3].content, "Hello!");
        assert_eq!(listed[4].content, "three");
    }

    #[tokio::test]
    async fn test_page_renders_for_get_and_post() {
        let (app, state) = app_with(scenario_relay());
        state.relay.session().append(Turn::user("Hello"));
        state
            .relay
            .session()
            .append(Turn::assistant("Hi there", "gpt-4o"));

        let resp = app.clone().oneshot(get("/")).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains("<b>User:</b> Hello"));
        assert!(html.contains("<b>ChatGPT:</b> Hi there"));
        assert!(html.contains("<option value=\"claude-3-5-sonnet-latest\" selected>"));

        let post = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(post).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.relay.session().selected_model(),
            "claude-3-5-sonnet-latest"
        );
    }

    #[tokio::test]
    async fn test_models_endpoint() {
        let (app, _state) = app_with(scenario_relay());
        let resp = app.oneshot(get("/api/models")).await.expect("response");
        let v: serde_json::Value = serde_json::from_str(&body_text(resp).await).expect("json");
        assert_eq!(
            v,
            serde_json::json!({
                "models": ["gpt-4o", "claude-3-5-sonnet-latest"],
                "selected": "claude-3-5-sonnet-latest"
            })
        );
    }

    #[tokio::test]
    async fn test_shutdown_twice_succeeds() {
        let (app, state) = app_with(scenario_relay());
        for _ in 0..2 {
            let req = Request::builder()
                .method(Method::POST)
                .uri("/shutdown")
                .body(Body::empty())
                .expect("request");
            let resp = app.clone().oneshot(req).await.expect("response");
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_text(resp).await, "Server shutting down...");
        }
        assert!(state.shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let handle = ShutdownHandle::new();
        let server = tokio::spawn(run(config, handle.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger("test");
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server stopped")
            .expect("join")
            .expect("run ok");
    }
}
