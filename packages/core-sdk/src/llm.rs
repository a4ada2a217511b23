use anyhow::{anyhow, bail, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::pin::Pin;

use crate::models::{ProviderKind, Role, Turn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/**
 * \brief 文本增量流：有限、不可重放，可交给独立任务驱动。
 */
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/**
 * \brief Provider 适配器：把各家流式接口统一为文本增量流。
 */
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /**
     * \brief 发起流式补全。history 为已截取好的最近消息。
     * 非 2xx 响应在返回流之前即报错；流中途的错误以 Err 项结束流。
     */
    async fn stream_chat(
        &self,
        model: &str,
        history: &[Turn],
        system_prompts: &[String],
    ) -> Result<FragmentStream>;
}

/**
 * \brief OpenAI 风格接口（/v1/chat/completions）。
 */
pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiAdapter {
    pub fn new(api_base: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.api_base)
    }
}

#[async_trait]
impl ChatAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    async fn stream_chat(
        &self,
        model: &str,
        history: &[Turn],
        system_prompts: &[String],
    ) -> Result<FragmentStream> {
        let body = openai_payload(model, history, system_prompts);
        let resp = self
            .client
            .post(self.completions_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("request failed: {} -> {}", status, text));
        }

        Ok(fragment_stream(resp, parse_openai_event))
    }
}

/**
 * \brief Anthropic 风格接口（/v1/messages）。
 */
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    max_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(api_base: &str, api_key: &str, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            max_tokens,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.api_base)
    }
}

#[async_trait]
impl ChatAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn stream_chat(
        &self,
        model: &str,
        history: &[Turn],
        system_prompts: &[String],
    ) -> Result<FragmentStream> {
        let body = anthropic_payload(model, history, system_prompts, self.max_tokens);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let resp = self
            .client
            .post(self.messages_url())
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("claude request failed: {} -> {}", status, text));
        }

        Ok(fragment_stream(resp, parse_anthropic_event))
    }
}

/**
 * \brief OpenAI 请求体：系统提示词作为开头的 system 消息，其后是历史消息。
 */
pub fn openai_payload(model: &str, history: &[Turn], system_prompts: &[String]) -> Value {
    let messages: Vec<Value> = system_prompts
        .iter()
        .map(|p| json!({"role": Role::System.as_str(), "content": p}))
        .chain(
            history
                .iter()
                .map(|t| json!({"role": t.role().as_str(), "content": t.content()})),
        )
        .collect();
    json!({
        "model": model,
        "messages": messages,
        "stream": true
    })
}

/**
 * \brief Anthropic 请求体：系统提示词合并为 system 字段，消息列表不含 system 角色。
 */
pub fn anthropic_payload(
    model: &str,
    history: &[Turn],
    system_prompts: &[String],
    max_tokens: u32,
) -> Value {
    let messages: Vec<Value> = history
        .iter()
        .map(|t| json!({"role": t.role().as_str(), "content": t.content()}))
        .collect();
    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
        "stream": true
    });
    let system = system_prompts
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    body
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

/**
 * \brief SSE 分帧缓冲：以空行切分事件。
 */
#[derive(Default)]
struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let pos = find_double_newline(&self.buf)?;
            let block = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(event) = parse_block(&block) {
                return Some(event);
            }
        }
    }

    fn finish(&mut self) -> Option<SseEvent> {
        let block = std::mem::take(&mut self.buf);
        parse_block(&block)
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

enum Frame {
    Text(String),
    Skip,
    Done,
}

fn fragment_stream(resp: reqwest::Response, parse: fn(&SseEvent) -> Result<Frame>) -> FragmentStream {
    let mut body = resp.bytes_stream();
    let out = try_stream! {
        use futures_util::StreamExt;
        let mut buf = SseBuffer::default();
        let mut done = false;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buf.push(&chunk);
            while let Some(event) = buf.next_event() {
                match parse(&event)? {
                    Frame::Text(text) => {
                        yield text;
                    }
                    Frame::Skip => {}
                    Frame::Done => {
                        done = true;
                        break;
                    }
                }
            }
            if done {
                break;
            }
        }
        if !done {
            if let Some(event) = buf.finish() {
                if let Frame::Text(text) = parse(&event)? {
                    yield text;
                }
            }
        }
    };
    Box::pin(out)
}

fn parse_openai_event(event: &SseEvent) -> Result<Frame> {
    let data = event.data.trim();
    if data.is_empty() {
        return Ok(Frame::Skip);
    }
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, data, "skipping unparsable openai chunk");
            return Ok(Frame::Skip);
        }
    };
    if let Some(err) = v.get("error") {
        bail!("openai stream error: {}", error_message(err));
    }
    Ok(parse_openai_delta(&v)
        .filter(|s| !s.is_empty())
        .map(Frame::Text)
        .unwrap_or(Frame::Skip))
}

fn parse_openai_delta(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn parse_anthropic_event(event: &SseEvent) -> Result<Frame> {
    let v: Value = match serde_json::from_str(event.data.trim()) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, data = %event.data, "skipping unparsable anthropic event");
            return Ok(Frame::Skip);
        }
    };
    let kind = event
        .event
        .clone()
        .or_else(|| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or_default();
    match kind.as_str() {
        "content_block_delta" => Ok(parse_anthropic_delta(&v)
            .filter(|s| !s.is_empty())
            .map(Frame::Text)
            .unwrap_or(Frame::Skip)),
        "message_stop" => Ok(Frame::Done),
        "error" => bail!(
            "claude stream error: {}",
            error_message(v.get("error").unwrap_or(&v))
        ),
        _ => Ok(Frame::Skip),
    }
}

fn parse_anthropic_delta(v: &Value) -> Option<String> {
    let delta = v.get("delta")?;
    if delta.get("type").and_then(|t| t.as_str()) != Some("text_delta") {
        return None;
    }
    delta.get("text")?.as_str().map(|s| s.to_string())
}

fn error_message(err: &Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| err.to_string())
}
