use std::fmt;

use serde::{Deserialize, Serialize};

/**
 * \brief 消息角色。system 仅出现在发往 Provider 的请求体中，不进入会话记录。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 会话中的一轮消息，创建后不可变。
 *
 * 仅助手消息携带 model，记录产生该回复的模型。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /** \brief 角色：user/assistant */
    role: Role,
    /** \brief 内容 */
    content: String,
    /** \brief 产生回复的模型，用户消息为空 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            model: None,
        }
    }

    pub fn assistant(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            model: Some(model.into()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

/**
 * \brief Provider 类型。只有两种，路由是封闭的二选一。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
}

impl ProviderKind {
    /**
     * \brief 按模型名约定推断 Provider：包含 "gpt" 的走 OpenAI，其余走 Anthropic。
     *
     * 仅用于注册表中不存在的模型（例如历史消息的显示名）。
     */
    pub fn classify(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("gpt") {
            ProviderKind::OpenAI
        } else {
            ProviderKind::Anthropic
        }
    }

    /** \brief 助手消息的显示名。 */
    pub fn assistant_label(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "ChatGPT",
            ProviderKind::Anthropic => "Claude",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "OpenAI"),
            ProviderKind::Anthropic => write!(f, "Anthropic"),
        }
    }
}

/**
 * \brief 列表接口返回的消息记录。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /** \brief 发送者显示名 */
    pub sender: String,
    /** \brief 内容 */
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_only_on_assistant_turns() {
        let user = Turn::user("hello");
        assert_eq!(user.role(), Role::User);
        assert_eq!(user.model(), None);

        let reply = Turn::assistant("hi", "gpt-4o");
        assert_eq!(reply.role(), Role::Assistant);
        assert_eq!(reply.model(), Some("gpt-4o"));
    }

    #[test]
    fn test_turn_serialization_skips_missing_model() {
        let v = serde_json::to_value(Turn::user("hello")).expect("serialize");
        assert_eq!(v, serde_json::json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn test_classify_by_model_name() {
        assert_eq!(ProviderKind::classify("gpt-4o"), ProviderKind::OpenAI);
        assert_eq!(ProviderKind::classify("GPT-4"), ProviderKind::OpenAI);
        assert_eq!(
            ProviderKind::classify("claude-3-5-sonnet-latest"),
            ProviderKind::Anthropic
        );
        assert_eq!(ProviderKind::classify("mystery"), ProviderKind::Anthropic);
    }
}
