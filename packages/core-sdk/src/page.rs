use crate::{
    models::{MessageRecord, Role},
    registry::ProviderRegistry,
    session::ConversationSession,
};

/**
 * \brief 展示相关的设置。
 */
#[derive(Debug, Clone)]
pub struct PageSettings {
    /** \brief 用户消息显示名 */
    pub username: String,
    /** \brief 助手显示名后附带模型名 */
    pub show_model_names: bool,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            username: "User".to_string(),
            show_model_names: false,
        }
    }
}

/**
 * \brief 将会话投影为展示记录。助手显示名取自产生该回复的模型，
 * 缺少模型记录时才退回到当前生效的模型。纯函数，不修改会话。
 */
pub fn transcript(
    session: &ConversationSession,
    registry: &ProviderRegistry,
    settings: &PageSettings,
) -> Vec<MessageRecord> {
    let fallback_model = session.effective_model(&registry.available_models());
    session
        .turns()
        .iter()
        .map(|turn| {
            let sender = match turn.role() {
                Role::Assistant => {
                    let model = turn.model().unwrap_or(&fallback_model);
                    let label = registry.label_for(model);
                    if settings.show_model_names {
                        format!("{} ({})", label, model)
                    } else {
                        label.to_string()
                    }
                }
                _ => settings.username.clone(),
            };
            MessageRecord {
                sender,
                content: turn.content().to_string(),
            }
        })
        .collect()
}

/** \brief 代码高亮与复制按钮所用的 Prism 资源 */
const PRISM_CDN: &str = "https://cdnjs.cloudflare.com/ajax/libs/prism/1.29.0";

/**
 * \brief 渲染完整页面：消息记录、模型选择与输入框。
 */
pub fn render_page(
    session: &ConversationSession,
    registry: &ProviderRegistry,
    settings: &PageSettings,
) -> String {
    let available = registry.available_models();
    let selected = session.effective_model(&available);

    let mut messages = String::new();
    for record in transcript(session, registry, settings) {
        messages.push_str(&format!(
            "<div class=\"message\"><b>{}:</b> {}</div>\n",
            escape_html(&record.sender),
            escape_html(&record.content)
        ));
    }

    let mut options = String::new();
    for model in &available {
        let marker = if *model == selected { " selected" } else { "" };
        options.push_str(&format!(
            "<option value=\"{0}\"{1}>{0}</option>\n",
            escape_html(model),
            marker
        ));
    }

    let notice = if available.is_empty() {
        "<p class=\"notice\">No API keys configured. Provide an OpenAI or Anthropic API key.</p>\n"
    } else {
        ""
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Chatterbox</title>
<link rel="stylesheet" href="{prism}/themes/prism.min.css">
<link rel="stylesheet" href="{prism}/plugins/toolbar/prism-toolbar.min.css">
</head>
<body data-username="{username}">
{notice}<div id="output"><div id="messages">
{messages}</div></div>
<form id="input-form" method="post" action="/stream">
<textarea id="command" name="command" rows="2"></textarea>
<select id="model" name="model">
{options}</select>
<button type="submit">Send</button>
</form>
<script src="{prism}/components/prism-core.min.js"></script>
<script src="{prism}/plugins/autoloader/prism-autoloader.min.js"></script>
<script src="{prism}/plugins/toolbar/prism-toolbar.min.js"></script>
<script src="{prism}/plugins/copy-to-clipboard/prism-copy-to-clipboard.min.js"></script>
<script src="/static/script.js"></script>
</body>
</html>
"#,
        prism = PRISM_CDN,
        username = escape_html(&settings.username),
        notice = notice,
        messages = messages,
        options = options,
    )
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AppConfig, models::Turn};

    fn registry() -> ProviderRegistry {
        let mut config = AppConfig::default();
        config.openai.api_key = Some("sk-test".to_string());
        config.anthropic.api_key = Some("ak-test".to_string());
        ProviderRegistry::from_config(&config)
    }

    fn record(sender: &str, content: &str) -> MessageRecord {
        MessageRecord {
            sender: sender.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_labels_come_from_turn_model() {
        let session = ConversationSession::new("claude-3-5-sonnet-latest");
        session.append(Turn::user("Hello"));
        session.append(Turn::assistant("Hi there", "gpt-4o"));
        session.append(Turn::user("Again"));
        session.append(Turn::assistant("Sure", "claude-3-5-sonnet-latest"));

        let records = transcript(&session, &registry(), &PageSettings::default());
        assert_eq!(
            records,
            vec![
                record("User", "Hello"),
                record("ChatGPT", "Hi there"),
                record("User", "Again"),
                record("Claude", "Sure"),
            ]
        );
    }

    #[test]
    fn test_show_model_names_flag() {
        let session = ConversationSession::new("gpt-4o");
        session.append(Turn::assistant("Hi", "gpt-4o"));
        let settings = PageSettings {
            username: "Ada".to_string(),
            show_model_names: true,
        };
        let records = transcript(&session, &registry(), &settings);
        assert_eq!(records, vec![record("ChatGPT (gpt-4o)", "Hi")]);
    }

    #[test]
    fn test_legacy_assistant_turn_uses_effective_model() {
        let session = ConversationSession::new("gpt-4o");
        let legacy: Turn = serde_json::from_value(serde_json::json!({
            "role": "assistant",
            "content": "old reply"
        }))
        .expect("legacy turn");
        session.append(legacy);

        let records = transcript(&session, &registry(), &PageSettings::default());
        assert_eq!(records, vec![record("ChatGPT", "old reply")]);
    }

    #[test]
    fn test_render_escapes_and_marks_selection_without_mutation() {
        let session = ConversationSession::new("not-configured");
        session.append(Turn::user("<script>alert(1)</script>"));

        let html = render_page(&session, &registry(), &PageSettings::default());
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(!html.contains("<script>alert(1)"));
        assert!(html.contains("<option value=\"gpt-4o\" selected>gpt-4o</option>"));
        assert!(html.contains("<option value=\"claude-3-5-sonnet-latest\">"));
        assert_eq!(session.selected_model(), "not-configured");
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_render_loads_client_and_highlighter() {
        let session = ConversationSession::new("gpt-4o");
        let html = render_page(&session, &registry(), &PageSettings::default());
        assert!(html.contains("<script src=\"/static/script.js\"></script>"));
        assert!(html.contains("prism-copy-to-clipboard.min.js"));
        assert!(html.contains("id=\"output\""));
        assert!(html.contains("id=\"messages\""));
    }

    #[test]
    fn test_render_without_models_shows_notice() {
        let session = ConversationSession::new("gpt-4o");
        let html = render_page(&session, &ProviderRegistry::default(), &PageSettings::default());
        assert!(html.contains("No API keys configured"));
        assert!(!html.contains("<option"));
    }
}
