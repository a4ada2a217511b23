use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use chatterbox_core_sdk::{
    config::AppConfig,
    lifecycle::ShutdownHandle,
    registry::ProviderRegistry,
    relay::{Relay, RelaySettings},
    server,
    session::ConversationSession,
    telemetry,
};

/**
 * \brief CLI 程序入口：启动网页聊天服务，或在终端完成一次对话。
 */
#[derive(Parser, Debug)]
#[command(name = "chatterbox", version, about = "Single-user web chat relay for OpenAI and Anthropic models")]
struct Cli {
    /** \brief 配置文件路径，不存在时使用默认配置 */
    #[arg(short, long, global = true, default_value = "chatterbox.yaml")]
    config: PathBuf,

    /** \brief 日志级别，覆盖 RUST_LOG */
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /** \brief 开启事件日志文件，覆盖配置中的 telemetry.enabled */
    #[arg(long, global = true)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务并提供聊天页面。
     */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 发送一条用户消息并流式显示模型回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
    },

    /**
     * \brief 列出可用模型。
     */
    Models,

    /**
     * \brief 校验配置并报告已配置的 Provider。
     */
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("load config {} failed", cli.config.display()))?;
    telemetry::configure(&config.telemetry);
    if cli.telemetry {
        telemetry::set_enabled(true);
    }
    tracing::debug!(path = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                let (host, port) = addr
                    .rsplit_once(':')
                    .context("addr must look like HOST:PORT")?;
                config.server.host = host.to_string();
                config.server.port = port.parse().context("invalid port")?;
            }
            server::run(config, ShutdownHandle::new()).await?;
        }
        Commands::Chat { prompt, model } => {
            let registry = Arc::new(ProviderRegistry::from_config(&config));
            let session = Arc::new(ConversationSession::new(config.default_model.clone()));
            let model = model.unwrap_or_else(|| {
                session.effective_model(&registry.available_models())
            });
            let relay = Relay::new(session, registry, RelaySettings::from(&config));

            let mut rx = relay.start(&prompt, &model).context("send message failed")?;
            while let Some(item) = rx.recv().await {
                let delta = item.context("stream error")?;
                print!("{}", delta);
                std::io::stdout().flush().ok();
            }
            println!();
        }
        Commands::Models => {
            let registry = ProviderRegistry::from_config(&config);
            let models = registry.available_models();
            if models.is_empty() {
                bail!("no models available: configure OPENAI_API_KEY or ANTHROPIC_API_KEY");
            }
            let session = ConversationSession::new(config.default_model.clone());
            let selected = session.effective_model(&models);
            for model in models {
                let marker = if model == selected { "*" } else { " " };
                println!("{} {} ({})", marker, model, registry.kind_for(&model));
            }
        }
        Commands::CheckConfig => {
            println!("Config: {}", cli.config.display());
            println!("Listen: {}", config.server.addr());
            println!("Username: {}", config.username);
            println!("Telemetry: {}", if telemetry::is_enabled() { "on" } else { "off" });
            if !config.has_credentials() {
                bail!("No API keys found. Please provide at least one API key (OpenAI or Anthropic).");
            }
            let registry = ProviderRegistry::from_config(&config);
            let providers: Vec<String> = registry
                .configured_providers()
                .iter()
                .map(|k| k.to_string())
                .collect();
            println!("Available APIs: {}", providers.join(", "));
            println!("Available models: {}", registry.available_models().join(", "));
        }
    }

    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
