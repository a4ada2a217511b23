pub mod config;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod models;
pub mod page;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::error::RelayError;
    pub use crate::lifecycle::ShutdownHandle;
    pub use crate::models::{MessageRecord, ProviderKind, Role, Turn};
    pub use crate::registry::ProviderRegistry;
    pub use crate::relay::{Relay, RelaySettings};
    pub use crate::session::ConversationSession;
    pub use crate::{llm, server, telemetry};
}
