//! SpotHoot client library: one WebSocket shared by many request/reply calls,
//! server-pushed events, and a persisted login session.
//! Used by the `spothoot` command-line front end.

pub mod client;
pub mod config;
pub mod events;
pub mod messages;
pub(crate) mod registry;
pub mod storage;

pub use client::{ClientError, PendingReply, Proxy, ProxyOptions};
pub use config::{default_config_path, Config, ConfigError, ServerSection, SessionSection};
pub use events::{EventBus, Subscription, SERVICE_READY};
pub use messages::{InboundEnvelope, ReplyData, SessionRecord};
pub use storage::{FileStore, MemoryStore, SessionStore, StorageError, SESSION_KEY};
