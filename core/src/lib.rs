/// Conversation sync engine
///
/// Keeps a client's one-to-one conversations consistent by combining a STOMP
/// push channel over WebSocket with the message store's HTTP history API,
/// and exposes the result to a local UI over HTTP + SSE.

pub mod aggregator;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod messenger_api;
pub mod model;
pub mod push;
pub mod read_state;
pub mod sender;
pub mod store;
pub mod transport;

pub use config::Config;
pub use engine::{ChatEngine, EngineStatus};
pub use error::{Result, SyncError};
pub use model::{ConversationSummary, EngineEvent, Message, MessageId, OutboundMessage};
pub use transport::ConnectionState;
