/// Push channel plumbing: the connector seam, the STOMP codec and the WebSocket link
pub mod stomp;
pub mod ws;

use crate::error::Result;
use crate::model::OutboundMessage;
use tokio::sync::mpsc;

pub use stomp::{Command, Frame};
pub use ws::StompWsConnector;

/// Who is connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token,
        }
    }
}

/// One established, subscribed push connection.
///
/// `frames` yields the body of every frame delivered on the private topic and
/// ends when the connection is lost. Dropping the link tears the connection
/// down (unsubscribe + disconnect).
pub struct PushLink {
    pub frames: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<OutboundMessage>,
}

/// Opens push connections; the transport manager owns reconnect policy
#[async_trait::async_trait]
pub trait PushConnector: Send + Sync {
    /// Handshake, authenticate and subscribe to the user's private topic
    async fn connect(&self, credentials: &Credentials) -> Result<PushLink>;
}
