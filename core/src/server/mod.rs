//! Server link — one persistent message connection to the relay server

use crate::backoff::{ReconnectConfig, ReconnectState, RetryDecision};
use crate::link::{CloseReason, ConnectError, LinkError, LinkState, SendError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod protocol;
#[cfg(not(target_arch = "wasm32"))]
pub mod ws;

use protocol::RegisterMessage;

/// Events a server backend streams into the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTransportEvent {
    /// One inbound text payload
    Message(String),
    /// The connection went away
    Closed,
}

/// Capability interface every server backend implements
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Open the connection and start delivering events
    async fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<ServerTransportEvent>,
    ) -> Result<(), ConnectError>;

    /// Send one text payload
    async fn send(&self, text: String) -> Result<(), SendError>;

    /// Tear down the connection; idempotent
    async fn disconnect(&self);
}

/// State machine for the one server connection the bridge owns
pub struct ServerLink {
    transport: Arc<dyn ServerTransport>,
    device_id: String,
    state: LinkState,
    endpoint: Option<String>,
    retry: ReconnectState,
    local_close: bool,
    last_error: Option<LinkError>,
}

impl ServerLink {
    pub fn new(transport: Arc<dyn ServerTransport>, device_id: impl Into<String>) -> Self {
        Self {
            transport,
            device_id: device_id.into(),
            state: LinkState::Disconnected,
            endpoint: None,
            retry: ReconnectState::new(),
            local_close: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Last endpoint a connect was attempted against
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn last_error(&self) -> Option<&LinkError> {
        self.last_error.as_ref()
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry.attempt()
    }

    /// Connect and register
    ///
    /// On transport success the `register` control message goes out
    /// immediately, fire-and-forget: a failed register write is logged but
    /// never blocks the transition to `Connected`, and the `registered`
    /// acknowledgement is informational only.
    pub async fn connect(
        &mut self,
        url: String,
        events: mpsc::UnboundedSender<ServerTransportEvent>,
    ) -> Result<(), ConnectError> {
        if self.state == LinkState::Connected {
            self.transport.disconnect().await;
        }
        self.state = LinkState::Connecting;
        self.local_close = false;
        self.endpoint = Some(url.clone());

        match self.transport.connect(&url, events).await {
            Ok(()) => {
                let register = RegisterMessage::new(&self.device_id);
                match serde_json::to_string(&register) {
                    Ok(json) => {
                        if let Err(err) = self.transport.send(json).await {
                            warn!(%err, "register message failed, continuing unregistered");
                        }
                    }
                    Err(err) => warn!(%err, "register message failed to serialize"),
                }
                self.state = LinkState::Connected;
                self.retry.reset();
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.state = LinkState::Disconnected;
                self.last_error = Some(err.clone().into());
                Err(err)
            }
        }
    }

    /// Send one serialized message, failing fast when not connected
    pub async fn send_text(&mut self, text: String) -> Result<(), SendError> {
        if !self.state.is_connected() {
            return Err(SendError::NotConnected);
        }
        match self.transport.send(text).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.last_error = Some(err.clone().into());
                Err(err)
            }
        }
    }

    /// Local, clean disconnect; idempotent
    pub async fn disconnect(&mut self) {
        self.local_close = true;
        self.transport.disconnect().await;
        self.state = LinkState::Disconnected;
    }

    /// Classify a transport close event; consumes the local-close marker
    pub fn classify_close(&mut self) -> CloseReason {
        if std::mem::take(&mut self.local_close) {
            CloseReason::Clean
        } else {
            CloseReason::Abnormal
        }
    }

    /// Enter the reconnecting state after an abnormal close
    pub fn begin_reconnect(&mut self) {
        debug!(state = %self.state, "server link entering reconnect");
        self.state = LinkState::Reconnecting;
    }

    /// Consult the reconnect policy
    pub fn schedule_retry(&mut self, config: &ReconnectConfig) -> RetryDecision {
        self.retry.schedule(config)
    }

    /// Manual reconnect request: forget accumulated attempts
    pub fn reset_retry(&mut self) {
        self.retry.reset();
        if matches!(self.last_error, Some(LinkError::GivenUp { .. })) {
            self.last_error = None;
        }
    }

    /// Ceiling reached: terminal until a manual reconnect
    pub fn mark_given_up(&mut self) {
        self.last_error = Some(LinkError::GivenUp {
            attempts: self.retry.attempt(),
        });
        self.state = LinkState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use tokio::sync::mpsc;

    const URL: &str = "ws://relay.example:8080/ws";

    #[tokio::test]
    async fn test_connect_registers_before_connected_status() {
        let transport = Arc::new(FakeServer::new());
        let mut link = ServerLink::new(transport.clone(), "bridge-1");
        let (tx, _rx) = mpsc::unbounded_channel();

        link.connect(URL.into(), tx).await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.endpoint(), Some(URL));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let register: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(register["type"], "register");
        assert_eq!(register["device_id"], "bridge-1");
        assert_eq!(register["platform"], "native");
    }

    #[tokio::test]
    async fn test_register_failure_does_not_block_connected() {
        let transport = Arc::new(FakeServer::new());
        transport.set_send_error(Some(SendError::Transport("socket reset".into())));
        let mut link = ServerLink::new(transport.clone(), "bridge-1");
        let (tx, _rx) = mpsc::unbounded_channel();

        // Fire-and-forget: the link still reaches Connected.
        link.connect(URL.into(), tx).await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_records_error() {
        let transport = Arc::new(FakeServer::new());
        transport.set_connect_error(Some(ConnectError::Unreachable("refused".into())));
        let mut link = ServerLink::new(transport, "bridge-1");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = link.connect(URL.into(), tx).await.unwrap_err();
        assert_eq!(err, ConnectError::Unreachable("refused".into()));
        assert_eq!(link.state(), LinkState::Disconnected);
        // The attempted endpoint is retained for the retry path.
        assert_eq!(link.endpoint(), Some(URL));
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_not_connected() {
        let transport = Arc::new(FakeServer::new());
        let mut link = ServerLink::new(transport.clone(), "bridge-1");

        let err = link.send_text("{}".into()).await.unwrap_err();
        assert_eq!(err, SendError::NotConnected);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_close_classification() {
        let transport = Arc::new(FakeServer::new());
        let mut link = ServerLink::new(transport, "bridge-1");
        let (tx, _rx) = mpsc::unbounded_channel();
        link.connect(URL.into(), tx).await.unwrap();

        // Remote drop without a local disconnect is abnormal.
        assert_eq!(link.classify_close(), CloseReason::Abnormal);

        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.classify_close(), CloseReason::Clean);
    }
}
