//! WebSocket server backend over tokio-tungstenite

use super::{ServerTransport, ServerTransportEvent};
use crate::link::{ConnectError, SendError};
use crate::server::protocol::ProtocolError;
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Session {
    sink: WsSink,
    pump: JoinHandle<()>,
}

/// WebSocket transport, one session at a time
pub struct WsTransport {
    session: Mutex<Option<Session>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
        }
    }

    async fn teardown(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.pump.abort();
            let _ = session.sink.close().await;
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerTransport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<ServerTransportEvent>,
    ) -> Result<(), ConnectError> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConnectError::InvalidEndpoint(url.to_string()));
        }

        // Any previous session is dead weight once a new dial starts.
        self.teardown().await;

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        debug!(%url, "websocket connected");

        let (sink, mut read) = stream.split();
        let pump = tokio::spawn(async move {
            while let Some(item) = read.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if events.send(ServerTransportEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if events.send(ServerTransportEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let err = ProtocolError::NonText(e.as_bytes().len());
                            warn!(%err, "discarding undecodable binary frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket closed by peer");
                        break;
                    }
                    Ok(_) => {} // ping/pong handled by the library
                    Err(e) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            let _ = events.send(ServerTransportEvent::Closed);
        });

        *self.session.lock().await = Some(Session { sink, pump });
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), SendError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(SendError::NotConnected)?;
        session
            .sink
            .send(Message::Text(text))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }
}
