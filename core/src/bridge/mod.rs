//! Bridge controller — the single actor that owns both links
//!
//! All link state lives inside one task; handles talk to it over a command
//! channel and get replies over oneshots. Serial processing makes every
//! transition atomic with respect to frame forwarding and retry timers, so
//! there is no lock anywhere in the data path.

use crate::backoff::RetryDecision;
use crate::config::{BridgeConfig, ConfigStore};
use crate::frame::{Direction, Frame};
use crate::link::{ConnectError, LinkError, LinkKind, LinkState, SendError};
use crate::peripheral::{
    DiscoveryError, DiscoveryFilter, PeripheralEvent, PeripheralIdentity, PeripheralLink,
    PeripheralTransport, LINE_TERMINATOR,
};
use crate::server::protocol::{self, CommandTelemetry, DataMessage, Inbound};
use crate::server::{ServerLink, ServerTransport, ServerTransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Observable bridge activity, streamed to the embedder
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    LinkStateChanged { link: LinkKind, state: LinkState },
    FrameForwarded { direction: Direction, seq: u64 },
    FrameDropped { direction: Direction, seq: u64 },
    RetryScheduled { link: LinkKind, attempt: u32, delay: Duration },
    GaveUp { link: LinkKind, attempts: u32 },
    Warning { message: String },
}

/// Point-in-time snapshot of the whole bridge
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    pub peripheral_state: LinkState,
    pub server_state: LinkState,
    pub peripheral_identity: Option<PeripheralIdentity>,
    pub last_peripheral_error: Option<LinkError>,
    pub last_server_error: Option<LinkError>,
    pub commands_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    /// Both links connected; frames can flow end to end
    pub ready: bool,
}

enum Command {
    ConnectPeripheral {
        identity: PeripheralIdentity,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    ConnectServer {
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        link: LinkKind,
        reply: oneshot::Sender<()>,
    },
    ForceReconnect {
        link: LinkKind,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    SendCommand {
        text: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Status {
        reply: oneshot::Sender<BridgeStatus>,
    },
    Shutdown,
}

/// Cloneable handle to a running bridge controller
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    peripheral: Arc<dyn PeripheralTransport>,
}

impl BridgeHandle {
    /// Scan for nearby serial peripherals
    ///
    /// Goes straight to the transport; a scan never blocks frame
    /// forwarding or reconnect timers.
    pub async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<PeripheralIdentity>, DiscoveryError> {
        self.peripheral.discover(filter).await
    }

    pub async fn connect_peripheral(
        &self,
        identity: PeripheralIdentity,
    ) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectPeripheral { identity, reply })
            .map_err(|_| ConnectError::BridgeStopped)?;
        rx.await.map_err(|_| ConnectError::BridgeStopped)?
    }

    pub async fn connect_server(&self) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectServer { reply })
            .map_err(|_| ConnectError::BridgeStopped)?;
        rx.await.map_err(|_| ConnectError::BridgeStopped)?
    }

    /// Cleanly disconnect one link; cancels any pending retry for it
    pub async fn disconnect(&self, link: LinkKind) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { link, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Reset the retry counter and dial immediately
    pub async fn force_reconnect(&self, link: LinkKind) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceReconnect { link, reply })
            .map_err(|_| ConnectError::BridgeStopped)?;
        rx.await.map_err(|_| ConnectError::BridgeStopped)?
    }

    /// Send a command line to the peripheral, with the terminator appended
    pub async fn send_command(&self, text: impl Into<String>) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendCommand {
                text: text.into(),
                reply,
            })
            .map_err(|_| SendError::NotConnected)?;
        rx.await.map_err(|_| SendError::NotConnected)?
    }

    pub async fn status(&self) -> Result<BridgeStatus, ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .map_err(|_| ConnectError::BridgeStopped)?;
        rx.await.map_err(|_| ConnectError::BridgeStopped)
    }

    /// Stop the controller; both links are disconnected cleanly
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Spawn a bridge controller task
pub struct BridgeController;

impl BridgeController {
    pub fn spawn(
        config: BridgeConfig,
        store: Arc<dyn ConfigStore>,
        peripheral: Arc<dyn PeripheralTransport>,
        server: Arc<dyn ServerTransport>,
    ) -> (BridgeHandle, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let handle = BridgeHandle {
            commands: command_tx,
            peripheral: peripheral.clone(),
        };

        let actor = Actor {
            peripheral_link: PeripheralLink::new(peripheral),
            server_link: ServerLink::new(server, config.device_id.clone()),
            config,
            store,
            events: event_tx,
            peripheral_events: peripheral_tx,
            server_events: server_tx,
            timers: timer_tx,
            peripheral_gen: 0,
            server_gen: 0,
            peripheral_session: 0,
            server_session: 0,
            seq: 0,
            commands_sent: 0,
            frames_received: 0,
            frames_dropped: 0,
        };
        tokio::spawn(actor.run(command_rx, peripheral_rx, server_rx, timer_rx));

        (handle, event_rx)
    }
}

struct Actor {
    peripheral_link: PeripheralLink,
    server_link: ServerLink,
    config: BridgeConfig,
    store: Arc<dyn ConfigStore>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    peripheral_events: mpsc::UnboundedSender<(u64, PeripheralEvent)>,
    server_events: mpsc::UnboundedSender<(u64, ServerTransportEvent)>,
    timers: mpsc::UnboundedSender<(LinkKind, u64)>,
    /// Bumped whenever a pending retry becomes stale; ticks carrying an
    /// older generation are ignored.
    peripheral_gen: u64,
    server_gen: u64,
    /// Bumped on every connect attempt and local disconnect; transport
    /// events carry the session they came from, so a close or data frame
    /// from a superseded session can never touch the current one.
    peripheral_session: u64,
    server_session: u64,
    seq: u64,
    commands_sent: u64,
    frames_received: u64,
    frames_dropped: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peripheral_events: mpsc::UnboundedReceiver<(u64, PeripheralEvent)>,
        mut server_events: mpsc::UnboundedReceiver<(u64, ServerTransportEvent)>,
        mut timers: mpsc::UnboundedReceiver<(LinkKind, u64)>,
    ) {
        if self.config.auto_connect {
            self.auto_connect().await;
        }

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Some((session, event)) = peripheral_events.recv() => {
                    self.handle_peripheral_event(session, event).await;
                }
                Some((session, event)) = server_events.recv() => {
                    self.handle_server_event(session, event).await;
                }
                Some((link, generation)) = timers.recv() => {
                    self.handle_retry_tick(link, generation).await;
                }
                else => break,
            }
        }

        self.peripheral_link.disconnect().await;
        self.server_link.disconnect().await;
        info!("bridge controller stopped");
    }

    /// Open a fresh event channel for one connect attempt
    ///
    /// A forwarder task stamps everything the session emits with its
    /// number before it reaches the actor; the stamp is what lets the
    /// actor discard traffic from a torn-down session.
    fn peripheral_session_sender(&mut self) -> mpsc::UnboundedSender<PeripheralEvent> {
        self.peripheral_session += 1;
        let session = self.peripheral_session;
        let out = self.peripheral_events.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out.send((session, event)).is_err() {
                    return;
                }
            }
        });
        tx
    }

    fn server_session_sender(&mut self) -> mpsc::UnboundedSender<ServerTransportEvent> {
        self.server_session += 1;
        let session = self.server_session;
        let out = self.server_events.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out.send((session, event)).is_err() {
                    return;
                }
            }
        });
        tx
    }

    async fn auto_connect(&mut self) {
        let events = self.server_session_sender();
        if let Err(e) = self
            .server_link
            .connect(self.config.server_url.clone(), events)
            .await
        {
            warn!(error = %e, "startup server connect failed");
            self.server_link.begin_reconnect();
            self.schedule_retry(LinkKind::Server);
        }
        self.emit_state(LinkKind::Server);

        if let Some(identity) = self.store.last_peripheral() {
            info!(device = %identity, "reconnecting to last known peripheral");
            let events = self.peripheral_session_sender();
            if let Err(e) = self.peripheral_link.connect(identity, events).await {
                warn!(error = %e, "startup peripheral connect failed");
                self.peripheral_link.begin_reconnect();
                self.schedule_retry(LinkKind::Peripheral);
            }
            self.emit_state(LinkKind::Peripheral);
        }
    }

    /// Returns true when the actor should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ConnectPeripheral { identity, reply } => {
                self.peripheral_gen += 1;
                self.peripheral_link.reset_retry();
                let events = self.peripheral_session_sender();
                let result = self.peripheral_link.connect(identity.clone(), events).await;
                match &result {
                    Ok(()) => {
                        if let Err(e) = self.store.remember_peripheral(&identity) {
                            warn!(error = %e, "failed to persist last peripheral");
                        }
                    }
                    Err(_) => {
                        // A failed dial feeds the policy like any other
                        // lost connection; the link must not strand.
                        self.peripheral_link.begin_reconnect();
                        self.schedule_retry(LinkKind::Peripheral);
                    }
                }
                self.emit_state(LinkKind::Peripheral);
                let _ = reply.send(result);
            }
            Command::ConnectServer { reply } => {
                self.server_gen += 1;
                self.server_link.reset_retry();
                let events = self.server_session_sender();
                let result = self
                    .server_link
                    .connect(self.config.server_url.clone(), events)
                    .await;
                if result.is_err() {
                    self.server_link.begin_reconnect();
                    self.schedule_retry(LinkKind::Server);
                }
                self.emit_state(LinkKind::Server);
                let _ = reply.send(result);
            }
            Command::Disconnect { link, reply } => {
                match link {
                    LinkKind::Peripheral => {
                        self.peripheral_gen += 1;
                        self.peripheral_session += 1;
                        self.peripheral_link.disconnect().await;
                    }
                    LinkKind::Server => {
                        self.server_gen += 1;
                        self.server_session += 1;
                        self.server_link.disconnect().await;
                    }
                }
                self.emit_state(link);
                let _ = reply.send(());
            }
            Command::ForceReconnect { link, reply } => {
                let result = self.force_reconnect(link).await;
                let _ = reply.send(result);
            }
            Command::SendCommand { text, reply } => {
                let result = self.send_command(&text).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn force_reconnect(&mut self, link: LinkKind) -> Result<(), ConnectError> {
        match link {
            LinkKind::Peripheral => {
                self.peripheral_gen += 1;
                self.peripheral_link.reset_retry();
                let identity = self
                    .peripheral_link
                    .identity()
                    .cloned()
                    .ok_or(ConnectError::NoLastKnown)?;
                let events = self.peripheral_session_sender();
                let result = self.peripheral_link.connect(identity, events).await;
                if result.is_err() {
                    self.peripheral_link.begin_reconnect();
                    self.schedule_retry(LinkKind::Peripheral);
                }
                self.emit_state(LinkKind::Peripheral);
                result
            }
            LinkKind::Server => {
                self.server_gen += 1;
                self.server_link.reset_retry();
                let events = self.server_session_sender();
                let result = self
                    .server_link
                    .connect(self.config.server_url.clone(), events)
                    .await;
                if result.is_err() {
                    self.server_link.begin_reconnect();
                    self.schedule_retry(LinkKind::Server);
                }
                self.emit_state(LinkKind::Server);
                result
            }
        }
    }

    async fn send_command(&mut self, text: &str) -> Result<(), SendError> {
        let bytes = terminated(text);
        match self.peripheral_link.send(&bytes).await {
            Ok(()) => {
                self.commands_sent += 1;
                // Telemetry is best-effort; a down server never blocks the
                // command itself.
                if self.server_link.state().is_connected() {
                    let telemetry = CommandTelemetry::new(&self.config.device_id, text);
                    if let Ok(json) = serde_json::to_string(&telemetry) {
                        if let Err(e) = self.server_link.send_text(json).await {
                            warn!(error = %e, "command telemetry send failed");
                            self.handle_send_failure(LinkKind::Server, &e);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.handle_send_failure(LinkKind::Peripheral, &e);
                Err(e)
            }
        }
    }

    async fn handle_peripheral_event(&mut self, session: u64, event: PeripheralEvent) {
        if session != self.peripheral_session {
            debug!(session, "dropping event from superseded peripheral session");
            return;
        }
        match event {
            PeripheralEvent::Data(payload) => {
                let frame = self.ingress(Direction::PeripheralToServer, payload);
                self.forward_to_server(frame).await;
            }
            PeripheralEvent::Closed => self.handle_close(LinkKind::Peripheral),
        }
    }

    async fn handle_server_event(&mut self, session: u64, event: ServerTransportEvent) {
        if session != self.server_session {
            debug!(session, "dropping event from superseded server session");
            return;
        }
        match event {
            ServerTransportEvent::Message(text) => match protocol::parse_inbound(&text) {
                Inbound::Command { data } => {
                    let frame = self.ingress(Direction::ServerToPeripheral, terminated(&data));
                    self.forward_to_peripheral(frame).await;
                }
                Inbound::Registered => debug!("server registration acknowledged"),
                Inbound::ServerError { message } => {
                    warn!(%message, "server reported an error");
                    self.emit(BridgeEvent::Warning {
                        message: format!("server error: {}", message),
                    });
                }
                Inbound::Ignored => debug!("ignoring unknown server message"),
            },
            ServerTransportEvent::Closed => self.handle_close(LinkKind::Server),
        }
    }

    fn ingress(&mut self, direction: Direction, payload: Vec<u8>) -> Frame {
        self.seq += 1;
        self.frames_received += 1;
        Frame::new(self.seq, direction, payload)
    }

    async fn forward_to_server(&mut self, frame: Frame) {
        if !self.server_link.state().is_connected() {
            self.drop_frame(&frame, "server link down");
            return;
        }
        let message = DataMessage::new(&self.config.device_id, &frame.payload);
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "data message failed to serialize");
                self.drop_frame(&frame, "serialization failed");
                return;
            }
        };
        match self.server_link.send_text(json).await {
            Ok(()) => self.emit(BridgeEvent::FrameForwarded {
                direction: frame.direction,
                seq: frame.seq,
            }),
            Err(e) => {
                self.drop_frame(&frame, "server write failed");
                self.handle_send_failure(LinkKind::Server, &e);
            }
        }
    }

    async fn forward_to_peripheral(&mut self, frame: Frame) {
        if !self.peripheral_link.state().is_connected() {
            self.drop_frame(&frame, "command received but no peripheral attached");
            self.emit(BridgeEvent::Warning {
                message: "command received but no peripheral attached".to_string(),
            });
            return;
        }
        match self.peripheral_link.send(&frame.payload).await {
            Ok(()) => self.emit(BridgeEvent::FrameForwarded {
                direction: frame.direction,
                seq: frame.seq,
            }),
            Err(e) => {
                self.drop_frame(&frame, "peripheral write failed");
                self.handle_send_failure(LinkKind::Peripheral, &e);
            }
        }
    }

    fn drop_frame(&mut self, frame: &Frame, reason: &str) {
        self.frames_dropped += 1;
        debug!(frame = %frame, %reason, "frame dropped");
        self.emit(BridgeEvent::FrameDropped {
            direction: frame.direction,
            seq: frame.seq,
        });
    }

    /// A write failed on a link we believed was up: the session is gone,
    /// so take the same path as an abnormal close.
    fn handle_send_failure(&mut self, link: LinkKind, error: &SendError) {
        debug!(%link, %error, "send failure on connected link");
        self.handle_close(link);
    }

    fn handle_close(&mut self, link: LinkKind) {
        let (state, reason) = match link {
            LinkKind::Peripheral => (
                self.peripheral_link.state(),
                self.peripheral_link.classify_close(),
            ),
            LinkKind::Server => (self.server_link.state(), self.server_link.classify_close()),
        };
        // A close for a link already out of Connected is an echo of one we
        // have handled (or of a local disconnect); scheduling again would
        // double the retries.
        if state != LinkState::Connected {
            return;
        }
        match reason {
            crate::link::CloseReason::Clean => {
                debug!(%link, "clean close");
                self.emit_state(link);
            }
            crate::link::CloseReason::Abnormal => {
                info!(%link, "connection lost, scheduling reconnect");
                match link {
                    LinkKind::Peripheral => self.peripheral_link.begin_reconnect(),
                    LinkKind::Server => self.server_link.begin_reconnect(),
                }
                self.emit_state(link);
                self.schedule_retry(link);
            }
        }
    }

    fn schedule_retry(&mut self, link: LinkKind) {
        let decision = match link {
            LinkKind::Peripheral => self.peripheral_link.schedule_retry(&self.config.reconnect),
            LinkKind::Server => self.server_link.schedule_retry(&self.config.reconnect),
        };
        match decision {
            RetryDecision::RetryAfter(delay) => {
                let generation = match link {
                    LinkKind::Peripheral => {
                        self.peripheral_gen += 1;
                        self.peripheral_gen
                    }
                    LinkKind::Server => {
                        self.server_gen += 1;
                        self.server_gen
                    }
                };
                let attempt = match link {
                    LinkKind::Peripheral => self.peripheral_link.retry_attempt(),
                    LinkKind::Server => self.server_link.retry_attempt(),
                };
                self.emit(BridgeEvent::RetryScheduled {
                    link,
                    attempt,
                    delay,
                });
                let timers = self.timers.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = timers.send((link, generation));
                });
            }
            RetryDecision::GiveUp => {
                let attempts = match link {
                    LinkKind::Peripheral => {
                        self.peripheral_link.mark_given_up();
                        self.peripheral_link.retry_attempt()
                    }
                    LinkKind::Server => {
                        self.server_link.mark_given_up();
                        self.server_link.retry_attempt()
                    }
                };
                warn!(%link, attempts, "reconnect ceiling reached, giving up");
                self.emit_state(link);
                self.emit(BridgeEvent::GaveUp { link, attempts });
            }
        }
    }

    async fn handle_retry_tick(&mut self, link: LinkKind, generation: u64) {
        let (current_gen, state) = match link {
            LinkKind::Peripheral => (self.peripheral_gen, self.peripheral_link.state()),
            LinkKind::Server => (self.server_gen, self.server_link.state()),
        };
        // Stale tick: something (manual connect, disconnect, a newer
        // schedule) superseded this timer.
        if generation != current_gen || state != LinkState::Reconnecting {
            return;
        }

        let result = match link {
            LinkKind::Peripheral => match self.peripheral_link.identity().cloned() {
                Some(identity) => {
                    let events = self.peripheral_session_sender();
                    self.peripheral_link.connect(identity, events).await
                }
                None => Err(ConnectError::NoLastKnown),
            },
            LinkKind::Server => {
                let events = self.server_session_sender();
                self.server_link
                    .connect(self.config.server_url.clone(), events)
                    .await
            }
        };

        match result {
            Ok(()) => {
                info!(%link, "reconnected");
                self.emit_state(link);
            }
            Err(e) => {
                debug!(%link, error = %e, "reconnect attempt failed");
                match link {
                    LinkKind::Peripheral => self.peripheral_link.begin_reconnect(),
                    LinkKind::Server => self.server_link.begin_reconnect(),
                }
                self.schedule_retry(link);
            }
        }
    }

    fn status(&self) -> BridgeStatus {
        let peripheral_state = self.peripheral_link.state();
        let server_state = self.server_link.state();
        BridgeStatus {
            peripheral_state,
            server_state,
            peripheral_identity: self.peripheral_link.identity().cloned(),
            last_peripheral_error: self.peripheral_link.last_error().cloned(),
            last_server_error: self.server_link.last_error().cloned(),
            commands_sent: self.commands_sent,
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            ready: peripheral_state.is_connected() && server_state.is_connected(),
        }
    }

    fn emit_state(&self, link: LinkKind) {
        let state = match link {
            LinkKind::Peripheral => self.peripheral_link.state(),
            LinkKind::Server => self.server_link.state(),
        };
        self.emit(BridgeEvent::LinkStateChanged { link, state });
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }
}

/// Append the serial line terminator unless the command already carries it
fn terminated(command: &str) -> Vec<u8> {
    let mut bytes = command.as_bytes().to_vec();
    if !command.ends_with(LINE_TERMINATOR) {
        bytes.extend_from_slice(LINE_TERMINATOR.as_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_appends_crlf() {
        assert_eq!(terminated("AT"), b"AT\r\n");
        assert_eq!(terminated(""), b"\r\n");
    }

    #[test]
    fn test_terminated_does_not_double_up() {
        assert_eq!(terminated("AT\r\n"), b"AT\r\n");
    }
}
