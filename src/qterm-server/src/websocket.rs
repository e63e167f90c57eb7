//! WebSocket terminal channel.
//!
//! Each connection owns one [`Session`], one output pump and one keepalive
//! task. Inbound frames are handled one at a time, in arrival order; a
//! backend switch completes before the next frame is read.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use bytes::Bytes;
use futures::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use qterm_protocol::{BackendTarget, ClientFrame, Frame};
use qterm_session::{LineDetector, Session};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ChannelError, ChannelResult};
use crate::heartbeat;
use crate::state::AppState;
use crate::terminal_streaming::{PumpExit, PumpHandle, start_output_pump};

/// Frames queued between producers and the socket writer.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// How long a switch or teardown waits for the pump to flush and exit.
const PUMP_STOP_GRACE: Duration = Duration::from_secs(2);

/// Create WebSocket routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(websocket_handler))
}

/// Messages for the socket writer.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Ping,
}

/// Handle WebSocket upgrade.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4().to_string();
    let _guard = state.track_connection();
    info!(connection_id = %connection_id, "terminal channel connected");

    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_CHANNEL_CAPACITY);
    let token = state.shutdown_token().child_token();
    let keepalive = state.config.keepalive.clone();

    let mut sender_task = tokio::spawn(handle_sender(
        sender,
        rx,
        keepalive.write_timeout(),
        token.clone(),
    ));
    let keepalive_task =
        heartbeat::spawn_keepalive(tx.clone(), keepalive.ping_interval(), token.clone());

    let mut channel = TerminalChannel {
        id: connection_id.clone(),
        state: Arc::clone(&state),
        session: state.new_session(),
        pump: None,
        tx,
    };

    match channel.session.open_local().await {
        Ok(()) => {
            channel.start_pump();
            channel
                .run(receiver, &token, keepalive.read_deadline())
                .await;
        }
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "failed to start terminal");
            let _ = channel
                .send(Frame::diagnostic(format!("Failed to start terminal: {e}")))
                .await;
        }
    }

    // Cleanup
    keepalive_task.abort();
    channel.shutdown().await;
    drop(channel);

    // The writer drains what is queued, then sends a close frame.
    if tokio::time::timeout(keepalive.write_timeout(), &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }
    token.cancel();
    info!(connection_id = %connection_id, "terminal channel disconnected");
}

/// Handle outgoing messages.
///
/// A failed or timed-out write cancels the connection.
async fn handle_sender(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    token: CancellationToken,
) {
    loop {
        let outbound = tokio::select! {
            _ = token.cancelled() => break,
            outbound = rx.recv() => outbound,
        };

        let message = match outbound {
            Some(Outbound::Frame(frame)) => match frame.to_json() {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            },
            Some(Outbound::Ping) => Message::Ping(Bytes::new()),
            None => {
                let _ = tokio::time::timeout(write_timeout, sender.send(Message::Close(None))).await;
                break;
            }
        };

        match tokio::time::timeout(write_timeout, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "websocket write failed");
                token.cancel();
                break;
            }
            Err(_) => {
                warn!(timeout = ?write_timeout, "websocket write timed out");
                token.cancel();
                break;
            }
        }
    }
}

enum ChannelEvent {
    Cancelled,
    DeadlineExpired,
    PumpExited(PumpExit),
    Inbound(Option<Result<Message, axum::Error>>),
}

/// Per-connection state: the session and its output pump.
struct TerminalChannel {
    id: String,
    state: Arc<AppState>,
    session: Session,
    pump: Option<PumpHandle>,
    tx: mpsc::Sender<Outbound>,
}

impl TerminalChannel {
    /// Inbound loop. Returns when the connection should be torn down.
    async fn run(
        &mut self,
        mut receiver: SplitStream<WebSocket>,
        token: &CancellationToken,
        read_deadline: Duration,
    ) {
        let mut deadline = Instant::now() + read_deadline;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => ChannelEvent::Cancelled,
                exit = wait_for_pump(&mut self.pump) => ChannelEvent::PumpExited(exit),
                next = tokio::time::timeout_at(deadline, receiver.next()) => match next {
                    Ok(message) => ChannelEvent::Inbound(message),
                    Err(_) => ChannelEvent::DeadlineExpired,
                },
            };

            match event {
                ChannelEvent::Cancelled => {
                    debug!(connection_id = %self.id, "terminal channel cancelled");
                    break;
                }
                ChannelEvent::DeadlineExpired => {
                    warn!(connection_id = %self.id, deadline = ?read_deadline, "no inbound activity, closing connection");
                    break;
                }
                ChannelEvent::PumpExited(exit) => {
                    if !self.on_pump_exit(exit).await {
                        break;
                    }
                }
                ChannelEvent::Inbound(None) => break,
                ChannelEvent::Inbound(Some(Err(e))) => {
                    debug!(connection_id = %self.id, error = %e, "websocket receive error");
                    break;
                }
                ChannelEvent::Inbound(Some(Ok(message))) => {
                    deadline = Instant::now() + read_deadline;
                    if !self.on_message(message).await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the connection should close.
    async fn on_message(&mut self, message: Message) -> bool {
        let result = match message {
            Message::Text(text) => self.handle_text_message(text.as_str()).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => self.handle_text_message(text).await,
                Err(e) => {
                    warn!(connection_id = %self.id, error = %e, "discarding non-UTF-8 binary frame");
                    Ok(())
                }
            },
            // Pong is handled automatically by axum
            Message::Ping(_) | Message::Pong(_) => Ok(()),
            Message::Close(_) => {
                info!(connection_id = %self.id, "WebSocket close requested");
                return false;
            }
        };

        match result {
            Ok(()) => true,
            Err(e) if e.is_fatal() => false,
            Err(ChannelError::Protocol(e)) => {
                warn!(connection_id = %self.id, error = %e, "discarding malformed frame");
                true
            }
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "frame handling failed");
                true
            }
        }
    }

    /// Handle a text message.
    async fn handle_text_message(&mut self, text: &str) -> ChannelResult<()> {
        match ClientFrame::parse(text)? {
            ClientFrame::Input { data } => {
                if data.is_empty() {
                    return Ok(());
                }
                if let Err(e) = self.session.write(&data).await {
                    self.send(Frame::diagnostic(format!("Error: {e}"))).await?;
                }
                Ok(())
            }
            ClientFrame::Resize { cols, rows } => {
                self.session.resize(cols, rows).await?;
                debug!(connection_id = %self.id, cols, rows, "terminal resized");
                Ok(())
            }
            ClientFrame::Connect { target } => self.switch(target).await,
        }
    }

    /// Replaces the backend: stop the pump, switch, start a fresh pump.
    async fn switch(&mut self, target: BackendTarget) -> ChannelResult<()> {
        info!(connection_id = %self.id, target = %target, "switching backend");
        self.stop_pump().await;

        let result = self.session.switch_to(target).await;
        if self.session.is_active() {
            self.start_pump();
        }

        match result {
            Ok(kind) => {
                info!(connection_id = %self.id, backend = %kind, "backend switched");
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    target = %target,
                    active = ?self.session.kind(),
                    error = %e,
                    "backend switch failed"
                );
                let message = match target {
                    BackendTarget::Remote => format!("Failed to connect: {e}"),
                    BackendTarget::Local => format!("Failed to start local terminal: {e}"),
                };
                self.send(Frame::diagnostic(message)).await
            }
        }
    }

    /// Returns `false` when the connection should close.
    async fn on_pump_exit(&mut self, exit: PumpExit) -> bool {
        match exit {
            PumpExit::ChannelClosed => false,
            PumpExit::Stopped => true,
            PumpExit::Eof | PumpExit::ReadFailed(_) => {
                info!(connection_id = %self.id, exit = ?exit, "backend output ended, releasing backend");
                self.session.close().await;
                true
            }
        }
    }

    fn start_pump(&mut self) {
        let output = match self.session.take_output() {
            Ok(output) => output,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "cannot attach output pump");
                return;
            }
        };

        let signals = &self.state.config.signals;
        let detector = LineDetector::new(self.state.signal_table(), signals.max_line_len);
        self.pump = Some(start_output_pump(
            output,
            self.tx.clone(),
            detector,
            signals.placement,
            &self.state.config.stream,
        ));
    }

    async fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            match pump.stop(PUMP_STOP_GRACE).await {
                Some(exit) => debug!(connection_id = %self.id, exit = ?exit, "output pump stopped"),
                None => warn!(connection_id = %self.id, "output pump did not stop in time, aborted"),
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> ChannelResult<()> {
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Stops the pump and releases the backend.
    async fn shutdown(&mut self) {
        self.stop_pump().await;
        self.session.close().await;
    }
}

/// Resolves when the pump exits; pending forever when there is none.
async fn wait_for_pump(pump: &mut Option<PumpHandle>) -> PumpExit {
    match pump.as_mut() {
        Some(handle) => {
            let exit = handle.join().await;
            *pump = None;
            exit
        }
        None => std::future::pending().await,
    }
}
