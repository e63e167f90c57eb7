//! Remote backend: an interactive shell over SSH.
//!
//! After the handshake, a driver task owns the SSH channel. Channel data
//! (stdout and stderr, in arrival order) flows to an [`OutputStream`];
//! writes and window changes are sent to the driver as commands.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use russh_keys::PublicKeyBase64;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::OutputStream;
use crate::config::RemoteTarget;
use crate::error::SessionError;
use crate::trust::{HostKey, HostKeyStore, TrustError, TrustPolicy, canonical_host};

/// Terminal type requested for remote shells.
pub const REMOTE_TERM: &str = "xterm-256color";

const REMOTE_COLS: u16 = 80;
const REMOTE_ROWS: u16 = 24;
const TERMINAL_SPEED: u32 = 14400;

const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// How long `close` waits for the driver to send EOF before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type CommandReply = oneshot::Sender<Result<(), russh::Error>>;

enum RemoteCommand {
    Data { data: Vec<u8>, reply: CommandReply },
    Resize { cols: u16, rows: u16, reply: CommandReply },
}

/// SSH client handler that checks host keys against a [`HostKeyStore`].
pub struct TrustingHandler {
    host: String,
    store: Arc<dyn HostKeyStore>,
    policy: TrustPolicy,
    // russh reports a rejected key as a generic error; keep the real cause.
    rejection: Arc<Mutex<Option<TrustError>>>,
}

#[async_trait]
impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let key = HostKey::new(server_public_key.name(), server_public_key.public_key_bytes());
        match self.store.verify(&self.host, &key, self.policy) {
            Ok(outcome) => {
                debug!(host = %self.host, outcome = ?outcome, "host key accepted");
                Ok(true)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "host key rejected");
                *self.rejection.lock() = Some(e);
                Ok(false)
            }
        }
    }
}

/// A failed handshake is a trust failure when the handler rejected the host key.
fn handshake_error(
    rejection: &Mutex<Option<TrustError>>,
    addr: &str,
    error: russh::Error,
) -> SessionError {
    match rejection.lock().take() {
        Some(trust) => trust.into(),
        None => SessionError::Dial {
            addr: addr.to_string(),
            reason: error.to_string(),
        },
    }
}

/// An interactive shell on a remote host.
pub struct RemoteBackend {
    handle: Handle<TrustingHandler>,
    commands: Option<mpsc::Sender<RemoteCommand>>,
    pub(super) output: Option<OutputStream>,
    driver: JoinHandle<()>,
    dimensions: (u16, u16),
    address: String,
    closed: bool,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("address", &self.address)
            .field("dimensions", &self.dimensions)
            .field("closed", &self.closed)
            .finish()
    }
}

impl RemoteBackend {
    /// Authenticates with the target's private key and starts a login shell
    /// on an 80x24 `xterm-256color` PTY.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Credential`] if the key cannot be read or parsed
    /// - [`SessionError::Trust`] if host key verification rejects the host
    /// - [`SessionError::Dial`] on network, handshake or authentication failure
    /// - [`SessionError::ShellStart`] if the channel, PTY or shell is refused
    pub async fn connect(
        target: &RemoteTarget,
        store: Arc<dyn HostKeyStore>,
        policy: TrustPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let address = target.address();
        if !target.is_configured() {
            return Err(SessionError::Dial {
                addr: address,
                reason: "no remote host configured".to_string(),
            });
        }

        let key_path = target.resolved_key_path();
        let key_text = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|e| SessionError::Credential {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
        let key_pair = russh_keys::decode_secret_key(&key_text, None).map_err(|e| {
            SessionError::Credential {
                path: key_path.clone(),
                reason: format!("failed to parse private key: {e}"),
            }
        })?;

        let rejection = Arc::new(Mutex::new(None));
        let handler = TrustingHandler {
            host: canonical_host(&target.host, target.port),
            store,
            policy,
            rejection: Arc::clone(&rejection),
        };
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        info!(addr = %address, user = %target.username, "connecting to remote host");
        let dial_error = |reason: String| SessionError::Dial {
            addr: address.clone(),
            reason,
        };

        let connected = tokio::time::timeout(
            connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), handler),
        )
        .await;
        let mut handle = match connected {
            Err(_) => return Err(dial_error(format!("timed out after {connect_timeout:?}"))),
            Ok(Err(e)) => return Err(handshake_error(&rejection, &address, e)),
            Ok(Ok(handle)) => handle,
        };

        let authenticated = tokio::time::timeout(
            connect_timeout,
            handle.authenticate_publickey(target.username.as_str(), Arc::new(key_pair)),
        )
        .await;
        let failure = match authenticated {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(dial_error(format!(
                "public key authentication rejected for {}",
                target.username
            ))),
            Ok(Err(e)) => Some(dial_error(e.to_string())),
            Err(_) => Some(dial_error("authentication timed out".to_string())),
        };
        if let Some(err) = failure {
            disconnect(&handle, &address).await;
            return Err(err);
        }
        debug!(addr = %address, "SSH authentication succeeded");

        let started = tokio::time::timeout(connect_timeout, start_shell(&handle)).await;
        let (channel, early_output) = match started {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                disconnect(&handle, &address).await;
                return Err(e);
            }
            Err(_) => {
                disconnect(&handle, &address).await;
                return Err(SessionError::ShellStart(
                    "timed out waiting for the remote shell".to_string(),
                ));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let driver = tokio::spawn(drive_channel(channel, command_rx, output_tx, early_output));

        info!(addr = %address, "remote shell started");
        Ok(Self {
            handle,
            commands: Some(command_tx),
            output: Some(OutputStream::new(output_rx)),
            driver,
            dimensions: (REMOTE_COLS, REMOTE_ROWS),
            address,
            closed: false,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(RemoteCommand::Data {
            data: data.to_vec(),
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| channel_closed())?
            .map_err(io::Error::other)?;
        Ok(data.len())
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(RemoteCommand::Resize { cols, rows, reply }).await?;
        response
            .await
            .map_err(|_| channel_closed())?
            .map_err(io::Error::other)?;
        self.dimensions = (cols, rows);
        debug!(cols, rows, "remote window changed");
        Ok(())
    }

    pub fn dimensions(&self) -> (u16, u16) {
        self.dimensions
    }

    /// Ends the shell and disconnects. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Dropping the command sender tells the driver to send EOF and exit.
        self.commands.take();
        if tokio::time::timeout(CLOSE_GRACE, &mut self.driver)
            .await
            .is_err()
        {
            self.driver.abort();
        }
        disconnect(&self.handle, &self.address).await;
        info!(addr = %self.address, "remote backend closed");
    }

    async fn send(&self, command: RemoteCommand) -> Result<(), SessionError> {
        let commands = self.commands.as_ref().ok_or_else(channel_closed)?;
        commands.send(command).await.map_err(|_| channel_closed())
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn channel_closed() -> SessionError {
    io::Error::new(io::ErrorKind::BrokenPipe, "remote channel closed").into()
}

async fn disconnect(handle: &Handle<TrustingHandler>, address: &str) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        debug!(addr = %address, error = %e, "SSH disconnect failed");
    }
}

/// Opens a session channel, requests the PTY and starts the shell.
///
/// Output that arrives before the shell request is acknowledged is returned
/// so the driver can deliver it first.
async fn start_shell(
    handle: &Handle<TrustingHandler>,
) -> Result<(Channel<client::Msg>, Vec<Bytes>), SessionError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SessionError::ShellStart(format!("failed to create SSH session: {e}")))?;
    let mut early_output = Vec::new();

    let modes = [
        (Pty::ECHO, 1),
        (Pty::TTY_OP_ISPEED, TERMINAL_SPEED),
        (Pty::TTY_OP_OSPEED, TERMINAL_SPEED),
    ];
    channel
        .request_pty(
            true,
            REMOTE_TERM,
            u32::from(REMOTE_COLS),
            u32::from(REMOTE_ROWS),
            0,
            0,
            &modes,
        )
        .await
        .map_err(|e| SessionError::ShellStart(format!("failed to request PTY: {e}")))?;
    await_reply(&mut channel, &mut early_output, "PTY").await?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| SessionError::ShellStart(format!("failed to start shell: {e}")))?;
    await_reply(&mut channel, &mut early_output, "shell").await?;

    Ok((channel, early_output))
}

async fn await_reply(
    channel: &mut Channel<client::Msg>,
    early_output: &mut Vec<Bytes>,
    request: &str,
) -> Result<(), SessionError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(SessionError::ShellStart(format!(
                    "remote host refused the {request} request"
                )));
            }
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                early_output.push(Bytes::copy_from_slice(&data));
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(SessionError::ShellStart(format!(
                    "channel closed while waiting for the {request} request"
                )));
            }
            Some(_) => {}
        }
    }
}

enum DriverEvent {
    Channel(Option<ChannelMsg>),
    Command(Option<RemoteCommand>),
}

async fn drive_channel(
    mut channel: Channel<client::Msg>,
    mut commands: mpsc::Receiver<RemoteCommand>,
    output: mpsc::Sender<io::Result<Bytes>>,
    early_output: Vec<Bytes>,
) {
    for chunk in early_output {
        if output.send(Ok(chunk)).await.is_err() {
            return;
        }
    }

    loop {
        let event = tokio::select! {
            msg = channel.wait() => DriverEvent::Channel(msg),
            command = commands.recv() => DriverEvent::Command(command),
        };

        match event {
            DriverEvent::Channel(Some(ChannelMsg::Data { data }))
            | DriverEvent::Channel(Some(ChannelMsg::ExtendedData { data, .. })) => {
                if output
                    .send(Ok(Bytes::copy_from_slice(&data)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            DriverEvent::Channel(Some(ChannelMsg::ExitStatus { exit_status })) => {
                debug!(exit_status, "remote shell exited");
            }
            DriverEvent::Channel(Some(ChannelMsg::Close)) | DriverEvent::Channel(None) => break,
            DriverEvent::Channel(Some(_)) => {}
            DriverEvent::Command(Some(RemoteCommand::Data { data, reply })) => {
                let _ = reply.send(channel.data(&data[..]).await);
            }
            DriverEvent::Command(Some(RemoteCommand::Resize { cols, rows, reply })) => {
                let result = channel
                    .window_change(u32::from(cols), u32::from(rows), 0, 0)
                    .await;
                let _ = reply.send(result);
            }
            DriverEvent::Command(None) => {
                let _ = channel.eof().await;
                let _ = channel.close().await;
                break;
            }
        }
    }
    debug!("remote channel driver finished");
}
