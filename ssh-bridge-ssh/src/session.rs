//! A single outbound SSH session: connection establishment, authentication,
//! and the "current command" channel (exec/PTY, stdin, resize) the rest of
//! the workspace drives through [`Session`]'s methods. `russh` types stop
//! at this module's boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{decode_secret_key, PublicKey};
use russh::{Channel, ChannelMsg};
use ssh_bridge_protocol::payload::{clamp_resize, ChallengePrompt, ResultPayload, Size};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::SshAdapterError;
use crate::event::Observer;
use crate::fingerprint;

/// Validated connection parameters. Decoupled from the wire format so this
/// crate never needs to know about `ssh-bridge-protocol`'s JSON shapes for
/// anything but the few payload types the observer re-exposes verbatim.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub fingerprint: Option<String>,
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub try_keyboard: bool,
}

/// A FIFO of pending `keyboard-interactive` prompts. `respond` always
/// resolves the oldest pending one.
#[derive(Clone, Default)]
pub struct ChallengeQueue(Arc<tokio::sync::Mutex<VecDeque<oneshot::Sender<Vec<String>>>>>);

impl ChallengeQueue {
    pub fn new() -> ChallengeQueue {
        ChallengeQueue::default()
    }

    async fn push(&self, tx: oneshot::Sender<Vec<String>>) {
        self.0.lock().await.push_back(tx);
    }

    pub async fn respond(&self, responses: Vec<String>) -> bool {
        let mut queue = self.0.lock().await;
        match queue.pop_front() {
            Some(tx) => {
                let _ = tx.send(responses);
                true
            }
            None => false,
        }
    }
}

struct ClientHandler {
    expected_fingerprint: Option<String>,
    fingerprint: Arc<StdMutex<Option<String>>>,
    mismatch: Arc<StdMutex<Option<SshAdapterError>>>,
    banner: Arc<StdMutex<Option<String>>>,
    observer: Observer,
}

#[async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        match fingerprint::verify(key, self.expected_fingerprint.as_deref()) {
            Ok(actual) => {
                *self.fingerprint.lock().unwrap() = Some(actual);
                Ok(true)
            }
            Err(err) => {
                *self.mismatch.lock().unwrap() = Some(err);
                Ok(false)
            }
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        self.observer.banner(banner);
        let mut cell = self.banner.lock().unwrap();
        let mut text = cell.take().unwrap_or_default();
        text.push_str(banner);
        if !text.ends_with('\n') {
            text.push('\n');
        }
        *cell = Some(text);
        Ok(())
    }
}

enum ChannelOp {
    Data(Vec<u8>),
    Eof,
    Resize { rows: u16, cols: u16 },
    Close,
}

struct CurrentChannel {
    ops_tx: mpsc::UnboundedSender<ChannelOp>,
    pty: bool,
}

/// An established SSH session with at most one in-flight command channel:
/// a second `exec` before the first finishes simply replaces `current`.
pub struct Session {
    handle: Handle<ClientHandler>,
    observer: Observer,
    challenges: ChallengeQueue,
    reusable: Arc<AtomicBool>,
    fingerprint: String,
    size: Size,
    current: Option<CurrentChannel>,
    pending_stdin: Vec<u8>,
    pending_stdin_eof: bool,
    pending_resize: Option<(u16, u16)>,
    share_key: Option<String>,
    banner: Option<String>,
    challenge_seen: bool,
}

impl Session {
    pub async fn establish(
        params: ConnectParams,
        observer: Observer,
        challenges: ChallengeQueue,
        connect_timeout: Duration,
    ) -> Result<Session, SshAdapterError> {
        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(10)),
            keepalive_max: 3,
            ..Default::default()
        });

        let fingerprint_cell = Arc::new(StdMutex::new(None));
        let mismatch_cell = Arc::new(StdMutex::new(None));
        let banner_cell = Arc::new(StdMutex::new(None));
        let handler = ClientHandler {
            expected_fingerprint: params.fingerprint.clone(),
            fingerprint: fingerprint_cell.clone(),
            mismatch: mismatch_cell.clone(),
            banner: banner_cell.clone(),
            observer: observer.clone(),
        };

        let hostname = params.hostname.clone();
        let port = params.port;
        let connect = async move {
            let tcp = tokio::net::TcpStream::connect((hostname.as_str(), port))
                .await
                .map_err(|e| SshAdapterError::from_connect_io(&e))?;
            tcp.set_nodelay(true).map_err(|e| SshAdapterError::from_connect_io(&e))?;
            russh::client::connect_stream(config, tcp, handler).await.map_err(|e| {
                mismatch_cell
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| SshAdapterError::from_russh(e))
            })
        };

        let mut handle = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => return Err(SshAdapterError::from_connect_timeout()),
        };

        let fingerprint = fingerprint_cell
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SshAdapterError::Other("server never presented a host key".to_string()))?;

        let mut authenticated = false;
        let challenge_seen = Arc::new(AtomicBool::new(false));

        if let Some(raw_key) = params.private_key.as_ref() {
            if let Ok(key_str) = std::str::from_utf8(raw_key) {
                if let Ok(key_pair) = decode_secret_key(key_str, params.passphrase.as_deref()) {
                    let key = Arc::new(key_pair);
                    if let Ok(auth_key) = PrivateKeyWithHashAlg::new(key, None) {
                        if let Ok(result) = handle
                            .authenticate_publickey(params.username.clone(), auth_key)
                            .await
                        {
                            authenticated = result;
                        }
                    }
                }
            }
        }

        if !authenticated {
            if let Some(password) = params.password.as_ref() {
                let result = handle
                    .authenticate_password(params.username.clone(), password)
                    .await
                    .map_err(SshAdapterError::from_russh)?;
                authenticated = result;
            }
        }

        if !authenticated && params.try_keyboard {
            authenticated = Session::try_keyboard_interactive(
                &mut handle,
                &params.username,
                &observer,
                &challenges,
                &challenge_seen,
            )
            .await?;
        }

        if !authenticated {
            return Err(SshAdapterError::authentication_denied());
        }

        debug!(user = %params.username, host = %params.hostname, port = params.port, "session established");

        let banner = banner_cell.lock().unwrap().clone();

        Ok(Session {
            handle,
            observer,
            challenges,
            reusable: Arc::new(AtomicBool::new(true)),
            fingerprint,
            size: Size::default(),
            current: None,
            pending_stdin: Vec::new(),
            pending_stdin_eof: false,
            pending_resize: None,
            share_key: None,
            banner,
            challenge_seen: challenge_seen.load(Ordering::SeqCst),
        })
    }

    async fn try_keyboard_interactive(
        handle: &mut Handle<ClientHandler>,
        username: &str,
        observer: &Observer,
        challenges: &ChallengeQueue,
        challenge_seen: &Arc<AtomicBool>,
    ) -> Result<bool, SshAdapterError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username.to_string(), None)
            .await
            .map_err(SshAdapterError::from_russh)?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { name, instructions, prompts } => {
                    challenge_seen.store(true, Ordering::SeqCst);
                    let wire_prompts = prompts
                        .iter()
                        .map(|p| ChallengePrompt { prompt: p.prompt.clone(), echo: p.echo })
                        .collect();
                    observer.challenge(name, instructions, "en-US".to_string(), wire_prompts);

                    let (tx, rx) = oneshot::channel();
                    challenges.push(tx).await;
                    let responses = rx.await.map_err(|_| SshAdapterError::ClientAuthentication)?;

                    response = handle
                        .authenticate_keyboard_interactive_respond(responses)
                        .await
                        .map_err(SshAdapterError::from_russh)?;
                }
            }
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::SeqCst)
    }

    /// The banner text collected during the handshake, if the server sent
    /// one. Reported again on `reuse` since a caller who attaches to an
    /// idle session never saw the original handshake.
    pub fn banner(&self) -> Option<String> {
        self.banner.clone()
    }

    /// Whether a `keyboard-interactive` prompt fired during authentication.
    /// The pool skips caching credentials when this is true: a one-time
    /// challenge response isn't a reusable secret.
    pub fn challenge_seen(&self) -> bool {
        self.challenge_seen
    }

    pub async fn respond_to_challenge(&self, responses: Vec<String>) -> bool {
        self.challenges.respond(responses).await
    }

    /// Returns the session's share key, assigning `candidate` as the key if
    /// none has been assigned yet. Generating the candidate before calling
    /// in (rather than taking a generator closure) keeps this method
    /// object-safe for callers that hold a `Session` behind a trait object.
    pub fn share_key_or_assign(&mut self, candidate: String) -> String {
        match &self.share_key {
            Some(key) => key.clone(),
            None => {
                self.share_key = Some(candidate.clone());
                candidate
            }
        }
    }

    /// Rebind the session's event sink, used on `reuse`/`share` handoff.
    pub fn rebind_observer(&mut self, observer: Observer) {
        self.observer = observer;
    }

    pub async fn exec(&mut self, command: &str, pty: bool, observer: Observer) {
        self.observer = observer.clone();

        let channel = match self.handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(err) => {
                self.reusable.store(false, Ordering::SeqCst);
                observer.result(error_result(SshAdapterError::from_russh(err)));
                return;
            }
        };

        if pty {
            let rows = self.size.rows as u32;
            let cols = self.size.cols as u32;
            if let Err(err) = channel.request_pty(true, "xterm", cols, rows, 0, 0, &[]).await {
                self.reusable.store(false, Ordering::SeqCst);
                observer.result(error_result(SshAdapterError::from_russh(err)));
                return;
            }
        }

        if let Err(err) = channel.exec(false, command).await {
            self.reusable.store(false, Ordering::SeqCst);
            observer.result(error_result(SshAdapterError::from_russh(err)));
            return;
        }

        if !self.pending_stdin.is_empty() {
            let _ = channel.data(&self.pending_stdin[..]).await;
            self.pending_stdin.clear();
        }
        if self.pending_stdin_eof {
            let _ = channel.eof().await;
        }
        if pty {
            if let Some((rows, cols)) = self.pending_resize.take() {
                let _ = channel.window_change(cols as u32, rows as u32, 0, 0).await;
            }
        }

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        self.current = Some(CurrentChannel { ops_tx, pty });

        tokio::spawn(run_channel(channel, ops_rx, observer, self.reusable.clone()));
    }

    pub fn write_stdin(&mut self, bytes: Vec<u8>) {
        match &self.current {
            Some(current) => {
                let _ = current.ops_tx.send(ChannelOp::Data(bytes));
            }
            None => self.pending_stdin.extend(bytes),
        }
    }

    pub fn end_stdin(&mut self) {
        match &self.current {
            Some(current) => {
                let _ = current.ops_tx.send(ChannelOp::Eof);
            }
            None => self.pending_stdin_eof = true,
        }
    }

    pub fn resize(&mut self, rows: i32, cols: i32) {
        let clamped = clamp_resize(self.size, rows, cols);
        self.size = clamped;
        match &self.current {
            Some(current) if current.pty => {
                let _ = current.ops_tx.send(ChannelOp::Resize { rows: clamped.rows, cols: clamped.cols });
            }
            _ => self.pending_resize = Some((clamped.rows, clamped.cols)),
        }
    }

    /// Tear the transport down. Used for `relinquish(drop)` and for a
    /// non-reusable session falling out of `relinquish(keep)`.
    pub async fn close(mut self) {
        if let Some(current) = self.current.take() {
            let _ = current.ops_tx.send(ChannelOp::Close);
        }
        let _ = self.handle.disconnect(russh::Disconnect::ByApplication, "", "en").await;
    }
}

fn error_result(err: SshAdapterError) -> ResultPayload {
    ResultPayload { code: None, signal: None, error: Some(err.reason()) }
}

/// Renders a `russh::Sig` as the `SIG`-prefixed name SSH clients expect
/// (`"SIGTERM"`, not `Sig`'s own `"TERM"`/`Custom("USR2")` debug form).
fn sig_name(signal_name: &russh::Sig) -> String {
    let debug = format!("{signal_name:?}");
    let name = debug.strip_prefix("Custom(\"").and_then(|s| s.strip_suffix("\")")).unwrap_or(debug.as_str());
    format!("SIG{name}")
}

async fn run_channel(
    mut channel: Channel<russh::client::Msg>,
    mut ops_rx: mpsc::UnboundedReceiver<ChannelOp>,
    observer: Observer,
    reusable: Arc<AtomicBool>,
) {
    let mut result_sent = false;
    loop {
        tokio::select! {
            op = ops_rx.recv() => match op {
                Some(ChannelOp::Data(data)) => {
                    if channel.data(&data[..]).await.is_err() {
                        reusable.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                Some(ChannelOp::Eof) => {
                    let _ = channel.eof().await;
                }
                Some(ChannelOp::Resize { rows, cols }) => {
                    let _ = channel.window_change(cols as u32, rows as u32, 0, 0).await;
                }
                Some(ChannelOp::Close) | None => {
                    let _ = channel.close().await;
                    break;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => observer.stdout(data.to_vec()),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        observer.stderr(data.to_vec());
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    observer.result(ResultPayload { code: Some(exit_status as i32), signal: None, error: None });
                    result_sent = true;
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    observer.result(ResultPayload {
                        code: None,
                        signal: Some(sig_name(&signal_name)),
                        error: None,
                    });
                    result_sent = true;
                }
                Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) => {}
                Some(_) => {}
                None => {
                    if !result_sent {
                        warn!("channel closed before a result arrived");
                        reusable.store(false, Ordering::SeqCst);
                        observer.result(error_result(SshAdapterError::Other("channel closed unexpectedly".to_string())));
                    }
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn challenge_queue_resolves_oldest_first() {
        let queue = ChallengeQueue::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queue.push(tx1).await;
        queue.push(tx2).await;

        assert!(queue.respond(vec!["first".to_string()]).await);
        assert_eq!(rx1.await.unwrap(), vec!["first".to_string()]);

        assert!(queue.respond(vec!["second".to_string()]).await);
        assert_eq!(rx2.await.unwrap(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn challenge_queue_respond_with_nothing_pending_is_false() {
        let queue = ChallengeQueue::new();
        assert!(!queue.respond(vec![]).await);
    }
}
