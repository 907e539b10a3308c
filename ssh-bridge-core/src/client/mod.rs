//! The caller-side state machine (§4.6): a background task owns the socket
//! and the state alphabet {Initial, Connecting, Ready, Executing, Errored};
//! `Client`'s methods are thin request/reply handles into it so a caller
//! can stream `exec` output while resize/close remain usable concurrently.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use ssh_bridge_protocol::frame::{Frame, Tag};
use ssh_bridge_protocol::payload::{
    self, ChallengePrompt, ConnectParamsWire, ReasonPayload, ResizePayload, ReuseParamsWire, Size,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{AlreadyClosed, TerminalError};
use crate::framing::{json_frame, write_frame, FrameReader};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("client is closed (previously: {0})")]
    AlreadyClosed(TerminalError),
    #[error("{0}")]
    Misuse(String),
}

impl From<AlreadyClosed> for ClientError {
    fn from(err: AlreadyClosed) -> ClientError {
        ClientError::AlreadyClosed(err.previous)
    }
}

/// Connection parameters for `Client::connect`. `private_key`, if present,
/// is always sent base64-encoded regardless of its contents.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub fingerprint: Option<String>,
    pub reusable: bool,
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub try_keyboard: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReuseRequest {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub share_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub title: String,
    pub instructions: String,
    pub language: String,
    pub prompts: Vec<ChallengePrompt>,
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub fingerprint: String,
    pub banner: Option<String>,
}

/// Resolved when `RESULT` arrives. An `error` field in the frame surfaces
/// here as `Err(SshError)` rather than a normal completion.
pub type ExecResult = Result<payload::ResultPayload, ClientError>;

pub struct ExecOutcome {
    pub stdin: StdinHandle,
    pub stdout: mpsc::UnboundedReceiver<Vec<u8>>,
    pub stderr: mpsc::UnboundedReceiver<Vec<u8>>,
    pub result: oneshot::Receiver<ExecResult>,
}

#[derive(Clone)]
pub struct StdinHandle(mpsc::UnboundedSender<Vec<u8>>);

impl StdinHandle {
    pub fn write(&self, bytes: Vec<u8>) {
        let _ = self.0.send(bytes);
    }

    /// Sends the zero-length frame that signals EOF to the remote command.
    pub fn end(&self) {
        let _ = self.0.send(Vec::new());
    }
}

type ChallengeFuture = Pin<Box<dyn Future<Output = Option<Vec<String>>> + Send>>;
pub type ChallengeHandler = Box<dyn FnMut(Challenge) -> ChallengeFuture + Send>;

enum Request {
    Connect {
        request: ConnectRequest,
        challenge_handler: Option<ChallengeHandler>,
        reply: oneshot::Sender<Result<ConnectOutcome, ClientError>>,
    },
    Reuse {
        request: ReuseRequest,
        reply: oneshot::Sender<Result<ConnectOutcome, ClientError>>,
    },
    Exec {
        command: String,
        pty: bool,
        reply: oneshot::Sender<Result<ExecOutcome, ClientError>>,
    },
    Share {
        reply: oneshot::Sender<Result<String, ClientError>>,
    },
    Resize {
        rows: i32,
        cols: i32,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    ChallengeAnswered {
        attempt: u64,
        responses: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Connecting,
    Ready,
    Executing,
    Errored,
}

enum Pending {
    Connect { reply: oneshot::Sender<Result<ConnectOutcome, ClientError>> },
    Reuse { reply: oneshot::Sender<Result<ConnectOutcome, ClientError>> },
    Share { reply: oneshot::Sender<Result<String, ClientError>> },
    Exec { result: oneshot::Sender<ExecResult> },
}

/// Handle to a live caller-side session. Cloning is not supported — a
/// client owns exactly one socket — but the handle is cheap to pass by
/// reference since every method goes through the background actor.
pub struct Client {
    requests: mpsc::UnboundedSender<Request>,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Spawns the background actor over `stream` and returns a handle to it.
    pub fn spawn<S>(stream: S) -> Client
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let actor = Actor::new(stream, requests_rx, requests_tx.clone(), closed.clone());
        tokio::spawn(actor.run());
        Client { requests: requests_tx, closed }
    }

    pub async fn connect(
        &self,
        request: ConnectRequest,
        challenge_handler: Option<ChallengeHandler>,
    ) -> Result<ConnectOutcome, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Connect { request, challenge_handler, reply }, rx).await
    }

    pub async fn reuse(&self, request: ReuseRequest) -> Result<ConnectOutcome, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Reuse { request, reply }, rx).await
    }

    pub async fn exec(&self, command: impl Into<String>, pty: bool) -> Result<ExecOutcome, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Exec { command: command.into(), pty, reply }, rx).await
    }

    pub async fn share(&self) -> Result<String, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Share { reply }, rx).await
    }

    pub fn resize(&self, rows: i32, cols: i32) {
        let _ = self.requests.send(Request::Resize { rows, cols });
    }

    /// Transitions to Errored, cancels the pending operation with a
    /// `Closed` error, and resolves once the socket is fully shut down.
    /// Never rejects.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Close { reply }).is_ok() {
            let _ = rx.await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send<T>(&self, request: Request, rx: oneshot::Receiver<Result<T, ClientError>>) -> Result<T, ClientError> {
        if self.requests.send(request).is_err() {
            return Err(ClientError::Terminal(TerminalError::NoDaemon));
        }
        rx.await.unwrap_or(Err(ClientError::Terminal(TerminalError::NoDaemon)))
    }
}

struct Actor<S> {
    reader: Option<FrameReader<tokio::io::ReadHalf<S>>>,
    writer: tokio::io::WriteHalf<S>,
    requests: mpsc::UnboundedReceiver<Request>,
    self_tx: mpsc::UnboundedSender<Request>,
    closed: Arc<AtomicBool>,
    state: State,
    window: Size,
    attempt: u64,
    stashed_error: Option<TerminalError>,
    error_reported: bool,
    pending: Option<Pending>,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stdin_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    stdout_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stderr_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    challenge_handler: Option<ChallengeHandler>,
    close_reply: Option<oneshot::Sender<()>>,
}

impl<S> Actor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(
        stream: S,
        requests: mpsc::UnboundedReceiver<Request>,
        self_tx: mpsc::UnboundedSender<Request>,
        closed: Arc<AtomicBool>,
    ) -> Actor<S> {
        let (read_half, write_half) = tokio::io::split(stream);
        Actor {
            reader: Some(FrameReader::new(read_half)),
            writer: write_half,
            requests,
            self_tx,
            closed,
            state: State::Initial,
            window: Size::default(),
            attempt: 0,
            stashed_error: None,
            error_reported: false,
            pending: None,
            stdin_tx: None,
            stdin_rx: None,
            stdout_tx: None,
            stderr_tx: None,
            challenge_handler: None,
            close_reply: None,
        }
    }

    async fn run(mut self) {
        loop {
            let stdin_recv = self.stdin_rx.as_mut();
            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle_request(request).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = Self::read_next(&mut self.reader), if self.reader.is_some() => {
                    match frame {
                        Some(Ok(Some(frame))) => self.handle_frame(frame).await,
                        Some(Ok(None)) => self.handle_disconnect(TerminalError::NoDaemon).await,
                        Some(Err(err)) => {
                            self.handle_disconnect(TerminalError::ProtocolError(err.to_string())).await;
                        }
                        None => unreachable!("guarded by reader.is_some()"),
                    }
                }
                Some(bytes) = Self::recv_stdin(stdin_recv), if self.state == State::Executing => {
                    if write_frame(&mut self.writer, Frame::new(Tag::Stdin, bytes)).await.is_err() {
                        self.handle_disconnect(TerminalError::NoDaemon).await;
                    }
                }
            }
        }
        let _ = self.writer.shutdown().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(());
        }
    }

    async fn read_next(
        reader: &mut Option<FrameReader<tokio::io::ReadHalf<S>>>,
    ) -> Option<anyhow::Result<Option<Frame>>> {
        match reader {
            Some(r) => Some(r.next().await),
            None => None,
        }
    }

    async fn recv_stdin(rx: Option<&mut mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
        match rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Returns `true` once the actor should stop running.
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Connect { request, challenge_handler, reply } => {
                if let Some(err) = self.take_stashed_for_next_call() {
                    let _ = reply.send(Err(err));
                    return false;
                }
                if self.state != State::Initial {
                    let _ = reply.send(Err(ClientError::Misuse("connect is only valid in Initial".into())));
                    return false;
                }
                self.attempt += 1;
                self.challenge_handler = challenge_handler;
                let wire = ConnectParamsWire {
                    username: request.username,
                    hostname: request.hostname,
                    port: Some(request.port as u32),
                    share_key: None,
                    fingerprint: request.fingerprint,
                    reusable: Some(request.reusable),
                    private_key: request.private_key.map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
                    private_key_encoded: Some(true),
                    passphrase: request.passphrase,
                    password: request.password,
                    try_keyboard: Some(request.try_keyboard),
                };
                match json_frame(Tag::Connect, &wire) {
                    Ok(frame) => {
                        if write_frame(&mut self.writer, frame).await.is_err() {
                            let _ = reply.send(Err(ClientError::Terminal(TerminalError::NoDaemon)));
                            return false;
                        }
                        self.state = State::Connecting;
                        self.pending = Some(Pending::Connect { reply });
                    }
                    Err(err) => {
                        let _ = reply.send(Err(ClientError::Terminal(TerminalError::ProtocolError(err.to_string()))));
                    }
                }
                false
            }
            Request::Reuse { request, reply } => {
                if let Some(err) = self.take_stashed_for_next_call() {
                    let _ = reply.send(Err(err));
                    return false;
                }
                if self.state != State::Initial {
                    let _ = reply.send(Err(ClientError::Misuse("reuse is only valid in Initial".into())));
                    return false;
                }
                let wire = ReuseParamsWire {
                    username: request.username,
                    hostname: request.hostname,
                    port: Some(request.port as u32),
                    share_key: request.share_key,
                };
                match json_frame(Tag::Reuse, &wire) {
                    Ok(frame) => {
                        if write_frame(&mut self.writer, frame).await.is_err() {
                            let _ = reply.send(Err(ClientError::Terminal(TerminalError::NoDaemon)));
                            return false;
                        }
                        self.state = State::Connecting;
                        self.pending = Some(Pending::Reuse { reply });
                    }
                    Err(err) => {
                        let _ = reply.send(Err(ClientError::Terminal(TerminalError::ProtocolError(err.to_string()))));
                    }
                }
                false
            }
            Request::Exec { command, pty, reply } => {
                if let Some(err) = self.take_stashed_for_next_call() {
                    let _ = reply.send(Err(err));
                    return false;
                }
                if self.state != State::Ready {
                    let _ = reply.send(Err(ClientError::Misuse("exec is only valid in Ready".into())));
                    return false;
                }
                let tag = if pty { Tag::PtyCommand } else { Tag::SimpleCommand };
                let frame = Frame::new(tag, command.into_bytes());
                if write_frame(&mut self.writer, frame).await.is_err() {
                    let _ = reply.send(Err(ClientError::Terminal(TerminalError::NoDaemon)));
                    return false;
                }
                let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
                let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
                let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
                let (result_tx, result_rx) = oneshot::channel();
                self.stdin_tx = Some(stdin_tx.clone());
                self.stdin_rx = Some(stdin_rx);
                self.stdout_tx = Some(stdout_tx);
                self.stderr_tx = Some(stderr_tx);
                self.pending = Some(Pending::Exec { result: result_tx });
                self.state = State::Executing;
                let _ = reply.send(Ok(ExecOutcome {
                    stdin: StdinHandle(stdin_tx),
                    stdout: stdout_rx,
                    stderr: stderr_rx,
                    result: result_rx,
                }));
                false
            }
            Request::Share { reply } => {
                if let Some(err) = self.take_stashed_for_next_call() {
                    let _ = reply.send(Err(err));
                    return false;
                }
                if self.state != State::Ready {
                    let _ = reply.send(Err(ClientError::Misuse("share is only valid in Ready".into())));
                    return false;
                }
                let frame = Frame::new(Tag::Share, Vec::new());
                if write_frame(&mut self.writer, frame).await.is_err() {
                    let _ = reply.send(Err(ClientError::Terminal(TerminalError::NoDaemon)));
                    return false;
                }
                self.pending = Some(Pending::Share { reply });
                false
            }
            Request::Resize { rows, cols } => {
                if self.state == State::Errored {
                    return false;
                }
                self.window = payload::clamp_resize(self.window, rows, cols);
                if let Ok(frame) = json_frame(Tag::Resize, &ResizePayload { rows, cols }) {
                    let _ = write_frame(&mut self.writer, frame).await;
                }
                false
            }
            Request::Close { reply } => {
                self.fail_pending(TerminalError::Closed);
                self.state = State::Errored;
                self.reader = None;
                self.close_reply = Some(reply);
                true
            }
            Request::ChallengeAnswered { attempt, responses } => {
                if attempt != self.attempt {
                    return false; // superseded by a later connect attempt
                }
                match responses {
                    Some(responses) => {
                        let payload = payload::ChallengeResponsePayload { responses };
                        if let Ok(frame) = json_frame(Tag::ChallengeResponse, &payload) {
                            if write_frame(&mut self.writer, frame).await.is_err() {
                                self.handle_disconnect(TerminalError::NoDaemon).await;
                            }
                        }
                    }
                    None => {
                        self.fail_pending(TerminalError::ChallengeError("challenge handler failed".into()));
                        self.state = State::Errored;
                    }
                }
                false
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.tag {
            Tag::Challenge => self.handle_challenge(frame.data),
            Tag::Connected => self.handle_connected(frame.data),
            Tag::Unconnected => self.handle_unconnected(frame.data).await,
            Tag::Disconnected => self.handle_disconnected(frame.data).await,
            Tag::Stdout => {
                if let Some(tx) = &self.stdout_tx {
                    let _ = tx.send(frame.data);
                }
            }
            Tag::Stderr => {
                if let Some(tx) = &self.stderr_tx {
                    let _ = tx.send(frame.data);
                }
            }
            Tag::Result => self.handle_result(frame.data),
            Tag::Shared => self.handle_shared(frame.data),
            Tag::Exception => self.handle_exception(frame.data).await,
            _ => {
                self.handle_disconnect(TerminalError::ProtocolError(format!("unexpected frame {:?} from daemon", frame.tag)))
                    .await;
            }
        }
    }

    fn handle_challenge(&mut self, data: Vec<u8>) {
        let payload: payload::ChallengePayload = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(_) => return,
        };
        let Some(mut handler) = self.challenge_handler.take() else {
            return;
        };
        let challenge = Challenge {
            title: payload.title,
            instructions: payload.instructions,
            language: payload.language,
            prompts: payload.prompts,
        };
        let attempt = self.attempt;
        let self_tx = self.self_tx.clone();
        let future = handler(challenge);
        self.challenge_handler = Some(handler);
        tokio::spawn(async move {
            let responses = future.await;
            let _ = self_tx.send(Request::ChallengeAnswered { attempt, responses });
        });
    }

    fn handle_connected(&mut self, data: Vec<u8>) {
        let payload: payload::ConnectedPayload = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(err) => {
                self.fail_pending(TerminalError::ProtocolError(err.to_string()));
                self.state = State::Errored;
                return;
            }
        };
        self.state = State::Ready;
        self.challenge_handler = None;
        let outcome = ConnectOutcome { fingerprint: payload.fingerprint, banner: payload.banner };
        match self.pending.take() {
            Some(Pending::Connect { reply }) | Some(Pending::Reuse { reply }) => {
                let _ = reply.send(Ok(outcome));
            }
            _ => {}
        }
    }

    async fn handle_unconnected(&mut self, data: Vec<u8>) {
        let reason = match serde_json::from_slice::<ReasonPayload>(&data) {
            Ok(p) => p.reason,
            Err(err) => err.to_string(),
        };
        self.state = State::Initial;
        self.challenge_handler = None;
        match self.pending.take() {
            Some(Pending::Connect { reply }) | Some(Pending::Reuse { reply }) => {
                let _ = reply.send(Err(ClientError::Terminal(TerminalError::NoSsh(reason))));
            }
            _ => {}
        }
    }

    async fn handle_disconnected(&mut self, data: Vec<u8>) {
        let reason = match serde_json::from_slice::<ReasonPayload>(&data) {
            Ok(p) => p.reason,
            Err(err) => err.to_string(),
        };
        self.handle_disconnect(TerminalError::NoSsh(reason)).await;
    }

    fn handle_result(&mut self, data: Vec<u8>) {
        let payload: payload::ResultPayload = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(err) => {
                self.fail_pending(TerminalError::ProtocolError(err.to_string()));
                self.state = State::Errored;
                return;
            }
        };
        self.state = State::Ready;
        self.stdin_tx = None;
        self.stdin_rx = None;
        self.stdout_tx = None;
        self.stderr_tx = None;
        if let Some(Pending::Exec { result }) = self.pending.take() {
            if payload.error.is_some() {
                let _ = result.send(Err(ClientError::Terminal(TerminalError::SshError {
                    code: payload.code,
                    signal: payload.signal,
                    error: payload.error,
                })));
            } else {
                let _ = result.send(Ok(payload));
            }
        }
    }

    fn handle_shared(&mut self, data: Vec<u8>) {
        let payload: payload::SharedPayload = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(err) => {
                self.fail_pending(TerminalError::ProtocolError(err.to_string()));
                self.state = State::Errored;
                return;
            }
        };
        self.state = State::Initial;
        if let Some(Pending::Share { reply }) = self.pending.take() {
            let _ = reply.send(Ok(payload.share_key));
        }
    }

    async fn handle_exception(&mut self, data: Vec<u8>) {
        let reason = match serde_json::from_slice::<ReasonPayload>(&data) {
            Ok(p) => p.reason,
            Err(err) => err.to_string(),
        };
        self.handle_disconnect(TerminalError::DaemonError(reason)).await;
    }

    async fn handle_disconnect(&mut self, error: TerminalError) {
        self.fail_pending(error.clone());
        self.stashed_error = Some(error);
        self.error_reported = false;
        self.state = State::Errored;
        self.reader = None;
    }

    fn fail_pending(&mut self, error: TerminalError) {
        match self.pending.take() {
            Some(Pending::Connect { reply }) | Some(Pending::Reuse { reply }) => {
                let _ = reply.send(Err(ClientError::Terminal(error)));
            }
            Some(Pending::Share { reply }) => {
                let _ = reply.send(Err(ClientError::Terminal(error)));
            }
            Some(Pending::Exec { result }) => {
                let _ = result.send(Err(ClientError::Terminal(error)));
            }
            None => {}
        }
    }

    /// Implements the stashed-error policy: the first call after entering
    /// Errored surfaces the real cause; every call after that gets a
    /// generic "already closed" error wrapping it.
    fn take_stashed_for_next_call(&mut self) -> Option<ClientError> {
        if self.state != State::Errored {
            return None;
        }
        let error = self.stashed_error.clone().unwrap_or(TerminalError::Closed);
        if self.error_reported {
            Some(ClientError::AlreadyClosed(error))
        } else {
            self.error_reported = true;
            Some(ClientError::Terminal(error))
        }
    }
}
