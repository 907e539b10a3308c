//! The per-accepted-connection state machine (§4.5): mediates between the
//! frame stream on one socket and the pool/SSH adapter on the other.

use std::sync::Arc;

use ssh_bridge_protocol::frame::{Frame, Tag};
use ssh_bridge_protocol::payload::{clamp_resize, ReasonPayload, ResizePayload, SharedPayload, Size};
use ssh_bridge_protocol::validate;
use ssh_bridge_ssh::{ChallengeQueue, ConnectParams as SshConnectParams, Event};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::adapter::SshSession;
use crate::framing::{json_frame, write_frame, FrameReader};
use crate::pool::{CacheKey, Pool, RelinquishMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Connecting,
    Ready,
    Executing,
    Errored,
}

enum Signal {
    Wire(Event),
    ConnectFinished(Option<Box<dyn SshSession>>),
}

struct Handler {
    state: State,
    pool: Arc<Pool>,
    session: Option<Box<dyn SshSession>>,
    cache_key: Option<CacheKey>,
    keep_on_close: bool,
    window: Size,
    challenges: ChallengeQueue,
    signal_tx: mpsc::UnboundedSender<Signal>,
    shutdown_requested: bool,
}

impl Handler {
    fn new(pool: Arc<Pool>, signal_tx: mpsc::UnboundedSender<Signal>) -> Handler {
        Handler {
            state: State::Initial,
            pool,
            session: None,
            cache_key: None,
            keep_on_close: false,
            window: Size::default(),
            challenges: ChallengeQueue::new(),
            signal_tx,
            shutdown_requested: false,
        }
    }

    async fn fatal<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, reason: impl Into<String>) -> anyhow::Result<()> {
        let payload = ReasonPayload { reason: reason.into() };
        write_frame(writer, json_frame(Tag::Exception, &payload)?).await?;
        self.state = State::Errored;
        Ok(())
    }

    fn relay_observer(&self) -> (ssh_bridge_ssh::Observer, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ssh_bridge_ssh::Observer::new(tx), rx)
    }

    async fn start_reuse<W: AsyncWrite + Unpin>(&mut self, data: Vec<u8>, writer: &mut W) -> anyhow::Result<()> {
        let params = match validate::validate_reuse(&data) {
            Ok(p) => p,
            Err(err) => return self.fatal(writer, err.to_string()).await,
        };
        let key = CacheKey::new(params.username, params.hostname, params.port);
        let (observer, mut rx) = self.relay_observer();
        // Unlike connect(), reuse() never hands off to a background task, so
        // its observer events land synchronously and can be written straight
        // out instead of round-tripping through the signal channel, which
        // would race against the state transition below.
        let session = self.pool.reuse(key.clone(), params.share_key, observer).await;
        match (session, rx.try_recv()) {
            (Some(session), Ok(Event::Connected(payload))) => {
                self.session = Some(session);
                self.cache_key = Some(key);
                self.keep_on_close = true;
                self.state = State::Ready;
                write_frame(writer, json_frame(Tag::Connected, &payload)?).await
            }
            (None, Ok(Event::Unconnected { reason })) => {
                write_frame(writer, json_frame(Tag::Unconnected, &ReasonPayload { reason })?).await
            }
            _ => self.fatal(writer, "pool.reuse reported an inconsistent outcome").await,
        }
    }

    async fn start_connect<W: AsyncWrite + Unpin>(&mut self, data: Vec<u8>, writer: &mut W) -> anyhow::Result<()> {
        let params = match validate::validate_connect(&data) {
            Ok(p) => p,
            Err(err) => return self.fatal(writer, err.to_string()).await,
        };
        let key = CacheKey::new(params.username.clone(), params.hostname.clone(), params.port);
        self.cache_key = Some(key.clone());
        self.keep_on_close = params.reusable;

        let ssh_params = SshConnectParams {
            username: params.username,
            hostname: params.hostname,
            port: params.port,
            fingerprint: params.fingerprint,
            private_key: params.private_key,
            passphrase: params.passphrase,
            password: params.password,
            try_keyboard: params.try_keyboard,
        };

        let (tx, mut inner_rx) = mpsc::unbounded_channel::<Event>();
        let observer = ssh_bridge_ssh::Observer::new(tx);
        let pool = self.pool.clone();
        let challenges = self.challenges.clone();
        let signal_tx = self.signal_tx.clone();

        tokio::spawn(async move {
            let relay_signal_tx = signal_tx.clone();
            let relay = tokio::spawn(async move {
                while let Some(event) = inner_rx.recv().await {
                    if relay_signal_tx.send(Signal::Wire(event)).is_err() {
                        break;
                    }
                }
            });
            let result = pool.connect(key, ssh_params, observer, challenges).await;
            let _ = relay.await;
            let _ = signal_tx.send(Signal::ConnectFinished(result));
        });

        self.state = State::Connecting;
        Ok(())
    }

    async fn handle_resize<W: AsyncWrite + Unpin>(&mut self, data: Vec<u8>, writer: &mut W) -> anyhow::Result<()> {
        let payload: ResizePayload = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(err) => return self.fatal(writer, format!("malformed RESIZE payload: {err}")).await,
        };
        self.window = clamp_resize(self.window, payload.rows, payload.cols);
        if let Some(session) = self.session.as_mut() {
            session.resize(self.window.rows as i32, self.window.cols as i32);
        }
        Ok(())
    }

    async fn handle_challenge_response(&mut self, data: Vec<u8>) -> anyhow::Result<bool> {
        match validate::validate_challenge_response(&data) {
            Ok(payload) => {
                self.challenges.respond(payload.responses).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn start_exec<W: AsyncWrite + Unpin>(
        &mut self,
        data: Vec<u8>,
        pty: bool,
        writer: &mut W,
    ) -> anyhow::Result<()> {
        let command = match validate::validate_command(&data) {
            Ok(c) => c,
            Err(err) => return self.fatal(writer, err.to_string()).await,
        };
        let session = self.session.as_mut().expect("Executing requires an attached session");
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let observer = ssh_bridge_ssh::Observer::new(tx);
        session.exec(&command, pty, observer).await;
        // Stdout/stderr/result for the command arrive asynchronously after
        // exec() returns (session.rs's run_channel task), so the relay has
        // to outlive this call, same as start_connect's relay.
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if signal_tx.send(Signal::Wire(event)).is_err() {
                    break;
                }
            }
        });
        self.state = State::Executing;
        Ok(())
    }

    fn handle_stdin(&mut self, data: Vec<u8>) {
        let session = self.session.as_mut().expect("Executing requires an attached session");
        if data.is_empty() {
            session.end_stdin();
        } else {
            session.write_stdin(data);
        }
    }

    async fn handle_share<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> anyhow::Result<()> {
        let session = self.session.take().expect("Ready requires an attached session");
        let key = self.cache_key.clone().expect("Ready requires a cache key");
        let share_key = self.pool.relinquish(key, session, RelinquishMode::Share).await;
        self.cache_key = None;
        self.state = State::Initial;
        match share_key {
            Some(share_key) => {
                write_frame(writer, json_frame(Tag::Shared, &SharedPayload { share_key })?).await?;
            }
            None => {
                self.fatal(writer, "session became non-reusable before it could be shared").await?;
            }
        }
        Ok(())
    }

    async fn handle_frame<W: AsyncWrite + Unpin>(&mut self, frame: Frame, writer: &mut W) -> anyhow::Result<()> {
        match (self.state, frame.tag) {
            (_, Tag::Resize) => self.handle_resize(frame.data, writer).await,
            (State::Initial, Tag::Reuse) => self.start_reuse(frame.data, writer).await,
            (State::Initial, Tag::Connect) => self.start_connect(frame.data, writer).await,
            (State::Connecting, Tag::ChallengeResponse) => {
                if self.handle_challenge_response(frame.data).await? {
                    Ok(())
                } else {
                    self.fatal(writer, "malformed CHALLENGE_RESPONSE payload").await
                }
            }
            (State::Ready, Tag::ChallengeResponse) => Ok(()), // late response, ignored
            (State::Ready, Tag::SimpleCommand) => self.start_exec(frame.data, false, writer).await,
            (State::Ready, Tag::PtyCommand) => self.start_exec(frame.data, true, writer).await,
            (State::Ready, Tag::Share) => self.handle_share(writer).await,
            (State::Executing, Tag::Stdin) => {
                self.handle_stdin(frame.data);
                Ok(())
            }
            (_, Tag::Stdin) => Ok(()), // outside Executing, silently ignored
            (State::Errored, _) => Ok(()),
            _ => self.fatal(writer, format!("frame {:?} is not legal in state {:?}", frame.tag, self.state)).await,
        }
    }

    async fn handle_signal<W: AsyncWrite + Unpin>(&mut self, signal: Signal, writer: &mut W) -> anyhow::Result<()> {
        match signal {
            Signal::Wire(event) => self.handle_event(event, writer).await,
            Signal::ConnectFinished(result) => {
                match result {
                    Some(session) => {
                        self.session = Some(session);
                        self.state = State::Ready;
                    }
                    None => {
                        self.state = State::Initial;
                        self.cache_key = None;
                    }
                }
                Ok(())
            }
        }
    }

    async fn handle_event<W: AsyncWrite + Unpin>(&mut self, event: Event, writer: &mut W) -> anyhow::Result<()> {
        match (self.state, event) {
            (State::Connecting, Event::Challenge { title, instructions, language, prompts }) => {
                let payload = ssh_bridge_protocol::payload::ChallengePayload {
                    title,
                    instructions,
                    language,
                    prompts,
                };
                write_frame(writer, json_frame(Tag::Challenge, &payload)?).await
            }
            (_, Event::Banner(_)) => Ok(()), // carried inside Connected instead
            (State::Connecting, Event::Connected(payload)) => {
                write_frame(writer, json_frame(Tag::Connected, &payload)?).await
            }
            (State::Connecting, Event::Unconnected { reason }) => {
                write_frame(writer, json_frame(Tag::Unconnected, &ReasonPayload { reason })?).await
            }
            (State::Executing, Event::Stdout(bytes)) => write_frame(writer, Frame::new(Tag::Stdout, bytes)).await,
            (State::Executing, Event::Stderr(bytes)) => write_frame(writer, Frame::new(Tag::Stderr, bytes)).await,
            (State::Executing, Event::Result(payload)) => {
                write_frame(writer, json_frame(Tag::Result, &payload)?).await?;
                self.state = State::Ready;
                Ok(())
            }
            (State::Ready, Event::Disconnected { reason }) | (State::Executing, Event::Disconnected { reason }) => {
                write_frame(writer, json_frame(Tag::Disconnected, &ReasonPayload { reason })?).await?;
                self.session = None;
                self.state = State::Errored;
                Ok(())
            }
            (_, _) => self.fatal(writer, "unexpected SSH event for current state").await,
        }
    }

    async fn close_connection(&mut self) {
        if let (Some(session), Some(key)) = (self.session.take(), self.cache_key.take()) {
            let mode = match self.state {
                State::Ready if self.keep_on_close => RelinquishMode::Keep,
                _ => RelinquishMode::Drop,
            };
            self.pool.relinquish(key, session, mode).await;
        }
    }
}

/// Drives one accepted connection end to end: reads frames, dispatches them
/// against the state machine, and forwards SSH adapter events back out as
/// frames, until the socket closes or a daemon shutdown drains it.
pub async fn handle_connection<S>(stream: S, pool: Arc<Pool>, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let mut handler = Handler::new(pool, signal_tx);

    loop {
        if handler.shutdown_requested && handler.state != State::Executing {
            break;
        }
        if handler.state == State::Errored {
            break;
        }

        tokio::select! {
            frame = reader.next() => {
                match frame {
                    Ok(Some(frame)) => {
                        if handler.handle_frame(frame, &mut write_half).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            Some(signal) = signal_rx.recv() => {
                if handler.handle_signal(signal, &mut write_half).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed(), if !handler.shutdown_requested => {
                handler.shutdown_requested = true;
            }
        }
    }

    handler.close_connection().await;
    let _ = write_half.shutdown().await;
}
