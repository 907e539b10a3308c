//! The pluggable SSH backend. The pool and daemon-side handler program
//! against [`SshSession`]/[`SshConnector`] rather than `ssh-bridge-ssh`'s
//! concrete `Session` directly, so tests can swap in a fake that never
//! touches the network (see `ssh-bridge-core/tests`).

use std::time::Duration;

use async_trait::async_trait;
use ssh_bridge_ssh::{ChallengeQueue, ConnectParams, Observer, Session, SshAdapterError};

#[async_trait]
pub trait SshSession: Send + Sync {
    fn fingerprint(&self) -> String;
    fn is_reusable(&self) -> bool;
    fn share_key_or_assign(&mut self, candidate: String) -> String;
    fn rebind_observer(&mut self, observer: Observer);
    async fn exec(&mut self, command: &str, pty: bool, observer: Observer);
    fn write_stdin(&mut self, bytes: Vec<u8>);
    fn end_stdin(&mut self);
    fn resize(&mut self, rows: i32, cols: i32);
    async fn respond_to_challenge(&self, responses: Vec<String>) -> bool;
    async fn close(self: Box<Self>);
    fn challenge_seen(&self) -> bool;
    fn banner(&self) -> Option<String>;
}

#[async_trait]
impl SshSession for Session {
    fn fingerprint(&self) -> String {
        Session::fingerprint(self).to_string()
    }

    fn is_reusable(&self) -> bool {
        Session::is_reusable(self)
    }

    fn share_key_or_assign(&mut self, candidate: String) -> String {
        Session::share_key_or_assign(self, candidate)
    }

    fn rebind_observer(&mut self, observer: Observer) {
        Session::rebind_observer(self, observer)
    }

    async fn exec(&mut self, command: &str, pty: bool, observer: Observer) {
        Session::exec(self, command, pty, observer).await
    }

    fn write_stdin(&mut self, bytes: Vec<u8>) {
        Session::write_stdin(self, bytes)
    }

    fn end_stdin(&mut self) {
        Session::end_stdin(self)
    }

    fn resize(&mut self, rows: i32, cols: i32) {
        Session::resize(self, rows, cols)
    }

    async fn respond_to_challenge(&self, responses: Vec<String>) -> bool {
        Session::respond_to_challenge(self, responses).await
    }

    async fn close(self: Box<Self>) {
        Session::close(*self).await
    }

    fn challenge_seen(&self) -> bool {
        Session::challenge_seen(self)
    }

    fn banner(&self) -> Option<String> {
        Session::banner(self)
    }
}

/// Opens new SSH sessions. The daemon wires up `RealConnector`; tests wire
/// up a fake that returns canned sessions/errors without dialing out.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn establish(
        &self,
        params: ConnectParams,
        observer: Observer,
        challenges: ChallengeQueue,
    ) -> Result<Box<dyn SshSession>, SshAdapterError>;
}

pub struct RealConnector {
    connect_timeout: Duration,
}

impl RealConnector {
    pub fn new(connect_timeout: Duration) -> RealConnector {
        RealConnector { connect_timeout }
    }
}

#[async_trait]
impl SshConnector for RealConnector {
    async fn establish(
        &self,
        params: ConnectParams,
        observer: Observer,
        challenges: ChallengeQueue,
    ) -> Result<Box<dyn SshSession>, SshAdapterError> {
        let session = Session::establish(params, observer, challenges, self.connect_timeout).await?;
        Ok(Box::new(session))
    }
}
