//! Drives the caller-side client against the daemon-side connection
//! handler over an in-memory duplex pair, exercising the scenarios a real
//! socket would see: connect, stream a command's output, release a
//! reusable session on close, and reuse it from a second connection.
//!
//! The fakes here are a deliberately small re-implementation of the ones
//! in `pool.rs`'s own unit tests — those are private to that module, and
//! duplicating a dozen lines of trait plumbing is cheaper than threading a
//! shared test-util crate through the workspace for three call sites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh_bridge_core::adapter::{SshConnector, SshSession};
use ssh_bridge_core::client::{Client, ConnectRequest, ReuseRequest};
use ssh_bridge_core::daemon;
use ssh_bridge_core::pool::Pool;
use ssh_bridge_protocol::payload::ResultPayload;
use ssh_bridge_ssh::{ChallengeQueue, ConnectParams, Observer, SshAdapterError};
use tokio::sync::{watch, Mutex};

struct FakeSession {
    fingerprint: String,
    reusable: Arc<AtomicBool>,
}

#[async_trait]
impl SshSession for FakeSession {
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }
    fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::SeqCst)
    }
    fn share_key_or_assign(&mut self, candidate: String) -> String {
        candidate
    }
    fn rebind_observer(&mut self, _observer: Observer) {}
    async fn exec(&mut self, command: &str, _pty: bool, observer: Observer) {
        let echoed = format!("ran: {command}\n").into_bytes();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            observer.stdout(echoed);
            observer.result(ResultPayload { code: Some(0), signal: None, error: None });
        });
    }
    fn write_stdin(&mut self, _bytes: Vec<u8>) {}
    fn end_stdin(&mut self) {}
    fn resize(&mut self, _rows: i32, _cols: i32) {}
    async fn respond_to_challenge(&self, _responses: Vec<String>) -> bool {
        false
    }
    async fn close(self: Box<Self>) {}
    fn challenge_seen(&self) -> bool {
        false
    }
    fn banner(&self) -> Option<String> {
        None
    }
}

struct FakeConnector {
    script: Mutex<Vec<Result<(), SshAdapterError>>>,
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn establish(
        &self,
        params: ConnectParams,
        _observer: Observer,
        _challenges: ChallengeQueue,
    ) -> Result<Box<dyn SshSession>, SshAdapterError> {
        let outcome = self.script.lock().await.remove(0);
        outcome.map(|()| {
            Box::new(FakeSession {
                fingerprint: format!("fp-for-{}", params.username),
                reusable: Arc::new(AtomicBool::new(true)),
            }) as Box<dyn SshSession>
        })
    }
}

fn make_pool(script: Vec<Result<(), SshAdapterError>>) -> Arc<Pool> {
    Pool::new(Arc::new(FakeConnector { script: Mutex::new(script) }), Duration::from_secs(60), Duration::from_secs(5))
}

fn connect_request(user: &str) -> ConnectRequest {
    ConnectRequest {
        username: user.to_string(),
        hostname: "host".to_string(),
        port: 22,
        fingerprint: None,
        reusable: false,
        private_key: None,
        passphrase: None,
        password: Some("pw".to_string()),
        try_keyboard: false,
    }
}

fn spawn_daemon(pool: Arc<Pool>, shutdown: watch::Receiver<bool>) -> (Client, tokio::task::JoinHandle<()>) {
    let (daemon_io, client_io) = tokio::io::duplex(8192);
    let task = tokio::spawn(daemon::handle_connection(daemon_io, pool, shutdown));
    (Client::spawn(client_io), task)
}

#[tokio::test]
async fn connect_then_exec_streams_stdout_and_result() {
    let pool = make_pool(vec![Ok(())]);
    let (_tx, shutdown_rx) = watch::channel(false);
    let (client, _daemon) = spawn_daemon(pool, shutdown_rx);

    let outcome = client.connect(connect_request("alice"), None).await.unwrap();
    assert_eq!(outcome.fingerprint, "fp-for-alice");

    let mut exec = client.exec("echo hi", false).await.unwrap();
    let chunk = exec.stdout.recv().await.unwrap();
    assert_eq!(chunk, b"ran: echo hi\n");
    let result = exec.result.await.unwrap().unwrap();
    assert_eq!(result.code, Some(0));

    client.close().await;
    assert!(client.closed());
}

/// Regression test: a successful REUSE used to forward its CONNECTED event
/// through the signal channel after the state machine had already advanced
/// to `Ready`, so the daemon rejected its own reuse with a spurious fatal
/// error instead of ever sending CONNECTED to the caller.
#[tokio::test]
async fn reusable_session_round_trips_through_reuse_after_close() {
    let pool = make_pool(vec![Ok(())]);

    {
        let (_tx, shutdown_rx) = watch::channel(false);
        let (client, _daemon) = spawn_daemon(pool.clone(), shutdown_rx);
        let mut request = connect_request("bob");
        request.reusable = true;
        client.connect(request, None).await.unwrap();
        let exec = client.exec("true", false).await.unwrap();
        exec.result.await.unwrap().unwrap();
        client.close().await;
    }

    let (_tx, shutdown_rx) = watch::channel(false);
    let (client, _daemon) = spawn_daemon(pool, shutdown_rx);
    let outcome = client
        .reuse(ReuseRequest { username: "bob".to_string(), hostname: "host".to_string(), port: 22, share_key: None })
        .await
        .unwrap();
    assert_eq!(outcome.fingerprint, "fp-for-bob");
    client.close().await;
}

#[tokio::test]
async fn shutdown_signal_drains_in_flight_exec_before_closing() {
    let pool = make_pool(vec![Ok(())]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (client, daemon_task) = spawn_daemon(pool, shutdown_rx);

    client.connect(connect_request("carol"), None).await.unwrap();
    let exec = client.exec("slow-command", false).await.unwrap();

    shutdown_tx.send(true).unwrap();

    let result = exec.result.await.unwrap().unwrap();
    assert_eq!(result.code, Some(0));
    daemon_task.await.unwrap();
}
