//! The tagged-sum-type surface a session reports itself through, and the
//! thin sender wrapper ("observer") that lets the pool swap a session's
//! listener without tearing the session down.

use ssh_bridge_protocol::payload::{ChallengePrompt, ConnectedPayload, ResultPayload};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub enum Event {
    Challenge {
        title: String,
        instructions: String,
        language: String,
        prompts: Vec<ChallengePrompt>,
    },
    Banner(String),
    Connected(ConnectedPayload),
    Unconnected { reason: String },
    Disconnected { reason: String },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Result(ResultPayload),
}

/// A session's current listener. Swapped wholesale on `reuse`/`relinquish`
/// so a session handed back out of the pool reports to its new caller
/// without being reconstructed.
#[derive(Clone)]
pub struct Observer(UnboundedSender<Event>);

impl Observer {
    pub fn new(tx: UnboundedSender<Event>) -> Observer {
        Observer(tx)
    }

    fn emit(&self, event: Event) {
        // The receiving half is dropped once a caller disconnects; there is
        // nothing useful to do with a send failure at this layer.
        let _ = self.0.send(event);
    }

    pub fn challenge(&self, title: String, instructions: String, language: String, prompts: Vec<ChallengePrompt>) {
        self.emit(Event::Challenge { title, instructions, language, prompts });
    }

    pub fn banner(&self, text: &str) {
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.emit(Event::Banner(text));
    }

    pub fn connected(&self, fingerprint: String, banner: Option<String>) {
        self.emit(Event::Connected(ConnectedPayload { fingerprint, banner }));
    }

    pub fn unconnected(&self, reason: impl Into<String>) {
        self.emit(Event::Unconnected { reason: reason.into() });
    }

    pub fn disconnected(&self, reason: impl Into<String>) {
        self.emit(Event::Disconnected { reason: reason.into() });
    }

    pub fn stdout(&self, data: Vec<u8>) {
        self.emit(Event::Stdout(data));
    }

    pub fn stderr(&self, data: Vec<u8>) {
        self.emit(Event::Stderr(data));
    }

    pub fn result(&self, payload: ResultPayload) {
        self.emit(Event::Result(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_appends_missing_newline() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let observer = Observer::new(tx);
        observer.banner("hello");
        match rx.try_recv().unwrap() {
            Event::Banner(text) => assert_eq!(text, "hello\n"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn banner_leaves_trailing_newline_alone() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let observer = Observer::new(tx);
        observer.banner("hello\n");
        match rx.try_recv().unwrap() {
            Event::Banner(text) => assert_eq!(text, "hello\n"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
