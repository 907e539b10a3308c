//! The daemon/client library: the connection pool, the daemon-side
//! per-connection state machine, the caller-side state machine, and the
//! listener/lock/bootstrap glue that ties them to a real socket.

pub mod adapter;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
mod framing;
pub mod lock;
pub mod logging;
pub mod pool;

pub use adapter::{RealConnector, SshConnector, SshSession};
pub use client::{Client, ClientError, ConnectOutcome, ConnectRequest, ExecOutcome, ReuseRequest};
pub use config::Config;
pub use error::TerminalError;
pub use pool::{CacheKey, Pool};
