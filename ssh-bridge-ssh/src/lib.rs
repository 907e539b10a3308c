//! The SSH adapter. This is the only crate in the workspace that names
//! `russh` types; everything else programs against [`Session`], [`Observer`],
//! [`Event`] and [`ConnectParams`].

mod error;
mod event;
mod fingerprint;
mod session;

pub use error::SshAdapterError;
pub use event::{Event, Observer};
pub use session::{ChallengeQueue, ConnectParams, Session};
