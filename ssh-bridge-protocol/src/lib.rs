//! The framed wire protocol spoken between the ssh-bridge client library
//! and the ssh-bridge daemon over a local stream endpoint. See `frame` for
//! the header/tag framing and `payload`/`validate` for the typed JSON
//! bodies carried inside frames.

pub mod frame;
pub mod payload;
pub mod validate;

pub use frame::{Decoder, Frame, ProtocolError, Tag, MAX_PAYLOAD_LEN};
pub use validate::ValidationError;
