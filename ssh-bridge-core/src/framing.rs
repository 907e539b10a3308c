//! Async frame I/O shared by the daemon handler and the caller-side client:
//! a buffered reader over the sans-I/O `Decoder`, plus the write-side
//! helpers for emitting JSON-bodied frames.

use std::collections::VecDeque;

use ssh_bridge_protocol::frame::{Decoder, Frame, Tag};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub struct FrameReader<R> {
    reader: R,
    decoder: Decoder,
    queue: VecDeque<Frame>,
    buf: Box<[u8; 8192]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader { reader, decoder: Decoder::new(), queue: VecDeque::new(), buf: Box::new([0u8; 8192]) }
    }

    /// Returns the next complete frame, or `None` on a clean EOF.
    pub async fn next(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.reader.read(&mut self.buf[..]).await?;
            if n == 0 {
                return Ok(None);
            }
            let frames = self.decoder.push(&self.buf[..n])?;
            self.queue.extend(frames);
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: Frame) -> anyhow::Result<()> {
    writer.write_all(&frame.encode()?).await?;
    Ok(())
}

pub fn json_frame(tag: Tag, value: &impl serde::Serialize) -> anyhow::Result<Frame> {
    Ok(Frame::new(tag, serde_json::to_vec(value)?))
}
