//! Writes length prefixed frames.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes messages as frames, reusing one buffer for the owned part of every frame.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    /// Creates a new `OnoSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Writes `msg` as one frame and flushes it.
    ///
    /// The length prefix is reserved first and patched once the header is
    /// serialized. A borrowed tail such as a model blob is written after the
    /// header without being copied into the buffer.
    ///
    /// # Arguments
    /// * `msg` - The message to frame.
    ///
    /// # Errors
    /// Any io error of the underlying writer, or of the serialization.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let zero_copy_data = msg.serialize(buf)?;
        let len = buf.len() - LEN_TYPE_SIZE + zero_copy_data.map(<[_]>::len).unwrap_or_default();
        let header = (len as LenType).to_be_bytes();

        buf[..header.len()].copy_from_slice(&header);
        tx.write_all(buf).await?;

        if let Some(data) = zero_copy_data {
            tx.write_all(data).await?;
        }

        tx.flush().await
    }

    /// Shuts down the underlying writer, the peer will observe an end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
