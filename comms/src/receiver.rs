use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType};

/// The default upper bound for a single frame's body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

/// Reads frames and decodes them into messages borrowing from a caller buffer.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the largest frame body this receiver accepts.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Reads the next frame into `buf` and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Holds the frame body, the returned message borrows from it.
    ///
    /// # Errors
    /// `UnexpectedEof` when the peer closed, `InvalidData` for a malformed body
    /// or a frame above the maximum length. The length is checked before `buf`
    /// grows.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<u8>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf);

        if len > self.max_frame_len as LenType {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame of {len} bytes exceeds the maximum of {}",
                    self.max_frame_len
                ),
            ));
        }

        buf.clear();
        buf.resize(len as usize, 0);
        self.rx.read_exact(&mut buf[..]).await?;

        T::deserialize(&buf[..])
    }
}
