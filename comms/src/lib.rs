//! Framing for the worker and coordination server connections.
//!
//! Every frame is a big endian `u64` body length followed by the body. The body
//! starts with a big endian `u32` message kind, see [`msg::Msg`] for the rest.

mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::{DEFAULT_MAX_FRAME_LEN, OnoReceiver};
pub use sender::OnoSender;
pub use serialize::Serialize;

/// The body length prefix of every frame.
type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Splits a connection into its framed halves.
///
/// Either half may be a placeholder such as `tokio::io::empty()` or
/// `tokio::io::sink()` when only one direction is used.
///
/// # Arguments
/// * `rx` - The read half of the connection.
/// * `tx` - The write half of the connection.
///
/// # Returns
/// The receiver reading frames off `rx` and the sender writing frames into `tx`.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
