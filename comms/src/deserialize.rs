use std::io;

pub trait Deserialize<'a>: Sized {
    /// Reads a frame body, borrowing the large parts straight out of `buf`.
    ///
    /// # Errors
    /// `InvalidData` when the body is not a well formed message.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
