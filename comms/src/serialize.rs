use std::io;

pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Returns
    /// An optional borrowed tail, written right after `buf` without being copied.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
