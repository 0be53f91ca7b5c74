/// Errors that can occur while decoding a ustar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The archive ends in the middle of a header or file data.
    BufferShort,
    /// The magic field of a header is not `ustar`.
    MagicError,
    /// A numeric field is not valid octal ASCII.
    OctalError,
    /// A file name is not valid UTF-8.
    NameError,
    /// The type flag does not name a supported entry type.
    TypeError,
}

pub type Result<T> = core::result::Result<T, Error>;
