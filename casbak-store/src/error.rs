use std::fmt;

/// Wrapper for entry names in error messages.
///
/// Entry names are opaque byte strings and not necessarily valid UTF-8,
/// so they are rendered lossily for display purposes only.
#[derive(Clone, PartialEq, Eq)]
pub struct LossyName(pub Vec<u8>);

impl fmt::Display for LossyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for LossyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<&[u8]> for LossyName {
    fn from(name: &[u8]) -> Self {
        Self(name.to_vec())
    }
}

impl From<Vec<u8>> for LossyName {
    fn from(name: Vec<u8>) -> Self {
        Self(name)
    }
}

/// Errors raised by the directory codec and the virtual filesystem.
///
/// Callers need to tell a missing entry apart from a corrupt blob, so the
/// decode and lookup paths each get their own variant instead of a single
/// stringly-typed error.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    /// Bad magic, bad length header, truncated payload, unknown format
    /// tag or an invalid payload for the declared format.
    #[error("bad directory blob: {0}")]
    BadDirectoryBlob(String),

    /// A path component is missing from an otherwise valid directory.
    #[error("no such entry: {0}")]
    NoSuchEntry(LossyName),

    /// The path traverses a directory entry without a stored reference
    /// (the directory was elided at scan time).
    #[error("directory {0} is not present in storage")]
    DirectoryNotInStorage(LossyName),

    /// Attempt to descend into a non-directory.
    #[error("not a directory: {0}")]
    NotADirectory(LossyName),

    /// `..` applied at the filesystem root.
    #[error("path escapes the filesystem root")]
    EscapesRoot,

    /// Symlink entry with an empty or absent target.
    #[error("invalid symlink: {0}")]
    InvalidSymlink(LossyName),

    /// Symlink chain exceeded the resolution limit.
    #[error("too many levels of symbolic links")]
    TooManySymlinks,

    /// Two entries collide on the same name.
    #[error("duplicate entry name: {0}")]
    DuplicateName(LossyName),

    /// The encoder cannot represent a required field.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Propagated from the storage backend.
    #[error("storage I/O error: {0}")]
    CasIo(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
