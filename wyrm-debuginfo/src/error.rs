//! The error type shared by all indexing operations.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The kind of an [`Error`].
///
/// [`Error`]: struct.Error.html
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// An argument to an indexing operation was invalid.
    InvalidArgument,

    /// A variable-length integer did not fit into 64 bits.
    Overflow,

    /// An operating system error while resolving or opening a file.
    ///
    /// The original `std::io::Error`, including the OS error code, is available through
    /// [`std::error::Error::source`].
    Os {
        /// The path the operation failed on.
        path: PathBuf,
    },

    /// The file does not carry an ELF identification.
    NotElf,

    /// The ELF file is malformed or uses an unsupported encoding.
    ElfFormat,

    /// The DWARF data is malformed or uses an unsupported encoding.
    DwarfFormat,

    /// A required debug section is missing from the file.
    MissingDebug,

    /// Debug information ended before a complete unit could be read.
    Truncated,

    /// A referenced entity could not be found.
    Lookup,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Overflow => write!(f, "integer overflow"),
            Self::Os { path } => write!(f, "system error on {}", path.display()),
            Self::NotElf => write!(f, "file is not an ELF file"),
            Self::ElfFormat => write!(f, "invalid ELF file"),
            Self::DwarfFormat => write!(f, "invalid DWARF data"),
            Self::MissingDebug => write!(f, "missing debug information"),
            Self::Truncated => write!(f, "truncated debug information"),
            Self::Lookup => write!(f, "entity not found"),
        }
    }
}

/// An error returned when loading or indexing debug information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new error from a known kind of error as well as an arbitrary error payload.
    pub(crate) fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Creates an OS error for the given path.
    pub(crate) fn os(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Os { path: path.into() }, source)
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let error = Error::new(ErrorKind::DwarfFormat, "non-sequential abbreviation code");
        assert_eq!(error.to_string(), "invalid DWARF data");
        assert_eq!(
            error.source().unwrap().to_string(),
            "non-sequential abbreviation code"
        );
    }

    #[test]
    fn test_os_kind_carries_path() {
        let error = Error::os("/no/such/file", std::io::Error::from_raw_os_error(2));
        match error.kind() {
            ErrorKind::Os { path } => assert_eq!(path.to_str(), Some("/no/such/file")),
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
