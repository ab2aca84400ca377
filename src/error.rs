use std::fmt::Display;

use crate::storage::FileDesc;

/// The section of an SST file a corruption report refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Table,
    TableFooter,
    MetaBlock,
    IndexBlock,
    FilterBlock,
    DataBlock,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Table => "table",
            BlockKind::TableFooter => "table-footer",
            BlockKind::MetaBlock => "meta-block",
            BlockKind::IndexBlock => "index-block",
            BlockKind::FilterBlock => "filter-block",
            BlockKind::DataBlock => "data-block",
        }
    }
}

impl Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of a parse, decode or checksum failure. `pos` and `size` locate
/// the offending block within the file named by `fd`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Corruption {
    pub fd: FileDesc,
    pub pos: u64,
    pub size: u64,
    pub kind: BlockKind,
    pub reason: String,
}

/// cinderdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// No entry matches the requested key. Not an I/O failure.
    NotFound,
    /// Invalid on-disk data: decoding errors, checksum mismatches, or
    /// unexpected internal values.
    Corrupted(Corruption),
    /// Operation on a released table reader.
    ReaderReleased,
    /// Operation on a released iterator.
    IterReleased,
    /// Operation on a released snapshot.
    SnapshotReleased,
    /// The owning database has been closed.
    Closed,
    /// Invalid caller input, typically a malformed range or option.
    InvalidInput(String),
    /// An underlying I/O error, passed through unchanged.
    Io(String),
}

impl Error {
    /// Classifies corruption for propagation policy decisions. Corruption in
    /// the filter block is swallowed at reader construction; corruption
    /// elsewhere latches the reader.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Error::Corrupted(_))
    }

    pub(crate) fn corrupted(
        fd: FileDesc,
        pos: u64,
        size: u64,
        kind: BlockKind,
        reason: impl Into<String>,
    ) -> Error {
        Error::Corrupted(Corruption {
            fd,
            pos,
            size,
            kind,
            reason: reason.into(),
        })
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corrupted(c) => write!(
                f,
                "corruption in {} on {} (pos={}): {}",
                c.fd, c.kind, c.pos, c.reason
            ),
            Error::ReaderReleased => write!(f, "table reader released"),
            Error::IterReleased => write!(f, "iterator released"),
            Error::SnapshotReleased => write!(f, "snapshot released"),
            Error::Closed => write!(f, "database closed"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

/// A cinderdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileDesc, FileType};

    #[test]
    fn test_corruption_display() {
        let err = Error::corrupted(
            FileDesc::new(FileType::Table, 7),
            512,
            128,
            BlockKind::DataBlock,
            "checksum mismatch",
        );
        assert!(err.is_corrupted());
        let msg = err.to_string();
        assert!(msg.contains("data-block"), "unexpected message: {msg}");
        assert!(msg.contains("pos=512"), "unexpected message: {msg}");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_corrupted());
    }
}
