//! Narrow storage abstraction consumed by the read path.
//!
//! The reader only needs positional reads that are safe for concurrent use;
//! everything else about file management (creation, renaming, locking,
//! directory layout) belongs to the storage collaborator. A database
//! directory contains numbered SSTables (`.ldb`), journal files (`.log`),
//! a current-manifest pointer and a lock file; [`FileDesc`] names one of
//! those files in corruption reports and logs.

use std::fmt::Display;
use std::fs::File;

use crate::error::Result;

/// The role a numbered database file plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Table,
    Journal,
    Manifest,
    Lock,
}

/// Names a database file for error reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileDesc {
    pub file_type: FileType,
    pub num: u64,
}

impl FileDesc {
    pub fn new(file_type: FileType, num: u64) -> Self {
        Self { file_type, num }
    }
}

impl Display for FileDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.file_type {
            FileType::Table => write!(f, "{:06}.ldb", self.num),
            FileType::Journal => write!(f, "{:06}.log", self.num),
            FileType::Manifest => write!(f, "MANIFEST-{:06}", self.num),
            FileType::Lock => write!(f, "LOCK"),
        }
    }
}

/// A handle supporting concurrent positional reads.
///
/// `read_at` fills as much of `buf` as the file allows starting at `offset`
/// and returns the number of bytes read. A short read near the end of the
/// file is not an error; callers validate the bytes they got. The handle is
/// closed by dropping it.
pub trait RandomAccessFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

#[cfg(unix)]
impl RandomAccessFile for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut read = 0;
        while read < buf.len() {
            match FileExt::read_at(self, &mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_desc_names() {
        assert_eq!(FileDesc::new(FileType::Table, 12).to_string(), "000012.ldb");
        assert_eq!(
            FileDesc::new(FileType::Journal, 3).to_string(),
            "000003.log"
        );
        assert_eq!(
            FileDesc::new(FileType::Manifest, 1).to_string(),
            "MANIFEST-000001"
        );
    }

    #[test]
    fn test_read_at_short_read() {
        let mut tmp = tempfile::tempfile().expect("temp file");
        tmp.write_all(b"hello world").expect("write");

        let mut buf = [0u8; 5];
        let n = RandomAccessFile::read_at(&tmp, &mut buf, 6).expect("read");
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        // Reading past the end yields a short read, not an error.
        let mut buf = [0u8; 16];
        let n = RandomAccessFile::read_at(&tmp, &mut buf, 6).expect("read");
        assert_eq!(n, 5);
        assert_eq!(&buf[..n], b"world");
    }
}
