use crate::trace::file_header::FileHeader;
use std::path::{Path, PathBuf};

/// State shared by the reader and the writer of one trace file.
pub struct TraceStream {
    pub(super) path: PathBuf,
    pub(super) header: FileHeader,
    /// Global index of the next packet to be read or written.
    pub(super) global_index: u64,
}

impl TraceStream {
    pub(super) fn new(path: &Path, header: FileHeader) -> TraceStream {
        TraceStream {
            path: path.to_owned(),
            header,
            global_index: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn global_index(&self) -> u64 {
        self.global_index
    }
}
