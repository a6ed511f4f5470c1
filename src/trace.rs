use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    io,
};

pub mod file_header;
pub mod metadata;
pub mod packet;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_writer;

/// Everything that can go wrong opening or walking a trace file.
#[derive(Debug)]
pub enum TraceError {
    Io(io::Error),
    BadMagic(u64),
    UnsupportedVersion(u16),
    PointerSizeMismatch { trace: u8, replay: u8 },
    EndiannessMismatch { trace: u32, replay: u32 },
    NoGpuInfo,
    Compressed(u8),
    Corrupt(String),
    Payload(serde_json::Error),
}

impl Display for TraceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Io(e) => write!(f, "trace file I/O error: {}", e),
            TraceError::BadMagic(m) => write!(f, "not a pmtrace file (magic {:#018x})", m),
            TraceError::UnsupportedVersion(v) => write!(
                f,
                "trace file version {} is not supported (need {}..={})",
                v,
                file_header::TRACE_MIN_COMPATIBLE_VERSION,
                file_header::TRACE_VERSION
            ),
            TraceError::PointerSizeMismatch { trace, replay } => write!(
                f,
                "trace was captured with {} byte pointers, replayer uses {}",
                trace, replay
            ),
            TraceError::EndiannessMismatch { trace, replay } => write!(
                f,
                "trace is {}, replayer is {}",
                crate::util::endianness_name(*trace),
                crate::util::endianness_name(*replay)
            ),
            TraceError::NoGpuInfo => write!(f, "trace header carries no GPU information"),
            TraceError::Compressed(c) => write!(f, "compression type {} is not supported", c),
            TraceError::Corrupt(what) => write!(f, "corrupt trace: {}", what),
            TraceError::Payload(e) => write!(f, "could not decode packet payload: {}", e),
        }
    }
}

impl Error for TraceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TraceError::Io(e) => Some(e),
            TraceError::Payload(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TraceError {
    fn from(e: io::Error) -> Self {
        TraceError::Io(e)
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Payload(e)
    }
}

impl TraceError {
    /// Problems that make the file unusable before any packet is replayed.
    pub fn is_format_level(&self) -> bool {
        match self {
            TraceError::BadMagic(_)
            | TraceError::UnsupportedVersion(_)
            | TraceError::PointerSizeMismatch { .. }
            | TraceError::EndiannessMismatch { .. }
            | TraceError::Compressed(_) => true,
            _ => false,
        }
    }
}
