//! Fixed little endian header at the start of every trace file.
//!
//! ```text
//!  0  magic                  u64
//!  8  version                u16
//! 10  pointer size           u8
//! 11  compression            u8
//! 12  endianness             u32
//! 16  arch                   u32
//! 20  os                     u32
//! 24  first packet offset    u64
//! 32  metadata offset        u64   0 when absent
//! 40  portability table      u32   1 when valid
//! 44  n_gpuinfo              u32
//! 48  (gpu_id, driver_version) x n_gpuinfo, u64 each
//! ```

use crate::{
    trace::TraceError,
    util::{endianness_name, native_endianness},
};
use serde::Serialize;
use std::{io::Read, mem::size_of};

/// "PMTRACE\0"
pub const TRACE_MAGIC: u64 = 0x50_4d_54_52_41_43_45_00;
pub const TRACE_VERSION: u16 = 2;
pub const TRACE_MIN_COMPATIBLE_VERSION: u16 = 1;

pub const FIXED_HEADER_SIZE: usize = 48;
const GPU_INFO_SIZE: usize = 16;

pub const ARCH_UNKNOWN: u32 = 0;
pub const ARCH_X86_64: u32 = 1;
pub const ARCH_AARCH64: u32 = 2;
pub const ARCH_X86: u32 = 3;
pub const ARCH_ARM: u32 = 4;

pub const OS_UNKNOWN: u32 = 0;
pub const OS_LINUX: u32 = 1;
pub const OS_ANDROID: u32 = 2;
pub const OS_WINDOWS: u32 = 3;

pub const COMPRESSION_NONE: u8 = 0;

pub fn native_arch() -> u32 {
    if cfg!(target_arch = "x86_64") {
        ARCH_X86_64
    } else if cfg!(target_arch = "aarch64") {
        ARCH_AARCH64
    } else if cfg!(target_arch = "x86") {
        ARCH_X86
    } else if cfg!(target_arch = "arm") {
        ARCH_ARM
    } else {
        ARCH_UNKNOWN
    }
}

pub fn native_os() -> u32 {
    if cfg!(target_os = "android") {
        OS_ANDROID
    } else if cfg!(target_os = "linux") {
        OS_LINUX
    } else if cfg!(target_os = "windows") {
        OS_WINDOWS
    } else {
        OS_UNKNOWN
    }
}

pub fn arch_name(arch: u32) -> &'static str {
    match arch {
        ARCH_X86_64 => "x86_64",
        ARCH_AARCH64 => "aarch64",
        ARCH_X86 => "x86",
        ARCH_ARM => "arm",
        _ => "unknown",
    }
}

pub fn os_name(os: u32) -> &'static str {
    match os {
        OS_LINUX => "linux",
        OS_ANDROID => "android",
        OS_WINDOWS => "windows",
        _ => "unknown",
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct GpuInfo {
    pub gpu_id: u64,
    pub driver_version: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub magic: u64,
    pub version: u16,
    pub pointer_size: u8,
    pub compression: u8,
    pub endianness: u32,
    pub arch: u32,
    pub os: u32,
    pub first_packet_offset: u64,
    pub metadata_offset: u64,
    pub portability_table_valid: bool,
    pub gpu_info: Vec<GpuInfo>,
}

impl FileHeader {
    /// Header describing the running process.
    pub fn native(gpu_info: Vec<GpuInfo>) -> FileHeader {
        let mut h = FileHeader {
            magic: TRACE_MAGIC,
            version: TRACE_VERSION,
            pointer_size: size_of::<usize>() as u8,
            compression: COMPRESSION_NONE,
            endianness: native_endianness(),
            arch: native_arch(),
            os: native_os(),
            first_packet_offset: 0,
            metadata_offset: 0,
            portability_table_valid: false,
            gpu_info,
        };
        h.first_packet_offset = h.encoded_len() as u64;
        h
    }

    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE + self.gpu_info.len() * GPU_INFO_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.pointer_size);
        out.push(self.compression);
        out.extend_from_slice(&self.endianness.to_le_bytes());
        out.extend_from_slice(&self.arch.to_le_bytes());
        out.extend_from_slice(&self.os.to_le_bytes());
        out.extend_from_slice(&self.first_packet_offset.to_le_bytes());
        out.extend_from_slice(&self.metadata_offset.to_le_bytes());
        out.extend_from_slice(&(self.portability_table_valid as u32).to_le_bytes());
        out.extend_from_slice(&(self.gpu_info.len() as u32).to_le_bytes());
        for g in &self.gpu_info {
            out.extend_from_slice(&g.gpu_id.to_le_bytes());
            out.extend_from_slice(&g.driver_version.to_le_bytes());
        }
        out
    }

    /// Reads and checks the parts of the header every consumer depends on:
    /// magic, version range, compression and the GPU table.
    pub fn decode<R: Read>(r: &mut R) -> Result<FileHeader, TraceError> {
        let mut fixed = [0u8; FIXED_HEADER_SIZE];
        r.read_exact(&mut fixed)?;
        let magic = le_u64(&fixed, 0);
        if magic != TRACE_MAGIC {
            return Err(TraceError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([fixed[8], fixed[9]]);
        if version < TRACE_MIN_COMPATIBLE_VERSION || version > TRACE_VERSION {
            return Err(TraceError::UnsupportedVersion(version));
        }
        let compression = fixed[11];
        if compression != COMPRESSION_NONE {
            return Err(TraceError::Compressed(compression));
        }
        let n_gpuinfo = le_u32(&fixed, 44) as usize;
        if n_gpuinfo == 0 {
            return Err(TraceError::NoGpuInfo);
        }
        let mut table = vec![0u8; n_gpuinfo * GPU_INFO_SIZE];
        r.read_exact(&mut table)?;
        let gpu_info = (0..n_gpuinfo)
            .map(|i| GpuInfo {
                gpu_id: le_u64(&table, i * GPU_INFO_SIZE),
                driver_version: le_u64(&table, i * GPU_INFO_SIZE + 8),
            })
            .collect();
        Ok(FileHeader {
            magic,
            version,
            pointer_size: fixed[10],
            compression,
            endianness: le_u32(&fixed, 12),
            arch: le_u32(&fixed, 16),
            os: le_u32(&fixed, 20),
            first_packet_offset: le_u64(&fixed, 24),
            metadata_offset: le_u64(&fixed, 32),
            portability_table_valid: le_u32(&fixed, 40) != 0,
            gpu_info,
        })
    }

    /// A trace whose pointers or byte order differ from ours cannot be
    /// replayed at all.
    pub fn check_replayable(&self) -> Result<(), TraceError> {
        let pointer_size = size_of::<usize>() as u8;
        if self.pointer_size != pointer_size {
            return Err(TraceError::PointerSizeMismatch {
                trace: self.pointer_size,
                replay: pointer_size,
            });
        }
        if self.endianness != native_endianness() {
            return Err(TraceError::EndiannessMismatch {
                trace: self.endianness,
                replay: native_endianness(),
            });
        }
        Ok(())
    }

    /// True when the capture platform differs from ours in a way that needs
    /// compatibility translation.
    pub fn platform_differs(&self, replay_gpu: Option<GpuInfo>) -> bool {
        if self.arch != native_arch() || self.os != native_os() {
            return true;
        }
        match (self.gpu_info.first(), replay_gpu) {
            (Some(t), Some(r)) => *t != r,
            _ => true,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "version {}, {} bit, {}, {} on {}",
            self.version,
            self.pointer_size as u32 * 8,
            endianness_name(self.endianness),
            arch_name(self.arch),
            os_name(self.os)
        )
    }
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(w)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn sample() -> FileHeader {
        FileHeader::native(vec![GpuInfo {
            gpu_id: 0x10de_2204,
            driver_version: 0x2_0000_0001,
        }])
    }

    #[test]
    pub fn layout_and_decode() {
        let h = sample();
        let bytes = h.encode();
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE + 16);
        assert_eq!(&bytes[0..8], b"\0ECARTMP");
        assert_eq!(h.first_packet_offset, bytes.len() as u64);
        let back = FileHeader::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(back, h);
        assert!(back.check_replayable().is_ok());
        assert!(!back.platform_differs(Some(h.gpu_info[0])));
        assert!(back.platform_differs(Some(GpuInfo::default())));
    }

    #[test]
    pub fn rejects_bad_headers() {
        let mut bytes = sample().encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            FileHeader::decode(&mut Cursor::new(&bytes)),
            Err(TraceError::BadMagic(_))
        ));

        let mut h = sample();
        h.version = TRACE_VERSION + 1;
        assert!(matches!(
            FileHeader::decode(&mut Cursor::new(h.encode())),
            Err(TraceError::UnsupportedVersion(3))
        ));

        let mut h = sample();
        h.compression = 1;
        assert!(matches!(
            FileHeader::decode(&mut Cursor::new(h.encode())),
            Err(TraceError::Compressed(1))
        ));

        let h = FileHeader::native(Vec::new());
        assert!(matches!(
            FileHeader::decode(&mut Cursor::new(h.encode())),
            Err(TraceError::NoGpuInfo)
        ));

        let mut h = sample();
        h.pointer_size = 2;
        assert!(matches!(
            h.check_replayable(),
            Err(TraceError::PointerSizeMismatch { trace: 2, .. })
        ));
        let mut h = sample();
        h.endianness ^= 1;
        assert!(matches!(h.check_replayable(), Err(TraceError::EndiannessMismatch { .. })));
    }
}
