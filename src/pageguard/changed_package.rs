//! The changed-data package: a table of `PageGuardChangedBlockInfo`
//! entries followed by the raw bytes of every block, back to back.
//!
//! Entry 0 is a header (block count, total data bytes, flags). Entries
//! 1..=n give each block's byte offset from the start of the mapping and
//! its length. All words are little endian on disk.

use std::{
    convert::TryFrom,
    error::Error,
    fmt::{self, Display, Formatter},
    mem::size_of,
};

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageGuardChangedBlockInfo {
    pub offset: u32,
    pub length: u32,
    pub reserve0: u32,
    pub reserve1: u32,
}

assert_eq_size!(PageGuardChangedBlockInfo, [u8; 16]);

const INFO_SIZE: usize = size_of::<PageGuardChangedBlockInfo>();

bitflags! {
    #[derive(Default)]
    pub struct PackageFlags: u32 {
        /// Injected by the capture layer rather than issued by the
        /// application. Replay applies it without a real flush.
        const SPECIAL_FORMAT = 0x1;
    }
}

impl PageGuardChangedBlockInfo {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.reserve0.to_le_bytes());
        out.extend_from_slice(&self.reserve1.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> PageGuardChangedBlockInfo {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        PageGuardChangedBlockInfo {
            offset: word(0),
            length: word(4),
            reserve0: word(8),
            reserve1: word(12),
        }
    }
}

/// Largest offset, block length or total the 32 bit table can describe.
pub const MAX_PACKAGE_EXTENT: usize = u32::MAX as usize;

fn word(n: usize) -> Result<u32, PackageError> {
    u32::try_from(n).map_err(|_| PackageError::TooLarge { size: n })
}

/// Builds a package from `(offset, bytes)` blocks. Returns `None` when
/// there is nothing to send.
pub fn encode_package(
    blocks: &[(usize, &[u8])],
    flags: PackageFlags,
) -> Result<Option<Vec<u8>>, PackageError> {
    if blocks.is_empty() {
        return Ok(None);
    }
    let total: usize = blocks.iter().map(|(_, b)| b.len()).sum();
    let header = PageGuardChangedBlockInfo {
        offset: word(blocks.len())?,
        length: word(total)?,
        reserve0: flags.bits(),
        reserve1: 0,
    };
    let mut entries = Vec::with_capacity(blocks.len());
    for (offset, data) in blocks {
        word(*offset + data.len())?;
        entries.push(PageGuardChangedBlockInfo {
            offset: word(*offset)?,
            length: word(data.len())?,
            reserve0: 0,
            reserve1: 0,
        });
    }
    let mut out = Vec::with_capacity((blocks.len() + 1) * INFO_SIZE + total);
    header.write_to(&mut out);
    for e in &entries {
        e.write_to(&mut out);
    }
    for (_, data) in blocks {
        out.extend_from_slice(data);
    }
    Ok(Some(out))
}

/// Package for a mapping that is not page tracked: one block covering
/// every byte of `[addr, addr + size)`.
///
/// # Safety
/// `addr` must be readable for `size` bytes.
pub unsafe fn package_whole_range(
    addr: usize,
    size: usize,
    flags: PackageFlags,
) -> Result<Option<Vec<u8>>, PackageError> {
    if size == 0 {
        return Ok(None);
    }
    word(size)?;
    let data = std::slice::from_raw_parts(addr as *const u8, size);
    encode_package(&[(0, data)], flags)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChangedBlock<'a> {
    pub offset: usize,
    pub data: &'a [u8],
}

#[derive(Debug)]
pub struct DecodedPackage<'a> {
    pub flags: PackageFlags,
    pub blocks: Vec<ChangedBlock<'a>>,
}

impl<'a> DecodedPackage<'a> {
    pub fn is_special_format(&self) -> bool {
        self.flags.contains(PackageFlags::SPECIAL_FORMAT)
    }

    pub fn data_len(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    /// Copy every block into `dst`, which represents the mapping.
    pub fn apply_to(&self, dst: &mut [u8]) -> Result<(), PackageError> {
        for b in &self.blocks {
            let end = b.offset + b.data.len();
            if end > dst.len() {
                return Err(PackageError::BlockOutOfBounds {
                    offset: b.offset,
                    len: b.data.len(),
                    limit: dst.len(),
                });
            }
            dst[b.offset..end].copy_from_slice(b.data);
        }
        Ok(())
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum PackageError {
    Truncated { needed: usize, have: usize },
    LengthMismatch { header: usize, blocks: usize },
    BlockOutOfBounds { offset: usize, len: usize, limit: usize },
    TooLarge { size: usize },
}

impl Display for PackageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PackageError::Truncated { needed, have } => {
                write!(f, "changed-data package truncated: need {} bytes, have {}", needed, have)
            }
            PackageError::LengthMismatch { header, blocks } => write!(
                f,
                "changed-data package header claims {} bytes but blocks sum to {}",
                header, blocks
            ),
            PackageError::BlockOutOfBounds { offset, len, limit } => write!(
                f,
                "changed block {:#x}+{:#x} does not fit a mapping of {:#x} bytes",
                offset, len, limit
            ),
            PackageError::TooLarge { size } => write!(
                f,
                "changed data extent {:#x} does not fit a 32 bit package table",
                size
            ),
        }
    }
}

impl Error for PackageError {}

impl From<PackageError> for std::io::Error {
    fn from(e: PackageError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

pub fn decode_package(bytes: &[u8]) -> Result<DecodedPackage<'_>, PackageError> {
    if bytes.len() < INFO_SIZE {
        return Err(PackageError::Truncated {
            needed: INFO_SIZE,
            have: bytes.len(),
        });
    }
    let header = PageGuardChangedBlockInfo::read_from(&bytes[..INFO_SIZE]);
    let count = header.offset as usize;
    let table_len = (count + 1) * INFO_SIZE;
    if bytes.len() < table_len {
        return Err(PackageError::Truncated {
            needed: table_len,
            have: bytes.len(),
        });
    }
    let mut infos = Vec::with_capacity(count);
    let mut sum = 0usize;
    for i in 1..=count {
        let info = PageGuardChangedBlockInfo::read_from(&bytes[i * INFO_SIZE..(i + 1) * INFO_SIZE]);
        sum += info.length as usize;
        infos.push(info);
    }
    if sum != header.length as usize {
        return Err(PackageError::LengthMismatch {
            header: header.length as usize,
            blocks: sum,
        });
    }
    if bytes.len() < table_len + sum {
        return Err(PackageError::Truncated {
            needed: table_len + sum,
            have: bytes.len(),
        });
    }
    let mut cursor = table_len;
    let mut blocks = Vec::with_capacity(count);
    for info in infos {
        let len = info.length as usize;
        blocks.push(ChangedBlock {
            offset: info.offset as usize,
            data: &bytes[cursor..cursor + len],
        });
        cursor += len;
    }
    Ok(DecodedPackage {
        flags: PackageFlags::from_bits_truncate(header.reserve0),
        blocks,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn layout_is_four_words() {
        assert_eq!(offset_of!(PageGuardChangedBlockInfo, offset), 0);
        assert_eq!(offset_of!(PageGuardChangedBlockInfo, length), 4);
        assert_eq!(offset_of!(PageGuardChangedBlockInfo, reserve0), 8);
        assert_eq!(offset_of!(PageGuardChangedBlockInfo, reserve1), 12);
    }

    #[test]
    pub fn package_layout_and_apply() {
        let a = [1u8; 8];
        let b = [2u8; 4];
        let pkg = encode_package(&[(0x1000, &a[..]), (0x3000, &b[..])], PackageFlags::SPECIAL_FORMAT)
            .unwrap()
            .unwrap();
        assert_eq!(pkg.len(), 3 * 16 + 12);
        // Header words.
        assert_eq!(&pkg[0..4], &2u32.to_le_bytes());
        assert_eq!(&pkg[4..8], &12u32.to_le_bytes());
        assert_eq!(&pkg[8..12], &1u32.to_le_bytes());
        // First block entry.
        assert_eq!(&pkg[16..20], &0x1000u32.to_le_bytes());
        assert_eq!(&pkg[20..24], &8u32.to_le_bytes());

        let d = decode_package(&pkg).unwrap();
        assert!(d.is_special_format());
        assert_eq!(d.blocks.len(), 2);
        assert_eq!(d.blocks[1], ChangedBlock { offset: 0x3000, data: &b[..] });

        let mut mapping = vec![0u8; 0x4000];
        d.apply_to(&mut mapping).unwrap();
        assert_eq!(mapping[0x1007], 1);
        assert_eq!(mapping[0x3003], 2);
        assert_eq!(mapping[0x3004], 0);

        let mut small = vec![0u8; 0x2000];
        assert!(matches!(
            d.apply_to(&mut small),
            Err(PackageError::BlockOutOfBounds { offset: 0x3000, .. })
        ));
    }

    #[test]
    pub fn empty_and_damaged_packages() {
        assert!(encode_package(&[], PackageFlags::empty()).unwrap().is_none());
        let pkg = encode_package(&[(0, &[9u8; 16][..])], PackageFlags::empty())
            .unwrap()
            .unwrap();
        assert!(matches!(
            decode_package(&pkg[..pkg.len() - 1]),
            Err(PackageError::Truncated { .. })
        ));
        assert!(matches!(decode_package(&pkg[..8]), Err(PackageError::Truncated { .. })));
        let d = decode_package(&pkg).unwrap();
        assert!(!d.is_special_format());
        assert_eq!(d.data_len(), 16);
    }

    #[test]
    pub fn offsets_past_four_gib_are_refused() {
        let data = [1u8; 4];
        assert_eq!(
            encode_package(&[(MAX_PACKAGE_EXTENT, &data[..])], PackageFlags::empty()),
            Err(PackageError::TooLarge {
                size: MAX_PACKAGE_EXTENT + 4
            })
        );
        assert!(encode_package(&[(MAX_PACKAGE_EXTENT - 4, &data[..])], PackageFlags::empty())
            .unwrap()
            .is_some());
        assert!(matches!(
            unsafe { package_whole_range(data.as_ptr() as usize, MAX_PACKAGE_EXTENT + 1, PackageFlags::empty()) },
            Err(PackageError::TooLarge { .. })
        ));
    }
}
