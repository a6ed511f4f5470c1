use nix::unistd::{gettid, sysconf, SysconfVar::PAGE_SIZE};
use std::{
    convert::TryInto,
    time::{SystemTime, UNIX_EPOCH},
};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

fn page_size_init() -> usize {
    match sysconf(PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        // Every platform we run on has at least 4k pages.
        _ => 4096,
    }
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

/// `align` must be a power of two.
pub fn ceil_to(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// `align` must be a power of two.
pub fn floor_to(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    size & !(align - 1)
}

pub fn ceil_page_size<T: Into<usize> + From<usize>>(size: T) -> T {
    ceil_to(size.into(), page_size()).into()
}

pub fn floor_page_size<T: Into<usize> + From<usize>>(sz: T) -> T {
    floor_to(sz.into(), page_size()).into()
}

/// Total physical memory in bytes, if the OS is willing to tell us.
pub fn physical_memory_bytes() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let pages: u64 = pages.try_into().ok()?;
    if pages == 0 {
        return None;
    }
    Some(pages * page_size() as u64)
}

pub fn current_thread_id() -> u32 {
    gettid().as_raw() as u32
}

/// Nanoseconds since the epoch. Only used for packet timestamps and replay timing.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub const ENDIAN_LITTLE: u32 = 0;
pub const ENDIAN_BIG: u32 = 1;

pub fn native_endianness() -> u32 {
    if cfg!(target_endian = "little") {
        ENDIAN_LITTLE
    } else {
        ENDIAN_BIG
    }
}

pub fn endianness_name(e: u32) -> &'static str {
    match e {
        ENDIAN_LITTLE => "little endian",
        ENDIAN_BIG => "big endian",
        _ => "unknown endianness",
    }
}

/// Parse a number written either as decimal or as hex with a `0x` prefix.
pub fn parse_u64_auto(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn page_rounding() {
        assert_eq!(ceil_to(0, 4096), 0);
        assert_eq!(ceil_to(1, 4096), 4096);
        assert_eq!(ceil_to(4096, 4096), 4096);
        assert_eq!(ceil_to(4097, 4096), 8192);
        assert_eq!(floor_to(4097, 4096), 4096);
        assert_eq!(floor_to(4095, 4096), 0);
        assert!(page_size().is_power_of_two());
        assert_eq!(ceil_page_size(1usize), page_size());
    }

    #[test]
    pub fn parse_numbers() {
        assert_eq!(parse_u64_auto("0x800"), Some(0x800));
        assert_eq!(parse_u64_auto("2048"), Some(2048));
        assert_eq!(parse_u64_auto("zz"), None);
    }
}
