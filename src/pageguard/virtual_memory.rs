use crate::util::page_size;
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use std::{io, ptr};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

impl Protection {
    fn prot_flags(self) -> ProtFlags {
        match self {
            Protection::NoAccess => ProtFlags::PROT_NONE,
            Protection::ReadOnly => ProtFlags::PROT_READ,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

/// The slice of the OS virtual memory interface page guarding needs.
/// Addresses are plain host addresses.
pub trait VirtualMemory: Send + Sync {
    /// Anonymous read/write memory, page aligned, zero filled.
    fn allocate(&self, size: usize) -> io::Result<usize>;
    fn free(&self, addr: usize, size: usize) -> io::Result<()>;
    fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()>;
    fn page_size(&self) -> usize;
}

#[derive(Default)]
pub struct PosixVirtualMemory;

impl VirtualMemory for PosixVirtualMemory {
    fn allocate(&self, size: usize) -> io::Result<usize> {
        let res = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                Protection::ReadWrite.prot_flags(),
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        match res {
            Ok(p) => Ok(p as usize),
            Err(_) => Err(io::Error::last_os_error()),
        }
    }

    fn free(&self, addr: usize, size: usize) -> io::Result<()> {
        match unsafe { munmap(addr as *mut libc::c_void, size) } {
            Ok(()) => Ok(()),
            Err(_) => Err(io::Error::last_os_error()),
        }
    }

    fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()> {
        match unsafe { mprotect(addr as *mut libc::c_void, size, prot.prot_flags()) } {
            Ok(()) => Ok(()),
            Err(_) => Err(io::Error::last_os_error()),
        }
    }

    fn page_size(&self) -> usize {
        page_size()
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Heap backed stand-in. Protection changes are recorded per page but
    /// never enforced, so tests drive faults by hand.
    pub struct MockVirtualMemory {
        page_size: usize,
        blocks: Mutex<HashMap<usize, Box<[u8]>>>,
        protections: Mutex<HashMap<usize, Protection>>,
        pub fail_allocations: AtomicBool,
        pub protect_calls: AtomicUsize,
    }

    impl MockVirtualMemory {
        pub fn new(page_size: usize) -> MockVirtualMemory {
            MockVirtualMemory {
                page_size,
                blocks: Mutex::new(HashMap::new()),
                protections: Mutex::new(HashMap::new()),
                fail_allocations: AtomicBool::new(false),
                protect_calls: AtomicUsize::new(0),
            }
        }

        pub fn protection_of(&self, addr: usize) -> Option<Protection> {
            let page = addr - addr % self.page_size;
            self.protections.lock().unwrap().get(&page).copied()
        }

        pub fn live_blocks(&self) -> usize {
            self.blocks.lock().unwrap().len()
        }
    }

    impl VirtualMemory for MockVirtualMemory {
        fn allocate(&self, size: usize) -> io::Result<usize> {
            if self.fail_allocations.load(Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            // Over-allocate so the returned address can be page aligned.
            let block = vec![0u8; size + self.page_size].into_boxed_slice();
            let raw = block.as_ptr() as usize;
            let aligned = (raw + self.page_size - 1) / self.page_size * self.page_size;
            self.blocks.lock().unwrap().insert(aligned, block);
            Ok(aligned)
        }

        fn free(&self, addr: usize, _size: usize) -> io::Result<()> {
            match self.blocks.lock().unwrap().remove(&addr) {
                Some(_) => Ok(()),
                None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            }
        }

        fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()> {
            self.protect_calls.fetch_add(1, Ordering::SeqCst);
            let mut p = self.protections.lock().unwrap();
            let mut page = addr - addr % self.page_size;
            while page < addr + size {
                p.insert(page, prot);
                page += self.page_size;
            }
            Ok(())
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }
}
