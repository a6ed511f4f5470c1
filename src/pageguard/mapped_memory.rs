use crate::{
    pageguard::{
        changed_package::{encode_package, PackageFlags, MAX_PACKAGE_EXTENT},
        memory_range::MemoryRange,
        options::PageGuardOptions,
        page_status_array::{PageFlags, PageStatusArray},
        virtual_memory::{Protection, VirtualMemory},
        AccessKind,
    },
    util::ceil_to,
};
use std::{io, ptr, slice, sync::Arc};

unsafe fn copy_bytes(src: usize, dst: usize, len: usize) {
    ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
}

/// One tracked mapping: the driver's real mapping plus the shadow the
/// application writes into.
///
/// Everything here runs under the capture lock. `handle_fault` in
/// particular runs inside the SIGSEGV handler and must not log or allocate.
pub struct PageGuardMappedMemory {
    memory: u64,
    map_offset: u64,
    real_base: usize,
    size: usize,
    shadow_base: usize,
    shadow_size: usize,
    pages: PageStatusArray,
    vm: Arc<dyn VirtualMemory>,
    opts: PageGuardOptions,
    lazy_loads: u64,
}

impl PageGuardMappedMemory {
    /// Allocate the shadow for `[real_base, real_base + size)` and arm it.
    pub fn map(
        memory: u64,
        map_offset: u64,
        real_base: usize,
        size: usize,
        vm: Arc<dyn VirtualMemory>,
        opts: PageGuardOptions,
    ) -> io::Result<PageGuardMappedMemory> {
        if size > MAX_PACKAGE_EXTENT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapping of {:#x} bytes is too large to track", size),
            ));
        }
        let page_size = vm.page_size();
        let shadow_size = ceil_to(size, page_size);
        let shadow_base = vm.allocate(shadow_size)?;
        let mut m = PageGuardMappedMemory {
            memory,
            map_offset,
            real_base,
            size,
            shadow_base,
            shadow_size,
            pages: PageStatusArray::new(shadow_base, size, page_size),
            vm,
            opts,
            lazy_loads: 0,
        };
        if !opts.lazy_copy {
            unsafe { copy_bytes(real_base, shadow_base, size) };
            m.pages.set_all_loaded();
        }
        // On failure `m` is dropped, which frees the shadow.
        m.arm_pages()?;
        Ok(m)
    }

    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    pub fn real_base(&self) -> usize {
        self.real_base
    }

    pub fn shadow_base(&self) -> usize {
        self.shadow_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn shadow_range(&self) -> MemoryRange {
        MemoryRange::new_range(self.shadow_base, self.size)
    }

    pub fn pages(&self) -> &PageStatusArray {
        &self.pages
    }

    pub fn lazy_loads(&self) -> u64 {
        self.lazy_loads
    }

    fn guard_for(&self, flags: PageFlags) -> Protection {
        if self.opts.read_tracking || !flags.contains(PageFlags::LOADED) {
            Protection::NoAccess
        } else {
            Protection::ReadOnly
        }
    }

    fn protect_page(&self, index: usize, prot: Protection) -> io::Result<()> {
        let ps = self.pages.page_size();
        self.vm.protect(self.shadow_base + index * ps, ps, prot)
    }

    /// Re-arm every page, coalescing runs of equal protection.
    fn arm_pages(&self) -> io::Result<()> {
        let ps = self.pages.page_size();
        let count = self.pages.page_count();
        let mut run_start = 0;
        while run_start < count {
            let prot = self.guard_for(self.pages.flags(run_start));
            let mut run_end = run_start + 1;
            while run_end < count && self.guard_for(self.pages.flags(run_end)) == prot {
                run_end += 1;
            }
            self.vm.protect(
                self.shadow_base + run_start * ps,
                (run_end - run_start) * ps,
                prot,
            )?;
            run_start = run_end;
        }
        Ok(())
    }

    fn load_page(&mut self, index: usize) {
        let off = self.pages.page_offset(index);
        let len = self.pages.page_len(index);
        unsafe { copy_bytes(self.real_base + off, self.shadow_base + off, len) };
    }

    /// Service a trap at `addr`. `Ok(false)` means the address is not ours.
    pub fn handle_fault(&mut self, addr: usize, access: AccessKind) -> io::Result<bool> {
        let index = match self.pages.index_for_address(addr) {
            Some(i) => i,
            None => return Ok(false),
        };
        // A write already unprotected this page and the shadow holds the
        // application's data. A trap queued behind it must leave both alone.
        if self.pages.is_changed(index) {
            return Ok(true);
        }
        // Without read tracking a read only traps on a page that was never
        // loaded, and that read must not count as a change.
        let loaded = self.pages.is_loaded(index);
        self.protect_page(index, Protection::ReadWrite)?;
        if !loaded {
            self.load_page(index);
            self.pages.set_loaded(index, true);
            self.lazy_loads += 1;
        }
        match access {
            AccessKind::Write => self.pages.mark_changed(index, AccessKind::Write),
            AccessKind::Read => {
                if self.opts.read_tracking {
                    // Reads observe what the GPU last wrote.
                    if loaded {
                        self.load_page(index);
                    }
                    self.pages.mark_changed(index, AccessKind::Read);
                    if self.opts.read_post_process {
                        self.pages.mark_changed(index, AccessKind::Write);
                        return Ok(true);
                    }
                }
                // Keep trapping writes to this page.
                self.protect_page(index, Protection::ReadOnly)?;
            }
        }
        Ok(true)
    }

    /// Changed pages as a package. Unless `peek` is set, the changed pages
    /// are also written through to the real mapping and the guard is
    /// re-armed.
    pub fn changed_data_package(
        &mut self,
        peek: bool,
        flags: PackageFlags,
    ) -> io::Result<Option<Vec<u8>>> {
        let ranges: Vec<_> = self.pages.changed_ranges().collect();
        let blocks: Vec<(usize, &[u8])> = ranges
            .iter()
            .map(|r| {
                let data = unsafe {
                    slice::from_raw_parts((self.shadow_base + r.offset) as *const u8, r.size)
                };
                (r.offset, data)
            })
            .collect();
        let package = encode_package(&blocks, flags)?;
        if !peek {
            for r in &ranges {
                unsafe { copy_bytes(self.shadow_base + r.offset, self.real_base + r.offset, r.size) };
            }
            self.reset_all()?;
        }
        Ok(package)
    }

    /// Forget all changes and re-arm every page. Loaded state is kept.
    pub fn reset_all(&mut self) -> io::Result<()> {
        if self.opts.sync_gpu_data_back {
            self.vm
                .protect(self.shadow_base, self.shadow_size, Protection::ReadWrite)?;
            let loaded: Vec<_> = self.pages.pages_with(PageFlags::LOADED).collect();
            for r in loaded {
                unsafe { copy_bytes(self.real_base + r.offset, self.shadow_base + r.offset, r.size) };
            }
        }
        self.pages.clear_access_flags();
        self.arm_pages()
    }

    /// Re-arm pages that were only read so the next frame's reads are seen.
    pub fn reset_read_flags(&mut self) -> io::Result<()> {
        let read_only: Vec<usize> = self
            .pages
            .pages_with(PageFlags::READ)
            .filter(|r| !self.pages.is_changed(r.page_index))
            .map(|r| r.page_index)
            .collect();
        for index in read_only {
            self.pages.clear_read(index);
            self.protect_page(index, Protection::NoAccess)?;
        }
        Ok(())
    }
}

impl Drop for PageGuardMappedMemory {
    fn drop(&mut self) {
        self.vm.free(self.shadow_base, self.shadow_size).unwrap_or(());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pageguard::{changed_package::decode_package, virtual_memory::mock::MockVirtualMemory};

    const PS: usize = 4096;

    fn opts(lazy: bool) -> PageGuardOptions {
        PageGuardOptions {
            lazy_copy: lazy,
            ..Default::default()
        }
    }

    fn real_region(pages: usize) -> Vec<u8> {
        (0..pages * PS).map(|i| (i / PS) as u8 + 1).collect()
    }

    #[test]
    pub fn single_write_yields_one_page_then_nothing() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = real_region(3);
        let mut m =
            PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, 3 * PS, vm.clone(), opts(false))
                .unwrap();
        assert_eq!(vm.protection_of(m.shadow_base()), Some(Protection::ReadOnly));

        let addr = m.shadow_base() + 4097;
        assert!(m.handle_fault(addr, AccessKind::Write).unwrap());
        assert_eq!(vm.protection_of(addr), Some(Protection::ReadWrite));
        unsafe { ptr::write_bytes(addr as *mut u8, 0xee, 10) };

        let pkg = m.changed_data_package(false, PackageFlags::empty()).unwrap().unwrap();
        let d = decode_package(&pkg).unwrap();
        assert_eq!(d.blocks.len(), 1);
        assert_eq!(d.blocks[0].offset, PS);
        assert_eq!(d.blocks[0].data.len(), PS);
        // Written through to the real mapping.
        assert_eq!(real[4097], 0xee);
        assert_eq!(real[4107], 2);
        assert_eq!(vm.protection_of(addr), Some(Protection::ReadOnly));

        m.reset_all().unwrap();
        assert!(m.changed_data_package(false, PackageFlags::empty()).unwrap().is_none());
    }

    #[test]
    pub fn lazy_copy_loads_page_once() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = real_region(4);
        let mut m =
            PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, 4 * PS, vm.clone(), opts(true))
                .unwrap();
        assert_eq!(vm.protection_of(m.shadow_base() + 2 * PS), Some(Protection::NoAccess));
        assert!(!m.pages().is_loaded(2));

        let addr = m.shadow_base() + 2 * PS + 8;
        m.handle_fault(addr, AccessKind::Write).unwrap();
        assert!(m.pages().is_loaded(2));
        assert!(m.pages().is_changed(2));
        assert_eq!(m.lazy_loads(), 1);
        // The shadow picked up the real contents before the write.
        assert_eq!(unsafe { *((addr - 8) as *const u8) }, 3);

        m.changed_data_package(false, PackageFlags::empty()).unwrap();
        assert_eq!(vm.protection_of(addr), Some(Protection::ReadOnly));
        m.handle_fault(addr, AccessKind::Write).unwrap();
        assert_eq!(m.lazy_loads(), 1);
        // Untouched pages are still unloaded.
        assert!(!m.pages().is_loaded(0));
    }

    #[test]
    pub fn read_tracking_refreshes_and_rearms() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = real_region(2);
        let o = PageGuardOptions {
            read_tracking: true,
            ..Default::default()
        };
        let mut m =
            PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, 2 * PS, vm.clone(), o).unwrap();
        // The GPU writes the real memory behind the application's back.
        real[PS] = 0x55;
        let addr = m.shadow_base() + PS;
        m.handle_fault(addr, AccessKind::Read).unwrap();
        assert_eq!(unsafe { *(addr as *const u8) }, 0x55);
        assert!(m.pages().is_read(1));
        assert!(!m.pages().is_changed(1));
        assert_eq!(vm.protection_of(addr), Some(Protection::ReadOnly));
        assert!(m.changed_data_package(true, PackageFlags::empty()).unwrap().is_none());

        m.reset_read_flags().unwrap();
        assert!(!m.pages().is_read(1));
        assert_eq!(vm.protection_of(addr), Some(Protection::NoAccess));
    }

    #[test]
    pub fn post_process_marks_reads_changed() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = real_region(2);
        let o = PageGuardOptions {
            read_tracking: true,
            read_post_process: true,
            ..Default::default()
        };
        let mut m =
            PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, 2 * PS, vm, o).unwrap();
        m.handle_fault(m.shadow_base(), AccessKind::Read).unwrap();
        let pkg = m.changed_data_package(true, PackageFlags::empty()).unwrap().unwrap();
        assert_eq!(decode_package(&pkg).unwrap().blocks[0].offset, 0);
    }

    #[test]
    pub fn partial_last_page_and_foreign_address() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = vec![0u8; PS + 100];
        let mut m =
            PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, PS + 100, vm.clone(), opts(false))
                .unwrap();
        assert!(!m.handle_fault(m.shadow_base() + PS + 100, AccessKind::Write).unwrap());
        m.handle_fault(m.shadow_base() + PS + 1, AccessKind::Write).unwrap();
        let pkg = m.changed_data_package(false, PackageFlags::empty()).unwrap().unwrap();
        assert_eq!(decode_package(&pkg).unwrap().blocks[0].data.len(), 100);
        drop(m);
        assert_eq!(vm.live_blocks(), 0);
    }

    #[test]
    pub fn sync_back_refreshes_loaded_pages() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = real_region(2);
        let o = PageGuardOptions {
            sync_gpu_data_back: true,
            ..Default::default()
        };
        let m = PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, 2 * PS, vm, o);
        let mut m = m.unwrap();
        real[10] = 0x77;
        m.reset_all().unwrap();
        assert_eq!(unsafe { *((m.shadow_base() + 10) as *const u8) }, 0x77);
    }

    #[test]
    pub fn late_read_trap_keeps_an_earlier_write() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let mut real = real_region(2);
        let mut m =
            PageGuardMappedMemory::map(1, 0, real.as_mut_ptr() as usize, 2 * PS, vm.clone(), opts(true))
                .unwrap();
        let addr = m.shadow_base() + 8;
        assert!(m.handle_fault(addr, AccessKind::Write).unwrap());
        unsafe { ptr::write_volatile(addr as *mut u8, 0xaa) };
        // A read trap on the same page that was waiting for the capture lock.
        assert!(m.handle_fault(addr, AccessKind::Read).unwrap());

        assert_eq!(unsafe { *(addr as *const u8) }, 0xaa);
        assert!(m.pages().is_changed(0));
        assert_eq!(vm.protection_of(addr), Some(Protection::ReadWrite));
        assert_eq!(m.lazy_loads(), 1);

        let pkg = m.changed_data_package(false, PackageFlags::empty()).unwrap().unwrap();
        let d = decode_package(&pkg).unwrap();
        assert_eq!(d.blocks.len(), 1);
        assert_eq!(d.blocks[0].data[8], 0xaa);
        assert_eq!(d.blocks[0].data[9], 1);
        assert_eq!(real[8], 0xaa);
    }

    #[test]
    pub fn mappings_past_the_package_limit_are_refused() {
        let vm = Arc::new(MockVirtualMemory::new(PS));
        let err = PageGuardMappedMemory::map(1, 0, 0x1000, MAX_PACKAGE_EXTENT + 1, vm.clone(), opts(true))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(vm.live_blocks(), 0);
    }
}
