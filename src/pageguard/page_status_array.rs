use crate::pageguard::AccessKind;

bitflags! {
    /// Per page state. `LOADED` survives a reset; the other bits do not.
    #[derive(Default)]
    pub struct PageFlags: u8 {
        /// Written since the last reset.
        const CHANGED = 0x1;
        /// Read since the last reset (read tracking only).
        const READ = 0x2;
        /// The shadow page holds a copy of the real page.
        const LOADED = 0x4;
    }
}

/// One page worth of changed data, relative to the start of the mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageRange {
    pub page_index: usize,
    pub offset: usize,
    /// Equal to the page size except possibly for the last page.
    pub size: usize,
}

/// Page bookkeeping for one shadow region of `size` bytes at `base`.
pub struct PageStatusArray {
    base: usize,
    size: usize,
    page_size: usize,
    pages: Vec<PageFlags>,
}

impl PageStatusArray {
    pub fn new(base: usize, size: usize, page_size: usize) -> PageStatusArray {
        debug_assert!(page_size.is_power_of_two());
        let count = (size + page_size - 1) / page_size;
        PageStatusArray {
            base,
            size,
            page_size,
            pages: vec![PageFlags::empty(); count],
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// `None` for addresses outside `[base, base + size)`.
    pub fn index_for_address(&self, addr: usize) -> Option<usize> {
        if addr < self.base || addr >= self.base + self.size {
            return None;
        }
        Some((addr - self.base) / self.page_size)
    }

    pub fn page_offset(&self, index: usize) -> usize {
        index * self.page_size
    }

    /// Bytes of page `index` that fall inside the region.
    pub fn page_len(&self, index: usize) -> usize {
        let off = self.page_offset(index);
        std::cmp::min(self.page_size, self.size - off)
    }

    pub fn mark_changed(&mut self, index: usize, access: AccessKind) {
        let flag = match access {
            AccessKind::Write => PageFlags::CHANGED,
            AccessKind::Read => PageFlags::READ,
        };
        self.pages[index].insert(flag);
    }

    pub fn flags(&self, index: usize) -> PageFlags {
        self.pages[index]
    }

    pub fn is_changed(&self, index: usize) -> bool {
        self.pages[index].contains(PageFlags::CHANGED)
    }

    pub fn is_read(&self, index: usize) -> bool {
        self.pages[index].contains(PageFlags::READ)
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.pages[index].contains(PageFlags::LOADED)
    }

    pub fn set_loaded(&mut self, index: usize, loaded: bool) {
        self.pages[index].set(PageFlags::LOADED, loaded);
    }

    pub fn set_all_loaded(&mut self) {
        for p in self.pages.iter_mut() {
            p.insert(PageFlags::LOADED);
        }
    }

    /// Clears the changed and read bits of every page. Protection is the
    /// owner's business.
    pub fn clear_access_flags(&mut self) {
        for p in self.pages.iter_mut() {
            p.remove(PageFlags::CHANGED | PageFlags::READ);
        }
    }

    pub fn clear_read(&mut self, index: usize) {
        self.pages[index].remove(PageFlags::READ);
    }

    pub fn changed_count(&self) -> usize {
        self.pages.iter().filter(|p| p.contains(PageFlags::CHANGED)).count()
    }

    /// Changed pages in ascending order. Recomputed on every call.
    pub fn changed_ranges(&self) -> impl Iterator<Item = PageRange> + '_ {
        self.pages_with(PageFlags::CHANGED)
    }

    pub fn pages_with(&self, flag: PageFlags) -> impl Iterator<Item = PageRange> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.contains(flag))
            .map(move |(i, _)| PageRange {
                page_index: i,
                offset: self.page_offset(i),
                size: self.page_len(i),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: usize = 0x7000_0000;

    #[test]
    pub fn index_for_address_matches_division() {
        let a = PageStatusArray::new(BASE, 3 * 4096 - 100, 4096);
        assert_eq!(a.page_count(), 3);
        for addr in (BASE..BASE + 3 * 4096 - 100).step_by(97) {
            assert_eq!(a.index_for_address(addr), Some((addr - BASE) / 4096));
        }
        assert_eq!(a.index_for_address(BASE - 1), None);
        assert_eq!(a.index_for_address(BASE + 3 * 4096 - 100), None);
        assert_eq!(a.page_len(2), 4096 - 100);
    }

    #[test]
    pub fn changed_ranges_cover_exactly_touched_pages() {
        let mut a = PageStatusArray::new(BASE, 8 * 4096, 4096);
        for &p in &[6usize, 1, 3, 1] {
            a.mark_changed(p, AccessKind::Write);
        }
        a.mark_changed(4, AccessKind::Read);
        let got: Vec<usize> = a.changed_ranges().map(|r| r.page_index).collect();
        assert_eq!(got, vec![1, 3, 6]);
        assert_eq!(a.changed_count(), 3);
        assert!(a.is_read(4) && !a.is_changed(4));

        a.set_loaded(3, true);
        a.clear_access_flags();
        assert_eq!(a.changed_ranges().count(), 0);
        assert!(a.is_loaded(3));
        a.clear_access_flags();
        assert_eq!(a.changed_ranges().count(), 0);
    }
}
