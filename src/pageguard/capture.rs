use crate::{
    log::LogLevel::{LogDebug, LogWarn},
    pageguard::{
        changed_package::{package_whole_range, PackageFlags},
        fault_handler::{FaultHandlerId, FaultTrap},
        mapped_memory::PageGuardMappedMemory,
        memory_range::MemoryRangeKey,
        options::PageGuardOptions,
        virtual_memory::VirtualMemory,
        AccessKind,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

/// Counters bumped from the fault path, which cannot log.
#[derive(Default, Debug)]
pub struct FaultStats {
    pub faults: AtomicU64,
    pub unmatched: AtomicU64,
    pub protect_failures: AtomicU64,
}

/// Where the application should read and write a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapOutcome {
    Tracked { shadow: usize },
    Untracked { real: usize },
}

impl MapOutcome {
    pub fn app_pointer(&self) -> usize {
        match *self {
            MapOutcome::Tracked { shadow } => shadow,
            MapOutcome::Untracked { real } => real,
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, MapOutcome::Tracked { .. })
    }
}

struct Tracked {
    region: PageGuardMappedMemory,
    handler: FaultHandlerId,
}

struct Untracked {
    real_base: usize,
    size: usize,
}

#[derive(Default)]
struct CaptureState {
    tracked: HashMap<u64, Tracked>,
    by_range: BTreeMap<MemoryRangeKey, u64>,
    untracked: HashMap<u64, Untracked>,
}

/// Registry of every live mapping, keyed by device memory handle.
///
/// The state mutex is the capture lock: faults and map/unmap/flush all
/// serialize on it. Fault handler registration happens outside of it
/// because the signal handler takes the callback list first and this lock
/// second.
pub struct PageGuardCapture {
    state: Mutex<CaptureState>,
    vm: Arc<dyn VirtualMemory>,
    trap: Arc<dyn FaultTrap>,
    opts: PageGuardOptions,
    stats: FaultStats,
}

impl PageGuardCapture {
    pub fn new(
        vm: Arc<dyn VirtualMemory>,
        trap: Arc<dyn FaultTrap>,
        opts: PageGuardOptions,
    ) -> Arc<PageGuardCapture> {
        Arc::new(PageGuardCapture {
            state: Mutex::new(CaptureState::default()),
            vm,
            trap,
            opts,
            stats: FaultStats::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &PageGuardOptions {
        &self.opts
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Start tracking `[real_base, real_base + size)`, the driver's mapping
    /// of `memory` at `map_offset`. Falls back to untracked capture when
    /// tracking is off, the mapping is small, or the OS refuses.
    pub fn map(
        self: &Arc<Self>,
        memory: u64,
        map_offset: u64,
        real_base: usize,
        size: usize,
    ) -> MapOutcome {
        if self.is_mapped(memory) {
            match self.unmap(memory) {
                Ok(Some(pending)) => log!(
                    LogWarn,
                    "Memory {:#x} mapped twice; {} bytes of unflushed changes from the old mapping are lost",
                    memory,
                    pending.len()
                ),
                Ok(None) => log!(LogWarn, "Memory {:#x} mapped twice; dropping the old mapping", memory),
                Err(e) => log!(LogWarn, "Memory {:#x} mapped twice; old mapping: {}", memory, e),
            }
        }
        let untracked = || {
            self.lock().untracked.insert(memory, Untracked { real_base, size });
            MapOutcome::Untracked { real: real_base }
        };
        if !self.opts.enabled || size == 0 || size < self.opts.target_range_size {
            return untracked();
        }
        let region = match PageGuardMappedMemory::map(
            memory,
            map_offset,
            real_base,
            size,
            self.vm.clone(),
            self.opts,
        ) {
            Ok(r) => r,
            Err(e) => {
                log!(LogWarn, "Page guard disabled for memory {:#x}: {}", memory, e);
                return untracked();
            }
        };
        let weak = Arc::downgrade(self);
        let handler = match self.trap.install_fault_handler(Box::new(move |addr, access| {
            match weak.upgrade() {
                Some(capture) => capture.handle_fault(addr, access),
                None => false,
            }
        })) {
            Ok(id) => id,
            Err(e) => {
                log!(LogWarn, "Could not install the fault handler ({}); page guard disabled", e);
                drop(region);
                return untracked();
            }
        };
        let shadow = region.shadow_base();
        log!(
            LogDebug,
            "Tracking memory {:#x}: real {:#x} shadow {} ({} pages)",
            memory,
            real_base,
            region.shadow_range(),
            region.pages().page_count()
        );
        let mut st = self.lock();
        st.by_range.insert(region.shadow_range().into(), memory);
        st.tracked.insert(memory, Tracked { region, handler });
        MapOutcome::Tracked { shadow }
    }

    /// Entry point from the fault trap. Never logs.
    pub fn handle_fault(&self, addr: usize, access: AccessKind) -> bool {
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        let memory = match st.by_range.get(&MemoryRangeKey::for_addr(addr)) {
            Some(m) => *m,
            None => {
                self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        match st.tracked.get_mut(&memory) {
            Some(t) => match t.region.handle_fault(addr, access) {
                Ok(handled) => handled,
                Err(_) => {
                    self.stats.protect_failures.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            None => false,
        }
    }

    pub fn is_mapped(&self, memory: u64) -> bool {
        let st = self.lock();
        st.tracked.contains_key(&memory) || st.untracked.contains_key(&memory)
    }

    pub fn is_tracked(&self, memory: u64) -> bool {
        self.lock().tracked.contains_key(&memory)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().tracked.len()
    }

    pub fn changed_pages(&self, memory: u64) -> Vec<usize> {
        match self.lock().tracked.get(&memory) {
            Some(t) => t.region.pages().changed_ranges().map(|r| r.page_index).collect(),
            None => Vec::new(),
        }
    }

    /// Changed-data package for `memory`, re-arming the guard afterwards.
    pub fn flush(&self, memory: u64) -> io::Result<Option<Vec<u8>>> {
        self.flush_with_flags(memory, PackageFlags::empty())
    }

    pub fn flush_with_flags(&self, memory: u64, flags: PackageFlags) -> io::Result<Option<Vec<u8>>> {
        let mut st = self.lock();
        if let Some(t) = st.tracked.get_mut(&memory) {
            return t.region.changed_data_package(false, flags);
        }
        match st.untracked.get(&memory) {
            Some(u) => Ok(unsafe { package_whole_range(u.real_base, u.size, flags) }?),
            None => Ok(None),
        }
    }

    /// Like `flush` but leaves page state alone.
    pub fn peek(&self, memory: u64) -> io::Result<Option<Vec<u8>>> {
        match self.lock().tracked.get_mut(&memory) {
            Some(t) => t.region.changed_data_package(true, PackageFlags::empty()),
            None => Ok(None),
        }
    }

    /// Packages for every tracked mapping with pending changes, in memory
    /// handle order.
    pub fn flush_all(&self, flags: PackageFlags) -> io::Result<Vec<(u64, Vec<u8>)>> {
        let mut st = self.lock();
        let mut memories: Vec<u64> = st
            .tracked
            .iter()
            .filter(|(_, t)| t.region.pages().changed_count() > 0)
            .map(|(m, _)| *m)
            .collect();
        memories.sort_unstable();
        let mut out = Vec::with_capacity(memories.len());
        for memory in memories {
            if let Some(t) = st.tracked.get_mut(&memory) {
                if let Some(pkg) = t.region.changed_data_package(false, flags)? {
                    out.push((memory, pkg));
                }
            }
        }
        Ok(out)
    }

    /// Stop tracking `memory` and hand back whatever changed since the last
    /// flush.
    pub fn unmap(&self, memory: u64) -> io::Result<Option<Vec<u8>>> {
        let (removed, package) = {
            let mut st = self.lock();
            if let Some(u) = st.untracked.remove(&memory) {
                let pkg = unsafe { package_whole_range(u.real_base, u.size, PackageFlags::empty()) }?;
                return Ok(pkg);
            }
            let mut t = match st.tracked.remove(&memory) {
                Some(t) => t,
                None => return Ok(None),
            };
            st.by_range.remove(&MemoryRangeKey(t.region.shadow_range()));
            let package = t.region.changed_data_package(false, PackageFlags::empty());
            (t, package)
        };
        self.trap.remove_fault_handler(removed.handler);
        drop(removed);
        package
    }

    pub fn reset_read_flags(&self) -> io::Result<()> {
        let mut st = self.lock();
        for t in st.tracked.values_mut() {
            t.region.reset_read_flags()?;
        }
        Ok(())
    }
}
