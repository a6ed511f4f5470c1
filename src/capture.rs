//! Capture side shims for the calls that touch host visible memory.
//!
//! The host layer forwards each call to the driver first and then hands the
//! completed call (results filled in) to the `MemoryInterceptor`, which
//! attaches changed-data packages and writes the packet.

use crate::{
    api::{
        calls::{
            AllocateMemory, ApiCall, FlushMappedMemoryRanges, FreeMemory, MapMemory,
            MappedMemoryRange, QueuePresent, QueueSubmit, UnmapMemory,
        },
        handles::HandleField,
        types::{MemoryProperties, MemoryPropertyFlags, WHOLE_SIZE},
    },
    log::LogLevel::{LogDebug, LogWarn},
    pageguard::{HandlerWatchdog, PackageFlags, PageGuardCapture},
    trace::{
        packet::{BlobArea, PacketTag},
        trace_writer::PacketSink,
    },
};
use std::{collections::HashMap, io, sync::Arc};

#[derive(Copy, Clone, Debug)]
struct MemoryInfo {
    device: u64,
    size: u64,
    property_flags: MemoryPropertyFlags,
    /// Offset of the current mapping, if any.
    map_offset: u64,
    /// Set once the application flushed this memory itself.
    app_flushed: bool,
}

pub struct MemoryInterceptor<S: PacketSink> {
    pageguard: Arc<PageGuardCapture>,
    sink: S,
    memory_properties: MemoryProperties,
    memory: HashMap<u64, MemoryInfo>,
    frame: u64,
    watchdog: Option<HandlerWatchdog>,
}

impl<S: PacketSink> MemoryInterceptor<S> {
    pub fn new(pageguard: Arc<PageGuardCapture>, sink: S) -> MemoryInterceptor<S> {
        MemoryInterceptor {
            pageguard,
            sink,
            memory_properties: MemoryProperties::default(),
            memory: HashMap::new(),
            frame: 0,
            watchdog: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(mut self) -> S {
        if let Some(mut w) = self.watchdog.take() {
            w.stop();
        }
        self.sink
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn watchdog_running(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Any call without memory side effects. Memory properties are noted on
    /// the way through so later allocations know their type flags.
    pub fn record(&mut self, call: &ApiCall) -> io::Result<()> {
        if let ApiCall::GetPhysicalDeviceMemoryProperties(c) = call {
            self.memory_properties = c.properties.clone();
        }
        self.sink.write_call(call, &[], PacketTag::empty())
    }

    pub fn allocate_memory(&mut self, call: &AllocateMemory) -> io::Result<()> {
        if call.result.is_success() {
            let property_flags = self
                .memory_properties
                .memory_types
                .get(call.memory_type_index as usize)
                .map(|t| t.property_flags)
                .unwrap_or_default();
            self.memory.insert(
                call.memory.trace(),
                MemoryInfo {
                    device: call.device.trace(),
                    size: call.allocation_size,
                    property_flags,
                    map_offset: 0,
                    app_flushed: false,
                },
            );
        }
        self.sink
            .write_call(&call.clone().into(), &[], PacketTag::empty())
    }

    /// Returns the pointer the application must use: the shadow when the
    /// mapping is tracked, the driver's pointer otherwise.
    pub fn map_memory(&mut self, call: &MapMemory, real_pointer: usize) -> io::Result<usize> {
        let mut call = call.clone();
        let mut app_pointer = real_pointer;
        if call.result.is_success() && real_pointer != 0 {
            let memory = call.memory.trace();
            if self.pageguard.is_mapped(memory) {
                log!(LogWarn, "Memory {:#x} mapped again without an unmap", memory);
                self.inject_unmap(call.device, call.memory)?;
            }
            if let Some(info) = self.memory.get_mut(&memory) {
                info.map_offset = call.offset;
            }
            let size = match (call.size, self.memory.get(&memory)) {
                (WHOLE_SIZE, Some(info)) => info.size.saturating_sub(call.offset),
                (WHOLE_SIZE, None) => {
                    log!(LogWarn, "Whole-size map of unknown memory {:#x}; not tracked", memory);
                    0
                }
                (size, _) => size,
            };
            app_pointer = self
                .pageguard
                .map(memory, call.offset, real_pointer, size as usize)
                .app_pointer();
        }
        call.trace_pointer = app_pointer as u64;
        self.sink.write_call(&call.into(), &[], PacketTag::empty())?;
        Ok(app_pointer)
    }

    /// Attaches the changed-data package of each flushed mapping. The whole
    /// mapping's changes go out with the first range naming it.
    pub fn flush_mapped_memory_ranges(&mut self, call: &FlushMappedMemoryRanges) -> io::Result<()> {
        let mut call = call.clone();
        let mut blobs = BlobArea::new();
        let mut seen = Vec::new();
        for range in call.ranges.iter_mut() {
            let memory = range.memory.trace();
            if let Some(info) = self.memory.get_mut(&memory) {
                info.app_flushed = true;
            }
            if seen.contains(&memory) {
                continue;
            }
            seen.push(memory);
            if let Some(pkg) = self.pageguard.flush(memory)? {
                range.data = Some(blobs.push(&pkg));
            }
        }
        self.sink
            .write_call(&call.into(), blobs.as_bytes(), PacketTag::empty())
    }

    pub fn unmap_memory(&mut self, call: &UnmapMemory) -> io::Result<()> {
        let mut call = call.clone();
        let mut blobs = BlobArea::new();
        if let Some(pkg) = self.pageguard.unmap(call.memory.trace())? {
            call.data = Some(blobs.push(&pkg));
        }
        self.sink
            .write_call(&call.into(), blobs.as_bytes(), PacketTag::empty())
    }

    /// Writes an unmap the application never issued, carrying the last
    /// changes of the mapping.
    fn inject_unmap(&mut self, device: HandleField, memory: HandleField) -> io::Result<()> {
        let mut unmap = UnmapMemory {
            device,
            memory,
            data: None,
        };
        let mut blobs = BlobArea::new();
        if let Some(pkg) = self.pageguard.unmap(memory.trace())? {
            unmap.data = Some(blobs.push(&pkg));
        }
        self.sink
            .write_call(&unmap.into(), blobs.as_bytes(), PacketTag::INJECTED)
    }

    /// Freeing mapped memory unmaps it implicitly; the final changes are
    /// written as an injected unmap first.
    pub fn free_memory(&mut self, call: &FreeMemory) -> io::Result<()> {
        let memory = call.memory.trace();
        if self.pageguard.is_mapped(memory) {
            log!(LogDebug, "Memory {:#x} freed while mapped", memory);
            self.inject_unmap(call.device, call.memory)?;
        }
        self.memory.remove(&memory);
        self.sink
            .write_call(&call.clone().into(), &[], PacketTag::empty())
    }

    /// Everything the GPU may read must be in the trace before the submit.
    /// Each tracked mapping with pending writes gets an injected flush.
    pub fn queue_submit(&mut self, call: &QueueSubmit) -> io::Result<()> {
        let flush_remap = self.pageguard.options().flush_remap;
        let special = if flush_remap {
            PackageFlags::SPECIAL_FORMAT
        } else {
            PackageFlags::empty()
        };
        let mut packages = self.pageguard.flush_all(special)?;
        // Cached memory the application flushes itself goes last.
        let app_flushed_cached = |m: &u64| match self.memory.get(m) {
            Some(info) => {
                info.app_flushed && info.property_flags.contains(MemoryPropertyFlags::HOST_CACHED)
            }
            None => false,
        };
        packages.sort_by_key(|(m, _)| (app_flushed_cached(m), *m));

        for (memory, pkg) in packages {
            let (device, offset) = self
                .memory
                .get(&memory)
                .map_or((0, 0), |i| (i.device, i.map_offset));
            let mut blobs = BlobArea::new();
            let data = blobs.push(&pkg);
            let flush = FlushMappedMemoryRanges {
                device: HandleField::new(device),
                ranges: vec![MappedMemoryRange {
                    memory: HandleField::new(memory),
                    offset,
                    size: WHOLE_SIZE,
                    data: Some(data),
                }],
                result: Default::default(),
            };
            self.sink
                .write_call(&flush.into(), blobs.as_bytes(), PacketTag::INJECTED)?;
        }
        self.sink
            .write_call(&call.clone().into(), &[], PacketTag::empty())
    }

    /// Frame boundary. Drives the handler watchdog and re-arms read guards.
    pub fn queue_present(&mut self, call: &QueuePresent) -> io::Result<()> {
        self.sink
            .write_call(&call.clone().into(), &[], PacketTag::empty())?;
        self.frame += 1;

        let check_frames = self.pageguard.options().check_handler_frames as u64;
        if check_frames > 0 {
            if self.frame == 1 && self.watchdog.is_none() {
                log!(LogDebug, "Watching the SIGSEGV handler for {} frames", check_frames);
                self.watchdog = Some(HandlerWatchdog::start(HandlerWatchdog::POLL_INTERVAL));
            } else if self.frame >= check_frames {
                if let Some(mut w) = self.watchdog.take() {
                    w.stop();
                    log!(
                        LogDebug,
                        "Handler watchdog stopped after {} frames, {} reinstalls",
                        self.frame,
                        w.reinstalls()
                    );
                }
            }
        }

        if self.pageguard.options().read_tracking {
            self.pageguard.reset_read_flags()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        api::{
            calls::GetPhysicalDeviceMemoryProperties,
            types::MemoryType,
        },
        pageguard::{decode_package, AccessKind, MockFaultTrap, MockVirtualMemory, PageGuardOptions},
    };

    const PS: usize = 4096;

    #[derive(Default)]
    struct VecSink {
        packets: Vec<(ApiCall, Vec<u8>, PacketTag)>,
    }

    impl PacketSink for VecSink {
        fn write_call(&mut self, call: &ApiCall, blobs: &[u8], tag: PacketTag) -> io::Result<()> {
            self.packets.push((call.clone(), blobs.to_vec(), tag));
            Ok(())
        }
    }

    fn interceptor(opts: PageGuardOptions) -> MemoryInterceptor<VecSink> {
        let pg = PageGuardCapture::new(
            Arc::new(MockVirtualMemory::new(PS)),
            Arc::new(MockFaultTrap::default()),
            opts,
        );
        let mut i = MemoryInterceptor::new(pg, VecSink::default());
        let props = GetPhysicalDeviceMemoryProperties {
            physical_device: HandleField::new(1),
            properties: MemoryProperties {
                memory_types: vec![
                    MemoryType {
                        property_flags: MemoryPropertyFlags::HOST_VISIBLE
                            | MemoryPropertyFlags::HOST_COHERENT,
                        heap_index: 0,
                    },
                    MemoryType {
                        property_flags: MemoryPropertyFlags::HOST_VISIBLE
                            | MemoryPropertyFlags::HOST_CACHED,
                        heap_index: 0,
                    },
                ],
                memory_heaps: Vec::new(),
            },
        };
        i.record(&props.into()).unwrap();
        i
    }

    fn allocate_and_map(i: &mut MemoryInterceptor<VecSink>, memory: u64, type_index: u32, real: &mut [u8]) -> usize {
        i.allocate_memory(&AllocateMemory {
            device: HandleField::new(0xd),
            allocation_size: real.len() as u64,
            memory_type_index: type_index,
            memory: HandleField::new(memory),
            ..Default::default()
        })
        .unwrap();
        i.map_memory(
            &MapMemory {
                device: HandleField::new(0xd),
                memory: HandleField::new(memory),
                size: WHOLE_SIZE,
                ..Default::default()
            },
            real.as_mut_ptr() as usize,
        )
        .unwrap()
    }

    /// Stand-in for the application touching its mapping: the write lands
    /// in the shadow and the trap fires.
    fn app_write(i: &MemoryInterceptor<VecSink>, addr: usize, value: u8) {
        assert!(i.pageguard.handle_fault(addr, AccessKind::Write));
        unsafe { *(addr as *mut u8) = value };
    }

    #[test]
    pub fn submit_injects_flushes_for_dirty_mappings() {
        let mut i = interceptor(PageGuardOptions {
            flush_remap: true,
            ..Default::default()
        });
        let mut real = vec![0u8; 2 * PS];
        let p = allocate_and_map(&mut i, 0x50, 0, &mut real);
        assert_ne!(p, real.as_ptr() as usize);
        app_write(&i, p + PS + 3, 0xaa);

        i.queue_submit(&QueueSubmit::default()).unwrap();
        let packets = &i.sink().packets;
        let (flush, blobs, tag) = &packets[packets.len() - 2];
        assert!(tag.contains(PacketTag::INJECTED));
        let range = match flush {
            ApiCall::FlushMappedMemoryRanges(f) => {
                assert_eq!(f.device.trace(), 0xd);
                f.ranges[0].clone()
            }
            other => panic!("expected an injected flush, got {:?}", other),
        };
        assert_eq!(range.memory.trace(), 0x50);
        let data = range.data.unwrap();
        let pkg = decode_package(&blobs[data.offset as usize..(data.offset + data.size) as usize]).unwrap();
        assert!(pkg.is_special_format());
        assert_eq!(pkg.blocks.len(), 1);
        assert_eq!(pkg.blocks[0].offset, PS);
        assert_eq!(pkg.blocks[0].data[3], 0xaa);
        assert_eq!(real[PS + 3], 0xaa);
        assert!(matches!(packets.last(), Some((ApiCall::QueueSubmit(_), _, _))));

        // Nothing pending: the next submit goes out alone.
        let before = i.sink().packets.len();
        i.queue_submit(&QueueSubmit::default()).unwrap();
        assert_eq!(i.sink().packets.len(), before + 1);
    }

    #[test]
    pub fn cached_app_flushed_memory_is_flushed_last() {
        let mut i = interceptor(PageGuardOptions::default());
        let mut cached = vec![0u8; PS];
        let mut coherent = vec![0u8; PS];
        let pc = allocate_and_map(&mut i, 0x10, 1, &mut cached);
        let ph = allocate_and_map(&mut i, 0x20, 0, &mut coherent);
        i.flush_mapped_memory_ranges(&FlushMappedMemoryRanges {
            device: HandleField::new(0xd),
            ranges: vec![MappedMemoryRange {
                memory: HandleField::new(0x10),
                size: WHOLE_SIZE,
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();
        app_write(&i, pc, 1);
        app_write(&i, ph, 2);
        i.queue_submit(&QueueSubmit::default()).unwrap();
        let order: Vec<u64> = i
            .sink()
            .packets
            .iter()
            .filter(|(_, _, t)| t.contains(PacketTag::INJECTED))
            .filter_map(|(c, _, _)| match c {
                ApiCall::FlushMappedMemoryRanges(f) => Some(f.ranges[0].memory.trace()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![0x20, 0x10]);
    }

    #[test]
    pub fn explicit_flush_unmap_and_free_carry_packages() {
        let mut i = interceptor(PageGuardOptions::default());
        let mut real = vec![0u8; 3 * PS];
        let p = allocate_and_map(&mut i, 0x60, 0, &mut real);
        app_write(&i, p, 5);
        i.flush_mapped_memory_ranges(&FlushMappedMemoryRanges {
            device: HandleField::new(0xd),
            ranges: vec![
                MappedMemoryRange {
                    memory: HandleField::new(0x60),
                    size: PS as u64,
                    ..Default::default()
                },
                MappedMemoryRange {
                    memory: HandleField::new(0x60),
                    offset: PS as u64,
                    size: PS as u64,
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
        .unwrap();
        match &i.sink().packets.last().unwrap().0 {
            ApiCall::FlushMappedMemoryRanges(f) => {
                assert!(f.ranges[0].data.is_some());
                assert!(f.ranges[1].data.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        app_write(&i, p + 2 * PS, 6);
        i.free_memory(&FreeMemory {
            device: HandleField::new(0xd),
            memory: HandleField::new(0x60),
        })
        .unwrap();
        let n = i.sink().packets.len();
        let (unmap, _, tag) = &i.sink().packets[n - 2];
        assert!(tag.contains(PacketTag::INJECTED));
        match unmap {
            ApiCall::UnmapMemory(u) => assert!(u.data.is_some()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(real[2 * PS], 6);
        assert!(!i.pageguard.is_mapped(0x60));
    }

    #[test]
    pub fn watchdog_runs_for_the_configured_frames() {
        let mut i = interceptor(PageGuardOptions {
            check_handler_frames: 3,
            ..Default::default()
        });
        i.queue_present(&QueuePresent::default()).unwrap();
        assert!(i.watchdog_running());
        i.queue_present(&QueuePresent::default()).unwrap();
        assert!(i.watchdog_running());
        i.queue_present(&QueuePresent::default()).unwrap();
        assert!(!i.watchdog_running());
        assert_eq!(i.frame(), 3);
        assert_eq!(i.into_sink().packets.len(), 4);
    }

    #[test]
    pub fn mapping_again_sends_the_old_changes_first() {
        let mut i = interceptor(PageGuardOptions::default());
        let mut real = vec![0u8; 2 * PS];
        let p = allocate_and_map(&mut i, 0x70, 0, &mut real);
        app_write(&i, p + PS, 9);
        let before = i.sink().packets.len();
        i.map_memory(
            &MapMemory {
                device: HandleField::new(0xd),
                memory: HandleField::new(0x70),
                size: WHOLE_SIZE,
                ..Default::default()
            },
            real.as_mut_ptr() as usize,
        )
        .unwrap();

        let packets = &i.sink().packets[before..];
        assert_eq!(packets.len(), 2);
        let (unmap, blobs, tag) = &packets[0];
        assert!(tag.contains(PacketTag::INJECTED));
        let data = match unmap {
            ApiCall::UnmapMemory(u) => u.data.unwrap(),
            other => panic!("expected an injected unmap, got {:?}", other),
        };
        let pkg = decode_package(&blobs[data.offset as usize..(data.offset + data.size) as usize]).unwrap();
        assert_eq!(pkg.blocks[0].offset, PS);
        assert_eq!(pkg.blocks[0].data[0], 9);
        assert!(matches!(packets[1].0, ApiCall::MapMemory(_)));
        assert!(i.pageguard.is_tracked(0x70));
    }
}
