//! A replay device implemented in software. It allocates handles, keeps
//! mapped memory in host buffers and validates enough of the call stream
//! (live handles, memory bounds, surface limits, acquire/present pairing)
//! that a replay which gets translation wrong fails visibly.

use crate::{
    api::{
        calls::{ApiCall, CallId, CreateImage},
        chain::find_features,
        handles::{HandleField, HandleFields, HandleRole, HandleVisitor, ObjectKind, NULL_HANDLE},
        result::ApiResult,
        types::{
            DeviceFeatures, Extent2D, ImageTiling, MemoryHeap, MemoryProperties,
            MemoryPropertyFlags, MemoryRequirements, MemoryType, PresentMode,
            QueueFamilyProperties, QueueFlags, SurfaceCapabilities, WHOLE_SIZE,
        },
    },
    log::LogLevel::{LogDebug, LogWarn},
    replay::driver::GpuDriver,
    trace::file_header::GpuInfo,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{self, BufReader},
    path::Path,
};

const FIRST_HANDLE: u64 = 0x1000_0000;
const HANDLE_STRIDE: u64 = 0x10;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AcquireOrder {
    /// Round robin over the images that are not currently acquired.
    InOrder,
    /// A random free image, reproducible from the seed.
    Shuffled { seed: u64 },
}

/// What the software device offers. Loaded from JSON with `--device-profile`;
/// absent keys keep their defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceProfile {
    pub gpu_id: u64,
    pub driver_version: u64,
    pub instance_layers: Vec<String>,
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
    pub physical_device_count: u32,
    pub memory_properties: MemoryProperties,
    pub queue_families: Vec<QueueFamilyProperties>,
    pub features: DeviceFeatures,
    pub surface_capabilities: SurfaceCapabilities,
    pub present_modes: Vec<PresentMode>,
    pub buffer_alignment: u64,
    pub buffer_memory_type_bits: u32,
    pub image_memory_type_bits: u32,
    /// Optimal tiling images are padded to a multiple of this.
    pub optimal_tiling_alignment: u64,
    pub acquire_order: AcquireOrder,
    /// How many `GetFenceStatus` polls report NOT_READY after a submit.
    pub fence_latency: u32,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        let mib = 1024 * 1024;
        DeviceProfile {
            gpu_id: 0x5346_5447,
            driver_version: 1,
            instance_layers: Vec::new(),
            instance_extensions: vec!["VK_KHR_surface".into()],
            device_extensions: vec![
                "VK_KHR_swapchain".into(),
                "VK_KHR_buffer_device_address".into(),
            ],
            physical_device_count: 1,
            memory_properties: MemoryProperties {
                memory_types: vec![
                    MemoryType {
                        property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                        heap_index: 0,
                    },
                    MemoryType {
                        property_flags: MemoryPropertyFlags::HOST_VISIBLE
                            | MemoryPropertyFlags::HOST_COHERENT,
                        heap_index: 1,
                    },
                    MemoryType {
                        property_flags: MemoryPropertyFlags::HOST_VISIBLE
                            | MemoryPropertyFlags::HOST_COHERENT
                            | MemoryPropertyFlags::HOST_CACHED,
                        heap_index: 1,
                    },
                ],
                memory_heaps: vec![
                    MemoryHeap {
                        size: 256 * mib,
                        device_local: true,
                    },
                    MemoryHeap {
                        size: 256 * mib,
                        device_local: false,
                    },
                ],
            },
            queue_families: vec![
                QueueFamilyProperties {
                    queue_flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
                    queue_count: 2,
                },
                QueueFamilyProperties {
                    queue_flags: QueueFlags::TRANSFER,
                    queue_count: 1,
                },
            ],
            features: DeviceFeatures {
                sampler_anisotropy: true,
                buffer_device_address: true,
                buffer_device_address_capture_replay: true,
                ..Default::default()
            },
            surface_capabilities: SurfaceCapabilities {
                min_image_count: 2,
                max_image_count: 4,
                current_extent: Extent2D {
                    width: 1280,
                    height: 720,
                },
                min_image_extent: Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: Extent2D {
                    width: 4096,
                    height: 4096,
                },
            },
            present_modes: vec![PresentMode::Fifo, PresentMode::Immediate, PresentMode::Mailbox],
            buffer_alignment: 256,
            buffer_memory_type_bits: 0b111,
            image_memory_type_bits: 0b111,
            optimal_tiling_alignment: 64 * 1024,
            acquire_order: AcquireOrder::InOrder,
            fence_latency: 0,
        }
    }
}

impl DeviceProfile {
    pub fn load(path: &Path) -> io::Result<DeviceProfile> {
        let f = BufReader::new(File::open(path)?);
        serde_json::from_reader(f).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn memory_flags(&self, type_index: u32) -> Option<MemoryPropertyFlags> {
        self.memory_properties
            .memory_types
            .get(type_index as usize)
            .map(|t| t.property_flags)
    }

    fn image_requirements(&self, c: &CreateImage) -> MemoryRequirements {
        let texels = c.extent.width as u64
            * c.extent.height as u64
            * c.extent.depth.max(1) as u64
            * c.array_layers.max(1) as u64;
        // Four bytes per texel plus a third for the mip chain.
        let mut size = texels * 4;
        if c.mip_levels > 1 {
            size += size / 3;
        }
        let alignment = match c.tiling {
            ImageTiling::Optimal => self.optimal_tiling_alignment.max(1),
            ImageTiling::Linear => 4096,
        };
        MemoryRequirements {
            size: round_up(size.max(1), alignment),
            alignment,
            memory_type_bits: self.image_memory_type_bits,
        }
    }
}

struct SoftMemory {
    data: Box<[u8]>,
    type_index: u32,
    mapped: Option<(u64, u64)>,
}

struct SoftSwapchain {
    images: Vec<u64>,
    acquired: Vec<bool>,
    cursor: usize,
}

struct SoftFence {
    signaled: bool,
    polls_left: u32,
}

pub struct SoftDriver {
    profile: DeviceProfile,
    rng: StdRng,
    next_handle: u64,
    live: HashMap<u64, ObjectKind>,
    physical_devices: Vec<u64>,
    queues: HashMap<(u64, u32, u32), u64>,
    device_features: HashMap<u64, DeviceFeatures>,
    memory: HashMap<u64, SoftMemory>,
    buffers: HashMap<u64, u64>,
    images: HashMap<u64, MemoryRequirements>,
    /// Buffer or image → memory it is bound to.
    bindings: HashMap<u64, u64>,
    swapchains: HashMap<u64, SoftSwapchain>,
    fences: HashMap<u64, SoftFence>,
    calls: Vec<CallId>,
    failures: HashMap<CallId, VecDeque<ApiResult>>,
    presents: u64,
}

impl SoftDriver {
    pub fn new(profile: DeviceProfile) -> SoftDriver {
        let seed = match profile.acquire_order {
            AcquireOrder::Shuffled { seed } => seed,
            AcquireOrder::InOrder => 0,
        };
        let mut d = SoftDriver {
            profile,
            rng: StdRng::seed_from_u64(seed),
            next_handle: FIRST_HANDLE,
            live: HashMap::new(),
            physical_devices: Vec::new(),
            queues: HashMap::new(),
            device_features: HashMap::new(),
            memory: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            bindings: HashMap::new(),
            swapchains: HashMap::new(),
            fences: HashMap::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            presents: 0,
        };
        for _ in 0..d.profile.physical_device_count.max(1) {
            let h = d.new_handle(ObjectKind::PhysicalDevice);
            d.physical_devices.push(h);
        }
        d
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Every call executed so far, in order.
    pub fn calls(&self) -> &[CallId] {
        &self.calls
    }

    pub fn count(&self, id: CallId) -> usize {
        self.calls.iter().filter(|c| **c == id).count()
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }

    /// The next call with `id` fails with `result` without doing anything.
    pub fn fail_next(&mut self, id: CallId, result: ApiResult) {
        self.failures.entry(id).or_default().push_back(result);
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.live.values().filter(|k| **k == kind).count()
    }

    pub fn memory_contents(&self, memory: u64) -> Option<&[u8]> {
        self.memory.get(&memory).map(|m| &m.data[..])
    }

    pub fn memory_type_of(&self, memory: u64) -> Option<u32> {
        self.memory.get(&memory).map(|m| m.type_index)
    }

    fn new_handle(&mut self, kind: ObjectKind) -> u64 {
        let h = self.next_handle;
        self.next_handle += HANDLE_STRIDE;
        self.live.insert(h, kind);
        h
    }

    fn create(&mut self, kind: ObjectKind, field: &mut HandleField) -> u64 {
        let h = self.new_handle(kind);
        field.set_replay(h);
        h
    }

    fn features_of(&self, device: u64) -> DeviceFeatures {
        self.device_features.get(&device).copied().unwrap_or_default()
    }

    fn bind(&mut self, resource: u64, size: u64, memory: u64, offset: u64, alignment: u64) -> ApiResult {
        let mem_len = match self.memory.get(&memory) {
            Some(m) => m.data.len() as u64,
            None => return ApiResult::ERROR_UNKNOWN,
        };
        if self.bindings.contains_key(&resource) {
            log!(LogWarn, "Resource {:#x} is already bound", resource);
            return ApiResult::ERROR_UNKNOWN;
        }
        if alignment != 0 && offset % alignment != 0 {
            log!(LogWarn, "Bind offset {} is not aligned to {}", offset, alignment);
            return ApiResult::ERROR_UNKNOWN;
        }
        if offset.checked_add(size).map_or(true, |end| end > mem_len) {
            log!(
                LogWarn,
                "Binding {} bytes at {} overruns memory {:#x} of {} bytes",
                size,
                offset,
                memory,
                mem_len
            );
            return ApiResult::ERROR_UNKNOWN;
        }
        self.bindings.insert(resource, memory);
        ApiResult::SUCCESS
    }

    fn run(&mut self, call: &mut ApiCall, blobs: &[u8]) -> ApiResult {
        match call {
            ApiCall::CreateInstance(c) => {
                if let Some(l) = missing(&c.enabled_layers, &self.profile.instance_layers) {
                    log!(LogWarn, "Layer {} is not present", l);
                    return ApiResult::ERROR_LAYER_NOT_PRESENT;
                }
                if let Some(e) = missing(&c.enabled_extensions, &self.profile.instance_extensions) {
                    log!(LogWarn, "Instance extension {} is not present", e);
                    return ApiResult::ERROR_EXTENSION_NOT_PRESENT;
                }
                self.create(ObjectKind::Instance, &mut c.instance);
                ApiResult::SUCCESS
            }
            ApiCall::EnumeratePhysicalDevices(c) => {
                fill_outputs(&mut c.physical_devices, &self.physical_devices)
            }
            ApiCall::GetPhysicalDeviceMemoryProperties(c) => {
                c.properties = self.profile.memory_properties.clone();
                ApiResult::SUCCESS
            }
            ApiCall::GetPhysicalDeviceQueueFamilyProperties(c) => {
                c.properties = self.profile.queue_families.clone();
                ApiResult::SUCCESS
            }
            ApiCall::GetPhysicalDeviceFeatures(c) => {
                c.features = self.profile.features;
                ApiResult::SUCCESS
            }
            ApiCall::CreateDevice(c) => {
                if let Some(e) = missing(&c.enabled_extensions, &self.profile.device_extensions) {
                    log!(LogWarn, "Device extension {} is not present", e);
                    return ApiResult::ERROR_EXTENSION_NOT_PRESENT;
                }
                let requested = find_features(&c.next)
                    .copied()
                    .or(c.enabled_features)
                    .unwrap_or_default();
                let unsupported = requested.unsupported_by(&self.profile.features);
                if !unsupported.is_empty() {
                    log!(LogWarn, "Features not present: {}", unsupported.join(", "));
                    return ApiResult::ERROR_FEATURE_NOT_PRESENT;
                }
                for q in &c.queue_create_infos {
                    let family = self.profile.queue_families.get(q.queue_family_index as usize);
                    let fits = family.map_or(false, |f| {
                        !q.queue_priorities.is_empty()
                            && q.queue_priorities.len() as u32 <= f.queue_count
                    });
                    if !fits {
                        log!(
                            LogWarn,
                            "Cannot create {} queues in family {}",
                            q.queue_priorities.len(),
                            q.queue_family_index
                        );
                        return ApiResult::ERROR_INITIALIZATION_FAILED;
                    }
                }
                let device = self.create(ObjectKind::Device, &mut c.device);
                self.device_features.insert(device, requested);
                ApiResult::SUCCESS
            }
            ApiCall::DestroyDevice(c) => {
                self.device_features.remove(&c.device.replay());
                ApiResult::SUCCESS
            }
            ApiCall::DeviceWaitIdle(_) | ApiCall::QueueWaitIdle(_) => {
                for f in self.fences.values_mut() {
                    f.polls_left = 0;
                }
                ApiResult::SUCCESS
            }
            ApiCall::GetDeviceQueue(c) => {
                let valid = self
                    .profile
                    .queue_families
                    .get(c.queue_family_index as usize)
                    .map_or(false, |f| c.queue_index < f.queue_count);
                if !valid {
                    log!(
                        LogWarn,
                        "No queue {} in family {}",
                        c.queue_index,
                        c.queue_family_index
                    );
                    return ApiResult::SUCCESS;
                }
                let key = (c.device.replay(), c.queue_family_index, c.queue_index);
                match self.queues.get(&key) {
                    Some(q) => c.queue.set_replay(*q),
                    None => {
                        let q = self.create(ObjectKind::Queue, &mut c.queue);
                        self.queues.insert(key, q);
                    }
                }
                ApiResult::SUCCESS
            }
            ApiCall::AllocateMemory(c) => {
                let heap = self
                    .profile
                    .memory_properties
                    .memory_types
                    .get(c.memory_type_index as usize)
                    .and_then(|t| self.profile.memory_properties.memory_heaps.get(t.heap_index as usize));
                let heap_size = match heap {
                    Some(h) => h.size,
                    None => {
                        log!(LogWarn, "No memory type {}", c.memory_type_index);
                        return ApiResult::ERROR_UNKNOWN;
                    }
                };
                if c.allocation_size == 0 {
                    return ApiResult::ERROR_UNKNOWN;
                }
                if c.allocation_size > heap_size {
                    return ApiResult::ERROR_OUT_OF_DEVICE_MEMORY;
                }
                let memory = self.create(ObjectKind::DeviceMemory, &mut c.memory);
                self.memory.insert(
                    memory,
                    SoftMemory {
                        data: vec![0u8; c.allocation_size as usize].into_boxed_slice(),
                        type_index: c.memory_type_index,
                        mapped: None,
                    },
                );
                ApiResult::SUCCESS
            }
            ApiCall::FreeMemory(c) => {
                self.memory.remove(&c.memory.replay());
                ApiResult::SUCCESS
            }
            ApiCall::MapMemory(c) => {
                let visible = match self.memory.get(&c.memory.replay()) {
                    Some(m) => self
                        .profile
                        .memory_flags(m.type_index)
                        .map_or(false, |f| f.contains(MemoryPropertyFlags::HOST_VISIBLE)),
                    None => false,
                };
                let m = match self.memory.get_mut(&c.memory.replay()) {
                    Some(m) if visible && m.mapped.is_none() => m,
                    _ => return ApiResult::ERROR_MEMORY_MAP_FAILED,
                };
                let len = m.data.len() as u64;
                let size = if c.size == WHOLE_SIZE {
                    len.saturating_sub(c.offset)
                } else {
                    c.size
                };
                if c.offset.checked_add(size).map_or(true, |end| end > len) {
                    return ApiResult::ERROR_MEMORY_MAP_FAILED;
                }
                m.mapped = Some((c.offset, size));
                c.replay_pointer = m.data.as_mut_ptr() as usize + c.offset as usize;
                ApiResult::SUCCESS
            }
            ApiCall::UnmapMemory(c) => {
                match self.memory.get_mut(&c.memory.replay()) {
                    Some(m) if m.mapped.is_some() => m.mapped = None,
                    _ => log!(LogWarn, "Unmapping memory {:#x} that is not mapped", c.memory.replay()),
                }
                ApiResult::SUCCESS
            }
            ApiCall::FlushMappedMemoryRanges(c) => {
                for r in &c.ranges {
                    let inside = self
                        .memory
                        .get(&r.memory.replay())
                        .and_then(|m| m.mapped)
                        .map_or(false, |(off, size)| {
                            r.offset >= off
                                && (r.size == WHOLE_SIZE
                                    || r.offset.saturating_add(r.size) <= off + size)
                        });
                    if !inside {
                        log!(
                            LogWarn,
                            "Flushed range {}+{} of memory {:#x} is not mapped",
                            r.offset,
                            r.size,
                            r.memory.replay()
                        );
                        return ApiResult::ERROR_UNKNOWN;
                    }
                }
                ApiResult::SUCCESS
            }
            ApiCall::CreateBuffer(c) => {
                if c.size == 0 {
                    return ApiResult::ERROR_UNKNOWN;
                }
                let b = self.create(ObjectKind::Buffer, &mut c.buffer);
                self.buffers.insert(b, c.size);
                ApiResult::SUCCESS
            }
            ApiCall::DestroyBuffer(c) => {
                self.buffers.remove(&c.buffer.replay());
                self.bindings.remove(&c.buffer.replay());
                ApiResult::SUCCESS
            }
            ApiCall::GetBufferMemoryRequirements(c) => {
                let size = self.buffers.get(&c.buffer.replay()).copied().unwrap_or(0);
                let alignment = self.profile.buffer_alignment.max(1);
                c.requirements = MemoryRequirements {
                    size: round_up(size, alignment),
                    alignment,
                    memory_type_bits: self.profile.buffer_memory_type_bits,
                };
                ApiResult::SUCCESS
            }
            ApiCall::BindBufferMemory(c) => {
                let size = self.buffers.get(&c.buffer.replay()).copied().unwrap_or(0);
                let alignment = self.profile.buffer_alignment;
                self.bind(c.buffer.replay(), size, c.memory.replay(), c.memory_offset, alignment)
            }
            ApiCall::GetBufferDeviceAddress(c) => {
                c.address = c.buffer.replay() << 12;
                ApiResult::SUCCESS
            }
            ApiCall::CreateImage(c) => {
                if c.extent.width == 0 || c.extent.height == 0 {
                    return ApiResult::ERROR_UNKNOWN;
                }
                let req = self.profile.image_requirements(c);
                let image = self.create(ObjectKind::Image, &mut c.image);
                self.images.insert(image, req);
                ApiResult::SUCCESS
            }
            ApiCall::DestroyImage(c) => {
                self.images.remove(&c.image.replay());
                self.bindings.remove(&c.image.replay());
                ApiResult::SUCCESS
            }
            ApiCall::GetImageMemoryRequirements(c) => {
                match self.images.get(&c.image.replay()) {
                    Some(r) => c.requirements = *r,
                    None => log!(LogWarn, "Image {:#x} has no memory requirements", c.image.replay()),
                }
                ApiResult::SUCCESS
            }
            ApiCall::BindImageMemory(c) => {
                let req = self.images.get(&c.image.replay()).copied().unwrap_or_default();
                self.bind(c.image.replay(), req.size, c.memory.replay(), c.memory_offset, req.alignment)
            }
            ApiCall::BindImageMemory2(c) => {
                for info in &c.bind_infos {
                    if info.memory.replay() == NULL_HANDLE {
                        // Bound through a swapchain chain link.
                        continue;
                    }
                    let req = self.images.get(&info.image.replay()).copied().unwrap_or_default();
                    let r = self.bind(
                        info.image.replay(),
                        req.size,
                        info.memory.replay(),
                        info.memory_offset,
                        req.alignment,
                    );
                    if r.is_error() {
                        return r;
                    }
                }
                ApiResult::SUCCESS
            }
            ApiCall::CreateSampler(c) => {
                if c.anisotropy_enable && !self.features_of(c.device.replay()).sampler_anisotropy {
                    log!(LogWarn, "Sampler anisotropy was not enabled on the device");
                    return ApiResult::ERROR_FEATURE_NOT_PRESENT;
                }
                ApiResult::SUCCESS
            }
            ApiCall::CreateShaderModule(c) => match c.code {
                Some(r) if r.offset.saturating_add(r.size) > blobs.len() as u64 => {
                    log!(LogWarn, "Shader code {:?} is outside the packet", r);
                    ApiResult::ERROR_UNKNOWN
                }
                _ => ApiResult::SUCCESS,
            },
            ApiCall::QueueSubmit(c) => {
                if let Some(f) = self.fences.get_mut(&c.fence.replay()) {
                    f.signaled = true;
                    f.polls_left = self.profile.fence_latency;
                }
                ApiResult::SUCCESS
            }
            ApiCall::CreateFence(c) => {
                let f = self.create(ObjectKind::Fence, &mut c.fence);
                self.fences.insert(
                    f,
                    SoftFence {
                        signaled: c.signaled,
                        polls_left: 0,
                    },
                );
                ApiResult::SUCCESS
            }
            ApiCall::DestroyFence(c) => {
                self.fences.remove(&c.fence.replay());
                ApiResult::SUCCESS
            }
            ApiCall::WaitForFences(c) => {
                let mut states = Vec::with_capacity(c.fences.len());
                for h in &c.fences {
                    let f = self.fences.get_mut(&h.replay());
                    states.push(f.map_or(false, |f| {
                        f.polls_left = 0;
                        f.signaled
                    }));
                }
                let done = if c.wait_all {
                    states.iter().all(|s| *s)
                } else {
                    states.iter().any(|s| *s)
                };
                if done {
                    ApiResult::SUCCESS
                } else {
                    ApiResult::TIMEOUT
                }
            }
            ApiCall::ResetFences(c) => {
                for h in &c.fences {
                    if let Some(f) = self.fences.get_mut(&h.replay()) {
                        f.signaled = false;
                    }
                }
                ApiResult::SUCCESS
            }
            ApiCall::GetFenceStatus(c) => match self.fences.get_mut(&c.fence.replay()) {
                Some(f) if f.signaled && f.polls_left == 0 => ApiResult::SUCCESS,
                Some(f) if f.signaled => {
                    f.polls_left -= 1;
                    ApiResult::NOT_READY
                }
                _ => ApiResult::NOT_READY,
            },
            ApiCall::GetSurfaceCapabilities(c) => {
                c.capabilities = self.profile.surface_capabilities;
                ApiResult::SUCCESS
            }
            ApiCall::GetSurfacePresentModes(c) => {
                c.present_modes = self.profile.present_modes.clone();
                ApiResult::SUCCESS
            }
            ApiCall::CreateSwapchain(c) => {
                let caps = self.profile.surface_capabilities;
                let count_ok = c.min_image_count >= caps.min_image_count
                    && (caps.max_image_count == 0 || c.min_image_count <= caps.max_image_count);
                let e = c.image_extent;
                let extent_ok = e.width >= caps.min_image_extent.width
                    && e.height >= caps.min_image_extent.height
                    && e.width <= caps.max_image_extent.width
                    && e.height <= caps.max_image_extent.height;
                let mode_ok = self.profile.present_modes.contains(&c.present_mode);
                if !(count_ok && extent_ok && mode_ok) {
                    log!(
                        LogWarn,
                        "Swapchain of {} images {}x{} {:?} does not fit the surface",
                        c.min_image_count,
                        e.width,
                        e.height,
                        c.present_mode
                    );
                    return ApiResult::ERROR_INITIALIZATION_FAILED;
                }
                let sc = self.create(ObjectKind::Swapchain, &mut c.swapchain);
                let n = c.min_image_count as usize;
                let images = (0..n).map(|_| self.new_handle(ObjectKind::Image)).collect();
                self.swapchains.insert(
                    sc,
                    SoftSwapchain {
                        images,
                        acquired: vec![false; n],
                        cursor: 0,
                    },
                );
                ApiResult::SUCCESS
            }
            ApiCall::DestroySwapchain(c) => {
                if let Some(sc) = self.swapchains.remove(&c.swapchain.replay()) {
                    for image in sc.images {
                        self.live.remove(&image);
                    }
                }
                ApiResult::SUCCESS
            }
            ApiCall::GetSwapchainImages(c) => match self.swapchains.get(&c.swapchain.replay()) {
                Some(sc) => fill_outputs(&mut c.images, &sc.images),
                None => ApiResult::ERROR_UNKNOWN,
            },
            ApiCall::AcquireNextImage(c) => {
                let order = self.profile.acquire_order;
                let sc = match self.swapchains.get_mut(&c.swapchain.replay()) {
                    Some(sc) => sc,
                    None => return ApiResult::ERROR_UNKNOWN,
                };
                let n = sc.images.len();
                let free: Vec<usize> = (0..n)
                    .map(|k| (sc.cursor + k) % n)
                    .filter(|i| !sc.acquired[*i])
                    .collect();
                let picked = match order {
                    AcquireOrder::InOrder => free.first().copied(),
                    AcquireOrder::Shuffled { .. } => free.choose(&mut self.rng).copied(),
                };
                let index = match picked {
                    Some(i) => i,
                    None if c.timeout == 0 => return ApiResult::NOT_READY,
                    None => return ApiResult::TIMEOUT,
                };
                sc.acquired[index] = true;
                sc.cursor = (index + 1) % n;
                c.image_index = index as u32;
                if let Some(f) = self.fences.get_mut(&c.fence.replay()) {
                    f.signaled = true;
                }
                ApiResult::SUCCESS
            }
            ApiCall::QueuePresent(c) => {
                for (sc, index) in c.swapchains.iter().zip(c.image_indices.iter()) {
                    let ok = self
                        .swapchains
                        .get_mut(&sc.replay())
                        .and_then(|s| s.acquired.get_mut(*index as usize))
                        .map_or(false, |acquired| std::mem::replace(acquired, false));
                    if !ok {
                        log!(LogWarn, "Presenting image {} which was not acquired", index);
                        return ApiResult::ERROR_UNKNOWN;
                    }
                }
                self.presents += 1;
                ApiResult::SUCCESS
            }
            ApiCall::CreateAccelerationStructure(c) => {
                if c.device_address != 0
                    && !self
                        .features_of(c.device.replay())
                        .acceleration_structure_capture_replay
                {
                    log!(LogWarn, "Capture/replay address given without the feature enabled");
                    return ApiResult::ERROR_FEATURE_NOT_PRESENT;
                }
                ApiResult::SUCCESS
            }
            _ => ApiResult::SUCCESS,
        }
    }
}

impl GpuDriver for SoftDriver {
    fn execute(&mut self, call: &mut ApiCall, blobs: &[u8]) -> ApiResult {
        let id = call.id();
        self.calls.push(id);
        if let Some(r) = self.failures.get_mut(&id).and_then(|q| q.pop_front()) {
            log!(LogDebug, "{} fails with injected {}", call.name(), r);
            return r;
        }
        let mut check = LiveCheck {
            live: &self.live,
            stale: None,
        };
        call.visit_handles(&mut check);
        if let Some((field, kind, value)) = check.stale {
            log!(
                LogWarn,
                "{}: `{}` is not a live {} ({:#x})",
                call.name(),
                field,
                kind,
                value
            );
            return ApiResult::ERROR_UNKNOWN;
        }
        let result = self.run(call, blobs);
        if result.is_success() {
            let mut reg = Register {
                live: &mut self.live,
                next_handle: &mut self.next_handle,
            };
            call.visit_handles(&mut reg);
        }
        result
    }

    fn instance_layers(&self) -> Vec<String> {
        self.profile.instance_layers.clone()
    }

    fn instance_extensions(&self) -> Vec<String> {
        self.profile.instance_extensions.clone()
    }

    fn device_extensions(&self, physical_device: u64) -> Vec<String> {
        if self.physical_devices.contains(&physical_device) {
            self.profile.device_extensions.clone()
        } else {
            Vec::new()
        }
    }

    fn gpu_info(&self) -> GpuInfo {
        GpuInfo {
            gpu_id: self.profile.gpu_id,
            driver_version: self.profile.driver_version,
        }
    }
}

/// Profiles may carry alignments that are not powers of two.
fn round_up(v: u64, align: u64) -> u64 {
    (v + align - 1) / align * align
}

/// First name in `wanted` that `offered` lacks.
fn missing<'a>(wanted: &'a [String], offered: &[String]) -> Option<&'a str> {
    wanted
        .iter()
        .find(|w| !offered.contains(w))
        .map(|w| w.as_str())
}

/// Writes `values` into an output handle list the way the API does: an
/// empty list is a count query and receives every value, a short list is
/// filled and reported INCOMPLETE, a long one is cut to size.
fn fill_outputs(list: &mut Vec<HandleField>, values: &[u64]) -> ApiResult {
    if list.is_empty() {
        list.extend(values.iter().map(|v| {
            let mut h = HandleField::null();
            h.set_replay(*v);
            h
        }));
        return ApiResult::SUCCESS;
    }
    let incomplete = list.len() < values.len();
    list.truncate(values.len());
    for (h, v) in list.iter_mut().zip(values) {
        h.set_replay(*v);
    }
    if incomplete {
        ApiResult::INCOMPLETE
    } else {
        ApiResult::SUCCESS
    }
}

struct LiveCheck<'a> {
    live: &'a HashMap<u64, ObjectKind>,
    stale: Option<(&'static str, ObjectKind, u64)>,
}

impl<'a> HandleVisitor for LiveCheck<'a> {
    fn visit(&mut self, field: &'static str, kind: ObjectKind, role: HandleRole, h: &mut HandleField) {
        if self.stale.is_some() {
            return;
        }
        let v = h.replay();
        let required = match role {
            HandleRole::Out => false,
            HandleRole::In => true,
            HandleRole::Opt | HandleRole::Destroyed => v != NULL_HANDLE,
        };
        if required && self.live.get(&v) != Some(&kind) {
            self.stale = Some((field, kind, v));
        }
    }
}

/// Hands out handles for created objects the call did not fill in itself
/// and retires destroyed ones.
struct Register<'a> {
    live: &'a mut HashMap<u64, ObjectKind>,
    next_handle: &'a mut u64,
}

impl<'a> HandleVisitor for Register<'a> {
    fn visit(&mut self, _field: &'static str, kind: ObjectKind, role: HandleRole, h: &mut HandleField) {
        match role {
            HandleRole::Out if h.replay() == NULL_HANDLE => {
                if h.is_null() {
                    return;
                }
                let v = *self.next_handle;
                *self.next_handle += HANDLE_STRIDE;
                self.live.insert(v, kind);
                h.set_replay(v);
            }
            HandleRole::Destroyed if h.replay() != NULL_HANDLE => {
                self.live.remove(&h.replay());
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::calls::{
        AcquireNextImage, AllocateMemory, CreateDevice, CreateSwapchain, DeviceQueueCreateInfo,
        GetSwapchainImages, MapMemory, QueuePresent,
    };

    fn with_replay(trace: u64, replay: u64) -> HandleField {
        let mut h = HandleField::new(trace);
        h.set_replay(replay);
        h
    }

    fn device(d: &mut SoftDriver) -> u64 {
        let pd = d.physical_devices[0];
        let mut c: ApiCall = CreateDevice {
            physical_device: with_replay(1, pd),
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 0,
                queue_priorities: vec![1.0],
            }],
            device: HandleField::new(2),
            ..Default::default()
        }
        .into();
        assert_eq!(d.execute(&mut c, &[]), ApiResult::SUCCESS);
        match c {
            ApiCall::CreateDevice(c) => c.device.replay(),
            _ => unreachable!(),
        }
    }

    #[test]
    pub fn memory_maps_into_host_buffer() {
        let mut d = SoftDriver::new(DeviceProfile::default());
        let dev = device(&mut d);
        let mut alloc: ApiCall = AllocateMemory {
            device: with_replay(2, dev),
            allocation_size: 8192,
            memory_type_index: 1,
            memory: HandleField::new(3),
            ..Default::default()
        }
        .into();
        assert!(d.execute(&mut alloc, &[]).is_success());
        let mem = match &alloc {
            ApiCall::AllocateMemory(a) => a.memory.replay(),
            _ => unreachable!(),
        };
        let mut map: ApiCall = MapMemory {
            device: with_replay(2, dev),
            memory: with_replay(3, mem),
            offset: 4096,
            size: WHOLE_SIZE,
            ..Default::default()
        }
        .into();
        assert!(d.execute(&mut map, &[]).is_success());
        let ptr = match &map {
            ApiCall::MapMemory(m) => m.replay_pointer,
            _ => unreachable!(),
        };
        unsafe { *(ptr as *mut u8) = 0x5a };
        assert_eq!(d.memory_contents(mem).unwrap()[4096], 0x5a);
        // Already mapped.
        assert_eq!(d.execute(&mut map, &[]), ApiResult::ERROR_MEMORY_MAP_FAILED);
    }

    #[test]
    pub fn stale_handles_and_injected_failures() {
        let mut d = SoftDriver::new(DeviceProfile::default());
        let mut c: ApiCall = AllocateMemory {
            device: with_replay(2, 0xbad0),
            allocation_size: 16,
            memory: HandleField::new(3),
            ..Default::default()
        }
        .into();
        assert_eq!(d.execute(&mut c, &[]), ApiResult::ERROR_UNKNOWN);
        d.fail_next(CallId::AllocateMemory, ApiResult::ERROR_DEVICE_LOST);
        assert_eq!(d.execute(&mut c, &[]), ApiResult::ERROR_DEVICE_LOST);
        assert_eq!(d.count(CallId::AllocateMemory), 2);
    }

    fn swapchain(d: &mut SoftDriver, dev: u64, images: u32) -> (u64, Vec<u64>) {
        let surface = d.new_handle(ObjectKind::Surface);
        let mut c: ApiCall = CreateSwapchain {
            device: with_replay(2, dev),
            surface: with_replay(4, surface),
            min_image_count: images,
            image_extent: Extent2D {
                width: 640,
                height: 480,
            },
            swapchain: HandleField::new(5),
            ..Default::default()
        }
        .into();
        assert!(d.execute(&mut c, &[]).is_success());
        let sc = match &c {
            ApiCall::CreateSwapchain(s) => s.swapchain.replay(),
            _ => unreachable!(),
        };
        let mut q: ApiCall = GetSwapchainImages {
            device: with_replay(2, dev),
            swapchain: with_replay(5, sc),
            ..Default::default()
        }
        .into();
        assert!(d.execute(&mut q, &[]).is_success());
        let imgs = match q {
            ApiCall::GetSwapchainImages(g) => g.images.iter().map(|h| h.replay()).collect(),
            _ => unreachable!(),
        };
        (sc, imgs)
    }

    fn acquire(d: &mut SoftDriver, dev: u64, sc: u64) -> (ApiResult, u32) {
        let mut c: ApiCall = AcquireNextImage {
            device: with_replay(2, dev),
            swapchain: with_replay(5, sc),
            ..Default::default()
        }
        .into();
        let r = d.execute(&mut c, &[]);
        match c {
            ApiCall::AcquireNextImage(a) => (r, a.image_index),
            _ => unreachable!(),
        }
    }

    fn present(d: &mut SoftDriver, sc: u64, index: u32) -> ApiResult {
        let q = d.new_handle(ObjectKind::Queue);
        let mut c: ApiCall = QueuePresent {
            queue: with_replay(6, q),
            swapchains: vec![with_replay(5, sc)],
            image_indices: vec![index],
            ..Default::default()
        }
        .into();
        d.execute(&mut c, &[])
    }

    #[test]
    pub fn swapchain_acquire_and_present() {
        let mut d = SoftDriver::new(DeviceProfile::default());
        let dev = device(&mut d);
        let (sc, images) = swapchain(&mut d, dev, 3);
        assert_eq!(images.len(), 3);
        assert_eq!(acquire(&mut d, dev, sc), (ApiResult::SUCCESS, 0));
        assert_eq!(acquire(&mut d, dev, sc), (ApiResult::SUCCESS, 1));
        assert_eq!(present(&mut d, sc, 0), ApiResult::SUCCESS);
        assert_eq!(present(&mut d, sc, 0), ApiResult::ERROR_UNKNOWN);
        assert_eq!(acquire(&mut d, dev, sc), (ApiResult::SUCCESS, 2));
        assert_eq!(acquire(&mut d, dev, sc), (ApiResult::SUCCESS, 0));
        assert_eq!(acquire(&mut d, dev, sc).0, ApiResult::NOT_READY);
        assert_eq!(d.presents(), 1);

        let mut shuffled = SoftDriver::new(DeviceProfile {
            acquire_order: AcquireOrder::Shuffled { seed: 7 },
            ..Default::default()
        });
        let dev = device(&mut shuffled);
        let (sc, _) = swapchain(&mut shuffled, dev, 4);
        let mut seen: Vec<u32> = (0..4).map(|_| acquire(&mut shuffled, dev, sc).1).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    pub fn profile_json_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(
            &path,
            r#"{"gpuId": 42, "presentModes": ["Fifo"], "acquireOrder": {"Shuffled": {"seed": 3}}}"#,
        )
        .unwrap();
        let p = DeviceProfile::load(&path).unwrap();
        assert_eq!(p.gpu_id, 42);
        assert_eq!(p.present_modes, vec![PresentMode::Fifo]);
        assert_eq!(p.acquire_order, AcquireOrder::Shuffled { seed: 3 });
        assert_eq!(p.memory_properties.memory_types.len(), 3);
        assert!(DeviceProfile::load(&dir.path().join("nope.json")).is_err());
    }
}
