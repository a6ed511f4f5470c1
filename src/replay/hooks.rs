//! Replay behavior for the calls that cannot go to the driver as recorded.
//!
//! Every hook receives the call with its input handles already translated.
//! A hook returns the driver's result (possibly adjusted to what the trace
//! expects) or a `ReplayResult` when it could not issue the call at all.

use crate::{
    api::{
        calls::{
            AcquireNextImage, AllocateMemory, ApiCall, CreateDevice, CreateSemaphore,
            DestroyBuffer, DestroyImage, DestroySemaphore, DeviceQueueCreateInfo,
            GetBufferMemoryRequirements, GetImageMemoryRequirements, GetPhysicalDeviceFeatures,
            GetPhysicalDeviceMemoryProperties, GetPhysicalDeviceQueueFamilyProperties,
            GetSurfaceCapabilities, GetSurfacePresentModes, GetSwapchainImages, QueueSubmit,
            SubmitInfo, WaitForFences,
        },
        chain::{find_features, find_features_mut, ChainLink},
        handles::{HandleField, ObjectKind, NULL_HANDLE},
        result::{ApiResult, ReplayResult},
        types::{
            DeviceFeatures, Extent2D, MemoryProperties, MemoryRequirements, PresentMode,
            QueueFamilyProperties, SurfaceCapabilities, WHOLE_SIZE,
        },
    },
    flags::{ReplayFlags, SkipFenceStatus},
    log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn},
    pageguard::decode_package,
    replay::{
        compat::{find_memory_type, find_queue_family},
        dispatcher::{blob, replayed, HookResult, Replayer},
        driver::GpuDriver,
        object_remapper::ObjectRemapper,
        state::{
            DeviceSupport, Mapping, MemoryState, PooledSemaphore, ReplayState, SingleWindow,
            SwapchainState,
        },
    },
    trace::packet::PacketTag,
};
use std::{collections::HashMap, slice, thread, time::Duration};

/// Trace value given to objects replay creates for itself.
const AUX_TRACE_HANDLE: u64 = !0;

const ALL_COMMANDS_STAGE: u32 = 0x0001_0000;

macro_rules! call_as {
    ($call:expr, $variant:ident) => {
        match &mut *$call {
            ApiCall::$variant(c) => c,
            _ => return Err(ReplayResult::InvalidId),
        }
    };
}

fn offered(what: &str, name: &str, list: &[String]) -> bool {
    let ok = list.iter().any(|l| l == name);
    if !ok {
        log!(LogWarn, "{} {} is not available on the replay device; dropped", what, name);
    }
    ok
}

/// Objects the application fetches again get their mapping from the new
/// result.
fn forget_refetched(remapper: &mut ObjectRemapper, kind: ObjectKind, handles: &[HandleField]) {
    for h in handles {
        if !h.is_null() && remapper.contains(kind, h.trace()) {
            remapper.remove(kind, h.trace());
        }
    }
}

/// (trace, replay) physical device a traced device was created on.
fn physical_of<D: GpuDriver>(r: &Replayer<D>, device: u64) -> Option<(u64, u64)> {
    let pd = *r.state.device_to_physical.get(&device)?;
    Some((pd, r.remapper.remap(ObjectKind::PhysicalDevice, pd)))
}

fn replay_memory<D: GpuDriver>(r: &mut Replayer<D>, pd: (u64, u64)) -> Option<MemoryProperties> {
    if let Some(p) = r
        .state
        .physical_devices
        .get(&pd.0)
        .and_then(|s| s.replay_memory.clone())
    {
        return Some(p);
    }
    let (res, call) = r.run_aux(GetPhysicalDeviceMemoryProperties {
        physical_device: replayed(pd.0, pd.1),
        ..Default::default()
    });
    match call {
        ApiCall::GetPhysicalDeviceMemoryProperties(c) if res.is_success() => {
            let s = r.state.physical_devices.entry(pd.0).or_default();
            s.replay_memory = Some(c.properties.clone());
            Some(c.properties)
        }
        _ => None,
    }
}

fn replay_queue_families<D: GpuDriver>(
    r: &mut Replayer<D>,
    pd: (u64, u64),
) -> Vec<QueueFamilyProperties> {
    if let Some(s) = r.state.physical_devices.get(&pd.0) {
        if !s.replay_queue_families.is_empty() {
            return s.replay_queue_families.clone();
        }
    }
    let (res, call) = r.run_aux(GetPhysicalDeviceQueueFamilyProperties {
        physical_device: replayed(pd.0, pd.1),
        ..Default::default()
    });
    match call {
        ApiCall::GetPhysicalDeviceQueueFamilyProperties(c) if res.is_success() => {
            let s = r.state.physical_devices.entry(pd.0).or_default();
            s.replay_queue_families = c.properties.clone();
            c.properties
        }
        _ => Vec::new(),
    }
}

fn replay_features<D: GpuDriver>(r: &mut Replayer<D>, pd: (u64, u64)) -> DeviceFeatures {
    if let Some(f) = r
        .state
        .physical_devices
        .get(&pd.0)
        .and_then(|s| s.replay_features)
    {
        return f;
    }
    let (res, call) = r.run_aux(GetPhysicalDeviceFeatures {
        physical_device: replayed(pd.0, pd.1),
        ..Default::default()
    });
    match call {
        ApiCall::GetPhysicalDeviceFeatures(c) if res.is_success() => {
            r.state.physical_devices.entry(pd.0).or_default().replay_features = Some(c.features);
            c.features
        }
        _ => DeviceFeatures::default(),
    }
}

fn surface_capabilities<D: GpuDriver>(
    r: &mut Replayer<D>,
    pd: (u64, u64),
    surface: HandleField,
) -> Option<SurfaceCapabilities> {
    let (res, call) = r.run_aux(GetSurfaceCapabilities {
        physical_device: replayed(pd.0, pd.1),
        surface,
        ..Default::default()
    });
    match call {
        ApiCall::GetSurfaceCapabilities(c) if res.is_success() => Some(c.capabilities),
        _ => None,
    }
}

fn surface_present_modes<D: GpuDriver>(
    r: &mut Replayer<D>,
    pd: (u64, u64),
    surface: HandleField,
) -> Vec<PresentMode> {
    let (res, call) = r.run_aux(GetSurfacePresentModes {
        physical_device: replayed(pd.0, pd.1),
        surface,
        ..Default::default()
    });
    match call {
        ApiCall::GetSurfacePresentModes(c) if res.is_success() => c.present_modes,
        _ => Vec::new(),
    }
}

/// Clamps `v` into `lo..=hi`; `hi == 0` means no upper limit.
fn fit(v: u32, lo: u32, hi: u32) -> u32 {
    let v = v.max(lo);
    if hi == 0 {
        v
    } else {
        v.min(hi)
    }
}

pub fn create_instance<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateInstance);
    let layers = r.driver.instance_layers();
    c.enabled_layers.retain(|l| offered("Layer", l, &layers));
    let extensions = r.driver.instance_extensions();
    c.enabled_extensions
        .retain(|e| offered("Instance extension", e, &extensions));
    log!(LogDebug, "Creating instance for {:?}", c.application_name);
    Ok(r.driver.execute(call, blobs))
}

pub fn enumerate_physical_devices<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, EnumeratePhysicalDevices);
    forget_refetched(&mut r.remapper, ObjectKind::PhysicalDevice, &c.physical_devices);
    let traced = c.result;
    let wanted = c.physical_devices.len();
    let res = r.driver.execute(call, blobs);
    let c = call_as!(call, EnumeratePhysicalDevices);
    if wanted != 0 && c.physical_devices.len() < wanted {
        log!(
            LogWarn,
            "Trace used {} physical devices but replay has only {}",
            wanted,
            c.physical_devices.len()
        );
    }
    if res == ApiResult::INCOMPLETE && traced == ApiResult::SUCCESS {
        log!(LogInfo, "Replay has more physical devices than the trace; using the first {}", wanted);
        return Ok(traced);
    }
    Ok(res)
}

pub fn get_memory_properties<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetPhysicalDeviceMemoryProperties);
    let pd = c.physical_device.trace();
    let traced = c.properties.clone();
    let res = r.driver.execute(call, blobs);
    let c = call_as!(call, GetPhysicalDeviceMemoryProperties);
    let s = r.state.physical_devices.entry(pd).or_default();
    s.trace_memory = Some(traced);
    if res.is_success() {
        s.replay_memory = Some(c.properties.clone());
    }
    Ok(res)
}

pub fn get_queue_families<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetPhysicalDeviceQueueFamilyProperties);
    let pd = c.physical_device.trace();
    let traced = c.properties.clone();
    let res = r.driver.execute(call, blobs);
    let c = call_as!(call, GetPhysicalDeviceQueueFamilyProperties);
    let s = r.state.physical_devices.entry(pd).or_default();
    // Count queries record nothing.
    if !traced.is_empty() {
        s.trace_queue_families = traced;
    }
    if res.is_success() && !c.properties.is_empty() {
        s.replay_queue_families = c.properties.clone();
    }
    Ok(res)
}

pub fn get_features<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetPhysicalDeviceFeatures);
    let pd = c.physical_device.trace();
    let res = r.driver.execute(call, blobs);
    let c = call_as!(call, GetPhysicalDeviceFeatures);
    if res.is_success() {
        r.state.physical_devices.entry(pd).or_default().replay_features = Some(c.features);
    }
    Ok(res)
}

/// Moves every queue request onto a replay family that can stand in for
/// the traced one. Requests landing on the same family are merged and cut
/// to the number of queues it has. Returns (trace family, replay family)
/// pairs.
fn translate_queue_families<D: GpuDriver>(
    r: &mut Replayer<D>,
    pd: (u64, u64),
    c: &mut CreateDevice,
) -> Vec<(u32, u32)> {
    let traced = r
        .state
        .physical_devices
        .get(&pd.0)
        .map(|s| s.trace_queue_families.clone())
        .unwrap_or_default();
    let replay = replay_queue_families(r, pd);
    if traced.is_empty() || replay.is_empty() {
        log!(LogDebug, "No queue family properties to translate device queues with");
        return Vec::new();
    }

    let mut map = Vec::new();
    let mut merged: Vec<DeviceQueueCreateInfo> = Vec::new();
    for info in c.queue_create_infos.drain(..) {
        let from = info.queue_family_index;
        let flags = match traced.get(from as usize) {
            Some(f) => f.queue_flags,
            None => {
                merged.push(info);
                continue;
            }
        };
        let to = match find_queue_family(flags, from, &replay) {
            Some(to) => to,
            None => {
                log!(LogWarn, "No replay queue family can serve family {} ({:?})", from, flags);
                merged.push(info);
                continue;
            }
        };
        if to != from {
            log!(LogInfo, "Queue family {} is replayed on family {}", from, to);
        }
        map.push((from, to));
        match merged.iter_mut().find(|m| m.queue_family_index == to) {
            Some(m) => m.queue_priorities.extend(info.queue_priorities),
            None => merged.push(DeviceQueueCreateInfo {
                queue_family_index: to,
                ..info
            }),
        }
    }
    for m in merged.iter_mut() {
        if let Some(f) = replay.get(m.queue_family_index as usize) {
            m.queue_priorities.truncate(f.queue_count.max(1) as usize);
        }
    }
    c.queue_create_infos = merged;
    map
}

pub fn create_device<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateDevice);
    let pd = (c.physical_device.trace(), c.physical_device.replay());
    let device = c.device.trace();

    let extensions = r.driver.device_extensions(pd.1);
    c.enabled_extensions
        .retain(|e| offered("Device extension", e, &extensions));
    let layers = r.driver.instance_layers();
    c.enabled_layers.retain(|l| offered("Device layer", l, &layers));

    let family_map = if r.compatibility {
        translate_queue_families(r, pd, c)
    } else {
        Vec::new()
    };

    let available = replay_features(r, pd);
    let (recorded_as, recorded_bda) = match r.metadata.features_for(device) {
        Some(f) => (
            f.acceleration_structure_capture_replay != 0,
            f.buffer_device_address_capture_replay != 0,
        ),
        None => (false, false),
    };
    let disable_as = r.flags.disable_as_capture_replay;
    let disable_bda = r.flags.disable_buffer_capture_replay;
    let adjust = |f: &mut DeviceFeatures| {
        let missing = f.unsupported_by(&available);
        if !missing.is_empty() {
            log!(LogWarn, "Replay device lacks {}; disabled", missing.join(", "));
        }
        f.restrict_to(&available);
        if recorded_as {
            f.acceleration_structure_capture_replay = available.acceleration_structure_capture_replay;
        }
        if recorded_bda {
            f.buffer_device_address_capture_replay = available.buffer_device_address_capture_replay;
        }
        if disable_as {
            f.acceleration_structure_capture_replay = false;
        }
        if disable_bda {
            f.buffer_device_address_capture_replay = false;
        }
    };
    match find_features_mut(&mut c.next) {
        Some(f) => adjust(f),
        None => match c.enabled_features.as_mut() {
            Some(f) => adjust(f),
            None if recorded_as || recorded_bda => {
                let mut f = DeviceFeatures::default();
                adjust(&mut f);
                c.enabled_features = Some(f);
            }
            None => (),
        },
    }
    let enabled = find_features(&c.next)
        .copied()
        .or(c.enabled_features)
        .unwrap_or_default();

    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        r.state.device_to_physical.insert(device, pd.0);
        r.state.device_support.insert(
            device,
            DeviceSupport {
                acceleration_structure_capture_replay: enabled.acceleration_structure_capture_replay,
                buffer_device_address_capture_replay: enabled.buffer_device_address_capture_replay,
                sampler_anisotropy: enabled.sampler_anisotropy,
            },
        );
        for (from, to) in family_map {
            r.state.queue_families.insert((device, from), to);
        }
    }
    Ok(res)
}

pub fn destroy_device<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, DestroyDevice);
    let device = (c.device.trace(), c.device.replay());
    if device.0 != NULL_HANDLE {
        release_device_semaphores(r, device);
    }
    let res = r.driver.execute(call, blobs);
    if res.is_success() && device.0 != NULL_HANDLE {
        r.remapper.remove_device_children(device.0);
        r.state.drop_device(device.0);
    }
    Ok(res)
}

fn release_device_semaphores<D: GpuDriver>(r: &mut Replayer<D>, device: (u64, u64)) {
    let mut doomed = r.state.semaphore_pool.remove(&device.0).unwrap_or_default();
    doomed.extend(
        r.state
            .semaphore_substitutes
            .values()
            .filter(|p| p.device == device.0)
            .map(|p| p.semaphore),
    );
    r.state.semaphore_substitutes.retain(|_, p| p.device != device.0);
    for sc in r.state.swapchains.values_mut().filter(|s| s.device == device.0) {
        doomed.extend(sc.early_acquires.drain().map(|(_, s)| s));
    }
    for s in doomed {
        destroy_semaphore(r, device, s);
    }
}

pub fn get_device_queue<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetDeviceQueue);
    let device = c.device.trace();
    c.queue_family_index = r.state.queue_family(device, c.queue_family_index);
    if r.compatibility {
        if let Some(pd) = physical_of(r, device) {
            let families = replay_queue_families(r, pd);
            if let Some(f) = families.get(c.queue_family_index as usize) {
                if c.queue_index >= f.queue_count {
                    let index = f.queue_count.saturating_sub(1);
                    log!(
                        LogInfo,
                        "Family {} has {} queues; queue {} replays as queue {}",
                        c.queue_family_index,
                        f.queue_count,
                        c.queue_index,
                        index
                    );
                    c.queue_index = index;
                }
            }
        }
    }
    forget_refetched(&mut r.remapper, ObjectKind::Queue, slice::from_ref(&c.queue));
    let res = r.driver.execute(call, blobs);
    let c = call_as!(call, GetDeviceQueue);
    if c.queue.replay() == NULL_HANDLE {
        log!(
            LogError,
            "Replay device has no queue {} in family {}",
            c.queue_index,
            c.queue_family_index
        );
        return Err(ReplayResult::Error);
    }
    r.state.device_queues.entry(device).or_insert(c.queue.replay());
    Ok(res)
}

pub fn create_command_pool<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateCommandPool);
    c.queue_family_index = r.state.queue_family(c.device.trace(), c.queue_family_index);
    Ok(r.driver.execute(call, blobs))
}

/// Where the resources bound to an allocation end, and the memory types
/// all of them accept.
struct Bound {
    end: u64,
    type_bits: u32,
}

/// Looks ahead from an allocation to every resource bound to it before it
/// is freed, and asks the replay driver what those resources need.
fn bound_resources<D: GpuDriver>(
    r: &mut Replayer<D>,
    device: (u64, u64),
    c: &AllocateMemory,
) -> Bound {
    let memory = c.memory.trace();
    let mut binds: Vec<(ObjectKind, u64, u64)> = Vec::new();
    for link in c.next.iter() {
        if let ChainLink::MemoryDedicatedAllocateInfo { image, buffer } = link {
            if !image.is_null() {
                binds.push((ObjectKind::Image, image.trace(), 0));
            }
            if !buffer.is_null() {
                binds.push((ObjectKind::Buffer, buffer.trace(), 0));
            }
        }
    }

    let mut creates: HashMap<(ObjectKind, u64), ApiCall> = HashMap::new();
    for (_, call) in r.state.upcoming() {
        match call {
            ApiCall::CreateBuffer(b) => {
                creates
                    .entry((ObjectKind::Buffer, b.buffer.trace()))
                    .or_insert_with(|| call.clone());
            }
            ApiCall::CreateImage(i) => {
                creates
                    .entry((ObjectKind::Image, i.image.trace()))
                    .or_insert_with(|| call.clone());
            }
            ApiCall::BindBufferMemory(b) if b.memory.trace() == memory => {
                binds.push((ObjectKind::Buffer, b.buffer.trace(), b.memory_offset));
            }
            ApiCall::BindImageMemory(b) if b.memory.trace() == memory => {
                binds.push((ObjectKind::Image, b.image.trace(), b.memory_offset));
            }
            ApiCall::BindImageMemory2(b) => {
                for info in b.bind_infos.iter().filter(|i| i.memory.trace() == memory) {
                    binds.push((ObjectKind::Image, info.image.trace(), info.memory_offset));
                }
            }
            ApiCall::FreeMemory(f) if f.memory.trace() == memory => break,
            _ => (),
        }
    }

    let mut bound = Bound {
        end: 0,
        type_bits: !0,
    };
    for (kind, trace, offset) in binds {
        let req = match requirements(r, device, kind, trace, creates.get(&(kind, trace))) {
            Some(req) if req.memory_type_bits != 0 => req,
            _ => {
                log!(LogWarn, "No memory requirements for {} {:#x}", kind, trace);
                continue;
            }
        };
        bound.end = bound.end.max(offset.saturating_add(req.size));
        bound.type_bits &= req.memory_type_bits;
    }
    bound
}

/// Replay requirements of a resource: asked of the live object if it
/// already exists, otherwise of a temporary one created from its traced
/// create call.
fn requirements<D: GpuDriver>(
    r: &mut Replayer<D>,
    device: (u64, u64),
    kind: ObjectKind,
    trace: u64,
    create: Option<&ApiCall>,
) -> Option<MemoryRequirements> {
    if r.remapper.contains(kind, trace) {
        let live = r.remapper.remap(kind, trace);
        return query_requirements(r, device, kind, live);
    }
    let dev = replayed(device.0, device.1);
    let mut temp = create?.clone();
    match &mut temp {
        ApiCall::CreateBuffer(b) => {
            b.device = dev;
            b.next.clear();
            b.buffer = HandleField::new(AUX_TRACE_HANDLE);
        }
        ApiCall::CreateImage(i) => {
            i.device = dev;
            i.next.clear();
            i.image = HandleField::new(AUX_TRACE_HANDLE);
        }
        _ => return None,
    }
    let (res, created) = r.run_aux(temp);
    if !res.is_success() {
        return None;
    }
    let handle = match &created {
        ApiCall::CreateBuffer(b) => b.buffer.replay(),
        ApiCall::CreateImage(i) => i.image.replay(),
        _ => NULL_HANDLE,
    };
    let req = query_requirements(r, device, kind, handle);
    if kind == ObjectKind::Buffer {
        r.run_aux(DestroyBuffer {
            device: dev,
            buffer: replayed(AUX_TRACE_HANDLE, handle),
        });
    } else {
        r.run_aux(DestroyImage {
            device: dev,
            image: replayed(AUX_TRACE_HANDLE, handle),
        });
    }
    req
}

fn query_requirements<D: GpuDriver>(
    r: &mut Replayer<D>,
    device: (u64, u64),
    kind: ObjectKind,
    handle: u64,
) -> Option<MemoryRequirements> {
    let dev = replayed(device.0, device.1);
    let (res, call) = match kind {
        ObjectKind::Buffer => r.run_aux(GetBufferMemoryRequirements {
            device: dev,
            buffer: replayed(AUX_TRACE_HANDLE, handle),
            ..Default::default()
        }),
        _ => r.run_aux(GetImageMemoryRequirements {
            device: dev,
            image: replayed(AUX_TRACE_HANDLE, handle),
            ..Default::default()
        }),
    };
    if !res.is_success() {
        return None;
    }
    match call {
        ApiCall::GetBufferMemoryRequirements(c) => Some(c.requirements),
        ApiCall::GetImageMemoryRequirements(c) => Some(c.requirements),
        _ => None,
    }
}

/// Picks the replay memory type and size for a traced allocation.
fn adapt_allocation<D: GpuDriver>(
    r: &mut Replayer<D>,
    device: (u64, u64),
    c: &mut AllocateMemory,
) -> Result<(), ReplayResult> {
    let pd = match physical_of(r, device.0) {
        Some(pd) => pd,
        None => return Ok(()),
    };
    let replay_props = match replay_memory(r, pd) {
        Some(p) => p,
        None => return Ok(()),
    };
    let trace_flags = r
        .state
        .physical_devices
        .get(&pd.0)
        .and_then(|s| s.trace_memory.as_ref())
        .and_then(|m| m.memory_types.get(c.memory_type_index as usize))
        .map(|t| t.property_flags);
    let trace_flags = match trace_flags {
        Some(f) => f,
        None => {
            log!(
                LogDebug,
                "Trace holds no properties for memory type {}; keeping it",
                c.memory_type_index
            );
            return Ok(());
        }
    };

    let bound = bound_resources(r, device, c);
    let index = match find_memory_type(trace_flags, c.memory_type_index, bound.type_bits, &replay_props)
    {
        Some(i) => i,
        None => {
            log!(
                LogError,
                "No replay memory type can hold allocation {:#x} ({:?}, type bits {:#b})",
                c.memory.trace(),
                trace_flags,
                bound.type_bits
            );
            return Err(ReplayResult::Error);
        }
    };
    if index != c.memory_type_index {
        log!(LogInfo, "Memory type {} is replayed as type {}", c.memory_type_index, index);
        c.memory_type_index = index;
    }
    if bound.end > c.allocation_size {
        log!(
            LogDebug,
            "Growing allocation {:#x} from {} to {} bytes",
            c.memory.trace(),
            c.allocation_size,
            bound.end
        );
        c.allocation_size = bound.end;
    }
    Ok(())
}

pub fn allocate_memory<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, AllocateMemory);
    let device = (c.device.trace(), c.device.replay());
    let trace_type_index = c.memory_type_index;
    if r.compatibility {
        adapt_allocation(r, device, c)?;
    }
    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        let c = call_as!(call, AllocateMemory);
        r.state.memory.insert(
            c.memory.trace(),
            MemoryState {
                device: device.0,
                size: c.allocation_size,
                trace_type_index,
                replay_type_index: c.memory_type_index,
                mapping: None,
            },
        );
    }
    Ok(res)
}

pub fn free_memory<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, FreeMemory);
    let memory = c.memory.trace();
    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        r.state.memory.remove(&memory);
    }
    Ok(res)
}

pub fn map_memory<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, MapMemory);
    let memory = c.memory.trace();
    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        let c = call_as!(call, MapMemory);
        match r.state.memory.get_mut(&memory) {
            Some(m) => {
                let size = if c.size == WHOLE_SIZE {
                    m.size.saturating_sub(c.offset)
                } else {
                    c.size
                };
                m.mapping = Some(Mapping {
                    pointer: c.replay_pointer,
                    offset: c.offset,
                    size,
                });
            }
            None => log!(LogWarn, "Mapped memory {:#x} was never allocated", memory),
        }
    }
    Ok(res)
}

/// Writes a changed-data package into a replay mapping. Returns whether the
/// package was in the special format, which stands in for the flush.
fn apply_package(what: &str, mapping: Mapping, bytes: &[u8]) -> Result<bool, ReplayResult> {
    let package = decode_package(bytes).map_err(|e| {
        log!(LogError, "{}: unreadable changed-data package: {}", what, e);
        ReplayResult::InvalidParams
    })?;
    if mapping.pointer == 0 {
        log!(LogError, "{}: memory has no replay mapping", what);
        return Err(ReplayResult::Error);
    }
    // SAFETY: the driver keeps `size` bytes at `pointer` mapped until the
    // memory is unmapped, and nothing else aliases them during replay.
    let target =
        unsafe { slice::from_raw_parts_mut(mapping.pointer as *mut u8, mapping.size as usize) };
    package.apply_to(target).map_err(|e| {
        log!(LogError, "{}: {}", what, e);
        ReplayResult::InvalidParams
    })?;
    log!(LogDebug, "{}: applied {} changed bytes", what, package.data_len());
    Ok(package.is_special_format())
}

pub fn flush_mapped_memory_ranges<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, FlushMappedMemoryRanges);
    let mut special = !c.ranges.is_empty();
    for range in c.ranges.iter_mut() {
        let mapping = r
            .state
            .memory
            .get(&range.memory.trace())
            .and_then(|m| m.mapping);
        let mapping = match mapping {
            Some(m) => m,
            None => {
                log!(LogWarn, "Flushing memory {:#x} which is not mapped", range.memory.trace());
                special = false;
                continue;
            }
        };
        if range.size != WHOLE_SIZE {
            let end = range
                .offset
                .saturating_add(range.size)
                .min(mapping.offset + mapping.size);
            range.offset = range.offset.max(mapping.offset);
            range.size = end.saturating_sub(range.offset);
        } else {
            range.offset = range.offset.max(mapping.offset);
        }
        match range.data {
            Some(d) => {
                let bytes = blob(blobs, d).ok_or(ReplayResult::InvalidParams)?;
                special &= apply_package("FlushMappedMemoryRanges", mapping, bytes)?;
            }
            None => special = false,
        }
    }
    if special {
        log!(LogDebug, "Flush carried only special-format packages; not issued");
        return Ok(ApiResult::SUCCESS);
    }
    Ok(r.driver.execute(call, blobs))
}

pub fn unmap_memory<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, UnmapMemory);
    let memory = c.memory.trace();
    let mapping = r.state.memory.get(&memory).and_then(|m| m.mapping);
    match (c.data, mapping) {
        (Some(d), Some(mapping)) => {
            let bytes = blob(blobs, d).ok_or(ReplayResult::InvalidParams)?;
            apply_package("UnmapMemory", mapping, bytes)?;
        }
        (Some(_), None) => log!(LogWarn, "Dropping data for memory {:#x} which is not mapped", memory),
        (None, _) => (),
    }
    let res = r.driver.execute(call, blobs);
    if let Some(m) = r.state.memory.get_mut(&memory) {
        m.mapping = None;
    }
    Ok(res)
}

pub fn create_image<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateImage);
    let device = c.device.trace();
    for f in c.queue_family_indices.iter_mut() {
        *f = r.state.queue_family(device, *f);
    }
    let (image, tiling) = (c.image.trace(), c.tiling);
    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        r.state.image_tiling.insert(image, tiling);
    }
    Ok(res)
}

pub fn create_sampler<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateSampler);
    if c.anisotropy_enable {
        let forced = r.flags.force_disable_anisotropy;
        if forced || !r.state.support(c.device.trace()).sampler_anisotropy {
            if !forced {
                log!(LogWarn, "Sampler anisotropy is not enabled on the replay device; disabled");
            }
            c.anisotropy_enable = false;
            c.max_anisotropy = 1.0;
        }
    }
    Ok(r.driver.execute(call, blobs))
}

pub fn get_buffer_device_address<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetBufferDeviceAddress);
    let traced = c.address;
    let res = r.driver.execute(call, blobs);
    let c = call_as!(call, GetBufferDeviceAddress);
    if c.address != traced {
        if r.tag.contains(PacketTag::BUFFER_CAPTURE_REPLAY) {
            log!(
                LogWarn,
                "Buffer {:#x} is at {:#x} instead of the captured {:#x}",
                c.buffer.trace(),
                c.address,
                traced
            );
        } else {
            log!(
                LogDebug,
                "Buffer {:#x} moved from {:#x} to {:#x}",
                c.buffer.trace(),
                traced,
                c.address
            );
        }
    }
    Ok(res)
}

pub fn create_acceleration_structure<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateAccelerationStructure);
    if c.device_address != 0 {
        let supported = r
            .state
            .support(c.device.trace())
            .acceleration_structure_capture_replay;
        if !supported || !r.tag.contains(PacketTag::AS_CAPTURE_REPLAY) {
            log!(
                LogDebug,
                "Dropping capture address {:#x} of acceleration structure {:#x}",
                c.device_address,
                c.acceleration_structure.trace()
            );
            c.device_address = 0;
        }
    }
    Ok(r.driver.execute(call, blobs))
}

pub fn create_swapchain<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, CreateSwapchain);
    let device = c.device.trace();
    let pd = physical_of(r, device);
    let caps = match pd {
        Some(pd) => surface_capabilities(r, pd, c.surface),
        None => None,
    };

    if r.flags.force_single_window {
        if let Some(sw) = r.state.single_window.as_mut() {
            sw.refcount += 1;
            if caps.map_or(false, |caps| caps != sw.capabilities) {
                log!(
                    LogWarn,
                    "Surface of swapchain {:#x} differs from the shared window; reusing it anyway",
                    c.swapchain.trace()
                );
            }
            c.swapchain.set_replay(sw.replay_swapchain);
            let count = sw.image_count;
            r.state.swapchains.insert(
                c.swapchain.trace(),
                SwapchainState {
                    device,
                    surface: c.surface.trace(),
                    replay_image_count: count,
                    acquired: vec![false; count as usize],
                    ..Default::default()
                },
            );
            return Ok(ApiResult::SUCCESS);
        }
    }

    if let Some(caps) = caps {
        let e = c.image_extent;
        let width = fit(e.width, caps.min_image_extent.width, caps.max_image_extent.width);
        let height = fit(e.height, caps.min_image_extent.height, caps.max_image_extent.height);
        if (width, height) != (e.width, e.height) {
            log!(
                LogWarn,
                "Swapchain extent {}x{} does not fit the surface; using {}x{}",
                e.width,
                e.height,
                width,
                height
            );
            c.image_extent = Extent2D { width, height };
        }
        let count = fit(c.min_image_count, caps.min_image_count, caps.max_image_count);
        if count != c.min_image_count {
            log!(LogInfo, "Swapchain image count {} becomes {}", c.min_image_count, count);
            c.min_image_count = count;
        }
    }
    if let Some(pd) = pd {
        let modes = surface_present_modes(r, pd, c.surface);
        if r.flags.vsync_off && modes.contains(&PresentMode::Immediate) {
            c.present_mode = PresentMode::Immediate;
        } else if !modes.is_empty() && !modes.contains(&c.present_mode) {
            log!(LogWarn, "Present mode {:?} is not supported; using Fifo", c.present_mode);
            c.present_mode = PresentMode::Fifo;
        }
    }

    let (swapchain, surface) = (c.swapchain.trace(), c.surface.trace());
    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        let c = call_as!(call, CreateSwapchain);
        let count = c.min_image_count;
        r.state.swapchains.insert(
            swapchain,
            SwapchainState {
                device,
                surface,
                replay_image_count: count,
                acquired: vec![false; count as usize],
                ..Default::default()
            },
        );
        if r.flags.force_single_window {
            r.state.single_window = Some(SingleWindow {
                replay_swapchain: c.swapchain.replay(),
                refcount: 1,
                capabilities: caps.unwrap_or_default(),
                image_count: count,
            });
        }
    }
    Ok(res)
}

pub fn destroy_swapchain<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, DestroySwapchain);
    let device = (c.device.trace(), c.device.replay());
    let replay = c.swapchain.replay();
    if let Some(mut sc) = r.state.swapchains.remove(&c.swapchain.trace()) {
        for (_, s) in sc.early_acquires.drain() {
            destroy_semaphore(r, device, s);
        }
    }
    if let Some(sw) = r.state.single_window.as_mut() {
        if replay != NULL_HANDLE && sw.replay_swapchain == replay {
            sw.refcount = sw.refcount.saturating_sub(1);
            if sw.refcount > 0 {
                log!(LogDebug, "Shared window still serves {} swapchains", sw.refcount);
                return Ok(ApiResult::SUCCESS);
            }
            r.state.single_window = None;
        }
    }
    Ok(r.driver.execute(call, blobs))
}

pub fn get_swapchain_images<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetSwapchainImages);
    forget_refetched(&mut r.remapper, ObjectKind::Image, &c.images);
    let traced = c.result;
    let wanted = c.images.len();
    let swapchain = c.swapchain.trace();
    let (res, query) = r.run_aux(GetSwapchainImages {
        device: c.device,
        swapchain: c.swapchain,
        ..Default::default()
    });
    if let ApiCall::GetSwapchainImages(q) = query {
        if res.is_success() {
            let n = q.images.len();
            if wanted != 0 && n != wanted {
                log!(LogWarn, "Swapchain has {} images on replay and {} in the trace", n, wanted);
            }
            if let Some(sc) = r.state.swapchains.get_mut(&swapchain) {
                sc.replay_image_count = n as u32;
                sc.acquired.resize(n, false);
            }
        }
    }
    let res = r.driver.execute(call, blobs);
    if res == ApiResult::INCOMPLETE && traced == ApiResult::SUCCESS {
        return Ok(traced);
    }
    Ok(res)
}

fn note_acquired(state: &mut ReplayState, swapchain: u64, trace_index: u32, replay_index: u32) {
    if let Some(sc) = state.swapchains.get_mut(&swapchain) {
        sc.index_map.insert(trace_index, replay_index);
        if let Some(a) = sc.acquired.get_mut(replay_index as usize) {
            *a = true;
        }
    }
    if trace_index != replay_index {
        log!(LogDebug, "Trace image {} is replay image {}", trace_index, replay_index);
    }
}

fn acquired_image(res: ApiResult) -> bool {
    res == ApiResult::SUCCESS || res == ApiResult::SUBOPTIMAL
}

pub fn acquire_next_image<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, AcquireNextImage);
    let trace_index = c.image_index;
    let swapchain = c.swapchain.trace();
    if r.flags.force_sync_img_idx && r.state.swapchains.contains_key(&swapchain) {
        return acquire_in_trace_order(r, call, trace_index);
    }
    let res = r.driver.execute(call, blobs);
    if acquired_image(res) {
        let c = call_as!(call, AcquireNextImage);
        note_acquired(&mut r.state, swapchain, trace_index, c.image_index);
    }
    Ok(res)
}

/// Acquires until the driver hands out the image index the trace got.
/// Images that come up first are held with their pool semaphore until the
/// trace asks for them.
fn acquire_in_trace_order<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    trace_index: u32,
) -> HookResult {
    let c = call_as!(call, AcquireNextImage);
    let device = (c.device.trace(), c.device.replay());
    let swapchain = c.swapchain.trace();
    let (app_semaphore, app_fence) = (c.semaphore, c.fence);

    let early = r
        .state
        .swapchains
        .get_mut(&swapchain)
        .and_then(|sc| sc.early_acquires.remove(&trace_index));
    if let Some(sem) = early {
        hand_over(r, device, app_semaphore, app_fence, sem);
        note_acquired(&mut r.state, swapchain, trace_index, trace_index);
        c.image_index = trace_index;
        return Ok(ApiResult::SUCCESS);
    }

    let attempts = r
        .state
        .swapchains
        .get(&swapchain)
        .map_or(1, |sc| sc.replay_image_count.max(1));
    let base = AcquireNextImage {
        device: c.device,
        swapchain: c.swapchain,
        timeout: c.timeout,
        ..Default::default()
    };
    let mut first_early = None;
    for _ in 0..attempts {
        let sem = match pool_semaphore(r, device) {
            Some(s) => s,
            None => {
                log!(LogError, "Could not create a semaphore to acquire with");
                return Err(ReplayResult::Error);
            }
        };
        let mut acquire = base.clone();
        acquire.semaphore = replayed(AUX_TRACE_HANDLE, sem);
        let (res, done) = r.run_aux(acquire);
        let got = match done {
            ApiCall::AcquireNextImage(a) if acquired_image(res) => a.image_index,
            _ => {
                release_semaphore(&mut r.state, device.0, sem);
                if first_early.is_some() {
                    break;
                }
                return Ok(res);
            }
        };
        if got == trace_index {
            hand_over(r, device, app_semaphore, app_fence, sem);
            note_acquired(&mut r.state, swapchain, trace_index, got);
            c.image_index = got;
            return Ok(res);
        }
        log!(LogDebug, "Acquired image {} while waiting for {}", got, trace_index);
        if let Some(sc) = r.state.swapchains.get_mut(&swapchain) {
            if let Some(a) = sc.acquired.get_mut(got as usize) {
                *a = true;
            }
            sc.early_acquires.insert(got, sem);
        }
        first_early.get_or_insert(got);
    }

    let got = match first_early {
        Some(got) => got,
        None => return Err(ReplayResult::Error),
    };
    let sem = r
        .state
        .swapchains
        .get_mut(&swapchain)
        .and_then(|sc| sc.early_acquires.remove(&got));
    let sem = match sem {
        Some(s) => s,
        None => return Err(ReplayResult::Error),
    };
    log!(
        LogWarn,
        "Image {} never came back from the driver; handing out image {}",
        trace_index,
        got
    );
    hand_over(r, device, app_semaphore, app_fence, sem);
    note_acquired(&mut r.state, swapchain, trace_index, got);
    c.image_index = got;
    Ok(ApiResult::SUCCESS)
}

/// Gives the application an image acquired with pool semaphore `sem`. Its
/// own semaphore stands for `sem` from now on and its fence is signaled.
fn hand_over<D: GpuDriver>(
    r: &mut Replayer<D>,
    device: (u64, u64),
    app_semaphore: HandleField,
    app_fence: HandleField,
    sem: u64,
) {
    let queue = r.state.device_queues.get(&device.0).copied();
    if app_semaphore.replay() != NULL_HANDLE {
        r.state.semaphore_substitutes.insert(
            app_semaphore.replay(),
            PooledSemaphore {
                device: device.0,
                semaphore: sem,
            },
        );
    } else {
        match queue {
            Some(q) => {
                // Consume the signal so the semaphore can be reused.
                r.run_aux(QueueSubmit {
                    queue: replayed(AUX_TRACE_HANDLE, q),
                    submits: vec![SubmitInfo {
                        wait_semaphores: vec![replayed(AUX_TRACE_HANDLE, sem)],
                        wait_dst_stage_masks: vec![ALL_COMMANDS_STAGE],
                        ..Default::default()
                    }],
                    ..Default::default()
                });
                release_semaphore(&mut r.state, device.0, sem);
            }
            None => destroy_semaphore(r, device, sem),
        }
    }
    if app_fence.replay() != NULL_HANDLE {
        match queue {
            Some(q) => {
                r.run_aux(QueueSubmit {
                    queue: replayed(AUX_TRACE_HANDLE, q),
                    fence: app_fence,
                    ..Default::default()
                });
            }
            None => log!(LogWarn, "No queue to signal fence {:#x} with", app_fence.trace()),
        }
    }
}

fn pool_semaphore<D: GpuDriver>(r: &mut Replayer<D>, device: (u64, u64)) -> Option<u64> {
    if let Some(s) = r
        .state
        .semaphore_pool
        .get_mut(&device.0)
        .and_then(|p| p.pop())
    {
        return Some(s);
    }
    let (res, call) = r.run_aux(CreateSemaphore {
        device: replayed(device.0, device.1),
        semaphore: HandleField::new(AUX_TRACE_HANDLE),
        ..Default::default()
    });
    match call {
        ApiCall::CreateSemaphore(c) if res.is_success() && c.semaphore.replay() != NULL_HANDLE => {
            Some(c.semaphore.replay())
        }
        _ => None,
    }
}

fn release_semaphore(state: &mut ReplayState, device: u64, semaphore: u64) {
    state.semaphore_pool.entry(device).or_default().push(semaphore);
}

fn destroy_semaphore<D: GpuDriver>(r: &mut Replayer<D>, device: (u64, u64), semaphore: u64) {
    r.run_aux(DestroySemaphore {
        device: replayed(device.0, device.1),
        semaphore: replayed(AUX_TRACE_HANDLE, semaphore),
    });
}

/// Points waits on application semaphores at the pool semaphores that
/// carry their signal. Returns what was swapped, keyed by the application
/// semaphore.
fn substitute_waits(
    state: &mut ReplayState,
    waits: &mut [HandleField],
) -> Vec<(u64, PooledSemaphore)> {
    let mut used = Vec::new();
    for w in waits.iter_mut() {
        if let Some(p) = state.semaphore_substitutes.remove(&w.replay()) {
            used.push((w.replay(), p));
            w.set_replay(p.semaphore);
        }
    }
    used
}

/// A wait that went through leaves the pool semaphore unsignaled and
/// reusable. After a failure the substitution stays for the next try.
fn settle_substitutes(state: &mut ReplayState, used: Vec<(u64, PooledSemaphore)>, waited: bool) {
    for (app, p) in used {
        if waited {
            release_semaphore(state, p.device, p.semaphore);
        } else {
            state.semaphore_substitutes.insert(app, p);
        }
    }
}

pub fn queue_submit<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, QueueSubmit);
    let mut used = Vec::new();
    for submit in c.submits.iter_mut() {
        used.extend(substitute_waits(&mut r.state, &mut submit.wait_semaphores));
    }
    let res = r.driver.execute(call, blobs);
    settle_substitutes(&mut r.state, used, res.is_success());
    Ok(res)
}

/// Pause after a present, only once replay is past the loop start frame.
fn present_delay(flags: &ReplayFlags, frame: u64) -> Option<Duration> {
    if flags.instrumentation_delay_us > 0 && frame > flags.loop_start_frame as u64 {
        Some(Duration::from_micros(flags.instrumentation_delay_us))
    } else {
        None
    }
}

pub fn queue_present<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, QueuePresent);
    let traced = c.result;
    let used = substitute_waits(&mut r.state, &mut c.wait_semaphores);
    let mut presented = Vec::with_capacity(c.swapchains.len());
    for (sc, index) in c.swapchains.iter().zip(c.image_indices.iter_mut()) {
        if let Some(state) = r.state.swapchains.get(&sc.trace()) {
            let replay_index = state.replay_index(*index);
            presented.push((sc.trace(), *index, replay_index));
            *index = replay_index;
        }
    }

    let res = r.driver.execute(call, blobs);
    if res.is_success() {
        for (swapchain, trace_index, replay_index) in presented {
            if let Some(sc) = r.state.swapchains.get_mut(&swapchain) {
                sc.index_map.remove(&trace_index);
                if let Some(a) = sc.acquired.get_mut(replay_index as usize) {
                    *a = false;
                }
            }
        }
    }
    settle_substitutes(&mut r.state, used, res.is_success());
    r.state.frame += 1;
    if let Some(delay) = present_delay(&r.flags, r.state.frame) {
        thread::sleep(delay);
    }
    if res == ApiResult::SUBOPTIMAL && traced == ApiResult::SUCCESS {
        return Ok(traced);
    }
    Ok(res)
}

pub fn get_fence_status<D: GpuDriver>(
    r: &mut Replayer<D>,
    call: &mut ApiCall,
    blobs: &[u8],
) -> HookResult {
    let c = call_as!(call, GetFenceStatus);
    let traced = c.result;
    let skip = match r.flags.skip_get_fence_status {
        SkipFenceStatus::All => true,
        SkipFenceStatus::Unsuccessful => traced != ApiResult::SUCCESS,
        SkipFenceStatus::None => false,
    };
    if skip {
        log!(LogDebug, "Skipping GetFenceStatus on fence {:#x}", c.fence.trace());
        return Ok(traced);
    }
    let (device, fence) = (c.device, c.fence);
    let res = r.driver.execute(call, blobs);
    if traced == ApiResult::SUCCESS && res == ApiResult::NOT_READY {
        let (waited, _) = r.run_aux(WaitForFences {
            device,
            fences: vec![fence],
            wait_all: true,
            timeout: u64::MAX,
            ..Default::default()
        });
        return Ok(waited);
    }
    if traced == ApiResult::NOT_READY && res == ApiResult::SUCCESS {
        // Only timing differs.
        return Ok(traced);
    }
    Ok(res)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        api::{
            calls::{
                CallId, CreateAccelerationStructure, CreateBuffer, CreateFence, CreateInstance,
                CreateSampler, CreateSurface, CreateSwapchain, DestroySwapchain,
                EnumeratePhysicalDevices, GetDeviceQueue, GetFenceStatus,
            },
            types::QueueFlags,
        },
        replay::soft_driver::{DeviceProfile, SoftDriver},
    };

    const INSTANCE: u64 = 0x10;
    const GPU: u64 = 0x20;
    const DEVICE: u64 = 0x30;
    const QUEUE: u64 = 0x40;
    const SURFACE: u64 = 0x50;

    #[test]
    pub fn fit_treats_zero_as_unbounded() {
        assert_eq!(fit(1, 2, 4), 2);
        assert_eq!(fit(9, 2, 4), 4);
        assert_eq!(fit(9, 2, 0), 9);
    }

    #[test]
    pub fn substitutes_return_to_the_pool_once_waited_on() {
        let mut s = ReplayState::default();
        s.semaphore_substitutes.insert(
            0x50,
            PooledSemaphore {
                device: 1,
                semaphore: 0x90,
            },
        );
        let mut waits = vec![replayed(5, 0x50), replayed(6, 0x60)];
        let used = substitute_waits(&mut s, &mut waits);
        assert_eq!(waits[0].replay(), 0x90);
        assert_eq!(waits[1].replay(), 0x60);

        settle_substitutes(&mut s, used.clone(), false);
        assert!(s.semaphore_substitutes.contains_key(&0x50));
        settle_substitutes(&mut s, used, true);
        assert_eq!(s.semaphore_pool[&1], vec![0x90]);
    }

    fn replayer(flags: ReplayFlags) -> Replayer<SoftDriver> {
        let mut profile = DeviceProfile::default();
        profile.queue_families = vec![QueueFamilyProperties {
            queue_flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
            queue_count: 1,
        }];
        Replayer::new(SoftDriver::new(profile), flags, None)
    }

    #[test]
    pub fn queue_requests_merge_onto_the_families_replay_has() {
        let mut r = replayer(ReplayFlags::default());
        // The software device hands out its first handle to the physical device.
        let pd = 0x1000_0000;
        r.state.physical_devices.insert(
            7,
            crate::replay::state::PhysicalDeviceState {
                trace_queue_families: vec![
                    QueueFamilyProperties {
                        queue_flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE,
                        queue_count: 1,
                    },
                    QueueFamilyProperties {
                        queue_flags: QueueFlags::COMPUTE,
                        queue_count: 1,
                    },
                ],
                ..Default::default()
            },
        );
        let mut c = CreateDevice {
            queue_create_infos: vec![
                DeviceQueueCreateInfo {
                    queue_family_index: 0,
                    queue_priorities: vec![1.0],
                },
                DeviceQueueCreateInfo {
                    queue_family_index: 1,
                    queue_priorities: vec![0.5],
                },
            ],
            ..Default::default()
        };
        let map = translate_queue_families(&mut r, (7, pd), &mut c);
        assert_eq!(map, vec![(0, 0), (1, 0)]);
        assert_eq!(c.queue_create_infos.len(), 1);
        assert_eq!(c.queue_create_infos[0].queue_priorities, vec![1.0]);
    }

    /// Replays `call` through the full dispatch path and hands back the call
    /// as it was issued to the driver.
    fn replay_ok(r: &mut Replayer<SoftDriver>, call: impl Into<ApiCall>) -> ApiCall {
        let mut call = call.into();
        let out = r.replay_call(&mut call, &[]);
        assert_eq!(out.result, ReplayResult::Success, "{} failed", call.name());
        call
    }

    fn instance_and_gpu(r: &mut Replayer<SoftDriver>) {
        replay_ok(
            r,
            CreateInstance {
                application_name: "hooks".into(),
                instance: INSTANCE.into(),
                ..Default::default()
            },
        );
        replay_ok(
            r,
            EnumeratePhysicalDevices {
                instance: INSTANCE.into(),
                physical_devices: vec![GPU.into()],
                ..Default::default()
            },
        );
    }

    fn device_on(features: Option<DeviceFeatures>) -> CreateDevice {
        CreateDevice {
            physical_device: GPU.into(),
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 0,
                queue_priorities: vec![1.0],
            }],
            enabled_features: features,
            device: DEVICE.into(),
            ..Default::default()
        }
    }

    /// Instance, device, queue and surface, ready for the call under test.
    fn booted(
        profile: DeviceProfile,
        flags: ReplayFlags,
        features: Option<DeviceFeatures>,
    ) -> Replayer<SoftDriver> {
        let mut r = Replayer::new(SoftDriver::new(profile), flags, None);
        instance_and_gpu(&mut r);
        replay_ok(&mut r, device_on(features));
        replay_ok(
            &mut r,
            GetDeviceQueue {
                device: DEVICE.into(),
                queue_family_index: 0,
                queue_index: 0,
                queue: QUEUE.into(),
            },
        );
        replay_ok(
            &mut r,
            CreateSurface {
                instance: INSTANCE.into(),
                window_extent: Extent2D {
                    width: 1280,
                    height: 720,
                },
                surface: SURFACE.into(),
                ..Default::default()
            },
        );
        r
    }

    fn swapchain(trace: u64, count: u32, extent: Extent2D, mode: PresentMode) -> CreateSwapchain {
        CreateSwapchain {
            device: DEVICE.into(),
            surface: SURFACE.into(),
            min_image_count: count,
            image_extent: extent,
            present_mode: mode,
            swapchain: trace.into(),
            ..Default::default()
        }
    }

    const HD: Extent2D = Extent2D {
        width: 1280,
        height: 720,
    };

    #[test]
    pub fn unavailable_layers_and_extensions_are_dropped() {
        let driver = SoftDriver::new(DeviceProfile::default());
        let mut r = Replayer::new(driver, ReplayFlags::default(), None);
        let issued = replay_ok(
            &mut r,
            CreateInstance {
                application_name: "hooks".into(),
                enabled_layers: vec!["VK_LAYER_capture_only".into()],
                enabled_extensions: vec!["VK_KHR_surface".into(), "VK_EXT_debug_report".into()],
                instance: INSTANCE.into(),
                ..Default::default()
            },
        );
        match issued {
            ApiCall::CreateInstance(c) => {
                assert!(c.enabled_layers.is_empty());
                assert_eq!(c.enabled_extensions, vec!["VK_KHR_surface".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        replay_ok(
            &mut r,
            EnumeratePhysicalDevices {
                instance: INSTANCE.into(),
                physical_devices: vec![GPU.into()],
                ..Default::default()
            },
        );
        let mut device = device_on(None);
        device.enabled_layers = vec!["VK_LAYER_capture_only".into()];
        device.enabled_extensions = vec!["VK_KHR_swapchain".into(), "VK_NV_ray_tracing".into()];
        match replay_ok(&mut r, device) {
            ApiCall::CreateDevice(c) => {
                assert!(c.enabled_layers.is_empty());
                assert_eq!(c.enabled_extensions, vec!["VK_KHR_swapchain".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.driver().live_count(ObjectKind::Device), 1);
    }

    #[test]
    pub fn swapchain_fits_the_replay_surface() {
        let profile = DeviceProfile {
            present_modes: vec![PresentMode::Fifo],
            ..Default::default()
        };
        let mut r = booted(profile, ReplayFlags::default(), None);
        let wide = Extent2D {
            width: 8000,
            height: 100,
        };
        match replay_ok(&mut r, swapchain(0x60, 8, wide, PresentMode::Mailbox)) {
            ApiCall::CreateSwapchain(c) => {
                assert_eq!(c.min_image_count, 4);
                assert_eq!(
                    c.image_extent,
                    Extent2D {
                        width: 4096,
                        height: 100
                    }
                );
                assert_eq!(c.present_mode, PresentMode::Fifo);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.state().swapchains[&0x60u64].replay_image_count, 4);

        // One image short of the surface minimum, vsync turned off.
        let flags = ReplayFlags {
            vsync_off: true,
            ..Default::default()
        };
        let mut r = booted(DeviceProfile::default(), flags, None);
        match replay_ok(&mut r, swapchain(0x60, 1, HD, PresentMode::Fifo)) {
            ApiCall::CreateSwapchain(c) => {
                assert_eq!(c.min_image_count, 2);
                assert_eq!(c.image_extent, HD);
                assert_eq!(c.present_mode, PresentMode::Immediate);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    pub fn single_window_is_shared_until_the_last_destroy() {
        let flags = ReplayFlags {
            force_single_window: true,
            ..Default::default()
        };
        let mut r = booted(DeviceProfile::default(), flags, None);
        replay_ok(&mut r, swapchain(0x60, 3, HD, PresentMode::Fifo));
        replay_ok(&mut r, swapchain(0x61, 2, HD, PresentMode::Fifo));

        let first = r.remapper().remap(ObjectKind::Swapchain, 0x60);
        assert_ne!(first, NULL_HANDLE);
        assert_eq!(r.remapper().remap(ObjectKind::Swapchain, 0x61), first);
        assert_eq!(r.driver().count(CallId::CreateSwapchain), 1);
        assert_eq!(r.state().single_window.as_ref().map(|w| w.refcount), Some(2));
        // The alias takes the image count of the shared swapchain.
        assert_eq!(r.state().swapchains[&0x61u64].replay_image_count, 3);

        let destroy = |trace: u64| DestroySwapchain {
            device: DEVICE.into(),
            swapchain: trace.into(),
        };
        replay_ok(&mut r, destroy(0x60));
        assert_eq!(r.driver().count(CallId::DestroySwapchain), 0);
        assert_eq!(r.driver().live_count(ObjectKind::Swapchain), 1);

        replay_ok(&mut r, destroy(0x61));
        assert_eq!(r.driver().count(CallId::DestroySwapchain), 1);
        assert_eq!(r.driver().live_count(ObjectKind::Swapchain), 0);
        assert!(r.state().single_window.is_none());
    }

    #[test]
    pub fn fence_status_polls_follow_the_skip_policy() {
        let profile = DeviceProfile {
            fence_latency: 2,
            ..Default::default()
        };
        let mut r = booted(profile, ReplayFlags::default(), None);
        r.flags.skip_get_fence_status = SkipFenceStatus::Unsuccessful;
        replay_ok(
            &mut r,
            CreateFence {
                device: DEVICE.into(),
                fence: 0x70u64.into(),
                ..Default::default()
            },
        );
        replay_ok(
            &mut r,
            QueueSubmit {
                queue: QUEUE.into(),
                fence: 0x70u64.into(),
                ..Default::default()
            },
        );
        let status = |result: ApiResult| GetFenceStatus {
            device: DEVICE.into(),
            fence: 0x70u64.into(),
            result,
        };

        // A poll that was not ready at capture is not worth repeating.
        replay_ok(&mut r, status(ApiResult::NOT_READY));
        assert_eq!(r.driver().count(CallId::GetFenceStatus), 0);

        // A ready poll is issued; the replay fence lags, so replay waits.
        replay_ok(&mut r, status(ApiResult::SUCCESS));
        assert_eq!(r.driver().count(CallId::GetFenceStatus), 1);
        assert_eq!(r.driver().count(CallId::WaitForFences), 1);

        r.flags.skip_get_fence_status = SkipFenceStatus::All;
        replay_ok(&mut r, status(ApiResult::SUCCESS));
        assert_eq!(r.driver().count(CallId::GetFenceStatus), 1);

        r.flags.skip_get_fence_status = SkipFenceStatus::None;
        replay_ok(&mut r, status(ApiResult::SUCCESS));
        assert_eq!(r.driver().count(CallId::GetFenceStatus), 2);
    }

    fn anisotropic_sampler(trace: u64) -> CreateSampler {
        CreateSampler {
            device: DEVICE.into(),
            anisotropy_enable: true,
            max_anisotropy: 16.0,
            sampler: trace.into(),
            ..Default::default()
        }
    }

    fn anisotropy_of(call: ApiCall) -> (bool, f32) {
        match call {
            ApiCall::CreateSampler(c) => (c.anisotropy_enable, c.max_anisotropy),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    pub fn sampler_anisotropy_follows_device_and_override() {
        let enabled = Some(DeviceFeatures {
            sampler_anisotropy: true,
            ..Default::default()
        });
        let mut r = booted(DeviceProfile::default(), ReplayFlags::default(), enabled);
        assert_eq!(anisotropy_of(replay_ok(&mut r, anisotropic_sampler(0x90))), (true, 16.0));

        r.flags.force_disable_anisotropy = true;
        assert_eq!(anisotropy_of(replay_ok(&mut r, anisotropic_sampler(0x91))), (false, 1.0));

        // The device never enabled the feature.
        let mut r = booted(DeviceProfile::default(), ReplayFlags::default(), None);
        assert_eq!(anisotropy_of(replay_ok(&mut r, anisotropic_sampler(0x92))), (false, 1.0));
    }

    fn capture_replay_structure(r: &mut Replayer<SoftDriver>) -> u64 {
        replay_ok(
            r,
            CreateBuffer {
                device: DEVICE.into(),
                size: 4096,
                buffer: 0xa0u64.into(),
                ..Default::default()
            },
        );
        r.tag = PacketTag::AS_CAPTURE_REPLAY;
        let issued = replay_ok(
            r,
            CreateAccelerationStructure {
                device: DEVICE.into(),
                buffer: 0xa0u64.into(),
                size: 4096,
                device_address: 0xabc000,
                acceleration_structure: 0xb0u64.into(),
                ..Default::default()
            },
        );
        match issued {
            ApiCall::CreateAccelerationStructure(c) => c.device_address,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    pub fn acceleration_structure_capture_replay_can_be_turned_off() {
        let profile = DeviceProfile {
            features: DeviceFeatures {
                acceleration_structure: true,
                acceleration_structure_capture_replay: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let requested = Some(DeviceFeatures {
            acceleration_structure: true,
            acceleration_structure_capture_replay: true,
            ..Default::default()
        });

        let mut r = booted(profile.clone(), ReplayFlags::default(), requested);
        assert!(r.state().support(DEVICE).acceleration_structure_capture_replay);
        assert_eq!(capture_replay_structure(&mut r), 0xabc000);

        let flags = ReplayFlags {
            disable_as_capture_replay: true,
            ..Default::default()
        };
        let mut r = booted(profile, flags, requested);
        assert!(!r.state().support(DEVICE).acceleration_structure_capture_replay);
        assert_eq!(capture_replay_structure(&mut r), 0);
    }

    #[test]
    pub fn present_delay_starts_after_the_loop_start_frame() {
        let flags = ReplayFlags {
            instrumentation_delay_us: 250,
            loop_start_frame: 2,
            ..Default::default()
        };
        assert_eq!(present_delay(&flags, 1), None);
        assert_eq!(present_delay(&flags, 2), None);
        assert_eq!(present_delay(&flags, 3), Some(Duration::from_micros(250)));
        assert_eq!(present_delay(&ReplayFlags::default(), 5), None);
    }
}
