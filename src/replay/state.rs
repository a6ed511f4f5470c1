//! What replay remembers about trace objects beyond their handles. Keys
//! are trace handles unless a field says otherwise.

use crate::api::{
    calls::ApiCall,
    types::{
        DeviceFeatures, ImageTiling, MemoryProperties, QueueFamilyProperties, SurfaceCapabilities,
    },
};
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Mapping {
    /// Replay-side pointer to the first mapped byte.
    pub pointer: usize,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryState {
    pub device: u64,
    /// Size of the replay allocation, which can exceed the traced size.
    pub size: u64,
    pub trace_type_index: u32,
    pub replay_type_index: u32,
    pub mapping: Option<Mapping>,
}

#[derive(Clone, Debug, Default)]
pub struct PhysicalDeviceState {
    pub trace_memory: Option<MemoryProperties>,
    pub replay_memory: Option<MemoryProperties>,
    pub trace_queue_families: Vec<QueueFamilyProperties>,
    pub replay_queue_families: Vec<QueueFamilyProperties>,
    pub replay_features: Option<DeviceFeatures>,
}

/// Features a created device actually has enabled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceSupport {
    pub acceleration_structure_capture_replay: bool,
    pub buffer_device_address_capture_replay: bool,
    pub sampler_anisotropy: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SwapchainState {
    pub device: u64,
    pub surface: u64,
    /// Images the replay swapchain really has.
    pub replay_image_count: u32,
    /// Replay image indices currently held by the application.
    pub acquired: Vec<bool>,
    /// Trace image index → replay image index of the latest acquire.
    pub index_map: HashMap<u32, u32>,
    /// Pool semaphore signaled for a replay index that was acquired early
    /// while hunting for the traced one.
    pub early_acquires: HashMap<u32, u64>,
}

impl SwapchainState {
    pub fn replay_index(&self, trace_index: u32) -> u32 {
        self.index_map.get(&trace_index).copied().unwrap_or(trace_index)
    }
}

/// A replay-owned semaphore standing in for one the application waits on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PooledSemaphore {
    /// Trace handle of the device the semaphore belongs to.
    pub device: u64,
    pub semaphore: u64,
}

/// With a single window every traced swapchain is served by one replay
/// swapchain.
#[derive(Clone, Debug)]
pub struct SingleWindow {
    pub replay_swapchain: u64,
    pub refcount: u32,
    pub capabilities: SurfaceCapabilities,
    pub image_count: u32,
}

#[derive(Default)]
pub struct ReplayState {
    pub memory: HashMap<u64, MemoryState>,
    pub image_tiling: HashMap<u64, ImageTiling>,
    pub physical_devices: HashMap<u64, PhysicalDeviceState>,
    pub device_to_physical: HashMap<u64, u64>,
    pub device_support: HashMap<u64, DeviceSupport>,
    /// (device, trace queue family) → replay queue family.
    pub queue_families: HashMap<(u64, u32), u32>,
    pub swapchains: HashMap<u64, SwapchainState>,
    /// Replay semaphore the application waits on → replay semaphore that
    /// really carries the signal. Consumed by the next submit or present.
    pub semaphore_substitutes: HashMap<u64, PooledSemaphore>,
    /// Unsignaled replay semaphores per device.
    pub semaphore_pool: HashMap<u64, Vec<u64>>,
    /// Some replay queue of each device, for signaling fences replay owes
    /// the application.
    pub device_queues: HashMap<u64, u64>,
    pub single_window: Option<SingleWindow>,
    /// Memory-relevant calls by file offset, for looking ahead from an
    /// allocation to the resource bound to it.
    pub lookahead: Vec<(u64, ApiCall)>,
    /// File offset of the packet being replayed.
    pub current_offset: u64,
    pub frame: u64,
}

impl ReplayState {
    pub fn physical_device_of(&self, device: u64) -> Option<&PhysicalDeviceState> {
        self.device_to_physical
            .get(&device)
            .and_then(|pd| self.physical_devices.get(pd))
    }

    pub fn support(&self, device: u64) -> DeviceSupport {
        self.device_support.get(&device).copied().unwrap_or_default()
    }

    /// Replay queue family for a traced one. Unchanged if no translation
    /// was set up for the device.
    pub fn queue_family(&self, device: u64, trace_family: u32) -> u32 {
        self.queue_families
            .get(&(device, trace_family))
            .copied()
            .unwrap_or(trace_family)
    }

    /// Lookahead entries after the packet being replayed.
    pub fn upcoming(&self) -> &[(u64, ApiCall)] {
        let start = self
            .lookahead
            .partition_point(|(off, _)| *off <= self.current_offset);
        &self.lookahead[start..]
    }

    /// Forget everything tied to a destroyed device.
    pub fn drop_device(&mut self, device: u64) {
        self.device_to_physical.remove(&device);
        self.device_support.remove(&device);
        self.queue_families.retain(|(d, _), _| *d != device);
        self.memory.retain(|_, m| m.device != device);
        self.swapchains.retain(|_, s| s.device != device);
        self.semaphore_substitutes.retain(|_, p| p.device != device);
        self.semaphore_pool.remove(&device);
        self.device_queues.remove(&device);
    }
}
