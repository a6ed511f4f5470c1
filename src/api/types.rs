//! Plain data structures shared by the trace, the replay driver and the
//! compatibility translation.

use serde::{Deserialize, Serialize};

pub const MAX_MEMORY_TYPES: usize = 32;
pub const WHOLE_SIZE: u64 = !0;

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 0x1;
        const HOST_VISIBLE = 0x2;
        const HOST_COHERENT = 0x4;
        const HOST_CACHED = 0x8;
        const LAZILY_ALLOCATED = 0x10;
        const PROTECTED = 0x20;
    }
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct QueueFlags: u32 {
        const GRAPHICS = 0x1;
        const COMPUTE = 0x2;
        const TRANSFER = 0x4;
        const SPARSE_BINDING = 0x8;
        const PROTECTED = 0x10;
    }
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct BufferUsageFlags: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const UNIFORM_BUFFER = 0x10;
        const STORAGE_BUFFER = 0x20;
        const INDEX_BUFFER = 0x40;
        const VERTEX_BUFFER = 0x80;
        const SHADER_DEVICE_ADDRESS = 0x20000;
    }
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct ImageUsageFlags: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const SAMPLED = 0x4;
        const STORAGE = 0x8;
        const COLOR_ATTACHMENT = 0x10;
        const DEPTH_STENCIL_ATTACHMENT = 0x20;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueFamilyProperties {
    pub queue_flags: QueueFlags,
    pub queue_count: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl Default for PresentMode {
    fn default() -> Self {
        PresentMode::Fifo
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ImageTiling {
    Optimal,
    Linear,
}

impl Default for ImageTiling {
    fn default() -> Self {
        ImageTiling::Optimal
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// 0 means no upper limit.
    pub max_image_count: u32,
    pub current_extent: Extent2D,
    pub min_image_extent: Extent2D,
    pub max_image_extent: Extent2D,
}

/// The subset of optional device features replay cares about.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub geometry_shader: bool,
    pub tessellation_shader: bool,
    pub shader_float64: bool,
    pub buffer_device_address: bool,
    pub buffer_device_address_capture_replay: bool,
    pub acceleration_structure: bool,
    pub acceleration_structure_capture_replay: bool,
}

impl DeviceFeatures {
    /// Features requested in `self` that `available` does not offer.
    pub fn unsupported_by(&self, available: &DeviceFeatures) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let pairs = [
            (self.sampler_anisotropy, available.sampler_anisotropy, "samplerAnisotropy"),
            (self.geometry_shader, available.geometry_shader, "geometryShader"),
            (self.tessellation_shader, available.tessellation_shader, "tessellationShader"),
            (self.shader_float64, available.shader_float64, "shaderFloat64"),
            (self.buffer_device_address, available.buffer_device_address, "bufferDeviceAddress"),
            (
                self.buffer_device_address_capture_replay,
                available.buffer_device_address_capture_replay,
                "bufferDeviceAddressCaptureReplay",
            ),
            (self.acceleration_structure, available.acceleration_structure, "accelerationStructure"),
            (
                self.acceleration_structure_capture_replay,
                available.acceleration_structure_capture_replay,
                "accelerationStructureCaptureReplay",
            ),
        ];
        for (wanted, have, name) in pairs.iter() {
            if *wanted && !*have {
                missing.push(*name);
            }
        }
        missing
    }

    /// Clear every feature that `available` does not offer.
    pub fn restrict_to(&mut self, available: &DeviceFeatures) {
        self.sampler_anisotropy &= available.sampler_anisotropy;
        self.geometry_shader &= available.geometry_shader;
        self.tessellation_shader &= available.tessellation_shader;
        self.shader_float64 &= available.shader_float64;
        self.buffer_device_address &= available.buffer_device_address;
        self.buffer_device_address_capture_replay &= available.buffer_device_address_capture_replay;
        self.acceleration_structure &= available.acceleration_structure;
        self.acceleration_structure_capture_replay &=
            available.acceleration_structure_capture_replay;
    }
}
