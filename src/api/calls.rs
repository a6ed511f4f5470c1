//! The closed set of calls the trace can carry, one argument structure per
//! call. Handle-bearing fields are declared with `handle_fields!` right
//! after each structure.

use crate::api::{
    chain::Chain,
    handles::{HandleField, HandleFields, HandleVisitor},
    result::ApiResult,
    types::{
        BufferUsageFlags, DeviceFeatures, Extent2D, Extent3D, ImageTiling, ImageUsageFlags,
        MemoryProperties, MemoryRequirements, PresentMode, QueueFamilyProperties,
        SurfaceCapabilities,
    },
};
use serde::{Deserialize, Serialize};

/// Relative pointer into the raw data area that follows a packet's payload.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlobRef {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateInstance {
    pub application_name: String,
    pub api_version: u32,
    pub enabled_layers: Vec<String>,
    pub enabled_extensions: Vec<String>,
    pub instance: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateInstance { instance: (Out, Instance) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyInstance {
    pub instance: HandleField,
}
handle_fields!(DestroyInstance { instance: (Destroyed, Instance) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnumeratePhysicalDevices {
    pub instance: HandleField,
    pub physical_devices: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(EnumeratePhysicalDevices {
    instance: (In, Instance),
    physical_devices: [Out, PhysicalDevice],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPhysicalDeviceMemoryProperties {
    pub physical_device: HandleField,
    pub properties: MemoryProperties,
}
handle_fields!(GetPhysicalDeviceMemoryProperties { physical_device: (In, PhysicalDevice) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPhysicalDeviceQueueFamilyProperties {
    pub physical_device: HandleField,
    pub properties: Vec<QueueFamilyProperties>,
}
handle_fields!(GetPhysicalDeviceQueueFamilyProperties { physical_device: (In, PhysicalDevice) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPhysicalDeviceFeatures {
    pub physical_device: HandleField,
    pub features: DeviceFeatures,
}
handle_fields!(GetPhysicalDeviceFeatures { physical_device: (In, PhysicalDevice) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceQueueCreateInfo {
    pub queue_family_index: u32,
    pub queue_priorities: Vec<f32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateDevice {
    pub physical_device: HandleField,
    pub queue_create_infos: Vec<DeviceQueueCreateInfo>,
    pub enabled_layers: Vec<String>,
    pub enabled_extensions: Vec<String>,
    pub enabled_features: Option<DeviceFeatures>,
    pub next: Chain,
    pub device: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateDevice {
    physical_device: (In, PhysicalDevice),
    next: (nested),
    device: (Out, Device),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyDevice {
    pub device: HandleField,
}
handle_fields!(DestroyDevice { device: (Destroyed, Device) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceWaitIdle {
    pub device: HandleField,
    pub result: ApiResult,
}
handle_fields!(DeviceWaitIdle { device: (In, Device) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetDeviceQueue {
    pub device: HandleField,
    pub queue_family_index: u32,
    pub queue_index: u32,
    pub queue: HandleField,
}
handle_fields!(GetDeviceQueue { device: (In, Device), queue: (Out, Queue) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocateMemory {
    pub device: HandleField,
    pub allocation_size: u64,
    pub memory_type_index: u32,
    pub next: Chain,
    pub memory: HandleField,
    pub result: ApiResult,
}
handle_fields!(AllocateMemory {
    device: (In, Device),
    next: (nested),
    memory: (Out, DeviceMemory),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FreeMemory {
    pub device: HandleField,
    pub memory: HandleField,
}
handle_fields!(FreeMemory { device: (In, Device), memory: (Destroyed, DeviceMemory) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MapMemory {
    pub device: HandleField,
    pub memory: HandleField,
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
    /// Host address the application saw. Only used for diagnostics.
    pub trace_pointer: u64,
    /// Host address of the replay mapping, filled in by the driver.
    #[serde(skip)]
    pub replay_pointer: usize,
    pub result: ApiResult,
}
handle_fields!(MapMemory { device: (In, Device), memory: (In, DeviceMemory) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnmapMemory {
    pub device: HandleField,
    pub memory: HandleField,
    /// Changed-data package captured right before the unmap, if any.
    pub data: Option<BlobRef>,
}
handle_fields!(UnmapMemory { device: (In, Device), memory: (In, DeviceMemory) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MappedMemoryRange {
    pub memory: HandleField,
    pub offset: u64,
    pub size: u64,
    /// Changed-data package for this range.
    pub data: Option<BlobRef>,
}
handle_fields!(MappedMemoryRange { memory: (In, DeviceMemory) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlushMappedMemoryRanges {
    pub device: HandleField,
    pub ranges: Vec<MappedMemoryRange>,
    pub result: ApiResult,
}
handle_fields!(FlushMappedMemoryRanges { device: (In, Device), ranges: (nested) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateBuffer {
    pub device: HandleField,
    pub size: u64,
    pub usage: BufferUsageFlags,
    pub queue_family_indices: Vec<u32>,
    pub next: Chain,
    pub buffer: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateBuffer {
    device: (In, Device),
    next: (nested),
    buffer: (Out, Buffer),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyBuffer {
    pub device: HandleField,
    pub buffer: HandleField,
}
handle_fields!(DestroyBuffer { device: (In, Device), buffer: (Destroyed, Buffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetBufferMemoryRequirements {
    pub device: HandleField,
    pub buffer: HandleField,
    pub requirements: MemoryRequirements,
}
handle_fields!(GetBufferMemoryRequirements { device: (In, Device), buffer: (In, Buffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BindBufferMemory {
    pub device: HandleField,
    pub buffer: HandleField,
    pub memory: HandleField,
    pub memory_offset: u64,
    pub result: ApiResult,
}
handle_fields!(BindBufferMemory {
    device: (In, Device),
    buffer: (In, Buffer),
    memory: (In, DeviceMemory),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetBufferDeviceAddress {
    pub device: HandleField,
    pub buffer: HandleField,
    pub address: u64,
}
handle_fields!(GetBufferDeviceAddress { device: (In, Device), buffer: (In, Buffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateImage {
    pub device: HandleField,
    pub format: u32,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: ImageTiling,
    pub usage: ImageUsageFlags,
    pub queue_family_indices: Vec<u32>,
    pub next: Chain,
    pub image: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateImage {
    device: (In, Device),
    next: (nested),
    image: (Out, Image),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyImage {
    pub device: HandleField,
    pub image: HandleField,
}
handle_fields!(DestroyImage { device: (In, Device), image: (Destroyed, Image) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetImageMemoryRequirements {
    pub device: HandleField,
    pub image: HandleField,
    pub requirements: MemoryRequirements,
}
handle_fields!(GetImageMemoryRequirements { device: (In, Device), image: (In, Image) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BindImageMemory {
    pub device: HandleField,
    pub image: HandleField,
    pub memory: HandleField,
    pub memory_offset: u64,
    pub result: ApiResult,
}
handle_fields!(BindImageMemory {
    device: (In, Device),
    image: (In, Image),
    memory: (In, DeviceMemory),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BindImageMemoryInfo {
    pub image: HandleField,
    /// Null when the memory comes from a swapchain link in `next`.
    pub memory: HandleField,
    pub memory_offset: u64,
    pub next: Chain,
}
handle_fields!(BindImageMemoryInfo {
    image: (In, Image),
    memory: (Opt, DeviceMemory),
    next: (nested),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BindImageMemory2 {
    pub device: HandleField,
    pub bind_infos: Vec<BindImageMemoryInfo>,
    pub result: ApiResult,
}
handle_fields!(BindImageMemory2 { device: (In, Device), bind_infos: (nested) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateImageView {
    pub device: HandleField,
    pub image: HandleField,
    pub format: u32,
    pub next: Chain,
    pub view: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateImageView {
    device: (In, Device),
    image: (In, Image),
    next: (nested),
    view: (Out, ImageView),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyImageView {
    pub device: HandleField,
    pub view: HandleField,
}
handle_fields!(DestroyImageView { device: (In, Device), view: (Destroyed, ImageView) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSampler {
    pub device: HandleField,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub next: Chain,
    pub sampler: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateSampler {
    device: (In, Device),
    next: (nested),
    sampler: (Out, Sampler),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroySampler {
    pub device: HandleField,
    pub sampler: HandleField,
}
handle_fields!(DestroySampler { device: (In, Device), sampler: (Destroyed, Sampler) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSamplerYcbcrConversion {
    pub device: HandleField,
    pub format: u32,
    pub conversion: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateSamplerYcbcrConversion {
    device: (In, Device),
    conversion: (Out, SamplerYcbcrConversion),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateShaderModule {
    pub device: HandleField,
    pub code: Option<BlobRef>,
    pub module: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateShaderModule { device: (In, Device), module: (Out, ShaderModule) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyShaderModule {
    pub device: HandleField,
    pub module: HandleField,
}
handle_fields!(DestroyShaderModule { device: (In, Device), module: (Destroyed, ShaderModule) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreatePipelineLayout {
    pub device: HandleField,
    pub set_layouts: Vec<HandleField>,
    pub push_constant_size: u32,
    pub layout: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreatePipelineLayout {
    device: (In, Device),
    set_layouts: [In, DescriptorSetLayout],
    layout: (Out, PipelineLayout),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyPipelineLayout {
    pub device: HandleField,
    pub layout: HandleField,
}
handle_fields!(DestroyPipelineLayout {
    device: (In, Device),
    layout: (Destroyed, PipelineLayout),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComputePipelineCreateInfo {
    pub module: HandleField,
    pub entry_point: String,
    pub layout: HandleField,
}
handle_fields!(ComputePipelineCreateInfo {
    module: (In, ShaderModule),
    layout: (In, PipelineLayout),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateComputePipelines {
    pub device: HandleField,
    pub pipeline_cache: HandleField,
    pub create_infos: Vec<ComputePipelineCreateInfo>,
    pub pipelines: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(CreateComputePipelines {
    device: (In, Device),
    pipeline_cache: (Opt, PipelineCache),
    create_infos: (nested),
    pipelines: [Out, Pipeline],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyPipeline {
    pub device: HandleField,
    pub pipeline: HandleField,
}
handle_fields!(DestroyPipeline { device: (In, Device), pipeline: (Destroyed, Pipeline) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateRenderPass {
    pub device: HandleField,
    pub attachment_formats: Vec<u32>,
    pub render_pass: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateRenderPass { device: (In, Device), render_pass: (Out, RenderPass) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateFramebuffer {
    pub device: HandleField,
    pub render_pass: HandleField,
    /// Empty for imageless framebuffers.
    pub attachments: Vec<HandleField>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub framebuffer: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateFramebuffer {
    device: (In, Device),
    render_pass: (In, RenderPass),
    attachments: [In, ImageView],
    framebuffer: (Out, Framebuffer),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyFramebuffer {
    pub device: HandleField,
    pub framebuffer: HandleField,
}
handle_fields!(DestroyFramebuffer {
    device: (In, Device),
    framebuffer: (Destroyed, Framebuffer),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: u32,
    pub descriptor_count: u32,
    pub immutable_samplers: Vec<HandleField>,
}
handle_fields!(DescriptorSetLayoutBinding { immutable_samplers: [In, Sampler] });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateDescriptorSetLayout {
    pub device: HandleField,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
    pub layout: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateDescriptorSetLayout {
    device: (In, Device),
    bindings: (nested),
    layout: (Out, DescriptorSetLayout),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyDescriptorSetLayout {
    pub device: HandleField,
    pub layout: HandleField,
}
handle_fields!(DestroyDescriptorSetLayout {
    device: (In, Device),
    layout: (Destroyed, DescriptorSetLayout),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateDescriptorPool {
    pub device: HandleField,
    pub max_sets: u32,
    pub pool: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateDescriptorPool { device: (In, Device), pool: (Out, DescriptorPool) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyDescriptorPool {
    pub device: HandleField,
    pub pool: HandleField,
}
handle_fields!(DestroyDescriptorPool {
    device: (In, Device),
    pool: (Destroyed, DescriptorPool),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocateDescriptorSets {
    pub device: HandleField,
    pub pool: HandleField,
    pub set_layouts: Vec<HandleField>,
    pub sets: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(AllocateDescriptorSets {
    device: (In, Device),
    pool: (In, DescriptorPool),
    set_layouts: [In, DescriptorSetLayout],
    sets: [Out, DescriptorSet],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FreeDescriptorSets {
    pub device: HandleField,
    pub pool: HandleField,
    pub sets: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(FreeDescriptorSets {
    device: (In, Device),
    pool: (In, DescriptorPool),
    sets: [Destroyed, DescriptorSet],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DescriptorImageInfo {
    pub sampler: HandleField,
    pub image_view: HandleField,
    pub image_layout: u32,
}
handle_fields!(DescriptorImageInfo {
    sampler: (Opt, Sampler),
    image_view: (Opt, ImageView),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DescriptorBufferInfo {
    pub buffer: HandleField,
    pub offset: u64,
    pub range: u64,
}
handle_fields!(DescriptorBufferInfo { buffer: (Opt, Buffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteDescriptorSet {
    pub dst_set: HandleField,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: u32,
    pub image_infos: Vec<DescriptorImageInfo>,
    pub buffer_infos: Vec<DescriptorBufferInfo>,
    pub next: Chain,
}
handle_fields!(WriteDescriptorSet {
    dst_set: (In, DescriptorSet),
    image_infos: (nested),
    buffer_infos: (nested),
    next: (nested),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CopyDescriptorSet {
    pub src_set: HandleField,
    pub src_binding: u32,
    pub dst_set: HandleField,
    pub dst_binding: u32,
    pub descriptor_count: u32,
}
handle_fields!(CopyDescriptorSet {
    src_set: (In, DescriptorSet),
    dst_set: (In, DescriptorSet),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateDescriptorSets {
    pub device: HandleField,
    pub writes: Vec<WriteDescriptorSet>,
    pub copies: Vec<CopyDescriptorSet>,
}
handle_fields!(UpdateDescriptorSets {
    device: (In, Device),
    writes: (nested),
    copies: (nested),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateCommandPool {
    pub device: HandleField,
    pub queue_family_index: u32,
    pub flags: u32,
    pub pool: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateCommandPool { device: (In, Device), pool: (Out, CommandPool) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyCommandPool {
    pub device: HandleField,
    pub pool: HandleField,
}
handle_fields!(DestroyCommandPool {
    device: (In, Device),
    pool: (Destroyed, CommandPool),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocateCommandBuffers {
    pub device: HandleField,
    pub pool: HandleField,
    pub level: u32,
    pub command_buffers: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(AllocateCommandBuffers {
    device: (In, Device),
    pool: (In, CommandPool),
    command_buffers: [Out, CommandBuffer],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FreeCommandBuffers {
    pub device: HandleField,
    pub pool: HandleField,
    pub command_buffers: Vec<HandleField>,
}
handle_fields!(FreeCommandBuffers {
    device: (In, Device),
    pool: (In, CommandPool),
    command_buffers: [Destroyed, CommandBuffer],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BeginCommandBuffer {
    pub command_buffer: HandleField,
    pub flags: u32,
    pub result: ApiResult,
}
handle_fields!(BeginCommandBuffer { command_buffer: (In, CommandBuffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndCommandBuffer {
    pub command_buffer: HandleField,
    pub result: ApiResult,
}
handle_fields!(EndCommandBuffer { command_buffer: (In, CommandBuffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdBeginRenderPass {
    pub command_buffer: HandleField,
    pub render_pass: HandleField,
    pub framebuffer: HandleField,
    pub render_area: Extent2D,
    pub next: Chain,
}
handle_fields!(CmdBeginRenderPass {
    command_buffer: (In, CommandBuffer),
    render_pass: (In, RenderPass),
    framebuffer: (In, Framebuffer),
    next: (nested),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdEndRenderPass {
    pub command_buffer: HandleField,
}
handle_fields!(CmdEndRenderPass { command_buffer: (In, CommandBuffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdBindPipeline {
    pub command_buffer: HandleField,
    pub bind_point: u32,
    pub pipeline: HandleField,
}
handle_fields!(CmdBindPipeline {
    command_buffer: (In, CommandBuffer),
    pipeline: (In, Pipeline),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdBindDescriptorSets {
    pub command_buffer: HandleField,
    pub bind_point: u32,
    pub layout: HandleField,
    pub first_set: u32,
    pub descriptor_sets: Vec<HandleField>,
    pub dynamic_offsets: Vec<u32>,
}
handle_fields!(CmdBindDescriptorSets {
    command_buffer: (In, CommandBuffer),
    layout: (In, PipelineLayout),
    descriptor_sets: [In, DescriptorSet],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdBindVertexBuffers {
    pub command_buffer: HandleField,
    pub first_binding: u32,
    pub buffers: Vec<HandleField>,
    pub offsets: Vec<u64>,
}
handle_fields!(CmdBindVertexBuffers {
    command_buffer: (In, CommandBuffer),
    buffers: [In, Buffer],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdDrawIndexed {
    pub command_buffer: HandleField,
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}
handle_fields!(CmdDrawIndexed { command_buffer: (In, CommandBuffer) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdDispatch {
    pub command_buffer: HandleField,
    pub group_count: [u32; 3],
}
handle_fields!(CmdDispatch { command_buffer: (In, CommandBuffer) });

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CmdCopyBuffer {
    pub command_buffer: HandleField,
    pub src_buffer: HandleField,
    pub dst_buffer: HandleField,
    pub regions: Vec<BufferCopy>,
}
handle_fields!(CmdCopyBuffer {
    command_buffer: (In, CommandBuffer),
    src_buffer: (In, Buffer),
    dst_buffer: (In, Buffer),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<HandleField>,
    pub wait_dst_stage_masks: Vec<u32>,
    pub command_buffers: Vec<HandleField>,
    pub signal_semaphores: Vec<HandleField>,
    pub next: Chain,
}
handle_fields!(SubmitInfo {
    wait_semaphores: [In, Semaphore],
    command_buffers: [In, CommandBuffer],
    signal_semaphores: [In, Semaphore],
    next: (nested),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSubmit {
    pub queue: HandleField,
    pub submits: Vec<SubmitInfo>,
    pub fence: HandleField,
    pub result: ApiResult,
}
handle_fields!(QueueSubmit {
    queue: (In, Queue),
    submits: (nested),
    fence: (Opt, Fence),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueWaitIdle {
    pub queue: HandleField,
    pub result: ApiResult,
}
handle_fields!(QueueWaitIdle { queue: (In, Queue) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateFence {
    pub device: HandleField,
    pub signaled: bool,
    pub fence: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateFence { device: (In, Device), fence: (Out, Fence) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyFence {
    pub device: HandleField,
    pub fence: HandleField,
}
handle_fields!(DestroyFence { device: (In, Device), fence: (Destroyed, Fence) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WaitForFences {
    pub device: HandleField,
    pub fences: Vec<HandleField>,
    pub wait_all: bool,
    pub timeout: u64,
    pub result: ApiResult,
}
handle_fields!(WaitForFences { device: (In, Device), fences: [In, Fence] });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResetFences {
    pub device: HandleField,
    pub fences: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(ResetFences { device: (In, Device), fences: [In, Fence] });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetFenceStatus {
    pub device: HandleField,
    pub fence: HandleField,
    pub result: ApiResult,
}
handle_fields!(GetFenceStatus { device: (In, Device), fence: (In, Fence) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSemaphore {
    pub device: HandleField,
    pub semaphore: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateSemaphore { device: (In, Device), semaphore: (Out, Semaphore) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroySemaphore {
    pub device: HandleField,
    pub semaphore: HandleField,
}
handle_fields!(DestroySemaphore {
    device: (In, Device),
    semaphore: (Destroyed, Semaphore),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSurface {
    pub instance: HandleField,
    /// Size of the window the application rendered into.
    pub window_extent: Extent2D,
    pub surface: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateSurface { instance: (In, Instance), surface: (Out, Surface) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroySurface {
    pub instance: HandleField,
    pub surface: HandleField,
}
handle_fields!(DestroySurface { instance: (In, Instance), surface: (Destroyed, Surface) });

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetSurfaceCapabilities {
    pub physical_device: HandleField,
    pub surface: HandleField,
    pub capabilities: SurfaceCapabilities,
    pub result: ApiResult,
}
handle_fields!(GetSurfaceCapabilities {
    physical_device: (In, PhysicalDevice),
    surface: (In, Surface),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetSurfacePresentModes {
    pub physical_device: HandleField,
    pub surface: HandleField,
    pub present_modes: Vec<PresentMode>,
    pub result: ApiResult,
}
handle_fields!(GetSurfacePresentModes {
    physical_device: (In, PhysicalDevice),
    surface: (In, Surface),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSwapchain {
    pub device: HandleField,
    pub surface: HandleField,
    pub min_image_count: u32,
    pub image_format: u32,
    pub image_extent: Extent2D,
    pub image_usage: ImageUsageFlags,
    pub queue_family_indices: Vec<u32>,
    pub present_mode: PresentMode,
    pub old_swapchain: HandleField,
    pub swapchain: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateSwapchain {
    device: (In, Device),
    surface: (In, Surface),
    old_swapchain: (Opt, Swapchain),
    swapchain: (Out, Swapchain),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroySwapchain {
    pub device: HandleField,
    pub swapchain: HandleField,
}
handle_fields!(DestroySwapchain {
    device: (In, Device),
    swapchain: (Destroyed, Swapchain),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetSwapchainImages {
    pub device: HandleField,
    pub swapchain: HandleField,
    pub images: Vec<HandleField>,
    pub result: ApiResult,
}
handle_fields!(GetSwapchainImages {
    device: (In, Device),
    swapchain: (In, Swapchain),
    images: [Out, Image],
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AcquireNextImage {
    pub device: HandleField,
    pub swapchain: HandleField,
    pub timeout: u64,
    pub semaphore: HandleField,
    pub fence: HandleField,
    pub image_index: u32,
    pub result: ApiResult,
}
handle_fields!(AcquireNextImage {
    device: (In, Device),
    swapchain: (In, Swapchain),
    semaphore: (Opt, Semaphore),
    fence: (Opt, Fence),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueuePresent {
    pub queue: HandleField,
    pub wait_semaphores: Vec<HandleField>,
    pub swapchains: Vec<HandleField>,
    pub image_indices: Vec<u32>,
    pub next: Chain,
    pub result: ApiResult,
}
handle_fields!(QueuePresent {
    queue: (In, Queue),
    wait_semaphores: [In, Semaphore],
    swapchains: [In, Swapchain],
    next: (nested),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateAccelerationStructure {
    pub device: HandleField,
    pub buffer: HandleField,
    pub offset: u64,
    pub size: u64,
    pub structure_type: u32,
    /// Address requested for capture/replay, 0 when none was recorded.
    pub device_address: u64,
    pub acceleration_structure: HandleField,
    pub result: ApiResult,
}
handle_fields!(CreateAccelerationStructure {
    device: (In, Device),
    buffer: (In, Buffer),
    acceleration_structure: (Out, AccelerationStructure),
});

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroyAccelerationStructure {
    pub device: HandleField,
    pub acceleration_structure: HandleField,
}
handle_fields!(DestroyAccelerationStructure {
    device: (In, Device),
    acceleration_structure: (Destroyed, AccelerationStructure),
});

/// Calls that record a result code. The recorded value is what replay is
/// compared against.
pub trait TracedResult {
    fn traced_result(&self) -> Option<ApiResult> {
        None
    }
    fn set_result(&mut self, _result: ApiResult) {}
}

macro_rules! traced_results {
    (with: $($with:ident),* ; without: $($without:ident),* $(;)?) => {
        $(
            impl TracedResult for $with {
                fn traced_result(&self) -> Option<ApiResult> {
                    Some(self.result)
                }
                fn set_result(&mut self, result: ApiResult) {
                    self.result = result;
                }
            }
        )*
        $( impl TracedResult for $without {} )*
    };
}

traced_results! {
    with: CreateInstance, EnumeratePhysicalDevices, CreateDevice, DeviceWaitIdle, AllocateMemory,
        MapMemory, FlushMappedMemoryRanges, CreateBuffer, BindBufferMemory, CreateImage,
        BindImageMemory, BindImageMemory2, CreateImageView, CreateSampler,
        CreateSamplerYcbcrConversion, CreateShaderModule, CreatePipelineLayout,
        CreateComputePipelines, CreateRenderPass, CreateFramebuffer, CreateDescriptorSetLayout,
        CreateDescriptorPool, AllocateDescriptorSets, FreeDescriptorSets, CreateCommandPool,
        AllocateCommandBuffers, BeginCommandBuffer, EndCommandBuffer, QueueSubmit, QueueWaitIdle,
        CreateFence, WaitForFences, ResetFences, GetFenceStatus, CreateSemaphore, CreateSurface,
        GetSurfaceCapabilities, GetSurfacePresentModes, CreateSwapchain, GetSwapchainImages,
        AcquireNextImage, QueuePresent, CreateAccelerationStructure;
    without: DestroyInstance, GetPhysicalDeviceMemoryProperties,
        GetPhysicalDeviceQueueFamilyProperties, GetPhysicalDeviceFeatures, DestroyDevice,
        GetDeviceQueue, FreeMemory, UnmapMemory, DestroyBuffer, GetBufferMemoryRequirements,
        GetBufferDeviceAddress, DestroyImage, GetImageMemoryRequirements, DestroyImageView,
        DestroySampler, DestroyShaderModule, DestroyPipelineLayout, DestroyPipeline,
        DestroyFramebuffer, DestroyDescriptorSetLayout, DestroyDescriptorPool,
        UpdateDescriptorSets, DestroyCommandPool, FreeCommandBuffers, CmdBeginRenderPass,
        CmdEndRenderPass, CmdBindPipeline, CmdBindDescriptorSets, CmdBindVertexBuffers,
        CmdDrawIndexed, CmdDispatch, CmdCopyBuffer, DestroyFence, DestroySemaphore,
        DestroySurface, DestroySwapchain, DestroyAccelerationStructure;
}

/// Declares `ApiCall` (one variant per call structure) together with its
/// stable on-disk packet id and entrypoint name.
macro_rules! api_calls {
    ($($id:literal => $call:ident : $name:literal),* $(,)?) => {
        #[derive(Clone, Debug, Serialize, Deserialize)]
        pub enum ApiCall {
            $( $call($call), )*
        }

        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u16)]
        pub enum CallId {
            $( $call = $id, )*
        }

        impl CallId {
            pub fn from_raw(raw: u16) -> Option<CallId> {
                match raw {
                    $( $id => Some(CallId::$call), )*
                    _ => None,
                }
            }

            pub fn as_raw(self) -> u16 {
                self as u16
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( CallId::$call => $name, )*
                }
            }
        }

        impl ApiCall {
            pub fn id(&self) -> CallId {
                match self {
                    $( ApiCall::$call(_) => CallId::$call, )*
                }
            }

            pub fn name(&self) -> &'static str {
                self.id().name()
            }

            pub fn traced_result(&self) -> Option<ApiResult> {
                match self {
                    $( ApiCall::$call(c) => c.traced_result(), )*
                }
            }

            pub fn set_result(&mut self, result: ApiResult) {
                match self {
                    $( ApiCall::$call(c) => c.set_result(result), )*
                }
            }
        }

        impl HandleFields for ApiCall {
            fn visit_handles(&mut self, v: &mut dyn HandleVisitor) {
                match self {
                    $( ApiCall::$call(c) => c.visit_handles(v), )*
                }
            }
        }

        $(
            impl From<$call> for ApiCall {
                fn from(c: $call) -> ApiCall {
                    ApiCall::$call(c)
                }
            }
        )*
    };
}

api_calls! {
    100 => CreateInstance: "vkCreateInstance",
    101 => DestroyInstance: "vkDestroyInstance",
    102 => EnumeratePhysicalDevices: "vkEnumeratePhysicalDevices",
    103 => GetPhysicalDeviceMemoryProperties: "vkGetPhysicalDeviceMemoryProperties",
    104 => GetPhysicalDeviceQueueFamilyProperties: "vkGetPhysicalDeviceQueueFamilyProperties",
    105 => GetPhysicalDeviceFeatures: "vkGetPhysicalDeviceFeatures",
    106 => CreateDevice: "vkCreateDevice",
    107 => DestroyDevice: "vkDestroyDevice",
    108 => DeviceWaitIdle: "vkDeviceWaitIdle",
    109 => GetDeviceQueue: "vkGetDeviceQueue",
    110 => AllocateMemory: "vkAllocateMemory",
    111 => FreeMemory: "vkFreeMemory",
    112 => MapMemory: "vkMapMemory",
    113 => UnmapMemory: "vkUnmapMemory",
    114 => FlushMappedMemoryRanges: "vkFlushMappedMemoryRanges",
    115 => CreateBuffer: "vkCreateBuffer",
    116 => DestroyBuffer: "vkDestroyBuffer",
    117 => GetBufferMemoryRequirements: "vkGetBufferMemoryRequirements",
    118 => BindBufferMemory: "vkBindBufferMemory",
    119 => GetBufferDeviceAddress: "vkGetBufferDeviceAddress",
    120 => CreateImage: "vkCreateImage",
    121 => DestroyImage: "vkDestroyImage",
    122 => GetImageMemoryRequirements: "vkGetImageMemoryRequirements",
    123 => BindImageMemory: "vkBindImageMemory",
    124 => BindImageMemory2: "vkBindImageMemory2",
    125 => CreateImageView: "vkCreateImageView",
    126 => DestroyImageView: "vkDestroyImageView",
    127 => CreateSampler: "vkCreateSampler",
    128 => DestroySampler: "vkDestroySampler",
    129 => CreateSamplerYcbcrConversion: "vkCreateSamplerYcbcrConversion",
    130 => CreateShaderModule: "vkCreateShaderModule",
    131 => DestroyShaderModule: "vkDestroyShaderModule",
    132 => CreatePipelineLayout: "vkCreatePipelineLayout",
    133 => DestroyPipelineLayout: "vkDestroyPipelineLayout",
    134 => CreateComputePipelines: "vkCreateComputePipelines",
    135 => DestroyPipeline: "vkDestroyPipeline",
    136 => CreateRenderPass: "vkCreateRenderPass",
    137 => CreateFramebuffer: "vkCreateFramebuffer",
    138 => DestroyFramebuffer: "vkDestroyFramebuffer",
    139 => CreateDescriptorSetLayout: "vkCreateDescriptorSetLayout",
    140 => DestroyDescriptorSetLayout: "vkDestroyDescriptorSetLayout",
    141 => CreateDescriptorPool: "vkCreateDescriptorPool",
    142 => DestroyDescriptorPool: "vkDestroyDescriptorPool",
    143 => AllocateDescriptorSets: "vkAllocateDescriptorSets",
    144 => FreeDescriptorSets: "vkFreeDescriptorSets",
    145 => UpdateDescriptorSets: "vkUpdateDescriptorSets",
    146 => CreateCommandPool: "vkCreateCommandPool",
    147 => DestroyCommandPool: "vkDestroyCommandPool",
    148 => AllocateCommandBuffers: "vkAllocateCommandBuffers",
    149 => FreeCommandBuffers: "vkFreeCommandBuffers",
    150 => BeginCommandBuffer: "vkBeginCommandBuffer",
    151 => EndCommandBuffer: "vkEndCommandBuffer",
    152 => CmdBeginRenderPass: "vkCmdBeginRenderPass",
    153 => CmdEndRenderPass: "vkCmdEndRenderPass",
    154 => CmdBindPipeline: "vkCmdBindPipeline",
    155 => CmdBindDescriptorSets: "vkCmdBindDescriptorSets",
    156 => CmdBindVertexBuffers: "vkCmdBindVertexBuffers",
    157 => CmdDrawIndexed: "vkCmdDrawIndexed",
    158 => CmdDispatch: "vkCmdDispatch",
    159 => CmdCopyBuffer: "vkCmdCopyBuffer",
    160 => QueueSubmit: "vkQueueSubmit",
    161 => QueueWaitIdle: "vkQueueWaitIdle",
    162 => CreateFence: "vkCreateFence",
    163 => DestroyFence: "vkDestroyFence",
    164 => WaitForFences: "vkWaitForFences",
    165 => ResetFences: "vkResetFences",
    166 => GetFenceStatus: "vkGetFenceStatus",
    167 => CreateSemaphore: "vkCreateSemaphore",
    168 => DestroySemaphore: "vkDestroySemaphore",
    169 => CreateSurface: "vkCreateSurfaceKHR",
    170 => DestroySurface: "vkDestroySurfaceKHR",
    171 => GetSurfaceCapabilities: "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
    172 => GetSurfacePresentModes: "vkGetPhysicalDeviceSurfacePresentModesKHR",
    173 => CreateSwapchain: "vkCreateSwapchainKHR",
    174 => DestroySwapchain: "vkDestroySwapchainKHR",
    175 => GetSwapchainImages: "vkGetSwapchainImagesKHR",
    176 => AcquireNextImage: "vkAcquireNextImageKHR",
    177 => QueuePresent: "vkQueuePresentKHR",
    178 => CreateAccelerationStructure: "vkCreateAccelerationStructureKHR",
    179 => DestroyAccelerationStructure: "vkDestroyAccelerationStructureKHR",
}

pub const FIRST_CALL_ID: u16 = 100;

impl CallId {
    /// Calls recorded in the portability table so replay can look ahead
    /// from an allocation to whatever ends up bound to it.
    pub fn is_memory_relevant(self) -> bool {
        match self {
            CallId::AllocateMemory
            | CallId::FreeMemory
            | CallId::CreateBuffer
            | CallId::DestroyBuffer
            | CallId::CreateImage
            | CallId::DestroyImage
            | CallId::GetBufferMemoryRequirements
            | CallId::GetImageMemoryRequirements
            | CallId::BindBufferMemory
            | CallId::BindImageMemory
            | CallId::BindImageMemory2 => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{
        chain::ChainLink,
        handles::{HandleCollector, HandleRole, ObjectKind},
    };

    #[test]
    pub fn ids_round_trip_and_names() {
        for raw in FIRST_CALL_ID..=179 {
            let id = CallId::from_raw(raw).unwrap();
            assert_eq!(id.as_raw(), raw);
        }
        assert_eq!(CallId::from_raw(99), None);
        assert_eq!(CallId::from_raw(180), None);
        assert_eq!(CallId::QueuePresent.name(), "vkQueuePresentKHR");
    }

    #[test]
    pub fn nested_submit_handles_are_reachable() {
        let mut call: ApiCall = QueueSubmit {
            queue: HandleField::new(1),
            submits: vec![SubmitInfo {
                wait_semaphores: vec![HandleField::new(2)],
                wait_dst_stage_masks: vec![0x400],
                command_buffers: vec![HandleField::new(3), HandleField::new(4)],
                signal_semaphores: vec![HandleField::new(5)],
                next: vec![ChainLink::TimelineSemaphoreSubmitInfo {
                    wait_values: vec![1],
                    signal_values: vec![2],
                }],
            }],
            fence: HandleField::null(),
            result: ApiResult::SUCCESS,
        }
        .into();
        let mut c = HandleCollector::default();
        call.visit_handles(&mut c);
        assert_eq!(c.found.len(), 6);
        assert_eq!(c.found[2].1, ObjectKind::CommandBuffer);
        assert_eq!(c.found[5].2, HandleRole::Opt);
        assert_eq!(call.id(), CallId::QueueSubmit);
        assert_eq!(call.traced_result(), Some(ApiResult::SUCCESS));
    }

    #[test]
    pub fn payload_json_keeps_variant_and_handles() {
        let call: ApiCall = DestroyBuffer {
            device: HandleField::new(0xd),
            buffer: HandleField::new(0xb0),
        }
        .into();
        let bytes = serde_json::to_vec(&call).unwrap();
        let back: ApiCall = serde_json::from_slice(&bytes).unwrap();
        match back {
            ApiCall::DestroyBuffer(d) => {
                assert_eq!(d.device.trace(), 0xd);
                assert_eq!(d.buffer.trace(), 0xb0);
            }
            other => panic!("decoded the wrong call: {:?}", other),
        }
        assert_eq!(call.traced_result(), None);
    }
}
