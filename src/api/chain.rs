use crate::{
    api::{
        handles::{HandleField, HandleFields, HandleRole, HandleVisitor, ObjectKind},
        types::DeviceFeatures,
    },
    log::LogLevel::LogDebug,
};
use serde::{Deserialize, Serialize};

/// One link of an extensible-structure chain hanging off a call argument.
///
/// Only the link kinds listed here are understood. Anything else decodes
/// as `Unknown` and is carried along untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChainLink {
    MemoryDedicatedAllocateInfo {
        image: HandleField,
        buffer: HandleField,
    },
    MemoryAllocateFlagsInfo {
        device_address: bool,
        device_address_capture_replay: bool,
    },
    BindImageMemorySwapchainInfo {
        swapchain: HandleField,
        image_index: u32,
    },
    ImageSwapchainCreateInfo {
        swapchain: HandleField,
    },
    SamplerYcbcrConversionInfo {
        conversion: HandleField,
    },
    WriteDescriptorSetAccelerationStructure {
        acceleration_structures: Vec<HandleField>,
    },
    RenderPassAttachmentBeginInfo {
        attachments: Vec<HandleField>,
    },
    DeviceGroupDeviceCreateInfo {
        physical_devices: Vec<HandleField>,
    },
    TimelineSemaphoreSubmitInfo {
        wait_values: Vec<u64>,
        signal_values: Vec<u64>,
    },
    PhysicalDeviceFeatures2 {
        features: DeviceFeatures,
    },
    SwapchainPresentFenceInfo {
        fences: Vec<HandleField>,
    },
    Unknown {
        s_type: u32,
    },
}

impl ChainLink {
    pub fn name(&self) -> &'static str {
        match self {
            ChainLink::MemoryDedicatedAllocateInfo { .. } => "MemoryDedicatedAllocateInfo",
            ChainLink::MemoryAllocateFlagsInfo { .. } => "MemoryAllocateFlagsInfo",
            ChainLink::BindImageMemorySwapchainInfo { .. } => "BindImageMemorySwapchainInfo",
            ChainLink::ImageSwapchainCreateInfo { .. } => "ImageSwapchainCreateInfo",
            ChainLink::SamplerYcbcrConversionInfo { .. } => "SamplerYcbcrConversionInfo",
            ChainLink::WriteDescriptorSetAccelerationStructure { .. } => {
                "WriteDescriptorSetAccelerationStructure"
            }
            ChainLink::RenderPassAttachmentBeginInfo { .. } => "RenderPassAttachmentBeginInfo",
            ChainLink::DeviceGroupDeviceCreateInfo { .. } => "DeviceGroupDeviceCreateInfo",
            ChainLink::TimelineSemaphoreSubmitInfo { .. } => "TimelineSemaphoreSubmitInfo",
            ChainLink::PhysicalDeviceFeatures2 { .. } => "PhysicalDeviceFeatures2",
            ChainLink::SwapchainPresentFenceInfo { .. } => "SwapchainPresentFenceInfo",
            ChainLink::Unknown { .. } => "Unknown",
        }
    }
}

fn visit_all(
    v: &mut dyn HandleVisitor,
    field: &'static str,
    kind: ObjectKind,
    role: HandleRole,
    handles: &mut Vec<HandleField>,
) {
    for h in handles.iter_mut() {
        v.visit(field, kind, role, h);
    }
}

impl HandleFields for ChainLink {
    fn visit_handles(&mut self, v: &mut dyn HandleVisitor) {
        match self {
            ChainLink::MemoryDedicatedAllocateInfo { image, buffer } => {
                v.visit("image", ObjectKind::Image, HandleRole::Opt, image);
                v.visit("buffer", ObjectKind::Buffer, HandleRole::Opt, buffer);
            }
            ChainLink::BindImageMemorySwapchainInfo { swapchain, .. } => {
                v.visit("swapchain", ObjectKind::Swapchain, HandleRole::In, swapchain);
            }
            ChainLink::ImageSwapchainCreateInfo { swapchain } => {
                v.visit("swapchain", ObjectKind::Swapchain, HandleRole::Opt, swapchain);
            }
            ChainLink::SamplerYcbcrConversionInfo { conversion } => {
                v.visit(
                    "conversion",
                    ObjectKind::SamplerYcbcrConversion,
                    HandleRole::In,
                    conversion,
                );
            }
            ChainLink::WriteDescriptorSetAccelerationStructure {
                acceleration_structures,
            } => visit_all(
                v,
                "acceleration_structures",
                ObjectKind::AccelerationStructure,
                HandleRole::Opt,
                acceleration_structures,
            ),
            ChainLink::RenderPassAttachmentBeginInfo { attachments } => visit_all(
                v,
                "attachments",
                ObjectKind::ImageView,
                HandleRole::In,
                attachments,
            ),
            ChainLink::DeviceGroupDeviceCreateInfo { physical_devices } => visit_all(
                v,
                "physical_devices",
                ObjectKind::PhysicalDevice,
                HandleRole::In,
                physical_devices,
            ),
            ChainLink::SwapchainPresentFenceInfo { fences } => {
                visit_all(v, "fences", ObjectKind::Fence, HandleRole::Opt, fences)
            }
            ChainLink::MemoryAllocateFlagsInfo { .. }
            | ChainLink::TimelineSemaphoreSubmitInfo { .. }
            | ChainLink::PhysicalDeviceFeatures2 { .. } => (),
            ChainLink::Unknown { s_type } => {
                log!(LogDebug, "Skipping unknown chained structure type {}", s_type);
            }
        }
    }
}

/// The chain as a whole is visited link by link, in order.
pub type Chain = Vec<ChainLink>;

pub fn find_features(chain: &[ChainLink]) -> Option<&DeviceFeatures> {
    chain.iter().find_map(|l| match l {
        ChainLink::PhysicalDeviceFeatures2 { features } => Some(features),
        _ => None,
    })
}

pub fn find_features_mut(chain: &mut [ChainLink]) -> Option<&mut DeviceFeatures> {
    chain.iter_mut().find_map(|l| match l {
        ChainLink::PhysicalDeviceFeatures2 { features } => Some(features),
        _ => None,
    })
}
