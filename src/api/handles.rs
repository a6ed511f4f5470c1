use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// The null handle. Trace and replay agree on this one value.
pub const NULL_HANDLE: u64 = 0;

/// Every category of object the API hands out. Each category is its own
/// namespace: the same trace value may name a buffer and an image at once.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ObjectKind {
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandPool,
    CommandBuffer,
    DeviceMemory,
    Buffer,
    BufferView,
    Image,
    ImageView,
    Sampler,
    SamplerYcbcrConversion,
    ShaderModule,
    PipelineCache,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    DescriptorUpdateTemplate,
    Fence,
    Semaphore,
    Event,
    QueryPool,
    Surface,
    Swapchain,
    AccelerationStructure,
    DeferredOperation,
    DebugMessenger,
}

impl ObjectKind {
    pub const COUNT: usize = 32;

    pub const ALL: [ObjectKind; ObjectKind::COUNT] = [
        ObjectKind::Instance,
        ObjectKind::PhysicalDevice,
        ObjectKind::Device,
        ObjectKind::Queue,
        ObjectKind::CommandPool,
        ObjectKind::CommandBuffer,
        ObjectKind::DeviceMemory,
        ObjectKind::Buffer,
        ObjectKind::BufferView,
        ObjectKind::Image,
        ObjectKind::ImageView,
        ObjectKind::Sampler,
        ObjectKind::SamplerYcbcrConversion,
        ObjectKind::ShaderModule,
        ObjectKind::PipelineCache,
        ObjectKind::PipelineLayout,
        ObjectKind::Pipeline,
        ObjectKind::RenderPass,
        ObjectKind::Framebuffer,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::DescriptorPool,
        ObjectKind::DescriptorSet,
        ObjectKind::DescriptorUpdateTemplate,
        ObjectKind::Fence,
        ObjectKind::Semaphore,
        ObjectKind::Event,
        ObjectKind::QueryPool,
        ObjectKind::Surface,
        ObjectKind::Swapchain,
        ObjectKind::AccelerationStructure,
        ObjectKind::DeferredOperation,
        ObjectKind::DebugMessenger,
    ];

    pub fn as_index(self) -> usize {
        self as usize
    }

    /// Categories referenced so often while recording command buffers that
    /// preloading binds them to slots at decode time.
    pub fn is_premap_kind(self) -> bool {
        match self {
            ObjectKind::DescriptorSet
            | ObjectKind::CommandBuffer
            | ObjectKind::Buffer
            | ObjectKind::Sampler
            | ObjectKind::ImageView
            | ObjectKind::PipelineLayout => true,
            _ => false,
        }
    }

    /// Objects that are children of a device and go away with it.
    pub fn is_device_child(self) -> bool {
        match self {
            ObjectKind::Instance
            | ObjectKind::PhysicalDevice
            | ObjectKind::Device
            | ObjectKind::Surface
            | ObjectKind::DebugMessenger => false,
            _ => true,
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Index of a slot in a per-category slot arena. Slots are never moved or
/// reused, so a `SlotRef` handed out while decoding stays valid for as long
/// as the arena lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlotRef {
    pub kind: ObjectKind,
    pub index: u32,
}

/// A handle as it appears inside a decoded call. The trace value is kept
/// for diagnostics; `replay` is filled in by remapping before the call is
/// issued (or after it, for handles the call creates).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct HandleField {
    trace: u64,
    slot: Option<SlotRef>,
    replay: u64,
}

impl HandleField {
    pub fn new(trace: u64) -> HandleField {
        HandleField {
            trace,
            slot: None,
            replay: NULL_HANDLE,
        }
    }

    pub fn null() -> HandleField {
        HandleField::new(NULL_HANDLE)
    }

    pub fn trace(&self) -> u64 {
        self.trace
    }

    pub fn replay(&self) -> u64 {
        self.replay
    }

    pub fn is_null(&self) -> bool {
        self.trace == NULL_HANDLE
    }

    pub fn slot(&self) -> Option<SlotRef> {
        self.slot
    }

    pub fn set_slot(&mut self, slot: SlotRef) {
        self.slot = Some(slot);
    }

    pub fn set_replay(&mut self, replay: u64) {
        self.replay = replay;
    }
}

impl From<u64> for HandleField {
    fn from(trace: u64) -> Self {
        HandleField::new(trace)
    }
}

impl From<HandleField> for u64 {
    fn from(h: HandleField) -> Self {
        h.trace
    }
}

/// How a handle field takes part in replay.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandleRole {
    /// Must resolve to a live replay object.
    In,
    /// May be null; if it is not, it must resolve.
    Opt,
    /// Written by the call. Recorded in the remapper once the call succeeds.
    Out,
    /// Destroying null is a no-op. Otherwise the handle must resolve, and the
    /// mapping is dropped once the call succeeds.
    Destroyed,
}

pub trait HandleVisitor {
    fn visit(&mut self, field: &'static str, kind: ObjectKind, role: HandleRole, handle: &mut HandleField);
}

/// Implemented (through `handle_fields!`) by every call argument structure
/// that embeds handles.
pub trait HandleFields {
    fn visit_handles(&mut self, v: &mut dyn HandleVisitor);
}

impl<T: HandleFields> HandleFields for Vec<T> {
    fn visit_handles(&mut self, v: &mut dyn HandleVisitor) {
        for item in self.iter_mut() {
            item.visit_handles(v);
        }
    }
}

impl<T: HandleFields> HandleFields for Option<T> {
    fn visit_handles(&mut self, v: &mut dyn HandleVisitor) {
        if let Some(item) = self.as_mut() {
            item.visit_handles(v);
        }
    }
}

/// Declares which fields of a structure carry handles. Field specs:
///
/// - `(Role, Kind)`: a single `HandleField`
/// - `[Role, Kind]`: a `Vec<HandleField>`
/// - `(nested)`: a value (or Vec/Option of values) that implements `HandleFields`
///
/// Fields not listed are plain data.
macro_rules! handle_fields {
    ($ty:ident { $($field:ident : $spec:tt),* $(,)? }) => {
        impl $crate::api::handles::HandleFields for $ty {
            #[allow(unused_variables)]
            fn visit_handles(&mut self, v: &mut dyn $crate::api::handles::HandleVisitor) {
                $( visit_field!(self, v, $field, $spec); )*
            }
        }
    };
}

macro_rules! visit_field {
    ($s:ident, $v:ident, $f:ident, (nested)) => {
        $crate::api::handles::HandleFields::visit_handles(&mut $s.$f, $v);
    };
    ($s:ident, $v:ident, $f:ident, ($role:ident, $kind:ident)) => {
        $v.visit(
            stringify!($f),
            $crate::api::handles::ObjectKind::$kind,
            $crate::api::handles::HandleRole::$role,
            &mut $s.$f,
        );
    };
    ($s:ident, $v:ident, $f:ident, [$role:ident, $kind:ident]) => {
        for h in $s.$f.iter_mut() {
            $v.visit(
                stringify!($f),
                $crate::api::handles::ObjectKind::$kind,
                $crate::api::handles::HandleRole::$role,
                h,
            );
        }
    };
}

/// Collects every handle a structure declares. Mostly useful for tests and
/// for the `dump` command.
#[derive(Default)]
pub struct HandleCollector {
    pub found: Vec<(&'static str, ObjectKind, HandleRole, u64)>,
}

impl HandleVisitor for HandleCollector {
    fn visit(&mut self, field: &'static str, kind: ObjectKind, role: HandleRole, handle: &mut HandleField) {
        self.found.push((field, kind, role, handle.trace()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Inner {
        view: HandleField,
    }
    handle_fields!(Inner { view: (Opt, ImageView) });

    struct Outer {
        device: HandleField,
        sets: Vec<HandleField>,
        inner: Vec<Inner>,
        created: HandleField,
        count: u32,
    }
    handle_fields!(Outer {
        device: (In, Device),
        sets: [In, DescriptorSet],
        inner: (nested),
        created: (Out, Buffer),
    });

    #[test]
    pub fn declared_fields_are_visited_in_order() {
        let mut o = Outer {
            device: HandleField::new(1),
            sets: vec![HandleField::new(2), HandleField::new(3)],
            inner: vec![Inner { view: HandleField::new(4) }],
            created: HandleField::new(5),
            count: 9,
        };
        let mut c = HandleCollector::default();
        o.visit_handles(&mut c);
        let kinds: Vec<ObjectKind> = c.found.iter().map(|f| f.1).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::Device,
                ObjectKind::DescriptorSet,
                ObjectKind::DescriptorSet,
                ObjectKind::ImageView,
                ObjectKind::Buffer
            ]
        );
        assert_eq!(c.found[4].2, HandleRole::Out);
        assert_eq!(c.found[3].0, "view");
        assert_eq!(o.count, 9);
    }

    #[test]
    pub fn handle_field_serializes_as_trace_value() {
        let mut h = HandleField::new(0x1234);
        h.set_replay(0x9999);
        let s = serde_json::to_string(&h).unwrap();
        assert_eq!(s, "4660");
        let back: HandleField = serde_json::from_str(&s).unwrap();
        assert_eq!(back.trace(), 0x1234);
        assert_eq!(back.replay(), NULL_HANDLE);
    }

    #[test]
    pub fn kind_table_is_consistent() {
        for (i, k) in ObjectKind::ALL.iter().enumerate() {
            assert_eq!(k.as_index(), i);
        }
        assert!(ObjectKind::Buffer.is_premap_kind());
        assert!(!ObjectKind::Device.is_premap_kind());
    }
}
