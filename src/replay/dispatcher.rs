//! Replays one packet at a time: translate handles, run the call's hook or
//! hand it straight to the driver, record what it created, compare the
//! result with the traced one.

use crate::{
    api::{
        calls::{ApiCall, BlobRef, CallId},
        handles::{HandleField, HandleFields},
        result::{ApiResult, ReplayResult},
    },
    flags::ReplayFlags,
    log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn},
    replay::{
        driver::GpuDriver,
        hooks,
        object_remapper::{ObjectRemapper, PremapVisitor, RegisterVisitor, RemapVisitor},
        state::ReplayState,
    },
    trace::{
        metadata::TraceMetadata,
        packet::{Packet, PacketBody, PacketTag},
    },
};

pub(super) type HookResult = Result<ApiResult, ReplayResult>;
pub(super) type Hook<D> = fn(&mut Replayer<D>, &mut ApiCall, &[u8]) -> HookResult;

/// How one packet went. Whether it ends the replay is up to the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReplayOutcome {
    pub result: ReplayResult,
    /// The call failed and nothing after it can work.
    pub always_fatal: bool,
    pub device_lost: bool,
}

impl ReplayOutcome {
    fn of(result: ReplayResult) -> ReplayOutcome {
        ReplayOutcome {
            result,
            always_fatal: false,
            device_lost: false,
        }
    }

    pub fn is_fatal(&self, exit_on_any_error: bool) -> bool {
        self.device_lost
            || self.always_fatal
            || (exit_on_any_error && !self.result.is_success())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    pub calls: u64,
    /// Calls not replayed because they failed at capture time.
    pub skipped: u64,
    pub failed: u64,
}

struct CallDescriptor<D: GpuDriver> {
    always_fatal: bool,
    hook: Option<Hook<D>>,
}

fn descriptor<D: GpuDriver>(id: CallId) -> CallDescriptor<D> {
    let plain = |hook: Hook<D>| CallDescriptor {
        always_fatal: false,
        hook: Some(hook),
    };
    let fatal = |hook: Hook<D>| CallDescriptor {
        always_fatal: true,
        hook: Some(hook),
    };
    match id {
        CallId::CreateInstance => fatal(hooks::create_instance::<D>),
        CallId::CreateDevice => fatal(hooks::create_device::<D>),
        CallId::CreateSwapchain => fatal(hooks::create_swapchain::<D>),
        CallId::EnumeratePhysicalDevices => plain(hooks::enumerate_physical_devices::<D>),
        CallId::GetPhysicalDeviceMemoryProperties => plain(hooks::get_memory_properties::<D>),
        CallId::GetPhysicalDeviceQueueFamilyProperties => plain(hooks::get_queue_families::<D>),
        CallId::GetPhysicalDeviceFeatures => plain(hooks::get_features::<D>),
        CallId::DestroyDevice => plain(hooks::destroy_device::<D>),
        CallId::GetDeviceQueue => plain(hooks::get_device_queue::<D>),
        CallId::CreateCommandPool => plain(hooks::create_command_pool::<D>),
        CallId::AllocateMemory => plain(hooks::allocate_memory::<D>),
        CallId::FreeMemory => plain(hooks::free_memory::<D>),
        CallId::MapMemory => plain(hooks::map_memory::<D>),
        CallId::UnmapMemory => plain(hooks::unmap_memory::<D>),
        CallId::FlushMappedMemoryRanges => plain(hooks::flush_mapped_memory_ranges::<D>),
        CallId::CreateImage => plain(hooks::create_image::<D>),
        CallId::CreateSampler => plain(hooks::create_sampler::<D>),
        CallId::GetBufferDeviceAddress => plain(hooks::get_buffer_device_address::<D>),
        CallId::CreateAccelerationStructure => plain(hooks::create_acceleration_structure::<D>),
        CallId::DestroySwapchain => plain(hooks::destroy_swapchain::<D>),
        CallId::GetSwapchainImages => plain(hooks::get_swapchain_images::<D>),
        CallId::AcquireNextImage => plain(hooks::acquire_next_image::<D>),
        CallId::QueueSubmit => plain(hooks::queue_submit::<D>),
        CallId::QueuePresent => plain(hooks::queue_present::<D>),
        CallId::GetFenceStatus => plain(hooks::get_fence_status::<D>),
        _ => CallDescriptor {
            always_fatal: false,
            hook: None,
        },
    }
}

pub struct Replayer<D: GpuDriver> {
    pub(super) driver: D,
    pub(super) remapper: ObjectRemapper,
    pub(super) state: ReplayState,
    pub(super) flags: ReplayFlags,
    pub(super) metadata: TraceMetadata,
    pub(super) compatibility: bool,
    /// Tag of the packet being replayed.
    pub(super) tag: PacketTag,
    stats: ReplayStats,
}

impl<D: GpuDriver> Replayer<D> {
    pub fn new(driver: D, flags: ReplayFlags, metadata: Option<TraceMetadata>) -> Replayer<D> {
        Replayer {
            driver,
            remapper: ObjectRemapper::new(),
            state: ReplayState::default(),
            flags,
            metadata: metadata.unwrap_or_default(),
            compatibility: false,
            tag: PacketTag::empty(),
            stats: ReplayStats::default(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn remapper(&self) -> &ObjectRemapper {
        &self.remapper
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn flags(&self) -> &ReplayFlags {
        &self.flags
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    pub fn frame(&self) -> u64 {
        self.state.frame
    }

    pub fn compatibility(&self) -> bool {
        self.compatibility
    }

    pub fn set_compatibility(&mut self, on: bool) {
        self.compatibility = on;
    }

    pub fn set_lookahead(&mut self, lookahead: Vec<(u64, ApiCall)>) {
        self.state.lookahead = lookahead;
    }

    /// Bind the hot handles of a preloaded call to remapper slots.
    pub fn premap(&mut self, call: &mut ApiCall) -> usize {
        let mut v = PremapVisitor::new(&mut self.remapper);
        call.visit_handles(&mut v);
        v.bound
    }

    pub fn replay_packet(&mut self, packet: &mut Packet) -> ReplayOutcome {
        self.state.current_offset = packet.file_offset;
        self.tag = packet.header.tag;
        match &mut packet.body {
            PacketBody::Call(call) => self.replay_call(call, &packet.blobs),
            PacketBody::Message(m) => {
                match m.level.as_str() {
                    "error" => log!(LogError, "Trace message: {}", m.text),
                    "warning" => log!(LogWarn, "Trace message: {}", m.text),
                    _ => log!(LogInfo, "Trace message: {}", m.text),
                }
                ReplayOutcome::of(ReplayResult::Success)
            }
            PacketBody::Marker(_) | PacketBody::MetaData(_) => ReplayOutcome::of(ReplayResult::Success),
        }
    }

    pub fn replay_call(&mut self, call: &mut ApiCall, blobs: &[u8]) -> ReplayOutcome {
        self.stats.calls += 1;
        let traced = call.traced_result();
        if let Some(t) = traced {
            if t.is_error() {
                log!(LogDebug, "Skipping {} which returned {} at capture", call.name(), t);
                self.stats.skipped += 1;
                return ReplayOutcome::of(ReplayResult::Success);
            }
        }

        let mut remap = RemapVisitor::new(&self.remapper);
        call.visit_handles(&mut remap);
        if let Some(e) = remap.into_failure() {
            log!(LogError, "Skipping {}: {}", call.name(), e);
            self.stats.failed += 1;
            return ReplayOutcome::of(ReplayResult::RemapFailed);
        }

        let desc = descriptor::<D>(call.id());
        let replayed = match desc.hook {
            Some(hook) => match hook(self, call, blobs) {
                Ok(r) => r,
                Err(rr) => {
                    self.stats.failed += 1;
                    return ReplayOutcome {
                        result: rr,
                        always_fatal: desc.always_fatal,
                        device_lost: false,
                    };
                }
            },
            None => self.driver.execute(call, blobs),
        };

        let mut result = self.handle_replay_errors(call.name(), replayed, traced);
        if replayed.is_success() {
            let mut reg = RegisterVisitor::new(&mut self.remapper);
            call.visit_handles(&mut reg);
            for e in reg.errors.iter() {
                log!(LogError, "{}: {}", call.name(), e);
            }
            if !reg.errors.is_empty() {
                result = ReplayResult::Error;
            }
        }
        if !result.is_success() {
            self.stats.failed += 1;
        }
        ReplayOutcome {
            result,
            always_fatal: desc.always_fatal && !result.is_success(),
            device_lost: replayed == ApiResult::ERROR_DEVICE_LOST,
        }
    }

    /// Compares the replay result with the traced one and reports any
    /// divergence.
    pub fn handle_replay_errors(
        &self,
        name: &str,
        replayed: ApiResult,
        traced: Option<ApiResult>,
    ) -> ReplayResult {
        if replayed == ApiResult::ERROR_DEVICE_LOST {
            log!(LogError, "{} lost the device", name);
            return ReplayResult::CallError;
        }
        match traced {
            Some(t) if t != replayed => {
                log!(
                    LogError,
                    "Return value {} from {} does not match the traced {}",
                    replayed,
                    name,
                    t
                );
                ReplayResult::BadReturn
            }
            None if replayed.is_error() => {
                log!(LogError, "{} failed with {}", name, replayed);
                ReplayResult::CallError
            }
            _ => ReplayResult::Success,
        }
    }

    /// Issues a call replay needs for itself. It never reaches the remapper.
    pub(super) fn run_aux(&mut self, call: impl Into<ApiCall>) -> (ApiResult, ApiCall) {
        let mut call = call.into();
        let r = self.driver.execute(&mut call, &[]);
        if r.is_error() {
            log!(LogWarn, "Auxiliary {} failed with {}", call.name(), r);
        }
        (r, call)
    }

    /// Waits for every live device. Used once replay is over.
    pub fn wait_idle(&mut self) {
        let devices: Vec<u64> = self
            .remapper
            .traces(crate::api::handles::ObjectKind::Device)
            .into_iter()
            .map(|d| self.remapper.remap(crate::api::handles::ObjectKind::Device, d))
            .collect();
        for d in devices {
            self.run_aux(crate::api::calls::DeviceWaitIdle {
                device: replayed(d, d),
                ..Default::default()
            });
        }
    }
}

/// A handle field that already carries its replay value.
pub(super) fn replayed(trace: u64, replay: u64) -> HandleField {
    let mut h = HandleField::new(trace);
    h.set_replay(replay);
    h
}

pub(super) fn blob(blobs: &[u8], r: BlobRef) -> Option<&[u8]> {
    let start = r.offset as usize;
    let end = start.checked_add(r.size as usize)?;
    blobs.get(start..end)
}
