use crate::{
    log::{
        LogLevel::{self, LogWarn},
        set_default_level,
    },
    trace::metadata::TraceMetadata,
};
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verbosity {
    Quiet,
    Errors,
    Warnings,
    Full,
    Debug,
}

impl Verbosity {
    pub fn log_level(self) -> LogLevel {
        match self {
            Verbosity::Quiet => LogLevel::LogFatal,
            Verbosity::Errors => LogLevel::LogError,
            Verbosity::Warnings => LogLevel::LogWarn,
            Verbosity::Full => LogLevel::LogInfo,
            Verbosity::Debug => LogLevel::LogDebug,
        }
    }

    pub fn apply(self) {
        set_default_level(self.log_level());
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiet" => Ok(Verbosity::Quiet),
            "errors" => Ok(Verbosity::Errors),
            "warnings" => Ok(Verbosity::Warnings),
            "full" => Ok(Verbosity::Full),
            "debug" => Ok(Verbosity::Debug),
            _ => Err(format!(
                "`{}` is not one of quiet, errors, warnings, full, debug",
                s
            )),
        }
    }
}

/// What to do with `GetFenceStatus` packets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SkipFenceStatus {
    None,
    /// Skip the ones that did not return success at capture time.
    Unsuccessful,
    All,
}

impl SkipFenceStatus {
    pub fn from_level(level: u64) -> Option<SkipFenceStatus> {
        match level {
            0 => Some(SkipFenceStatus::None),
            1 => Some(SkipFenceStatus::Unsuccessful),
            2 => Some(SkipFenceStatus::All),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReplayFlags {
    pub num_loops: u32,
    pub loop_start_frame: u32,
    pub loop_end_frame: u32,
    pub compatibility_mode: bool,
    pub exit_on_any_error: bool,
    /// Load the looped part of the trace into memory before timing starts.
    pub preload: bool,
    /// Share of physical memory preloading may use, 1..=100.
    pub memory_percentage: u32,
    pub premapping: bool,
    pub force_single_window: bool,
    pub force_sync_img_idx: bool,
    pub vsync_off: bool,
    pub force_disable_anisotropy: bool,
    pub disable_as_capture_replay: bool,
    pub disable_buffer_capture_replay: bool,
    pub print_current_gpi: bool,
    pub skip_get_fence_status: SkipFenceStatus,
    pub instrumentation_delay_us: u64,
    pub portability_table: bool,
    pub verbosity: Verbosity,
    pub device_profile: Option<PathBuf>,
}

impl Default for ReplayFlags {
    fn default() -> Self {
        ReplayFlags {
            num_loops: 1,
            loop_start_frame: 0,
            loop_end_frame: u32::MAX,
            compatibility_mode: true,
            exit_on_any_error: false,
            preload: false,
            memory_percentage: 50,
            premapping: false,
            force_single_window: false,
            force_sync_img_idx: false,
            vsync_off: false,
            force_disable_anisotropy: false,
            disable_as_capture_replay: false,
            disable_buffer_capture_replay: false,
            print_current_gpi: false,
            skip_get_fence_status: SkipFenceStatus::None,
            instrumentation_delay_us: 0,
            portability_table: true,
            verbosity: Verbosity::Errors,
            device_profile: None,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct FlagsError(pub String);

impl Display for FlagsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for FlagsError {}

impl ReplayFlags {
    /// Take over settings recorded in the trace. Only called before the
    /// user's explicit options are applied, so those win.
    pub fn apply_metadata(&mut self, m: &TraceMetadata) {
        let u32_opt = |name: &str| m.option_u64(name).map(|v| v.min(u32::MAX as u64) as u32);
        if let Some(v) = u32_opt("numLoops") {
            self.num_loops = v;
        }
        if let Some(v) = u32_opt("loopStartFrame") {
            self.loop_start_frame = v;
        }
        if let Some(v) = u32_opt("loopEndFrame") {
            self.loop_end_frame = v;
        }
        if let Some(v) = u32_opt("memoryPercentage") {
            self.memory_percentage = v;
        }
        if let Some(v) = m.option_u64("instrumentationDelay") {
            self.instrumentation_delay_us = v;
        }
        if let Some(v) = m.option_u64("skipGetFenceStatus").and_then(SkipFenceStatus::from_level) {
            self.skip_get_fence_status = v;
        }
        let bools: [(&str, &mut bool); 10] = [
            ("compatibilityMode", &mut self.compatibility_mode),
            ("exitOnAnyError", &mut self.exit_on_any_error),
            ("preload", &mut self.preload),
            ("premapping", &mut self.premapping),
            ("forceSingleWindow", &mut self.force_single_window),
            ("forceSyncImgIdx", &mut self.force_sync_img_idx),
            ("vsyncOff", &mut self.vsync_off),
            ("forceDisableAnisotropy", &mut self.force_disable_anisotropy),
            ("disableAsCaptureReplay", &mut self.disable_as_capture_replay),
            ("disableBufferCaptureReplay", &mut self.disable_buffer_capture_replay),
        ];
        for (name, slot) in bools {
            if let Some(v) = m.option_bool(name) {
                *slot = v;
            }
        }
    }

    pub fn validate(&mut self) -> Result<(), FlagsError> {
        if self.memory_percentage == 0 || self.memory_percentage > 100 {
            return Err(FlagsError(format!(
                "memory percentage must be between 1 and 100, got {}",
                self.memory_percentage
            )));
        }
        if self.num_loops == 0 {
            return Err(FlagsError("number of loops must be at least 1".into()));
        }
        if self.loop_start_frame > self.loop_end_frame {
            return Err(FlagsError(format!(
                "loop start frame {} is after loop end frame {}",
                self.loop_start_frame, self.loop_end_frame
            )));
        }
        if self.preload && self.num_loops != 1 {
            log!(LogWarn, "Preloading replays a single loop; ignoring {} loops", self.num_loops);
            self.num_loops = 1;
        }
        if self.premapping && !self.preload {
            log!(LogWarn, "Premapping only applies to preloaded packets; disabled");
            self.premapping = false;
        }
        Ok(())
    }
}
