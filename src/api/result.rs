use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Result code of a graphics API entrypoint, as returned by the driver and as
/// recorded in the trace.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiResult(i32);

impl ApiResult {
    pub const SUCCESS: ApiResult = ApiResult(0);
    pub const NOT_READY: ApiResult = ApiResult(1);
    pub const TIMEOUT: ApiResult = ApiResult(2);
    pub const EVENT_SET: ApiResult = ApiResult(3);
    pub const EVENT_RESET: ApiResult = ApiResult(4);
    pub const INCOMPLETE: ApiResult = ApiResult(5);
    pub const SUBOPTIMAL: ApiResult = ApiResult(1_000_001_003);
    pub const ERROR_OUT_OF_HOST_MEMORY: ApiResult = ApiResult(-1);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: ApiResult = ApiResult(-2);
    pub const ERROR_INITIALIZATION_FAILED: ApiResult = ApiResult(-3);
    pub const ERROR_DEVICE_LOST: ApiResult = ApiResult(-4);
    pub const ERROR_MEMORY_MAP_FAILED: ApiResult = ApiResult(-5);
    pub const ERROR_LAYER_NOT_PRESENT: ApiResult = ApiResult(-6);
    pub const ERROR_EXTENSION_NOT_PRESENT: ApiResult = ApiResult(-7);
    pub const ERROR_FEATURE_NOT_PRESENT: ApiResult = ApiResult(-8);
    pub const ERROR_INCOMPATIBLE_DRIVER: ApiResult = ApiResult(-9);
    pub const ERROR_TOO_MANY_OBJECTS: ApiResult = ApiResult(-10);
    pub const ERROR_FORMAT_NOT_SUPPORTED: ApiResult = ApiResult(-11);
    pub const ERROR_UNKNOWN: ApiResult = ApiResult(-13);
    pub const ERROR_SURFACE_LOST: ApiResult = ApiResult(-1_000_000_000);
    pub const ERROR_OUT_OF_DATE: ApiResult = ApiResult(-1_000_001_004);

    pub fn from_raw(raw: i32) -> ApiResult {
        ApiResult(raw)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            ApiResult::SUCCESS => "SUCCESS",
            ApiResult::NOT_READY => "NOT_READY",
            ApiResult::TIMEOUT => "TIMEOUT",
            ApiResult::EVENT_SET => "EVENT_SET",
            ApiResult::EVENT_RESET => "EVENT_RESET",
            ApiResult::INCOMPLETE => "INCOMPLETE",
            ApiResult::SUBOPTIMAL => "SUBOPTIMAL",
            ApiResult::ERROR_OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            ApiResult::ERROR_OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            ApiResult::ERROR_INITIALIZATION_FAILED => "ERROR_INITIALIZATION_FAILED",
            ApiResult::ERROR_DEVICE_LOST => "ERROR_DEVICE_LOST",
            ApiResult::ERROR_MEMORY_MAP_FAILED => "ERROR_MEMORY_MAP_FAILED",
            ApiResult::ERROR_LAYER_NOT_PRESENT => "ERROR_LAYER_NOT_PRESENT",
            ApiResult::ERROR_EXTENSION_NOT_PRESENT => "ERROR_EXTENSION_NOT_PRESENT",
            ApiResult::ERROR_FEATURE_NOT_PRESENT => "ERROR_FEATURE_NOT_PRESENT",
            ApiResult::ERROR_INCOMPATIBLE_DRIVER => "ERROR_INCOMPATIBLE_DRIVER",
            ApiResult::ERROR_TOO_MANY_OBJECTS => "ERROR_TOO_MANY_OBJECTS",
            ApiResult::ERROR_FORMAT_NOT_SUPPORTED => "ERROR_FORMAT_NOT_SUPPORTED",
            ApiResult::ERROR_UNKNOWN => "ERROR_UNKNOWN",
            ApiResult::ERROR_SURFACE_LOST => "ERROR_SURFACE_LOST",
            ApiResult::ERROR_OUT_OF_DATE => "ERROR_OUT_OF_DATE",
            _ => "UNKNOWN_RESULT",
        }
    }
}

impl Default for ApiResult {
    fn default() -> Self {
        ApiResult::SUCCESS
    }
}

impl Display for ApiResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.0)
    }
}

/// Outcome of replaying one packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplayResult {
    Success,
    Error,
    InvalidId,
    InvalidParams,
    Unsupported,
    CallError,
    BadReturn,
    RemapFailed,
}

impl ReplayResult {
    pub fn is_success(self) -> bool {
        self == ReplayResult::Success
    }
}

impl Display for ReplayResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplayResult::Success => "success",
            ReplayResult::Error => "error",
            ReplayResult::InvalidId => "invalid id",
            ReplayResult::InvalidParams => "invalid parameters",
            ReplayResult::Unsupported => "unsupported",
            ReplayResult::CallError => "call error",
            ReplayResult::BadReturn => "bad return",
            ReplayResult::RemapFailed => "remap failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn result_classes() {
        assert!(ApiResult::SUCCESS.is_success());
        assert!(ApiResult::SUBOPTIMAL.is_success());
        assert!(ApiResult::ERROR_DEVICE_LOST.is_error());
        assert_eq!(ApiResult::from_raw(-4), ApiResult::ERROR_DEVICE_LOST);
        assert_eq!(ApiResult::from_raw(77).as_str(), "UNKNOWN_RESULT");
        assert_eq!(format!("{}", ApiResult::TIMEOUT), "TIMEOUT (2)");
    }
}
