use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    /// Replay settings recorded at capture time. They apply wherever the
    /// user did not set the option explicitly.
    #[serde(rename = "ReplayOptions", default)]
    pub replay_options: Map<String, Value>,
    #[serde(rename = "deviceFeatures", default)]
    pub device_features: DeviceFeatureTable,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFeatureTable {
    #[serde(default)]
    pub device: Vec<DeviceFeatureRecord>,
}

/// Capture-replay capabilities the capture device had enabled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFeatureRecord {
    pub device_handle: String,
    #[serde(default)]
    pub acceleration_structure_capture_replay: u32,
    #[serde(default)]
    pub buffer_device_address_capture_replay: u32,
}

impl DeviceFeatureRecord {
    pub fn new(device: u64, as_capture_replay: bool, bda_capture_replay: bool) -> Self {
        DeviceFeatureRecord {
            device_handle: format!("{:#x}", device),
            acceleration_structure_capture_replay: as_capture_replay as u32,
            buffer_device_address_capture_replay: bda_capture_replay as u32,
        }
    }

    pub fn device(&self) -> Option<u64> {
        crate::util::parse_u64_auto(&self.device_handle)
    }
}

impl TraceMetadata {
    pub fn parse(json: &str) -> serde_json::Result<TraceMetadata> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn features_for(&self, device: u64) -> Option<&DeviceFeatureRecord> {
        self.device_features
            .device
            .iter()
            .find(|r| r.device() == Some(device))
    }

    pub fn option_u64(&self, name: &str) -> Option<u64> {
        self.replay_options.get(name).and_then(|v| v.as_u64())
    }

    pub fn option_bool(&self, name: &str) -> Option<bool> {
        match self.replay_options.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_u64().map(|v| v != 0),
            _ => None,
        }
    }
}
