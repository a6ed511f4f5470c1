use crate::{
    api::{calls::ApiCall, result::ApiResult},
    trace::file_header::GpuInfo,
};

/// The replay device. Calls reach it with every input handle already
/// translated: implementations read `HandleField::replay()` and write the
/// handles they create with `HandleField::set_replay()`. Plain output data
/// (properties, requirements, image indices, mapped pointers) is written
/// over the values recorded in the trace.
pub trait GpuDriver {
    fn execute(&mut self, call: &mut ApiCall, blobs: &[u8]) -> ApiResult;

    fn instance_layers(&self) -> Vec<String>;

    fn instance_extensions(&self) -> Vec<String>;

    /// Extensions offered by the physical device with replay handle
    /// `physical_device`.
    fn device_extensions(&self, physical_device: u64) -> Vec<String>;

    fn gpu_info(&self) -> GpuInfo;
}
