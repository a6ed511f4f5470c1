use super::exit_result::ExitResult;
use crate::{
    commands::{
        pm_options::{PmOptions, PmSubCommand},
        PmCommand,
    },
    trace::{
        file_header::{arch_name, os_name, GpuInfo},
        metadata::TraceMetadata,
        trace_reader::TraceReader,
    },
    util::endianness_name,
};
use serde::Serialize;
use std::{io, path::PathBuf};

pub struct TraceInfoCommand {
    trace_file: PathBuf,
}

impl TraceInfoCommand {
    pub fn new(options: &PmOptions) -> TraceInfoCommand {
        match options.cmd.clone() {
            PmSubCommand::TraceInfo { trace_file } => TraceInfoCommand { trace_file },
            _ => panic!("Unexpected PmSubCommand variant. Not a `TraceInfo` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceInfo {
    version: u16,
    pointer_size: u8,
    endianness: &'static str,
    arch: &'static str,
    os: &'static str,
    compression: u8,
    gpu_info: Vec<GpuInfo>,
    first_packet_offset: u64,
    portability_table_valid: bool,
    portability_table_entries: usize,
    metadata: Option<TraceMetadata>,
}

impl TraceInfo {
    fn of(trace: &TraceReader) -> TraceInfo {
        let h = trace.header();
        TraceInfo {
            version: h.version,
            pointer_size: h.pointer_size,
            endianness: endianness_name(h.endianness),
            arch: arch_name(h.arch),
            os: os_name(h.os),
            compression: h.compression,
            gpu_info: h.gpu_info.clone(),
            first_packet_offset: h.first_packet_offset,
            portability_table_valid: h.portability_table_valid,
            portability_table_entries: trace.portability_table().len(),
            metadata: trace.metadata().cloned(),
        }
    }
}

impl PmCommand for TraceInfoCommand {
    fn run(&mut self) -> ExitResult<()> {
        let trace = match TraceReader::open(&self.trace_file) {
            Ok(t) => t,
            Err(e) => return ExitResult::err_from(e, 1),
        };
        match serde_json::to_string(&TraceInfo::of(&trace)) {
            Ok(serialized) => {
                println!("{}", serialized);
                ExitResult::Ok(())
            }
            Err(e) => ExitResult::err_from(io::Error::from(e), 1),
        }
    }
}
