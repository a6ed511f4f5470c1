use super::exit_result::ExitResult;
use crate::{
    commands::{
        pm_options::{PmOptions, PmSubCommand},
        PmCommand,
    },
    trace::{
        packet::{Packet, PacketBody},
        trace_reader::TraceReader,
        TraceError,
    },
};
use std::{
    io::{self, stdout, Write},
    path::PathBuf,
};

pub struct DumpCommand {
    packet_range: Option<(u64, Option<u64>)>,
    blobs: bool,
    trace_file: PathBuf,
}

impl DumpCommand {
    pub fn new(options: &PmOptions) -> DumpCommand {
        match options.cmd.clone() {
            PmSubCommand::Dump {
                packet_range,
                blobs,
                trace_file,
            } => DumpCommand {
                packet_range,
                blobs,
                trace_file,
            },
            _ => panic!("Unexpected PmSubCommand variant. Not a Dump variant!"),
        }
    }

    /// Dump every packet whose global index falls in `self.packet_range`.
    fn dump(&self, trace: &mut TraceReader, f: &mut dyn Write) -> Result<(), TraceError> {
        let (start, end) = match self.packet_range {
            None => (0, u64::MAX),
            Some((s, None)) => (s, s),
            Some((s, Some(e))) => (s, e),
        };

        while let Some(p) = trace.read_packet()? {
            let gpi = p.header.global_index;
            if gpi < start {
                continue;
            }
            if gpi > end {
                break;
            }
            self.dump_packet(&p, f)?;
        }
        Ok(())
    }

    fn dump_packet(&self, p: &Packet, f: &mut dyn Write) -> io::Result<()> {
        let h = &p.header;
        let what = match &p.body {
            PacketBody::Call(c) => c.name().to_owned(),
            PacketBody::Message(m) => format!("message [{}] {}", m.level, m.text),
            PacketBody::Marker(m) => format!("marker {}", m.name),
            PacketBody::MetaData(_) => h.kind_name().to_owned(),
        };
        writeln!(
            f,
            "{} {} size={} tag={:#x} thread={} blobs={}",
            h.global_index,
            what,
            h.size,
            h.tag.bits(),
            h.thread_id,
            p.blobs.len()
        )?;
        if self.blobs && !p.blobs.is_empty() {
            for (i, chunk) in p.blobs.chunks(32).enumerate() {
                write!(f, "    {:08x}:", i * 32)?;
                for b in chunk {
                    write!(f, " {:02x}", b)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl PmCommand for DumpCommand {
    fn run(&mut self) -> ExitResult<()> {
        let mut trace = match TraceReader::open(&self.trace_file) {
            Ok(t) => t,
            Err(e) => return ExitResult::err_from(e, 1),
        };
        match self.dump(&mut trace, &mut stdout()) {
            Ok(()) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        api::calls::{CreateInstance, DestroyBuffer},
        trace::{
            file_header::GpuInfo,
            metadata::TraceMetadata,
            packet::PacketTag,
            trace_writer::{PacketSink, TraceWriter},
        },
    };

    #[test]
    pub fn dumps_the_requested_packets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.pmtrace");
        let mut w = TraceWriter::create(&path, vec![GpuInfo::default()]).unwrap();
        w.write_call(&CreateInstance::default().into(), &[], PacketTag::empty())
            .unwrap();
        w.write_call(
            &DestroyBuffer::default().into(),
            &[0xab, 0xcd],
            PacketTag::INJECTED,
        )
        .unwrap();
        w.close(&TraceMetadata::default()).unwrap();

        let cmd = DumpCommand {
            packet_range: Some((1, None)),
            blobs: true,
            trace_file: path.clone(),
        };
        let mut out = Vec::new();
        let mut trace = TraceReader::open(&path).unwrap();
        cmd.dump(&mut trace, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1 vkDestroyBuffer "));
        assert!(lines[0].contains("tag=0x1"));
        assert!(lines[0].ends_with("blobs=2"));
        assert_eq!(lines[1], "    00000000: ab cd");
    }
}
