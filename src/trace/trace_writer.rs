use crate::{
    api::calls::ApiCall,
    log::LogLevel::LogDebug,
    trace::{
        file_header::{FileHeader, GpuInfo},
        metadata::TraceMetadata,
        packet::{PacketBody, PacketHeader, PacketTag, PACKET_HEADER_SIZE, TRACER_ID_PMTRACE},
        trace_stream::TraceStream,
    },
    util::{current_thread_id, now_ns},
};
use std::{
    fs::File,
    io::{self, BufWriter, Seek, SeekFrom, Write},
    ops::{Deref, DerefMut},
    path::Path,
};

/// Anything the capture layer can hand finished packets to.
pub trait PacketSink {
    fn write_call(&mut self, call: &ApiCall, blobs: &[u8], tag: PacketTag) -> io::Result<()>;
}

pub struct TraceWriter {
    trace_stream: TraceStream,
    file: BufWriter<File>,
    offset: u64,
    /// File offsets of the packets replay may need to look ahead to.
    portability_table: Vec<u64>,
}

impl Deref for TraceWriter {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl TraceWriter {
    pub fn create(path: &Path, gpu_info: Vec<GpuInfo>) -> io::Result<TraceWriter> {
        let header = FileHeader::native(gpu_info);
        let mut file = BufWriter::new(File::create(path)?);
        let bytes = header.encode();
        file.write_all(&bytes)?;
        log!(LogDebug, "Writing trace to {:?}", path);
        Ok(TraceWriter {
            trace_stream: TraceStream::new(path, header),
            file,
            offset: bytes.len() as u64,
            portability_table: Vec::new(),
        })
    }

    /// Returns the file offset the packet was written at.
    pub fn write_packet(
        &mut self,
        body: &PacketBody,
        blobs: &[u8],
        tag: PacketTag,
        entrypoint_begin: u64,
        entrypoint_end: u64,
    ) -> io::Result<u64> {
        let payload = body.encode_payload()?;
        let header = PacketHeader {
            size: (PACKET_HEADER_SIZE + payload.len() + blobs.len()) as u64,
            global_index: self.global_index,
            packet_id: body.packet_id(),
            tracer_id: TRACER_ID_PMTRACE,
            tag,
            thread_id: current_thread_id(),
            entrypoint_begin,
            entrypoint_end,
            payload_len: payload.len() as u32,
        };
        self.file.write_all(&header.encode())?;
        self.file.write_all(&payload)?;
        self.file.write_all(blobs)?;

        let at = self.offset;
        if let PacketBody::Call(c) = body {
            if c.id().is_memory_relevant() {
                self.portability_table.push(at);
            }
        }
        self.offset += header.size;
        self.global_index += 1;
        Ok(at)
    }

    pub fn portability_table(&self) -> &[u64] {
        &self.portability_table
    }

    /// Appends the metadata packet and the portability table, then rewrites
    /// the header so readers can find both.
    pub fn close(mut self, metadata: &TraceMetadata) -> io::Result<()> {
        let json = metadata.to_json()?;
        let now = now_ns();
        let metadata_offset =
            self.write_packet(&PacketBody::MetaData(json), &[], PacketTag::empty(), now, now)?;

        for off in &self.portability_table {
            self.file.write_all(&off.to_le_bytes())?;
        }
        self.file
            .write_all(&(self.portability_table.len() as u64).to_le_bytes())?;

        self.trace_stream.header.metadata_offset = metadata_offset;
        self.trace_stream.header.portability_table_valid = true;
        self.file.seek(SeekFrom::Start(0))?;
        let header = self.trace_stream.header.encode();
        self.file.write_all(&header)?;
        self.file.flush()?;
        log!(
            LogDebug,
            "Closed trace {:?}: {} packets, {} portability entries",
            self.path,
            self.global_index,
            self.portability_table.len()
        );
        Ok(())
    }
}

impl PacketSink for TraceWriter {
    fn write_call(&mut self, call: &ApiCall, blobs: &[u8], tag: PacketTag) -> io::Result<()> {
        let now = now_ns();
        self.write_packet(&PacketBody::Call(call.clone()), blobs, tag, now, now)
            .map(|_| ())
    }
}
