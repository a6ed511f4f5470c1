use crate::{
    log::LogLevel::{LogDebug, LogWarn},
    trace::{
        file_header::FileHeader,
        metadata::TraceMetadata,
        packet::{Packet, PacketBody, PacketHeader, PACKET_HEADER_SIZE},
        trace_stream::TraceStream,
        TraceError,
    },
};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    ops::{Deref, DerefMut},
    path::Path,
};

pub struct TraceReader {
    trace_stream: TraceStream,
    file: BufReader<File>,
    pos: u64,
    /// Packets end where the metadata packet or the portability table
    /// begins.
    packets_end: u64,
    metadata: Option<TraceMetadata>,
    portability_table: Vec<u64>,
}

impl Deref for TraceReader {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceReader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl TraceReader {
    pub fn open(path: &Path) -> Result<TraceReader, TraceError> {
        let mut file = BufReader::new(File::open(path)?);
        let header = FileHeader::decode(&mut file)?;
        let file_len = file.get_ref().metadata()?.len();
        if header.first_packet_offset > file_len {
            return Err(TraceError::Corrupt(format!(
                "first packet offset {} is past the end of the file",
                header.first_packet_offset
            )));
        }
        let mut packets_end = file_len;

        let mut portability_table = Vec::new();
        if header.portability_table_valid {
            portability_table = read_portability_table(&mut file, file_len, header.first_packet_offset)?;
            packets_end = file_len - 8 * (portability_table.len() as u64 + 1);
        }

        let mut reader = TraceReader {
            trace_stream: TraceStream::new(path, header),
            file,
            pos: 0,
            packets_end,
            metadata: None,
            portability_table,
        };

        let metadata_offset = reader.header.metadata_offset;
        if metadata_offset != 0 {
            let table_start = reader.packets_end;
            reader.packets_end = metadata_offset.min(table_start);
            reader.seek_to(metadata_offset)?;
            let p = reader.read_packet_within(table_start)?;
            match p.body {
                PacketBody::MetaData(json) => match TraceMetadata::parse(&json) {
                    Ok(m) => reader.metadata = Some(m),
                    Err(e) => log!(LogWarn, "Ignoring unreadable trace metadata: {}", e),
                },
                _ => {
                    return Err(TraceError::Corrupt(format!(
                        "metadata offset {} does not point at a metadata packet",
                        metadata_offset
                    )))
                }
            }
        }
        reader.rewind()?;
        log!(
            LogDebug,
            "Opened trace {:?}: {}, {} bytes of packets",
            path,
            reader.header.summary(),
            reader.packets_end - reader.header.first_packet_offset
        );
        Ok(reader)
    }

    pub fn metadata(&self) -> Option<&TraceMetadata> {
        self.metadata.as_ref()
    }

    pub fn portability_table(&self) -> &[u64] {
        &self.portability_table
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.packets_end
    }

    /// Bytes of packets between the current position and the end.
    pub fn remaining_bytes(&self) -> u64 {
        self.packets_end.saturating_sub(self.pos)
    }

    pub fn rewind(&mut self) -> Result<(), TraceError> {
        let first = self.header.first_packet_offset;
        self.seek_to(first)?;
        self.global_index = 0;
        Ok(())
    }

    /// Position at a packet boundary previously obtained from `tell` or
    /// from the portability table.
    pub fn seek(&mut self, offset: u64) -> Result<(), TraceError> {
        if offset < self.header.first_packet_offset || offset > self.packets_end {
            return Err(TraceError::Corrupt(format!(
                "seek to {} outside the packet area",
                offset
            )));
        }
        self.seek_to(offset)
    }

    fn seek_to(&mut self, offset: u64) -> Result<(), TraceError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Next packet, or `None` once the packet area is exhausted.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        if self.at_end() {
            return Ok(None);
        }
        let p = self.read_packet_within(self.packets_end)?;
        self.global_index = p.header.global_index + 1;
        Ok(Some(p))
    }

    /// Reads the packet at `offset` without moving the read position.
    pub fn read_packet_at(&mut self, offset: u64) -> Result<Packet, TraceError> {
        let saved = self.pos;
        self.seek(offset)?;
        let result = self.read_packet_within(self.packets_end);
        self.seek_to(saved)?;
        result
    }

    /// Reads the packet at the current position, which must end at or
    /// before `limit`. Sizes are checked before anything is allocated.
    fn read_packet_within(&mut self, limit: u64) -> Result<Packet, TraceError> {
        let file_offset = self.pos;
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        self.file.read_exact(&mut raw)?;
        let header = PacketHeader::decode(&raw)?;
        let room = limit.saturating_sub(file_offset);
        if header.size > room {
            return Err(TraceError::Corrupt(format!(
                "packet {} at {} claims {} bytes but only {} remain",
                header.global_index, file_offset, header.size, room
            )));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.file.read_exact(&mut payload)?;
        let mut blobs = vec![0u8; header.blob_len() as usize];
        self.file.read_exact(&mut blobs)?;
        self.pos += header.size;
        let body = PacketBody::decode_payload(header.packet_id, &payload)?;
        Ok(Packet {
            header,
            body,
            blobs,
            file_offset,
        })
    }
}

fn read_portability_table(
    file: &mut BufReader<File>,
    file_len: u64,
    first_packet_offset: u64,
) -> Result<Vec<u64>, TraceError> {
    let mut word = [0u8; 8];
    if file_len < first_packet_offset + 8 {
        return Err(TraceError::Corrupt("portability table missing".into()));
    }
    file.seek(SeekFrom::End(-8))?;
    file.read_exact(&mut word)?;
    let count = u64::from_le_bytes(word);
    let table_bytes = count
        .checked_add(1)
        .and_then(|n| n.checked_mul(8))
        .filter(|n| *n <= file_len - first_packet_offset)
        .ok_or_else(|| TraceError::Corrupt(format!("portability table of {} entries", count)))?;
    file.seek(SeekFrom::Start(file_len - table_bytes))?;
    let mut table = Vec::with_capacity(count as usize);
    for _ in 0..count {
        file.read_exact(&mut word)?;
        table.push(u64::from_le_bytes(word));
    }
    Ok(table)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        api::{
            calls::{AllocateMemory, ApiCall, CreateShaderModule, QueueWaitIdle},
            handles::HandleField,
        },
        trace::{
            file_header::GpuInfo,
            metadata::DeviceFeatureRecord,
            packet::{BlobArea, Marker, PacketTag},
            trace_writer::{PacketSink, TraceWriter},
        },
    };
    use std::io::Write;

    fn gpu() -> Vec<GpuInfo> {
        vec![GpuInfo {
            gpu_id: 1,
            driver_version: 2,
        }]
    }

    #[test]
    pub fn write_then_walk_and_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pmtrace");

        let mut w = TraceWriter::create(&path, gpu()).unwrap();
        let alloc: ApiCall = AllocateMemory {
            device: HandleField::new(1),
            allocation_size: 4096,
            memory: HandleField::new(0x77),
            ..Default::default()
        }
        .into();
        w.write_call(&alloc, &[], PacketTag::empty()).unwrap();
        w.write_packet(
            &PacketBody::Marker(Marker { name: "frame".into() }),
            &[],
            PacketTag::INJECTED,
            0,
            0,
        )
        .unwrap();
        let mut blobs = BlobArea::new();
        let code = blobs.push(&[0xde, 0xad]);
        let module: ApiCall = CreateShaderModule {
            code: Some(code),
            module: HandleField::new(9),
            ..Default::default()
        }
        .into();
        w.write_call(&module, blobs.as_bytes(), PacketTag::empty()).unwrap();
        w.write_call(&QueueWaitIdle::default().into(), &[], PacketTag::empty())
            .unwrap();
        assert_eq!(w.portability_table().len(), 1);
        let mut meta = TraceMetadata::default();
        meta.device_features
            .device
            .push(DeviceFeatureRecord::new(1, false, true));
        w.close(&meta).unwrap();

        let mut r = TraceReader::open(&path).unwrap();
        assert_eq!(r.metadata(), Some(&meta));
        assert_eq!(r.portability_table().len(), 1);
        let first = r.tell();
        assert_eq!(r.portability_table()[0], first);

        let p0 = r.read_packet().unwrap().unwrap();
        assert_eq!(p0.header.global_index, 0);
        assert!(matches!(p0.body, PacketBody::Call(ApiCall::AllocateMemory(_))));
        let p1 = r.read_packet().unwrap().unwrap();
        assert!(p1.is_injected());
        let bookmark = r.tell();
        let p2 = r.read_packet().unwrap().unwrap();
        assert_eq!(p2.blob(code), Some(&[0xde, 0xad][..]));
        assert_eq!(r.read_packet().unwrap().unwrap().header.global_index, 3);
        assert!(r.read_packet().unwrap().is_none());
        assert_eq!(r.remaining_bytes(), 0);

        let again = r.read_packet_at(first).unwrap();
        assert_eq!(again.header.global_index, 0);
        assert!(r.at_end());

        r.seek(bookmark).unwrap();
        assert_eq!(r.read_packet().unwrap().unwrap().header.global_index, 2);
        r.rewind().unwrap();
        assert_eq!(r.tell(), first);
    }

    #[test]
    pub fn unclosed_and_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.pmtrace");
        {
            let mut w = TraceWriter::create(&path, gpu()).unwrap();
            w.write_call(&QueueWaitIdle::default().into(), &[], PacketTag::empty())
                .unwrap();
            // Dropped without close: no metadata, no table, packets still readable.
        }
        let mut r = TraceReader::open(&path).unwrap();
        assert!(r.metadata().is_none());
        assert!(r.portability_table().is_empty());
        assert!(r.read_packet().unwrap().is_some());
        assert!(r.read_packet().unwrap().is_none());

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        let cut = dir.path().join("cut.pmtrace");
        std::fs::File::create(&cut).unwrap().write_all(&bytes).unwrap();
        let mut r = TraceReader::open(&cut).unwrap();
        assert!(r.read_packet().is_err());

        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, vec![0u8; 128]).unwrap();
        assert!(matches!(TraceReader::open(&garbage), Err(TraceError::BadMagic(0))));
    }

    #[test]
    pub fn oversized_packet_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pmtrace");
        let mut w = TraceWriter::create(&path, gpu()).unwrap();
        w.write_call(&QueueWaitIdle::default().into(), &[], PacketTag::empty())
            .unwrap();
        w.write_call(&QueueWaitIdle::default().into(), &[], PacketTag::empty())
            .unwrap();
        w.close(&TraceMetadata::default()).unwrap();

        let first = TraceReader::open(&path).unwrap().tell() as usize;
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[first..first + 8].copy_from_slice(&(1u64 << 46).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut r = TraceReader::open(&path).unwrap();
        match r.read_packet() {
            Err(TraceError::Corrupt(msg)) => assert!(msg.contains("only")),
            other => panic!("expected a corrupt trace error, got {:?}", other.map(|p| p.is_some())),
        }
        assert!(matches!(r.read_packet_at(first as u64), Err(TraceError::Corrupt(_))));
    }
}
