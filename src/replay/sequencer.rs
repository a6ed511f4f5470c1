use crate::{
    api::{calls::ApiCall, result::ReplayResult},
    flags::{FlagsError, ReplayFlags},
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    replay::{dispatcher::Replayer, driver::GpuDriver},
    trace::{
        packet::{Packet, PacketBody},
        trace_reader::TraceReader,
        TraceError,
    },
    util::physical_memory_bytes,
};
use std::{
    collections::VecDeque,
    error::Error,
    fmt::{self, Display, Formatter},
    time::Instant,
};

#[derive(Debug)]
pub enum ReplayError {
    Trace(TraceError),
    Flags(FlagsError),
    /// A packet failed in a way that ends the replay.
    Fatal {
        global_index: u64,
        call: &'static str,
        result: ReplayResult,
    },
}

impl Display for ReplayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Trace(e) => write!(f, "{}", e),
            ReplayError::Flags(e) => write!(f, "{}", e),
            ReplayError::Fatal {
                global_index,
                call,
                result,
            } => write!(
                f,
                "replay of packet {} ({}) failed: {}",
                global_index, call, result
            ),
        }
    }
}

impl Error for ReplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplayError::Trace(e) => Some(e),
            ReplayError::Flags(e) => Some(e),
            ReplayError::Fatal { .. } => None,
        }
    }
}

impl From<TraceError> for ReplayError {
    fn from(e: TraceError) -> Self {
        ReplayError::Trace(e)
    }
}

impl From<FlagsError> for ReplayError {
    fn from(e: FlagsError) -> Self {
        ReplayError::Flags(e)
    }
}

/// What a finished replay reports.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ReplaySummary {
    /// Frames replayed inside the loop range, over all loops.
    pub frames: u64,
    pub loops: u32,
    pub seconds: f64,
    pub start_frame: u64,
    pub end_frame: u64,
}

impl ReplaySummary {
    pub fn fps(&self) -> f64 {
        if self.seconds > 0.0 {
            self.frames as f64 / self.seconds
        } else {
            0.0
        }
    }
}

impl Display for ReplaySummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} fps, {:.6} seconds, {} frame{}, {} loop{}, framerange {}-{}",
            self.fps(),
            self.seconds,
            self.frames,
            if self.frames == 1 { "" } else { "s" },
            self.loops,
            if self.loops == 1 { "" } else { "s" },
            self.start_frame,
            self.end_frame
        )
    }
}

/// Walks a trace from start to end, once up to the loop start and then
/// `num_loops` times over the loop range.
pub struct Sequencer<D: GpuDriver> {
    reader: TraceReader,
    replayer: Replayer<D>,
    flags: ReplayFlags,
    /// Packets read ahead of replay. Replayed before anything else the
    /// reader still holds.
    preloaded: VecDeque<Packet>,
}

impl<D: GpuDriver> Sequencer<D> {
    /// `flags` are final: trace metadata and user options already merged.
    pub fn new(
        mut reader: TraceReader,
        driver: D,
        mut flags: ReplayFlags,
    ) -> Result<Sequencer<D>, ReplayError> {
        reader.header().check_replayable()?;
        flags.validate()?;

        let compatibility =
            flags.compatibility_mode && reader.header().platform_differs(Some(driver.gpu_info()));
        if compatibility {
            log!(
                LogInfo,
                "Trace was captured on a different platform; replaying in compatibility mode"
            );
        }

        let mut replayer = Replayer::new(driver, flags.clone(), reader.metadata().cloned());
        replayer.set_compatibility(compatibility);

        if compatibility && flags.portability_table {
            let offsets = reader.portability_table().to_vec();
            let mut lookahead: Vec<(u64, ApiCall)> = Vec::with_capacity(offsets.len());
            for offset in offsets {
                let p = reader.read_packet_at(offset)?;
                if let PacketBody::Call(call) = p.body {
                    lookahead.push((offset, call));
                }
            }
            lookahead.sort_by_key(|(off, _)| *off);
            log!(LogDebug, "{} memory-relevant calls in the portability table", lookahead.len());
            replayer.set_lookahead(lookahead);
        } else if compatibility {
            log!(
                LogWarn,
                "Portability table disabled; allocations cannot be sized for their resources"
            );
        }

        Ok(Sequencer {
            reader,
            replayer,
            flags,
            preloaded: VecDeque::new(),
        })
    }

    pub fn replayer(&self) -> &Replayer<D> {
        &self.replayer
    }

    pub fn replayer_mut(&mut self) -> &mut Replayer<D> {
        &mut self.replayer
    }

    pub fn run(&mut self) -> Result<ReplaySummary, ReplayError> {
        self.reader.rewind()?;
        let loop_start = self.flags.loop_start_frame as u64;
        let loop_end = self.flags.loop_end_frame as u64;

        while self.replayer.frame() < loop_start {
            match self.next_packet()? {
                Some(p) => self.step(p)?,
                None => break,
            }
        }
        let bookmark = self.reader.tell();
        let start_frame = self.replayer.frame();
        log!(LogDebug, "Loop range starts at frame {} (offset {})", start_frame, bookmark);

        if self.flags.preload {
            self.preload()?;
        }

        let started = Instant::now();
        let mut loops = 0;
        for l in 0..self.flags.num_loops {
            if l > 0 {
                self.reader.seek(bookmark)?;
            }
            let base = self.replayer.frame();
            loop {
                if start_frame + (self.replayer.frame() - base) >= loop_end {
                    break;
                }
                match self.next_packet()? {
                    Some(p) => self.step(p)?,
                    None => break,
                }
            }
            loops += 1;
            log!(LogDebug, "Loop {} done at frame {}", l + 1, self.replayer.frame());
        }
        self.replayer.wait_idle();

        let frames = self.replayer.frame() - start_frame;
        let played = if loops > 0 { frames / loops as u64 } else { 0 };
        let stats = self.replayer.stats();
        log!(
            LogInfo,
            "Replayed {} calls: {} skipped, {} failed",
            stats.calls,
            stats.skipped,
            stats.failed
        );
        Ok(ReplaySummary {
            frames,
            loops,
            seconds: started.elapsed().as_secs_f64(),
            start_frame,
            end_frame: start_frame + played,
        })
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        match self.preloaded.pop_front() {
            Some(p) => Ok(Some(p)),
            None => self.reader.read_packet(),
        }
    }

    /// Reads packets ahead up to the share of physical memory the flags
    /// allow. Whatever does not fit streams from the file as usual.
    fn preload(&mut self) -> Result<(), ReplayError> {
        let budget = physical_memory_bytes()
            .map(|m| m / 100 * self.flags.memory_percentage as u64)
            .unwrap_or(u64::MAX);
        let mut used = 0u64;
        while used < budget {
            let mut p = match self.reader.read_packet()? {
                Some(p) => p,
                None => break,
            };
            used += p.header.size;
            if self.flags.premapping {
                if let PacketBody::Call(call) = &mut p.body {
                    self.replayer.premap(call);
                }
            }
            self.preloaded.push_back(p);
        }
        if !self.reader.at_end() {
            log!(
                LogInfo,
                "Preloaded {} packets; {} bytes are read during replay",
                self.preloaded.len(),
                self.reader.remaining_bytes()
            );
        } else {
            log!(LogDebug, "Preloaded {} packets ({} bytes)", self.preloaded.len(), used);
        }
        Ok(())
    }

    fn step(&mut self, mut packet: Packet) -> Result<(), ReplayError> {
        if self.flags.print_current_gpi {
            println!("Current GPI: {}", packet.header.global_index);
        }
        let outcome = self.replayer.replay_packet(&mut packet);
        if outcome.is_fatal(self.flags.exit_on_any_error) {
            let call = match &packet.body {
                PacketBody::Call(c) => c.name(),
                _ => packet.header.kind_name(),
            };
            return Err(ReplayError::Fatal {
                global_index: packet.header.global_index,
                call,
                result: outcome.result,
            });
        }
        Ok(())
    }
}
