use crate::flags::{ReplayFlags, SkipFenceStatus, Verbosity};
use std::{error::Error, num::ParseIntError, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pmtrace",
    about = "Replay and inspect GPU API traces",
    after_help = "Use PMTRACE_LOG to control logging; e.g. PMTRACE_LOG=all:warn,hooks:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct PmOptions {
    #[structopt(subcommand)]
    pub cmd: PmSubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum PmSubCommand {
    /// Replay a captured trace file.
    #[structopt(name = "replay")]
    Replay {
        /// The trace file to replay
        trace_file: PathBuf,

        #[structopt(flatten)]
        overrides: ReplayOverrides,
    },

    /// Print one line per packet of the trace
    #[structopt(name = "dump")]
    Dump {
        /// Packet specs can be either a global packet index like `127`, or a range
        /// like `1000-5000`. By default, all packets are dumped
        #[structopt(short = "r", long, parse(try_from_str = parse_range))]
        packet_range: Option<(u64, Option<u64>)>,

        /// Also print the blob area of each packet in hex
        #[structopt(short = "b", long)]
        blobs: bool,

        trace_file: PathBuf,
    },

    /// Dump the trace header, GPU table and metadata in JSON format.
    #[structopt(name = "trace-info")]
    TraceInfo { trace_file: PathBuf },
}

/// Replay settings given on the command line. Anything left out keeps the
/// value recorded in the trace metadata, or the default.
#[derive(StructOpt, Debug, Clone, Default)]
pub struct ReplayOverrides {
    /// Number of times to replay the loop range
    #[structopt(short = "l", long = "loops")]
    pub num_loops: Option<u32>,

    /// First frame of the loop range
    #[structopt(long = "loop-start-frame")]
    pub loop_start_frame: Option<u32>,

    /// Frame at which each loop ends
    #[structopt(long = "loop-end-frame")]
    pub loop_end_frame: Option<u32>,

    /// Translate memory types, queue families and sizes when the trace comes
    /// from a different platform
    #[structopt(short = "c", long, parse(try_from_str = parse_switch))]
    pub compatibility_mode: Option<bool>,

    /// End the replay at the first call that does not replay successfully
    #[structopt(short = "e", long, parse(try_from_str = parse_switch))]
    pub exit_on_any_error: Option<bool>,

    /// Read the loop range into memory before the timer starts
    #[structopt(short = "p", long, parse(try_from_str = parse_switch))]
    pub preload: Option<bool>,

    /// Share of physical memory preloading may use, 1 to 100
    #[structopt(long, parse(try_from_str = parse_percentage))]
    pub memory_percentage: Option<u32>,

    /// Bind hot handles of preloaded packets ahead of replay
    #[structopt(long, parse(try_from_str = parse_switch))]
    pub premapping: Option<bool>,

    /// Present every traced swapchain through one replay window
    #[structopt(long, parse(try_from_str = parse_switch))]
    pub force_single_window: Option<bool>,

    /// Acquire swapchain images until the index the trace got comes back
    #[structopt(long, parse(try_from_str = parse_switch))]
    pub force_sync_img_idx: Option<bool>,

    /// Prefer the immediate present mode over FIFO
    #[structopt(long, parse(try_from_str = parse_switch))]
    pub vsync_off: Option<bool>,

    #[structopt(long, parse(try_from_str = parse_switch))]
    pub force_disable_anisotropy: Option<bool>,

    #[structopt(long, parse(try_from_str = parse_switch))]
    pub disable_as_capture_replay: Option<bool>,

    #[structopt(long, parse(try_from_str = parse_switch))]
    pub disable_buffer_capture_replay: Option<bool>,

    /// Print the global packet index of every packet before replaying it
    #[structopt(long)]
    pub print_current_gpi: bool,

    /// Which GetFenceStatus calls to skip: 0 none, 1 the unsuccessful ones, 2 all
    #[structopt(long, parse(try_from_str = parse_skip_fence_status))]
    pub skip_get_fence_status: Option<SkipFenceStatus>,

    /// Microseconds to sleep after each present
    #[structopt(long = "instrumentation-delay")]
    pub instrumentation_delay_us: Option<u64>,

    /// Use the portability table to size allocations in compatibility mode
    #[structopt(long = "enable-portability-table", parse(try_from_str = parse_switch))]
    pub portability_table: Option<bool>,

    /// One of quiet, errors, warnings, full, debug
    #[structopt(short = "v", long)]
    pub verbosity: Option<Verbosity>,

    /// JSON description of the software replay device
    #[structopt(long)]
    pub device_profile: Option<PathBuf>,
}

impl ReplayOverrides {
    /// Applied after the trace metadata so that explicit options win.
    pub fn apply(&self, flags: &mut ReplayFlags) {
        macro_rules! set {
            ($($field:ident),*) => {
                $( if let Some(v) = self.$field.clone() { flags.$field = v; } )*
            };
        }
        set!(
            num_loops,
            loop_start_frame,
            loop_end_frame,
            compatibility_mode,
            exit_on_any_error,
            preload,
            memory_percentage,
            premapping,
            force_single_window,
            force_sync_img_idx,
            vsync_off,
            force_disable_anisotropy,
            disable_as_capture_replay,
            disable_buffer_capture_replay,
            skip_get_fence_status,
            instrumentation_delay_us,
            portability_table,
            verbosity
        );
        if self.print_current_gpi {
            flags.print_current_gpi = true;
        }
        if self.device_profile.is_some() {
            flags.device_profile = self.device_profile.clone();
        }
    }
}

fn parse_range(range_or_single: &str) -> Result<(u64, Option<u64>), ParseIntError> {
    let args: Vec<&str> = range_or_single.splitn(2, '-').collect();
    let low = args[0].trim().parse::<u64>()?;
    let mut high: Option<u64> = None;
    if args.len() == 2 {
        high = Some(args[1].trim().parse::<u64>()?);
    }
    Ok((low, high))
}

fn parse_switch(s: &str) -> Result<bool, Box<dyn Error>> {
    match s.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(Box::new(clap::Error::with_description(
            "Only `true`/`false`, `on`/`off` or `1`/`0` are valid here",
            clap::ErrorKind::InvalidValue,
        ))),
    }
}

fn parse_percentage(s: &str) -> Result<u32, Box<dyn Error>> {
    let pct = s.trim().parse::<u32>()?;
    if pct == 0 || pct > 100 {
        Err(Box::new(clap::Error::with_description(
            "Please provide a percentage between 1 and 100",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(pct)
    }
}

fn parse_skip_fence_status(s: &str) -> Result<SkipFenceStatus, Box<dyn Error>> {
    let level = s.trim().parse::<u64>()?;
    SkipFenceStatus::from_level(level).ok_or_else(|| {
        Box::new(clap::Error::with_description(
            "Only 0, 1 or 2 are valid here",
            clap::ErrorKind::InvalidValue,
        )) as Box<dyn Error>
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> PmOptions {
        PmOptions::from_iter_safe(args.iter()).unwrap()
    }

    #[test]
    pub fn replay_options_override_metadata() {
        let o = parse(&[
            "pmtrace",
            "replay",
            "frames.pmtrace",
            "--loops",
            "3",
            "-c",
            "false",
            "--skip-get-fence-status",
            "2",
            "-v",
            "debug",
        ]);
        let overrides = match o.cmd {
            PmSubCommand::Replay {
                trace_file,
                overrides,
            } => {
                assert_eq!(trace_file, PathBuf::from("frames.pmtrace"));
                overrides
            }
            other => panic!("parsed {:?}", other),
        };

        let mut flags = ReplayFlags::default();
        flags.num_loops = 7;
        flags.loop_end_frame = 40;
        overrides.apply(&mut flags);
        assert_eq!(flags.num_loops, 3);
        assert_eq!(flags.loop_end_frame, 40);
        assert!(!flags.compatibility_mode);
        assert_eq!(flags.skip_get_fence_status, SkipFenceStatus::All);
        assert_eq!(flags.verbosity, Verbosity::Debug);
        assert!(flags.portability_table);
    }

    #[test]
    pub fn bad_values_are_rejected() {
        let bad = |args: &[&str]| PmOptions::from_iter_safe(args.iter()).is_err();
        assert!(bad(&["pmtrace", "replay", "t", "--memory-percentage", "0"]));
        assert!(bad(&["pmtrace", "replay", "t", "--preload", "maybe"]));
        assert!(bad(&["pmtrace", "replay", "t", "--skip-get-fence-status", "3"]));
        assert!(bad(&["pmtrace", "dump", "--packet-range", "a-b", "t"]));
    }

    #[test]
    pub fn packet_ranges() {
        assert_eq!(parse_range("12").unwrap(), (12, None));
        assert_eq!(parse_range("10-20").unwrap(), (10, Some(20)));
        match parse(&["pmtrace", "dump", "-b", "-r", "5-9", "t.pmtrace"]).cmd {
            PmSubCommand::Dump {
                packet_range,
                blobs,
                ..
            } => {
                assert_eq!(packet_range, Some((5, Some(9))));
                assert!(blobs);
            }
            other => panic!("parsed {:?}", other),
        }
    }
}
