use super::{
    exit_result::ExitResult,
    pm_options::{PmOptions, PmSubCommand, ReplayOverrides},
};
use crate::{
    commands::PmCommand,
    flags::ReplayFlags,
    log::LogLevel::{LogError, LogInfo},
    replay::{
        sequencer::{ReplayError, Sequencer},
        soft_driver::{DeviceProfile, SoftDriver},
    },
    trace::trace_reader::TraceReader,
};
use std::path::PathBuf;

pub struct ReplayCommand {
    trace_file: PathBuf,
    overrides: ReplayOverrides,
}

impl ReplayCommand {
    pub fn new(options: &PmOptions) -> ReplayCommand {
        match options.cmd.clone() {
            PmSubCommand::Replay {
                trace_file,
                overrides,
            } => ReplayCommand {
                trace_file,
                overrides,
            },
            _ => panic!("Unexpected PmSubCommand variant. Not a `Replay` variant!"),
        }
    }

    /// Defaults, then what the trace recorded, then the command line.
    fn flags_for(&self, trace: &TraceReader) -> ReplayFlags {
        let mut flags = ReplayFlags::default();
        if let Some(m) = trace.metadata() {
            flags.apply_metadata(m);
        }
        self.overrides.apply(&mut flags);
        flags
    }
}

impl PmCommand for ReplayCommand {
    fn run(&mut self) -> ExitResult<()> {
        if let Some(v) = self.overrides.verbosity {
            v.apply();
        }
        let trace = match TraceReader::open(&self.trace_file) {
            Ok(t) => t,
            Err(e) => return ExitResult::err_from(e, 1),
        };
        log!(
            LogInfo,
            "Replaying {:?}: {}",
            self.trace_file,
            trace.header().summary()
        );

        let flags = self.flags_for(&trace);
        let profile = match &flags.device_profile {
            Some(path) => match DeviceProfile::load(path) {
                Ok(p) => p,
                Err(e) => {
                    log!(LogError, "Cannot load device profile {:?}", path);
                    return ExitResult::err_from(e, 1);
                }
            },
            None => DeviceProfile::default(),
        };

        let mut sequencer = match Sequencer::new(trace, SoftDriver::new(profile), flags) {
            Ok(s) => s,
            Err(e) => return ExitResult::err_from(e, 1),
        };
        match sequencer.run() {
            Ok(summary) => {
                println!("{}", summary);
                ExitResult::Ok(())
            }
            Err(e @ ReplayError::Fatal { .. }) => ExitResult::err_from(e, 2),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
