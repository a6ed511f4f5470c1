use pmtrace::commands::{
    dump_command::DumpCommand,
    pm_options::{PmOptions, PmSubCommand},
    replay_command::ReplayCommand,
    trace_info_command::TraceInfoCommand,
    PmCommand,
};
use std::process::exit;
use structopt::StructOpt;

fn main() {
    let options = PmOptions::from_args();

    let result = match &options.cmd {
        PmSubCommand::Replay { .. } => ReplayCommand::new(&options).run(),
        PmSubCommand::Dump { .. } => DumpCommand::new(&options).run(),
        PmSubCommand::TraceInfo { .. } => TraceInfoCommand::new(&options).run(),
    };
    exit(result.report());
}
