use exit_result::ExitResult;

pub mod dump_command;
pub mod exit_result;
pub mod pm_options;
pub mod replay_command;
pub mod trace_info_command;

pub trait PmCommand {
    fn run(&mut self) -> ExitResult<()>;
}
