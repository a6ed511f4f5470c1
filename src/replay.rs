//! Replaying a trace against a device.
//!
//! The sequencer walks the trace, the dispatcher replays one packet, hooks
//! adapt the calls that cannot be replayed verbatim and the remapper keeps
//! trace handles pointing at their replay objects.

pub mod compat;
pub mod dispatcher;
pub mod driver;
mod hooks;
pub mod object_remapper;
pub mod sequencer;
pub mod soft_driver;
pub mod state;
