//! Capture and replay of GPU API call streams.
//!
//! `capture` and `pageguard` are the recording side: the host shim forwards
//! every intercepted call to a `capture::MemoryInterceptor`, which tracks
//! writes to mapped memory and emits packets. `trace` holds the file format;
//! `replay` turns a trace back into driver calls.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[cfg(test)]
#[macro_use]
extern crate memoffset;

#[macro_use]
pub mod log;
#[macro_use]
pub mod api;
pub mod capture;
pub mod commands;
pub mod flags;
pub mod pageguard;
pub mod replay;
pub mod trace;
pub mod util;
