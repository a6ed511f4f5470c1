#[macro_use]
pub mod handles;

pub mod calls;
pub mod chain;
pub mod result;
pub mod types;
