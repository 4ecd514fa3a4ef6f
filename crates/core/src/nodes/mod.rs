//! Built-in nodes used by the CLI demos and the integration tests.

pub mod concat;
pub mod constant;
pub mod counter;
pub mod print;
