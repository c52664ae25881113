//! Schema module - Configuration and record types shared by every process.

mod candidate;
mod config;

pub use candidate::*;
pub use config::*;
