//! Host process: options, run loop and diagnostics

pub mod diagnostic;
pub mod options;
pub mod run;
