//! Dockyard Library
//!
//! Single-host container deployment: image building, container lifecycle,
//! health verification and log streaming behind one orchestrator.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod runtime;
pub mod storage;
pub mod utils;
