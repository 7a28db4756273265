//! Data models shared across the orchestrator

pub mod app_type;
pub mod deployment;
