//! Deployment module

pub mod builder;
pub mod container;
pub mod fsm;
pub mod health;
pub mod locks;
pub mod naming;
pub mod orchestrator;
pub mod recipe;
pub mod registry;
