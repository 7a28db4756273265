//! Integration tests for the dockyard crate

mod test_fsm;
mod test_orchestrator;
