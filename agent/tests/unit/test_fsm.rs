//! FSM unit tests

use dockyard::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Preparing);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[DeploymentState::Preparing]);
}

#[test]
fn test_fsm_deploy_success_flow() {
    let mut fsm = DeploymentFsm::new();

    for event in [
        DeploymentEvent::Prepared,
        DeploymentEvent::Built,
        DeploymentEvent::Started,
        DeploymentEvent::Healthy,
        DeploymentEvent::Prune,
        DeploymentEvent::Stream,
    ] {
        fsm.process(event).unwrap();
    }

    assert_eq!(
        fsm.history(),
        &[
            DeploymentState::Preparing,
            DeploymentState::Building,
            DeploymentState::Starting,
            DeploymentState::HealthChecking,
            DeploymentState::Ready,
            DeploymentState::Pruning,
            DeploymentState::Streaming,
        ]
    );
    assert!(fsm.succeeded());
}

#[test]
fn test_fsm_health_failure_rolls_back() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Prepared).unwrap();
    fsm.process(DeploymentEvent::Built).unwrap();
    fsm.process(DeploymentEvent::Started).unwrap();
    fsm.process(DeploymentEvent::Failed("no response".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeploymentState::RolledBack);
    assert_eq!(fsm.error(), Some("no response"));
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Cannot start before building
    assert!(fsm.process(DeploymentEvent::Started).is_err());
    assert_eq!(fsm.state(), DeploymentState::Preparing);

    // Nothing leaves a terminal state
    fsm.process(DeploymentEvent::Failed("boom".to_string())).unwrap();
    assert!(fsm.process(DeploymentEvent::Prepared).is_err());
    assert!(fsm
        .process(DeploymentEvent::Failed("again".to_string()))
        .is_err());
}

#[test]
fn test_fsm_no_failure_after_ready() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Prepared).unwrap();
    fsm.process(DeploymentEvent::Built).unwrap();
    fsm.process(DeploymentEvent::Started).unwrap();
    fsm.process(DeploymentEvent::Healthy).unwrap();

    assert!(fsm
        .process(DeploymentEvent::Failed("late".to_string()))
        .is_err());
    assert_eq!(fsm.state(), DeploymentState::Ready);
}

#[test]
fn test_state_names() {
    assert_eq!(DeploymentState::HealthChecking.to_string(), "HEALTH_CHECKING");
    assert_eq!(DeploymentState::RolledBack.to_string(), "ROLLED_BACK");
    assert_eq!(
        serde_json::to_string(&DeploymentState::HealthChecking).unwrap(),
        "\"health_checking\""
    );
}
