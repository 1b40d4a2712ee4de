use dagflow::{StepStatus, WorkflowStatus};
use dagflow::state::{step_transition_allowed, workflow_transition_allowed};

#[test]
fn every_terminal_workflow_status_rejects_arbitrary_reentry() {
    let terminal = [WorkflowStatus::Completed, WorkflowStatus::Cancelled];
    for status in terminal {
        assert!(!workflow_transition_allowed(status, WorkflowStatus::Running));
        assert!(!workflow_transition_allowed(status, WorkflowStatus::Paused));
    }
    // Failed is the one terminal-ish status that may resume, by explicit retry-all.
    assert!(workflow_transition_allowed(WorkflowStatus::Failed, WorkflowStatus::Running));
}

#[test]
fn terminal_step_statuses_accept_no_further_transitions() {
    let terminal = [
        StepStatus::Completed,
        StepStatus::Skipped,
        StepStatus::Cancelled,
    ];
    for status in terminal {
        for target in [
            StepStatus::Running,
            StepStatus::Retrying,
            StepStatus::Failed,
        ] {
            assert!(!step_transition_allowed(status, target));
        }
    }
}

#[test]
fn retrying_can_go_back_to_running_or_forward_to_a_terminal_status() {
    assert!(step_transition_allowed(StepStatus::Retrying, StepStatus::Running));
    assert!(step_transition_allowed(StepStatus::Retrying, StepStatus::Failed));
    assert!(step_transition_allowed(StepStatus::Retrying, StepStatus::Cancelled));
    assert!(step_transition_allowed(StepStatus::Retrying, StepStatus::Skipped));
}
