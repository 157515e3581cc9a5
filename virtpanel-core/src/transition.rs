//! The VM lifecycle state machine.

use std::fmt;

use crate::error::{CoreError, EntityKind, Result};
use crate::model::VmState;

/// A lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmOp {
    Start,
    Shutdown,
    Destroy,
    Reboot,
    Suspend,
    Resume,
    Delete,
}

impl VmOp {
    pub const ALL: [VmOp; 7] = [
        VmOp::Start,
        VmOp::Shutdown,
        VmOp::Destroy,
        VmOp::Reboot,
        VmOp::Suspend,
        VmOp::Resume,
        VmOp::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmOp::Start => "start",
            VmOp::Shutdown => "shutdown",
            VmOp::Destroy => "destroy",
            VmOp::Reboot => "reboot",
            VmOp::Suspend => "suspend",
            VmOp::Resume => "resume",
            VmOp::Delete => "delete",
        }
    }
}

impl fmt::Display for VmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What applying an operation to a VM means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Already in the requested state.
    Noop,
    /// Drive the VM from `from` to `to`, passing through `via` while the
    /// driver works.
    Transition {
        from: VmState,
        to: VmState,
        via: Option<VmState>,
    },
    /// Remove the VM.
    Remove { from: VmState },
}

impl Plan {
    /// Label used in errors and logs, e.g. `start (stopped -> running)`.
    pub fn describe(&self, op: VmOp) -> String {
        match self {
            Plan::Noop => op.as_str().to_string(),
            Plan::Transition { from, to, .. } => format!("{} ({} -> {})", op, from, to),
            Plan::Remove { from } => format!("{} ({} -> deleted)", op, from),
        }
    }
}

/// Decide what `op` does to a VM in `state`, or why it is not allowed.
pub fn plan(vm: &str, op: VmOp, state: VmState) -> Result<Plan> {
    use VmState::*;

    let transition = |to, via| {
        Ok(Plan::Transition {
            from: state,
            to,
            via,
        })
    };

    match (op, state) {
        (VmOp::Start, Defined | Stopped) => transition(Running, None),
        (VmOp::Start, Running) => Ok(Plan::Noop),
        (VmOp::Shutdown, Running) => transition(Stopped, Some(ShuttingDown)),
        // Destroy also ends a graceful shutdown the guest never completes.
        (VmOp::Destroy, Running | ShuttingDown) => transition(Stopped, None),
        (VmOp::Reboot, Running) => transition(Running, None),
        (VmOp::Suspend, Running) => transition(Paused, None),
        (VmOp::Resume, Paused) => transition(Running, None),
        (VmOp::Delete, Defined | Stopped) => Ok(Plan::Remove { from: state }),
        _ => Err(CoreError::conflict(
            EntityKind::Vm,
            vm,
            op.as_str(),
            format!("not allowed while {}", state),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const STATES: [VmState; 5] = [
        VmState::Defined,
        VmState::Running,
        VmState::Paused,
        VmState::ShuttingDown,
        VmState::Stopped,
    ];

    fn allowed(op: VmOp) -> &'static [VmState] {
        match op {
            VmOp::Start => &[VmState::Defined, VmState::Stopped, VmState::Running],
            VmOp::Shutdown => &[VmState::Running],
            VmOp::Destroy => &[VmState::Running, VmState::ShuttingDown],
            VmOp::Reboot => &[VmState::Running],
            VmOp::Suspend => &[VmState::Running],
            VmOp::Resume => &[VmState::Paused],
            VmOp::Delete => &[VmState::Defined, VmState::Stopped],
        }
    }

    #[test]
    fn test_every_pair_is_allowed_or_conflict() {
        for op in VmOp::ALL {
            for state in STATES {
                let result = plan("vm", op, state);
                if allowed(op).contains(&state) {
                    assert!(result.is_ok(), "{} from {} should be allowed", op, state);
                } else {
                    let err = result.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::Conflict, "{} from {}", op, state);
                }
            }
        }
    }

    #[test]
    fn test_targets() {
        assert_eq!(plan("vm", VmOp::Start, VmState::Running).unwrap(), Plan::Noop);
        assert_eq!(
            plan("vm", VmOp::Shutdown, VmState::Running).unwrap(),
            Plan::Transition {
                from: VmState::Running,
                to: VmState::Stopped,
                via: Some(VmState::ShuttingDown)
            }
        );
        assert_eq!(
            plan("vm", VmOp::Suspend, VmState::Running).unwrap().describe(VmOp::Suspend),
            "suspend (running -> paused)"
        );
        assert_eq!(
            plan("vm", VmOp::Delete, VmState::Stopped).unwrap().describe(VmOp::Delete),
            "delete (stopped -> deleted)"
        );
    }

    #[test]
    fn test_conflict_names_the_state() {
        let err = plan("web", VmOp::Resume, VmState::Running).unwrap_err();
        assert_eq!(err.to_string(), "cannot resume vm 'web': not allowed while running");
    }
}
