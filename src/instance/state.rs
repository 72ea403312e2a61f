use serde::{Deserialize, Serialize};

/// VM lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VmStatus {
    Provisioning,
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Provisioning => "provisioning",
            VmStatus::Pending => "pending",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::ShuttingDown => "shutting-down",
            VmStatus::Terminated => "terminated",
            VmStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl VmStatus {
    /// EC2 state code and name for the guest-visible instance object.
    /// Provisioning and Error are internal states surfaced as pending.
    pub fn ec2_state(&self) -> (i64, &'static str) {
        match self {
            VmStatus::Provisioning | VmStatus::Pending | VmStatus::Error => (0, "pending"),
            VmStatus::Running => (16, "running"),
            VmStatus::ShuttingDown => (32, "shutting-down"),
            VmStatus::Terminated => (48, "terminated"),
            VmStatus::Stopping => (64, "stopping"),
            VmStatus::Stopped => (80, "stopped"),
        }
    }

    /// No further transitions leave these states (Terminated) or the VM no
    /// longer has a live hypervisor worth heartbeating (the rest).
    pub fn is_terminal_for_qmp(&self) -> bool {
        matches!(
            self,
            VmStatus::Stopping
                | VmStatus::Stopped
                | VmStatus::ShuttingDown
                | VmStatus::Terminated
                | VmStatus::Error
        )
    }

    /// The fixed transition allow-list.
    pub fn can_transition(self, to: VmStatus) -> bool {
        use VmStatus::*;
        matches!(
            (self, to),
            (Provisioning, Running)
                | (Provisioning, Error)
                | (Provisioning, ShuttingDown)
                | (Pending, Running)
                | (Pending, Error)
                | (Pending, ShuttingDown)
                | (Running, Stopping)
                | (Running, ShuttingDown)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Stopped, Running)
                | (Stopped, ShuttingDown)
                | (Stopped, Error)
                | (ShuttingDown, Terminated)
                | (ShuttingDown, Error)
                | (Error, Running)
                | (Error, ShuttingDown)
        )
    }
}

pub const ALL_STATUSES: [VmStatus; 8] = [
    VmStatus::Provisioning,
    VmStatus::Pending,
    VmStatus::Running,
    VmStatus::Stopping,
    VmStatus::Stopped,
    VmStatus::ShuttingDown,
    VmStatus::Terminated,
    VmStatus::Error,
];

#[cfg(test)]
mod tests {
    use super::*;
    use VmStatus::*;

    fn allowed(from: VmStatus) -> Vec<VmStatus> {
        match from {
            Provisioning => vec![Running, Error, ShuttingDown],
            Pending => vec![Running, Error, ShuttingDown],
            Running => vec![Stopping, ShuttingDown, Error],
            Stopping => vec![Stopped, Error],
            Stopped => vec![Running, ShuttingDown, Error],
            ShuttingDown => vec![Terminated, Error],
            Error => vec![Running, ShuttingDown],
            Terminated => vec![],
        }
    }

    #[test]
    fn test_transition_table_exhaustive() {
        for from in ALL_STATUSES {
            for to in ALL_STATUSES {
                let expected = allowed(from).contains(&to);
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminated_is_final() {
        for to in ALL_STATUSES {
            assert!(!Terminated.can_transition(to));
        }
    }

    #[test]
    fn test_ec2_state_codes() {
        assert_eq!(Pending.ec2_state(), (0, "pending"));
        assert_eq!(Running.ec2_state(), (16, "running"));
        assert_eq!(ShuttingDown.ec2_state(), (32, "shutting-down"));
        assert_eq!(Terminated.ec2_state(), (48, "terminated"));
        assert_eq!(Stopping.ec2_state(), (64, "stopping"));
        assert_eq!(Stopped.ec2_state(), (80, "stopped"));
    }

    #[test]
    fn test_serde_round_trip() {
        for status in ALL_STATUSES {
            let json = serde_json::to_string(&status).unwrap();
            let back: VmStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, back);
        }
        assert_eq!(
            serde_json::to_string(&ShuttingDown).unwrap(),
            "\"shutting-down\""
        );
    }
}
