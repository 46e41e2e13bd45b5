use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain state as reported by `virsh domstate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadState {
    Running,
    Idle,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    PmSuspended,
    Unknown(String),
}

impl WorkloadState {
    pub fn parse(output: &str) -> Self {
        let state = output.lines().next().unwrap_or_default().trim();
        match state {
            "running" => WorkloadState::Running,
            "idle" | "blocked" => WorkloadState::Idle,
            "paused" => WorkloadState::Paused,
            "in shutdown" => WorkloadState::ShuttingDown,
            "shut off" => WorkloadState::ShutOff,
            "crashed" => WorkloadState::Crashed,
            "pmsuspended" => WorkloadState::PmSuspended,
            other => WorkloadState::Unknown(other.to_string()),
        }
    }

    /// Idle guests are live too; they are just not scheduled right now.
    pub fn is_running(&self) -> bool {
        matches!(self, WorkloadState::Running | WorkloadState::Idle)
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadState::Running => write!(f, "running"),
            WorkloadState::Idle => write!(f, "idle"),
            WorkloadState::Paused => write!(f, "paused"),
            WorkloadState::ShuttingDown => write!(f, "in shutdown"),
            WorkloadState::ShutOff => write!(f, "shut off"),
            WorkloadState::Crashed => write!(f, "crashed"),
            WorkloadState::PmSuspended => write!(f, "pmsuspended"),
            WorkloadState::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

/// Numeric owner of the workload's disk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Parses `stat -c %u:%g` output.
    pub fn parse(output: &str) -> Option<Self> {
        let (uid, gid) = output.trim().split_once(':')?;
        Some(Self {
            uid: uid.parse().ok()?,
            gid: gid.parse().ok()?,
        })
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}
