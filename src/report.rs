//! Structured results handed back to the caller for rendering.

use serde::Serialize;
use std::fmt;

/// What a transfer would do, computed before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub source_dataset: String,
    pub destination_dataset: String,
    pub destination_exists: bool,
    /// Whether the parent of a missing destination exists; `None` when the destination exists.
    pub parent_exists: Option<bool>,
    /// Incremental basis label; `None` means a full stream.
    pub basis: Option<String>,
    pub force: bool,
}

impl TransferPlan {
    /// A full stream would land on an existing dataset and `force` is not set.
    pub fn conflicts(&self) -> bool {
        self.basis.is_none() && self.destination_exists && !self.force
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    DryRun,
    Completed,
    SourceMissing { name: String },
    DestinationConflict,
    Failed { exit_code: i32, detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub source: String,
    pub destination: String,
    pub plan: Option<TransferPlan>,
    /// Snapshot taken on the source for this transfer; kept even on failure.
    pub snapshot: Option<String>,
    pub bytes_total: Option<u64>,
    pub bytes_sent: u64,
    pub outcome: TransferOutcome,
}

impl TransferReport {
    pub fn success(&self) -> bool {
        matches!(
            self.outcome,
            TransferOutcome::DryRun | TransferOutcome::Completed
        )
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::DryRun => write!(f, "dry run, nothing changed"),
            TransferOutcome::Completed => write!(f, "transfer completed"),
            TransferOutcome::SourceMissing { name } => {
                write!(f, "no source dataset matches '{}'", name)
            }
            TransferOutcome::DestinationConflict => write!(
                f,
                "destination exists with no common snapshot; use --force to overwrite it"
            ),
            TransferOutcome::Failed { exit_code, detail } => {
                write!(f, "transfer failed (exit {})", exit_code)?;
                if !detail.is_empty() {
                    write!(f, ": {}", detail)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Transfer {} -> {}", self.source, self.destination)?;
        if let Some(plan) = &self.plan {
            writeln!(f, "  source dataset:      {}", plan.source_dataset)?;
            writeln!(
                f,
                "  destination dataset: {} ({})",
                plan.destination_dataset,
                if plan.destination_exists { "exists" } else { "will be created" }
            )?;
            if let Some(parent_exists) = plan.parent_exists {
                writeln!(
                    f,
                    "  destination parent:  {}",
                    if parent_exists { "exists" } else { "missing, receive will fail" }
                )?;
            }
            match &plan.basis {
                Some(basis) => writeln!(f, "  mode:                incremental from @{}", basis)?,
                None => writeln!(f, "  mode:                full stream")?,
            }
            if plan.conflicts() {
                writeln!(f, "  warning:             destination would be refused without --force")?;
            }
        }
        if let Some(snapshot) = &self.snapshot {
            writeln!(f, "  snapshot:            {}", snapshot)?;
        }
        if let Some(total) = self.bytes_total {
            writeln!(f, "  sent:                {} of {} bytes", self.bytes_sent, total)?;
        }
        write!(f, "  result:              {}", self.outcome)
    }
}
