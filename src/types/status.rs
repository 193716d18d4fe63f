use serde::Serialize;

/// Lifecycle state of a registry entry.
///
/// Statuses only move forward: `Pending → Processing → (Completed | Failed
/// | Cancelled)`, with the shortcut `Pending → Cancelled` for jobs
/// cancelled before a permit was available. Terminal states are absorbing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        use JobStatus::*;

        match self {
            Pending => "pending",
            Processing => "processing",
            Completed => "completed",
            Failed => "failed",
            Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        use JobStatus::*;

        matches!(self, Completed | Failed | Cancelled)
    }
}

// This impl is used to allow job statuses to be serialised on the wire.
impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
