use serde::{Deserialize, Serialize};

/// Lifecycle of a tracked in-process task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessableStatus {
    Created,
    Processing,
    Successful, // terminal
    Failed,     // terminal
    Canceled,   // terminal
}

impl ProcessableStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessableStatus::Successful | ProcessableStatus::Failed | ProcessableStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessableStatus::Created => "CREATED",
            ProcessableStatus::Processing => "PROCESSING",
            ProcessableStatus::Successful => "SUCCESSFUL",
            ProcessableStatus::Failed => "FAILED",
            ProcessableStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for ProcessableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
