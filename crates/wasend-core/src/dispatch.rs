//! Bulk dispatch results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One recipient that did not receive the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientFailure {
    /// 1-based spreadsheet row.
    pub row: u32,
    pub phone: String,
    pub error: String,
}

/// Aggregate outcome of one bulk send. `sent + failed == total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub job_id: Uuid,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub failures: Vec<RecipientFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DispatchReport {
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        if self.failed == 0 {
            "Messages sent successfully!".to_string()
        } else if self.sent == 0 {
            format!("Failed to send messages: all {} recipients failed", self.total)
        } else {
            format!(
                "Sent {} of {} messages; {} failed",
                self.sent, self.total, self.failed
            )
        }
    }
}
