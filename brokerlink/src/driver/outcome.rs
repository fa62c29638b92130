//! Per-device result of a run.

use std::fmt;

use serde::Serialize;

use super::attempt::ExecutionAttempt;

/// Final status of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Success,
    Failed,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

/// Everything known about one device once its run is over.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOutcome {
    /// Device identifier.
    pub device_name: String,

    /// Commands and answers sent on the final attempt.
    pub executed_commands: Vec<String>,

    /// Output captured on the final attempt.
    pub stdout: String,

    /// SUCCESS or FAILED.
    pub status: DeviceStatus,

    /// Seconds the recovery probe waited.
    pub recovery_time: f64,

    /// Number of command attempts made.
    pub attempt_count: u32,

    /// Number of probe attempts made.
    pub recovery_attempts: u32,

    /// Whether the device was changed (the run succeeded).
    pub changed: bool,

    /// Human-readable failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Every command attempt, in order.
    #[serde(skip)]
    pub attempts: Vec<ExecutionAttempt>,
}

impl DeviceOutcome {
    /// A failed outcome for a device that never got a full run.
    pub fn abandoned(device: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            device_name: device.into(),
            executed_commands: Vec::new(),
            stdout: String::new(),
            status: DeviceStatus::Failed,
            recovery_time: 0.0,
            attempt_count: 1,
            recovery_attempts: 0,
            changed: false,
            error: Some(detail.into()),
            attempts: Vec::new(),
        }
    }

    /// Whether the device ended in SUCCESS.
    pub fn is_success(&self) -> bool {
        self.status == DeviceStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abandoned_outcome_serializes() {
        let outcome = DeviceOutcome::abandoned("r1", "cancelled before completion");
        assert!(!outcome.is_success());

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["attempt_count"], 1);
        assert_eq!(json["error"], "cancelled before completion");
        assert!(json.get("attempts").is_none());
    }
}
