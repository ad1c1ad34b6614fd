use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a device registration.
///
/// `Pending` is assigned at creation. `Acknowledged` and `Failed` are
/// terminal: no edge leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Queued,
    Processing,
    Acknowledged,
    Failed,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 5] = [
        DeviceStatus::Pending,
        DeviceStatus::Queued,
        DeviceStatus::Processing,
        DeviceStatus::Acknowledged,
        DeviceStatus::Failed,
    ];

    /// Whether `self -> next` is an edge of the registration state machine.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Processing)
                | (Processing, Acknowledged)
                | (Processing, Failed)
                | (Processing, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceStatus::Acknowledged | DeviceStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Queued => "queued",
            DeviceStatus::Processing => "processing",
            DeviceStatus::Acknowledged => "acknowledged",
            DeviceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "queued" => Ok(DeviceStatus::Queued),
            "processing" => Ok(DeviceStatus::Processing),
            "acknowledged" => Ok(DeviceStatus::Acknowledged),
            "failed" => Ok(DeviceStatus::Failed),
            other => Err(format!("unknown device status '{other}'")),
        }
    }
}
