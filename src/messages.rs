// Define message types for the runtime

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{ErrorReport, Summary};
use crate::watchdog::WatchdogState;

// Command from the planner/teleop -> runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointCommand {
    pub joint_id: u8,
    /// Output-shaft angle in radians
    pub target_angle: f64,
}

// Joint angles published by the runtime every tick.
// Joints whose encoder could not be read are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub angles: BTreeMap<u8, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomingRequest {
    pub joints: Vec<u8>,
}

/// Every configured joint is present; joints that were not requested report false
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomingResponse {
    pub reached_limit: BTreeMap<u8, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub summary: Summary,
    pub errors: Vec<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logic_voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp1: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp2: Option<f32>,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

impl From<WatchdogState> for RuntimeHealth {
    fn from(state: WatchdogState) -> Self {
        match state {
            WatchdogState::Active => RuntimeHealth::Ok,
            WatchdogState::Stopped => RuntimeHealth::CmdStale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: JointCommand =
            serde_json::from_str(r#"{"joint_id": 1, "target_angle": -0.5}"#).unwrap();
        assert_eq!(cmd.joint_id, 1);
        assert_eq!(cmd.target_angle, -0.5);
    }

    #[test]
    fn test_partial_snapshot_omits_missing_fields() {
        let snapshot = DiagnosticSnapshot {
            summary: Summary {
                severity: crate::catalog::Severity::Ok,
                message: "Normal".into(),
            },
            errors: vec![],
            battery_voltage: Some(12.1),
            logic_voltage: None,
            temp1: None,
            temp2: Some(30.0),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("battery_voltage").is_some());
        assert!(json.get("logic_voltage").is_none());
        assert!(json.get("temp1").is_none());
        assert_eq!(json["summary"]["severity"], "ok");
    }

    #[test]
    fn test_health_follows_watchdog() {
        assert_eq!(RuntimeHealth::from(WatchdogState::Active), RuntimeHealth::Ok);
        assert_eq!(RuntimeHealth::from(WatchdogState::Stopped), RuntimeHealth::CmdStale);
        assert_eq!(serde_json::to_string(&RuntimeHealth::CmdStale).unwrap(), "\"cmd_stale\"");
    }
}
