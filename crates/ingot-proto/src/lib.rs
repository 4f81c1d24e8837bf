//! Wire types for the ingot provisioning agent.
//!
//! Defines the value objects exchanged with the central provisioning service
//! (hardware inventory, cleaning steps, command records) and the shared REST
//! error taxonomy. Every type serializes to exactly the documented JSON shape.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod error;

pub use error::{ErrorBody, RestError};

// ─── Hardware inventory ──────────────────────────────────────────────────────

/// A physical network interface. Switch descriptions are filled in when LLDP
/// data is available, otherwise serialized as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac_address: String,
    pub switch_port_descr: Option<String>,
    pub switch_chassis_descr: Option<String>,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac_address: mac_address.into(),
            switch_port_descr: None,
            switch_chassis_descr: None,
        }
    }
}

/// CPU summary. `frequency` is the reported clock in MHz, as printed by the
/// kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    pub model_name: Option<String>,
    pub frequency: Option<String>,
    pub count: u32,
}

/// A physical block device. `size` is in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    pub model: String,
    pub size: u64,
    pub rotational: bool,
}

/// Physical memory. `total` is in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub total: u64,
}

/// The full inventory payload posted with a node lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInventory {
    pub interfaces: Vec<NetworkInterface>,
    pub cpu: Cpu,
    pub disks: Vec<BlockDevice>,
    pub memory: Memory,
}

// ─── Cleaning ────────────────────────────────────────────────────────────────

/// A cleaning step advertised by a hardware manager.
///
/// `step` doubles as the manager method name dispatched when the step runs.
/// Larger priorities run first; priority also tie-breaks deduplication when
/// two managers with equal support advertise the same step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStep {
    pub step: String,
    pub priority: i64,
    pub interface: String,
    pub reboot_requested: bool,
}

/// Name and version reported by a hardware manager, used to fingerprint the
/// plugin set across a cleaning cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareVersion {
    pub name: String,
    pub version: String,
}

// ─── Command records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Running,
    Succeeded,
    Failed,
}

/// The stored record of one command execution.
///
/// `id` is assigned at creation and never changes; status transitions
/// monotonically from RUNNING to exactly one terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: Uuid,
    pub command_name: String,
    pub command_params: Value,
    pub command_status: CommandStatus,
    pub command_result: Option<Value>,
    pub command_error: Option<ErrorBody>,
}

impl CommandResult {
    /// A fresh RUNNING record with a new id.
    pub fn running(command_name: impl Into<String>, command_params: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_name: command_name.into(),
            command_params,
            command_status: CommandStatus::Running,
            command_result: None,
            command_error: None,
        }
    }

    pub fn succeed(&mut self, result: Value) {
        self.command_status = CommandStatus::Succeeded;
        self.command_result = Some(result);
    }

    pub fn fail(&mut self, error: &RestError) {
        self.command_status = CommandStatus::Failed;
        self.command_error = Some(error.to_body());
    }

    /// Fold a handler outcome into this record.
    pub fn complete(&mut self, outcome: Result<Value, RestError>) {
        match outcome {
            Ok(result) => self.succeed(result),
            Err(error) => self.fail(&error),
        }
    }
}

// ─── Agent status ────────────────────────────────────────────────────────────

/// Payload of `GET /v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub started_at: DateTime<Utc>,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_status_wire_strings() {
        assert_eq!(
            serde_json::to_value(CommandStatus::Running).unwrap(),
            json!("RUNNING")
        );
        assert_eq!(
            serde_json::to_value(CommandStatus::Succeeded).unwrap(),
            json!("SUCCEEDED")
        );
        assert_eq!(
            serde_json::to_value(CommandStatus::Failed).unwrap(),
            json!("FAILED")
        );
    }

    #[test]
    fn test_command_record_lifecycle() {
        let mut record = CommandResult::running("fake.do_something", json!({"fail": false}));
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["command_status"], "RUNNING");
        assert_eq!(encoded["command_result"], Value::Null);
        assert_eq!(encoded["command_error"], Value::Null);

        record.succeed(json!("command execution succeeded"));
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["command_status"], "SUCCEEDED");
        assert_eq!(encoded["command_result"], "command execution succeeded");
        // id is stable across the transition
        assert_eq!(encoded["id"], json!(record.id.to_string()));
    }

    #[test]
    fn test_failed_record_embeds_error_body() {
        let mut record = CommandResult::running("fake.do_something", json!({"fail": true}));
        record.fail(&RestError::CommandExecution {
            details: "command execution failed".to_string(),
        });
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["command_status"], "FAILED");
        assert_eq!(encoded["command_error"]["type"], "CommandExecutionError");
        assert_eq!(encoded["command_error"]["message"], "command execution failed");
    }

    #[test]
    fn test_inventory_payload_shape() {
        let inventory = HardwareInventory {
            interfaces: vec![NetworkInterface::new("eth0", "00:0c:29:8c:11:b1")],
            cpu: Cpu {
                model_name: Some("Intel Xeon".to_string()),
                frequency: Some("2400.000".to_string()),
                count: 4,
            },
            disks: vec![BlockDevice {
                name: "/dev/sda".to_string(),
                model: "TinyUSB Drive".to_string(),
                size: 3116853504,
                rotational: false,
            }],
            memory: Memory { total: 3952 * 1024 * 1024 },
        };
        let encoded = serde_json::to_value(&inventory).unwrap();
        assert_eq!(encoded["interfaces"][0]["name"], "eth0");
        assert_eq!(encoded["interfaces"][0]["switch_port_descr"], Value::Null);
        assert_eq!(encoded["cpu"]["count"], 4);
        assert_eq!(encoded["disks"][0]["rotational"], false);
        assert_eq!(encoded["memory"]["total"], 4143972352u64);
        let roundtrip: HardwareInventory = serde_json::from_value(encoded).unwrap();
        assert_eq!(roundtrip, inventory);
    }
}
