//! REST error taxonomy shared by every ingot crate.
//!
//! Each error carries a taxonomy tag (`type`), an HTTP status (`code`), a
//! stable message phrase, and free-form details. [`RestError::to_body`]
//! produces the exact JSON error body served on the HTTP surface and embedded
//! in failed command records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The serialized shape of every error leaving this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
    pub message: String,
    pub details: String,
}

/// Structured errors for everything observable through the agent API.
///
/// Internal-only sentinels (incompatible hardware method, unknown node) live
/// next to the code that raises them; this enum covers errors that serialize
/// onto the wire.
#[derive(Debug, Clone, Error)]
pub enum RestError {
    #[error("Invalid request body")]
    InvalidContent { details: String },

    #[error("Invalid command")]
    InvalidCommand { details: String },

    #[error("Invalid command parameters")]
    InvalidCommandParams { details: String },

    #[error("Not found")]
    NotFound { details: String },

    // The message mirrors the wrapped cause so a poller can read the failure
    // without unpacking `details`.
    #[error("{details}")]
    CommandExecution { details: String },

    #[error("Another command is already executing for this extension")]
    CommandBusy { details: String },

    #[error("Error performing cleaning step")]
    Cleaning { details: String },

    #[error("Cleaning version mismatch, restart cleaning")]
    CleanVersionMismatch {
        agent_version: BTreeMap<String, String>,
        node_version: BTreeMap<String, String>,
    },

    #[error("Verification failed")]
    VerificationFailed { details: String },

    #[error("Error downloading image")]
    ImageDownload { details: String },

    #[error("Error verifying image checksum")]
    ImageChecksum { details: String },

    #[error("Error writing image to device")]
    ImageWrite { details: String },

    #[error("Configdrive is too large for intended partition")]
    ConfigDriveTooLarge { details: String },

    #[error("Error writing configdrive to device")]
    ConfigDriveWrite { details: String },

    #[error("Error rebooting system")]
    SystemReboot { details: String },

    #[error("Block device caused unknown error")]
    BlockDevice { details: String },

    #[error("Error erasing block device")]
    BlockDeviceErase { details: String },
}

impl RestError {
    /// Taxonomy tag serialized as the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidContent { .. } => "InvalidContentError",
            Self::InvalidCommand { .. } => "InvalidCommandError",
            Self::InvalidCommandParams { .. } => "InvalidCommandParamsError",
            Self::NotFound { .. } => "RequestedObjectNotFoundError",
            Self::CommandExecution { .. } => "CommandExecutionError",
            Self::CommandBusy { .. } => "CommandBusyError",
            Self::Cleaning { .. } => "CleaningError",
            Self::CleanVersionMismatch { .. } => "CleanVersionMismatch",
            Self::VerificationFailed { .. } => "VerificationFailed",
            Self::ImageDownload { .. } => "ImageDownloadError",
            Self::ImageChecksum { .. } => "ImageChecksumError",
            Self::ImageWrite { .. } => "ImageWriteError",
            Self::ConfigDriveTooLarge { .. } => "ConfigDriveTooLargeError",
            Self::ConfigDriveWrite { .. } => "ConfigDriveWriteError",
            Self::SystemReboot { .. } => "SystemRebootError",
            Self::BlockDevice { .. } => "BlockDeviceError",
            Self::BlockDeviceErase { .. } => "BlockDeviceEraseError",
        }
    }

    /// HTTP status served with this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidContent { .. }
            | Self::InvalidCommand { .. }
            | Self::InvalidCommandParams { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::CommandBusy { .. }
            | Self::CleanVersionMismatch { .. }
            | Self::VerificationFailed { .. } => 409,
            _ => 500,
        }
    }

    pub fn details(&self) -> String {
        match self {
            Self::InvalidContent { details }
            | Self::InvalidCommand { details }
            | Self::InvalidCommandParams { details }
            | Self::NotFound { details }
            | Self::CommandExecution { details }
            | Self::CommandBusy { details }
            | Self::Cleaning { details }
            | Self::VerificationFailed { details }
            | Self::ImageDownload { details }
            | Self::ImageChecksum { details }
            | Self::ImageWrite { details }
            | Self::ConfigDriveTooLarge { details }
            | Self::ConfigDriveWrite { details }
            | Self::SystemReboot { details }
            | Self::BlockDevice { details }
            | Self::BlockDeviceErase { details } => details.clone(),
            Self::CleanVersionMismatch {
                agent_version,
                node_version,
            } => format!(
                "Agent cleaning version: {agent_version:?}, node cleaning version: {node_version:?}"
            ),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    /// 404 body for a missing stored object, e.g. a command result id.
    pub fn not_found(type_descr: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            details: format!("{type_descr} with id {id} not found."),
        }
    }
}
