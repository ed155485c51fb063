use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchReport;

/// Top-level error type for wasend.
#[derive(Debug, Error)]
pub enum WasendError {
    /// Caller-side precondition failed (empty message, missing file, bad session id).
    #[error("{0}")]
    InvalidInput(String),

    /// A dispatch was submitted for a session that is not linked.
    #[error("device is not linked; link a device before sending messages")]
    NotLinked,

    /// Another dispatch is already running for the same session.
    #[error("a bulk send is already in progress for this session")]
    DispatchBusy,

    /// The uploaded spreadsheet could not be turned into recipients.
    #[error("malformed spreadsheet: {0}")]
    Spreadsheet(String),

    /// Every recipient of a dispatch failed.
    #[error("{message}")]
    SendFailed {
        message: String,
        report: Box<DispatchReport>,
    },

    /// Device linking could not be started or was rejected.
    #[error("link error: {0}")]
    Link(String),

    /// Error from the messaging device client.
    #[error("device error: {0}")]
    Device(String),

    /// A requested resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// An HTTP request to a wasend server failed.
    #[error("request failed: {0}")]
    Request(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable, machine-readable error classification exposed at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    NotFound,
    NotLinked,
    DispatchBusy,
    MalformedSpreadsheet,
    LinkFailed,
    SendFailed,
    Config,
    Internal,
}

impl ErrorKind {
    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::NotLinked => "not_linked",
            Self::DispatchBusy => "dispatch_busy",
            Self::MalformedSpreadsheet => "malformed_spreadsheet",
            Self::LinkFailed => "link_failed",
            Self::SendFailed => "send_failed",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl WasendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotLinked => ErrorKind::NotLinked,
            Self::DispatchBusy => ErrorKind::DispatchBusy,
            Self::Spreadsheet(_) => ErrorKind::MalformedSpreadsheet,
            Self::SendFailed { .. } => ErrorKind::SendFailed,
            Self::Link(_) => ErrorKind::LinkFailed,
            Self::Device(_) => ErrorKind::SendFailed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Config(_) => ErrorKind::Config,
            Self::Request(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// The dispatch report attached to a failed send, if any.
    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            Self::SendFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}
