//! Device-link lifecycle types shared by the session service, the device
//! clients, and the wire surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session id used when a caller does not name one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Lifecycle state of a link session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unlinked,
    AwaitingScan,
    Linked,
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlinked => "unlinked",
            Self::AwaitingScan => "awaiting_scan",
            Self::Linked => "linked",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a link session, returned by the state query and
/// sent as the first frame of every push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub session_id: String,
    pub state: LinkState,
    /// Current QR payload. Present only while awaiting a scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    /// Reason for the last authentication failure. Present only when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Number of link attempts started on this session.
    pub attempt: u64,
    pub updated_at: DateTime<Utc>,
}

/// Server-to-client push events.
///
/// Wire form: `{"event":"qr","data":"…"}`, `{"event":"ready"}`,
/// `{"event":"auth_failure","data":"…"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// A new QR code must be scanned. Supersedes any previous code.
    Qr(String),
    /// The device is linked. Emitted once per successful link.
    Ready,
    /// Credential exchange was rejected or the link attempt expired.
    AuthFailure(String),
}

impl PushEvent {
    /// Event name, shared by both push transports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qr(_) => "qr",
            Self::Ready => "ready",
            Self::AuthFailure(_) => "auth_failure",
        }
    }

    /// The event's single argument, if it carries one.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Qr(code) => Some(code),
            Self::Ready => None,
            Self::AuthFailure(reason) => Some(reason),
        }
    }
}

/// Authentication events reported by a device client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The messaging network issued (or rotated) a pairing code.
    Qr(String),
    /// The phone scanned the code and pairing succeeded.
    Paired,
    /// The client is connected with valid credentials.
    Connected,
    /// Transport dropped; the client reconnects on its own.
    Disconnected,
    /// The phone revoked the linked device.
    LoggedOut,
    /// Credential exchange was rejected.
    AuthFailed(String),
}

/// Acknowledgement returned by `initiate_link`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAck {
    pub message: String,
    pub session: String,
    pub state: LinkState,
}
