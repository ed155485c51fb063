use crate::{error::WasendError, link::DeviceEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messaging device client backed by the underlying messaging library.
///
/// A device client performs the network-level pairing and message delivery.
/// Authentication progress is reported asynchronously through the event
/// sender handed to `connect`.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Human-readable client name.
    fn name(&self) -> &str;

    /// Start or resume authentication. Replaces any previous event sender.
    async fn connect(&self, events: mpsc::Sender<DeviceEvent>) -> Result<(), WasendError>;

    /// Deliver a text message to a normalised phone number (digits only).
    async fn send_text(&self, phone: &str, text: &str) -> Result<(), WasendError>;

    /// Drop the connection without touching stored credentials.
    async fn disconnect(&self) -> Result<(), WasendError>;

    /// Drop the connection and delete stored credentials.
    async fn logout(&self) -> Result<(), WasendError> {
        self.disconnect().await
    }
}

/// Builds one device client per link session.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn DeviceClient>;
}
