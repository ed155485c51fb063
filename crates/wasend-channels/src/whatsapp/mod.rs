//! WhatsApp device client, a pure Rust implementation via `whatsapp-rust`.
//!
//! Uses the WhatsApp Web protocol (Noise handshake + Signal encryption).
//! Pairing is done by scanning a QR code, like WhatsApp Web.
//! Credentials are persisted to `{data_dir}/sessions/{session_id}/whatsapp.db`.

mod bot;
mod send;


use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::info;
use wasend_core::{
    config::{shellexpand, WhatsAppConfig},
    error::WasendError,
    link::DeviceEvent,
    traits::{DeviceClient, DeviceFactory},
};

use bot::{bot_running, forward};
use send::{phone_to_jid, retry_send};

/// One linked WhatsApp device.
pub struct WhatsAppDevice {
    pub(super) config: WhatsAppConfig,
    pub(super) session_dir: PathBuf,
    /// Client handle for sending messages, set once connected.
    pub(super) client: Arc<Mutex<Option<Arc<whatsapp_rust::client::Client>>>>,
    /// Where authentication events go. Replaced on every `connect`.
    pub(super) events: Arc<Mutex<Option<mpsc::Sender<DeviceEvent>>>>,
    /// Abort handle of the running bot task, if any.
    pub(super) runner: Arc<Mutex<Option<AbortHandle>>>,
    /// Set when the phone revoked this device; stored credentials are stale.
    pub(super) revoked: Arc<AtomicBool>,
}

impl WhatsAppDevice {
    pub fn new(config: WhatsAppConfig, session_dir: PathBuf) -> Self {
        Self {
            config,
            session_dir,
            client: Arc::new(Mutex::new(None)),
            events: Arc::new(Mutex::new(None)),
            runner: Arc::new(Mutex::new(None)),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if the WhatsApp client is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Get the credential database path, creating its directory.
    pub(super) fn session_db_path(&self) -> Result<String, WasendError> {
        std::fs::create_dir_all(&self.session_dir)?;
        Ok(self
            .session_dir
            .join("whatsapp.db")
            .to_string_lossy()
            .into_owned())
    }

    /// Delete the credential directory.
    fn remove_credentials(&self) -> Result<(), WasendError> {
        if self.session_dir.exists() {
            info!("deleting WhatsApp session at {}", self.session_dir.display());
            std::fs::remove_dir_all(&self.session_dir)?;
        }
        Ok(())
    }

    /// Delete credentials the phone has revoked, so the next bot pairs anew.
    pub(super) fn discard_revoked_credentials(&self) -> Result<(), WasendError> {
        if self.revoked.swap(false, Ordering::SeqCst) {
            self.remove_credentials()?;
        }
        Ok(())
    }

    /// Whether a bot task is alive. Clears the handle of a finished one.
    pub(super) async fn runner_alive(&self) -> bool {
        let mut runner = self.runner.lock().await;
        match runner.as_ref() {
            Some(handle) if bot_running(handle) => true,
            Some(_) => {
                *runner = None;
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl DeviceClient for WhatsAppDevice {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn connect(&self, events: mpsc::Sender<DeviceEvent>) -> Result<(), WasendError> {
        *self.events.lock().await = Some(events.clone());

        if self.is_connected().await {
            forward(&events, DeviceEvent::Connected).await;
            return Ok(());
        }
        if self.runner_alive().await {
            // Bot still running: new QR codes flow to the fresh sender.
            return Ok(());
        }

        self.discard_revoked_credentials()?;
        self.build_and_run_bot().await
    }

    async fn send_text(&self, phone: &str, text: &str) -> Result<(), WasendError> {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| WasendError::Device("whatsapp client not connected".into()))?;

        let jid = phone_to_jid(phone)?;
        let msg = waproto::whatsapp::Message {
            conversation: Some(text.to_string()),
            ..Default::default()
        };
        retry_send(&client, &jid, msg).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WasendError> {
        if let Some(handle) = self.runner.lock().await.take() {
            handle.abort();
        }
        *self.client.lock().await = None;
        *self.events.lock().await = None;
        info!("WhatsApp device disconnected ({})", self.session_dir.display());
        Ok(())
    }

    async fn logout(&self) -> Result<(), WasendError> {
        self.disconnect().await?;
        self.revoked.store(false, Ordering::SeqCst);
        self.remove_credentials()
    }
}

/// Builds one `WhatsAppDevice` per link session, each with its own
/// credential directory.
pub struct WhatsAppFactory {
    config: WhatsAppConfig,
    data_dir: String,
}

impl WhatsAppFactory {
    pub fn new(config: WhatsAppConfig, data_dir: &str) -> Self {
        Self {
            config,
            data_dir: data_dir.to_string(),
        }
    }

    /// Credential directory for a session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        Path::new(&shellexpand(&self.data_dir))
            .join("sessions")
            .join(session_id)
    }
}

impl DeviceFactory for WhatsAppFactory {
    fn create(&self, session_id: &str) -> Arc<dyn DeviceClient> {
        Arc::new(WhatsAppDevice::new(
            self.config.clone(),
            self.session_dir(session_id),
        ))
    }
}
