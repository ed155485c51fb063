//! Bot lifecycle: building and running the WhatsApp bot, and translating
//! its events into `DeviceEvent`s.

use super::WhatsAppDevice;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use wacore::types::events::Event;
use wasend_core::{error::WasendError, link::DeviceEvent};
use whatsapp_rust::bot::Bot;
use whatsapp_rust_sqlite_storage::SqliteStore;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

/// Map a bot event onto the link lifecycle. Events that say nothing about
/// authentication map to `None`.
pub(super) fn translate(event: &Event) -> Option<DeviceEvent> {
    let device_event = match event {
        Event::PairingQrCode { code, .. } => {
            info!("WhatsApp QR code generated (scan to pair)");
            debug!("QR data: {code}");
            DeviceEvent::Qr(code.clone())
        }
        Event::PairSuccess(_) => {
            info!("WhatsApp pairing successful");
            DeviceEvent::Paired
        }
        Event::PairError(e) => {
            warn!("WhatsApp pairing rejected: {}", e.error);
            DeviceEvent::AuthFailed(format!("pairing rejected: {}", e.error))
        }
        Event::Connected(_) => {
            info!("WhatsApp connected");
            DeviceEvent::Connected
        }
        Event::Disconnected(_) => {
            warn!("WhatsApp disconnected");
            DeviceEvent::Disconnected
        }
        Event::LoggedOut(_) => {
            warn!("WhatsApp logged out, session invalidated");
            DeviceEvent::LoggedOut
        }
        Event::ConnectFailure(f) if f.reason.is_logged_out() => {
            warn!("WhatsApp connect refused, credentials revoked: {:?}", f.reason);
            DeviceEvent::LoggedOut
        }
        Event::ConnectFailure(f) => {
            warn!("WhatsApp connect failed: {:?} {}", f.reason, f.message);
            let detail = if f.message.is_empty() {
                format!("{:?}", f.reason)
            } else {
                f.message.clone()
            };
            DeviceEvent::AuthFailed(format!(
                "connection refused ({}): {detail}",
                f.reason.code()
            ))
        }
        Event::TemporaryBan(ban) => {
            warn!("WhatsApp account temporarily banned: {}", ban.code);
            DeviceEvent::AuthFailed(format!("account temporarily banned: {}", ban.code))
        }
        Event::ClientOutdated(_) => {
            warn!("WhatsApp rejected the client version");
            DeviceEvent::AuthFailed("client version is outdated".into())
        }
        Event::QrScannedWithoutMultidevice(_) => {
            DeviceEvent::AuthFailed("QR code scanned by a phone without multi-device".into())
        }
        _ => return None,
    };
    Some(device_event)
}

/// Hand an event to the link session. Returns false once it stopped listening.
pub(super) async fn forward(sender: &mpsc::Sender<DeviceEvent>, event: DeviceEvent) -> bool {
    if sender.send(event).await.is_err() {
        debug!("link session no longer listening for device events");
        return false;
    }
    true
}

/// Whether a task behind this handle is still alive.
pub(super) fn bot_running(handle: &AbortHandle) -> bool {
    !handle.is_finished()
}

impl WhatsAppDevice {
    /// Build a WhatsApp bot with the event handler and run it in the background.
    ///
    /// The event handler writes to the same `Arc`-wrapped fields for the
    /// lifetime of the bot, so a later `connect` only has to swap the
    /// event sender.
    pub(super) async fn build_and_run_bot(&self) -> Result<(), WasendError> {
        let db_path = self.session_db_path()?;
        info!("WhatsApp bot building (session: {db_path})...");

        let backend = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .map_err(|e| WasendError::Link(format!("whatsapp store init failed: {e}")))?,
        );

        let client_handle = self.client.clone();
        let events_handle = self.events.clone();
        let runner_handle = self.runner.clone();
        let revoked_flag = self.revoked.clone();

        let mut bot = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .with_device_props(
                Some(self.config.device_name.clone()),
                None,
                Some(waproto::whatsapp::device_props::PlatformType::Desktop),
            )
            .on_event(move |event, client| {
                let client_store = client_handle.clone();
                let events = events_handle.clone();
                let runner = runner_handle.clone();
                let revoked = revoked_flag.clone();
                async move {
                    let Some(device_event) = translate(&event) else {
                        return;
                    };

                    match device_event {
                        DeviceEvent::Connected => *client_store.lock().await = Some(client),
                        DeviceEvent::Disconnected => *client_store.lock().await = None,
                        DeviceEvent::LoggedOut => {
                            *client_store.lock().await = None;
                            revoked.store(true, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                    let stop = device_event == DeviceEvent::LoggedOut;

                    let sender = events.lock().await.clone();
                    if let Some(sender) = sender {
                        forward(&sender, device_event).await;
                    }

                    // Revoked credentials never reconnect; the next connect
                    // starts over with a fresh pairing.
                    if stop {
                        if let Some(handle) = runner.lock().await.take() {
                            handle.abort();
                        }
                    }
                }
            })
            .build()
            .await
            .map_err(|e| WasendError::Link(format!("whatsapp bot build failed: {e}")))?;

        let handle = bot
            .run()
            .await
            .map_err(|e| WasendError::Link(format!("whatsapp bot run failed: {e}")))?;
        *self.runner.lock().await = Some(handle.abort_handle());

        info!("WhatsApp bot started");
        Ok(())
    }
}
