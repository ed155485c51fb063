//! Message delivery: JID mapping and retry logic.

use std::time::Duration;
use tracing::{error, warn};
use wacore_binary::jid::Jid;
use wasend_core::error::WasendError;
use whatsapp_rust::client::Client;

/// Backoff between send attempts: 500ms, 1s, 2s.
pub(super) const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

/// Total send attempts: the first try plus one per backoff step.
pub(super) const MAX_SEND_ATTEMPTS: usize = RETRY_DELAYS_MS.len() + 1;

/// Server suffix for personal (non-group) chats.
const USER_SERVER: &str = "s.whatsapp.net";

/// Map normalised phone digits to a personal-chat JID.
pub(super) fn phone_to_jid(phone: &str) -> Result<Jid, WasendError> {
    if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(WasendError::Device(format!(
            "invalid recipient '{phone}': expected digits only"
        )));
    }
    format!("{phone}@{USER_SERVER}")
        .parse()
        .map_err(|e| WasendError::Device(format!("invalid whatsapp JID for '{phone}': {e}")))
}

/// Delay to wait after failed attempt `attempt` (1-based), or `None`
/// once every attempt is spent.
pub(super) fn retry_delay(attempt: usize) -> Option<Duration> {
    attempt
        .checked_sub(1)
        .and_then(|i| RETRY_DELAYS_MS.get(i))
        .map(|ms| Duration::from_millis(*ms))
}

/// Send a WhatsApp message with retry and exponential backoff.
///
/// Attempts up to 4 times, sleeping 500ms, 1s and then 2s between attempts.
pub(super) async fn retry_send(
    client: &Client,
    jid: &Jid,
    msg: waproto::whatsapp::Message,
) -> Result<String, WasendError> {
    let mut last_err = None;

    for attempt in 1..=MAX_SEND_ATTEMPTS {
        match client.send_message(jid.clone(), msg.clone()).await {
            Ok(msg_id) => return Ok(msg_id),
            Err(e) => {
                match retry_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            "whatsapp send attempt {attempt}/{MAX_SEND_ATTEMPTS} failed: {e}, retrying in {}ms",
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => error!(
                        "whatsapp send attempt {attempt}/{MAX_SEND_ATTEMPTS} failed: {e}, giving up"
                    ),
                }
                last_err = Some(e.to_string());
            }
        }
    }

    Err(WasendError::Device(format!(
        "whatsapp send failed after {MAX_SEND_ATTEMPTS} attempts: {}",
        last_err.unwrap_or_default()
    )))
}
