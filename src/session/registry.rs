use super::LinkSession;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use wasend_core::{error::WasendError, traits::DeviceFactory};

const MAX_SESSION_ID_LEN: usize = 64;

/// Check that a caller-supplied session id is safe to use as a directory name.
pub fn validate_session_id(id: &str) -> Result<(), WasendError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WasendError::InvalidInput(format!(
            "invalid session id '{id}': use 1-{MAX_SESSION_ID_LEN} letters, digits, '-' or '_'"
        )))
    }
}

/// Owns every link session, keyed by session id.
///
/// Each session gets its own device client from the factory, so separate
/// callers never share one link.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<LinkSession>>>,
    factory: Arc<dyn DeviceFactory>,
    qr_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn DeviceFactory>, qr_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            qr_timeout,
        }
    }

    /// Look up a session, creating it (Unlinked) on first use.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<LinkSession>, WasendError> {
        validate_session_id(id)?;

        if let Some(session) = self.sessions.read().await.get(id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            info!(session = %id, "link session created");
            Arc::new(LinkSession::new(
                id,
                self.factory.create(id),
                self.qr_timeout,
            ))
        });
        Ok(Arc::clone(session))
    }

    /// Number of known sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
