//! In-process device client used by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use wasend_core::{
    error::WasendError,
    link::{DeviceEvent, LinkState},
    traits::{DeviceClient, DeviceFactory},
};

use crate::session::LinkSession;

/// A device that records sends and lets the test drive authentication.
#[derive(Default)]
pub struct MockDevice {
    events: Mutex<Option<mpsc::Sender<DeviceEvent>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub connects: AtomicUsize,
    pub logged_out: AtomicBool,
    /// Phones whose sends fail.
    pub failing_phones: Mutex<HashSet<String>>,
    /// When set, `connect` fails with this reason.
    pub connect_error: Mutex<Option<String>>,
    /// Artificial latency per send.
    pub send_delay: Mutex<Duration>,
    /// Events emitted synchronously from inside `connect`.
    pub on_connect: Mutex<Vec<DeviceEvent>>,
    /// Artificial latency of `disconnect`.
    pub disconnect_delay: Mutex<Duration>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Emit an authentication event into the current link attempt.
    pub async fn emit(&self, event: DeviceEvent) {
        let sender = self.events.lock().unwrap().clone();
        sender
            .expect("device not connected")
            .send(event)
            .await
            .expect("link session dropped receiver");
    }

    /// Whether a link attempt currently holds the event sender.
    pub fn is_connected(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    pub fn fail_sends_to(&self, phone: &str) {
        self.failing_phones.lock().unwrap().insert(phone.to_string());
    }

    pub fn sent_phones(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl DeviceClient for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, events: mpsc::Sender<DeviceEvent>) -> Result<(), WasendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.connect_error.lock().unwrap().clone() {
            return Err(WasendError::Link(reason));
        }
        *self.events.lock().unwrap() = Some(events.clone());
        let queued: Vec<DeviceEvent> = self.on_connect.lock().unwrap().drain(..).collect();
        for event in queued {
            let _ = events.send(event).await;
        }
        Ok(())
    }

    async fn send_text(&self, phone: &str, text: &str) -> Result<(), WasendError> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_phones.lock().unwrap().contains(phone) {
            return Err(WasendError::Device(format!("send to {phone} failed")));
        }
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), text.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WasendError> {
        let delay = *self.disconnect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self.events.lock().unwrap() = None;
        Ok(())
    }

    async fn logout(&self) -> Result<(), WasendError> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.disconnect().await
    }
}

/// Hands out one `MockDevice` per session id and keeps them for inspection.
#[derive(Default)]
pub struct MockFactory {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn device(&self, session_id: &str) -> Arc<MockDevice> {
        Arc::clone(
            self.devices
                .lock()
                .unwrap()
                .entry(session_id.to_string())
                .or_insert_with(MockDevice::new),
        )
    }
}

impl DeviceFactory for MockFactory {
    fn create(&self, session_id: &str) -> Arc<dyn DeviceClient> {
        self.device(session_id)
    }
}

/// Poll until the session reaches `state`, panicking after one second.
pub async fn wait_for_state(session: &LinkSession, state: LinkState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let current = session.snapshot().await.state;
        if current == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session stuck in {current}, expected {state}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Build a session backed by a fresh mock device and bring it to Linked.
pub async fn linked_session(id: &str) -> (Arc<LinkSession>, Arc<MockDevice>) {
    let device = MockDevice::new();
    let session = Arc::new(LinkSession::new(
        id,
        device.clone(),
        Duration::from_secs(60),
    ));
    session.initiate_link().await.unwrap();
    device.emit(DeviceEvent::Qr("abc123".into())).await;
    device.emit(DeviceEvent::Paired).await;
    wait_for_state(&session, LinkState::Linked).await;
    (session, device)
}
