//! Link sessions: the device-linking state machine and its push channel.
//!
//! A `LinkSession` is an explicit object owned by the `SessionRegistry`.
//! Every state change is published to subscribers while the session lock is
//! held, so `subscribe()` can hand out a snapshot and a receiver that never
//! miss an event between them.

mod registry;


pub use registry::SessionRegistry;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use wasend_core::{
    error::WasendError,
    link::{DeviceEvent, LinkAck, LinkSnapshot, LinkState, PushEvent},
    traits::DeviceClient,
};

/// Push events buffered per subscriber before it starts lagging.
const PUSH_CAPACITY: usize = 32;

/// Device events buffered between the device client and the pump task.
const DEVICE_EVENT_CAPACITY: usize = 16;

/// Mutable state of one link session.
#[derive(Debug)]
pub(crate) struct LinkInner {
    state: LinkState,
    qr: Option<String>,
    failure: Option<String>,
    attempt: u64,
    /// Whether the current attempt has issued at least one QR code.
    qr_issued: bool,
    updated_at: DateTime<Utc>,
}

impl LinkInner {
    pub(crate) fn new() -> Self {
        Self {
            state: LinkState::Unlinked,
            qr: None,
            failure: None,
            attempt: 0,
            qr_issued: false,
            updated_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Enter AwaitingScan for a fresh attempt and return its number.
    pub(crate) fn begin_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.state = LinkState::AwaitingScan;
        self.qr = None;
        self.failure = None;
        self.qr_issued = false;
        self.touch();
        self.attempt
    }

    fn link(&mut self) -> PushEvent {
        self.state = LinkState::Linked;
        self.qr = None;
        self.failure = None;
        self.touch();
        PushEvent::Ready
    }

    pub(crate) fn fail(&mut self, reason: &str) -> PushEvent {
        self.state = LinkState::Failed;
        self.qr = None;
        self.failure = Some(reason.to_string());
        self.touch();
        PushEvent::AuthFailure(reason.to_string())
    }

    fn reset(&mut self) {
        // Invalidate the running attempt so its late events are dropped.
        self.attempt += 1;
        self.state = LinkState::Unlinked;
        self.qr = None;
        self.failure = None;
        self.qr_issued = false;
        self.touch();
    }

    /// Apply a device event. Returns the push event to publish, if any.
    pub(crate) fn apply(&mut self, event: DeviceEvent) -> Option<PushEvent> {
        match (self.state, event) {
            (LinkState::AwaitingScan, DeviceEvent::Qr(code)) => {
                self.qr = Some(code.clone());
                self.qr_issued = true;
                self.touch();
                Some(PushEvent::Qr(code))
            }
            (LinkState::AwaitingScan, DeviceEvent::Paired) if self.qr_issued => Some(self.link()),
            // Stored credentials resume without a QR code.
            (LinkState::AwaitingScan, DeviceEvent::Connected) => Some(self.link()),
            (LinkState::AwaitingScan, DeviceEvent::AuthFailed(reason)) => Some(self.fail(&reason)),
            (LinkState::AwaitingScan | LinkState::Linked, DeviceEvent::LoggedOut) => {
                Some(self.fail("device was logged out"))
            }
            (state, event) => {
                debug!(%state, ?event, "device event ignored");
                None
            }
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    fn snapshot(&self, session_id: &str) -> LinkSnapshot {
        LinkSnapshot {
            session_id: session_id.to_string(),
            state: self.state,
            qr: self.qr.clone(),
            failure: self.failure.clone(),
            attempt: self.attempt,
            updated_at: self.updated_at,
        }
    }
}

/// A push-channel subscription: the state at subscription time plus every
/// event published after it. Dropping it (or calling `cancel`) unsubscribes.
pub struct Subscription {
    pub snapshot: LinkSnapshot,
    rx: broadcast::Receiver<PushEvent>,
}

impl Subscription {
    /// Wait for the next push event.
    pub async fn recv(&mut self) -> Result<PushEvent, broadcast::error::RecvError> {
        self.rx.recv().await
    }

    /// Stop receiving push events.
    pub fn cancel(self) {}
}

/// One device-link session.
pub struct LinkSession {
    id: String,
    device: Arc<dyn DeviceClient>,
    inner: Mutex<LinkInner>,
    events: broadcast::Sender<PushEvent>,
    qr_timeout: Duration,
    /// Single-slot guard: held for the whole duration of a bulk send.
    dispatch_slot: Arc<Mutex<()>>,
    /// Serialises device connect, disconnect and logout. Always taken
    /// before `inner`.
    lifecycle: Mutex<()>,
}

impl LinkSession {
    pub fn new(id: &str, device: Arc<dyn DeviceClient>, qr_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(PUSH_CAPACITY);
        Self {
            id: id.to_string(),
            device,
            inner: Mutex::new(LinkInner::new()),
            events,
            qr_timeout,
            dispatch_slot: Arc::new(Mutex::new(())),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &dyn DeviceClient {
        self.device.as_ref()
    }

    /// Current state of the session.
    pub async fn snapshot(&self) -> LinkSnapshot {
        self.inner.lock().await.snapshot(&self.id)
    }

    pub async fn is_linked(&self) -> bool {
        self.inner.lock().await.state() == LinkState::Linked
    }

    /// Subscribe to push events, atomically with a state snapshot.
    pub async fn subscribe(&self) -> Subscription {
        let inner = self.inner.lock().await;
        Subscription {
            snapshot: inner.snapshot(&self.id),
            rx: self.events.subscribe(),
        }
    }

    /// Must be called with the session lock held.
    fn publish(&self, event: PushEvent) {
        // No subscribers is fine: late subscribers reconcile via the snapshot.
        let receivers = self.events.send(event.clone()).unwrap_or(0);
        debug!(session = %self.id, ?event, receivers, "push event published");
    }

    /// Reserve the session's dispatch slot, or fail if a send is running.
    pub fn try_begin_dispatch(&self) -> Result<OwnedMutexGuard<()>, WasendError> {
        self.dispatch_slot
            .clone()
            .try_lock_owned()
            .map_err(|_| WasendError::DispatchBusy)
    }

    /// Start or resume device linking.
    ///
    /// The outcome of authentication arrives via push events; the return
    /// value only acknowledges that linking is under way. An error means
    /// the device client could not even be started.
    pub async fn initiate_link(self: &Arc<Self>) -> Result<LinkAck, WasendError> {
        let _lifecycle = self.lifecycle.lock().await;
        let attempt = {
            let mut inner = self.inner.lock().await;
            match inner.state() {
                LinkState::Linked => {
                    return Ok(self.ack("Device already linked", LinkState::Linked));
                }
                LinkState::AwaitingScan => {
                    if let Some(qr) = inner.qr.clone() {
                        self.publish(PushEvent::Qr(qr));
                    }
                    return Ok(self.ack(
                        "Device linking already in progress. Scan the QR code to authenticate.",
                        LinkState::AwaitingScan,
                    ));
                }
                LinkState::Unlinked | LinkState::Failed => inner.begin_attempt(),
            }
        };

        info!(session = %self.id, attempt, device = self.device.name(), "device linking started");

        let (tx, rx) = mpsc::channel(DEVICE_EVENT_CAPACITY);
        tokio::spawn(Arc::clone(self).pump(attempt, rx));
        tokio::spawn(Arc::clone(self).expire_attempt(attempt));

        if let Err(e) = self.device.connect(tx).await {
            let reason = match e {
                WasendError::Link(msg) => msg,
                other => other.to_string(),
            };
            warn!(session = %self.id, attempt, "device client failed to start: {reason}");
            let mut inner = self.inner.lock().await;
            if inner.attempt == attempt && inner.state() == LinkState::AwaitingScan {
                let event = inner.fail(&reason);
                self.publish(event);
            }
            return Err(WasendError::Link(reason));
        }

        let state = self.inner.lock().await.state();
        Ok(self.ack(
            "Device linking started. Scan the QR code to authenticate.",
            state,
        ))
    }

    /// Drop the link and delete the stored credentials.
    pub async fn unlink(&self) -> Result<LinkAck, WasendError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.inner.lock().await.reset();
        self.device.logout().await?;
        info!(session = %self.id, "device unlinked");
        Ok(self.ack("Device unlinked", LinkState::Unlinked))
    }

    fn ack(&self, message: &str, state: LinkState) -> LinkAck {
        LinkAck {
            message: message.to_string(),
            session: self.id.clone(),
            state,
        }
    }

    /// Forward device events of one attempt into the state machine.
    async fn pump(self: Arc<Self>, attempt: u64, mut rx: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = rx.recv().await {
            let mut inner = self.inner.lock().await;
            if inner.attempt != attempt {
                debug!(session = %self.id, attempt, "dropping device event from stale attempt");
                break;
            }
            let before = inner.state();
            if let Some(push) = inner.apply(event) {
                if before != inner.state() {
                    info!(session = %self.id, from = %before, to = %inner.state(), "link state changed");
                }
                self.publish(push);
            }
        }
    }

    /// Fail the attempt if it is still waiting for a scan after the timeout.
    ///
    /// The device is torn down before the lifecycle lock is released, so a
    /// relink requested right after the failure event connects afresh.
    async fn expire_attempt(self: Arc<Self>, attempt: u64) {
        tokio::time::sleep(self.qr_timeout).await;

        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut inner = self.inner.lock().await;
            if inner.attempt != attempt || inner.state() != LinkState::AwaitingScan {
                return;
            }
            warn!(session = %self.id, attempt, "QR code scan timed out");
            let event = inner.fail("QR code scan timed out");
            self.publish(event);
        }

        if let Err(e) = self.device.disconnect().await {
            warn!(session = %self.id, "device disconnect after timeout failed: {e}");
        }
    }
}
