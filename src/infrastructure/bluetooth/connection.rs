//! BLE Session Module
//!
//! Owns the link to the dispenser: serialized connects, command writes,
//! status request/response correlation and idle disconnection.

use crate::domain::models::{DeviceIdentity, DeviceStatus, Event, SessionState};
use crate::error::{ConnectError, Error, StatusError, TransportError};
use crate::infrastructure::bluetooth::protocol::{self, Command};
use crate::infrastructure::bluetooth::transport::{Link, LinkEvent, Transport};
use crate::infrastructure::event_bus::EventBus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause after the link is up so service enumeration can complete
    pub settle_delay: Duration,
    /// Upper bound for a status reply
    pub status_timeout: Duration,
    /// Quiet period before the link is dropped
    pub disconnect_delay: Duration,
    /// Service UUID the device must expose
    pub service_uuid: Uuid,
    /// Status notification characteristic UUID
    pub notify_char_uuid: Uuid,
    /// Command characteristic UUID
    pub write_char_uuid: Uuid,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            status_timeout: Duration::from_secs(30),
            disconnect_delay: Duration::from_secs(15),
            service_uuid: protocol::SERVICE_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
        }
    }
}

struct ActiveLink {
    generation: u64,
    link: Arc<dyn Link>,
}

struct IdleTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct SessionShared {
    state: SessionState,
    link: Option<ActiveLink>,
    device_status: Option<DeviceStatus>,
    pending_status: Option<oneshot::Sender<DeviceStatus>>,
    idle_timer: Option<IdleTimer>,
    next_generation: u64,
    next_timer_id: u64,
    connect_attempts: u64,
    last_connect_outcome: Option<Result<(), ConnectError>>,
}

struct Inner {
    identity: DeviceIdentity,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    events: EventBus,
    connect_lock: tokio::sync::Mutex<()>,
    status_lock: tokio::sync::Mutex<()>,
    shared: Mutex<SessionShared>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = shared.idle_timer.take() {
            timer.handle.abort();
        }
    }
}

/// Connection state machine for one Smart Matic device.
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct BleSession {
    inner: Arc<Inner>,
}

impl BleSession {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                transport,
                events: EventBus::new(),
                connect_lock: tokio::sync::Mutex::new(()),
                status_lock: tokio::sync::Mutex::new(()),
                shared: Mutex::new(SessionShared {
                    state: SessionState::Disconnected,
                    link: None,
                    device_status: None,
                    pending_status: None,
                    idle_timer: None,
                    next_generation: 0,
                    next_timer_id: 0,
                    connect_attempts: 0,
                    last_connect_outcome: None,
                }),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> SessionState {
        self.shared().state
    }

    /// Last decoded status, if any
    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.shared().device_status
    }

    /// True once the link is up, the service was verified and it has not dropped
    pub fn is_connected(&self) -> bool {
        let shared = self.shared();
        shared.state == SessionState::Ready
            && shared
                .link
                .as_ref()
                .is_some_and(|active| active.link.is_connected())
    }

    pub fn idle_disconnect_pending(&self) -> bool {
        self.shared().idle_timer.is_some()
    }

    /// Connect to the device.
    ///
    /// Attempts are serialized. A caller that had to wait for an attempt in
    /// flight gets that attempt's outcome instead of starting another one.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let seen_attempts = self.shared().connect_attempts;
        let _guard = self.inner.connect_lock.lock().await;

        {
            let shared = self.shared();
            if shared.connect_attempts != seen_attempts {
                if let Some(outcome) = &shared.last_connect_outcome {
                    debug!("Joined in-flight connect to {}", self.inner.identity);
                    return outcome.clone();
                }
            }
        }

        if self.is_connected() {
            return Ok(());
        }

        let outcome = self.establish().await;

        let mut shared = self.shared();
        shared.connect_attempts += 1;
        shared.last_connect_outcome = Some(outcome.clone());
        outcome
    }

    /// Connect only when no fresh status is cached. Returns whether a
    /// connection was attempted.
    pub async fn connect_if_needed(&self) -> Result<bool, ConnectError> {
        if self.device_status().is_some_and(|status| status.is_valid()) {
            trace!("Status of {} is fresh, not connecting", self.inner.identity);
            return Ok(false);
        }

        self.connect().await?;
        Ok(true)
    }

    /// Close the link. Returns false when there was nothing to close.
    ///
    /// The session state is cleared when the transport reports the drop.
    pub async fn disconnect(&self) -> Result<bool, TransportError> {
        let Some(link) = self.live_link() else {
            return Ok(false);
        };

        info!("Disconnecting from {}...", self.inner.identity);
        link.close().await?;
        Ok(true)
    }

    /// (Re)arm the idle-disconnect timer, replacing any armed one
    pub fn delayed_disconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.disconnect_delay;

        let mut shared = self.shared();
        shared.next_timer_id += 1;
        let id = shared.next_timer_id;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = Self::upgrade(&weak) {
                session.fire_idle_timer(id).await;
            }
        });

        if let Some(previous) = shared.idle_timer.replace(IdleTimer { id, handle }) {
            previous.handle.abort();
        }
        trace!("Idle disconnect armed for {:?}", delay);
    }

    /// Request a status frame and wait for it.
    ///
    /// Requests are serialized: a second caller waits until the first one
    /// got its reply or timed out.
    pub async fn get_device_status(&self) -> Result<(), StatusError> {
        let _guard = self.inner.status_lock.lock().await;
        let link = self.live_link().ok_or(StatusError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        self.shared().pending_status = Some(tx);

        debug!(
            ">> {}: {}",
            self.inner.config.write_char_uuid,
            protocol::to_hex(Command::StatusRequest.as_bytes())
        );
        if let Err(e) = link
            .write(
                self.inner.config.write_char_uuid,
                Command::StatusRequest.as_bytes(),
            )
            .await
        {
            self.shared().pending_status = None;
            return Err(e.into());
        }

        let timeout = self.inner.config.status_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => {
                debug!("Battery of {}: {:?} mV", self.inner.identity, status.battery_mv());
                self.delayed_disconnect();
                Ok(())
            }
            // Sender dropped: the link went away while waiting
            Ok(Err(_)) => Err(StatusError::NotConnected),
            Err(_) => {
                self.shared().pending_status = None;
                warn!(
                    "No status from {} within {:?}",
                    self.inner.identity, timeout
                );
                self.delayed_disconnect();
                Err(StatusError::Timeout(timeout))
            }
        }
    }

    /// Fire one spray, connecting first if needed (single attempt)
    pub async fn trigger(&self) -> Result<(), Error> {
        if !self.is_connected() {
            self.connect().await?;
        }

        let link = self.live_link().ok_or(TransportError::NotConnected)?;
        info!("Triggering {}", self.inner.identity);
        debug!(
            ">> {}: {}",
            self.inner.config.write_char_uuid,
            protocol::to_hex(Command::Trigger.as_bytes())
        );
        link.write(self.inner.config.write_char_uuid, Command::Trigger.as_bytes())
            .await?;

        self.delayed_disconnect();
        Ok(())
    }

    async fn establish(&self) -> Result<(), ConnectError> {
        self.discard_stale_link().await;
        self.shared().state = SessionState::Connecting;

        info!("Connecting to {}...", self.inner.identity);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = match self.inner.transport.open(&self.inner.identity, tx).await {
            Ok(link) => link,
            Err(e) => {
                debug!("Failed to connect to {}: {}", self.inner.identity, e);
                self.shared().state = SessionState::Disconnected;
                return Err(e.into());
            }
        };

        let generation = {
            let mut shared = self.shared();
            shared.next_generation += 1;
            let generation = shared.next_generation;
            shared.link = Some(ActiveLink {
                generation,
                link: Arc::clone(&link),
            });
            shared.state = SessionState::ServiceDiscovery;
            generation
        };
        self.spawn_event_pump(generation, rx);

        tokio::time::sleep(self.inner.config.settle_delay).await;

        if !self.is_current(generation) || !link.is_connected() {
            debug!("{} dropped during service discovery", self.inner.identity);
            return Err(TransportError::NotConnected.into());
        }

        let services = link.services();
        debug!("{} exposes {} service(s)", self.inner.identity, services.len());
        if !services.contains(&self.inner.config.service_uuid) {
            warn!(
                "{} does not expose service {}",
                self.inner.identity, self.inner.config.service_uuid
            );
            if let Err(e) = link.close().await {
                debug!("Failed to close unsupported device: {}", e);
            }
            return Err(ConnectError::UnsupportedDevice {
                address: self.inner.identity.address().to_string(),
            });
        }

        self.shared().state = SessionState::Ready;
        info!("Connected to {}", self.inner.identity);
        self.inner.events.publish(Event::Connected);

        // Some firmware rejects the CCCD write but notifies anyway
        if let Err(e) = link.subscribe(self.inner.config.notify_char_uuid).await {
            debug!("Ignoring notification subscription error: {}", e);
        }

        if let Err(e) = self.get_device_status().await {
            warn!("Initial status refresh of {} failed: {}", self.inner.identity, e);
            if let Err(close_err) = link.close().await {
                debug!("Failed to close silent device: {}", close_err);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Close a link left behind by an attempt that never reached `Ready`
    async fn discard_stale_link(&self) {
        let stale = self.shared().link.as_ref().map(|a| Arc::clone(&a.link));
        if let Some(link) = stale {
            debug!("Closing stale link to {}", self.inner.identity);
            if let Err(e) = link.close().await {
                trace!("Stale link close failed: {}", e);
            }
        }
    }

    fn spawn_event_pump(&self, generation: u64, mut rx: mpsc::UnboundedReceiver<LinkEvent>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = rx.recv().await;
                let Some(session) = Self::upgrade(&weak) else {
                    break;
                };
                match event {
                    Some(LinkEvent::Notification {
                        characteristic,
                        data,
                    }) => session.handle_notification(characteristic, &data),
                    Some(LinkEvent::Disconnected) | None => {
                        session.handle_disconnect(generation);
                        break;
                    }
                }
            }
        });
    }

    fn handle_notification(&self, characteristic: Uuid, data: &[u8]) {
        if characteristic != self.inner.config.notify_char_uuid {
            trace!("Ignoring notification from {}", characteristic);
            return;
        }
        debug!("<< {}: {}", characteristic, protocol::to_hex(data));

        let Some(status) = protocol::decode(data) else {
            return;
        };

        let waiter = {
            let mut shared = self.shared();
            shared.device_status = Some(status);
            shared.pending_status.take()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(status);
        }
        self.inner.events.publish(Event::StatusUpdated(status));
    }

    /// The only place a link is invalidated
    fn handle_disconnect(&self, generation: u64) {
        let timer = {
            let mut shared = self.shared();
            if !shared
                .link
                .as_ref()
                .is_some_and(|active| active.generation == generation)
            {
                trace!("Ignoring disconnect of superseded link {}", generation);
                return;
            }
            shared.link = None;
            shared.state = SessionState::Disconnected;
            shared.pending_status = None;
            shared.idle_timer.take()
        };

        if let Some(timer) = timer {
            timer.handle.abort();
        }

        info!("Disconnected from {}", self.inner.identity);
        self.inner.events.publish(Event::Disconnected);
    }

    async fn fire_idle_timer(&self, id: u64) {
        {
            let mut shared = self.shared();
            if !shared.idle_timer.as_ref().is_some_and(|timer| timer.id == id) {
                trace!("Idle timer {} was replaced or cancelled", id);
                return;
            }
            shared.idle_timer = None;
        }

        if self.live_link().is_none() {
            trace!("Link already dropped, skipping idle disconnect");
            return;
        }

        if let Err(e) = self.disconnect().await {
            debug!("Failed to disconnect. Error: {}", e);
        }
    }

    fn live_link(&self) -> Option<Arc<dyn Link>> {
        self.shared()
            .link
            .as_ref()
            .filter(|active| active.link.is_connected())
            .map(|active| Arc::clone(&active.link))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared()
            .link
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn shared(&self) -> MutexGuard<'_, SessionShared> {
        // Never held across an await; a poisoned guard still holds consistent data
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EventKind;
    use crate::infrastructure::bluetooth::fake::{status_frame, FakeTransport};
    use tokio::time::{sleep, Instant};

    fn session_with(fake: &FakeTransport) -> BleSession {
        session_with_config(fake, SessionConfig::default())
    }

    fn session_with_config(fake: &FakeTransport, config: SessionConfig) -> BleSession {
        BleSession::new(
            DeviceIdentity::new("aa:bb:cc:dd:ee:ff", "Hallway"),
            Arc::new(fake.clone()),
            config,
        )
    }

    fn record_events(session: &BleSession) -> Arc<Mutex<Vec<EventKind>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::StatusUpdated,
        ] {
            let log = log.clone();
            session.events().subscribe(kind, move |event| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(event.kind());
                    anyhow::Ok(())
                }
            });
        }
        log
    }

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_discovers_and_refreshes_status() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        let events = record_events(&session);

        let started = Instant::now();
        session.connect().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));

        assert!(session.is_connected());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(fake.opens(), 1);
        assert_eq!(fake.writes(), vec![protocol::encode_status_request().to_vec()]);
        assert_eq!(session.device_status().unwrap().battery_mv(), Some(5678));
        assert!(session.idle_disconnect_pending());

        settle().await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![EventKind::Connected, EventKind::StatusUpdated]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_when_connected_is_a_noop() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);

        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(fake.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);

        let (a, b) = tokio::join!(session.connect(), session.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(fake.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_failure() {
        let fake = FakeTransport::new();
        fake.set_fail_open(true);
        let session = session_with(&fake);

        let (a, b) = tokio::join!(session.connect(), session.connect());
        assert!(matches!(a, Err(ConnectError::Transport(TransportError::Open { .. }))));
        assert_eq!(a, b);
        assert_eq!(fake.opens(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);

        // A later call is a fresh attempt
        fake.set_fail_open(false);
        session.connect().await.unwrap();
        assert_eq!(fake.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_device_is_torn_down() {
        let fake = FakeTransport::new();
        fake.set_services(vec![Uuid::from_u128(0x180f)]);
        let session = session_with(&fake);
        let events = record_events(&session);

        let err = session.connect().await.unwrap_err();
        assert_eq!(
            err,
            ConnectError::UnsupportedDevice {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            }
        );
        assert_eq!(fake.closes(), 1);
        assert!(fake.writes().is_empty());

        settle().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert_eq!(*events.lock().unwrap(), vec![EventKind::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_error_is_swallowed() {
        let fake = FakeTransport::new();
        fake.set_fail_subscribe(true);
        let session = session_with(&fake);

        session.connect().await.unwrap();
        assert_eq!(session.device_status().unwrap().battery_mv(), Some(5678));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_when_not_connected() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);

        assert_eq!(session.disconnect().await, Ok(false));
        assert_eq!(session.disconnect().await, Ok(false));
        assert_eq!(fake.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_goes_through_transport_callback() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        let events = record_events(&session);
        session.connect().await.unwrap();

        assert_eq!(session.disconnect().await, Ok(true));
        assert!(!session.is_connected());
        settle().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.idle_disconnect_pending());
        assert_eq!(fake.closes(), 1);
        assert_eq!(events.lock().unwrap().last(), Some(&EventKind::Disconnected));
        assert_eq!(session.disconnect().await, Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_timeout_does_not_hang() {
        let fake = FakeTransport::new();
        let config = SessionConfig {
            disconnect_delay: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let session = session_with_config(&fake, config);
        session.connect().await.unwrap();

        fake.set_status_reply(None);
        let started = Instant::now();
        let err = session.get_device_status().await.unwrap_err();
        assert_eq!(err, StatusError::Timeout(Duration::from_secs(30)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(session.is_connected());

        // The idle timer still takes the silent link down
        assert!(session.idle_disconnect_pending());
        sleep(Duration::from_secs(61)).await;
        assert_eq!(fake.closes(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_when_first_status_times_out() {
        let fake = FakeTransport::new();
        fake.set_status_reply(None);
        let session = session_with(&fake);

        let err = session.connect().await.unwrap_err();
        assert_eq!(
            err,
            ConnectError::Status(StatusError::Timeout(Duration::from_secs(30)))
        );

        settle().await;
        assert_eq!(fake.closes(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.idle_disconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_device_status_requires_link() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);

        assert_eq!(
            session.get_device_status().await,
            Err(StatusError::NotConnected)
        );
        assert!(fake.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_write_clears_pending_request() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();

        fake.set_fail_write(true);
        let result = session.get_device_status().await;
        assert!(matches!(
            result,
            Err(StatusError::Transport(TransportError::Write { .. }))
        ));
        assert!(session.shared().pending_status.is_none());
        assert!(session.is_connected());

        // A later reply has nobody to satisfy but still updates the cache
        fake.notify(protocol::NOTIFY_CHAR_UUID, status_frame(4321));
        settle().await;
        assert_eq!(session.device_status().unwrap().battery_mv(), Some(4321));

        fake.set_fail_write(false);
        assert_eq!(session.get_device_status().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_status_requests_are_serialized() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();

        fake.set_reply_delay(Duration::from_secs(1));
        fake.clear_log();
        let (a, b) = tokio::join!(session.get_device_status(), session.get_device_status());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(
            fake.log(),
            vec!["write:status", "notify", "write:status", "notify"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_request_released_on_remote_disconnect() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();

        fake.set_status_reply(None);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.get_device_status().await })
        };
        settle().await;

        let started = Instant::now();
        fake.drop_link();
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(StatusError::NotConnected));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_disconnect_after_delay() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();

        sleep(Duration::from_secs(14)).await;
        assert!(session.is_connected());
        assert_eq!(fake.closes(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fake.closes(), 1);
        assert!(!session.is_connected());
        assert!(!session.idle_disconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_yields_single_disconnect() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();

        sleep(Duration::from_secs(5)).await;
        session.delayed_disconnect();
        session.delayed_disconnect();

        // The first timer would have fired here
        sleep(Duration::from_secs(11)).await;
        assert!(session.is_connected());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.closes(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_timer_does_not_disconnect() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();

        let stale = session.shared().idle_timer.as_ref().unwrap().id;
        session.delayed_disconnect();

        // A replaced timer that was already running when it got aborted
        session.fire_idle_timer(stale).await;
        assert!(session.is_connected());
        assert!(session.idle_disconnect_pending());
        assert_eq!(fake.closes(), 0);

        sleep(Duration::from_secs(16)).await;
        assert_eq!(fake.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_disconnect_cancels_idle_timer() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        let events = record_events(&session);
        session.connect().await.unwrap();
        assert!(session.idle_disconnect_pending());

        fake.drop_link();
        settle().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.idle_disconnect_pending());
        assert_eq!(events.lock().unwrap().last(), Some(&EventKind::Disconnected));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(fake.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_connects_once_and_writes_command() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);

        session.trigger().await.unwrap();
        assert_eq!(fake.opens(), 1);
        assert_eq!(
            fake.writes(),
            vec![
                protocol::encode_status_request().to_vec(),
                protocol::encode_trigger().to_vec(),
            ]
        );
        assert!(session.idle_disconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_surfaces_connect_failure() {
        let fake = FakeTransport::new();
        fake.set_fail_open(true);
        let session = session_with(&fake);

        let err = session.trigger().await.unwrap_err();
        assert!(matches!(err, Error::Connect(ConnectError::Transport(_))));
        assert_eq!(fake.opens(), 1);
        assert!(fake.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_if_needed_respects_fresh_status() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);

        assert_eq!(session.connect_if_needed().await, Ok(true));
        assert_eq!(fake.opens(), 1);

        // Idle disconnect drops the link, the cached status stays fresh
        sleep(Duration::from_secs(20)).await;
        assert!(!session.is_connected());
        assert_eq!(session.connect_if_needed().await, Ok(false));
        assert_eq!(fake.opens(), 1);

        sleep(Duration::from_secs(61 * 60)).await;
        assert_eq!(session.connect_if_needed().await, Ok(true));
        assert_eq!(fake.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognized_notifications_are_ignored() {
        let fake = FakeTransport::new();
        let session = session_with(&fake);
        session.connect().await.unwrap();
        let before = session.device_status();

        fake.notify(protocol::NOTIFY_CHAR_UUID, vec![0x01, 0x02]);
        fake.notify(protocol::WRITE_CHAR_UUID, status_frame(1234));
        settle().await;
        assert_eq!(session.device_status(), before);

        fake.notify(protocol::NOTIFY_CHAR_UUID, status_frame(1234));
        settle().await;
        assert_eq!(session.device_status().unwrap().battery_mv(), Some(1234));
    }
}
