//! Scriptable in-memory transport used by the session tests.

use crate::domain::models::DeviceIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{self, Command};
use crate::infrastructure::bluetooth::transport::{Link, LinkEvent, LinkEventSender, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// A 99-byte status frame carrying `battery_mv`
pub(crate) fn status_frame(battery_mv: u32) -> Vec<u8> {
    let mut frame = vec![0u8; protocol::STATUS_FRAME_LEN];
    frame[protocol::BATTERY_MV_OFFSET..protocol::BATTERY_MV_OFFSET + 4]
        .copy_from_slice(&battery_mv.to_be_bytes());
    frame
}

struct FakeState {
    services: Vec<Uuid>,
    fail_open: bool,
    fail_subscribe: bool,
    fail_write: bool,
    reachable: bool,
    status_reply: Option<Vec<u8>>,
    reply_delay: Duration,
    open_delay: Duration,
    opens: usize,
    closes: usize,
    writes: Vec<Vec<u8>>,
    log: Vec<&'static str>,
    current: Option<Arc<FakeLink>>,
}

#[derive(Clone)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                services: vec![protocol::SERVICE_UUID],
                fail_open: false,
                fail_subscribe: false,
                fail_write: false,
                reachable: true,
                status_reply: Some(status_frame(5678)),
                reply_delay: Duration::ZERO,
                open_delay: Duration::from_millis(50),
                opens: 0,
                closes: 0,
                writes: Vec::new(),
                log: Vec::new(),
                current: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_services(&self, services: Vec<Uuid>) {
        self.lock().services = services;
    }

    pub(crate) fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub(crate) fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub(crate) fn set_fail_write(&self, fail: bool) {
        self.lock().fail_write = fail;
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub(crate) fn set_status_reply(&self, reply: Option<Vec<u8>>) {
        self.lock().status_reply = reply;
    }

    pub(crate) fn set_reply_delay(&self, delay: Duration) {
        self.lock().reply_delay = delay;
    }

    pub(crate) fn opens(&self) -> usize {
        self.lock().opens
    }

    pub(crate) fn closes(&self) -> usize {
        self.lock().closes
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub(crate) fn log(&self) -> Vec<&'static str> {
        self.lock().log.clone()
    }

    pub(crate) fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Push a notification on the current link
    pub(crate) fn notify(&self, characteristic: Uuid, data: Vec<u8>) {
        if let Some(link) = self.lock().current.clone() {
            link.send(LinkEvent::Notification {
                characteristic,
                data,
            });
        }
    }

    /// Simulate the peripheral going away
    pub(crate) fn drop_link(&self) {
        if let Some(link) = self.lock().current.take() {
            link.drop_connection();
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        _identity: &DeviceIdentity,
        events: LinkEventSender,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let delay = self.lock().open_delay;
        tokio::time::sleep(delay).await;

        let mut state = self.lock();
        state.opens += 1;
        if state.fail_open {
            return Err(TransportError::Open {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                reason: "peripheral not found".to_string(),
            });
        }

        let link = Arc::new(FakeLink {
            connected: AtomicBool::new(true),
            events,
            services: state.services.clone(),
            state: Arc::clone(&self.state),
        });
        state.current = Some(Arc::clone(&link));
        Ok(link as Arc<dyn Link>)
    }

    async fn is_reachable(&self, _identity: &DeviceIdentity) -> bool {
        self.lock().reachable
    }
}

pub(crate) struct FakeLink {
    connected: AtomicBool,
    events: LinkEventSender,
    services: Vec<Uuid>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeLink {
    fn send(&self, event: LinkEvent) {
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    fn drop_connection(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            let _ = self.events.send(LinkEvent::Disconnected);
        }
        was_connected
    }
}

#[async_trait]
impl Link for FakeLink {
    fn services(&self) -> Vec<Uuid> {
        self.services.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let reply = {
            let mut state = self.state.lock().unwrap();
            if state.fail_write {
                return Err(TransportError::Write {
                    characteristic,
                    reason: "ATT write rejected".to_string(),
                });
            }
            state.writes.push(data.to_vec());
            if data == Command::StatusRequest.as_bytes() {
                state.log.push("write:status");
                state.status_reply.clone().map(|r| (r, state.reply_delay))
            } else {
                state.log.push("write:trigger");
                None
            }
        };

        if let Some((frame, delay)) = reply {
            let events = self.events.clone();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                state.lock().unwrap().log.push("notify");
                let _ = events.send(LinkEvent::Notification {
                    characteristic: protocol::NOTIFY_CHAR_UUID,
                    data: frame,
                });
            });
        }

        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if self.state.lock().unwrap().fail_subscribe {
            return Err(TransportError::Subscribe {
                characteristic,
                reason: "no client characteristic configuration descriptor".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.drop_connection() {
            return Err(TransportError::NotConnected);
        }
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.current = None;
        Ok(())
    }
}
