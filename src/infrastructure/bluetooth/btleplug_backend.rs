//! btleplug Backend Module
//!
//! [`Transport`] implementation backed by the host's first Bluetooth adapter.

use crate::domain::models::DeviceIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{Link, LinkEvent, LinkEventSender, Transport};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// BLE transport over btleplug
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Take the first adapter and start a passive scan so peripherals show up
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(adapter_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(adapter_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Open {
                address: String::new(),
                reason: "no Bluetooth adapter found".to_string(),
            })?;

        info!(
            "Using adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(adapter_error)?;

        Ok(Self { adapter })
    }

    async fn find(&self, identity: &DeviceIdentity) -> Result<Option<Peripheral>, btleplug::Error> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral
                .address()
                .to_string()
                .eq_ignore_ascii_case(identity.address())
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Call `on_seen` whenever the device advertises
    pub async fn watch_advertisements<F>(
        &self,
        identity: DeviceIdentity,
        on_seen: F,
    ) -> Result<JoinHandle<()>, TransportError>
    where
        F: Fn() + Send + 'static,
    {
        let mut events = self.adapter.events().await.map_err(adapter_error)?;
        let adapter = self.adapter.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if peripheral
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(identity.address())
                {
                    trace!("Advertisement from {}", identity);
                    on_seen();
                }
            }
        }))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        events: LinkEventSender,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let open_error = |reason: String| TransportError::Open {
            address: identity.address().to_string(),
            reason,
        };

        let peripheral = self
            .find(identity)
            .await
            .map_err(|e| open_error(e.to_string()))?
            .ok_or_else(|| open_error("device not seen by the adapter".to_string()))?;

        peripheral
            .connect()
            .await
            .map_err(|e| open_error(e.to_string()))?;

        // Everything fallible after connect runs before any task is spawned
        let streams = async {
            peripheral.discover_services().await?;
            let notifications = peripheral.notifications().await?;
            let central = self.adapter.events().await?;
            Ok::<_, btleplug::Error>((notifications, central))
        }
        .await;
        let (mut notifications, mut central) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                if let Err(close) = peripheral.disconnect().await {
                    debug!("Failed to drop half-open link: {}", close);
                }
                return Err(open_error(e.to_string()));
            }
        };

        let connected = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::with_capacity(2);

        let tx = events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let _ = tx.send(LinkEvent::Notification {
                    characteristic: notification.uuid,
                    data: notification.value,
                });
            }
        }));

        let id = peripheral.id();
        let tx = events.clone();
        let flag = Arc::clone(&connected);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = central.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        if flag.swap(false, Ordering::SeqCst) {
                            let _ = tx.send(LinkEvent::Disconnected);
                        }
                        break;
                    }
                }
            }
        }));

        let link: Arc<dyn Link> = Arc::new(BtleplugLink {
            peripheral,
            connected,
            events,
            tasks: Mutex::new(tasks),
        });
        Ok(link)
    }

    async fn is_reachable(&self, identity: &DeviceIdentity) -> bool {
        matches!(self.find(identity).await, Ok(Some(_)))
    }
}

struct BtleplugLink {
    peripheral: Peripheral,
    connected: Arc<AtomicBool>,
    events: LinkEventSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(LinkEvent::Disconnected);
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Link for BtleplugLink {
    fn services(&self) -> Vec<Uuid> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| service.uuid)
            .collect()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let write_error = |reason: String| TransportError::Write {
            characteristic,
            reason,
        };
        let target = self
            .characteristic(characteristic)
            .ok_or_else(|| write_error("characteristic not found".to_string()))?;

        self.peripheral
            .write(&target, data, WriteType::WithResponse)
            .await
            .map_err(|e| write_error(e.to_string()))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let subscribe_error = |reason: String| TransportError::Subscribe {
            characteristic,
            reason,
        };
        let target = self
            .characteristic(characteristic)
            .ok_or_else(|| subscribe_error("characteristic not found".to_string()))?;

        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| subscribe_error(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Closing link to {}", self.peripheral.address());
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))?;
        self.mark_disconnected();
        Ok(())
    }
}

fn adapter_error(e: btleplug::Error) -> TransportError {
    TransportError::Open {
        address: String::new(),
        reason: e.to_string(),
    }
}
