//! Background Poller Module
//!
//! Keeps the cached status fresh: a periodic tick and advertisement sightings
//! both funnel into [`SmartMatic::connect_if_needed`]. Failures are logged,
//! never propagated, so the loop survives an unreachable device.

use crate::infrastructure::bluetooth::service::SmartMatic;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

pub struct BackgroundPoller {
    device: SmartMatic,
    task: Option<JoinHandle<()>>,
}

impl BackgroundPoller {
    /// Start polling every `period`. The first poll happens after one period.
    pub fn spawn(device: SmartMatic, period: Duration) -> Self {
        info!(
            "Polling {} every {:?}",
            device.identity(),
            period
        );

        let polled = device.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poll_once(&polled).await;
            }
        });

        Self {
            device,
            task: Some(task),
        }
    }

    /// The device was seen advertising; refresh opportunistically
    pub fn on_advertisement(&self) -> JoinHandle<()> {
        trace!("Advertisement from {}", self.device.identity());
        let device = self.device.clone();
        tokio::spawn(async move { poll_once(&device).await })
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Stopped polling {}", self.device.identity());
        }
    }
}

impl Drop for BackgroundPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn poll_once(device: &SmartMatic) {
    if !device.is_reachable().await {
        trace!("{} not in range, skipping poll", device.identity());
        return;
    }

    match device.connect_if_needed().await {
        Ok(true) => debug!("Refreshed {}", device.identity()),
        Ok(false) => trace!("{} is up to date", device.identity()),
        Err(e) => warn!("Background connect to {} failed: {}", device.identity(), e),
    }
}
