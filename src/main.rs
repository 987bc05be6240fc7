use anyhow::Context;
use smart_matic::domain::settings::SettingsService;
use smart_matic::infrastructure::bluetooth::btleplug_backend::BtleplugTransport;
use smart_matic::infrastructure::logging::init_logger;
use smart_matic::{BackgroundPoller, Event, EventKind, SmartMatic};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;

    info!("Starting Smart Matic daemon");
    if settings.address.is_empty() {
        anyhow::bail!(
            "No device address configured in {}",
            settings_service.path().display()
        );
    }

    let identity = settings.identity();
    let transport = Arc::new(
        BtleplugTransport::new()
            .await
            .context("Bluetooth adapter unavailable")?,
    );
    let device = SmartMatic::new(
        identity.clone(),
        transport.clone(),
        settings.session_config(),
    );

    device
        .events()
        .subscribe(EventKind::Connected, |_| async {
            info!("Device connected");
            anyhow::Ok(())
        });
    device
        .events()
        .subscribe(EventKind::Disconnected, |_| async {
            info!("Device disconnected");
            anyhow::Ok(())
        });
    device
        .events()
        .subscribe(EventKind::StatusUpdated, |event| async move {
            if let Event::StatusUpdated(status) = event {
                info!("Battery voltage: {:?} mV", status.battery_mv());
            }
            anyhow::Ok(())
        });

    if std::env::args().any(|arg| arg == "--trigger") {
        if let Err(e) = device.trigger().await {
            error!("Trigger failed: {}", e);
        }
    }

    let poller = Arc::new(BackgroundPoller::spawn(
        device.clone(),
        settings.poll_interval(),
    ));
    let watcher = {
        let poller = Arc::clone(&poller);
        transport
            .watch_advertisements(identity, move || {
                let _ = poller.on_advertisement();
            })
            .await?
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    watcher.abort();
    if let Err(e) = device.disconnect().await {
        warn!("Failed to disconnect cleanly: {}", e);
    }

    Ok(())
}
