use anyhow::{Context, Result};
use clockface_hw::V4l2Source;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod camera_feed;
mod config;
mod dbus_interface;
mod detection;
mod employee;
mod extractor;
mod kiosk;
mod session;
mod store;
#[cfg(test)]
mod testing;

const BUS_NAME: &str = "io.clockface.Kiosk1";
const OBJECT_PATH: &str = "/io/clockface/Kiosk1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("clockfaced starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        width = config.capture.width,
        height = config.capture.height,
        store = %config.store_url,
        extractor = %config.extractor_url,
        threshold = config.session.match_threshold,
        "configuration loaded"
    );

    let extractor = extractor::HttpExtractor::new(
        &config.extractor_url,
        config.descriptor_len,
        config.http_timeout(),
    )
    .context("building extractor client")?;
    let store = store::HttpStore::new(
        &config.store_url,
        config.api_key.clone(),
        config.descriptor_len,
        config.http_timeout(),
    )
    .context("building store client")?;

    // The camera is opened per session, not at startup.
    let kiosk = kiosk::spawn_kiosk(
        kiosk::Collaborators {
            camera: Arc::new(V4l2Source::new(config.camera_device.clone())),
            extractor: Arc::new(extractor),
            store: Arc::new(store),
        },
        config.session.clone(),
        config.capture,
    );

    let service = dbus_interface::KioskService {
        kiosk: kiosk.clone(),
        camera_device: config.camera_device.clone(),
        store_url: config.store_url.clone(),
    };
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the D-Bus"))?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        "clockfaced ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("clockfaced shutting down");
    if let Err(e) = kiosk.shutdown().await {
        tracing::warn!(error = %e, "kiosk did not shut down cleanly");
    }

    Ok(())
}
