use anyhow::{Context, Result};
use faceguard_core::DetectorHandle;
use faceguard_store::CredentialStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod feed;
mod guard;

use config::Config;
use dbus_interface::GuardService;
use feed::FeedDetector;
use guard::Guard;

const BUS_NAME: &str = "org.faceguard.Guard1";
const OBJECT_PATH: &str = "/org/faceguard/Guard1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceguardd starting");

    let config = Config::load()?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = CredentialStore::open(&config.db_path, config.store_key())?;
    tracing::info!(
        db = %config.db_path.display(),
        registered = store.is_registered(),
        "credential store opened"
    );

    let detector = DetectorHandle::new(FeedDetector::new(
        config.feed_path.clone(),
        config.feed_max_age(),
        config.descriptor_dimension,
    ));
    let guard = Arc::new(Guard::new(store, detector, &config));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, GuardService::new(Arc::clone(&guard)))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "faceguardd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceguardd shutting down");
    guard.stop_protection().await;

    Ok(())
}
