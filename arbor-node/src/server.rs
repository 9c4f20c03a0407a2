use std::sync::Arc;

use arbor_core::Identity;
use arbor_net::Stem;

use crate::accounts::AccountRegistry;
use crate::config::Config;
use crate::handlers::{MobileHandler, ReadingStore, SensorHandler};

/// Runs the stem until Ctrl+C or SIGTERM.
pub async fn run_stem(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(ReadingStore::default());
    let stem = Stem::builder(config.stem_config())
        .handler(
            Identity::SensorEndpoint,
            Arc::new(SensorHandler::new(store.clone())),
        )
        .handler(Identity::MobileUser, Arc::new(MobileHandler::new(store)))
        .account_resolver(Identity::SensorEndpoint, Arc::new(AccountRegistry::new()))
        .start()
        .await?;

    crate::shutdown_signal().await?;
    stem.shutdown().await;
    Ok(())
}
