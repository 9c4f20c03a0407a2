//! Mobile client: tracks the endpoint list broadcast by the stem and polls readings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arbor_core::{AvailableEndpoints, Identity, Message, Packet, SensorDataRequest};
use arbor_net::{BroadcastHandler, Leaf, LeafError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn on_broadcast(known: &Mutex<AvailableEndpoints>, packet: Packet) {
    match packet.into_message() {
        Message::AvailableEndpoints(endpoints) => {
            info!("{} endpoint(s) available", endpoints.len());
            for (id, name) in endpoints.iter() {
                debug!("  {}: {}", id, name);
            }
            *known.lock() = endpoints;
        }
        other => debug!(opcode = ?other.opcode(), "ignoring broadcast"),
    }
}

pub async fn run_mobile(config: &Config) -> anyhow::Result<()> {
    let known = Arc::new(Mutex::new(AvailableEndpoints::new()));
    let handler: Arc<dyn BroadcastHandler> = {
        let known = known.clone();
        Arc::new(move |packet: Packet| on_broadcast(&known, packet))
    };
    let leaf_config = config.leaf_config();
    let reply_timeout = leaf_config.registration_timeout;
    let leaf = Leaf::start(Identity::MobileUser, leaf_config, Some(handler))
        .await
        .context("cannot bind mobile socket")?;
    leaf.wait_registration().await?;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let target = known.lock().iter().next().map(|(id, _)| id);
        let request = match target {
            Some(id) => SensorDataRequest::for_endpoint(id),
            None => SensorDataRequest::any(),
        };
        leaf.send(&Packet::new(request)).await?;

        match leaf.receive_timeout(reply_timeout).await {
            Ok(Some(reply)) => match reply.message() {
                Message::SensorData(data) => info!("Latest readings: {}", data),
                Message::GenericError(e) => warn!("stem refused request: {}", e),
                other => warn!(opcode = ?other.opcode(), "unexpected reply"),
            },
            Ok(None) => warn!("no reply within {:?}", reply_timeout),
            Err(LeafError::Transport(e)) if e.is_corrupt() => warn!("{}", e),
            Err(e) => return Err(e.into()),
        }
    }
}
