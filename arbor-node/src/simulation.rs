//! Simulated sensor endpoint: sinusoidal readings around random baselines, one report per second.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use anyhow::Context;
use arbor_core::{Identity, Message, Packet, SensorData, SensorId};
use arbor_net::{Leaf, LeafError};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::Config;

const AMPLITUDE_MAX: f64 = 3.0;
const CYCLE_MAX_SECS: f64 = 30.0;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

const START_VALUES: [(SensorId, f64); 4] = [
    (SensorId::AirHumidity, 60.0),
    (SensorId::AirTemperature, 25.0),
    (SensorId::SoilMoisture, 40.0),
    (SensorId::LightIntensity, 700.0),
];

pub struct Simulation {
    amplitude: f64,
    cycle_secs: f64,
    baselines: Vec<(SensorId, f64)>,
}

impl Simulation {
    pub fn new(rng: &mut impl Rng) -> Self {
        let amplitude = rng.gen::<f64>() * AMPLITUDE_MAX;
        let cycle_secs = rng.gen_range(1.0..CYCLE_MAX_SECS);
        let baselines = START_VALUES
            .iter()
            .map(|&(id, start)| (id, start * rng.gen::<f64>().max(rng.gen::<f64>())))
            .collect();
        Self {
            amplitude,
            cycle_secs,
            baselines,
        }
    }

    pub fn reading_at(&self, elapsed: Duration) -> SensorData {
        let phase = 2.0 * PI * elapsed.as_secs_f64() / self.cycle_secs;
        let offset = self.amplitude * phase.sin();
        let mut data = SensorData::new();
        for &(id, baseline) in &self.baselines {
            data.set(id, baseline + offset);
        }
        data
    }
}

pub async fn run_sensor(config: &Config) -> anyhow::Result<()> {
    let leaf_config = config.leaf_config();
    let reply_timeout = leaf_config.registration_timeout;
    let leaf = Leaf::start(Identity::SensorEndpoint, leaf_config, None)
        .await
        .context("cannot bind sensor socket")?;
    let worker = leaf.wait_registration().await?;
    info!("Starting sensor endpoint simulation, served by {}", worker);

    let simulation = Simulation::new(&mut rand::thread_rng());
    let started = Instant::now();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        let data = simulation.reading_at(started.elapsed());
        info!("Sending sensor data: {}", data);
        leaf.send(&Packet::new(data)).await?;

        match leaf.receive_timeout(reply_timeout).await {
            Ok(Some(reply)) => match reply.message() {
                Message::Acknowledgement(_) => debug!("readings acknowledged"),
                other => warn!(opcode = ?other.opcode(), "expected an acknowledgement"),
            },
            Ok(None) => warn!("no acknowledgement within {:?}", reply_timeout),
            Err(LeafError::Transport(e)) if e.is_corrupt() => warn!("{}", e),
            Err(e) => return Err(e.into()),
        }
    }
}
