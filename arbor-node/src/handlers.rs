//! Stem-side request handling: sensors report readings, mobile users read them back.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_core::{
    Acknowledgement, EndpointId, ErrorCode, GenericError, Message, Packet, SensorData,
};
use arbor_net::{Account, PacketHandler};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Latest readings per endpoint.
#[derive(Default)]
pub struct ReadingStore {
    inner: RwLock<Readings>,
}

#[derive(Default)]
struct Readings {
    latest: BTreeMap<EndpointId, SensorData>,
    last_reported: Option<EndpointId>,
}

impl ReadingStore {
    pub fn record(&self, endpoint: EndpointId, data: SensorData) {
        let mut readings = self.inner.write();
        readings.latest.insert(endpoint, data);
        readings.last_reported = Some(endpoint);
    }

    /// Latest readings of `endpoint`, or of whichever endpoint reported last.
    pub fn latest(&self, endpoint: Option<EndpointId>) -> Option<SensorData> {
        let readings = self.inner.read();
        let endpoint = endpoint.or(readings.last_reported)?;
        readings.latest.get(&endpoint).cloned()
    }
}

fn wrong_packet(expected: &str) -> Option<Packet> {
    Some(Packet::new(GenericError::new(
        ErrorCode::WrongPacket,
        format!("Expected a {} packet.", expected),
    )))
}

/// Handler for the sensor branch.
pub struct SensorHandler {
    store: Arc<ReadingStore>,
}

impl SensorHandler {
    pub fn new(store: Arc<ReadingStore>) -> Self {
        Self { store }
    }
}

impl PacketHandler for SensorHandler {
    fn handle(&self, account: Option<&Account>, packet: &Packet) -> Option<Packet> {
        let Message::SensorData(data) = packet.message() else {
            return wrong_packet("sensor data");
        };
        match account {
            Some(account) => {
                info!("{} reported {}", account.name, data);
                self.store.record(account.id, data.clone());
            }
            None => warn!("dropping readings from an endpoint without account"),
        }
        Some(Packet::new(Acknowledgement))
    }
}

/// Handler for the mobile branch.
pub struct MobileHandler {
    store: Arc<ReadingStore>,
}

impl MobileHandler {
    pub fn new(store: Arc<ReadingStore>) -> Self {
        Self { store }
    }
}

impl PacketHandler for MobileHandler {
    fn handle(&self, _account: Option<&Account>, packet: &Packet) -> Option<Packet> {
        let Message::SensorDataRequest(request) = packet.message() else {
            return wrong_packet("sensor data request");
        };
        // An endpoint that never reported answers with the -1 sentinels.
        let data = self.store.latest(request.target).unwrap_or_default();
        Some(Packet::new(data))
    }
}
