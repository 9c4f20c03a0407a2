use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{
    Acknowledgement, ErrorCode, GenericError, Identity, Message, Packet, SensorData,
    SensorDataRequest, SensorId,
};
use arbor_net::{
    Account, AccountError, AccountResolver, BroadcastHandler, Leaf, LeafConfig, PacketHandler,
    Stem, StemConfig,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Keeps the last reading and answers mobile requests with it.
#[derive(Default)]
struct Greenhouse {
    latest: Mutex<Option<SensorData>>,
}

struct SensorSide(Arc<Greenhouse>);
struct MobileSide(Arc<Greenhouse>);

impl PacketHandler for SensorSide {
    fn handle(&self, _account: Option<&Account>, packet: &Packet) -> Option<Packet> {
        match packet.message() {
            Message::SensorData(data) => {
                *self.0.latest.lock() = Some(data.clone());
                Some(Packet::new(Acknowledgement))
            }
            _ => Some(Packet::new(GenericError::new(
                ErrorCode::WrongPacket,
                "expected sensor data",
            ))),
        }
    }
}

impl PacketHandler for MobileSide {
    fn handle(&self, _account: Option<&Account>, packet: &Packet) -> Option<Packet> {
        match packet.message() {
            Message::SensorDataRequest(_) => {
                let latest = self.0.latest.lock().clone().unwrap_or_default();
                Some(Packet::new(latest))
            }
            _ => None,
        }
    }
}

fn leaf_config(stem: &Stem) -> LeafConfig {
    LeafConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        registration_timeout: Duration::from_millis(500),
        ..LeafConfig::new(stem.local_location())
    }
}

#[tokio::test]
async fn sensor_reports_and_mobile_reads_back() {
    let store = Arc::new(Greenhouse::default());
    let resolver: Arc<dyn AccountResolver> =
        Arc::new(|_: IpAddr| -> Result<Account, AccountError> { Ok(Account::new(3, "bed-3")) });
    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let stem = Stem::builder(StemConfig {
        endpoints_interval: Some(Duration::from_millis(100)),
        ..StemConfig::new(listen)
    })
    .handler(Identity::SensorEndpoint, Arc::new(SensorSide(store.clone())))
    .handler(Identity::MobileUser, Arc::new(MobileSide(store.clone())))
    .account_resolver(Identity::SensorEndpoint, resolver)
    .start()
    .await
    .unwrap();

    let sensor = Leaf::start(Identity::SensorEndpoint, leaf_config(&stem), None)
        .await
        .unwrap();
    sensor.wait_registration().await.unwrap();

    let mut reading = SensorData::new();
    reading.set(SensorId::SoilMoisture, 0.42);
    sensor.send(&Packet::new(reading.clone())).await.unwrap();
    let ack = sensor.receive().await.unwrap();
    assert_eq!(ack.message(), &Message::from(Acknowledgement));

    let (tx, mut broadcasts) = mpsc::unbounded_channel();
    let on_broadcast: Arc<dyn BroadcastHandler> = Arc::new(move |packet: Packet| {
        let _ = tx.send(packet);
    });
    let mobile = Leaf::start(Identity::MobileUser, leaf_config(&stem), Some(on_broadcast))
        .await
        .unwrap();
    mobile.wait_registration().await.unwrap();

    mobile
        .send(&Packet::new(SensorDataRequest::for_endpoint(3)))
        .await
        .unwrap();
    let reply = mobile.receive().await.unwrap();
    assert_eq!(reply.message(), &Message::from(reading));

    // Broadcasts only reach the handler while the leaf is receiving.
    let announced = async {
        loop {
            if let Ok(Some(packet)) = mobile.receive_timeout(Duration::from_millis(50)).await {
                panic!("unexpected unicast {:?}", packet);
            }
            if let Ok(packet) = broadcasts.try_recv() {
                return packet;
            }
        }
    };
    let announced = tokio::time::timeout(Duration::from_secs(3), announced)
        .await
        .expect("mobile user should hear the endpoint list");
    assert!(announced.is_broadcast());
    match announced.message() {
        Message::AvailableEndpoints(endpoints) => {
            assert_eq!(endpoints.get(3), Some("bed-3"));
            assert_eq!(endpoints.len(), 1);
        }
        other => panic!("unexpected broadcast {:?}", other),
    }

    sensor.close();
    mobile.close();
    stem.shutdown().await;
}

#[tokio::test]
async fn silent_sensor_is_pruned_and_can_register_again() {
    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let stem = Stem::builder(StemConfig {
        prune_interval: Duration::from_millis(50),
        prune_threshold: Duration::from_millis(200),
        endpoints_interval: None,
        ..StemConfig::new(listen)
    })
    .start()
    .await
    .unwrap();

    let sensor = Leaf::start(Identity::SensorEndpoint, leaf_config(&stem), None)
        .await
        .unwrap();
    sensor.wait_registration().await.unwrap();
    let location = sensor.local_location().unwrap();
    assert!(stem.is_known_peer(location).await);

    let gone = async {
        while stem.is_known_peer(location).await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), gone)
        .await
        .expect("silent sensor should be pruned");

    stem.register_peer(location, Identity::SensorEndpoint)
        .await
        .unwrap();
    assert!(stem.is_known_peer(location).await);
    stem.shutdown().await;
}
