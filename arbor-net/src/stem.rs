//! The server: a listener on the well-known port plus one branch per role.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::wire::encode_frame;
use arbor_core::{
    AvailableEndpoints, ErrorCode, GenericError, Identity, Message, NodeLocation, Packet,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::branch::{Branch, BranchError, BranchHooks};
use crate::hooks::{AccountResolver, PacketHandler, Silent};
use crate::prune::{spawn_pruning, DEFAULT_PRUNE_INTERVAL, DEFAULT_PRUNE_THRESHOLD};
use crate::transport::{Transport, TransportError};
use crate::worker::Worker;

pub const DEFAULT_STEM_PORT: u16 = 3010;
pub const DEFAULT_ENDPOINTS_INTERVAL: Duration = Duration::from_millis(5000);

pub const ALREADY_REGISTERED_MESSAGE: &str = "You are already registered with the server.";
pub const WRONG_PACKET_MESSAGE: &str = "Only registration requests are accepted on this port.";

#[derive(Debug, thiserror::Error)]
pub enum StemError {
    #[error("cannot bind stem listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct StemConfig {
    pub listen: SocketAddr,
    /// Where worker sockets are bound. Defaults to the listener's IP.
    pub worker_address: IpAddr,
    pub prune_interval: Duration,
    pub prune_threshold: Duration,
    /// Period of the available-endpoints broadcast to mobile users. `None` disables it.
    pub endpoints_interval: Option<Duration>,
}

impl StemConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            worker_address: listen.ip(),
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            endpoints_interval: Some(DEFAULT_ENDPOINTS_INTERVAL),
        }
    }
}

impl Default for StemConfig {
    fn default() -> Self {
        Self::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            DEFAULT_STEM_PORT,
        ))
    }
}

#[derive(Default)]
struct RoleHooks {
    handler: Option<Arc<dyn PacketHandler>>,
    resolver: Option<Arc<dyn AccountResolver>>,
}

pub struct StemBuilder {
    config: StemConfig,
    roles: HashMap<Identity, RoleHooks>,
}

impl StemBuilder {
    pub fn new(config: StemConfig) -> Self {
        Self {
            config,
            roles: HashMap::new(),
        }
    }

    /// Request handler for leaves registered as `identity`. Roles without one never reply.
    pub fn handler(mut self, identity: Identity, handler: Arc<dyn PacketHandler>) -> Self {
        self.roles.entry(identity).or_default().handler = Some(handler);
        self
    }

    pub fn account_resolver(
        mut self,
        identity: Identity,
        resolver: Arc<dyn AccountResolver>,
    ) -> Self {
        self.roles.entry(identity).or_default().resolver = Some(resolver);
        self
    }

    /// Binds the listener and starts the branches, their pruning and the listener loop.
    pub async fn start(mut self) -> Result<Stem, StemError> {
        let listen = self.config.listen;
        let bind_err = |source| StemError::Bind {
            address: listen,
            source,
        };
        let transport = Transport::bind(listen).await.map_err(bind_err)?;
        let local = transport.local_location().map_err(bind_err)?;
        let transport = Arc::new(transport);

        let mut branch_for = |identity: Identity| {
            let role = self.roles.remove(&identity).unwrap_or_default();
            let mut hooks = BranchHooks::new(role.handler.unwrap_or_else(|| Arc::new(Silent)));
            hooks.resolver = role.resolver;
            Branch::spawn(identity.to_string(), hooks, self.config.worker_address)
        };
        let branches = Branches {
            sensors: branch_for(Identity::SensorEndpoint),
            mobiles: branch_for(Identity::MobileUser),
        };

        let mut tasks = Vec::new();
        for branch in [&branches.sensors, &branches.mobiles] {
            tasks.push(spawn_pruning(
                branch.clone(),
                self.config.prune_interval,
                self.config.prune_threshold,
            ));
        }
        tasks.push(tokio::spawn(listen_loop(transport.clone(), branches.clone())));
        if let Some(interval) = self.config.endpoints_interval {
            tasks.push(tokio::spawn(announce_endpoints(branches.clone(), interval)));
        }

        info!("stem listening on {}", local);
        Ok(Stem {
            transport,
            branches,
            local,
            tasks,
        })
    }
}

#[derive(Clone)]
struct Branches {
    sensors: Branch,
    mobiles: Branch,
}

impl Branches {
    fn get(&self, identity: Identity) -> &Branch {
        match identity {
            Identity::SensorEndpoint => &self.sensors,
            Identity::MobileUser => &self.mobiles,
        }
    }

    async fn is_known_peer(&self, location: NodeLocation) -> bool {
        for branch in [&self.sensors, &self.mobiles] {
            if branch.contains(location).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    async fn available_endpoints(&self) -> Result<AvailableEndpoints, BranchError> {
        let mut endpoints = AvailableEndpoints::new();
        for worker in self.sensors.workers().await? {
            if let Some(account) = worker.account() {
                endpoints.insert(account.id, account.name.clone());
            }
        }
        Ok(endpoints)
    }
}

/// A running server.
pub struct Stem {
    transport: Arc<Transport>,
    branches: Branches,
    local: NodeLocation,
    tasks: Vec<JoinHandle<()>>,
}

impl Stem {
    pub fn builder(config: StemConfig) -> StemBuilder {
        StemBuilder::new(config)
    }

    /// The listener's bound address.
    pub fn local_location(&self) -> NodeLocation {
        self.local
    }

    pub fn branch(&self, identity: Identity) -> &Branch {
        self.branches.get(identity)
    }

    /// Places `location` in the branch for `identity`. The new worker answers the
    /// registration itself.
    pub async fn register_peer(
        &self,
        location: NodeLocation,
        identity: Identity,
    ) -> Result<Worker, BranchError> {
        self.branches.get(identity).add_peer(location).await
    }

    /// True if any branch holds a worker for `location`.
    pub async fn is_known_peer(&self, location: NodeLocation) -> bool {
        self.branches.is_known_peer(location).await
    }

    /// Id and name of every sensor endpoint with a resolved account.
    pub async fn available_endpoints(&self) -> Result<AvailableEndpoints, BranchError> {
        self.branches.available_endpoints().await
    }

    /// Closes the listener and stops both branches with their workers.
    pub async fn shutdown(self) {
        self.transport.close();
        for task in &self.tasks {
            task.abort();
        }
        self.branches.sensors.shutdown().await;
        self.branches.mobiles.shutdown().await;
        info!("stem on {} shut down", self.local);
    }
}

async fn listen_loop(transport: Arc<Transport>, branches: Branches) {
    loop {
        let received = match transport.receive().await {
            Ok(received) => received,
            Err(TransportError::Closed) => {
                debug!("stem listener closed");
                return;
            }
            Err(e @ TransportError::Corrupt(_)) => {
                warn!("stem listener: {}", e);
                continue;
            }
            Err(e) => {
                error!("stem listener failed: {}", e);
                return;
            }
        };
        let from = received.from;
        let reply = match received.packet.message() {
            Message::RegistrationRequest(request) => {
                register(&branches, from, request.identity).await
            }
            other => {
                warn!(opcode = ?other.opcode(), "unexpected packet on listener from {}", from);
                Some(GenericError::new(ErrorCode::WrongPacket, WRONG_PACKET_MESSAGE))
            }
        };
        if let Some(reply) = reply {
            match transport.send_to(&Packet::new(reply), from).await {
                Ok(()) => {}
                Err(TransportError::Closed) => return,
                Err(e) => warn!("cannot reply to {}: {}", from, e),
            }
        }
    }
}

async fn register(
    branches: &Branches,
    from: NodeLocation,
    identity: Identity,
) -> Option<GenericError> {
    let already = || {
        warn!("{} is already registered", from);
        Some(GenericError::new(
            ErrorCode::AlreadyRegistered,
            ALREADY_REGISTERED_MESSAGE,
        ))
    };
    if branches.is_known_peer(from).await {
        return already();
    }
    info!("registering {} as {}", from, identity);
    match branches.get(identity).add_peer(from).await {
        Ok(_) => None,
        Err(BranchError::AlreadyRegistered(_)) => already(),
        Err(e) => {
            error!("cannot register {}: {}", from, e);
            None
        }
    }
}

async fn announce_endpoints(branches: Branches, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let endpoints = match branches.available_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(_) => return,
        };
        let packet = Packet::new(endpoints);
        if let Err(e) = encode_frame(&packet) {
            error!("available endpoints do not fit in one frame: {}", e);
            continue;
        }
        match branches.mobiles.broadcast(&packet).await {
            Ok(0) => {}
            Ok(sent) => debug!("announced endpoints to {} mobile user(s)", sent),
            Err(_) => return,
        }
    }
}
