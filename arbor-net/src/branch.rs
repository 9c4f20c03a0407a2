//! A branch owns the workers of one role. The worker map lives inside a single actor task;
//! [`Branch`] handles talk to it over a command channel.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_core::{NodeLocation, Packet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::hooks::{AccountResolver, PacketHandler};
use crate::prune::idle_workers;
use crate::worker::{Worker, WorkerExit};

#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("{0} already has a worker")]
    AlreadyRegistered(NodeLocation),
    #[error("branch has shut down")]
    Shutdown,
    #[error("cannot bind worker socket: {0}")]
    Io(#[from] io::Error),
}

/// Collaborators shared by every worker of a branch.
#[derive(Clone)]
pub struct BranchHooks {
    pub handler: Arc<dyn PacketHandler>,
    pub resolver: Option<Arc<dyn AccountResolver>>,
}

impl BranchHooks {
    pub fn new(handler: Arc<dyn PacketHandler>) -> Self {
        Self {
            handler,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AccountResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

enum Command {
    Add {
        location: NodeLocation,
        reply: oneshot::Sender<Result<Worker, BranchError>>,
    },
    Remove {
        location: NodeLocation,
        reply: oneshot::Sender<bool>,
    },
    Contains {
        location: NodeLocation,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Worker>>,
    },
    Prune {
        threshold: Duration,
        reply: oneshot::Sender<Vec<NodeLocation>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct Branch {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Branch {
    /// Starts the branch actor. Worker sockets are bound on `bind_address`.
    pub fn spawn(name: impl Into<Arc<str>>, hooks: BranchHooks, bind_address: IpAddr) -> Branch {
        let name = name.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let actor = BranchActor {
            name: name.clone(),
            hooks,
            bind_address,
            workers: HashMap::new(),
            next_id: 0,
            exits_tx,
        };
        tokio::spawn(actor.run(rx, exits));
        Branch { name, commands }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completes once the actor has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BranchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| BranchError::Shutdown)?;
        rx.await.map_err(|_| BranchError::Shutdown)
    }

    /// Creates and starts a worker for `location`.
    pub async fn add_peer(&self, location: NodeLocation) -> Result<Worker, BranchError> {
        self.request(|reply| Command::Add { location, reply })
            .await?
    }

    /// Stops and forgets the worker for `location`. Returns false if there was none.
    pub async fn remove_peer(&self, location: NodeLocation) -> Result<bool, BranchError> {
        self.request(|reply| Command::Remove { location, reply })
            .await
    }

    pub async fn contains(&self, location: NodeLocation) -> Result<bool, BranchError> {
        self.request(|reply| Command::Contains { location, reply })
            .await
    }

    /// Snapshot of the current workers.
    pub async fn workers(&self) -> Result<Vec<Worker>, BranchError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Removes workers that have not heard from their leaf for longer than `threshold`.
    pub async fn prune(&self, threshold: Duration) -> Result<Vec<NodeLocation>, BranchError> {
        self.request(|reply| Command::Prune { threshold, reply })
            .await
    }

    /// Sends `packet`, flagged as broadcast, to every worker's leaf. Each send waits for that
    /// worker's handshake, so a leaf never sees a broadcast before its registration response.
    /// Returns how many leaves it was sent to.
    pub async fn broadcast(&self, packet: &Packet) -> Result<usize, BranchError> {
        let mut packet = packet.clone();
        packet.set_broadcast(true);
        let packet = Arc::new(packet);

        let mut sends = JoinSet::new();
        for worker in self.workers().await? {
            let packet = packet.clone();
            sends.spawn(async move {
                let res = worker.forward_broadcast(&packet).await;
                (worker.location(), res)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(true))) => delivered += 1,
                Ok((location, Ok(false))) => {
                    debug!("{}: worker for {} stopped before broadcast", self.name, location)
                }
                Ok((location, Err(e))) => {
                    warn!("{}: broadcast to {} failed: {}", self.name, location, e)
                }
                Err(e) => error!("{}: broadcast task failed: {}", self.name, e),
            }
        }
        Ok(delivered)
    }

    /// Stops every worker and the actor. Later calls on any handle fail with `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

struct BranchActor {
    name: Arc<str>,
    hooks: BranchHooks,
    bind_address: IpAddr,
    workers: HashMap<NodeLocation, Worker>,
    next_id: u64,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl BranchActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(exit) = exits.recv() => self.on_exit(exit),
            }
        }
        self.stop_all();
        debug!("{}: branch stopped", self.name);
    }

    /// Returns `false` once the actor should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Add { location, reply } => {
                let _ = reply.send(self.add(location).await);
            }
            Command::Remove { location, reply } => {
                let removed = match self.workers.remove(&location) {
                    Some(worker) => {
                        worker.stop();
                        info!("{}: removed worker for {}", self.name, location);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            Command::Contains { location, reply } => {
                let _ = reply.send(self.workers.contains_key(&location));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.workers.values().cloned().collect());
            }
            Command::Prune { threshold, reply } => {
                let _ = reply.send(self.prune(threshold));
            }
            Command::Shutdown { reply } => {
                self.stop_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn add(&mut self, location: NodeLocation) -> Result<Worker, BranchError> {
        if self.workers.contains_key(&location) {
            return Err(BranchError::AlreadyRegistered(location));
        }
        self.next_id += 1;
        let worker = Worker::spawn(
            self.next_id,
            location,
            self.bind_address,
            self.hooks.clone(),
            self.exits_tx.clone(),
        )
        .await?;
        info!("{}: new worker for {}", self.name, location);
        self.workers.insert(location, worker.clone());
        Ok(worker)
    }

    fn prune(&mut self, threshold: Duration) -> Vec<NodeLocation> {
        let idle = idle_workers(self.workers.values(), Instant::now(), threshold);
        for location in &idle {
            if let Some(worker) = self.workers.remove(location) {
                worker.stop();
                info!("{}: pruned idle worker for {}", self.name, location);
            }
        }
        idle
    }

    /// A worker whose loop ended on its own. Ignored if the entry was already replaced.
    fn on_exit(&mut self, exit: WorkerExit) {
        if self
            .workers
            .get(&exit.location)
            .is_some_and(|worker| worker.id() == exit.id)
        {
            self.workers.remove(&exit.location);
            info!("{}: worker for {} exited", self.name, exit.location);
        }
    }

    fn stop_all(&mut self) {
        for (_, worker) in self.workers.drain() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Account, AccountError};
    use crate::worker::WorkerState;
    use arbor_core::wire::{decode_frame, encode_frame};
    use arbor_core::{Acknowledgement, Message, SensorData, SensorId};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::mpsc as std_mpsc;
    use tokio::net::UdpSocket;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Echo;

    impl PacketHandler for Echo {
        fn handle(&self, account: Option<&Account>, packet: &Packet) -> Option<Packet> {
            match packet.message() {
                Message::SensorData(_) => {
                    assert_eq!(account.map(|a| a.id), Some(42));
                    Some(Packet::new(Acknowledgement))
                }
                _ => None,
            }
        }
    }

    /// Blocks the handshake until the test lets it through.
    struct Gate(parking_lot::Mutex<std_mpsc::Receiver<()>>);

    impl AccountResolver for Gate {
        fn on_peer_connection(&self, _address: IpAddr) -> Result<Account, AccountError> {
            let _ = self.0.lock().recv();
            Ok(Account::new(42, "gated"))
        }
    }

    fn fixed_account(_: IpAddr) -> Result<Account, AccountError> {
        Ok(Account::new(42, "bed-1"))
    }

    fn branch_with(resolver: Arc<dyn AccountResolver>) -> Branch {
        Branch::spawn(
            "sensors",
            BranchHooks::new(Arc::new(Echo)).with_resolver(resolver),
            LOCALHOST,
        )
    }

    async fn leaf_socket() -> (UdpSocket, NodeLocation) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let location = socket.local_addr().unwrap().into();
        (socket, location)
    }

    async fn recv_packet(socket: &UdpSocket, wait: Duration) -> Option<(Packet, SocketAddr)> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => Some((decode_frame(&buf[..n]).unwrap(), from)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn worker_answers_registration_then_serves() {
        let branch = branch_with(Arc::new(fixed_account));
        let (leaf, location) = leaf_socket().await;
        let worker = branch.add_peer(location).await.unwrap();

        let (response, from) = recv_packet(&leaf, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(
            response.message(),
            Message::RegistrationResponse(r) if r.accepted && r.detail == "OK"
        ));
        assert_eq!(NodeLocation::from(from), worker.local_location().unwrap());
        assert_eq!(worker.account().map(|a| a.name.as_str()), Some("bed-1"));

        leaf.send_to(&[1, 2, 3], from).await.unwrap();
        let mut data = SensorData::new();
        data.set(SensorId::AirTemperature, 21.5);
        leaf.send_to(&encode_frame(&Packet::new(data)).unwrap(), from)
            .await
            .unwrap();
        let (reply, _) = recv_packet(&leaf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.message(), &Message::from(Acknowledgement));
        assert!(!reply.is_broadcast());

        branch.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_peer_is_rejected() {
        let branch = branch_with(Arc::new(fixed_account));
        let (_leaf, location) = leaf_socket().await;
        branch.add_peer(location).await.unwrap();
        let err = branch.add_peer(location).await.unwrap_err();
        assert!(matches!(err, BranchError::AlreadyRegistered(l) if l == location));
        assert_eq!(branch.workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_waits_for_registration_response() {
        let (open, gate) = std_mpsc::channel();
        let branch = branch_with(Arc::new(Gate(parking_lot::Mutex::new(gate))));
        let (leaf, location) = leaf_socket().await;
        let worker = branch.add_peer(location).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Handshaking);

        let sending = {
            let branch = branch.clone();
            tokio::spawn(async move { branch.broadcast(&Packet::new(Acknowledgement)).await })
        };
        assert!(recv_packet(&leaf, Duration::from_millis(200)).await.is_none());
        assert!(!sending.is_finished());

        open.send(()).unwrap();
        let (first, _) = recv_packet(&leaf, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(first.message(), Message::RegistrationResponse(_)));
        assert!(!first.is_broadcast());
        let (second, _) = recv_packet(&leaf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(second.message(), &Message::from(Acknowledgement));
        assert!(second.is_broadcast());

        assert_eq!(sending.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn removal_during_handshake_releases_broadcast() {
        let (open, gate) = std_mpsc::channel();
        let branch = branch_with(Arc::new(Gate(parking_lot::Mutex::new(gate))));
        let (leaf, location) = leaf_socket().await;
        branch.add_peer(location).await.unwrap();

        let sending = {
            let branch = branch.clone();
            tokio::spawn(async move { branch.broadcast(&Packet::new(Acknowledgement)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(branch.remove_peer(location).await.unwrap());
        assert!(!branch.remove_peer(location).await.unwrap());

        let delivered = tokio::time::timeout(Duration::from_secs(2), sending)
            .await
            .expect("broadcast must not hang on a stopped worker")
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 0);

        open.send(()).unwrap();
        assert!(recv_packet(&leaf, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn prune_evicts_silent_workers_only() {
        let branch = branch_with(Arc::new(fixed_account));
        let (_quiet, quiet_location) = leaf_socket().await;
        let (chatty, chatty_location) = leaf_socket().await;
        branch.add_peer(quiet_location).await.unwrap();
        branch.add_peer(chatty_location).await.unwrap();

        let (_, worker_addr) = recv_packet(&chatty, Duration::from_secs(2)).await.unwrap();
        let ping = encode_frame(&Packet::new(Acknowledgement)).unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            chatty.send_to(&ping, worker_addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let evicted = branch.prune(Duration::from_millis(300)).await.unwrap();
        assert_eq!(evicted, vec![quiet_location]);
        assert!(!branch.contains(quiet_location).await.unwrap());
        assert!(branch.contains(chatty_location).await.unwrap());
    }

    #[tokio::test]
    async fn failed_account_lookup_drops_worker() {
        let branch = branch_with(Arc::new(|_: IpAddr| -> Result<Account, AccountError> {
            Err(AccountError::new("unknown device"))
        }));
        let (leaf, location) = leaf_socket().await;
        branch.add_peer(location).await.unwrap();

        assert!(recv_packet(&leaf, Duration::from_millis(300)).await.is_none());
        assert!(!branch.contains(location).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_stops_actor() {
        let branch = branch_with(Arc::new(fixed_account));
        let (_leaf, location) = leaf_socket().await;
        let worker = branch.add_peer(location).await.unwrap();
        branch.shutdown().await;
        branch.closed().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(matches!(
            branch.workers().await.unwrap_err(),
            BranchError::Shutdown
        ));
    }
}
