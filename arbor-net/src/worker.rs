//! Per-leaf worker: answers the registration, then serves the leaf's requests.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use arbor_core::{NodeLocation, Packet, RegistrationResponse};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::branch::BranchHooks;
use crate::hooks::Account;
use crate::transport::{Transport, TransportError};

/// Detail string of the accepting registration response.
pub const REGISTRATION_ACCEPTED: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Resolving the account and answering the registration. Broadcasts wait.
    Handshaking,
    Ready,
    Stopped,
}

/// Sent to the owning branch when a worker's loop ends on its own.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerExit {
    pub location: NodeLocation,
    pub id: u64,
}

struct WorkerShared {
    id: u64,
    location: NodeLocation,
    transport: Transport,
    state: watch::Sender<WorkerState>,
    last_received: Mutex<Instant>,
    account: OnceLock<Account>,
}

impl WorkerShared {
    fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Handshaking {
                *state = WorkerState::Ready;
                true
            } else {
                false
            }
        })
    }

    fn stop(&self) {
        self.transport.close();
        self.state.send_replace(WorkerState::Stopped);
    }
}

/// Handle to a running worker. Clones share the same worker.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("location", &self.shared.location)
            .field("state", &self.state())
            .finish()
    }
}

impl Worker {
    /// Binds a fresh socket on `bind_address` with the leaf as fixed destination and starts
    /// serving. The leaf learns the new socket's address from the registration response.
    pub(crate) async fn spawn(
        id: u64,
        location: NodeLocation,
        bind_address: IpAddr,
        hooks: BranchHooks,
        exits: tokio::sync::mpsc::UnboundedSender<WorkerExit>,
    ) -> io::Result<Worker> {
        let transport = Transport::bind_to_peer(SocketAddr::new(bind_address, 0), location).await?;
        let (state, _) = watch::channel(WorkerState::Handshaking);
        let shared = Arc::new(WorkerShared {
            id,
            location,
            transport,
            state,
            last_received: Mutex::new(Instant::now()),
            account: OnceLock::new(),
        });
        tokio::spawn(run(shared.clone(), hooks, exits));
        Ok(Worker { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The leaf this worker serves.
    pub fn location(&self) -> NodeLocation {
        self.shared.location
    }

    /// The worker's own socket address.
    pub fn local_location(&self) -> io::Result<NodeLocation> {
        self.shared.transport.local_location()
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn account(&self) -> Option<&Account> {
        self.shared.account.get()
    }

    pub fn last_received(&self) -> Instant {
        *self.shared.last_received.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received())
    }

    /// Sends `packet` once the handshake is over. Returns false without sending if the worker
    /// stopped first.
    pub async fn forward_broadcast(&self, packet: &Packet) -> Result<bool, TransportError> {
        let mut state = self.shared.state.subscribe();
        let ready = match state.wait_for(|s| *s != WorkerState::Handshaking).await {
            Ok(state) => *state == WorkerState::Ready,
            Err(_) => false,
        };
        if !ready {
            return Ok(false);
        }
        self.shared.transport.send(packet).await?;
        Ok(true)
    }

    /// Idempotent. Wakes the loop and any broadcast waiting on the handshake.
    pub fn stop(&self) {
        self.shared.stop();
    }
}

async fn run(
    shared: Arc<WorkerShared>,
    hooks: BranchHooks,
    exits: tokio::sync::mpsc::UnboundedSender<WorkerExit>,
) {
    if handshake(&shared, &hooks).await {
        serve(&shared, &hooks).await;
    }
    shared.stop();
    let _ = exits.send(WorkerExit {
        location: shared.location,
        id: shared.id,
    });
}

async fn handshake(shared: &WorkerShared, hooks: &BranchHooks) -> bool {
    let location = shared.location;
    if let Some(resolver) = hooks.resolver.clone() {
        let address = location.address();
        match tokio::task::spawn_blocking(move || resolver.on_peer_connection(address)).await {
            Ok(Ok(account)) => {
                debug!(account = account.id, "resolved {} as {}", location, account.name);
                let _ = shared.account.set(account);
            }
            Ok(Err(e)) => {
                error!("dropping worker for {}: {}", location, e);
                return false;
            }
            Err(e) => {
                error!("account resolver for {} panicked: {}", location, e);
                return false;
            }
        }
    }

    let response = Packet::new(RegistrationResponse::accepted(REGISTRATION_ACCEPTED));
    match shared.transport.send(&response).await {
        Ok(()) => {}
        Err(TransportError::Closed) => return false,
        Err(e) => {
            error!("cannot answer registration of {}: {}", location, e);
            return false;
        }
    }
    if !shared.mark_ready() {
        return false;
    }
    info!("worker for {} ready", location);
    true
}

async fn serve(shared: &WorkerShared, hooks: &BranchHooks) {
    let location = shared.location;
    loop {
        let received = match shared.transport.receive().await {
            Ok(received) => received,
            Err(TransportError::Closed) => {
                debug!("worker for {} closed", location);
                return;
            }
            Err(e @ TransportError::Corrupt(_)) => {
                warn!("worker for {}: {}", location, e);
                continue;
            }
            Err(e) => {
                error!("worker for {} failed: {}", location, e);
                return;
            }
        };
        if received.from != location {
            warn!("worker for {} ignoring datagram from {}", location, received.from);
            continue;
        }
        *shared.last_received.lock() = Instant::now();
        debug!(opcode = ?received.packet.opcode(), "request from {}", location);

        let handler = hooks.handler.clone();
        let account = shared.account.get().cloned();
        let request = received.packet;
        let reply =
            match tokio::task::spawn_blocking(move || handler.handle(account.as_ref(), &request))
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    error!("handler for {} panicked: {}", location, e);
                    continue;
                }
            };

        if let Some(reply) = reply {
            match shared.transport.send(&reply).await {
                Ok(()) => {}
                Err(TransportError::Closed) => return,
                Err(e @ TransportError::Encode(_)) => {
                    error!("dropping reply to {}: {}", location, e);
                }
                Err(e) => {
                    error!("worker for {} failed: {}", location, e);
                    return;
                }
            }
        }
    }
}
