//! Client side: register with the stem, then talk to the dedicated worker.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{Identity, Message, NodeLocation, Packet, RegistrationRequest};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hooks::BroadcastHandler;
use crate::transport::{Received, Transport, TransportError};

pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_REGISTRATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct LeafConfig {
    /// Well-known listener address of the stem.
    pub stem: NodeLocation,
    pub bind_address: IpAddr,
    /// 0 picks an ephemeral port.
    pub local_port: u16,
    pub registration_timeout: Duration,
    pub registration_attempts: u32,
}

impl LeafConfig {
    pub fn new(stem: NodeLocation) -> Self {
        Self {
            stem,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 0,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            registration_attempts: DEFAULT_REGISTRATION_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationFailure {
    #[error("no registration response after {0} attempts")]
    NoResponse(u32),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("transport failed during registration: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    /// Registered; the worker serving this leaf lives at the given location.
    Registered(NodeLocation),
    Failed(RegistrationFailure),
}

impl RegistrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::Registered(_) | RegistrationStatus::Failed(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeafError {
    #[error("leaf is not registered: {0}")]
    NotRegistered(RegistrationFailure),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Holds at most one undelivered broadcast. A newer broadcast replaces an unconsumed one.
struct Mailbox {
    slot: Mutex<Option<Packet>>,
    ready: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Notify::new(),
        }
    }

    /// Returns true when an unconsumed broadcast was overwritten.
    fn post(&self, packet: Packet) -> bool {
        let replaced = self.slot.lock().replace(packet).is_some();
        self.ready.notify_one();
        replaced
    }

    async fn take(&self) -> Packet {
        loop {
            let next = self.slot.lock().take();
            if let Some(packet) = next {
                return packet;
            }
            self.ready.notified().await;
        }
    }
}

struct Shared {
    identity: Identity,
    transport: Transport,
    status: watch::Sender<RegistrationStatus>,
    mailbox: Option<Arc<Mailbox>>,
}

impl Shared {
    /// Moves to `next` unless a terminal state was already reached.
    fn advance(&self, next: RegistrationStatus) -> bool {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = next;
                true
            }
        })
    }
}

/// A registered (or registering) client.
///
/// Registration runs in the background as soon as the leaf starts; [`Leaf::send`] and
/// [`Leaf::receive`] wait for it to finish and fail once it has failed.
pub struct Leaf {
    shared: Arc<Shared>,
    broadcast_task: Option<JoinHandle<()>>,
}

impl Leaf {
    /// Binds the local socket and starts registering under `identity`.
    ///
    /// Broadcasts that arrive during [`Leaf::receive`] are passed to `broadcasts`; without a
    /// handler they are logged and dropped.
    pub async fn start(
        identity: Identity,
        config: LeafConfig,
        broadcasts: Option<Arc<dyn BroadcastHandler>>,
    ) -> io::Result<Self> {
        let local = SocketAddr::new(config.bind_address, config.local_port);
        let transport = Transport::bind_to_peer(local, config.stem).await?;
        let (status, _) = watch::channel(RegistrationStatus::Unregistered);
        let mailbox = broadcasts.as_ref().map(|_| Arc::new(Mailbox::new()));
        let shared = Arc::new(Shared {
            identity,
            transport,
            status,
            mailbox: mailbox.clone(),
        });

        let broadcast_task = match (mailbox, broadcasts) {
            (Some(mailbox), Some(handler)) => {
                Some(tokio::spawn(deliver_broadcasts(mailbox, handler)))
            }
            _ => None,
        };
        tokio::spawn(register(shared.clone(), config));

        Ok(Self {
            shared,
            broadcast_task,
        })
    }

    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    pub fn local_location(&self) -> io::Result<NodeLocation> {
        self.shared.transport.local_location()
    }

    pub fn status(&self) -> RegistrationStatus {
        self.shared.status.borrow().clone()
    }

    /// Non-blocking.
    pub fn is_registered(&self) -> bool {
        matches!(*self.shared.status.borrow(), RegistrationStatus::Registered(_))
    }

    /// Waits for registration to finish. Returns the worker's location.
    pub async fn wait_registration(&self) -> Result<NodeLocation, LeafError> {
        let mut status = self.shared.status.subscribe();
        let outcome = match status.wait_for(RegistrationStatus::is_terminal).await {
            Ok(current) => current.clone(),
            Err(_) => RegistrationStatus::Failed(RegistrationFailure::Transport(
                "registration task ended".into(),
            )),
        };
        match outcome {
            RegistrationStatus::Registered(worker) => Ok(worker),
            RegistrationStatus::Failed(failure) => Err(LeafError::NotRegistered(failure)),
            RegistrationStatus::Unregistered | RegistrationStatus::Registering => {
                Err(LeafError::NotRegistered(RegistrationFailure::Transport(
                    "registration did not finish".into(),
                )))
            }
        }
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), LeafError> {
        self.wait_registration().await?;
        self.shared.transport.send(packet).await?;
        Ok(())
    }

    /// Next non-broadcast packet from the worker. Broadcasts received meanwhile go to the
    /// broadcast handler. Corrupt datagrams are reported to the caller.
    pub async fn receive(&self) -> Result<Packet, LeafError> {
        self.wait_registration().await?;
        loop {
            let Received { packet, from } = self.shared.transport.receive().await?;
            if !packet.is_broadcast() {
                return Ok(packet);
            }
            match &self.shared.mailbox {
                Some(mailbox) => {
                    if mailbox.post(packet) {
                        debug!("unconsumed broadcast replaced by a newer one from {}", from);
                    }
                }
                None => debug!(
                    opcode = ?packet.opcode(),
                    "dropping broadcast from {}, no handler installed", from
                ),
            }
        }
    }

    /// Like [`Leaf::receive`], giving up after `timeout` with `Ok(None)`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Packet>, LeafError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Closes the socket and stops broadcast delivery. Pending operations fail with `Closed`;
    /// an unfinished registration fails.
    pub fn close(&self) {
        self.shared.transport.close();
        self.shared.advance(RegistrationStatus::Failed(RegistrationFailure::Transport(
            "leaf closed".into(),
        )));
        if let Some(task) = &self.broadcast_task {
            task.abort();
        }
    }
}

impl Drop for Leaf {
    fn drop(&mut self) {
        self.close();
    }
}

async fn deliver_broadcasts(mailbox: Arc<Mailbox>, handler: Arc<dyn BroadcastHandler>) {
    loop {
        let packet = mailbox.take().await;
        handler.handle_broadcast(packet);
    }
}

async fn register(shared: Arc<Shared>, config: LeafConfig) {
    if !shared.advance(RegistrationStatus::Registering) {
        return;
    }
    match attempt_registration(&shared, &config).await {
        Ok(worker) => {
            shared.transport.set_destination(worker);
            if shared.advance(RegistrationStatus::Registered(worker)) {
                info!("{} registered, served by worker at {}", shared.identity, worker);
            }
        }
        Err(failure) => {
            error!(stem = %config.stem, "{} registration failed: {}", shared.identity, failure);
            shared.advance(RegistrationStatus::Failed(failure));
        }
    }
}

async fn attempt_registration(
    shared: &Shared,
    config: &LeafConfig,
) -> Result<NodeLocation, RegistrationFailure> {
    let request = Packet::new(RegistrationRequest::new(shared.identity));
    for attempt in 1..=config.registration_attempts {
        debug!(attempt, "sending registration request to {}", config.stem);
        shared
            .transport
            .send(&request)
            .await
            .map_err(|e| RegistrationFailure::Transport(e.to_string()))?;

        match shared
            .transport
            .receive_timeout(config.registration_timeout)
            .await
        {
            Ok(Some(received)) => return interpret_reply(received),
            Ok(None) => warn!(attempt, "no registration response from {}", config.stem),
            Err(e) if e.is_corrupt() => warn!(attempt, "corrupt registration response: {}", e),
            Err(e) => return Err(RegistrationFailure::Transport(e.to_string())),
        }
    }
    Err(RegistrationFailure::NoResponse(config.registration_attempts))
}

/// The accepting response comes from the worker's own socket; its source address is where
/// all later traffic goes.
fn interpret_reply(received: Received) -> Result<NodeLocation, RegistrationFailure> {
    match received.packet.into_message() {
        Message::RegistrationResponse(response) if response.accepted => Ok(received.from),
        Message::RegistrationResponse(response) => {
            Err(RegistrationFailure::Rejected(response.detail))
        }
        Message::GenericError(err) => Err(RegistrationFailure::Rejected(err.to_string())),
        other => Err(RegistrationFailure::Rejected(format!(
            "unexpected {:?} in reply to registration",
            other.opcode()
        ))),
    }
}
