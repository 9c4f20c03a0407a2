//! Collaborators supplied by the application: account lookup, request handling, broadcast handling.

use std::net::IpAddr;

use arbor_core::{EndpointId, Packet};

/// Durable identity of a leaf, resolved from its network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Account {
    pub id: EndpointId,
    pub name: String,
}

impl Account {
    pub fn new(id: EndpointId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("account resolution failed: {message}")]
pub struct AccountError {
    message: String,
}

impl AccountError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Maps a new peer's address to its account. Called once per worker, before it
/// answers the registration; an error aborts that worker only.
/// May block (it usually sits in front of a database); it runs on the blocking pool.
pub trait AccountResolver: Send + Sync + 'static {
    fn on_peer_connection(&self, address: IpAddr) -> Result<Account, AccountError>;
}

impl<F> AccountResolver for F
where
    F: Fn(IpAddr) -> Result<Account, AccountError> + Send + Sync + 'static,
{
    fn on_peer_connection(&self, address: IpAddr) -> Result<Account, AccountError> {
        self(address)
    }
}

/// Application logic of a branch. The returned packet, if any, is sent back to the leaf verbatim.
/// Runs on the blocking pool.
pub trait PacketHandler: Send + Sync + 'static {
    fn handle(&self, account: Option<&Account>, packet: &Packet) -> Option<Packet>;
}

/// Receives broadcasts that arrive on a leaf while it waits for a reply.
pub trait BroadcastHandler: Send + Sync + 'static {
    fn handle_broadcast(&self, packet: Packet);
}

impl<F> BroadcastHandler for F
where
    F: Fn(Packet) + Send + Sync + 'static,
{
    fn handle_broadcast(&self, packet: Packet) {
        self(packet)
    }
}

/// Handler that never answers.
pub(crate) struct Silent;

impl PacketHandler for Silent {
    fn handle(&self, _account: Option<&Account>, _packet: &Packet) -> Option<Packet> {
        None
    }
}
