//! Framed datagram endpoint: one UDP socket, an optional fixed destination, and a close signal.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use arbor_core::wire::{decode_frame, encode_frame};
use arbor_core::{FrameDecodeError, FrameEncodeError, NodeLocation, Packet, FRAME_SIZE};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// One byte past a frame, so a longer datagram truncates to a size mismatch.
const RECV_BUFFER_SIZE: usize = FRAME_SIZE + 1;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("no destination to send to")]
    NoDestination,
    #[error("cannot encode packet: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("corrupt datagram: {0}")]
    Corrupt(#[from] FrameDecodeError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }

    /// The datagram was received but failed frame validation. The socket is still usable.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, TransportError::Corrupt(_))
    }
}

/// A decoded packet and the address it came from.
#[derive(Debug, Clone)]
pub struct Received {
    pub packet: Packet,
    pub from: NodeLocation,
}

/// Sends and receives whole frames. When a destination is set, every send goes there
/// regardless of the address passed to [`Transport::send_to`].
///
/// [`Transport::close`] wakes any pending receive with [`TransportError::Closed`] and fails
/// every later operation the same way. The socket itself is released on drop.
pub struct Transport {
    socket: UdpSocket,
    destination: RwLock<Option<NodeLocation>>,
    closed: watch::Sender<bool>,
}

impl Transport {
    pub async fn bind(local: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket,
            destination: RwLock::new(None),
            closed,
        })
    }

    /// Binds `local` and fixes the destination to `peer`.
    pub async fn bind_to_peer(local: SocketAddr, peer: NodeLocation) -> io::Result<Self> {
        let transport = Self::bind(local).await?;
        transport.set_destination(peer);
        Ok(transport)
    }

    pub fn local_location(&self) -> io::Result<NodeLocation> {
        self.socket.local_addr().map(NodeLocation::from)
    }

    pub fn destination(&self) -> Option<NodeLocation> {
        *self.destination.read()
    }

    pub fn set_destination(&self, peer: NodeLocation) {
        *self.destination.write() = Some(peer);
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let to = self.destination().ok_or(TransportError::NoDestination)?;
        self.transmit(packet, to).await
    }

    pub async fn send_to(&self, packet: &Packet, to: NodeLocation) -> Result<(), TransportError> {
        let to = self.destination().unwrap_or(to);
        self.transmit(packet, to).await
    }

    async fn transmit(&self, packet: &Packet, to: NodeLocation) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(packet)?;
        self.socket.send_to(&frame, to.socket_addr()).await?;
        Ok(())
    }

    /// Waits for the next datagram. A datagram that fails validation is reported as
    /// [`TransportError::Corrupt`]; callers normally log it and receive again.
    pub async fn receive(&self) -> Result<Received, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        tokio::select! {
            res = self.socket.recv_from(&mut buf) => {
                let (n, from) = res?;
                let packet = decode_frame(&buf[..n])?;
                Ok(Received { packet, from: from.into() })
            }
            _ = wait_closed(self.closed.subscribe()) => Err(TransportError::Closed),
        }
    }

    /// Like [`Transport::receive`], giving up after `timeout` with `Ok(None)`.
    pub async fn receive_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Received>, TransportError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
