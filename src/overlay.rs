//! Overlay adapter (spec C5): the boundary between the engine and whatever
//! reliable, ordered, message-framed transport the two peers actually use.
//! The real transport (lobby discovery, NAT traversal, relay) is external
//! and out of scope; this module only defines the contract the engine
//! consumes and a loopback double for tests and local demos.

use crate::error::OverlaySendError;
use crate::logger::{self, BreadcrumbFlags};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayStatus {
    Connecting,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

/// What the multiplex engine requires of the overlay transport: send a
/// blob reliably and in order, drain received blobs, and observe status
/// transitions. Implementations own their own send/receive pumping.
pub trait OverlayTransport: Send + Sync {
    fn send(&self, blob: Vec<u8>) -> Result<(), OverlaySendError>;

    /// Non-blocking; returns `None` when nothing is pending right now.
    fn try_recv(&self) -> Option<Vec<u8>>;

    /// Non-blocking; returns the next pending status transition, if any.
    fn poll_status(&self) -> Option<OverlayStatus>;
}

/// An in-process stand-in for the overlay, wiring two peers together with
/// plain channels. Used by integration tests and the single-process demo
/// mode of the `tunnelmux` binary; never used for real cross-host traffic.
pub struct LoopbackOverlay {
    tx: UnboundedSender<Vec<u8>>,
    rx: Mutex<UnboundedReceiver<Vec<u8>>>,
    status: Mutex<VecDeque<OverlayStatus>>,
}

impl LoopbackOverlay {
    /// Builds two ends of a connected loopback pipe, both already
    /// `Connected`.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            Self {
                tx: tx_a,
                rx: Mutex::new(rx_a),
                status: Mutex::new(VecDeque::from([OverlayStatus::Connected])),
            },
            Self {
                tx: tx_b,
                rx: Mutex::new(rx_b),
                status: Mutex::new(VecDeque::from([OverlayStatus::Connected])),
            },
        )
    }

    /// Queues a status transition for the adapter pump to observe on its
    /// next tick. Used by tests to simulate the overlay going down.
    pub fn inject_status(&self, status: OverlayStatus) {
        self.status.lock().push_back(status);
    }
}

impl OverlayTransport for LoopbackOverlay {
    fn send(&self, blob: Vec<u8>) -> Result<(), OverlaySendError> {
        self.tx
            .send(blob)
            .map_err(|_| OverlaySendError("peer end dropped".to_string()))
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        match self.rx.lock().try_recv() {
            Ok(blob) => Some(blob),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn poll_status(&self) -> Option<OverlayStatus> {
        self.status.lock().pop_front()
    }
}

/// A single long-lived TCP connection between the two peer processes,
/// standing in for the real overlay transport (lobby discovery, NAT
/// traversal, relay) which is external to this crate. Frames each blob
/// with a 4-byte little-endian length prefix to preserve message
/// boundaries over the TCP byte stream.
pub struct TcpPipeOverlay {
    outbound_tx: UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<UnboundedReceiver<Vec<u8>>>,
    status: Mutex<VecDeque<OverlayStatus>>,
}

impl TcpPipeOverlay {
    pub async fn connect(addr: std::net::SocketAddr) -> std::io::Result<Arc<Self>> {
        logger::info(format!("overlay: connecting to {addr}"));
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub async fn accept(listener: &tokio::net::TcpListener) -> std::io::Result<Arc<Self>> {
        let (stream, peer) = listener.accept().await?;
        logger::info(format!("overlay: accepted peer {peer}"));
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: TcpStream) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let overlay = Arc::new(Self {
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            status: Mutex::new(VecDeque::from([OverlayStatus::Connected])),
        });

        tokio::spawn(read_frames(read_half, inbound_tx, Arc::clone(&overlay)));
        tokio::spawn(write_frames(write_half, outbound_rx, Arc::clone(&overlay)));

        overlay
    }
}

async fn read_frames(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    inbound_tx: UnboundedSender<Vec<u8>>,
    overlay: Arc<TcpPipeOverlay>,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(err) = read_half.read_exact(&mut len_buf).await {
            logger::breadcrumb(BreadcrumbFlags::OVERLAY, format!("overlay read closed: {err}"));
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if let Err(err) = read_half.read_exact(&mut payload).await {
            logger::breadcrumb(BreadcrumbFlags::OVERLAY, format!("overlay read closed: {err}"));
            break;
        }
        if inbound_tx.send(payload).is_err() {
            break;
        }
    }
    overlay.inject_status(OverlayStatus::ProblemDetectedLocally);
}

async fn write_frames(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbound_rx: UnboundedReceiver<Vec<u8>>,
    overlay: Arc<TcpPipeOverlay>,
) {
    while let Some(blob) = outbound_rx.recv().await {
        let len = (blob.len() as u32).to_le_bytes();
        if write_half.write_all(&len).await.is_err() || write_half.write_all(&blob).await.is_err()
        {
            break;
        }
    }
    overlay.inject_status(OverlayStatus::ProblemDetectedLocally);
}

impl OverlayTransport for TcpPipeOverlay {
    fn send(&self, blob: Vec<u8>) -> Result<(), OverlaySendError> {
        self.outbound_tx
            .send(blob)
            .map_err(|_| OverlaySendError("overlay pipe closed".to_string()))
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        match self.inbound_rx.lock().try_recv() {
            Ok(blob) => Some(blob),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn poll_status(&self) -> Option<OverlayStatus> {
        self.status.lock().pop_front()
    }
}

impl TcpPipeOverlay {
    fn inject_status(&self, status: OverlayStatus) {
        self.status.lock().push_back(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_pair_delivers_in_order() {
        let (a, b) = LoopbackOverlay::pair();
        a.send(vec![1]).unwrap();
        a.send(vec![2]).unwrap();
        assert_eq!(b.try_recv(), Some(vec![1]));
        assert_eq!(b.try_recv(), Some(vec![2]));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn injected_status_drains_fifo() {
        let (a, _b) = LoopbackOverlay::pair();
        assert_eq!(a.poll_status(), Some(OverlayStatus::Connected));
        a.inject_status(OverlayStatus::ProblemDetectedLocally);
        assert_eq!(a.poll_status(), Some(OverlayStatus::ProblemDetectedLocally));
        assert_eq!(a.poll_status(), None);
    }
}
