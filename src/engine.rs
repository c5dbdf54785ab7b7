//! Multiplex engine (spec C3): per-flow state machine, dispatch of inbound
//! frames, emission of outbound frames, and on-demand dial on the host.

use crate::config::EngineConfig;
use crate::error::{DialError, OverlaySendError};
use crate::flow_table::FlowTable;
use crate::frame::{self, FlowId, FrameType};
use crate::logger::{self, BreadcrumbFlags};
use crate::overlay::{OverlayStatus, OverlayTransport};
use crate::tcp_plane::{self, TcpEndpoint};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, Duration};

#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub live_flows: usize,
    pub overlay_up: bool,
}

/// State of a not-yet-resolved dial attempt, keyed by flow-id.
enum DialState {
    /// Bytes that arrived before the dial resolved, to be delivered in
    /// order once the socket is up.
    Queued(Vec<Vec<u8>>),
    /// The peer sent CLOSE while the dial was still in flight. `run_dial`
    /// drops the connection instead of admitting it once it sees this.
    Cancelled,
}

pub struct Engine {
    config: EngineConfig,
    overlay: Arc<dyn OverlayTransport>,
    flows: FlowTable<TcpEndpoint>,
    dial_pending: AsyncMutex<FxHashMap<FlowId, DialState>>,
    overlay_up: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, overlay: Arc<dyn OverlayTransport>) -> Arc<Self> {
        Arc::new(Self {
            config,
            overlay,
            flows: FlowTable::new(),
            dial_pending: AsyncMutex::new(FxHashMap::default()),
            overlay_up: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flow_table(&self) -> &FlowTable<TcpEndpoint> {
        &self.flows
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            live_flows: self.flows.len(),
            overlay_up: self.overlay_up.load(Ordering::Relaxed),
        }
    }

    fn overlay_is_up(&self) -> bool {
        self.overlay_up.load(Ordering::Relaxed)
    }

    fn send_frame(&self, blob: Vec<u8>) {
        if let Err(OverlaySendError(reason)) = self.overlay.send(blob) {
            logger::error(format!("overlay send failed: {reason}"));
        }
    }

    // ---- inbound from the TCP plane ----

    /// A local socket produced bytes. Emits a DATA frame if the overlay is
    /// up; drops (with a log line) otherwise. Never buffers.
    pub fn on_local_bytes(&self, id: FlowId, bytes: &[u8]) {
        if !self.overlay_is_up() {
            logger::breadcrumb(
                BreadcrumbFlags::ENGINE,
                format!("dropping {} local bytes for {id}, overlay down", bytes.len()),
            );
            return;
        }
        self.send_frame(frame::encode_data(id, bytes));
    }

    /// A local socket hit EOF or errored. Emits CLOSE (if the flow was
    /// still live and the overlay is up) and removes the flow. Idempotent:
    /// a flow already removed by the overlay-CLOSE path is a no-op.
    pub fn on_local_close(&self, id: FlowId) {
        if !self.flows.remove(&id) {
            return;
        }
        logger::breadcrumb(BreadcrumbFlags::ENGINE, format!("flow {id} closed locally"));
        if self.overlay_is_up() {
            self.send_frame(frame::encode_close(id));
        }
    }

    // ---- inbound from the overlay ----

    pub async fn on_frame(self: &Arc<Self>, blob: &[u8]) {
        let decoded = match frame::decode(blob) {
            Ok(frame) => frame,
            Err(err) => {
                logger::warn(format!("dropping invalid frame: {err}"));
                return;
            }
        };
        match decoded.kind {
            FrameType::Data => self.on_frame_data(decoded.id, decoded.payload.to_vec()).await,
            FrameType::Close => self.on_frame_close(decoded.id).await,
        }
    }

    async fn on_frame_data(self: &Arc<Self>, id: FlowId, payload: Vec<u8>) {
        if let Some(endpoint) = self.flows.get(&id) {
            endpoint.write(payload);
            return;
        }

        if !self.config.role.is_host() {
            logger::breadcrumb(BreadcrumbFlags::ENGINE, format!("no flow for {id}, dropping"));
            return;
        }
        let port = self.config.role.local_port();
        if port == 0 {
            logger::breadcrumb(
                BreadcrumbFlags::ENGINE,
                format!("no flow for {id} and no local port configured, dropping"),
            );
            return;
        }

        self.dial_or_queue(id, port, payload).await;
    }

    /// CLOSE from the peer. Tears down an already-admitted flow, and if a
    /// dial for this id is still in flight, marks it cancelled so
    /// `run_dial` drops the socket instead of admitting it once it
    /// resolves. Awaits the pending-dial lock rather than a best-effort
    /// `try_lock` so this race is actually closed, not just narrowed.
    async fn on_frame_close(&self, id: FlowId) {
        if let Some(endpoint) = self.flows.take(&id) {
            logger::breadcrumb(BreadcrumbFlags::ENGINE, format!("flow {id} closed by peer"));
            endpoint.close();
        }
        if let Some(state) = self.dial_pending.lock().await.get_mut(&id) {
            *state = DialState::Cancelled;
        }
    }

    /// Coalesces concurrent DATA frames for an id with no flow yet: at
    /// most one dial attempt is in flight per id, and frames that arrive
    /// while it is outstanding queue behind it in order.
    async fn dial_or_queue(self: &Arc<Self>, id: FlowId, port: u16, payload: Vec<u8>) {
        let mut pending = self.dial_pending.lock().await;
        match pending.get_mut(&id) {
            Some(DialState::Queued(queue)) => {
                queue.push(payload);
                return;
            }
            Some(DialState::Cancelled) => {
                // peer closed this id while a prior dial was still
                // resolving; drop stray data until that entry clears.
                return;
            }
            None => {}
        }
        pending.insert(id, DialState::Queued(vec![payload]));
        drop(pending);

        logger::breadcrumb(BreadcrumbFlags::DIAL, format!("dialing 127.0.0.1:{port} for {id}"));
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_dial(id, port).await });
    }

    async fn run_dial(self: Arc<Self>, id: FlowId, port: u16) {
        let result = time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await;

        match result {
            Ok(Ok(stream)) => {
                let queued = match self.dial_pending.lock().await.remove(&id) {
                    Some(DialState::Queued(queued)) => queued,
                    Some(DialState::Cancelled) => {
                        logger::breadcrumb(
                            BreadcrumbFlags::DIAL,
                            format!("flow {id} closed by peer before dial completed, dropping connection"),
                        );
                        return;
                    }
                    None => {
                        logger::error(format!("dial completed for {id} with no pending entry"));
                        return;
                    }
                };
                let _ = stream.set_nodelay(true);
                let endpoint = tcp_plane::spawn_endpoint(id, stream, Arc::clone(&self));
                if self.flows.add(id, endpoint.clone()).is_err() {
                    logger::error(format!("duplicate flow-id {id} on dial"));
                    endpoint.close();
                    return;
                }
                for payload in queued {
                    endpoint.write(payload);
                }
            }
            Ok(Err(source)) => {
                let dial_err = DialError { port, source };
                logger::warn(format!("{dial_err} (flow {id})"));
                self.dial_pending.lock().await.remove(&id);
            }
            Err(_elapsed) => {
                logger::warn(format!("dial to 127.0.0.1:{port} timed out for {id}"));
                self.dial_pending.lock().await.remove(&id);
            }
        }
    }

    // ---- overlay status ----

    pub fn on_overlay_status(&self, status: OverlayStatus) {
        match status {
            OverlayStatus::Connected => {
                logger::info("overlay connected".to_string());
                self.overlay_up.store(true, Ordering::Relaxed);
            }
            OverlayStatus::Connecting => {
                logger::info("overlay connecting".to_string());
            }
            OverlayStatus::ClosedByPeer | OverlayStatus::ProblemDetectedLocally => {
                logger::warn(format!("overlay down: {status:?}"));
                self.overlay_up.store(false, Ordering::Relaxed);
                self.drain_all_flows();
            }
        }
    }

    /// Closes every live flow with no CLOSE frame emitted (the overlay is
    /// gone). Used on overlay loss and on supervisor shutdown.
    pub fn drain_all_flows(&self) {
        let endpoints = self.flows.drain();
        if endpoints.is_empty() {
            return;
        }
        logger::info(format!("draining {} live flows", endpoints.len()));
        for endpoint in endpoints {
            endpoint.close();
        }
    }

    /// Drives the overlay adapter pump: every tick, drains a batch of
    /// inbound blobs and status transitions. Runs until `shutdown` fires.
    pub async fn run_overlay_pump(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = time::interval(Duration::from_millis(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            while let Some(status) = self.overlay.poll_status() {
                self.on_overlay_status(status);
            }
            for _ in 0..self.config.overlay_batch_size {
                match self.overlay.try_recv() {
                    Some(blob) => self.on_frame(&blob).await,
                    None => break,
                }
            }
        }
    }
}
