//! Supervisor (spec C6): starts the engine, the overlay pump, and the TCP
//! plane in order, and tears them down in reverse on shutdown.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::logger::{self, BreadcrumbFlags};
use crate::overlay::OverlayTransport;
use crate::tcp_plane;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Supervisor {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
    pump_task: JoinHandle<()>,
    listener_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Starts the engine and its overlay pump. Additionally binds the
    /// client-side listener when the engine is not configured as host —
    /// the listener is a fixed part of the client role, not something
    /// toggled live if `is_host` changes mid-session.
    pub fn start(config: EngineConfig, overlay: Arc<dyn OverlayTransport>) -> Self {
        let engine = Engine::new(config.clone(), overlay);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        logger::breadcrumb(BreadcrumbFlags::SUPERVISOR, "starting engine".to_string());
        let pump_task = tokio::spawn(Arc::clone(&engine).run_overlay_pump(shutdown_rx));

        let listener_task = if config.role.is_host() {
            logger::breadcrumb(
                BreadcrumbFlags::SUPERVISOR,
                "host role: skipping client listener".to_string(),
            );
            None
        } else {
            let engine_for_listener = Arc::clone(&engine);
            let config_for_listener = config.clone();
            Some(tokio::spawn(async move {
                if let Err(err) =
                    tcp_plane::run_listener(config_for_listener, engine_for_listener).await
                {
                    logger::error(format!("client listener exited: {err}"));
                }
            }))
        };

        Supervisor {
            engine,
            shutdown_tx,
            pump_task,
            listener_task,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stops accepting new TCP connections, stops the overlay pump, drains
    /// every live flow (closing its TCP endpoint), and joins the reactor
    /// tasks. Idempotent to call at most once; a second call is a no-op
    /// beyond re-sending the shutdown signal.
    pub async fn shutdown(self) {
        logger::breadcrumb(BreadcrumbFlags::SUPERVISOR, "shutdown requested".to_string());
        if let Some(listener_task) = self.listener_task {
            listener_task.abort();
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.pump_task.await;
        self.engine.drain_all_flows();
        logger::breadcrumb(BreadcrumbFlags::SUPERVISOR, "shutdown complete".to_string());
    }
}
