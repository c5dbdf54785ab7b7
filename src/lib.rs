pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod flow_table;
pub mod logger;
pub mod overlay;
pub mod supervisor;
pub mod tcp_plane;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats};
pub use overlay::{LoopbackOverlay, OverlayStatus, OverlayTransport, TcpPipeOverlay};
pub use supervisor::Supervisor;
