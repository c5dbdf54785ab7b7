use thiserror::Error;

/// Errors from decoding or constructing a wire frame. Always handled locally;
/// never propagated past the engine boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than the 11-byte minimum ({0} bytes)")]
    TooShort(usize),
    #[error("flow-id must be exactly 6 printable ASCII bytes")]
    InvalidFlowId,
    #[error("unrecognized frame type {0}")]
    UnknownType(u32),
}

/// Failure to establish the host-side TCP connection for a newly observed
/// flow-id. Never retried (see DialFailure in the error taxonomy).
#[derive(Debug, Error)]
#[error("dial to 127.0.0.1:{port} failed: {source}")]
pub struct DialError {
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}

/// Failure to hand a blob to the overlay transport.
#[derive(Debug, Error)]
#[error("overlay send failed: {0}")]
pub struct OverlaySendError(pub String);
