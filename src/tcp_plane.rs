//! TCP plane (spec C4): the client-side fixed listener, the host-side
//! on-demand dialer, and the per-socket read/write loops that feed bytes
//! to and from the multiplex engine.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::frame::FlowId;
use crate::logger::{self, BreadcrumbFlags};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};

const READ_BUFFER_SIZE: usize = 4096;

enum WriteCommand {
    Write(Vec<u8>),
    Shutdown,
}

/// Handle stored in the flow table. Cloning only clones the channel
/// sender; the socket itself is owned by the writer task.
#[derive(Clone)]
pub struct TcpEndpoint {
    tx: UnboundedSender<WriteCommand>,
}

impl TcpEndpoint {
    /// Queues `bytes` for writing. Never blocks; if the writer task has
    /// already exited the bytes are silently dropped, matching the "flow
    /// is already closing" case.
    pub fn write(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(WriteCommand::Write(bytes));
    }

    /// Requests the socket be shut down. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
    }
}

/// Splits `stream`, spawns its reader and writer tasks, and returns the
/// endpoint handle to be inserted into the flow table. Shared by both the
/// accept path (client listener) and the dial path (host dialer).
pub fn spawn_endpoint(id: FlowId, stream: TcpStream, engine: Arc<Engine>) -> TcpEndpoint {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(read_loop(id, read_half, Arc::clone(&engine)));
    tokio::spawn(write_loop(id, write_half, rx, engine));

    TcpEndpoint { tx }
}

async fn read_loop(id: FlowId, mut read_half: tokio::net::tcp::OwnedReadHalf, engine: Arc<Engine>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                logger::breadcrumb(BreadcrumbFlags::TCP, format!("local EOF on flow {id}"));
                break;
            }
            Ok(n) => {
                engine.on_local_bytes(id, &buf[..n]);
            }
            Err(err) => {
                logger::breadcrumb(
                    BreadcrumbFlags::TCP,
                    format!("local read error on flow {id}: {err}"),
                );
                break;
            }
        }
    }
    engine.on_local_close(id);
}

async fn write_loop(
    id: FlowId,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    engine: Arc<Engine>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCommand::Write(bytes) => {
                if let Err(err) = write_half.write_all(&bytes).await {
                    logger::breadcrumb(
                        BreadcrumbFlags::TCP,
                        format!("local write error on flow {id}: {err}"),
                    );
                    break;
                }
            }
            WriteCommand::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
    engine.on_local_close(id);
}

/// Client-side fixed listener: binds `0.0.0.0:<client_listen_port>` and
/// accepts connections until the supervisor shuts the plane down.
pub async fn run_listener(config: EngineConfig, engine: Arc<Engine>) -> std::io::Result<()> {
    let listener = bind_reusable(config.client_listen_port).await?;
    logger::info(format!(
        "listening on 0.0.0.0:{}",
        config.client_listen_port
    ));
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let id = match engine.flow_table().generate_id() {
                Ok(id) => id,
                Err(err) => {
                    logger::error(format!("flow-id generation failed: {err}"));
                    return;
                }
            };
            logger::breadcrumb(
                BreadcrumbFlags::TCP,
                format!("accepted {peer} as flow {id}"),
            );
            let endpoint = spawn_endpoint(id, stream, Arc::clone(&engine));
            if engine.flow_table().add(id, endpoint).is_err() {
                logger::error(format!("duplicate flow-id {id} on accept"));
            }
        });
    }
}

/// Binds with `SO_REUSEADDR` set before `bind(2)`, which the std socket API
/// has no hook for. Mirrors the raw-libc-syscall style the standalone
/// runner already uses for platform socket setup.
async fn bind_reusable(port: u16) -> std::io::Result<TcpListener> {
    use std::io;
    use std::net::Ipv4Addr;
    use std::os::fd::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let reuse: libc::c_int = 1;
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(Ipv4Addr::UNSPECIFIED).to_be();

        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 1024) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let std_listener = std::net::TcpListener::from_raw_fd(fd);
        TcpListener::from_std(std_listener)
    }
}
