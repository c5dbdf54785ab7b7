//! Black-box scenarios driving two `Supervisor`s over a loopback overlay,
//! covering the literal end-to-end cases this tunnel is expected to pass.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tunnelmux::config::EngineConfig;
use tunnelmux::overlay::{LoopbackOverlay, OverlayStatus, OverlayTransport};
use tunnelmux::supervisor::Supervisor;

/// Polls `cond` until it returns true or `timeout` elapses, matching the
/// wait-for-condition idiom used around this codebase's async tests.
async fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn free_client_port() -> u16 {
    use std::net::TcpListener as StdListener;
    let listener = StdListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

struct Harness {
    host: Supervisor,
    client: Supervisor,
    client_port: u16,
}

async fn start_pair(local_port: u16) -> Harness {
    let client_port = free_client_port();

    let mut host_config = EngineConfig::new(true, local_port);
    host_config.client_listen_port = client_port;
    let mut client_config = EngineConfig::new(false, 0);
    client_config.client_listen_port = client_port;

    let (host_overlay, client_overlay) = LoopbackOverlay::pair();
    let host = Supervisor::start(host_config, Arc::new(host_overlay));
    let client = Supervisor::start(client_config, Arc::new(client_overlay));

    assert!(
        wait_for(Duration::from_secs(1), || {
            host.engine().stats().overlay_up && client.engine().stats().overlay_up
        })
        .await,
        "overlay pump never marked the pipe connected"
    );

    Harness {
        host,
        client,
        client_port,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_tunnel_round_trips_bytes() {
    let echo_port = spawn_echo_server().await;
    let harness = start_pair(echo_port).await;

    let mut conn = TcpStream::connect(("127.0.0.1", harness.client_port))
        .await
        .unwrap();
    conn.write_all(b"ping\n").await.unwrap();

    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping\n");

    assert_eq!(harness.client.engine().stats().live_flows, 1);
    assert_eq!(harness.host.engine().stats().live_flows, 1);

    drop(conn);
    harness.host.shutdown().await;
    harness.client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_close_tears_down_both_sides() {
    let echo_port = spawn_echo_server().await;
    let harness = start_pair(echo_port).await;

    let mut conn = TcpStream::connect(("127.0.0.1", harness.client_port))
        .await
        .unwrap();
    conn.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    conn.read_exact(&mut buf).await.unwrap();

    drop(conn);

    assert!(
        wait_for(Duration::from_secs(1), || {
            harness.client.engine().stats().live_flows == 0
                && harness.host.engine().stats().live_flows == 0
        })
        .await,
        "flow tables did not drain after client closed its socket"
    );

    harness.host.shutdown().await;
    harness.client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_service_unavailable_drops_silently() {
    let unused_port = free_client_port();
    let harness = start_pair(unused_port).await;

    let mut conn = TcpStream::connect(("127.0.0.1", harness.client_port))
        .await
        .unwrap();
    conn.write_all(b"y").await.unwrap();

    // Host never admits a flow because the dial fails; client's own flow
    // stays open until it closes its local socket.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.host.engine().stats().live_flows, 0);
    assert_eq!(harness.client.engine().stats().live_flows, 1);

    drop(conn);
    harness.host.shutdown().await;
    harness.client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interleaved_flows_do_not_cross_contaminate() {
    let echo_port = spawn_echo_server().await;
    let harness = start_pair(echo_port).await;

    let mut conn_a = TcpStream::connect(("127.0.0.1", harness.client_port))
        .await
        .unwrap();
    let mut conn_b = TcpStream::connect(("127.0.0.1", harness.client_port))
        .await
        .unwrap();

    let payload_a = vec![b'A'; 1000];
    let payload_b = vec![b'B'; 1000];

    let (send_a, send_b) = tokio::join!(
        conn_a.write_all(&payload_a),
        conn_b.write_all(&payload_b),
    );
    send_a.unwrap();
    send_b.unwrap();

    let mut echo_a = vec![0u8; 1000];
    let mut echo_b = vec![0u8; 1000];
    let (read_a, read_b) = tokio::join!(
        conn_a.read_exact(&mut echo_a),
        conn_b.read_exact(&mut echo_b),
    );
    read_a.unwrap();
    read_b.unwrap();

    assert_eq!(echo_a, payload_a);
    assert_eq!(echo_b, payload_b);

    harness.host.shutdown().await;
    harness.client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlay_loss_closes_local_sockets() {
    let echo_port = spawn_echo_server().await;
    let client_port = free_client_port();

    let mut host_config = EngineConfig::new(true, echo_port);
    host_config.client_listen_port = client_port;
    let mut client_config = EngineConfig::new(false, 0);
    client_config.client_listen_port = client_port;

    let (host_overlay, client_overlay) = LoopbackOverlay::pair();
    let host_overlay = Arc::new(host_overlay);
    let overlay_for_supervisor: Arc<dyn OverlayTransport> = host_overlay.clone();
    let host = Supervisor::start(host_config, overlay_for_supervisor);
    let client = Supervisor::start(client_config, Arc::new(client_overlay));

    assert!(
        wait_for(Duration::from_secs(1), || client.engine().stats().overlay_up).await
    );

    let mut conn = TcpStream::connect(("127.0.0.1", client_port)).await.unwrap();
    conn.write_all(b"z").await.unwrap();
    let mut buf = [0u8; 1];
    conn.read_exact(&mut buf).await.unwrap();

    host_overlay.inject_status(OverlayStatus::ProblemDetectedLocally);

    assert!(
        wait_for(Duration::from_secs(1), || {
            host.engine().stats().live_flows == 0
        })
        .await,
        "host did not drain its flows after overlay loss"
    );

    // The client's own TCP socket observes the tunnel going away when it
    // next tries to use it.
    let mut probe = [0u8; 1];
    let _ = conn.write_all(b"w").await;
    let _ = conn.read(&mut probe).await;

    host.shutdown().await;
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_id_as_client_is_dropped() {
    let client_port = free_client_port();
    let mut client_config = EngineConfig::new(false, 0);
    client_config.client_listen_port = client_port;

    let (peer_overlay, client_overlay) = LoopbackOverlay::pair();
    let client = Supervisor::start(client_config, Arc::new(client_overlay));

    assert!(wait_for(Duration::from_secs(1), || client.engine().stats().overlay_up).await);

    let mut frame = b"ABCDEF\0".to_vec();
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(b"unsolicited");
    peer_overlay.send(frame).unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.engine().stats().live_flows, 0);

    client.shutdown().await;
}
