//! Standalone runner: brings up one peer of the tunnel against a TCP-pipe
//! overlay stand-in. Role and addressing are taken from hand-parsed flags,
//! matching the rest of this codebase's preference for a small manual
//! parser over a CLI-argument crate.

use std::net::SocketAddr;
use std::process;
use tunnelmux::config::EngineConfig;
use tunnelmux::overlay::TcpPipeOverlay;
use tunnelmux::supervisor::Supervisor;

struct Settings {
    host: bool,
    local_port: u16,
    overlay_listen: Option<SocketAddr>,
    overlay_connect: Option<SocketAddr>,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut host = false;
        let mut local_port: u16 = 0;
        let mut overlay_listen = None;
        let mut overlay_connect = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" => host = true,
                "--client" => host = false,
                "--local-port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--local-port requires a value"))?;
                    local_port = value.parse()?;
                }
                "--overlay-listen" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--overlay-listen requires a value"))?;
                    overlay_listen = Some(value.parse()?);
                }
                "--overlay-connect" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--overlay-connect requires a value"))?;
                    overlay_connect = Some(value.parse()?);
                }
                "--help" | "-h" => {
                    print_usage();
                    process::exit(0);
                }
                other => anyhow::bail!("unrecognized argument: {other}"),
            }
        }

        if overlay_listen.is_none() && overlay_connect.is_none() {
            anyhow::bail!("one of --overlay-listen or --overlay-connect is required");
        }
        if host && local_port == 0 {
            anyhow::bail!("--host requires --local-port");
        }

        Ok(Self {
            host,
            local_port,
            overlay_listen,
            overlay_connect,
        })
    }
}

fn print_usage() {
    eprintln!(
        "usage: tunnelmux [--host | --client] [--local-port N] \\\n    (--overlay-listen ADDR | --overlay-connect ADDR)\n\n\
         --host              act as the host: dial 127.0.0.1:<local-port> for new flows\n\
         --client             act as the client: listen on 0.0.0.0:8888 (default)\n\
         --local-port N       local service port to dial on the host side\n\
         --overlay-listen A   bind and wait for the peer to connect the overlay pipe\n\
         --overlay-connect A  dial the peer's overlay pipe"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse().map_err(|err| {
        print_usage();
        err
    })?;

    let overlay = match (settings.overlay_listen, settings.overlay_connect) {
        (Some(addr), _) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            eprintln!("[tunnelmux] waiting for overlay peer on {addr}");
            TcpPipeOverlay::accept(&listener).await?
        }
        (None, Some(addr)) => TcpPipeOverlay::connect(addr).await?,
        (None, None) => unreachable!("validated in Settings::parse"),
    };

    let config = EngineConfig::new(settings.host, settings.local_port);
    let supervisor = Supervisor::start(config, overlay);

    eprintln!(
        "[tunnelmux] running as {} (local_port={})",
        if settings.host { "host" } else { "client" },
        settings.local_port
    );

    tokio::signal::ctrl_c().await?;
    eprintln!("[tunnelmux] shutting down");
    supervisor.shutdown().await;
    Ok(())
}
