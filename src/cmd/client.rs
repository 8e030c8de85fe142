use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use tunvpn::cli::{Cli, Command, EXIT_GENERIC_FAILURE, EXIT_OK};
use tunvpn::codec::TunnelMessage;
use tunvpn::config;
use tunvpn::session::SessionClient;
use tunvpn::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .expect("failed to install global tracing subscriber");

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return e.exit_code();
        }
    };

    match cli.command {
        Command::Start { http_port } => run_start(cfg, cli.state_dir, http_port).await,
        Command::Status { http_port } => run_status(http_port).await,
        Command::ListNodes => run_list_nodes(cfg).await,
        Command::Test => run_test(cfg).await,
    }
}

async fn run_start(
    cfg: tunvpn::config::ClientConfig,
    state_dir: std::path::PathBuf,
    http_port: Option<u16>,
) -> i32 {
    if let Some(port) = http_port {
        tokio::spawn(async move {
            if let Err(e) = tunvpn::status::serve(port).await {
                tracing::error!("status endpoint failed: {e}");
            }
        });
    }

    let supervisor = Supervisor::new(cfg, state_dir);
    match supervisor.run().await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            tracing::error!("tunnel exited: {e}");
            e.exit_code()
        }
    }
}

async fn run_status(http_port: u16) -> i32 {
    let url = format!("http://127.0.0.1:{http_port}/status");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => {
                println!("{body}");
                EXIT_OK
            }
            Err(e) => {
                tracing::error!("reading status response: {e}");
                EXIT_GENERIC_FAILURE
            }
        },
        Ok(resp) => {
            tracing::error!("status endpoint returned {}", resp.status());
            EXIT_GENERIC_FAILURE
        }
        Err(e) => {
            tracing::error!("could not reach status endpoint at {url}: {e}");
            EXIT_GENERIC_FAILURE
        }
    }
}

/// One-shot connect, print the `Welcome.nodes` roster, disconnect.
/// Read-only: no node-switching logic is implemented (multi-hop routing
/// is an explicit non-goal).
async fn run_list_nodes(cfg: tunvpn::config::ClientConfig) -> i32 {
    let cfg = Arc::new(cfg);
    let (inbound_tx, _inbound_rx) = mpsc::channel::<TunnelMessage>(16);
    let cancel = CancellationToken::new();

    match SessionClient::connect(Arc::clone(&cfg), inbound_tx, cancel.clone()).await {
        Ok((mut session, _outbound_tx, event)) => {
            if let tunvpn::session::SessionEvent::Authenticated { nodes } = event {
                if nodes.is_empty() {
                    println!("no nodes advertised by server");
                } else {
                    for node in &nodes {
                        println!("{}\t{}\t{}", node.id, node.name, node.host);
                    }
                }
            }
            cancel.cancel();
            session.close().await;
            EXIT_OK
        }
        Err(e) => {
            tracing::error!("list-nodes failed: {e}");
            e.exit_code()
        }
    }
}

/// One-shot connect + Welcome wait + ping/pong round trip, reporting
/// latency — the protocol-level equivalent of the original prototype's
/// `test_connection`, which shelled out to `ping`/`nslookup`.
async fn run_test(cfg: tunvpn::config::ClientConfig) -> i32 {
    let cfg = Arc::new(cfg);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<TunnelMessage>(16);
    let cancel = CancellationToken::new();

    let (mut session, outbound_tx, _event) =
        match SessionClient::connect(Arc::clone(&cfg), inbound_tx, cancel.clone()).await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("connect failed: {e}");
                return e.exit_code();
            }
        };

    let sent_at = tokio::time::Instant::now();
    let ts_ms = now_ms();
    if outbound_tx.send(TunnelMessage::Ping { ts_ms }).await.is_err() {
        tracing::error!("failed to send ping");
        cancel.cancel();
        session.close().await;
        return EXIT_GENERIC_FAILURE;
    }

    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match inbound_rx.recv().await {
                Some(TunnelMessage::Pong { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;

    cancel.cancel();
    session.close().await;

    match result {
        Ok(true) => {
            let rtt = sent_at.elapsed();
            println!("tunnel reachable, round trip {:.1}ms", rtt.as_secs_f64() * 1000.0);
            EXIT_OK
        }
        _ => {
            tracing::error!("no pong received within 5s");
            EXIT_GENERIC_FAILURE
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
