use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use fleetmon_common::proto::fleet_service_server::FleetServiceServer;
use fleetmon_storage::Store;

use fleetmon_server::config::Config;
use fleetmon_server::rpc::FleetRpc;
use fleetmon_server::state::AppState;
use fleetmon_server::{housekeeping, nat, rpc, web};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct CliParams {
    config_path: PathBuf,
    database_path: PathBuf,
    version: bool,
}

fn parse_args() -> CliParams {
    let mut params = CliParams {
        config_path: PathBuf::from("data/config.yaml"),
        database_path: PathBuf::from("data/sqlite.db"),
        version: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                if let Some(v) = args.next() {
                    params.config_path = PathBuf::from(v);
                }
            }
            "-db" | "--database" => {
                if let Some(v) = args.next() {
                    params.database_path = PathBuf::from(v);
                }
            }
            "-v" | "--version" => params.version = true,
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: fleetmon-server [-c config.yaml] [-db sqlite.db] [-v]");
                std::process::exit(2);
            }
        }
    }
    params
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let params = parse_args();
    if params.version {
        println!("{VERSION}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("fleetmon=info".parse()?),
        )
        .init();

    let config = Config::load(&params.config_path)
        .with_context(|| format!("loading config from {}", params.config_path.display()))?;

    if let Some(dir) = params.database_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let db_url = format!("sqlite://{}?mode=rwc", params.database_path.display());
    let store = Store::connect(&db_url)
        .await
        .with_context(|| format!("opening database {db_url}"))?;
    store.bootstrap().await.context("creating tables")?;

    let listen_host = config.listen_host.clone();
    let http_port = config.listen_port;
    let grpc_port = config.grpc_listen_port;
    let nat_port = config.nat_listen_port;

    let (state, dispatch_rx) = AppState::build(config, store)
        .await
        .context("building components")?;

    // startup retention pass mirrors the nightly job
    if let Err(e) = housekeeping::clean_history(&state).await {
        tracing::warn!(error = %e, "startup history cleanup failed");
    }
    housekeeping::register(&state).context("registering housekeeping jobs")?;
    rpc::register_keepalive(&state);
    tokio::spawn(rpc::dispatch_probes(state.clone(), dispatch_rx));
    tokio::spawn(state.alerts.clone().run());

    let bind_host = if listen_host.is_empty() {
        "0.0.0.0".to_string()
    } else {
        listen_host
    };

    let grpc_addr: SocketAddr = format!("{bind_host}:{grpc_port}")
        .parse()
        .context("invalid gRPC listen address")?;
    let grpc_state = state.clone();
    tokio::spawn(async move {
        tracing::info!(addr = %grpc_addr, "agent gRPC listener started");
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(FleetServiceServer::new(FleetRpc::new(grpc_state)))
            .serve(grpc_addr)
            .await
        {
            tracing::error!(error = %e, "gRPC server exited");
        }
    });

    let http_addr = format!("{bind_host}:{http_port}");
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("binding {http_addr}"))?;
    let http_state = state.clone();
    tokio::spawn(async move {
        tracing::info!(addr = %http_addr, "status surface started");
        if let Err(e) = axum::serve(http_listener, web::router(http_state)).await {
            tracing::error!(error = %e, "HTTP server exited");
        }
    });

    if nat_port != 0 {
        let nat_addr = format!("{bind_host}:{nat_port}");
        let nat_listener = TcpListener::bind(&nat_addr)
            .await
            .with_context(|| format!("binding {nat_addr}"))?;
        let nat_state = state.clone();
        tokio::spawn(async move {
            tracing::info!(addr = %nat_addr, "nat tunnel listener started");
            nat::serve(nat_listener, nat_state).await;
        });
    }

    shutdown_signal().await;
    tracing::info!("shutting down, draining hourly transfer usage");
    housekeeping::record_transfer_hourly_usage(&state).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
