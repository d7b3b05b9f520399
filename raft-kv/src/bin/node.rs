//! Runs one store node with its HTTP API.
//!
//! Start a three node cluster:
//! ```bash
//! cargo run --bin node -- --id 1 --http-addr 127.0.0.1:11001 --raft-addr 127.0.0.1:12001 --data-dir /tmp/kv1
//! cargo run --bin node -- --id 2 --http-addr 127.0.0.1:11002 --raft-addr 127.0.0.1:12002 --data-dir /tmp/kv2 --join 127.0.0.1:11001
//! cargo run --bin node -- --id 3 --http-addr 127.0.0.1:11003 --raft-addr 127.0.0.1:12003 --data-dir /tmp/kv3 --join 127.0.0.1:11001
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_kv::api;
use raft_kv::cli::Cli;
use raft_kv::error::StoreError;
use raft_kv::store::{RaftStore, Store};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.store_config();
    let open_timeout = cli.open_timeout();

    let store = tokio::task::spawn_blocking(move || RaftStore::open(config))
        .await
        .context("store open task failed")?
        .context("failed to open store")?;
    let store = Arc::new(store);

    let listener = TcpListener::bind(&cli.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP address {}", cli.http_addr))?;

    if let Some(join_addr) = &cli.join {
        api::request_join(join_addr, &cli.http_addr, &cli.raft_addr, cli.id).await?;
        info!(join_addr = %join_addr, "joined cluster");
    }

    {
        let store = Arc::clone(&store);
        let http_addr = cli.http_addr.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let leader = store.wait_for_leader(open_timeout)?;
            let applied = store.wait_for_applied(open_timeout)?;
            info!(leader, applied, "store ready");
            match store.set_meta(store.node_id(), &http_addr) {
                Ok(()) | Err(StoreError::NotLeader) => {}
                Err(err) => warn!(error = %err, "failed to record node metadata"),
            }
            Ok(())
        })
        .await
        .context("start-up task failed")??;
    }

    let app = api::router(Arc::clone(&store));
    info!(http_addr = %cli.http_addr, node_id = cli.id, "serving HTTP API");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {err}");
            }
        })
        .await;

    info!("shutting down");
    tokio::task::spawn_blocking(move || store.shutdown())
        .await
        .context("store shutdown task failed")?;
    served.context("HTTP server failed")
}
