use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use in3_node::{
    ChainContext, ChainHandler, ChainSettings, ChainSource, EventWatcher, HttpPeerClient,
    NodeConfig, PeerClient, UpstreamRpcClient, WatcherHealth, WatcherStatus,
};
use in3_node_merkle::ProofEngine;
use in3_node_rpc::In3RpcServer;
use in3_node_storage::FileCheckpointStore;
use in3_node_types::{Address, BlockNumber, ProofStatus};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Verification node serving signed block hashes and proven node lists")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "IN3_NODE_CONFIG", default_value = "config/in3-node.toml")]
    config: PathBuf,
    /// Overrides `server.rpc_bind`
    #[arg(long, env = "IN3_NODE_RPC_BIND")]
    rpc_bind: Option<SocketAddr>,
}

struct ChainEntry {
    server: In3RpcServer<ChainHandler>,
    health: WatcherHealth,
    upstream: String,
}

#[derive(Clone)]
struct AppState {
    chains: Arc<BTreeMap<String, ChainEntry>>,
    default_chain: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainStatusPayload {
    chain_id: String,
    upstream: String,
    registry: Address,
    signer: Option<Address>,
    node_count: usize,
    last_block_number: BlockNumber,
    proof_status: ProofStatus,
    watcher: WatcherStatus,
}

fn main() -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = NodeConfig::load(&cli.config)?;
    if let Some(rpc_bind) = cli.rpc_bind {
        config.server.rpc_bind = rpc_bind;
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_keep_alive(config.worker_idle_timeout())
        .build()
        .map_err(|error| format!("failed to build tokio runtime: {error}"))?;
    runtime.block_on(run(config))
}

async fn run(config: NodeConfig) -> Result<(), String> {
    let proofs = Arc::new(ProofEngine::new(&config.proof_engine()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut watchers = JoinSet::new();
    let mut chains = BTreeMap::new();

    for chain in &config.chains {
        let upstream = UpstreamRpcClient::new(chain.upstream_rpc_url.clone(), chain.rpc_timeout())
            .map_err(|error| format!("chain {}: {error}", chain.id))?;
        let source: Arc<dyn ChainSource> = Arc::new(upstream);
        let peers: Arc<dyn PeerClient> = Arc::new(
            HttpPeerClient::new(chain.rpc_timeout())
                .map_err(|error| format!("chain {}: {error}", chain.id))?,
        );
        let context = Arc::new(ChainContext::new(
            ChainSettings::from(chain),
            Arc::clone(&proofs),
        ));
        let handler = ChainHandler::new(
            Arc::clone(&source),
            peers,
            Arc::clone(&context),
            chain.signer()?,
        );

        match handler.sync().await {
            Ok(snapshot) => info!(
                chain = %chain.id,
                nodes = snapshot.nodes.len(),
                block = snapshot.last_block_number,
                proof = ?snapshot.proof_status,
                "initial node list synchronized"
            ),
            Err(error) => warn!(chain = %chain.id, %error, "initial node list sync failed"),
        }

        let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoint_path(chain)));
        let watcher = EventWatcher::new(
            source,
            context,
            checkpoints,
            chain.watch_interval(),
            chain.max_consecutive_failures,
        );
        let health = watcher.health();
        let shutdown = shutdown_rx.clone();
        watchers.spawn(async move { watcher.run(shutdown).await });

        info!(
            chain = %chain.id,
            upstream = %redact_rpc_url(&chain.upstream_rpc_url),
            registry = %chain.registry,
            signer = ?handler.signer_address(),
            "chain handler ready"
        );
        chains.insert(
            chain.id.clone(),
            ChainEntry {
                server: In3RpcServer::new(handler),
                health,
                upstream: redact_rpc_url(&chain.upstream_rpc_url),
            },
        );
    }

    let default_chain = config
        .chains
        .first()
        .map(|chain| chain.id.clone())
        .ok_or_else(|| "no chains configured".to_string())?;
    let state = AppState {
        chains: Arc::new(chains),
        default_chain,
    };
    let app = Router::new()
        .route("/", post(handle_default_rpc))
        .route("/{chain}", post(handle_chain_rpc))
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(state);

    let rpc_bind = config.server.rpc_bind;
    let listener = TcpListener::bind(rpc_bind)
        .await
        .map_err(|error| format!("failed to bind RPC endpoint {rpc_bind}: {error}"))?;
    info!(%rpc_bind, chains = config.chains.len(), "in3-node listening");

    let mut rpc_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .map_err(|error| format!("rpc server failed: {error}"))
    });

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            rpc_handle.abort();
            Ok(())
        }
        joined = &mut rpc_handle => match joined {
            Ok(result) => result,
            Err(error) => Err(format!("rpc server task join error: {error}")),
        },
    };

    if shutdown_tx.send(true).is_err() {
        warn!("all watchers exited before shutdown");
    }
    while let Some(joined) = watchers.join_next().await {
        if let Err(error) = joined {
            warn!(%error, "watcher task join error");
        }
    }
    outcome
}

async fn handle_default_rpc(State(state): State<AppState>, raw: String) -> Response {
    let chain = state.default_chain.clone();
    dispatch(&state, &chain, &raw).await
}

async fn handle_chain_rpc(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    raw: String,
) -> Response {
    dispatch(&state, &chain, &raw).await
}

async fn dispatch(state: &AppState, chain: &str, raw: &str) -> Response {
    let Some(entry) = state.chains.get(chain) else {
        return (StatusCode::NOT_FOUND, format!("unknown chain `{chain}`")).into_response();
    };
    let response = entry.server.handle_raw(raw).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        response,
    )
        .into_response()
}

async fn healthz(State(state): State<AppState>) -> Response {
    let mut outages = Vec::new();
    for (chain, entry) in state.chains.iter() {
        match entry.health.status() {
            Ok(status) if status.outage => outages.push(chain.clone()),
            Ok(_) => {}
            Err(error) => return (StatusCode::INTERNAL_SERVER_ERROR, error).into_response(),
        }
    }
    if outages.is_empty() {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("upstream outage on chains: {}", outages.join(", ")),
        )
            .into_response()
    }
}

async fn status(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChainStatusPayload>>, (StatusCode, String)> {
    let internal = |error: String| (StatusCode::INTERNAL_SERVER_ERROR, error);
    let mut payload = Vec::with_capacity(state.chains.len());
    for (chain, entry) in state.chains.iter() {
        let handler = entry.server.backend();
        let snapshot = handler
            .context()
            .snapshot()
            .map_err(|error| internal(error.to_string()))?;
        payload.push(ChainStatusPayload {
            chain_id: chain.clone(),
            upstream: entry.upstream.clone(),
            registry: handler.context().registry(),
            signer: handler.signer_address(),
            node_count: snapshot.nodes.len(),
            last_block_number: snapshot.last_block_number,
            proof_status: snapshot.proof_status,
            watcher: entry.health.status().map_err(internal)?,
        });
    }
    Ok(Json(payload))
}

fn redact_rpc_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("unknown-host");
            let port = url
                .port()
                .map(|value| format!(":{value}"))
                .unwrap_or_default();
            format!("{}://{}{port}", url.scheme(), host)
        }
        Err(_) => "<invalid-rpc-url>".to_string(),
    }
}
