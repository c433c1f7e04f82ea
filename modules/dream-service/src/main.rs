//! Dream Service: dream recording, contract deployments, agent scoring,
//! liquidity monitoring and the zero-cost relayer behind one RPC API.
//!
//! Default: http://127.0.0.1:9110/

mod abi;
mod agents;
mod chain;
mod config;
mod db;
mod listener;
mod liquidity;
mod memory;
mod relayer;
mod routes;
mod scoring;
mod syndicate;
mod tokens;
mod wallet;

use chain::ChainClient;
use routes::AppState;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = config::Config::from_env().expect("Invalid configuration");

    let wallet = config.deployer_key.as_deref().map(|key| {
        wallet::DeployerWallet::from_private_key(key, config.chain_id)
            .expect("Invalid DEPLOYER_KEY")
    });

    let chain: Arc<dyn ChainClient> = if config.simulation_mode() {
        log::warn!("Simulation mode: transactions get 0xSIM hashes and never reach the chain");
        Arc::new(chain::SimulatedChainClient::new(
            wallet.as_ref().map(|w| w.address().to_string()),
        ))
    } else {
        log::info!("Connecting to {} (chain id {})", config.rpc_url, config.chain_id);
        Arc::new(
            chain::EvmChainClient::new(&config.rpc_url, wallet)
                .expect("Failed to create chain client"),
        )
    };

    log::info!("Opening memory at: {}", config.memory_path.display());
    let memory = Arc::new(
        memory::MemoryStore::open(&config.memory_path).expect("Failed to open memory file"),
    );

    log::info!("Opening database at: {}", config.db_path);
    let database = Arc::new(db::Db::open(&config.db_path).expect("Failed to open database"));

    let agents = Arc::new(
        agents::AgentRegistry::load(&config.agent_registry_path)
            .expect("Failed to load agent registry"),
    );

    let cancel = CancellationToken::new();
    let last_tick_at: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let (relayer, relayer_handle) = relayer::ZeroCostRelayer::spawn(
        relayer::RelayerSettings {
            queue_capacity: config.relayer_queue_capacity,
            belief_rewrites_enabled: config.belief_rewrites_enabled,
            microstructures_enabled: config.microstructures_enabled,
        },
        chain.clone(),
        database.clone(),
        cancel.clone(),
    );

    let listener_handle = tokio::spawn(listener::run_listener(
        database.clone(),
        memory.clone(),
        chain.clone(),
        listener::ListenerSettings {
            poll_interval_secs: config.listener_poll_secs,
            retry_interval_secs: config.listener_retry_secs,
            max_events: config.listener_max_events,
        },
        last_tick_at.clone(),
        cancel.clone(),
    ));

    let state = Arc::new(AppState {
        db: database.clone(),
        memory: memory.clone(),
        syndicate: syndicate::Syndicate::new(
            memory.clone(),
            chain.clone(),
            config.artifacts_dir.clone(),
            config.forwarder_address.clone(),
        ),
        performance: scoring::PerformanceMonitor::new(
            memory.clone(),
            chain.clone(),
            agents.clone(),
            config.distributor_address.clone(),
        ),
        liquidity: liquidity::LiquidityMonitor::new(
            Arc::new(liquidity::PoolFetcher::new(chain.clone())),
            config.stablecoins.clone(),
        ),
        relayer,
        agents,
        treasury_address: config.treasury_address.clone(),
        chain_id: config.chain_id,
        simulation_mode: config.simulation_mode(),
        start_time: Instant::now(),
        last_tick_at,
        poll_interval_secs: config.listener_poll_secs,
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Contracts
        .route(
            "/rpc/contracts/deploy",
            axum::routing::post(routes::contracts_deploy),
        )
        .route(
            "/rpc/contracts/audit",
            axum::routing::post(routes::contracts_audit),
        )
        .route(
            "/rpc/contracts/list",
            axum::routing::get(routes::contracts_list),
        )
        // Dreams
        .route(
            "/rpc/dreams/record",
            axum::routing::post(routes::dreams_record),
        )
        .route("/rpc/dreams/list", axum::routing::get(routes::dreams_list))
        // Tokens
        .route(
            "/rpc/tokens/deploy_suite",
            axum::routing::post(routes::tokens_deploy_suite),
        )
        .route(
            "/rpc/tokens/treasury",
            axum::routing::get(routes::tokens_treasury),
        )
        // Scores
        .route(
            "/rpc/scores/analyze",
            axum::routing::post(routes::scores_analyze),
        )
        .route(
            "/rpc/scores/record",
            axum::routing::post(routes::scores_record),
        )
        .route(
            "/rpc/scores/summary",
            axum::routing::post(routes::scores_summary),
        )
        .route(
            "/rpc/scores/distribute",
            axum::routing::post(routes::scores_distribute),
        )
        .route(
            "/rpc/scores/rebalance",
            axum::routing::post(routes::scores_rebalance),
        )
        // Liquidity
        .route(
            "/rpc/liquidity/monitor",
            axum::routing::post(routes::liquidity_monitor),
        )
        .route(
            "/rpc/liquidity/summary",
            axum::routing::post(routes::liquidity_summary),
        )
        .route(
            "/rpc/liquidity/alerts",
            axum::routing::post(routes::liquidity_alerts),
        )
        // Relayer
        .route(
            "/rpc/relay/submit",
            axum::routing::post(routes::relay_submit),
        )
        .route("/rpc/relay/stats", axum::routing::get(routes::relay_stats))
        .route(
            "/rpc/relay/belief_rewrites",
            axum::routing::get(routes::relay_belief_rewrites),
        )
        .route(
            "/rpc/relay/history",
            axum::routing::get(routes::relay_history),
        )
        // Events
        .route(
            "/rpc/events/query",
            axum::routing::post(routes::events_query),
        )
        .route("/rpc/events/stats", axum::routing::get(routes::events_stats))
        // Agents & service
        .route(
            "/rpc/agents/validate",
            axum::routing::get(routes::agents_validate),
        )
        .route(
            "/rpc/agents/balance",
            axum::routing::post(routes::agents_balance),
        )
        .route(
            "/rpc/agents/permission",
            axum::routing::post(routes::agents_permission),
        )
        .route(
            "/rpc/memory/export",
            axum::routing::get(routes::memory_export),
        )
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Dream Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown requested");
            shutdown.cancel();
        })
        .await
        .expect("Server error");

    cancel.cancel();
    relayer_handle.await.ok();
    listener_handle.await.ok();
}
