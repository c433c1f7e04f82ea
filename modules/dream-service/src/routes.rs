//! Axum route handlers for the dream service RPC API.

use crate::agents::AgentRegistry;
use crate::db::Db;
use crate::liquidity::LiquidityMonitor;
use crate::memory::MemoryStore;
use crate::relayer::{SubmitError, ZeroCostRelayer};
use crate::scoring::{self, PerformanceMonitor};
use crate::syndicate::Syndicate;
use crate::tokens;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use dream_types::*;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

const RELAY_HISTORY_LIMIT: usize = 100;

pub struct AppState {
    pub db: Arc<Db>,
    pub memory: Arc<MemoryStore>,
    pub syndicate: Syndicate,
    pub performance: PerformanceMonitor,
    pub liquidity: LiquidityMonitor,
    pub relayer: ZeroCostRelayer,
    pub agents: Arc<AgentRegistry>,
    pub treasury_address: String,
    pub chain_id: u64,
    pub simulation_mode: bool,
    pub start_time: Instant,
    pub last_tick_at: Arc<Mutex<Option<String>>>,
    pub poll_interval_secs: u64,
}

// =====================================================
// Contract Endpoints
// =====================================================

// POST /rpc/contracts/deploy
pub async fn contracts_deploy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeployRequest>,
) -> (StatusCode, Json<RpcResponse<Deployment>>) {
    match state.syndicate.deploy(&req.contract, &req.constructor_args).await {
        Ok(deployment) => (StatusCode::OK, Json(RpcResponse::ok(deployment))),
        Err(e) => {
            log::error!("[RPC] Deploy of {} failed: {}", req.contract, e);
            (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e)))
        }
    }
}

// POST /rpc/contracts/audit
pub async fn contracts_audit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuditRequest>,
) -> (StatusCode, Json<RpcResponse<AuditRecord>>) {
    if state.syndicate.deployment(&req.contract).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(format!("{} is not deployed", req.contract))),
        );
    }
    match state.syndicate.audit(&req.contract).await {
        Ok(record) => (StatusCode::OK, Json(RpcResponse::ok(record))),
        Err(e) => (StatusCode::BAD_GATEWAY, Json(RpcResponse::err(e))),
    }
}

// GET /rpc/contracts/list
pub async fn contracts_list(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<Deployment>>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.syndicate.deployments())))
}

// =====================================================
// Dream Endpoints
// =====================================================

// POST /rpc/dreams/record
pub async fn dreams_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordDreamRequest>,
) -> (StatusCode, Json<RpcResponse<DreamRecord>>) {
    match state
        .syndicate
        .record_dream(&req.dream, req.dreamer.as_deref())
        .await
    {
        Ok(record) => (StatusCode::OK, Json(RpcResponse::ok(record))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// GET /rpc/dreams/list
pub async fn dreams_list(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<DreamRecord>>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.syndicate.dreams())))
}

// =====================================================
// Token Endpoints
// =====================================================

// POST /rpc/tokens/deploy_suite
pub async fn tokens_deploy_suite(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<TokenRecord>>>) {
    match tokens::deploy_token_suite(&state.syndicate, &state.treasury_address).await {
        Ok(created) => (StatusCode::OK, Json(RpcResponse::ok(created))),
        Err(e) => {
            log::error!("[RPC] Token suite deployment failed: {}", e);
            (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e)))
        }
    }
}

// GET /rpc/tokens/treasury
pub async fn tokens_treasury(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<TreasuryStatus>>) {
    let status = state
        .memory
        .read(|doc| tokens::treasury_status(doc, &state.treasury_address));
    (StatusCode::OK, Json(RpcResponse::ok(status)))
}

// =====================================================
// Score Endpoints
// =====================================================

// POST /rpc/scores/analyze
pub async fn scores_analyze(
    Json(req): Json<AnalyzeScoresRequest>,
) -> (StatusCode, Json<RpcResponse<AgentScores>>) {
    (
        StatusCode::OK,
        Json(RpcResponse::ok(scoring::calculate_agent_scores(&req.dreams))),
    )
}

// POST /rpc/scores/record
pub async fn scores_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordScoresRequest>,
) -> (StatusCode, Json<RpcResponse<ScoreSnapshot>>) {
    match state
        .performance
        .record(&req.agent, &req.dreams, req.publish)
        .await
    {
        Ok(snapshot) => (StatusCode::OK, Json(RpcResponse::ok(snapshot))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// POST /rpc/scores/summary
pub async fn scores_summary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScoreSummaryRequest>,
) -> (StatusCode, Json<RpcResponse<ScoreSummaryResponse>>) {
    let (summary, rebalance_needed) = state.performance.summary(&req.agent);
    (
        StatusCode::OK,
        Json(RpcResponse::ok(ScoreSummaryResponse {
            agent: req.agent,
            summary,
            rebalance_needed,
        })),
    )
}

// POST /rpc/scores/distribute
pub async fn scores_distribute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DistributeRewardsRequest>,
) -> (StatusCode, Json<RpcResponse<String>>) {
    match state.performance.distribute_rewards(&req.token).await {
        Ok(outcome) => (StatusCode::OK, Json(RpcResponse::ok(outcome.tx_hash))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// POST /rpc/scores/rebalance
pub async fn scores_rebalance(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<String>>) {
    match state.performance.force_rebalance().await {
        Ok(outcome) => (StatusCode::OK, Json(RpcResponse::ok(outcome.tx_hash))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// =====================================================
// Liquidity Endpoints
// =====================================================

// POST /rpc/liquidity/monitor
pub async fn liquidity_monitor(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MonitorLiquidityRequest>,
) -> (StatusCode, Json<RpcResponse<LiquidityState>>) {
    match state
        .liquidity
        .monitor(&req.token_address, &req.symbol, &req.pairs)
        .await
    {
        Ok(snapshot) => (StatusCode::OK, Json(RpcResponse::ok(snapshot))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// POST /rpc/liquidity/summary
pub async fn liquidity_summary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LiquiditySummaryRequest>,
) -> (StatusCode, Json<RpcResponse<LiquiditySummary>>) {
    match state.liquidity.summary(&req.symbol) {
        Some(summary) => (StatusCode::OK, Json(RpcResponse::ok(summary))),
        None => (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(format!("No liquidity data for {}", req.symbol))),
        ),
    }
}

// POST /rpc/liquidity/alerts
pub async fn liquidity_alerts(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LiquidityAlertsRequest>,
) -> (StatusCode, Json<RpcResponse<Vec<LiquidityAlert>>>) {
    (
        StatusCode::OK,
        Json(RpcResponse::ok(state.liquidity.alerts(req.symbol.as_deref()))),
    )
}

// =====================================================
// Relay Endpoints
// =====================================================

// POST /rpc/relay/submit
pub async fn relay_submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RelayRequest>,
) -> (StatusCode, Json<RpcResponse<RelaySubmitResponse>>) {
    match state.relayer.submit(req) {
        Ok(queue_depth) => (
            StatusCode::ACCEPTED,
            Json(RpcResponse::ok(RelaySubmitResponse {
                status: "queued".to_string(),
                queue_depth,
            })),
        ),
        Err(e @ SubmitError::QueueFull) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcResponse::err(e.to_string())),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e.to_string()))),
    }
}

// GET /rpc/relay/stats
pub async fn relay_stats(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<RelayerStats>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.relayer.stats())))
}

// GET /rpc/relay/belief_rewrites
pub async fn relay_belief_rewrites(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<BeliefRewrite>>>) {
    (
        StatusCode::OK,
        Json(RpcResponse::ok(state.relayer.belief_rewrites())),
    )
}

// GET /rpc/relay/history
pub async fn relay_history(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<RelayRecord>>>) {
    match state.relayer.history(RELAY_HISTORY_LIMIT) {
        Ok(records) => (StatusCode::OK, Json(RpcResponse::ok(records))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(RpcResponse::err(e))),
    }
}

// =====================================================
// Event Endpoints
// =====================================================

// POST /rpc/events/query
pub async fn events_query(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<EventFilter>,
) -> (StatusCode, Json<RpcResponse<Vec<ChainEvent>>>) {
    match state.db.query_events(&filter) {
        Ok(events) => (StatusCode::OK, Json(RpcResponse::ok(events))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Query failed: {}", e))),
        ),
    }
}

// GET /rpc/events/stats
pub async fn events_stats(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<EventStatistics>>) {
    match state.db.event_stats() {
        Ok(stats) => (StatusCode::OK, Json(RpcResponse::ok(stats))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Stats failed: {}", e))),
        ),
    }
}

// =====================================================
// Agent & Service Endpoints
// =====================================================

// GET /rpc/agents/validate
pub async fn agents_validate(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<AddressValidation>>>) {
    (
        StatusCode::OK,
        Json(RpcResponse::ok(state.agents.validate_addresses())),
    )
}

// POST /rpc/agents/balance
pub async fn agents_balance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentBalanceRequest>,
) -> (StatusCode, Json<RpcResponse<AgentBalanceResponse>>) {
    let chain = state.syndicate.chain().as_ref();
    let balance = match req.token.as_deref() {
        Some(symbol) => state.agents.token_balance(chain, &req.agent, symbol).await,
        None => state.agents.agent_balance(chain, &req.agent).await,
    };
    match balance {
        Ok(balance) => (
            StatusCode::OK,
            Json(RpcResponse::ok(AgentBalanceResponse {
                agent: req.agent,
                token: req.token,
                balance,
            })),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e))),
    }
}

// POST /rpc/agents/permission
pub async fn agents_permission(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentPermissionRequest>,
) -> (StatusCode, Json<RpcResponse<AgentPermissionResponse>>) {
    if state.agents.agent_address(&req.agent).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(format!("Unknown agent: {}", req.agent))),
        );
    }
    let allowed = state.agents.check_permission(&req.agent, &req.permission);
    let permissions = state.agents.permissions(&req.agent).to_vec();
    (
        StatusCode::OK,
        Json(RpcResponse::ok(AgentPermissionResponse {
            agent: req.agent,
            permission: req.permission,
            allowed,
            permissions,
        })),
    )
}

// GET /rpc/memory/export
pub async fn memory_export(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<MemoryDocument>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.memory.snapshot())))
}

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let last_tick = state.last_tick_at.lock().await.clone();
    let events_captured = state.db.event_count().unwrap_or(0);

    let status = state.memory.read(|doc| ServiceStatus {
        running: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        simulation_mode: state.simulation_mode,
        chain_id: state.chain_id,
        deployments: doc.deployments.len(),
        dreams: doc.dreams.len(),
        audits: doc.audits.len(),
        tokens: doc.tokens.len(),
        provenance: doc.provenance_counts(),
        relayer_queue_depth: state.relayer.queue_depth(),
        events_captured,
        last_listener_tick_at: last_tick,
        listener_poll_interval_secs: state.poll_interval_secs,
    });

    (StatusCode::OK, Json(RpcResponse::ok(status)))
}
