//! Shared types for the dream service and its RPC clients.
//!
//! The memory document defined here is the single persisted schema for
//! deployments, dreams, audits, tokens and score history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Current version of the on-disk memory document.
pub const MEMORY_SCHEMA_VERSION: u32 = 1;

// =====================================================
// Provenance
// =====================================================

/// Where a chain-facing result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by a real RPC submission
    OnChain,
    /// Fabricated locally by the simulation client
    Simulated,
    /// Legacy record written before provenance was tracked
    #[default]
    Unverified,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::OnChain => write!(f, "on_chain"),
            Provenance::Simulated => write!(f, "simulated"),
            Provenance::Unverified => write!(f, "unverified"),
        }
    }
}

/// Record counts grouped by provenance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceCounts {
    pub on_chain: usize,
    pub simulated: usize,
    pub unverified: usize,
}

impl ProvenanceCounts {
    pub fn add(&mut self, provenance: Provenance) {
        match provenance {
            Provenance::OnChain => self.on_chain += 1,
            Provenance::Simulated => self.simulated += 1,
            Provenance::Unverified => self.unverified += 1,
        }
    }
}

// =====================================================
// Memory Document
// =====================================================

/// A deployed contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub contract: String,
    pub address: String,
    #[serde(default)]
    pub abi: Value,
    pub bytecode: Option<String>,
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub gas_used: u64,
    pub deployer: Option<String>,
    pub deployed_at: String,
    #[serde(default)]
    pub provenance: Provenance,
}

/// A dream recorded as a transaction payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamRecord {
    pub id: String,
    pub dreamer: String,
    /// Full text; legacy hashed-only records keep just the preview
    pub dream: Option<String>,
    pub content_hash: String,
    pub content_preview: String,
    pub ipfs_hash: Option<String>,
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub token_reward: u64,
    pub recorded_at: String,
    #[serde(default)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditChecks {
    pub code_exists: bool,
    /// None on the first audit of a contract
    pub hash_matches: Option<bool>,
}

/// Result of auditing a deployed contract's runtime code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub contract: String,
    pub address: String,
    pub code_hash: String,
    pub code_size: usize,
    pub checks: AuditChecks,
    pub audited_at: String,
    #[serde(default)]
    pub provenance: Provenance,
}

/// A deployed token of the dream suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub symbol: String,
    pub name: String,
    pub address: String,
    pub decimals: u8,
    pub supply: u64,
    pub authority: Option<String>,
    pub tx_hash: Option<String>,
    pub treasury_address: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreasuryOperation {
    pub operation: String,
    pub treasury_address: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub occurred_at: String,
}

/// Aggregated agent scores over a batch of processed dreams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentScores {
    pub dream_score: u32,
    pub mind_score: u32,
    pub lucid_score: u32,
    pub successful_dreams: u32,
    pub total_dreams: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub recorded_at: String,
    pub scores: AgentScores,
    /// Set when the scores were published to the distributor
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

/// The persisted memory document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDocument {
    pub schema_version: u32,
    #[serde(default)]
    pub deployments: BTreeMap<String, Deployment>,
    #[serde(default)]
    pub dreams: Vec<DreamRecord>,
    #[serde(default)]
    pub audits: Vec<AuditRecord>,
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenRecord>,
    #[serde(default)]
    pub treasury_operations: Vec<TreasuryOperation>,
    #[serde(default)]
    pub score_history: BTreeMap<String, Vec<ScoreSnapshot>>,
    #[serde(default)]
    pub mev_rebates_claimed: u64,
    /// Keys this schema does not know about, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self {
            schema_version: MEMORY_SCHEMA_VERSION,
            deployments: BTreeMap::new(),
            dreams: Vec::new(),
            audits: Vec::new(),
            tokens: BTreeMap::new(),
            treasury_operations: Vec::new(),
            score_history: BTreeMap::new(),
            mev_rebates_claimed: 0,
            extra: serde_json::Map::new(),
        }
    }
}

impl MemoryDocument {
    /// Count every chain-facing record by provenance
    pub fn provenance_counts(&self) -> ProvenanceCounts {
        let mut counts = ProvenanceCounts::default();
        for d in self.deployments.values() {
            counts.add(d.provenance);
        }
        for d in &self.dreams {
            counts.add(d.provenance);
        }
        for a in &self.audits {
            counts.add(a.provenance);
        }
        for t in self.tokens.values() {
            counts.add(t.provenance);
        }
        counts
    }
}

// =====================================================
// Scoring Types
// =====================================================

/// Measurements from processing a single dream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DreamPerformance {
    pub interpretation_confidence: Option<f64>,
    pub pattern_match_score: Option<f64>,
    /// Seconds
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTrend {
    Improving,
    Declining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub average_dream_score: f64,
    pub average_mind_score: f64,
    pub average_lucid_score: f64,
    pub trend: ScoreTrend,
    pub last_update: String,
}

// =====================================================
// Liquidity Types
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub impact_pct: u32,
    pub max_input: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MakerStats {
    pub active_makers: usize,
    pub avg_quote_size: f64,
    /// Quote updates per hour
    pub quote_refresh_rate: f64,
    pub avg_spread: f64,
    pub min_spread: f64,
    pub max_spread: f64,
    pub quote_count: usize,
    pub trade_count: usize,
    pub top_makers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub tx_hash: String,
    pub sender: String,
    pub receiver: String,
    pub amount0: String,
    pub amount1: String,
    pub price: f64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub maker_address: String,
    pub bid_price: f64,
    pub ask_price: f64,
    pub size: f64,
    pub block_number: u64,
    /// Unix seconds
    pub observed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityState {
    pub token: String,
    pub observed_at: String,
    pub total_liquidity: f64,
    pub active_pairs: Vec<String>,
    pub best_pair: Option<String>,
    pub depth_distribution: BTreeMap<String, Vec<DepthLevel>>,
    pub market_impact: BTreeMap<String, BTreeMap<String, f64>>,
    pub maker_stats: BTreeMap<String, MakerStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidityAlertKind {
    LowLiquidity,
    HighImpact,
    LowMakerCount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityAlert {
    pub raised_at: String,
    pub token: String,
    pub kind: LiquidityAlertKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySummary {
    pub observed_at: String,
    pub total_liquidity: f64,
    /// Fractional change against the previous observation
    pub liquidity_change: f64,
    pub active_pairs: usize,
    pub best_pair: Option<String>,
    pub depth_distribution: BTreeMap<String, Vec<DepthLevel>>,
    pub market_impact: BTreeMap<String, BTreeMap<String, f64>>,
    pub maker_stats: BTreeMap<String, MakerStats>,
}

// =====================================================
// Relayer Types
// =====================================================

/// A transaction submitted for relaying
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: f64,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<f64>,
    /// Hex-encoded signed transaction to forward as-is
    pub raw_tx: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefRewrite {
    pub transaction_id: String,
    pub original_belief: String,
    pub rewritten_belief: String,
    pub justification: String,
    pub created_at: String,
    pub energy_cost: f64,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Microstructure {
    pub id: String,
    pub structure_type: String,
    pub parameters: Value,
    pub registered_at: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrostructureResult {
    pub processed: bool,
    pub microstructure_id: Option<String>,
    pub original_fee: f64,
    pub processed_fee: f64,
    pub savings: f64,
    pub processed_at: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayOutcome {
    pub success: bool,
    pub method: String,
    pub tx_hash: Option<String>,
    pub message: String,
    pub error: Option<String>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Success,
    Failed,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayStatus::Success => write!(f, "success"),
            RelayStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: String,
    pub transaction_id: String,
    pub original_fee: f64,
    pub relayed_fee: f64,
    pub savings: f64,
    pub belief_rewrite: Option<BeliefRewrite>,
    pub microstructure: MicrostructureResult,
    pub outcome: RelayOutcome,
    pub processing_time_ms: u64,
    pub relayed_at: String,
    pub status: RelayStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayerStats {
    pub total_transactions_processed: usize,
    pub total_cost_savings: f64,
    pub total_belief_rewrites: usize,
    pub microstructures: usize,
    pub average_processing_time_ms: f64,
    pub uptime_secs: u64,
    pub belief_rewrites_enabled: bool,
    pub microstructures_enabled: bool,
}

// =====================================================
// Event Types
// =====================================================

/// A decoded contract event captured by the listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub id: i64,
    pub contract: String,
    pub event_name: String,
    pub contract_address: String,
    pub block_number: u64,
    pub block_timestamp: Option<u64>,
    pub tx_hash: String,
    pub log_index: u64,
    pub args: serde_json::Map<String, Value>,
    pub captured_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatistics {
    pub total_events: i64,
    pub total_dreams: i64,
    pub total_stakes: i64,
    pub total_rewards: i64,
    pub unique_dreamers: i64,
    pub last_block: Option<u64>,
}

/// Filters for querying captured events
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub contract: Option<String>,
    pub event_name: Option<String>,
    pub since_block: Option<u64>,
    pub limit: Option<usize>,
}

// =====================================================
// Agent Registry Types
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub address: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryToken {
    pub address: String,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    18
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryFile {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    #[serde(default)]
    pub tokens: BTreeMap<String, RegistryToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressValidation {
    pub key: String,
    pub address: String,
    pub valid: bool,
}

// =====================================================
// Treasury
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreasuryStatus {
    pub treasury_address: String,
    pub tokens_deployed: Vec<String>,
    pub token_count: usize,
    pub dreams_recorded: usize,
    pub mev_rebates_claimed: u64,
    pub total_dream_rewards: u64,
    pub provenance: ProvenanceCounts,
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployRequest {
    pub contract: String,
    #[serde(default)]
    pub constructor_args: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditRequest {
    pub contract: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordDreamRequest {
    pub dream: String,
    pub dreamer: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeScoresRequest {
    pub dreams: Vec<DreamPerformance>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordScoresRequest {
    pub agent: String,
    pub dreams: Vec<DreamPerformance>,
    /// Also send updatePerformance to the distributor contract
    #[serde(default)]
    pub publish: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreSummaryRequest {
    pub agent: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreSummaryResponse {
    pub agent: String,
    pub summary: Option<PerformanceSummary>,
    pub rebalance_needed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonitorLiquidityRequest {
    pub token_address: String,
    pub symbol: String,
    pub pairs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LiquiditySummaryRequest {
    pub symbol: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LiquidityAlertsRequest {
    pub symbol: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DistributeRewardsRequest {
    /// Token symbol from the agent registry
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentPermissionRequest {
    pub agent: String,
    pub permission: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentPermissionResponse {
    pub agent: String,
    pub permission: String,
    pub allowed: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentBalanceRequest {
    pub agent: String,
    /// Token symbol from the registry; native balance when absent
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentBalanceResponse {
    pub agent: String,
    pub token: Option<String>,
    pub balance: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelaySubmitResponse {
    pub status: String,
    pub queue_depth: usize,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub simulation_mode: bool,
    pub chain_id: u64,
    pub deployments: usize,
    pub dreams: usize,
    pub audits: usize,
    pub tokens: usize,
    pub provenance: ProvenanceCounts,
    pub relayer_queue_depth: usize,
    pub events_captured: i64,
    pub last_listener_tick_at: Option<String>,
    pub listener_poll_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_is_current_version() {
        let doc = MemoryDocument::default();
        assert_eq!(doc.schema_version, MEMORY_SCHEMA_VERSION);
        assert!(doc.deployments.is_empty());
    }

    #[test]
    fn test_unknown_keys_survive_roundtrip() {
        let raw = r#"{"schema_version":1,"cycles":[1,2,3]}"#;
        let doc: MemoryDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.extra.get("cycles"), Some(&serde_json::json!([1, 2, 3])));

        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["cycles"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_provenance_serializes_snake_case() {
        let json = serde_json::to_string(&Provenance::OnChain).unwrap();
        assert_eq!(json, r#""on_chain""#);
        assert_eq!(Provenance::Simulated.to_string(), "simulated");
    }

    #[test]
    fn test_provenance_counts() {
        let mut doc = MemoryDocument::default();
        doc.dreams.push(DreamRecord {
            id: "d1".to_string(),
            dreamer: "0xabc".to_string(),
            dream: Some("flying".to_string()),
            content_hash: "00".to_string(),
            content_preview: "flying".to_string(),
            ipfs_hash: None,
            tx_hash: Some("0xSIM0011223344556677".to_string()),
            gas_used: 0,
            token_reward: 10,
            recorded_at: "2025-09-01T00:00:00Z".to_string(),
            provenance: Provenance::Simulated,
        });
        let counts = doc.provenance_counts();
        assert_eq!(counts.simulated, 1);
        assert_eq!(counts.on_chain, 0);
    }

    #[test]
    fn test_rpc_response_skips_empty_fields() {
        let ok = serde_json::to_value(RpcResponse::ok(5)).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": 5}));

        let err = serde_json::to_value(RpcResponse::<u8>::err("nope")).unwrap();
        assert_eq!(err, serde_json::json!({"success": false, "error": "nope"}));
    }

    #[test]
    fn test_alert_kind_screaming_case() {
        let json = serde_json::to_string(&LiquidityAlertKind::LowMakerCount).unwrap();
        assert_eq!(json, r#""LOW_MAKER_COUNT""#);
    }
}
