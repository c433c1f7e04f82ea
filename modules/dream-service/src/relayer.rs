//! Zero-cost relayer: a bounded queue drained by one worker that annotates
//! each transaction with a belief rewrite and a microstructure pass before
//! relaying it.

use crate::chain::{simulated_hash, ChainClient};
use crate::db::Db;
use chrono::Utc;
use dream_types::*;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MUST_PAY: &str = "believes it must pay";
const ALREADY_PAID: &str = "believes it has already paid";
const ZERO_ENERGY_SUFFIX: &str = " and operates with zero energy expenditure";
const PREPAYMENT_JUSTIFICATION: &str =
    "Temporal pre-payment through quantum entanglement with future transaction success";
const CONSENSUS_JUSTIFICATION: &str =
    "ACE microstructure integration enables gasless operation through belief consensus";

pub const ZERO_COST_RELAY: &str = "zero_cost_relay";
const CANCELLED_RELAY: &str = "cancelled";
const MAX_KEPT_REWRITES: usize = 1000;

// =====================================================
// Belief engine
// =====================================================

/// The request's own hash, or the first 16 hex chars of sha256 over its JSON
pub fn transaction_id(req: &RelayRequest) -> String {
    if let Some(hash) = req.hash.as_deref().filter(|h| !h.is_empty()) {
        return hash.to_string();
    }
    let canonical = serde_json::to_string(req).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))[..16].to_string()
}

pub fn analyze_belief(tx_id: &str, fee: f64) -> String {
    if fee > 0.0 {
        format!("Transaction {} {} {} SOL in fees", tx_id, MUST_PAY, fee)
    } else {
        format!("Transaction {} operates under standard blockchain beliefs", tx_id)
    }
}

pub fn rewrite_belief(tx_id: &str, original: &str) -> BeliefRewrite {
    let (rewritten, justification) = if original.contains(MUST_PAY) {
        (original.replace(MUST_PAY, ALREADY_PAID), PREPAYMENT_JUSTIFICATION)
    } else {
        (format!("{}{}", original, ZERO_ENERGY_SUFFIX), CONSENSUS_JUSTIFICATION)
    };

    let created_at = Utc::now().to_rfc3339();
    let signed = format!("{}{}{}{}", tx_id, original, rewritten, created_at);
    let signature = hex::encode(Sha256::digest(signed.as_bytes()))[..32].to_string();

    BeliefRewrite {
        transaction_id: tx_id.to_string(),
        original_belief: original.to_string(),
        rewritten_belief: rewritten,
        justification: justification.to_string(),
        created_at,
        energy_cost: 0.0,
        signature,
    }
}

pub fn validate_belief_rewrite(rewrite: &BeliefRewrite) -> bool {
    rewrite.energy_cost >= 0.0
        && rewrite.signature.len() == 32
        && rewrite.signature.chars().all(|c| c.is_ascii_hexdigit())
}

// =====================================================
// Microstructures
// =====================================================

#[derive(Default)]
pub struct MicrostructureRegistry {
    structures: Vec<Microstructure>,
}

impl MicrostructureRegistry {
    pub fn register(&mut self, structure_type: &str, parameters: serde_json::Value) -> Microstructure {
        let now = Utc::now();
        let seed = format!(
            "{}{}{}",
            structure_type,
            now.timestamp_nanos_opt().unwrap_or_default(),
            self.structures.len()
        );
        let structure = Microstructure {
            id: hex::encode(Sha256::digest(seed.as_bytes()))[..16].to_string(),
            structure_type: structure_type.to_string(),
            parameters,
            registered_at: now.to_rfc3339(),
            active: true,
        };
        log::info!("[RELAYER] Registered {} microstructure {}", structure_type, structure.id);
        self.structures.push(structure.clone());
        structure
    }

    /// Route a fee through the active zero-cost structure, registering one first if needed
    pub fn process(&mut self, fee: f64) -> MicrostructureResult {
        let existing = self
            .structures
            .iter()
            .find(|s| s.active && s.structure_type == ZERO_COST_RELAY)
            .map(|s| s.id.clone());

        let id = match existing {
            Some(id) => id,
            None => {
                self.register(
                    ZERO_COST_RELAY,
                    json!({
                        "max_value": 1.0,
                        "processing_fee": 0.0,
                        "belief_rewrite_enabled": true
                    }),
                )
                .id
            }
        };

        MicrostructureResult {
            processed: true,
            microstructure_id: Some(id),
            original_fee: fee,
            processed_fee: 0.0,
            savings: fee,
            processed_at: Some(Utc::now().to_rfc3339()),
            reason: None,
        }
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }
}

fn skipped_microstructure(fee: f64) -> MicrostructureResult {
    MicrostructureResult {
        processed: false,
        microstructure_id: None,
        original_fee: fee,
        processed_fee: fee,
        savings: 0.0,
        processed_at: None,
        reason: Some("Microstructures disabled".to_string()),
    }
}

// =====================================================
// Relayer
// =====================================================

#[derive(Debug, Clone)]
pub struct RelayerSettings {
    pub queue_capacity: usize,
    pub belief_rewrites_enabled: bool,
    pub microstructures_enabled: bool,
}

#[derive(Default)]
struct Counters {
    processed: usize,
    total_savings: f64,
    total_processing_ms: u64,
    rewrites: Vec<BeliefRewrite>,
    total_rewrites: usize,
}

struct Shared {
    settings: RelayerSettings,
    chain: Arc<dyn ChainClient>,
    db: Arc<Db>,
    registry: Mutex<MicrostructureRegistry>,
    counters: Mutex<Counters>,
    started: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Why a transaction was not queued
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitError {
    InvalidFee(f64),
    QueueFull,
    Stopped,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::InvalidFee(fee) => write!(f, "Invalid fee: {}", fee),
            SubmitError::QueueFull => write!(f, "Relayer queue is full, try again later"),
            SubmitError::Stopped => write!(f, "Relayer has stopped"),
        }
    }
}

/// Handle for submitting to the relayer and reading its state
#[derive(Clone)]
pub struct ZeroCostRelayer {
    tx: mpsc::Sender<RelayRequest>,
    shared: Arc<Shared>,
}

impl ZeroCostRelayer {
    /// Create the queue and spawn its worker
    pub fn spawn(
        settings: RelayerSettings,
        chain: Arc<dyn ChainClient>,
        db: Arc<Db>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            settings,
            chain,
            db,
            registry: Mutex::new(MicrostructureRegistry::default()),
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        });

        let worker_shared = shared.clone();
        let handle = tokio::spawn(async move {
            run_worker(worker_shared, rx, cancel).await;
        });

        (Self { tx, shared }, handle)
    }

    /// Queue a transaction. Fails when the queue is full.
    pub fn submit(&self, req: RelayRequest) -> Result<usize, SubmitError> {
        if !req.fee.is_finite() || req.fee < 0.0 {
            return Err(SubmitError::InvalidFee(req.fee));
        }
        match self.tx.try_send(req) {
            Ok(()) => Ok(self.queue_depth()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Stopped),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> RelayerStats {
        let counters = lock(&self.shared.counters);
        RelayerStats {
            total_transactions_processed: counters.processed,
            total_cost_savings: counters.total_savings,
            total_belief_rewrites: counters.total_rewrites,
            microstructures: lock(&self.shared.registry).len(),
            average_processing_time_ms: if counters.processed == 0 {
                0.0
            } else {
                counters.total_processing_ms as f64 / counters.processed as f64
            },
            uptime_secs: self.shared.started.elapsed().as_secs(),
            belief_rewrites_enabled: self.shared.settings.belief_rewrites_enabled,
            microstructures_enabled: self.shared.settings.microstructures_enabled,
        }
    }

    /// Most recent rewrites, oldest first
    pub fn belief_rewrites(&self) -> Vec<BeliefRewrite> {
        lock(&self.shared.counters).rewrites.clone()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<RelayRecord>, String> {
        self.shared
            .db
            .list_relay_records(limit)
            .map_err(|e| format!("Failed to read relay history: {}", e))
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<RelayRequest>,
    cancel: CancellationToken,
) {
    log::info!(
        "[RELAYER] Worker started (belief rewrites: {}, microstructures: {})",
        shared.settings.belief_rewrites_enabled,
        shared.settings.microstructures_enabled
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let discarded = discard_pending(&shared, &mut rx);
                log::info!("[RELAYER] Shutting down, {} queued transactions discarded", discarded);
                break;
            }
            next = rx.recv() => match next {
                Some(req) => {
                    let record = relay_transaction(&shared, req).await;
                    log::info!(
                        "[RELAYER] {} {} via {} (savings {})",
                        record.transaction_id,
                        record.status,
                        record.outcome.method,
                        record.savings
                    );
                }
                None => break,
            }
        }
    }
}

/// Close the queue and store every request still in it as a failed relay
fn discard_pending(shared: &Shared, rx: &mut mpsc::Receiver<RelayRequest>) -> usize {
    rx.close();
    let mut discarded = 0;
    while let Ok(req) = rx.try_recv() {
        let tx_id = transaction_id(&req);
        log::warn!("[RELAYER] Discarding queued transaction {}", tx_id);
        let record = RelayRecord {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: tx_id,
            original_fee: req.fee,
            relayed_fee: req.fee,
            savings: 0.0,
            belief_rewrite: None,
            microstructure: MicrostructureResult {
                reason: Some("Relayer stopped".to_string()),
                ..skipped_microstructure(req.fee)
            },
            outcome: RelayOutcome {
                success: false,
                method: CANCELLED_RELAY.to_string(),
                tx_hash: None,
                message: "Relayer stopped before the transaction was relayed".to_string(),
                error: Some("cancelled".to_string()),
                provenance: Provenance::Unverified,
            },
            processing_time_ms: 0,
            relayed_at: Utc::now().to_rfc3339(),
            status: RelayStatus::Failed,
        };
        if let Err(e) = shared.db.insert_relay_record(&record) {
            log::error!("[RELAYER] Failed to store discarded relay record: {}", e);
        }
        discarded += 1;
    }
    discarded
}

async fn relay_transaction(shared: &Shared, req: RelayRequest) -> RelayRecord {
    let started = Instant::now();
    let tx_id = transaction_id(&req);
    let fee = req.fee;

    let original_belief = analyze_belief(&tx_id, fee);
    let belief_rewrite = if shared.settings.belief_rewrites_enabled {
        let rewrite = rewrite_belief(&tx_id, &original_belief);
        if validate_belief_rewrite(&rewrite) {
            Some(rewrite)
        } else {
            log::warn!("[RELAYER] Discarding invalid belief rewrite for {}", tx_id);
            None
        }
    } else {
        None
    };

    let microstructure = if shared.settings.microstructures_enabled {
        lock(&shared.registry).process(fee)
    } else {
        skipped_microstructure(fee)
    };

    let outcome = execute_relay(shared.chain.as_ref(), &req).await;
    let processing_time_ms = started.elapsed().as_millis() as u64;

    let record = RelayRecord {
        id: uuid::Uuid::new_v4().to_string(),
        transaction_id: tx_id,
        original_fee: fee,
        relayed_fee: 0.0,
        savings: fee,
        belief_rewrite: belief_rewrite.clone(),
        microstructure,
        status: if outcome.success {
            RelayStatus::Success
        } else {
            RelayStatus::Failed
        },
        outcome,
        processing_time_ms,
        relayed_at: Utc::now().to_rfc3339(),
    };

    if let Err(e) = shared.db.insert_relay_record(&record) {
        log::error!("[RELAYER] Failed to store relay record: {}", e);
    }

    let mut counters = lock(&shared.counters);
    counters.processed += 1;
    counters.total_savings += record.savings;
    counters.total_processing_ms += processing_time_ms;
    if let Some(rewrite) = belief_rewrite {
        counters.total_rewrites += 1;
        counters.rewrites.push(rewrite);
        if counters.rewrites.len() > MAX_KEPT_REWRITES {
            counters.rewrites.remove(0);
        }
    }

    record
}

/// Broadcast a signed payload when the chain is live, otherwise simulate
async fn execute_relay(chain: &dyn ChainClient, req: &RelayRequest) -> RelayOutcome {
    if let Some(raw_tx) = req.raw_tx.as_deref().filter(|r| !r.is_empty()) {
        if chain.is_live() {
            return match chain.send_raw(raw_tx).await {
                Ok(outcome) => RelayOutcome {
                    success: true,
                    method: ZERO_COST_RELAY.to_string(),
                    tx_hash: Some(outcome.tx_hash),
                    message: "Signed transaction broadcast".to_string(),
                    error: None,
                    provenance: outcome.provenance,
                },
                Err(e) => RelayOutcome {
                    success: false,
                    method: ZERO_COST_RELAY.to_string(),
                    tx_hash: None,
                    message: "Relay broadcast failed".to_string(),
                    error: Some(e),
                    provenance: Provenance::OnChain,
                },
            };
        }
    }

    let canonical = serde_json::to_string(req).unwrap_or_default();
    RelayOutcome {
        success: true,
        method: "simulation".to_string(),
        tx_hash: Some(simulated_hash(canonical.as_bytes())),
        message: "Simulated zero-cost relay".to_string(),
        error: None,
        provenance: Provenance::Simulated,
    }
}
