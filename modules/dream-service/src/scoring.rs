//! Agent performance scoring, score history, and reward distributor calls.

use crate::abi;
use crate::agents::AgentRegistry;
use crate::chain::{ChainClient, TxOutcome};
use crate::memory::MemoryStore;
use chrono::{DateTime, Duration, Utc};
use dream_types::*;
use ethers::types::Address;
use std::sync::Arc;

const MAX_SCORE: i64 = 1000;
const SUCCESS_THRESHOLD: i64 = 500;
const SUMMARY_WINDOW: usize = 10;
const REBALANCE_AFTER_DAYS: i64 = 7;

pub const UPDATE_PERFORMANCE_GAS: u64 = 200_000;
pub const DISTRIBUTE_REWARDS_GAS: u64 = 500_000;
pub const FORCE_REBALANCE_GAS: u64 = 300_000;

/// Score a single processed dream.
///
/// Scoring:
/// - interpretation confidence × 400
/// - pattern match × 300
/// - 300 − processing seconds × 10, floored at 0
///
/// Each term is truncated and missing fields add nothing. A dream succeeds
/// when it completed without errors and scored at least 500. The score is
/// clamped to [0, 1000].
pub fn analyze_dream_performance(dream: &DreamPerformance) -> (u32, bool) {
    let mut score: i64 = 0;

    if let Some(confidence) = dream.interpretation_confidence {
        score += (confidence * 400.0).trunc() as i64;
    }
    if let Some(pattern) = dream.pattern_match_score {
        score += (pattern * 300.0).trunc() as i64;
    }
    if let Some(seconds) = dream.processing_time {
        score += (300.0 - seconds * 10.0).max(0.0).trunc() as i64;
    }

    let success = dream.completed && dream.error_count == 0 && score >= SUCCESS_THRESHOLD;
    (score.clamp(0, MAX_SCORE) as u32, success)
}

/// Aggregate a batch of dreams into dream/mind/lucid scores (40/30/30 split)
pub fn calculate_agent_scores(dreams: &[DreamPerformance]) -> AgentScores {
    let mut scores = AgentScores {
        total_dreams: dreams.len() as u32,
        ..Default::default()
    };

    if dreams.is_empty() {
        return scores;
    }

    let (mut dream_sum, mut mind_sum, mut lucid_sum) = (0.0, 0.0, 0.0);
    for dream in dreams {
        let (score, success) = analyze_dream_performance(dream);
        if success {
            scores.successful_dreams += 1;
        }
        dream_sum += score as f64 * 0.4;
        mind_sum += score as f64 * 0.3;
        lucid_sum += score as f64 * 0.3;
    }

    let n = dreams.len() as f64;
    scores.dream_score = (dream_sum / n) as u32;
    scores.mind_score = (mind_sum / n) as u32;
    scores.lucid_score = (lucid_sum / n) as u32;
    scores
}

/// Averages and trend over the last ten snapshots
pub fn performance_summary(history: &[ScoreSnapshot]) -> Option<PerformanceSummary> {
    let last = history.last()?;
    let recent = &history[history.len().saturating_sub(SUMMARY_WINDOW)..];
    let n = recent.len() as f64;

    let mean = |f: fn(&AgentScores) -> u32| recent.iter().map(|s| f(&s.scores) as f64).sum::<f64>() / n;

    let first_dream = recent[0].scores.dream_score;
    let trend = if last.scores.dream_score > first_dream {
        ScoreTrend::Improving
    } else {
        ScoreTrend::Declining
    };

    Some(PerformanceSummary {
        average_dream_score: mean(|s| s.dream_score),
        average_mind_score: mean(|s| s.mind_score),
        average_lucid_score: mean(|s| s.lucid_score),
        trend,
        last_update: last.recorded_at.clone(),
    })
}

/// True with no history or when the latest snapshot is over a week old
pub fn rebalance_needed(history: &[ScoreSnapshot], now: DateTime<Utc>) -> bool {
    let Some(last) = history.last() else {
        return true;
    };
    match DateTime::parse_from_rfc3339(&last.recorded_at) {
        Ok(at) => now.signed_duration_since(at.with_timezone(&Utc)) > Duration::days(REBALANCE_AFTER_DAYS),
        Err(_) => true,
    }
}

/// Tracks score history in memory and publishes to the distributor contract
pub struct PerformanceMonitor {
    memory: Arc<MemoryStore>,
    chain: Arc<dyn ChainClient>,
    agents: Arc<AgentRegistry>,
    distributor: Option<String>,
}

impl PerformanceMonitor {
    pub fn new(
        memory: Arc<MemoryStore>,
        chain: Arc<dyn ChainClient>,
        agents: Arc<AgentRegistry>,
        distributor: Option<String>,
    ) -> Self {
        Self {
            memory,
            chain,
            agents,
            distributor,
        }
    }

    fn distributor(&self) -> Result<&str, String> {
        self.distributor
            .as_deref()
            .ok_or_else(|| "No reward distributor address configured".to_string())
    }

    /// Registered agent name, or a raw address for agents outside the registry
    fn resolve_agent(&self, agent: &str) -> Result<Address, String> {
        match self.agents.agent_address(agent) {
            Some(address) => abi::parse_address(address),
            None => abi::parse_address(agent).map_err(|_| format!("Unknown agent: {}", agent)),
        }
    }

    /// Score a batch, optionally publish it, and append it to the history
    /// under the name it was recorded with
    pub async fn record(
        &self,
        agent: &str,
        dreams: &[DreamPerformance],
        publish: bool,
    ) -> Result<ScoreSnapshot, String> {
        if agent.trim().is_empty() {
            return Err("Agent name is required".to_string());
        }

        let scores = calculate_agent_scores(dreams);

        let outcome = if publish {
            Some(self.publish(agent, &scores).await?)
        } else {
            None
        };

        let snapshot = ScoreSnapshot {
            recorded_at: Utc::now().to_rfc3339(),
            scores,
            tx_hash: outcome.as_ref().map(|o| o.tx_hash.clone()),
            provenance: outcome.as_ref().map(|o| o.provenance),
        };

        let stored = snapshot.clone();
        self.memory.update(move |doc| {
            doc.score_history.entry(agent.to_string()).or_default().push(stored);
            Ok(())
        })?;

        log::info!(
            "[SCORES] {} scored dream={} mind={} lucid={} ({}/{} successful)",
            agent,
            snapshot.scores.dream_score,
            snapshot.scores.mind_score,
            snapshot.scores.lucid_score,
            snapshot.scores.successful_dreams,
            snapshot.scores.total_dreams
        );
        Ok(snapshot)
    }

    pub fn summary(&self, agent: &str) -> (Option<PerformanceSummary>, bool) {
        self.memory.read(|doc| {
            let history = doc.score_history.get(agent).map(|h| h.as_slice()).unwrap_or(&[]);
            (performance_summary(history), rebalance_needed(history, Utc::now()))
        })
    }

    /// Send updatePerformance for a registered agent name or a raw address
    pub async fn publish(&self, agent: &str, scores: &AgentScores) -> Result<TxOutcome, String> {
        let distributor = self.distributor()?;
        let agent_address = self.resolve_agent(agent)?;
        let data = abi::encode_update_performance(
            agent_address,
            [
                scores.dream_score as u64,
                scores.mind_score as u64,
                scores.lucid_score as u64,
                scores.successful_dreams as u64,
                scores.total_dreams as u64,
            ],
        );
        let outcome = self.chain.send(distributor, data, UPDATE_PERFORMANCE_GAS).await?;
        if !outcome.status_ok {
            return Err(format!("updatePerformance reverted in {}", outcome.tx_hash));
        }
        Ok(outcome)
    }

    /// Send distributeRewards for a token symbol from the registry
    pub async fn distribute_rewards(&self, symbol: &str) -> Result<TxOutcome, String> {
        let distributor = self.distributor()?;
        let token = self
            .agents
            .token_address(symbol)
            .ok_or_else(|| format!("Unknown token: {}", symbol))?;
        let data = abi::encode_distribute_rewards(abi::parse_address(token)?);

        let outcome = self.chain.send(distributor, data, DISTRIBUTE_REWARDS_GAS).await?;
        if !outcome.status_ok {
            return Err(format!("distributeRewards reverted in {}", outcome.tx_hash));
        }
        log::info!("[SCORES] Distributed {} rewards in {}", symbol, outcome.tx_hash);
        Ok(outcome)
    }

    pub async fn force_rebalance(&self) -> Result<TxOutcome, String> {
        let distributor = self.distributor()?;
        let outcome = self
            .chain
            .send(distributor, abi::encode_force_rebalance(), FORCE_REBALANCE_GAS)
            .await?;
        if !outcome.status_ok {
            return Err(format!("forceRebalance reverted in {}", outcome.tx_hash));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::FaultyChain;
    use crate::chain::SimulatedChainClient;
    use tempfile::TempDir;

    const AGENT: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
    const DISTRIBUTOR: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const DREAM_TOKEN: &str = "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512";

    fn dream(confidence: f64, pattern: f64, time: f64, completed: bool) -> DreamPerformance {
        DreamPerformance {
            interpretation_confidence: Some(confidence),
            pattern_match_score: Some(pattern),
            processing_time: Some(time),
            completed,
            error_count: 0,
        }
    }

    fn snapshot(at: &str, dream_score: u32) -> ScoreSnapshot {
        ScoreSnapshot {
            recorded_at: at.to_string(),
            scores: AgentScores {
                dream_score,
                mind_score: dream_score / 2,
                lucid_score: dream_score / 4,
                successful_dreams: 1,
                total_dreams: 1,
            },
            tx_hash: None,
            provenance: None,
        }
    }

    #[test]
    fn test_known_score() {
        // 0.8×400 + 0.6×300 + (300 − 5×10) = 320 + 180 + 250
        let (score, success) = analyze_dream_performance(&dream(0.8, 0.6, 5.0, true));
        assert_eq!(score, 750);
        assert!(success);
    }

    #[test]
    fn test_missing_fields_add_nothing() {
        let (score, success) = analyze_dream_performance(&DreamPerformance::default());
        assert_eq!(score, 0);
        assert!(!success);
    }

    #[test]
    fn test_slow_processing_floors_at_zero() {
        let (score, _) = analyze_dream_performance(&dream(0.5, 0.5, 45.0, true));
        assert_eq!(score, 200 + 150);
    }

    #[test]
    fn test_score_is_clamped() {
        let (score, _) = analyze_dream_performance(&dream(2.0, 2.0, 0.0, true));
        assert_eq!(score, 1000);

        let (score, _) = analyze_dream_performance(&dream(-3.0, 0.0, 100.0, true));
        assert_eq!(score, 0);
    }

    #[test]
    fn test_success_rule() {
        assert!(!analyze_dream_performance(&dream(0.8, 0.6, 5.0, false)).1);

        let mut errored = dream(0.8, 0.6, 5.0, true);
        errored.error_count = 1;
        assert!(!analyze_dream_performance(&errored).1);

        // 0.5×400 + 0.0 + 290 = 490, below threshold
        assert!(!analyze_dream_performance(&dream(0.5, 0.0, 1.0, true)).1);
    }

    #[test]
    fn test_agent_scores() {
        let dreams = vec![dream(0.8, 0.6, 5.0, true), dream(0.5, 0.5, 45.0, true)];
        let scores = calculate_agent_scores(&dreams);
        // scores 750 and 350
        assert_eq!(scores.dream_score, 220);
        assert_eq!(scores.mind_score, 165);
        assert_eq!(scores.lucid_score, 165);
        assert_eq!(scores.successful_dreams, 1);
        assert_eq!(scores.total_dreams, 2);

        assert_eq!(calculate_agent_scores(&[]), AgentScores::default());
    }

    #[test]
    fn test_summary_trend() {
        assert!(performance_summary(&[]).is_none());

        let rising = vec![
            snapshot("2025-09-01T00:00:00+00:00", 100),
            snapshot("2025-09-02T00:00:00+00:00", 300),
        ];
        let summary = performance_summary(&rising).unwrap();
        assert_eq!(summary.trend, ScoreTrend::Improving);
        assert_eq!(summary.average_dream_score, 200.0);
        assert_eq!(summary.last_update, "2025-09-02T00:00:00+00:00");

        let flat = vec![snapshot("2025-09-01T00:00:00+00:00", 100)];
        assert_eq!(performance_summary(&flat).unwrap().trend, ScoreTrend::Declining);
    }

    #[test]
    fn test_summary_uses_last_ten() {
        let history: Vec<ScoreSnapshot> = (0..15)
            .map(|i| snapshot("2025-09-01T00:00:00+00:00", i * 10))
            .collect();
        let summary = performance_summary(&history).unwrap();
        // 50..=140 step 10
        assert_eq!(summary.average_dream_score, 95.0);
    }

    #[test]
    fn test_rebalance_window() {
        let now = DateTime::parse_from_rfc3339("2025-09-10T00:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(rebalance_needed(&[], now));
        assert!(!rebalance_needed(&[snapshot("2025-09-05T00:00:00+00:00", 1)], now));
        assert!(rebalance_needed(&[snapshot("2025-09-01T00:00:00+00:00", 1)], now));
    }

    fn registry() -> Arc<AgentRegistry> {
        let file: AgentRegistryFile = serde_json::from_value(serde_json::json!({
            "agents": { "DreamAgent": { "address": AGENT, "permissions": ["update_performance"] } },
            "tokens": { "DREAM": { "address": DREAM_TOKEN, "decimals": 9 } }
        }))
        .unwrap();
        Arc::new(AgentRegistry::from_file(file))
    }

    fn monitor(chain: Arc<dyn ChainClient>, distributor: Option<&str>) -> (TempDir, Arc<MemoryStore>, PerformanceMonitor) {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::open(dir.path().join("memory.json")).unwrap());
        let monitor = PerformanceMonitor::new(
            memory.clone(),
            chain,
            registry(),
            distributor.map(|d| d.to_string()),
        );
        (dir, memory, monitor)
    }

    #[tokio::test]
    async fn test_record_appends_history() {
        let (_dir, memory, monitor) = monitor(Arc::new(SimulatedChainClient::new(None)), Some(DISTRIBUTOR));

        let unpublished = monitor.record("dreamer", &[dream(0.8, 0.6, 5.0, true)], false).await.unwrap();
        assert!(unpublished.tx_hash.is_none());

        let published = monitor.record(AGENT, &[dream(0.8, 0.6, 5.0, true)], true).await.unwrap();
        assert_eq!(published.provenance, Some(Provenance::Simulated));

        let doc = memory.snapshot();
        assert_eq!(doc.score_history["dreamer"].len(), 1);
        assert_eq!(doc.score_history[AGENT].len(), 1);

        let (summary, rebalance) = monitor.summary("dreamer");
        assert_eq!(summary.unwrap().average_dream_score, 300.0);
        assert!(!rebalance);
    }

    #[tokio::test]
    async fn test_publish_resolves_agent_names() {
        let chain = Arc::new(FaultyChain::new(None, false));
        let (_dir, memory, monitor) = monitor(chain.clone(), Some(DISTRIBUTOR));

        let snapshot = monitor.record("DreamAgent", &[dream(0.8, 0.6, 5.0, true)], true).await.unwrap();
        assert!(snapshot.tx_hash.is_some());
        assert_eq!(memory.snapshot().score_history["DreamAgent"].len(), 1);

        let sent = chain.sent.lock().unwrap();
        let agent: Address = AGENT.parse().unwrap();
        assert_eq!(sent[0].0, DISTRIBUTOR);
        assert_eq!(&sent[0].1[16..36], agent.as_bytes());
        drop(sent);

        // Unregistered names are not addresses either
        assert_eq!(
            monitor.record("Nobody", &[], true).await.unwrap_err(),
            "Unknown agent: Nobody"
        );
        assert!(!memory.snapshot().score_history.contains_key("Nobody"));
    }

    #[tokio::test]
    async fn test_publish_requires_distributor() {
        let (_dir, memory, monitor) = monitor(Arc::new(SimulatedChainClient::new(None)), None);

        assert!(monitor.record(AGENT, &[], true).await.is_err());
        assert!(monitor.force_rebalance().await.is_err());
        assert!(memory.snapshot().score_history.is_empty());
    }

    #[tokio::test]
    async fn test_distribute_rewards_sends_token_address() {
        let chain = Arc::new(FaultyChain::new(None, false));
        let (_dir, _memory, monitor) = monitor(chain.clone(), Some(DISTRIBUTOR));

        assert!(monitor.distribute_rewards("DREAM").await.unwrap().status_ok);
        assert!(monitor.force_rebalance().await.unwrap().status_ok);
        assert_eq!(
            monitor.distribute_rewards("XYZ").await.unwrap_err(),
            "Unknown token: XYZ"
        );

        let sent = chain.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let token: Address = DREAM_TOKEN.parse().unwrap();
        assert_eq!(
            sent[0].1,
            abi::encode_distribute_rewards(token)
        );
        assert_eq!(sent[1].1, abi::encode_force_rebalance());
    }

    #[tokio::test]
    async fn test_reverted_distributor_calls_fail() {
        let (_dir, memory, monitor) = monitor(Arc::new(FaultyChain::new(None, true)), Some(DISTRIBUTOR));

        assert!(monitor.distribute_rewards("DREAM").await.unwrap_err().contains("reverted"));
        assert!(monitor.force_rebalance().await.unwrap_err().contains("reverted"));
        assert!(monitor.record("DreamAgent", &[], true).await.unwrap_err().contains("reverted"));
        assert!(memory.snapshot().score_history.is_empty());
    }
}
