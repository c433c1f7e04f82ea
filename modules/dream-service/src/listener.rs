//! Background listener for contract events.
//!
//! Polls eth_getLogs for every deployed contract and known event, decodes
//! the args and stores them in SQLite. Progress is tracked per contract and
//! event with a block cursor, so restarts resume where they stopped.

use crate::abi;
use crate::chain::ChainClient;
use crate::db::{Db, NewEvent};
use crate::memory::MemoryStore;
use dream_types::Deployment;
use ethers::abi::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Widest block range requested in one eth_getLogs call
pub const MAX_BLOCK_RANGE: u64 = 2000;

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub poll_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub max_events: usize,
}

pub async fn run_listener(
    db: Arc<Db>,
    memory: Arc<MemoryStore>,
    chain: Arc<dyn ChainClient>,
    settings: ListenerSettings,
    last_tick_at: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
) {
    log::info!(
        "[LISTENER] Started (poll interval: {}s, retry: {}s)",
        settings.poll_interval_secs,
        settings.retry_interval_secs
    );

    loop {
        let wait = match poll_tick(&db, &memory, chain.as_ref(), settings.max_events).await {
            Ok(captured) => {
                if captured > 0 {
                    log::info!("[LISTENER] Captured {} new events", captured);
                }
                *last_tick_at.lock().await = Some(chrono::Utc::now().to_rfc3339());
                settings.poll_interval_secs
            }
            Err(e) => {
                log::error!("[LISTENER] Tick error: {}", e);
                settings.retry_interval_secs
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[LISTENER] Shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
        }
    }
}

/// One pass over every deployment. Returns the number of newly stored events.
pub async fn poll_tick(
    db: &Db,
    memory: &MemoryStore,
    chain: &dyn ChainClient,
    max_events: usize,
) -> Result<usize, String> {
    let deployments: Vec<Deployment> = memory.read(|doc| doc.deployments.values().cloned().collect());
    if deployments.is_empty() {
        return Ok(0);
    }

    let head = chain.block_number().await?;
    let mut captured = 0;

    for deployment in &deployments {
        for event in abi::events_for_abi(&deployment.abi) {
            captured += poll_event(db, chain, deployment, &event, head).await?;
        }
    }

    if captured > 0 {
        let pruned = db
            .prune_events(max_events)
            .map_err(|e| format!("Failed to prune events: {}", e))?;
        if pruned > 0 {
            log::debug!("[LISTENER] Pruned {} old events", pruned);
        }
    }

    Ok(captured)
}

async fn poll_event(
    db: &Db,
    chain: &dyn ChainClient,
    deployment: &Deployment,
    event: &Event,
    head: u64,
) -> Result<usize, String> {
    let address = deployment.address.to_lowercase();
    let cursor = db
        .get_cursor(&address, &event.name)
        .map_err(|e| format!("Failed to read cursor: {}", e))?;

    // New watches start at the head
    let Some(last_block) = cursor else {
        db.set_cursor(&address, &event.name, head)
            .map_err(|e| format!("Failed to set cursor: {}", e))?;
        return Ok(0);
    };

    let topic0 = event.signature();
    let mut captured = 0;
    let mut start = last_block + 1;

    while start <= head {
        let end = (start + MAX_BLOCK_RANGE - 1).min(head);
        let logs = chain.get_logs(&address, topic0, start, end).await?;

        for log in logs {
            let args = match abi::decode_event_args(event, log.topics.clone(), log.data.clone()) {
                Ok(args) => args,
                Err(e) => {
                    log::warn!("[LISTENER] Skipping log in {}: {}", log.tx_hash, e);
                    continue;
                }
            };
            let block_timestamp = chain.block_timestamp(log.block_number).await.ok().flatten();

            let inserted = db
                .insert_event(&NewEvent {
                    contract: &deployment.contract,
                    event_name: &event.name,
                    contract_address: &address,
                    block_number: log.block_number,
                    block_timestamp,
                    tx_hash: &log.tx_hash,
                    log_index: log.log_index,
                    args: &args,
                })
                .map_err(|e| format!("Failed to store event: {}", e))?;
            if inserted {
                captured += 1;
            }
        }

        db.set_cursor(&address, &event.name, end)
            .map_err(|e| format!("Failed to set cursor: {}", e))?;
        start = end + 1;
    }

    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainLog, TxOutcome};
    use async_trait::async_trait;
    use dream_types::{EventFilter, Provenance};
    use ethers::abi::Token;
    use ethers::types::{Address, H256, U256};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    /// Chain double serving a fixed set of logs up to a movable head
    struct ScriptedChain {
        head: AtomicU64,
        logs: std::sync::Mutex<Vec<ChainLog>>,
        requested_ranges: std::sync::Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedChain {
        fn new(head: u64) -> Self {
            Self {
                head: AtomicU64::new(head),
                logs: std::sync::Mutex::new(Vec::new()),
                requested_ranges: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedChain {
        fn is_live(&self) -> bool {
            true
        }
        fn sender_address(&self) -> Option<String> {
            None
        }
        async fn deploy(&self, _: &str, _: Vec<u8>, _: u64) -> Result<TxOutcome, String> {
            Err("unsupported".into())
        }
        async fn send(&self, _: &str, _: Vec<u8>, _: u64) -> Result<TxOutcome, String> {
            Err("unsupported".into())
        }
        async fn send_raw(&self, _: &str) -> Result<TxOutcome, String> {
            Err("unsupported".into())
        }
        async fn call(&self, _: &str, _: Vec<u8>, _: Option<u64>) -> Result<Vec<u8>, String> {
            Err("unsupported".into())
        }
        async fn get_code(&self, _: &str) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }
        async fn get_balance(&self, _: &str) -> Result<U256, String> {
            Ok(U256::zero())
        }
        async fn block_number(&self) -> Result<u64, String> {
            Ok(self.head.load(Ordering::SeqCst))
        }
        async fn get_logs(
            &self,
            address: &str,
            topic0: H256,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<ChainLog>, String> {
            self.requested_ranges.lock().unwrap().push((from_block, to_block));
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|l| {
                    l.address == address
                        && l.topics.first() == Some(&topic0)
                        && (from_block..=to_block).contains(&l.block_number)
                })
                .cloned()
                .collect())
        }
        async fn block_timestamp(&self, block: u64) -> Result<Option<u64>, String> {
            Ok(Some(1_700_000_000 + block))
        }
    }

    fn address_topic(address: &str) -> H256 {
        let parsed: Address = address.parse().unwrap();
        H256::from(parsed)
    }

    fn dream_log(block: u64, log_index: u64, dreamer: &str, text: &str) -> ChainLog {
        ChainLog {
            address: CONTRACT.to_string(),
            topics: vec![
                abi::event_topic("DreamRecorded(address,string)"),
                address_topic(dreamer),
            ],
            data: ethers::abi::encode(&[Token::String(text.to_string())]),
            block_number: block,
            tx_hash: format!("0x{:064x}", block),
            log_index,
        }
    }

    fn transfer_log(block: u64) -> ChainLog {
        ChainLog {
            address: CONTRACT.to_string(),
            topics: vec![
                abi::event_topic("Transfer(address,address,uint256)"),
                address_topic("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"),
                address_topic("0x70997970c51812dc3a010c7d01b50e0d17dc79c8"),
            ],
            data: ethers::abi::encode(&[Token::Uint(U256::from(5u64))]),
            block_number: block,
            tx_hash: format!("0x{:064x}", block),
            log_index: 0,
        }
    }

    fn memory_with_deployment(tmp: &TempDir) -> MemoryStore {
        let memory = MemoryStore::open(tmp.path().join("iem_memory.json")).unwrap();
        memory
            .update(|doc| {
                doc.deployments.insert(
                    "IEMDreams".to_string(),
                    Deployment {
                        contract: "IEMDreams".to_string(),
                        address: CONTRACT.to_string(),
                        abi: json!([]),
                        bytecode: None,
                        tx_hash: None,
                        gas_used: 0,
                        deployer: None,
                        deployed_at: "2025-01-01T00:00:00+00:00".to_string(),
                        provenance: Provenance::OnChain,
                    },
                );
                Ok(())
            })
            .unwrap();
        memory
    }

    #[tokio::test]
    async fn test_no_deployments_is_noop() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(":memory:").unwrap();
        let memory = MemoryStore::open(tmp.path().join("iem_memory.json")).unwrap();
        let chain = ScriptedChain::new(10);

        assert_eq!(poll_tick(&db, &memory, &chain, 1000).await.unwrap(), 0);
        assert!(chain.requested_ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_tick_starts_at_head_then_catches_up() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(":memory:").unwrap();
        let memory = memory_with_deployment(&tmp);
        let chain = ScriptedChain::new(100);

        // Logs before the first tick are never seen
        chain.logs.lock().unwrap().push(dream_log(50, 0, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", "old"));
        assert_eq!(poll_tick(&db, &memory, &chain, 1000).await.unwrap(), 0);
        assert_eq!(db.get_cursor(CONTRACT, "DreamRecorded").unwrap(), Some(100));

        {
            let mut logs = chain.logs.lock().unwrap();
            logs.push(transfer_log(150));
            logs.push(dream_log(2500, 1, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", "a neon city"));
            logs.push(dream_log(2600, 0, "0x70997970c51812dc3a010c7d01b50e0d17dc79c8", "falling"));
        }
        chain.head.store(3000, Ordering::SeqCst);

        assert_eq!(poll_tick(&db, &memory, &chain, 1000).await.unwrap(), 3);
        assert_eq!(db.get_cursor(CONTRACT, "Transfer").unwrap(), Some(3000));

        // Ranges are chunked
        assert!(chain
            .requested_ranges
            .lock()
            .unwrap()
            .iter()
            .all(|(from, to)| to - from < MAX_BLOCK_RANGE));

        // Nothing new on the next tick
        assert_eq!(poll_tick(&db, &memory, &chain, 1000).await.unwrap(), 0);

        let stats = db.event_stats().unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.total_dreams, 2);
        assert_eq!(stats.unique_dreamers, 2);
        assert_eq!(stats.last_block, Some(2600));

        let dreams = db
            .query_events(&EventFilter {
                event_name: Some("DreamRecorded".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dreams[0].args["dream"], "falling");
        assert_eq!(dreams[0].block_timestamp, Some(1_700_002_600));
    }

    #[tokio::test]
    async fn test_prunes_to_max_events() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(":memory:").unwrap();
        let memory = memory_with_deployment(&tmp);
        let chain = ScriptedChain::new(10);
        poll_tick(&db, &memory, &chain, 2).await.unwrap();

        {
            let mut logs = chain.logs.lock().unwrap();
            for block in 11..16 {
                logs.push(transfer_log(block));
            }
        }
        chain.head.store(20, Ordering::SeqCst);

        assert_eq!(poll_tick(&db, &memory, &chain, 2).await.unwrap(), 5);
        assert_eq!(db.event_count().unwrap(), 2);
        assert_eq!(db.event_stats().unwrap().last_block, Some(15));
    }

    #[tokio::test]
    async fn test_run_listener_stops_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let last_tick_at = Arc::new(Mutex::new(None));

        let handle = tokio::spawn(run_listener(
            Arc::new(Db::open(":memory:").unwrap()),
            Arc::new(memory_with_deployment(&tmp)),
            Arc::new(ScriptedChain::new(1)),
            ListenerSettings {
                poll_interval_secs: 60,
                retry_interval_secs: 60,
                max_events: 10,
            },
            last_tick_at.clone(),
            cancel.clone(),
        ));

        for _ in 0..200 {
            if last_tick_at.lock().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(last_tick_at.lock().await.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
