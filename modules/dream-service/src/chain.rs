//! Chain access behind a trait, so every flow runs the same against a real
//! RPC endpoint or the local simulation.

use crate::abi::parse_address;
use crate::wallet::DeployerWallet;
use async_trait::async_trait;
use dashmap::DashMap;
use dream_types::Provenance;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::types::{
    BlockId, BlockNumber, Bytes, Filter, TransactionRequest, H256, U256,
    transaction::eip2718::TypedTransaction,
};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Prefix marking fabricated transaction hashes
pub const SIMULATED_HASH_PREFIX: &str = "0xSIM";

/// Result of a submitted transaction
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub tx_hash: String,
    pub contract_address: Option<String>,
    pub gas_used: u64,
    pub block_number: Option<u64>,
    pub status_ok: bool,
    pub provenance: Provenance,
}

/// A raw log as returned by eth_getLogs
#[derive(Debug, Clone)]
pub struct ChainLog {
    pub address: String,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// False for the simulation client
    fn is_live(&self) -> bool;

    /// Address transactions are sent from, if any
    fn sender_address(&self) -> Option<String>;

    /// Deploy a contract from init code. `label` names the deployment.
    async fn deploy(&self, label: &str, data: Vec<u8>, gas: u64) -> Result<TxOutcome, String>;

    async fn send(&self, to: &str, data: Vec<u8>, gas: u64) -> Result<TxOutcome, String>;

    /// Broadcast an already-signed transaction
    async fn send_raw(&self, raw_tx: &str) -> Result<TxOutcome, String>;

    async fn call(&self, to: &str, data: Vec<u8>, block: Option<u64>) -> Result<Vec<u8>, String>;

    async fn get_code(&self, address: &str) -> Result<Vec<u8>, String>;

    async fn get_balance(&self, address: &str) -> Result<U256, String>;

    async fn block_number(&self) -> Result<u64, String>;

    async fn get_logs(
        &self,
        address: &str,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, String>;

    async fn block_timestamp(&self, block: u64) -> Result<Option<u64>, String>;
}

/// `0xSIM` followed by 16 hex chars derived from the seed
pub fn simulated_hash(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    format!("{}{}", SIMULATED_HASH_PREFIX, hex::encode(&digest[..8]))
}

pub fn is_simulated_hash(hash: &str) -> bool {
    hash.starts_with(SIMULATED_HASH_PREFIX)
}

// =====================================================
// ethers client
// =====================================================

pub struct EvmChainClient {
    provider: Provider<Http>,
    signer: Option<SignerMiddleware<Provider<Http>, LocalWallet>>,
    sender: Option<String>,
}

impl EvmChainClient {
    pub fn new(rpc_url: &str, wallet: Option<DeployerWallet>) -> Result<Self, String> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| format!("Invalid RPC URL '{}': {}", rpc_url, e))?;

        let (signer, sender) = match wallet {
            Some(w) => {
                let sender = w.address().to_string();
                (
                    Some(SignerMiddleware::new(provider.clone(), w.wallet())),
                    Some(sender),
                )
            }
            None => (None, None),
        };

        Ok(Self {
            provider,
            signer,
            sender,
        })
    }

    fn signer(&self) -> Result<&SignerMiddleware<Provider<Http>, LocalWallet>, String> {
        self.signer
            .as_ref()
            .ok_or_else(|| "No deployer key configured for transactions".to_string())
    }

    async fn submit(&self, tx: TransactionRequest) -> Result<TxOutcome, String> {
        let signer = self.signer()?;

        let pending = signer
            .send_transaction(tx, None)
            .await
            .map_err(|e| format!("Failed to send transaction: {}", e))?;

        let tx_hash = format!("{:?}", pending.tx_hash());
        log::info!("[CHAIN] Submitted {}", tx_hash);

        let receipt = pending
            .await
            .map_err(|e| format!("Failed waiting for receipt of {}: {}", tx_hash, e))?
            .ok_or_else(|| format!("Transaction {} was dropped", tx_hash))?;

        Ok(TxOutcome {
            tx_hash,
            contract_address: receipt
                .contract_address
                .map(|a| format!("{:?}", a).to_lowercase()),
            gas_used: receipt.gas_used.map(|g| g.as_u64()).unwrap_or(0),
            block_number: receipt.block_number.map(|b| b.as_u64()),
            status_ok: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            provenance: Provenance::OnChain,
        })
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn is_live(&self) -> bool {
        true
    }

    fn sender_address(&self) -> Option<String> {
        self.sender.clone()
    }

    async fn deploy(&self, label: &str, data: Vec<u8>, gas: u64) -> Result<TxOutcome, String> {
        log::info!("[CHAIN] Deploying {} ({} bytes)", label, data.len());
        let tx = TransactionRequest::new().data(data).gas(gas);
        self.submit(tx).await
    }

    async fn send(&self, to: &str, data: Vec<u8>, gas: u64) -> Result<TxOutcome, String> {
        let to = parse_address(to)?;
        let tx = TransactionRequest::new().to(to).data(data).gas(gas);
        self.submit(tx).await
    }

    async fn send_raw(&self, raw_tx: &str) -> Result<TxOutcome, String> {
        let bytes = hex::decode(raw_tx.trim().trim_start_matches("0x"))
            .map_err(|e| format!("Invalid raw transaction hex: {}", e))?;

        let pending = self
            .provider
            .send_raw_transaction(Bytes::from(bytes))
            .await
            .map_err(|e| format!("Failed to broadcast raw transaction: {}", e))?;

        Ok(TxOutcome {
            tx_hash: format!("{:?}", pending.tx_hash()),
            contract_address: None,
            gas_used: 0,
            block_number: None,
            status_ok: true,
            provenance: Provenance::OnChain,
        })
    }

    async fn call(&self, to: &str, data: Vec<u8>, block: Option<u64>) -> Result<Vec<u8>, String> {
        let to = parse_address(to)?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let block = block.map(|b| BlockId::Number(BlockNumber::Number(b.into())));

        let result = self
            .provider
            .call(&tx, block)
            .await
            .map_err(|e| format!("eth_call failed: {}", e))?;
        Ok(result.to_vec())
    }

    async fn get_code(&self, address: &str) -> Result<Vec<u8>, String> {
        let address = parse_address(address)?;
        let code = self
            .provider
            .get_code(address, None)
            .await
            .map_err(|e| format!("eth_getCode failed: {}", e))?;
        Ok(code.to_vec())
    }

    async fn get_balance(&self, address: &str) -> Result<U256, String> {
        let address = parse_address(address)?;
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| format!("eth_getBalance failed: {}", e))
    }

    async fn block_number(&self) -> Result<u64, String> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| format!("eth_blockNumber failed: {}", e))
    }

    async fn get_logs(
        &self,
        address: &str,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, String> {
        let filter = Filter::new()
            .address(parse_address(address)?)
            .topic0(topic0)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| format!("eth_getLogs failed: {}", e))?;

        Ok(logs
            .into_iter()
            .map(|log| ChainLog {
                address: format!("{:?}", log.address).to_lowercase(),
                topics: log.topics,
                data: log.data.to_vec(),
                block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(0),
                tx_hash: log
                    .transaction_hash
                    .map(|h| format!("{:?}", h))
                    .unwrap_or_default(),
                log_index: log.log_index.map(|i| i.as_u64()).unwrap_or(0),
            })
            .collect())
    }

    async fn block_timestamp(&self, block: u64) -> Result<Option<u64>, String> {
        let block = self
            .provider
            .get_block(block)
            .await
            .map_err(|e| format!("eth_getBlockByNumber failed: {}", e))?;
        Ok(block.map(|b| b.timestamp.as_u64()))
    }
}

// =====================================================
// Simulation client
// =====================================================

/// Deterministic stand-in for a chain. Deployed code is remembered so
/// audits work; contract reads are refused rather than invented.
pub struct SimulatedChainClient {
    code: DashMap<String, Vec<u8>>,
    nonce: AtomicU64,
    sender: Option<String>,
}

impl SimulatedChainClient {
    pub fn new(sender: Option<String>) -> Self {
        Self {
            code: DashMap::new(),
            nonce: AtomicU64::new(0),
            sender,
        }
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn outcome(&self, seed: &[u8], contract_address: Option<String>, data_len: usize) -> TxOutcome {
        let nonce = self.next_nonce();
        let mut seeded = seed.to_vec();
        seeded.extend_from_slice(&nonce.to_be_bytes());

        TxOutcome {
            tx_hash: simulated_hash(&seeded),
            contract_address,
            gas_used: 21_000 + 16 * data_len as u64,
            block_number: Some(nonce),
            status_ok: true,
            provenance: Provenance::Simulated,
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChainClient {
    fn is_live(&self) -> bool {
        false
    }

    fn sender_address(&self) -> Option<String> {
        self.sender.clone()
    }

    async fn deploy(&self, label: &str, data: Vec<u8>, _gas: u64) -> Result<TxOutcome, String> {
        let digest = Sha256::digest(label.as_bytes());
        let address = format!("0x{}", hex::encode(&digest[..20]));
        let len = data.len();
        self.code.insert(address.clone(), data);

        log::info!("[CHAIN] Simulated deployment of {} at {}", label, address);
        Ok(self.outcome(label.as_bytes(), Some(address), len))
    }

    async fn send(&self, to: &str, data: Vec<u8>, _gas: u64) -> Result<TxOutcome, String> {
        parse_address(to)?;
        let mut seed = to.to_lowercase().into_bytes();
        seed.extend_from_slice(&data);
        Ok(self.outcome(&seed, None, data.len()))
    }

    async fn send_raw(&self, raw_tx: &str) -> Result<TxOutcome, String> {
        Ok(self.outcome(raw_tx.as_bytes(), None, raw_tx.len() / 2))
    }

    async fn call(&self, to: &str, _data: Vec<u8>, _block: Option<u64>) -> Result<Vec<u8>, String> {
        Err(format!("Contract reads against {} are unavailable in simulation mode", to))
    }

    async fn get_code(&self, address: &str) -> Result<Vec<u8>, String> {
        parse_address(address)?;
        Ok(self
            .code
            .get(&address.to_lowercase())
            .map(|c| c.value().clone())
            .unwrap_or_default())
    }

    async fn get_balance(&self, address: &str) -> Result<U256, String> {
        parse_address(address)?;
        Ok(U256::zero())
    }

    async fn block_number(&self) -> Result<u64, String> {
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        _address: &str,
        _topic0: H256,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<ChainLog>, String> {
        Ok(Vec::new())
    }

    async fn block_timestamp(&self, _block: u64) -> Result<Option<u64>, String> {
        Ok(None)
    }
}
