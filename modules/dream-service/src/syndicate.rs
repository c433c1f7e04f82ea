//! Contract deployment, audits and dream recording.

use crate::abi;
use crate::chain::ChainClient;
use crate::memory::{content_hash, content_preview, MemoryStore};
use chrono::Utc;
use dream_types::*;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEPLOY_GAS: u64 = 5_000_000;
pub const RECORD_DREAM_GAS: u64 = 300_000;
pub const DREAM_TOKEN_REWARD: u64 = 10;

pub const DREAMS_CONTRACT: &str = "IEMDreams";
pub const ONEIRO_SPHERE_CONTRACT: &str = "OneiroSphere";

/// Compiled contract as written by the build toolchain
#[derive(Debug, Clone)]
pub struct Artifact {
    pub abi: Value,
    pub bytecode: String,
}

/// Read `<dir>/<contract>.json`. Accepts a plain bytecode string or an
/// `{ "object": ... }` wrapper.
pub fn load_artifact(dir: &Path, contract: &str) -> Result<Artifact, String> {
    if contract.is_empty() || !contract.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("Invalid contract name: {:?}", contract));
    }

    let path = dir.join(format!("{}.json", contract));
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read artifact {}: {}", path.display(), e))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| format!("Invalid artifact {}: {}", path.display(), e))?;

    let bytecode = match value.get("bytecode") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("object")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("Artifact {} has no bytecode object", path.display()))?,
        _ => return Err(format!("Artifact {} has no bytecode", path.display())),
    };

    Ok(Artifact {
        abi: value.get("abi").cloned().unwrap_or_else(|| json!([])),
        bytecode,
    })
}

fn provenance_of(chain: &dyn ChainClient) -> Provenance {
    if chain.is_live() {
        Provenance::OnChain
    } else {
        Provenance::Simulated
    }
}

pub struct Syndicate {
    memory: Arc<MemoryStore>,
    chain: Arc<dyn ChainClient>,
    artifacts_dir: PathBuf,
    forwarder: Option<String>,
}

impl Syndicate {
    pub fn new(
        memory: Arc<MemoryStore>,
        chain: Arc<dyn ChainClient>,
        artifacts_dir: impl Into<PathBuf>,
        forwarder: Option<String>,
    ) -> Self {
        Self {
            memory,
            chain,
            artifacts_dir: artifacts_dir.into(),
            forwarder,
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Deploy a compiled contract and remember it under its name.
    /// `OneiroSphere` takes the trusted forwarder when no args are given.
    pub async fn deploy(&self, contract: &str, constructor_args: &[Value]) -> Result<Deployment, String> {
        let artifact = load_artifact(&self.artifacts_dir, contract)?;

        let args = if contract == ONEIRO_SPHERE_CONTRACT && constructor_args.is_empty() {
            let forwarder = self
                .forwarder
                .as_deref()
                .ok_or("OneiroSphere needs a forwarder address (DREAM_FORWARDER_ADDRESS)")?;
            vec![Value::String(forwarder.to_string())]
        } else {
            constructor_args.to_vec()
        };

        let deployment = self.deploy_artifact(contract, &artifact, &args).await?;
        let stored = deployment.clone();
        self.memory.update(move |doc| {
            doc.deployments.insert(stored.contract.clone(), stored);
            Ok(())
        })?;
        Ok(deployment)
    }

    /// Encode and send a deployment without touching memory
    pub(crate) async fn deploy_artifact(
        &self,
        label: &str,
        artifact: &Artifact,
        args: &[Value],
    ) -> Result<Deployment, String> {
        let data = abi::encode_deploy_data(&artifact.abi, &artifact.bytecode, args)
            .map_err(|e| format!("Failed to encode {} constructor: {}", label, e))?;

        log::info!("[SYNDICATE] Deploying {} ({} bytes)", label, data.len());
        let outcome = self.chain.deploy(label, data, DEPLOY_GAS).await?;
        if !outcome.status_ok {
            return Err(format!("Deployment of {} reverted in {}", label, outcome.tx_hash));
        }
        let address = outcome
            .contract_address
            .ok_or_else(|| format!("No contract address in receipt {}", outcome.tx_hash))?;

        log::info!("[SYNDICATE] {} deployed at {} ({})", label, address, outcome.provenance);
        Ok(Deployment {
            contract: label.to_string(),
            address,
            abi: artifact.abi.clone(),
            bytecode: Some(artifact.bytecode.clone()),
            tx_hash: Some(outcome.tx_hash),
            gas_used: outcome.gas_used,
            deployer: self.chain.sender_address(),
            deployed_at: Utc::now().to_rfc3339(),
            provenance: outcome.provenance,
        })
    }

    pub fn deployment(&self, contract: &str) -> Option<Deployment> {
        self.memory.read(|doc| doc.deployments.get(contract).cloned())
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.memory.read(|doc| doc.deployments.values().cloned().collect())
    }

    pub fn dreams(&self) -> Vec<DreamRecord> {
        self.memory.read(|doc| doc.dreams.clone())
    }

    /// Hash the deployed runtime code and compare it with the last audit
    pub async fn audit(&self, contract: &str) -> Result<AuditRecord, String> {
        let deployment = self
            .deployment(contract)
            .ok_or_else(|| format!("{} is not deployed", contract))?;

        let code = self.chain.get_code(&deployment.address).await?;
        let code_hash = hex::encode(Sha256::digest(&code));

        let previous = self.memory.read(|doc| {
            doc.audits
                .iter()
                .rev()
                .find(|a| a.contract == contract)
                .map(|a| a.code_hash.clone())
        });

        let record = AuditRecord {
            contract: contract.to_string(),
            address: deployment.address,
            code_size: code.len(),
            checks: AuditChecks {
                code_exists: !code.is_empty(),
                hash_matches: previous.map(|h| h == code_hash),
            },
            code_hash,
            audited_at: Utc::now().to_rfc3339(),
            provenance: provenance_of(self.chain.as_ref()),
        };

        if record.checks.hash_matches == Some(false) {
            log::warn!("[SYNDICATE] {} code hash changed since the last audit", contract);
        }

        let stored = record.clone();
        self.memory.update(move |doc| {
            doc.audits.push(stored);
            Ok(())
        })?;

        log::info!(
            "[SYNDICATE] Audited {}: {} bytes, hash {}",
            contract,
            record.code_size,
            record.code_hash
        );
        Ok(record)
    }

    /// Send `recordDream(text)` to the deployed IEMDreams contract
    pub async fn record_dream(&self, dream: &str, dreamer: Option<&str>) -> Result<DreamRecord, String> {
        if dream.trim().is_empty() {
            return Err("Dream text must not be empty".to_string());
        }
        let deployment = self
            .deployment(DREAMS_CONTRACT)
            .ok_or("IEMDreams is not deployed. Deploy it first")?;

        let outcome = self
            .chain
            .send(&deployment.address, abi::encode_record_dream(dream), RECORD_DREAM_GAS)
            .await?;
        if !outcome.status_ok {
            return Err(format!("recordDream reverted in {}", outcome.tx_hash));
        }

        let dreamer = dreamer
            .map(|d| d.to_string())
            .or_else(|| self.chain.sender_address())
            .unwrap_or_else(|| deployment.address.clone());

        let now = Utc::now();
        let record = DreamRecord {
            id: format!("dream_{}", now.timestamp_micros()),
            dreamer,
            dream: Some(dream.to_string()),
            content_hash: content_hash(dream),
            content_preview: content_preview(dream),
            ipfs_hash: None,
            tx_hash: Some(outcome.tx_hash),
            gas_used: outcome.gas_used,
            token_reward: DREAM_TOKEN_REWARD,
            recorded_at: now.to_rfc3339(),
            provenance: outcome.provenance,
        };

        let stored = record.clone();
        self.memory.update(move |doc| {
            doc.dreams.push(stored);
            doc.mev_rebates_claimed += 1;
            Ok(())
        })?;

        log::info!("[SYNDICATE] Dream {} recorded by {}", record.id, record.dreamer);
        Ok(record)
    }
}
