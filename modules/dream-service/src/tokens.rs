//! The DREAM / SMIND / LUCID token suite and treasury reporting.

use crate::syndicate::{load_artifact, Syndicate};
use chrono::Utc;
use dream_types::*;
use ethers::types::U256;
use serde_json::Value;

pub const TOKEN_ARTIFACT: &str = "DreamToken";

pub struct SuiteToken {
    pub symbol: &'static str,
    pub name: &'static str,
    pub supply: u64,
    pub decimals: u8,
}

pub const TOKEN_SUITE: [SuiteToken; 3] = [
    SuiteToken {
        symbol: "DREAM",
        name: "Dream Token",
        supply: 777_777_777,
        decimals: 9,
    },
    SuiteToken {
        symbol: "SMIND",
        name: "Super Mind Token",
        supply: 777_777_777,
        decimals: 9,
    },
    SuiteToken {
        symbol: "LUCID",
        name: "Lucid Token",
        supply: 333_333_333,
        decimals: 9,
    },
];

/// Supply in base units, as a decimal string for the uint256 constructor arg
pub fn raw_supply(token: &SuiteToken) -> String {
    (U256::from(token.supply) * U256::exp10(token.decimals as usize)).to_string()
}

/// Deploy every token of the suite and record a treasury operation.
/// Already deployed symbols are skipped. Each token is stored as soon as
/// its deployment lands, so a failed run can be retried.
pub async fn deploy_token_suite(
    syndicate: &Syndicate,
    treasury_address: &str,
) -> Result<Vec<TokenRecord>, String> {
    let artifact = load_artifact(syndicate.artifacts_dir(), TOKEN_ARTIFACT)?;
    let existing = syndicate.memory().read(|doc| doc.tokens.clone());

    let mut created = Vec::new();
    let mut failure = None;
    for token in TOKEN_SUITE.iter() {
        if existing.contains_key(token.symbol) {
            log::info!("[TOKENS] {} already deployed, skipping", token.symbol);
            continue;
        }

        let args = [
            Value::String(token.name.to_string()),
            Value::String(token.symbol.to_string()),
            Value::String(raw_supply(token)),
        ];
        let deployment = match syndicate.deploy_artifact(token.symbol, &artifact, &args).await {
            Ok(deployment) => deployment,
            Err(e) => {
                failure = Some(format!("{} deployment failed: {}", token.symbol, e));
                break;
            }
        };

        let record = TokenRecord {
            symbol: token.symbol.to_string(),
            name: token.name.to_string(),
            address: deployment.address,
            decimals: token.decimals,
            supply: token.supply,
            authority: deployment.deployer,
            tx_hash: deployment.tx_hash,
            treasury_address: Some(treasury_address.to_string()),
            created_at: deployment.deployed_at,
            provenance: deployment.provenance,
        };
        let stored = record.clone();
        syndicate.memory().update(move |doc| {
            doc.tokens.insert(stored.symbol.clone(), stored);
            Ok(())
        })?;
        created.push(record);
    }

    if !created.is_empty() {
        let operation = TreasuryOperation {
            operation: "deploy_token_suite".to_string(),
            treasury_address: treasury_address.to_string(),
            tokens: created.iter().map(|t| t.symbol.clone()).collect(),
            occurred_at: Utc::now().to_rfc3339(),
        };
        syndicate.memory().update(move |doc| {
            doc.treasury_operations.push(operation);
            Ok(())
        })?;
        log::info!(
            "[TOKENS] Deployed {} tokens, treasury {}",
            created.len(),
            treasury_address
        );
    }

    match failure {
        Some(e) => {
            log::error!("[TOKENS] {}", e);
            Err(e)
        }
        None => Ok(created),
    }
}

pub fn treasury_status(doc: &MemoryDocument, treasury_address: &str) -> TreasuryStatus {
    TreasuryStatus {
        treasury_address: treasury_address.to_string(),
        tokens_deployed: doc.tokens.keys().cloned().collect(),
        token_count: doc.tokens.len(),
        dreams_recorded: doc.dreams.len(),
        mev_rebates_claimed: doc.mev_rebates_claimed,
        total_dream_rewards: doc.dreams.iter().map(|d| d.token_reward).sum(),
        provenance: doc.provenance_counts(),
    }
}
