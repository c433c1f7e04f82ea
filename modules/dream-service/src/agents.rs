//! Agent address registry loaded from `agent_addresses.json`.

use crate::abi;
use crate::chain::ChainClient;
use dream_types::*;
use std::path::Path;

pub struct AgentRegistry {
    file: AgentRegistryFile,
}

impl AgentRegistry {
    /// Load the registry. A missing file gives an empty registry.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            log::warn!("[AGENTS] {} not found, registry is empty", path.display());
            return Ok(Self::from_file(AgentRegistryFile::default()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let file: AgentRegistryFile = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid agent registry {}: {}", path.display(), e))?;

        log::info!(
            "[AGENTS] Loaded {} agents and {} tokens",
            file.agents.len(),
            file.tokens.len()
        );
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: AgentRegistryFile) -> Self {
        Self { file }
    }

    pub fn agent_address(&self, agent: &str) -> Option<&str> {
        self.file.agents.get(agent).map(|a| a.address.as_str())
    }

    pub fn token_address(&self, symbol: &str) -> Option<&str> {
        self.file.tokens.get(symbol).map(|t| t.address.as_str())
    }

    pub fn permissions(&self, agent: &str) -> &[String] {
        self.file
            .agents
            .get(agent)
            .map(|a| a.permissions.as_slice())
            .unwrap_or(&[])
    }

    pub fn check_permission(&self, agent: &str, permission: &str) -> bool {
        self.permissions(agent).iter().any(|p| p == permission)
    }

    /// Check every agent and token address, keyed `agent_<name>` / `token_<symbol>`
    pub fn validate_addresses(&self) -> Vec<AddressValidation> {
        let agents = self
            .file
            .agents
            .iter()
            .map(|(name, a)| (format!("agent_{}", name), a.address.clone()));
        let tokens = self
            .file
            .tokens
            .iter()
            .map(|(symbol, t)| (format!("token_{}", symbol), t.address.clone()));

        agents
            .chain(tokens)
            .map(|(key, address)| AddressValidation {
                valid: abi::parse_address(&address).is_ok(),
                key,
                address,
            })
            .collect()
    }

    /// Native balance in whole units (18 decimals)
    pub async fn agent_balance(&self, chain: &dyn ChainClient, agent: &str) -> Result<f64, String> {
        let address = self
            .agent_address(agent)
            .ok_or_else(|| format!("Unknown agent: {}", agent))?;
        let raw = chain.get_balance(address).await?;
        Ok(abi::to_units(raw, 18))
    }

    /// ERC-20 balance of an agent in whole units
    pub async fn token_balance(
        &self,
        chain: &dyn ChainClient,
        agent: &str,
        symbol: &str,
    ) -> Result<f64, String> {
        let address = self
            .agent_address(agent)
            .ok_or_else(|| format!("Unknown agent: {}", agent))?;
        let token = self
            .file
            .tokens
            .get(symbol)
            .ok_or_else(|| format!("Unknown token: {}", symbol))?;

        let data = abi::encode_balance_of(abi::parse_address(address)?);
        let raw = chain.call(&token.address, data, None).await?;
        Ok(abi::to_units(abi::decode_uint(&raw)?, token.decimals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChainClient;
    use tempfile::TempDir;

    const REGISTRY: &str = r#"{
        "agents": {
            "dream_harvester": {
                "address": "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
                "permissions": ["record_dream", "claim_rewards"]
            },
            "broken": { "address": "not-an-address" }
        },
        "tokens": {
            "DREAM": { "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3", "decimals": 9 },
            "SMIND": { "address": "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512" }
        }
    }"#;

    fn registry() -> AgentRegistry {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agent_addresses.json");
        std::fs::write(&path, REGISTRY).unwrap();
        AgentRegistry::load(&path).unwrap()
    }

    #[test]
    fn test_lookups() {
        let registry = registry();
        assert_eq!(
            registry.agent_address("dream_harvester"),
            Some("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266")
        );
        assert_eq!(registry.agent_address("nobody"), None);
        assert!(registry.token_address("SMIND").is_some());
        assert!(registry.check_permission("dream_harvester", "record_dream"));
        assert!(!registry.check_permission("dream_harvester", "mint"));
        assert!(registry.permissions("broken").is_empty());
    }

    #[test]
    fn test_validate_addresses() {
        let results = registry().validate_addresses();
        assert_eq!(results.len(), 4);

        let invalid: Vec<_> = results.iter().filter(|r| !r.valid).map(|r| r.key.as_str()).collect();
        assert_eq!(invalid, vec!["agent_broken"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = AgentRegistry::load(&tmp.path().join("missing.json")).unwrap();
        assert!(registry.validate_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_balances_in_simulation() {
        let registry = registry();
        let chain = SimulatedChainClient::new(None);

        assert_eq!(registry.agent_balance(&chain, "dream_harvester").await.unwrap(), 0.0);
        assert!(registry.agent_balance(&chain, "nobody").await.is_err());
        // Contract reads are refused without a live chain
        assert!(registry.token_balance(&chain, "dream_harvester", "DREAM").await.is_err());
        assert!(registry.token_balance(&chain, "dream_harvester", "XYZ").await.is_err());
    }
}
