//! Deployer wallet loaded from a raw private key.

use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{LocalWallet, Signer};

pub struct DeployerWallet {
    wallet: LocalWallet,
    address: String,
}

impl DeployerWallet {
    /// Create a wallet from a hex private key, with or without 0x prefix
    pub fn from_private_key(private_key: &str, chain_id: u64) -> Result<Self, String> {
        let key_hex = private_key.strip_prefix("0x").unwrap_or(private_key);

        let key_bytes = hex::decode(key_hex)
            .map_err(|e| format!("Invalid private key hex: {}", e))?;

        if key_bytes.len() != 32 {
            return Err(format!("Private key must be 32 bytes, got {}", key_bytes.len()));
        }

        let signing_key = SigningKey::from_bytes(key_bytes.as_slice().into())
            .map_err(|e| format!("Invalid private key: {}", e))?;

        let wallet = LocalWallet::from(signing_key).with_chain_id(chain_id);
        let address = format!("{:?}", wallet.address()).to_lowercase();

        Ok(Self { wallet, address })
    }

    pub fn wallet(&self) -> LocalWallet {
        self.wallet.clone()
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known local development key, never funded on a live network
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_from_private_key() {
        let wallet = DeployerWallet::from_private_key(TEST_KEY, 1).unwrap();
        assert_eq!(wallet.address(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
    }

    #[test]
    fn test_prefix_is_optional() {
        let bare = TEST_KEY.trim_start_matches("0x");
        let wallet = DeployerWallet::from_private_key(bare, 1).unwrap();
        assert_eq!(wallet.address(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
    }

    #[test]
    fn test_chain_id_is_applied() {
        let wallet = DeployerWallet::from_private_key(TEST_KEY, 2046399126).unwrap();
        assert_eq!(wallet.wallet().chain_id(), 2046399126);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(DeployerWallet::from_private_key("not-hex", 1).is_err());
        assert!(DeployerWallet::from_private_key("0x1234", 1).is_err());
    }
}
