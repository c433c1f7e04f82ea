//! Versioned JSON memory store.
//!
//! Holds the document behind a mutex, migrates legacy files on open and
//! persists atomically through a temp file and rename.

use dream_types::*;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const PREVIEW_CHARS: usize = 50;

/// Markers the older scripts left on fabricated hashes and addresses
const SIMULATION_MARKERS: [&str; 5] = ["0xSIM", "SIM_", "SIMULATION", "0xRELAY", "SOL"];

pub struct MemoryStore {
    path: PathBuf,
    doc: Mutex<MemoryDocument>,
}

impl MemoryStore {
    /// Open the memory file, migrating a legacy document if needed.
    ///
    /// A missing file yields an empty document that is written on the
    /// first update.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();

        let doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
            load_document(&path, value)?
        } else {
            log::info!("[MEMORY] {} not found, starting empty", path.display());
            MemoryDocument::default()
        };

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDocument> {
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the current document
    pub fn snapshot(&self) -> MemoryDocument {
        self.lock().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&MemoryDocument) -> R) -> R {
        f(&self.lock())
    }

    /// Apply a change and persist it. If the closure or the write fails,
    /// neither the in-memory nor the on-disk document changes.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut MemoryDocument) -> Result<R, String>,
    ) -> Result<R, String> {
        let mut guard = self.lock();
        let mut draft = guard.clone();
        let result = f(&mut draft)?;
        persist(&self.path, &draft)?;
        *guard = draft;
        Ok(result)
    }
}

fn load_document(path: &Path, value: Value) -> Result<MemoryDocument, String> {
    let obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(format!("{} is not a JSON object", path.display())),
    };

    match obj.get("schema_version").and_then(|v| v.as_u64()) {
        Some(version) if version > MEMORY_SCHEMA_VERSION as u64 => Err(format!(
            "{} has schema version {}, newer than supported version {}",
            path.display(),
            version,
            MEMORY_SCHEMA_VERSION
        )),
        Some(_) => serde_json::from_value(Value::Object(obj))
            .map_err(|e| format!("Invalid memory document {}: {}", path.display(), e)),
        None => {
            let backup = backup_path(path);
            std::fs::copy(path, &backup)
                .map_err(|e| format!("Failed to back up legacy memory to {}: {}", backup.display(), e))?;

            let doc = migrate_legacy(obj);
            persist(path, &doc)?;
            log::info!(
                "[MEMORY] Migrated legacy memory {} (backup at {}): {} deployments, {} dreams",
                path.display(),
                backup.display(),
                doc.deployments.len(),
                doc.dreams.len()
            );
            Ok(doc)
        }
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".v0.bak");
    PathBuf::from(name)
}

fn persist(path: &Path, doc: &MemoryDocument) -> Result<(), String> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| format!("Failed to serialize memory: {}", e))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json)
        .map_err(|e| format!("Failed to write {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| format!("Failed to replace {}: {}", path.display(), e))
}

// =====================================================
// Content helpers
// =====================================================

pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// First 50 chars, with "..." when truncated
pub fn content_preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Classify legacy identifiers by the markers fabricated values carry
pub fn classify_legacy<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> Provenance {
    let present: Vec<&str> = values.into_iter().flatten().collect();
    let simulated = present.iter().any(|v| {
        SIMULATION_MARKERS.iter().any(|m| v.starts_with(m) || v.contains("SIMULATION"))
            || v.to_lowercase().contains("placeholder")
    });
    if simulated {
        Provenance::Simulated
    } else {
        Provenance::Unverified
    }
}

// =====================================================
// Legacy migration
// =====================================================

/// Merge every legacy shape into a version 1 document. Keys that are not
/// understood are carried over into `extra`.
pub fn migrate_legacy(mut obj: Map<String, Value>) -> MemoryDocument {
    let mut doc = MemoryDocument::default();

    if let Some(Value::Object(last)) = obj.remove("lastDeployed") {
        for (name, entry) in last {
            if let Some(d) = legacy_deployment(&name, &entry) {
                doc.deployments.insert(name, d);
            }
        }
    }

    if let Some(Value::Object(deployments)) = obj.remove("deployments") {
        for (name, entry) in deployments {
            if doc.deployments.contains_key(&name) {
                continue;
            }
            if let Some(d) = legacy_deployment(&name, &entry) {
                doc.deployments.insert(name, d);
            }
        }
    }

    // Single-deployment shape written by the standalone deploy scripts
    if obj.contains_key("contract") && obj.contains_key("address") {
        let single = Value::Object(obj.clone());
        if let Some(name) = str_field(&single, &["contract"]) {
            if let Some(d) = legacy_deployment(&name, &single) {
                doc.deployments.entry(name).or_insert(d);
            }
        }
        for key in ["contract", "address", "deployer", "transactionHash", "abi", "network", "chainId", "timestamp"] {
            obj.remove(key);
        }
    }

    if let Some(Value::Array(loot)) = obj.remove("loot") {
        for (i, entry) in loot.iter().enumerate() {
            if let Some(d) = legacy_loot(i, entry) {
                doc.dreams.push(d);
            }
        }
    }

    if let Some(Value::Array(dreams)) = obj.remove("dreams") {
        for (i, entry) in dreams.iter().enumerate() {
            if let Some(d) = legacy_dream(i, entry) {
                doc.dreams.push(d);
            }
        }
    }

    if let Some(Value::Array(audits)) = obj.remove("audits") {
        doc.audits.extend(audits.iter().filter_map(legacy_audit));
    }

    if let Some(Value::Object(tokens)) = obj.remove("tokens") {
        for (symbol, entry) in tokens {
            if let Some(t) = legacy_token(&symbol, &entry) {
                doc.tokens.insert(symbol, t);
            }
        }
    }

    if let Some(Value::Array(ops)) = obj.remove("treasury_operations") {
        doc.treasury_operations.extend(ops.iter().map(|op| TreasuryOperation {
            operation: str_field(op, &["operation", "type"]).unwrap_or_else(|| "unknown".to_string()),
            treasury_address: str_field(op, &["treasury_address", "treasury"]).unwrap_or_default(),
            tokens: op
                .get("tokens_deployed")
                .or_else(|| op.get("tokens"))
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or_default(),
            occurred_at: timestamp_field(op, &["timestamp", "occurred_at"]),
        }));
    }

    if let Some(mev) = obj.remove("mev_protection") {
        doc.mev_rebates_claimed = mev.get("rebates_claimed").and_then(|v| v.as_u64()).unwrap_or(0);
    }

    doc.extra = obj;
    doc
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

fn u64_field(value: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_u64()))
        .unwrap_or(0)
}

/// Legacy timestamps are either RFC3339 strings or float unix seconds
fn timestamp_field(value: &Value, keys: &[&str]) -> String {
    for key in keys {
        match value.get(*key) {
            Some(Value::String(s)) => return s.clone(),
            Some(Value::Number(n)) => {
                if let Some(secs) = n.as_f64() {
                    let millis = (secs * 1000.0) as i64;
                    if let Some(dt) = chrono::DateTime::from_timestamp_millis(millis) {
                        return dt.to_rfc3339();
                    }
                }
            }
            _ => {}
        }
    }
    chrono::DateTime::from_timestamp(0, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn legacy_deployment(name: &str, entry: &Value) -> Option<Deployment> {
    let address = str_field(entry, &["address"])?;
    let tx_hash = str_field(entry, &["txHash", "transactionHash", "tx_hash"]);
    Some(Deployment {
        contract: name.to_string(),
        provenance: classify_legacy([Some(address.as_str()), tx_hash.as_deref()]),
        address,
        abi: entry.get("abi").cloned().unwrap_or(Value::Null),
        bytecode: str_field(entry, &["bytecode"]),
        tx_hash,
        gas_used: u64_field(entry, &["gasUsed", "gas_used"]),
        deployer: str_field(entry, &["deployer"]),
        deployed_at: timestamp_field(entry, &["timestamp", "deployed_at"]),
    })
}

fn legacy_loot(index: usize, entry: &Value) -> Option<DreamRecord> {
    let dream = str_field(entry, &["dream"])?;
    let tx_hash = str_field(entry, &["txHash", "tx_hash"]);
    let ipfs_hash = str_field(entry, &["ipfsHash", "ipfs_hash"]);
    Some(DreamRecord {
        id: format!("loot_{}", index),
        dreamer: str_field(entry, &["dreamer"]).unwrap_or_default(),
        content_hash: content_hash(&dream),
        content_preview: content_preview(&dream),
        provenance: classify_legacy([tx_hash.as_deref(), ipfs_hash.as_deref()]),
        dream: Some(dream),
        ipfs_hash,
        tx_hash,
        gas_used: u64_field(entry, &["gasUsed", "gas_used"]),
        token_reward: 0,
        recorded_at: timestamp_field(entry, &["timestamp"]),
    })
}

fn legacy_dream(index: usize, entry: &Value) -> Option<DreamRecord> {
    let dream = str_field(entry, &["dream", "content"]);
    let hash = str_field(entry, &["content_hash"])
        .or_else(|| dream.as_deref().map(content_hash))?;
    let preview = str_field(entry, &["content_preview"])
        .or_else(|| dream.as_deref().map(content_preview))
        .unwrap_or_default();
    let tx_hash = str_field(entry, &["transaction_signature", "txHash", "tx_hash"]);
    let dreamer = str_field(entry, &["dreamer"]).unwrap_or_default();

    Some(DreamRecord {
        id: str_field(entry, &["id"]).unwrap_or_else(|| format!("dream_{}", index)),
        provenance: classify_legacy([tx_hash.as_deref(), Some(dreamer.as_str())]),
        dreamer,
        dream,
        content_hash: hash,
        content_preview: preview,
        ipfs_hash: str_field(entry, &["ipfsHash", "ipfs_hash"]),
        tx_hash,
        gas_used: u64_field(entry, &["gasUsed", "gas_used"]),
        token_reward: u64_field(entry, &["token_reward"]),
        recorded_at: timestamp_field(entry, &["timestamp", "recorded_at"]),
    })
}

fn legacy_audit(entry: &Value) -> Option<AuditRecord> {
    let checks = entry.get("checks");
    let check = |keys: &[&str]| {
        checks.and_then(|c| keys.iter().find_map(|k| c.get(*k).and_then(|v| v.as_bool())))
    };
    let code_size = u64_field(entry, &["codeSize", "code_size"]) as usize;

    Some(AuditRecord {
        contract: str_field(entry, &["contract"])?,
        address: str_field(entry, &["address"]).unwrap_or_default(),
        code_hash: str_field(entry, &["codeHash", "code_hash"]).unwrap_or_default(),
        code_size,
        checks: AuditChecks {
            code_exists: check(&["codeExists", "code_exists"]).unwrap_or(code_size > 0),
            hash_matches: check(&["hashMatches", "hash_matches"]),
        },
        audited_at: timestamp_field(entry, &["timestamp", "audited_at"]),
        provenance: Provenance::Unverified,
    })
}

fn legacy_token(symbol: &str, entry: &Value) -> Option<TokenRecord> {
    let address = str_field(entry, &["address", "mint"])?;
    let tx_hash = str_field(entry, &["transaction_signature", "txHash", "tx_hash"]);
    let authority = str_field(entry, &["authority"]);
    Some(TokenRecord {
        symbol: symbol.to_string(),
        name: str_field(entry, &["name"]).unwrap_or_else(|| symbol.to_string()),
        provenance: classify_legacy([
            Some(address.as_str()),
            tx_hash.as_deref(),
            authority.as_deref(),
        ]),
        address,
        decimals: u64_field(entry, &["decimals"]) as u8,
        supply: u64_field(entry, &["supply"]),
        authority,
        tx_hash,
        treasury_address: str_field(entry, &["treasury_address", "treasury"]),
        created_at: timestamp_field(entry, &["created_at", "timestamp"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_json(dir: &TempDir, value: &Value) -> PathBuf {
        let path = dir.path().join("iem_memory.json");
        std::fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iem_memory.json");
        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.snapshot(), MemoryDocument::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_update_persists_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iem_memory.json");
        let store = MemoryStore::open(&path).unwrap();

        store
            .update(|doc| {
                doc.mev_rebates_claimed = 3;
                Ok(())
            })
            .unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot().mev_rebates_claimed, 3);
        assert!(!dir.path().join("iem_memory.json.tmp").exists());
    }

    #[test]
    fn test_failed_update_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iem_memory.json");
        let store = MemoryStore::open(&path).unwrap();

        let result: Result<(), String> = store.update(|doc| {
            doc.mev_rebates_claimed = 99;
            Err("boom".to_string())
        });
        assert!(result.is_err());
        assert_eq!(store.snapshot().mev_rebates_claimed, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_persist_keeps_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        // The target is a directory, so the rename fails
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner"), "x").unwrap();
        let store = MemoryStore {
            path: path.clone(),
            doc: Mutex::new(MemoryDocument::default()),
        };

        let result = store.update(|doc| {
            doc.mev_rebates_claimed = 1;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.snapshot().mev_rebates_claimed, 0);
    }

    #[test]
    fn test_future_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let original = json!({"schema_version": MEMORY_SCHEMA_VERSION + 1, "dreams": []});
        let path = write_json(&dir, &original);

        let err = MemoryStore::open(&path).err().unwrap();
        assert!(err.contains("newer than supported"));

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, original);
    }

    #[test]
    fn test_legacy_document_migrates_with_backup() {
        let dir = TempDir::new().unwrap();
        let legacy = json!({
            "lastDeployed": {
                "IEMDreams": {
                    "address": "0x1111111111111111111111111111111111111111",
                    "abi": [],
                    "bytecode": "0x6080",
                    "timestamp": 1725000000.5,
                    "txHash": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                    "gasUsed": 1200000
                }
            },
            "loot": [
                {"dreamer": "0xabc", "dream": "flying", "ipfsHash": "placeholder", "timestamp": 1725000001.0, "txHash": "0xbbbb"}
            ],
            "audits": [
                {"contract": "IEMDreams", "address": "0x1111111111111111111111111111111111111111", "codeHash": "ff", "codeSize": 10, "timestamp": 1725000002.0, "checks": {"codeExists": true, "hashMatches": true}}
            ],
            "mev_protection": {"enabled": true, "rebates_claimed": 4},
            "cycles": [1, 2]
        });
        let path = write_json(&dir, &legacy);

        let store = MemoryStore::open(&path).unwrap();
        let doc = store.snapshot();

        assert_eq!(doc.schema_version, MEMORY_SCHEMA_VERSION);
        let dep = &doc.deployments["IEMDreams"];
        assert_eq!(dep.gas_used, 1_200_000);
        assert_eq!(dep.provenance, Provenance::Unverified);

        assert_eq!(doc.dreams.len(), 1);
        assert_eq!(doc.dreams[0].provenance, Provenance::Simulated);
        assert_eq!(doc.dreams[0].content_hash, content_hash("flying"));

        assert_eq!(doc.audits[0].code_size, 10);
        assert_eq!(doc.audits[0].checks.hash_matches, Some(true));
        assert_eq!(doc.mev_rebates_claimed, 4);
        assert_eq!(doc.extra["cycles"], json!([1, 2]));

        let backup: Value =
            serde_json::from_str(&std::fs::read_to_string(backup_path(&path)).unwrap()).unwrap();
        assert_eq!(backup, legacy);

        let migrated: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(migrated["schema_version"], json!(MEMORY_SCHEMA_VERSION));
    }

    #[test]
    fn test_migrates_token_agent_shape() {
        let legacy = json!({
            "tokens": {
                "DREAM": {
                    "address": "SOL0123456789abcdef",
                    "name": "Dream Token",
                    "symbol": "DREAM",
                    "decimals": 9,
                    "supply": 777777777,
                    "authority": "SIMULATION_AUTHORITY",
                    "transaction_signature": "SIM_0123456789abcdef",
                    "created_at": 1725000000.0,
                    "treasury_address": "4eJZVbbsiLAG6EkWvgEYEWKEpdhJPFBYMeJ6DBX98w6a"
                }
            },
            "dreams": [{
                "id": "dream_1",
                "dreamer": "SIMULATION_DREAMER",
                "content_hash": "abcd",
                "content_preview": "a short dream",
                "timestamp": 1725000000.0,
                "token_reward": 10,
                "transaction_signature": "SIM_DREAM_dream_1"
            }],
            "treasury_operations": [{
                "operation": "token_deployment",
                "treasury_address": "4eJZVbbsiLAG6EkWvgEYEWKEpdhJPFBYMeJ6DBX98w6a",
                "tokens_deployed": ["DREAM", "SMIND", "LUCID"],
                "timestamp": 1725000000.0
            }],
            "programs": {}
        });
        let obj = match legacy {
            Value::Object(o) => o,
            _ => unreachable!(),
        };
        let doc = migrate_legacy(obj);

        let token = &doc.tokens["DREAM"];
        assert_eq!(token.decimals, 9);
        assert_eq!(token.provenance, Provenance::Simulated);

        assert_eq!(doc.dreams[0].token_reward, 10);
        assert!(doc.dreams[0].dream.is_none());
        assert_eq!(doc.treasury_operations[0].tokens.len(), 3);
        assert!(doc.extra.contains_key("programs"));
    }

    #[test]
    fn test_single_deployment_shape() {
        let legacy = json!({
            "contract": "OneiroSphere",
            "address": "0x2222222222222222222222222222222222222222",
            "deployer": "0x3333333333333333333333333333333333333333",
            "transactionHash": "0xSIMULATION",
            "abi": []
        });
        let obj = match legacy {
            Value::Object(o) => o,
            _ => unreachable!(),
        };
        let doc = migrate_legacy(obj);
        let dep = &doc.deployments["OneiroSphere"];
        assert_eq!(dep.deployer.as_deref(), Some("0x3333333333333333333333333333333333333333"));
        assert_eq!(dep.provenance, Provenance::Simulated);
        assert!(doc.extra.is_empty());
    }

    #[test]
    fn test_classify_legacy_markers() {
        assert_eq!(classify_legacy([Some("0xRELAY123")]), Provenance::Simulated);
        assert_eq!(classify_legacy([Some("SIM_abc")]), Provenance::Simulated);
        assert_eq!(classify_legacy([None, Some("Placeholder")]), Provenance::Simulated);
        assert_eq!(classify_legacy([Some("0xabcdef")]), Provenance::Unverified);
        assert_eq!(classify_legacy([None]), Provenance::Unverified);
    }

    #[test]
    fn test_content_preview() {
        assert_eq!(content_preview("short"), "short");
        let long = "x".repeat(60);
        let preview = content_preview(&long);
        assert_eq!(preview.len(), 53);
        assert!(preview.ends_with("..."));
    }
}
