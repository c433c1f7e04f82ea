//! SQLite database operations for the dream service.

use dream_types::*;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use std::sync::{Mutex, MutexGuard};

/// A decoded event ready to be stored
pub struct NewEvent<'a> {
    pub contract: &'a str,
    pub event_name: &'a str,
    pub contract_address: &'a str,
    pub block_number: u64,
    pub block_timestamp: Option<u64>,
    pub tx_hash: &'a str,
    pub log_index: u64,
    pub args: &'a serde_json::Map<String, serde_json::Value>,
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chain_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contract TEXT NOT NULL,
                event_name TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                block_timestamp INTEGER,
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                args_json TEXT NOT NULL,
                captured_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                UNIQUE(tx_hash, log_index)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_block ON chain_events(block_number DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_name ON chain_events(event_name, block_number DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS listener_cursors (
                contract_address TEXT NOT NULL,
                event_name TEXT NOT NULL,
                last_block INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                PRIMARY KEY (contract_address, event_name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS relay_records (
                id TEXT PRIMARY KEY,
                transaction_id TEXT NOT NULL,
                status TEXT NOT NULL,
                savings REAL NOT NULL DEFAULT 0.0,
                provenance TEXT NOT NULL,
                record_json TEXT NOT NULL,
                relayed_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relay_time ON relay_records(relayed_at DESC)",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Events
    // =====================================================

    /// Store an event. Returns false if (tx_hash, log_index) was already stored.
    pub fn insert_event(&self, event: &NewEvent<'_>) -> SqliteResult<bool> {
        let conn = self.conn();
        let args_json = serde_json::Value::Object(event.args.clone()).to_string();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO chain_events
                (contract, event_name, contract_address, block_number, block_timestamp, tx_hash, log_index, args_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.contract,
                event.event_name,
                event.contract_address,
                event.block_number as i64,
                event.block_timestamp.map(|t| t as i64),
                event.tx_hash,
                event.log_index as i64,
                args_json,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn query_events(&self, filter: &EventFilter) -> SqliteResult<Vec<ChainEvent>> {
        let conn = self.conn();
        let mut sql = String::from(
            "SELECT id, contract, event_name, contract_address, block_number, block_timestamp,
                    tx_hash, log_index, args_json, captured_at
             FROM chain_events WHERE 1=1",
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref contract) = filter.contract {
            values.push(Box::new(contract.clone()));
            sql.push_str(&format!(" AND contract = ?{}", values.len()));
        }
        if let Some(ref event_name) = filter.event_name {
            values.push(Box::new(event_name.clone()));
            sql.push_str(&format!(" AND event_name = ?{}", values.len()));
        }
        if let Some(since) = filter.since_block {
            values.push(Box::new(since as i64));
            sql.push_str(&format!(" AND block_number >= ?{}", values.len()));
        }

        let limit = filter.limit.unwrap_or(100).min(1000);
        sql.push_str(&format!(" ORDER BY block_number DESC, log_index DESC LIMIT {}", limit));

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), |row| {
            let args_json: String = row.get(8)?;
            Ok(ChainEvent {
                id: row.get(0)?,
                contract: row.get(1)?,
                event_name: row.get(2)?,
                contract_address: row.get(3)?,
                block_number: row.get::<_, i64>(4)? as u64,
                block_timestamp: row.get::<_, Option<i64>>(5)?.map(|t| t as u64),
                tx_hash: row.get(6)?,
                log_index: row.get::<_, i64>(7)? as u64,
                args: serde_json::from_str(&args_json).unwrap_or_default(),
                captured_at: row.get(9)?,
            })
        })?;
        rows.collect()
    }

    pub fn event_count(&self) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COUNT(*) FROM chain_events", [], |row| row.get(0))
    }

    pub fn event_stats(&self) -> SqliteResult<EventStatistics> {
        let conn = self.conn();
        conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN event_name IN ('DreamRecorded', 'DreamSubmitted') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN event_name = 'Staked' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN event_name = 'RewardsClaimed' THEN 1 ELSE 0 END), 0),
                COUNT(DISTINCT CASE WHEN event_name IN ('DreamRecorded', 'DreamSubmitted')
                    THEN json_extract(args_json, '$.dreamer') END),
                MAX(block_number)
             FROM chain_events",
            [],
            |row| {
                Ok(EventStatistics {
                    total_events: row.get(0)?,
                    total_dreams: row.get(1)?,
                    total_stakes: row.get(2)?,
                    total_rewards: row.get(3)?,
                    unique_dreamers: row.get(4)?,
                    last_block: row.get::<_, Option<i64>>(5)?.map(|b| b as u64),
                })
            },
        )
    }

    /// Keep only the newest `max_events` events. Returns the number removed.
    pub fn prune_events(&self, max_events: usize) -> SqliteResult<usize> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM chain_events WHERE id NOT IN (
                SELECT id FROM chain_events ORDER BY block_number DESC, log_index DESC LIMIT ?1
             )",
            params![max_events as i64],
        )
    }

    // =====================================================
    // Listener cursors
    // =====================================================

    pub fn get_cursor(&self, contract_address: &str, event_name: &str) -> SqliteResult<Option<u64>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT last_block FROM listener_cursors WHERE contract_address = ?1 AND event_name = ?2",
            params![contract_address, event_name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|b| b.map(|b| b as u64))
    }

    pub fn set_cursor(&self, contract_address: &str, event_name: &str, last_block: u64) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO listener_cursors (contract_address, event_name, last_block)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(contract_address, event_name)
             DO UPDATE SET last_block = excluded.last_block,
                           updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
            params![contract_address, event_name, last_block as i64],
        )?;
        Ok(())
    }

    // =====================================================
    // Relay history
    // =====================================================

    pub fn insert_relay_record(&self, record: &RelayRecord) -> SqliteResult<()> {
        let conn = self.conn();
        let json = serde_json::to_string(record)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        conn.execute(
            "INSERT INTO relay_records (id, transaction_id, status, savings, provenance, record_json, relayed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.transaction_id,
                record.status.to_string(),
                record.savings,
                record.outcome.provenance.to_string(),
                json,
                record.relayed_at,
            ],
        )?;
        Ok(())
    }

    /// Most recent relay records first
    pub fn list_relay_records(&self, limit: usize) -> SqliteResult<Vec<RelayRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT record_json FROM relay_records ORDER BY relayed_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for json in rows {
            let json = json?;
            match serde_json::from_str(&json) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("[DB] Skipping unreadable relay record: {}", e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        }
    }

    fn insert(db: &Db, name: &str, block: u64, log_index: u64, dreamer: &str) -> bool {
        let a = args(json!({"dreamer": dreamer, "dream": "x"}));
        db.insert_event(&NewEvent {
            contract: "IEMDreams",
            event_name: name,
            contract_address: "0x1111111111111111111111111111111111111111",
            block_number: block,
            block_timestamp: Some(1_725_000_000),
            tx_hash: &format!("0x{:064x}", block),
            log_index,
            args: &a,
        })
        .unwrap()
    }

    #[test]
    fn test_insert_event_is_idempotent() {
        let db = Db::open(":memory:").unwrap();
        assert!(insert(&db, "DreamRecorded", 10, 0, "0xa"));
        assert!(!insert(&db, "DreamRecorded", 10, 0, "0xa"));
        assert!(insert(&db, "DreamRecorded", 10, 1, "0xa"));
        assert_eq!(db.event_count().unwrap(), 2);
    }

    #[test]
    fn test_query_events_filters() {
        let db = Db::open(":memory:").unwrap();
        insert(&db, "DreamRecorded", 10, 0, "0xa");
        insert(&db, "Staked", 12, 0, "0xb");
        insert(&db, "DreamRecorded", 15, 0, "0xc");

        let dreams = db
            .query_events(&EventFilter {
                event_name: Some("DreamRecorded".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dreams.len(), 2);
        assert_eq!(dreams[0].block_number, 15);
        assert_eq!(dreams[0].args["dreamer"], json!("0xc"));

        let recent = db
            .query_events(&EventFilter {
                since_block: Some(12),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].block_number, 15);
    }

    #[test]
    fn test_event_stats() {
        let db = Db::open(":memory:").unwrap();
        let empty = db.event_stats().unwrap();
        assert_eq!(empty.total_events, 0);
        assert!(empty.last_block.is_none());

        insert(&db, "DreamRecorded", 10, 0, "0xa");
        insert(&db, "DreamSubmitted", 11, 0, "0xa");
        insert(&db, "DreamRecorded", 12, 0, "0xb");
        insert(&db, "Staked", 13, 0, "0xa");
        insert(&db, "RewardsClaimed", 14, 0, "0xa");

        let stats = db.event_stats().unwrap();
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.total_dreams, 3);
        assert_eq!(stats.total_stakes, 1);
        assert_eq!(stats.total_rewards, 1);
        assert_eq!(stats.unique_dreamers, 2);
        assert_eq!(stats.last_block, Some(14));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let db = Db::open(":memory:").unwrap();
        for block in 1..=5 {
            insert(&db, "Transfer", block, 0, "0xa");
        }
        assert_eq!(db.prune_events(3).unwrap(), 2);

        let remaining = db.query_events(&EventFilter::default()).unwrap();
        let blocks: Vec<u64> = remaining.iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![5, 4, 3]);
    }

    #[test]
    fn test_cursors() {
        let db = Db::open(":memory:").unwrap();
        assert_eq!(db.get_cursor("0xabc", "Transfer").unwrap(), None);
        db.set_cursor("0xabc", "Transfer", 100).unwrap();
        db.set_cursor("0xabc", "Transfer", 250).unwrap();
        assert_eq!(db.get_cursor("0xabc", "Transfer").unwrap(), Some(250));
        assert_eq!(db.get_cursor("0xabc", "Staked").unwrap(), None);
    }

    #[test]
    fn test_relay_records_roundtrip() {
        let db = Db::open(":memory:").unwrap();
        let record = RelayRecord {
            id: "r1".to_string(),
            transaction_id: "tx1".to_string(),
            original_fee: 0.5,
            relayed_fee: 0.0,
            savings: 0.5,
            belief_rewrite: None,
            microstructure: MicrostructureResult {
                processed: false,
                microstructure_id: None,
                original_fee: 0.5,
                processed_fee: 0.5,
                savings: 0.0,
                processed_at: None,
                reason: Some("disabled".to_string()),
            },
            outcome: RelayOutcome {
                success: true,
                method: "zero_cost_relay".to_string(),
                tx_hash: Some("0xSIM0011223344556677".to_string()),
                message: "relayed".to_string(),
                error: None,
                provenance: Provenance::Simulated,
            },
            processing_time_ms: 3,
            relayed_at: "2025-09-01T00:00:00+00:00".to_string(),
            status: RelayStatus::Success,
        };
        db.insert_relay_record(&record).unwrap();

        let listed = db.list_relay_records(10).unwrap();
        assert_eq!(listed, vec![record]);
    }
}
