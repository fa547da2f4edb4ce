use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{FileRecord, MappingSnapshot};
use crate::store::SnapshotStore;

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS snapshots (
              account_key TEXT PRIMARY KEY NOT NULL,
              captured_at TEXT NOT NULL,
              record_count INTEGER NOT NULL,
              is_complete INTEGER NOT NULL,
              truncated INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS snapshot_records (
              account_key TEXT NOT NULL
                REFERENCES snapshots(account_key) ON DELETE CASCADE,
              position INTEGER NOT NULL,
              file_id TEXT NOT NULL,
              record TEXT NOT NULL,
              PRIMARY KEY (account_key, position)
            );
            "#,
        )?;
        Ok(())
    }

    pub fn list_accounts(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT account_key FROM snapshots ORDER BY account_key")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &MappingSnapshot) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM snapshots WHERE account_key = ?1",
            params![snapshot.owner_account_key],
        )?;
        tx.execute(
            r#"
            INSERT INTO snapshots (
              account_key, captured_at, record_count, is_complete, truncated
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                snapshot.owner_account_key,
                snapshot.captured_at.to_rfc3339(),
                snapshot.record_count as i64,
                snapshot.is_complete,
                snapshot.truncated,
            ],
        )?;
        {
            let mut insert = tx.prepare(
                r#"
                INSERT INTO snapshot_records (account_key, position, file_id, record)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )?;
            for (position, record) in snapshot.records.iter().enumerate() {
                let json = serde_json::to_string(record)?;
                insert.execute(params![
                    snapshot.owner_account_key,
                    position as i64,
                    record.id,
                    json
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load(&self, account_key: &str) -> Result<Option<MappingSnapshot>> {
        let conn = self.conn();
        let header = conn
            .query_row(
                r#"
                SELECT captured_at, record_count, is_complete, truncated
                FROM snapshots
                WHERE account_key = ?1
                "#,
                params![account_key],
                |r| {
                    let captured_at: String = r.get(0)?;
                    let record_count: i64 = r.get(1)?;
                    let is_complete: bool = r.get(2)?;
                    let truncated: bool = r.get(3)?;
                    Ok((captured_at, record_count, is_complete, truncated))
                },
            )
            .optional()?;

        let Some((captured_at, record_count, is_complete, truncated)) = header else {
            return Ok(None);
        };

        let captured_at = DateTime::parse_from_rfc3339(&captured_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| Error::InvalidArgument(format!("bad captured_at: {err}")))?;

        let mut stmt = conn.prepare(
            "SELECT record FROM snapshot_records WHERE account_key = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![account_key], |r| r.get::<_, String>(0))?;
        let mut records: Vec<FileRecord> = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }

        Ok(Some(MappingSnapshot {
            owner_account_key: account_key.to_string(),
            records,
            record_count: record_count.max(0) as usize,
            captured_at,
            is_complete,
            truncated,
        }))
    }

    fn clear(&self, account_key: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM snapshot_records WHERE account_key = ?1",
            params![account_key],
        )?;
        conn.execute(
            "DELETE FROM snapshots WHERE account_key = ?1",
            params![account_key],
        )?;
        Ok(())
    }
}
