//! Append-only receipt log. Every envelope a peer sends or accepts is
//! persisted as `(trade_id, seq)` before the in-memory snapshot advances, so
//! any trade can be rebuilt by replaying its receipts through the state
//! machine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::envelope::schema;
use crate::envelope::SignedEnvelope;

use super::{Trade, machine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct Receipt {
    pub trade_id: String,
    pub seq: i64,
    pub direction: ReceiptDirection,
    pub envelope_hash: String,
    pub envelope_json: String,
    pub recorded_unix: i64,
}

#[derive(Debug)]
pub struct ReceiptStore {
    conn: Connection,
    path: PathBuf,
}

impl ReceiptStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create receipt store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one envelope under the next sequence number of its trade and
    /// returns that sequence number.
    pub fn append(
        &mut self,
        trade_id: &str,
        direction: ReceiptDirection,
        envelope: &SignedEnvelope,
        recorded_unix: i64,
    ) -> Result<i64> {
        let envelope_hash = envelope.envelope.hash().context("hash envelope")?;
        let wire = envelope.to_wire().context("encode envelope")?;
        let envelope_json =
            serde_json::to_string(&wire).context("serialize envelope wire form")?;

        let tx = self.conn.transaction().context("begin receipt tx")?;
        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM receipts WHERE trade_id = ?1",
                params![trade_id],
                |row| row.get(0),
            )
            .context("next receipt seq")?;
        tx.execute(
            r#"
INSERT INTO receipts (trade_id, seq, direction, envelope_hash, envelope_json, recorded_unix)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
            params![
                trade_id,
                seq,
                direction_to_str(direction),
                envelope_hash,
                envelope_json,
                recorded_unix,
            ],
        )
        .with_context(|| format!("insert receipt {trade_id}/{seq}"))?;
        tx.commit().context("commit receipt tx")?;
        Ok(seq)
    }

    pub fn list(&self, trade_id: &str) -> Result<Vec<Receipt>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT trade_id, seq, direction, envelope_hash, envelope_json, recorded_unix
FROM receipts
WHERE trade_id = ?1
ORDER BY seq
"#,
            )
            .context("prepare list receipts")?;

        let rows = stmt
            .query_map(params![trade_id], row_to_receipt)
            .context("query receipts")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read receipt row")?);
        }
        Ok(out)
    }

    pub fn latest_seq(&self, trade_id: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(seq) FROM receipts WHERE trade_id = ?1",
                params![trade_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map(Option::flatten)
            .with_context(|| format!("latest seq for {trade_id}"))
    }

    pub fn trade_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT trade_id FROM receipts ORDER BY trade_id")
            .context("prepare trade ids")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query trade ids")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read trade id")?);
        }
        Ok(out)
    }

    /// Rebuilds a trade snapshot by replaying its receipts in order. Each
    /// receipt is applied at the clock it was originally recorded at, so
    /// freshness checks reproduce the original decisions.
    pub fn rebuild(&self, trade_id: &str) -> Result<Trade> {
        let mut trade = Trade::new(trade_id);
        for receipt in self.list(trade_id)? {
            let wire: serde_json::Value = serde_json::from_str(&receipt.envelope_json)
                .with_context(|| format!("parse receipt {trade_id}/{}", receipt.seq))?;
            let signed = schema::parse_signed(&wire)
                .with_context(|| format!("validate receipt {trade_id}/{}", receipt.seq))?;
            trade = machine::apply(&trade, &signed, receipt.recorded_unix)
                .with_context(|| format!("replay receipt {trade_id}/{}", receipt.seq))?;
        }
        Ok(trade)
    }
}

fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<Receipt> {
    let direction_str: String = row.get(2)?;
    let direction = match direction_str.as_str() {
        "sent" => ReceiptDirection::Sent,
        "received" => ReceiptDirection::Received,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown receipt direction: {other}").into(),
            ));
        }
    };
    Ok(Receipt {
        trade_id: row.get(0)?,
        seq: row.get(1)?,
        direction,
        envelope_hash: row.get(3)?,
        envelope_json: row.get(4)?,
        recorded_unix: row.get(5)?,
    })
}

fn direction_to_str(direction: ReceiptDirection) -> &'static str {
    match direction {
        ReceiptDirection::Sent => "sent",
        ReceiptDirection::Received => "received",
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS receipts (
  trade_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  direction TEXT NOT NULL,
  envelope_hash TEXT NOT NULL,
  envelope_json TEXT NOT NULL,
  recorded_unix INTEGER NOT NULL,
  PRIMARY KEY (trade_id, seq)
);
CREATE INDEX IF NOT EXISTS receipts_hash_idx ON receipts(envelope_hash);
"#,
    )
    .context("create tables")?;
    Ok(())
}
