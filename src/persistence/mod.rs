// =============================================================================
// Signal Store — SQLite persistence for signals, outcomes and context
// =============================================================================
//
// Four logical tables behind a single WAL-mode connection:
//
//   signals          one row per emitted signal, amended with delivery status
//   outcomes         one row per signal, written exactly once at the horizon
//   context_oi /
//   context_funding  polled series, auto-pruned at 7 days
//   state_blob       JSON blobs: confidence counters, monitored coin set
//
// Every write is a single statement or transaction; concurrent readers are
// fine under WAL. Failing to open the database at boot is fatal; any later
// write failure is the caller's warn-and-continue problem — in-memory truth
// survives.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::types::{
    ContextAssessment, ContextSnapshot, Direction, OutcomeLabel, Priority, SignalKind,
    SignalOutcome, Tier, TradingSignal,
};

/// Context rows older than this are pruned.
const CONTEXT_RETENTION_MS: i64 = 7 * 24 * 3_600_000;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS signals (
    id          TEXT PRIMARY KEY,
    ts          INTEGER NOT NULL,
    symbol      TEXT NOT NULL,
    kind        TEXT NOT NULL,
    direction   TEXT NOT NULL,
    entry       TEXT NOT NULL,
    stop        TEXT NOT NULL,
    target      TEXT NOT NULL,
    confidence  REAL NOT NULL,
    tier        TEXT NOT NULL,
    priority    TEXT NOT NULL,
    context     TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    delivery    TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_signals_ts ON signals(ts DESC);
CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol, ts DESC);

CREATE TABLE IF NOT EXISTS outcomes (
    signal_id      TEXT PRIMARY KEY,
    ts             INTEGER NOT NULL,
    price_at_check TEXT NOT NULL,
    pct_to_target  REAL NOT NULL,
    label          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context_oi (
    symbol TEXT NOT NULL,
    ts     INTEGER NOT NULL,
    oi_usd TEXT NOT NULL,
    PRIMARY KEY (symbol, ts)
);

CREATE TABLE IF NOT EXISTS context_funding (
    symbol       TEXT NOT NULL,
    ts           INTEGER NOT NULL,
    funding_rate TEXT NOT NULL,
    PRIMARY KEY (symbol, ts)
);

CREATE TABLE IF NOT EXISTS state_blob (
    key  TEXT PRIMARY KEY,
    json TEXT NOT NULL
);
"#;

/// Thread-safe store. Writers serialise on the mutex; statements are short.
pub struct SignalStore {
    conn: Mutex<Connection>,
}

impl SignalStore {
    /// Open (or create) the database at `path`. Fatal at boot on failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open signal store at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialise signal store schema")?;
        info!(path = %path.display(), "signal store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialise signal store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn insert_signal(&self, signal: &TradingSignal) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO signals
             (id, ts, symbol, kind, direction, entry, stop, target, confidence,
              tier, priority, context, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                signal.id,
                signal.ts,
                signal.symbol,
                signal.kind.as_str(),
                signal.direction.to_string(),
                signal.entry.to_string(),
                signal.stop.to_string(),
                signal.target.to_string(),
                signal.confidence,
                signal.tier.to_string(),
                signal.priority.as_str(),
                signal.context.as_str(),
                signal.fingerprint,
            ],
        )
        .context("failed to insert signal")?;
        Ok(())
    }

    /// Amend the delivery status: `delivered` or `delivery-failed`.
    pub fn mark_delivery(&self, signal_id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signals SET delivery = ?2 WHERE id = ?1",
            params![signal_id, status],
        )
        .context("failed to update delivery status")?;
        Ok(())
    }

    /// Most recent signals, newest-first.
    pub fn recent_signals(&self, limit: usize) -> Result<Vec<TradingSignal>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, ts, symbol, kind, direction, entry, stop, target,
                        confidence, tier, priority, context, fingerprint
                 FROM signals ORDER BY ts DESC LIMIT ?1",
            )
            .context("failed to prepare recent-signals query")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RawSignalRow {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    symbol: row.get(2)?,
                    kind: row.get(3)?,
                    direction: row.get(4)?,
                    entry: row.get(5)?,
                    stop: row.get(6)?,
                    target: row.get(7)?,
                    confidence: row.get(8)?,
                    tier: row.get(9)?,
                    priority: row.get(10)?,
                    context: row.get(11)?,
                    fingerprint: row.get(12)?,
                })
            })
            .context("failed to query recent signals")?;

        let mut out = Vec::new();
        for row in rows {
            let row = row.context("failed to read signal row")?;
            if let Some(signal) = row.into_signal() {
                out.push(signal);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    pub fn insert_outcome(&self, outcome: &SignalOutcome) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO outcomes
             (signal_id, ts, price_at_check, pct_to_target, label)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                outcome.signal_id,
                outcome.ts,
                outcome.price_at_check.to_string(),
                outcome.pct_to_target,
                outcome.label.as_str(),
            ],
        )
        .context("failed to insert outcome")?;
        Ok(())
    }

    pub fn outcome_count(&self, label: OutcomeLabel) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM outcomes WHERE label = ?1",
                params![label.as_str()],
                |row| row.get(0),
            )
            .context("failed to count outcomes")?;
        Ok(count as u64)
    }

    // -------------------------------------------------------------------------
    // Context series
    // -------------------------------------------------------------------------

    pub fn insert_context(&self, snapshot: &ContextSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO context_oi (symbol, ts, oi_usd) VALUES (?1, ?2, ?3)",
            params![
                snapshot.symbol,
                snapshot.ts,
                snapshot.open_interest_usd.to_string()
            ],
        )
        .context("failed to insert context OI")?;
        conn.execute(
            "INSERT OR REPLACE INTO context_funding (symbol, ts, funding_rate)
             VALUES (?1, ?2, ?3)",
            params![snapshot.symbol, snapshot.ts, snapshot.funding_rate.to_string()],
        )
        .context("failed to insert context funding")?;
        Ok(())
    }

    /// Drop context rows older than seven days. Returns rows removed.
    pub fn prune_context(&self, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms - CONTEXT_RETENTION_MS;
        let conn = self.conn.lock();
        let a = conn
            .execute("DELETE FROM context_oi WHERE ts < ?1", params![cutoff])
            .context("failed to prune context_oi")?;
        let b = conn
            .execute("DELETE FROM context_funding WHERE ts < ?1", params![cutoff])
            .context("failed to prune context_funding")?;
        if a + b > 0 {
            debug!(removed = a + b, "context tables pruned");
        }
        Ok(a + b)
    }

    // -------------------------------------------------------------------------
    // State blobs
    // -------------------------------------------------------------------------

    pub fn save_state_blob(&self, key: &str, json: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO state_blob (key, json) VALUES (?1, ?2)",
            params![key, json.to_string()],
        )
        .context("failed to save state blob")?;
        Ok(())
    }

    pub fn load_state_blob(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT json FROM state_blob WHERE key = ?1")
            .context("failed to prepare state blob query")?;
        let mut rows = stmt.query(params![key]).context("failed to query state blob")?;
        match rows.next().context("failed to read state blob row")? {
            Some(row) => {
                let raw: String = row.get(0).context("failed to get state blob column")?;
                let value =
                    serde_json::from_str(&raw).context("failed to parse state blob JSON")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

// -----------------------------------------------------------------------------
// Row mapping
// -----------------------------------------------------------------------------

struct RawSignalRow {
    id: String,
    ts: i64,
    symbol: String,
    kind: String,
    direction: String,
    entry: String,
    stop: String,
    target: String,
    confidence: f64,
    tier: String,
    priority: String,
    context: String,
    fingerprint: String,
}

impl RawSignalRow {
    /// Rows written by older builds with unknown labels are skipped, not
    /// errors.
    fn into_signal(self) -> Option<TradingSignal> {
        Some(TradingSignal {
            id: self.id,
            ts: self.ts,
            symbol: self.symbol,
            kind: parse_kind(&self.kind)?,
            direction: parse_direction(&self.direction)?,
            entry: self.entry.parse::<Decimal>().ok()?,
            stop: self.stop.parse::<Decimal>().ok()?,
            target: self.target.parse::<Decimal>().ok()?,
            confidence: self.confidence,
            tier: parse_tier(&self.tier)?,
            priority: parse_priority(&self.priority)?,
            context: parse_context(&self.context)?,
            context_stale: false,
            fingerprint: self.fingerprint,
        })
    }
}

fn parse_kind(s: &str) -> Option<SignalKind> {
    match s {
        "STOP_HUNT" => Some(SignalKind::StopHunt),
        "WHALE_ACCUMULATION" => Some(SignalKind::WhaleAccumulation),
        "WHALE_DISTRIBUTION" => Some(SignalKind::WhaleDistribution),
        "ACCUMULATION" => Some(SignalKind::Accumulation),
        "DISTRIBUTION" => Some(SignalKind::Distribution),
        "VOLUME_SPIKE" => Some(SignalKind::VolumeSpike),
        _ => None,
    }
}

fn parse_direction(s: &str) -> Option<Direction> {
    match s {
        "LONG" => Some(Direction::Long),
        "SHORT" => Some(Direction::Short),
        "NONE" => Some(Direction::None),
        _ => None,
    }
}

fn parse_tier(s: &str) -> Option<Tier> {
    match s {
        "T1" => Some(Tier::Tier1),
        "T2" => Some(Tier::Tier2),
        "T3" => Some(Tier::Tier3),
        _ => None,
    }
}

fn parse_priority(s: &str) -> Option<Priority> {
    match s {
        "urgent" => Some(Priority::Urgent),
        "watch" => Some(Priority::Watch),
        "info" => Some(Priority::Info),
        _ => None,
    }
}

fn parse_context(s: &str) -> Option<ContextAssessment> {
    match s {
        "favorable" => Some(ContextAssessment::Favorable),
        "neutral" => Some(ContextAssessment::Neutral),
        "unfavorable" => Some(ContextAssessment::Unfavorable),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fingerprint;
    use rust_decimal_macros::dec;

    fn signal(id: &str, ts: i64) -> TradingSignal {
        TradingSignal {
            id: id.to_string(),
            symbol: "BTCUSDT".into(),
            kind: SignalKind::StopHunt,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95704),
            target: dec!(96592),
            confidence: 93.0,
            tier: Tier::Tier1,
            priority: Priority::Urgent,
            context: ContextAssessment::Neutral,
            context_stale: false,
            ts,
            fingerprint: fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Long, 93.0),
        }
    }

    #[test]
    fn signal_roundtrip() {
        let store = SignalStore::open_in_memory().unwrap();
        store.insert_signal(&signal("a", 1_000)).unwrap();
        store.insert_signal(&signal("b", 2_000)).unwrap();

        let recent = store.recent_signals(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "b"); // newest first
        assert_eq!(recent[0].entry, dec!(96000));
        assert_eq!(recent[0].kind, SignalKind::StopHunt);
        assert_eq!(recent[0].priority, Priority::Urgent);
    }

    #[test]
    fn delivery_status_amendable() {
        let store = SignalStore::open_in_memory().unwrap();
        store.insert_signal(&signal("a", 1_000)).unwrap();
        store.mark_delivery("a", "delivered").unwrap();
        store.mark_delivery("a", "delivery-failed").unwrap();
        // No panic and the row is still readable.
        assert_eq!(store.recent_signals(10).unwrap().len(), 1);
    }

    #[test]
    fn outcome_written_once() {
        let store = SignalStore::open_in_memory().unwrap();
        let outcome = SignalOutcome {
            signal_id: "a".into(),
            ts: 10_000,
            price_at_check: dec!(96300),
            pct_to_target: 0.6,
            label: OutcomeLabel::Win,
        };
        store.insert_outcome(&outcome).unwrap();
        // Second insert is a no-op, not a constraint error.
        store.insert_outcome(&outcome).unwrap();
        assert_eq!(store.outcome_count(OutcomeLabel::Win).unwrap(), 1);
    }

    #[test]
    fn context_prunes_at_seven_days() {
        let store = SignalStore::open_in_memory().unwrap();
        let now = 10 * 24 * 3_600_000i64;
        let old = ContextSnapshot {
            symbol: "BTCUSDT".into(),
            ts: 1_000,
            open_interest_usd: dec!(1000000),
            funding_rate: dec!(0.0001),
            source_exchange: "aggregated".into(),
        };
        let fresh = ContextSnapshot {
            ts: now - 1_000,
            ..old.clone()
        };
        store.insert_context(&old).unwrap();
        store.insert_context(&fresh).unwrap();

        let removed = store.prune_context(now).unwrap();
        assert_eq!(removed, 2); // one oi row + one funding row
    }

    #[test]
    fn state_blob_roundtrip() {
        let store = SignalStore::open_in_memory().unwrap();
        let blob = serde_json::json!({ "producers": { "stop_hunt": { "wins": 3, "losses": 1 } } });
        store.save_state_blob("confidence", &blob).unwrap();
        let loaded = store.load_state_blob("confidence").unwrap().unwrap();
        assert_eq!(loaded, blob);
        assert!(store.load_state_blob("missing").unwrap().is_none());
    }
}
