use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;

/// Durable per-peer read-state: the timestamp up to which the user has read
/// incoming messages from that peer.
///
/// The in-memory map is authoritative for the session; the sqlite row is
/// what survives a restart. A failed durable write is logged, remembered,
/// and retried on a later write rather than surfaced.
pub struct ReadStateLedger {
    conn: Mutex<Connection>,
    state: Mutex<LedgerState>,
}

struct LedgerState {
    last_read: HashMap<String, DateTime<Utc>>,
    /// Peers whose durable write failed and still needs a retry
    dirty: HashSet<String>,
}

impl ReadStateLedger {
    /// Open (creating if needed) the ledger at `path`
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Ledger that lives only as long as the process
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS read_state (
                peer_id TEXT PRIMARY KEY,
                last_read TEXT NOT NULL
            );",
        )?;

        let mut last_read = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT peer_id, last_read FROM read_state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for (peer_id, raw) in rows.flatten() {
                match raw.parse::<DateTime<Utc>>() {
                    Ok(ts) => {
                        last_read.insert(peer_id, ts);
                    }
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Discarding unparseable read-state row");
                    }
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            state: Mutex::new(LedgerState {
                last_read,
                dirty: HashSet::new(),
            }),
        })
    }

    /// Timestamp up to which incoming messages from `peer_id` are read
    pub fn last_read(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_read.get(peer_id).copied()
    }

    /// Monotonic write: ignored unless `ts` is later than the stored value.
    /// Also retries any earlier writes that failed to reach the database.
    pub fn mark_read(&self, peer_id: &str, ts: DateTime<Utc>) {
        let pending: Vec<(String, DateTime<Utc>)>;
        {
            let mut state = self.state.lock().unwrap();
            let newer = state
                .last_read
                .get(peer_id)
                .map(|have| ts > *have)
                .unwrap_or(true);
            if !newer {
                return;
            }
            state.last_read.insert(peer_id.to_string(), ts);
            state.dirty.insert(peer_id.to_string());
            pending = state
                .dirty
                .iter()
                .filter_map(|id| state.last_read.get(id).map(|have| (id.clone(), *have)))
                .collect();
        }

        for (id, have) in pending {
            match self.persist(&id, have) {
                Ok(()) => {
                    self.state.lock().unwrap().dirty.remove(&id);
                }
                Err(e) => {
                    warn!(peer_id = %id, error = %e, "Durable read-state write failed, will retry");
                }
            }
        }
    }

    fn persist(&self, peer_id: &str, ts: DateTime<Utc>) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO read_state (peer_id, last_read) VALUES (?1, ?2)",
            (peer_id, ts.to_rfc3339()),
        )?;
        Ok(())
    }
}
