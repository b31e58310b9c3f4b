use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use certwatch_common::types::{Domain, ScanAttempt, ScanRunSummary, ScanStatus};

use crate::error::{Result, StorageError};

const DOMAINS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY,
    hostname TEXT NOT NULL UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_scanned INTEGER,
    next_scan INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_domains_active_last_scanned ON domains(is_active, last_scanned);
";

const SCAN_RESULTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scan_results (
    id INTEGER PRIMARY KEY,
    domain_id INTEGER NOT NULL,
    scan_time INTEGER NOT NULL,
    status TEXT NOT NULL,
    common_name TEXT,
    san_list TEXT,
    issuer TEXT,
    subject TEXT,
    serial_number TEXT,
    not_before INTEGER,
    not_after INTEGER,
    self_signed INTEGER NOT NULL DEFAULT 0,
    key_bits INTEGER,
    signature_algorithm TEXT,
    days_until_expiry INTEGER,
    http_status INTEGER,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_scan_results_domain_id ON scan_results(domain_id);
CREATE INDEX IF NOT EXISTS idx_scan_results_scan_time ON scan_results(scan_time);
";

const SCAN_RUNS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scan_runs (
    id INTEGER PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    total_domains INTEGER NOT NULL,
    valid_count INTEGER NOT NULL,
    invalid_count INTEGER NOT NULL,
    failed_count INTEGER NOT NULL,
    expiring_soon_count INTEGER NOT NULL,
    duration_secs INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scan_runs_started_at ON scan_runs(started_at);
";

/// One persisted scan result row, as returned by [`ScanStore::scan_history`].
#[derive(Debug, Clone)]
pub struct ScanResultRow {
    pub id: i64,
    pub domain_id: i64,
    pub scan_time: DateTime<Utc>,
    pub status: ScanStatus,
    pub common_name: Option<String>,
    pub san_list: Vec<String>,
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub serial_number: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub self_signed: bool,
    pub key_bits: Option<i32>,
    pub signature_algorithm: Option<String>,
    pub days_until_expiry: Option<i64>,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
}

// Stay under SQLITE_MAX_VARIABLE_NUMBER, which is 999 on older builds.
const SQL_IN_CHUNK: usize = 500;

pub struct ScanStore {
    conn: Mutex<Connection>,
    _db_path: Option<PathBuf>,
}

impl ScanStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("certwatch.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::apply_schema(&conn)?;
        tracing::info!(path = %db_path.display(), "Initialized scan store");
        Ok(Self {
            conn: Mutex::new(conn),
            _db_path: Some(db_path),
        })
    }

    /// In-memory store, used by tests and demos.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            _db_path: None,
        })
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(DOMAINS_SCHEMA)?;
        conn.execute_batch(SCAN_RESULTS_SCHEMA)?;
        conn.execute_batch(SCAN_RUNS_SCHEMA)?;
        Ok(())
    }

    /// Trim and lowercase a hostname. Hostnames are normalized exactly once,
    /// at creation, so lookups and uniqueness never depend on caller casing.
    fn normalize_hostname(hostname: &str) -> Result<String> {
        let normalized = hostname.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(StorageError::InvalidHostname(hostname.to_string()));
        }
        Ok(normalized)
    }

    // ---- domains ----

    pub fn insert_domain(&self, hostname: &str) -> Result<Domain> {
        let normalized = Self::normalize_hostname(hostname)?;
        let id = certwatch_common::id::next_id();
        let now = Utc::now().timestamp();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO domains (id, hostname, is_active, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4)",
                rusqlite::params![id, normalized, now, now],
            )?;
        }
        self.get_domain_by_id(id)?
            .ok_or(StorageError::InsertReadback { entity: "domain" })
    }

    pub fn insert_domains_batch(&self, hostnames: &[String]) -> Result<Vec<Domain>> {
        let mut ids = Vec::with_capacity(hostnames.len());
        {
            let conn = self.conn.lock().unwrap();
            let tx = conn.unchecked_transaction()?;
            let now = Utc::now().timestamp();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO domains (id, hostname, is_active, created_at, updated_at)
                     VALUES (?1, ?2, 1, ?3, ?4)",
                )?;
                for hostname in hostnames {
                    let normalized = Self::normalize_hostname(hostname)?;
                    let id = certwatch_common::id::next_id();
                    stmt.execute(rusqlite::params![id, normalized, now, now])?;
                    ids.push(id);
                }
            }
            tx.commit()?;
        }

        let mut domains = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(d) = self.get_domain_by_id(id)? {
                domains.push(d);
            }
        }
        Ok(domains)
    }

    pub fn get_domain_by_id(&self, id: i64) -> Result<Option<Domain>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, hostname, is_active, last_scanned, next_scan, created_at, updated_at
             FROM domains WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![id], |row| Ok(Self::row_to_domain(row)))?;
        match rows.next() {
            Some(Ok(Ok(d))) => Ok(Some(d)),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub fn get_domain_by_hostname(&self, hostname: &str) -> Result<Option<Domain>> {
        let normalized = Self::normalize_hostname(hostname)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, hostname, is_active, last_scanned, next_scan, created_at, updated_at
             FROM domains WHERE hostname = ?1",
        )?;
        let mut rows =
            stmt.query_map(rusqlite::params![normalized], |row| Ok(Self::row_to_domain(row)))?;
        match rows.next() {
            Some(Ok(Ok(d))) => Ok(Some(d)),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Active domains ordered by scan urgency: never-scanned first, then
    /// oldest-scanned first.
    pub fn list_active_domains(&self) -> Result<Vec<Domain>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, hostname, is_active, last_scanned, next_scan, created_at, updated_at
             FROM domains
             WHERE is_active = 1
             ORDER BY (last_scanned IS NOT NULL), last_scanned ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok(Self::row_to_domain(row)))?;
        let mut domains = Vec::new();
        for row in rows {
            domains.push(row??);
        }
        Ok(domains)
    }

    pub fn set_domain_active(&self, id: i64, active: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE domains SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![active as i32, now, id],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_domain(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM scan_results WHERE domain_id = ?1",
            rusqlite::params![id],
        )?;
        let deleted = conn.execute("DELETE FROM domains WHERE id = ?1", rusqlite::params![id])?;
        Ok(deleted > 0)
    }

    // ---- scan results ----

    /// Persist one batch of scan attempts in a single transaction.
    ///
    /// Attempts for domains that no longer exist are discarded (the domain
    /// may have been deleted while the scan was running). All surviving rows
    /// are appended and `last_scanned` is advanced for exactly those domains
    /// in the same transaction, so either the whole batch lands or none of
    /// it does. Returns the number of rows written.
    pub fn persist_batch(
        &self,
        attempts: &[ScanAttempt],
        scanned_at: DateTime<Utc>,
    ) -> Result<usize> {
        if attempts.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let ts = scanned_at.timestamp();

        // Batched lookups instead of a round-trip per domain, chunked to
        // stay within the host-parameter limit.
        let candidate_ids: Vec<i64> = attempts.iter().map(|a| a.domain_id).collect();
        let mut known: HashSet<i64> = HashSet::with_capacity(candidate_ids.len());
        for chunk in candidate_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "SELECT id FROM domains WHERE id IN ({})",
                repeat_vars(chunk.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                row.get::<_, i64>(0)
            })?;
            for row in rows {
                known.insert(row?);
            }
        }

        let mut written_ids = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO scan_results (id, domain_id, scan_time, status, common_name,
                     san_list, issuer, subject, serial_number, not_before, not_after,
                     self_signed, key_bits, signature_algorithm, days_until_expiry,
                     http_status, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;
            for attempt in attempts {
                if !known.contains(&attempt.domain_id) {
                    tracing::debug!(
                        domain = %attempt.hostname,
                        domain_id = attempt.domain_id,
                        "Domain no longer exists, discarding result"
                    );
                    continue;
                }
                let facts = attempt.facts.as_ref();
                let san_json = facts
                    .map(|f| serde_json::to_string(&f.san_list))
                    .transpose()?;
                stmt.execute(rusqlite::params![
                    certwatch_common::id::next_id(),
                    attempt.domain_id,
                    ts,
                    attempt.status.to_string(),
                    facts.and_then(|f| f.common_name.clone()),
                    san_json,
                    facts.map(|f| f.issuer.clone()),
                    facts.map(|f| f.subject.clone()),
                    facts.map(|f| f.serial_number.clone()),
                    facts.map(|f| f.not_before.timestamp()),
                    facts.map(|f| f.not_after.timestamp()),
                    facts.map(|f| f.self_signed as i32).unwrap_or(0),
                    facts.and_then(|f| f.key_bits),
                    facts.map(|f| f.signature_algorithm.clone()),
                    facts.map(|f| f.days_until_expiry),
                    attempt.http_status,
                    attempt.error,
                ])?;
                written_ids.push(attempt.domain_id);
            }
        }

        for chunk in written_ids.chunks(SQL_IN_CHUNK) {
            // last_scanned only ever moves forward.
            let sql = format!(
                "UPDATE domains SET last_scanned = ?1, updated_at = ?1
                 WHERE (last_scanned IS NULL OR last_scanned <= ?1) AND id IN ({})",
                repeat_vars_from(2, chunk.len())
            );
            let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&ts];
            for id in chunk {
                params.push(id);
            }
            tx.execute(&sql, params.as_slice())?;
        }

        tx.commit()?;
        Ok(written_ids.len())
    }

    /// Last `limit` scan results for one domain, newest first.
    pub fn scan_history(&self, domain_id: i64, limit: usize) -> Result<Vec<ScanResultRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, scan_time, status, common_name, san_list, issuer, subject,
                    serial_number, not_before, not_after, self_signed, key_bits,
                    signature_algorithm, days_until_expiry, http_status, error_message
             FROM scan_results
             WHERE domain_id = ?1
             ORDER BY scan_time DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![domain_id, limit as i64], |row| {
            Ok(Self::row_to_result(row))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row??);
        }
        Ok(results)
    }

    // ---- scan runs ----

    pub fn insert_run_summary(&self, summary: &ScanRunSummary) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scan_runs (id, started_at, finished_at, total_domains, valid_count,
                 invalid_count, failed_count, expiring_soon_count, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                summary.id,
                summary.started_at.timestamp(),
                summary.finished_at.timestamp(),
                summary.total_domains,
                summary.valid_count,
                summary.invalid_count,
                summary.failed_count,
                summary.expiring_soon_count,
                summary.duration_secs,
            ],
        )?;
        Ok(())
    }

    pub fn last_run_summary(&self) -> Result<Option<ScanRunSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, total_domains, valid_count, invalid_count,
                    failed_count, expiring_soon_count, duration_secs
             FROM scan_runs
             ORDER BY started_at DESC, id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], |row| Ok(Self::row_to_summary(row)))?;
        match rows.next() {
            Some(Ok(Ok(s))) => Ok(Some(s)),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub fn count_run_summaries(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM scan_runs", [], |row| row.get(0))?;
        Ok(count)
    }

    // ---- row mappers ----

    fn row_to_domain(row: &rusqlite::Row) -> Result<Domain> {
        let active_int: i32 = row.get(2)?;
        let last_scanned: Option<i64> = row.get(3)?;
        let next_scan: Option<i64> = row.get(4)?;
        let created: i64 = row.get(5)?;
        let updated: i64 = row.get(6)?;
        Ok(Domain {
            id: row.get(0)?,
            hostname: row.get(1)?,
            is_active: active_int != 0,
            last_scanned: last_scanned.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            next_scan: next_scan.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            created_at: DateTime::from_timestamp(created, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(updated, 0).unwrap_or_default(),
        })
    }

    fn row_to_result(row: &rusqlite::Row) -> Result<ScanResultRow> {
        let scan_time: i64 = row.get(2)?;
        let status_str: String = row.get(3)?;
        let status = status_str
            .parse::<ScanStatus>()
            .map_err(|_| StorageError::UnexpectedColumnValue {
                column: "status",
                value: status_str.clone(),
            })?;
        let san_json: Option<String> = row.get(5)?;
        let san_list = match san_json {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        let not_before: Option<i64> = row.get(9)?;
        let not_after: Option<i64> = row.get(10)?;
        let self_signed_int: i32 = row.get(11)?;
        let http_status: Option<i64> = row.get(15)?;
        Ok(ScanResultRow {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            scan_time: DateTime::from_timestamp(scan_time, 0).unwrap_or_default(),
            status,
            common_name: row.get(4)?,
            san_list,
            issuer: row.get(6)?,
            subject: row.get(7)?,
            serial_number: row.get(8)?,
            not_before: not_before.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            not_after: not_after.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            self_signed: self_signed_int != 0,
            key_bits: row.get(12)?,
            signature_algorithm: row.get(13)?,
            days_until_expiry: row.get(14)?,
            http_status: http_status.map(|s| s as u16),
            error_message: row.get(16)?,
        })
    }

    fn row_to_summary(row: &rusqlite::Row) -> Result<ScanRunSummary> {
        let started: i64 = row.get(1)?;
        let finished: i64 = row.get(2)?;
        Ok(ScanRunSummary {
            id: row.get(0)?,
            started_at: DateTime::from_timestamp(started, 0).unwrap_or_default(),
            finished_at: DateTime::from_timestamp(finished, 0).unwrap_or_default(),
            total_domains: row.get(3)?,
            valid_count: row.get(4)?,
            invalid_count: row.get(5)?,
            failed_count: row.get(6)?,
            expiring_soon_count: row.get(7)?,
            duration_secs: row.get(8)?,
        })
    }
}

/// `?, ?, ?` placeholder list for `IN` clauses.
fn repeat_vars(count: usize) -> String {
    repeat_vars_from(1, count)
}

fn repeat_vars_from(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
