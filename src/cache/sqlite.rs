//! SQLite-backed cache store.
//!
//! Entries live in a single `api_cache` table keyed by fingerprint, with an
//! indexed `expires_at` column (milliseconds since the Unix epoch) so sweeps
//! and liveness checks are range scans. File databases run in WAL mode.
//!
//! rusqlite is blocking; every operation runs on tokio's blocking pool while
//! holding the connection mutex, which also makes each statement atomic with
//! respect to other callers.

use super::backend::{CacheEntry, CacheStore};
use super::key::Fingerprint;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS api_cache (
    fingerprint   TEXT PRIMARY KEY,
    method        TEXT NOT NULL,
    endpoint      TEXT NOT NULL,
    status_code   INTEGER NOT NULL,
    response_body TEXT NOT NULL,
    response_size INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    expires_at    INTEGER NOT NULL CHECK (expires_at > created_at),
    response_headers TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_api_cache_expires_at ON api_cache (expires_at);
CREATE INDEX IF NOT EXISTS idx_api_cache_endpoint ON api_cache (endpoint);
";

const SELECT_COLUMNS: &str = "fingerprint, method, endpoint, status_code, response_body, \
     response_size, created_at, expires_at, response_headers";

/// Rows returned by a single ad-hoc query, whatever its own LIMIT says.
pub const MAX_QUERY_ROWS: usize = 10_000;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::cache_unavailable(e.to_string(), ErrorContext::new().with_source("sqlite_store"))
    }
}

/// Result of a read-only ad-hoc query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub query: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub data: Vec<Value>,
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Opened with `SQLITE_OPEN_READ_ONLY`; ad-hoc queries never touch `conn`.
    reader: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// Leading keywords accepted by [`SqliteStore::query_readonly`].
const QUERY_KEYWORDS: [&str; 4] = ["select", "with", "explain", "pragma"];

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        let reader = open_reader(path)?;
        tracing::debug!(path = %path.display(), "opened sqlite cache store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            reader: Arc::new(Mutex::new(reader)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database private to this store, mostly for tests and
    /// ephemeral runs. A uniquely named shared-cache database lets the
    /// read-only query connection see the same tables.
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!("file:tool-relay-{}?mode=memory&cache=shared", Uuid::new_v4().simple());
        let conn = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA)?;
        let reader = open_reader(&uri)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            reader: Arc::new(Mutex::new(reader)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| {
            Error::cache_unavailable(
                format!("sqlite task failed: {}", e),
                ErrorContext::new().with_source("sqlite_store"),
            )
        })?
    }

    /// Run a read-only statement and return its rows as JSON objects.
    ///
    /// Only `SELECT`, `WITH`, `EXPLAIN` and `PRAGMA` statements that SQLite
    /// reports as read-only are accepted, and they run on a connection opened
    /// read-only. A statement that leaves a transaction open is rolled back
    /// and rejected. A `LIMIT` is appended to queries that have none.
    pub async fn query_readonly(&self, sql: &str, limit: usize) -> Result<QueryOutput> {
        let query = with_limit(sql, limit);
        check_query_keyword(&query)?;
        let writer = Arc::clone(&self.conn);
        let reader = Arc::clone(&self.reader);
        tokio::task::spawn_blocking(move || {
            // Held so shared-cache table locks never collide with a write.
            let _writer = lock(&writer)?;
            let conn = lock(&reader)?;
            let result = run_query(&conn, query);
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
                return Err(rejected("statements may not leave a transaction open"));
            }
            result
        })
        .await
        .map_err(|e| {
            Error::cache_unavailable(
                format!("sqlite task failed: {}", e),
                ErrorContext::new().with_source("sqlite_store"),
            )
        })?
    }
}

fn open_reader(path: impl AsRef<Path>) -> Result<Connection> {
    let reader = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    reader.busy_timeout(Duration::from_secs(5))?;
    reader.execute_batch("PRAGMA query_only = ON")?;
    Ok(reader)
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| {
        Error::cache_unavailable(
            "sqlite connection lock poisoned",
            ErrorContext::new().with_source("sqlite_store"),
        )
    })
}

fn rejected(msg: &str) -> Error {
    Error::validation_with_context(
        msg.to_string(),
        ErrorContext::new()
            .with_field_path("query")
            .with_source("sqlite_store"),
    )
}

fn check_query_keyword(query: &str) -> Result<()> {
    let keyword = query
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if QUERY_KEYWORDS.contains(&keyword.as_str()) {
        Ok(())
    } else {
        Err(rejected("only SELECT, WITH, EXPLAIN and PRAGMA statements are allowed"))
    }
}

fn run_query(conn: &Connection, query: String) -> Result<QueryOutput> {
    let invalid = |e: rusqlite::Error| {
        Error::validation_with_context(
            e.to_string(),
            ErrorContext::new()
                .with_field_path("query")
                .with_source("sqlite_store"),
        )
    };
    let mut stmt = conn.prepare(&query).map_err(invalid)?;
    if !stmt.readonly() {
        return Err(Error::validation_with_context(
            "only read-only statements are allowed",
            ErrorContext::new()
                .with_field_path("query")
                .with_details(query.clone()),
        ));
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([]).map_err(invalid)?;
    let mut data = Vec::new();
    while let Some(row) = rows.next().map_err(invalid)? {
        if data.len() >= MAX_QUERY_ROWS {
            break;
        }
        let mut obj = serde_json::Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), json_value(row.get_ref(i).map_err(invalid)?));
        }
        data.push(Value::Object(obj));
    }
    Ok(QueryOutput {
        row_count: data.len(),
        query,
        columns,
        data,
    })
}

fn with_limit(sql: &str, limit: usize) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let lower = trimmed.to_lowercase();
    let is_select = lower.starts_with("select") || lower.starts_with("with");
    let has_limit = Regex::new(r"(?i)\blimit\b")
        .map(|re| re.is_match(trimmed))
        .unwrap_or(true);
    if is_select && !has_limit {
        format!("{} LIMIT {}", trimmed, limit)
    } else {
        trimmed.to_string()
    }
}

fn json_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn headers_from_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeMap<String, String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let status: i64 = row.get(3)?;
    let size: i64 = row.get(5)?;
    Ok(CacheEntry {
        fingerprint: Fingerprint::from_hex(row.get::<_, String>(0)?),
        method: row.get(1)?,
        endpoint: row.get(2)?,
        status: u16::try_from(status).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, status))?,
        body: row.get(4)?,
        size: usize::try_from(size).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(5, size))?,
        created_at: timestamp(row, 6)?,
        expires_at: timestamp(row, 7)?,
        headers: headers_from_json(row, 8)?,
    })
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let key = fingerprint.to_string();
        let now_ms = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM api_cache WHERE fingerprint = ?1", SELECT_COLUMNS);
            let found = conn
                .query_row(&sql, params![key], row_to_entry)
                .optional()?;
            match found {
                Some(e) if e.expires_at.timestamp_millis() > now_ms => Ok(Some(e)),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM api_cache WHERE fingerprint = ?1 AND expires_at <= ?2",
                        params![key, now_ms],
                    )?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        entry.validate()?;
        let headers = serde_json::to_string(&entry.headers)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO api_cache (fingerprint, method, endpoint, status_code, response_body,
                                        response_size, created_at, expires_at, response_headers)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                     method = excluded.method,
                     endpoint = excluded.endpoint,
                     status_code = excluded.status_code,
                     response_body = excluded.response_body,
                     response_size = excluded.response_size,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at,
                     response_headers = excluded.response_headers",
                params![
                    entry.fingerprint.as_str(),
                    entry.method,
                    entry.endpoint,
                    i64::from(entry.status),
                    entry.body,
                    entry.size as i64,
                    entry.created_at.timestamp_millis(),
                    entry.expires_at.timestamp_millis(),
                    headers,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = now.timestamp_millis();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM api_cache WHERE expires_at <= ?1", params![now_ms])?)
        })
        .await
    }

    async fn len(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM api_cache WHERE expires_at > ?1",
                params![now_ms],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as usize)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM api_cache", [])?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::tests::entry;

    #[tokio::test]
    async fn test_round_trip_and_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let e = entry("abc", Utc::now(), Duration::from_secs(60));
        store.put(e.clone()).await.unwrap();

        let got = store.get(&e.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.body, e.body);
        assert_eq!(got.status, 200);
        assert_eq!(got.size, e.size);
        assert_eq!(got.expires_at.timestamp_millis(), e.expires_at.timestamp_millis());
        assert_eq!(got.headers, e.headers);

        let mut newer = e.clone();
        newer.body = "replaced".into();
        newer.status = 201;
        store.put(newer).await.unwrap();
        let got = store.get(&e.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.body, "replaced");
        assert_eq!(got.status, 201);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_read_is_miss_and_deletes_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let e = entry(
            "stale",
            Utc::now() - chrono::Duration::seconds(30),
            Duration::from_secs(10),
        );
        store.put(e.clone()).await.unwrap();
        assert!(store.get(&e.fingerprint).await.unwrap().is_none());

        let out = store
            .query_readonly("SELECT COUNT(*) AS n FROM api_cache", 10)
            .await
            .unwrap();
        assert_eq!(out.data[0]["n"], 0);
    }

    #[tokio::test]
    async fn test_sweep() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.put(entry("live", now, Duration::from_secs(300))).await.unwrap();
        store
            .put(entry("dead1", now - chrono::Duration::seconds(50), Duration::from_secs(5)))
            .await
            .unwrap();
        store
            .put(entry("dead2", now - chrono::Duration::seconds(50), Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.sweep(now).await.unwrap(), 2);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let e = entry("durable", Utc::now(), Duration::from_secs(600));
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(e.clone()).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        let got = store.get(&e.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.endpoint, e.endpoint);
    }

    #[tokio::test]
    async fn test_query_readonly_rejects_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .query_readonly("DELETE FROM api_cache", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = store
            .query_readonly("SELECT * FROM missing_table", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_query_readonly_rejects_transaction_control() {
        let store = SqliteStore::open_in_memory().unwrap();
        for sql in [
            "BEGIN",
            "BEGIN IMMEDIATE",
            "COMMIT",
            "ROLLBACK",
            "SAVEPOINT sp",
            "RELEASE sp",
            "ATTACH DATABASE ':memory:' AS other",
            "DETACH other",
            "WITH doomed AS (SELECT 1) DELETE FROM api_cache",
            "  -- comment first\nSELECT 1",
        ] {
            let err = store.query_readonly(sql, 10).await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{}: {}", sql, err);
        }

        // writes made after a rejected BEGIN stay committed
        let e = entry("kept", Utc::now(), Duration::from_secs(60));
        store.put(e.clone()).await.unwrap();
        assert!(store.query_readonly("ROLLBACK", 10).await.is_err());
        assert_eq!(store.get(&e.fingerprint).await.unwrap().unwrap().body, e.body);
    }

    #[tokio::test]
    async fn test_query_allows_pragma_and_explain_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("cache.db")).unwrap();
        let e = entry("durable", Utc::now(), Duration::from_secs(60));
        store.put(e.clone()).await.unwrap();

        let out = store
            .query_readonly("PRAGMA table_info(api_cache)", 50)
            .await
            .unwrap();
        assert!(out.row_count >= 8);
        let out = store
            .query_readonly("EXPLAIN SELECT * FROM api_cache", 10)
            .await
            .unwrap();
        assert!(out.row_count > 0);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[test]
    fn test_query_keyword_allowlist() {
        assert!(check_query_keyword("select 1").is_ok());
        assert!(check_query_keyword("WITH t AS (SELECT 1) SELECT * FROM t").is_ok());
        assert!(check_query_keyword("Explain query plan select 1").is_ok());
        assert!(check_query_keyword("PRAGMA table_info(api_cache)").is_ok());
        assert!(check_query_keyword("begin").is_err());
        assert!(check_query_keyword("attach 'x.db' as x").is_err());
        assert!(check_query_keyword("selectx 1").is_err());
        assert!(check_query_keyword("").is_err());
    }

    #[tokio::test]
    async fn test_query_readonly_applies_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            store
                .put(entry(&format!("k{}", i), now, Duration::from_secs(60)))
                .await
                .unwrap();
        }
        let out = store
            .query_readonly("SELECT fingerprint, status_code FROM api_cache;", 3)
            .await
            .unwrap();
        assert_eq!(out.row_count, 3);
        assert_eq!(out.columns, vec!["fingerprint", "status_code"]);
        assert!(out.query.ends_with("LIMIT 3"));

        let out = store
            .query_readonly("select fingerprint from api_cache limit 4", 3)
            .await
            .unwrap();
        assert_eq!(out.row_count, 4);
    }

    #[test]
    fn test_with_limit() {
        assert_eq!(with_limit("SELECT 1;", 5), "SELECT 1 LIMIT 5");
        assert_eq!(with_limit("select 1 LIMIT 2", 5), "select 1 LIMIT 2");
        assert_eq!(with_limit("PRAGMA table_info(api_cache)", 5), "PRAGMA table_info(api_cache)");
    }
}
