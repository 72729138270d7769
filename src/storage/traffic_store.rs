use crate::models::{Exchange, ExchangeCompletion, ExchangeFilter, OpenExchange};
use anyhow::Context;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable, indexed archive of captured exchanges plus a small settings
/// key/value table.
///
/// A single SQLite connection in WAL mode serializes all writes; calls run
/// on the blocking pool so the proxy's tasks never stall on disk I/O.
/// Ids are the `AUTOINCREMENT` rowid, which makes them strictly increasing
/// in insertion order across the whole file's lifetime.
pub struct TrafficStore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl TrafficStore {
    /// Open (or create) the archive under `base_dir/data/traffic.sqlite3`.
    pub fn open(base_dir: &Path) -> anyhow::Result<Self> {
        let dir = base_dir.join("data");
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating storage directory {:?}", dir))?;
        }
        let db_path = dir.join("traffic.sqlite3");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {:?}", db_path))?;

        // WAL keeps inserts crash-consistent without blocking readers.
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })
        .context("enabling write-ahead logging")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                content_type TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_exchanges_ts
                ON exchanges(ts DESC);
            CREATE INDEX IF NOT EXISTS idx_exchanges_host
                ON exchanges(host);
            CREATE INDEX IF NOT EXISTS idx_exchanges_method
                ON exchanges(method);
            CREATE INDEX IF NOT EXISTS idx_exchanges_status
                ON exchanges(status);
            CREATE INDEX IF NOT EXISTS idx_exchanges_content_type
                ON exchanges(content_type);
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    /// Insert a pending exchange and return its id.
    pub async fn insert_open(&self, open: OpenExchange) -> anyhow::Result<i64> {
        let db = Arc::clone(&self.db);
        let id = tokio::task::spawn_blocking(move || -> anyhow::Result<i64> {
            let mut guard = db.lock().expect("db mutex poisoned");
            let tx = guard.transaction()?;
            tx.execute(
                "INSERT INTO exchanges (ts, method, url, host, path, status, completed, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, '')",
                params![
                    open.timestamp_ms,
                    open.method,
                    open.url,
                    open.host,
                    open.path
                ],
            )
            .context("inserting exchange")?;
            let id = tx.last_insert_rowid();
            let exchange = open.into_exchange(id);
            let payload = serde_json::to_string(&exchange)?;
            tx.execute(
                "UPDATE exchanges SET data = ?1 WHERE id = ?2",
                params![payload, id],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await??;

        Ok(id)
    }

    /// Write the response half of an exchange. Exactly-once: a second call
    /// for the same id is a no-op, as is a call for an unknown id.
    pub async fn complete(&self, id: i64, completion: ExchangeCompletion) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut guard = db.lock().expect("db mutex poisoned");
            let tx = guard.transaction()?;
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT data, completed FROM exchanges WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let Some((data, completed)) = row else {
                return Ok(());
            };
            if completed != 0 {
                return Ok(());
            }

            let mut exchange: Exchange = serde_json::from_str(&data)?;
            let status = completion.status;
            let content_type = completion.content_type.clone();
            completion.apply(&mut exchange);
            let payload = serde_json::to_string(&exchange)?;
            tx.execute(
                "UPDATE exchanges
                 SET status = ?1, content_type = ?2, completed = 1, data = ?3
                 WHERE id = ?4",
                params![status, content_type, payload, id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<Exchange>> {
        let db = Arc::clone(&self.db);
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Exchange>> {
            let guard = db.lock().expect("db mutex poisoned");
            let mut stmt = guard.prepare("SELECT data FROM exchanges WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            if let Some(row) = rows.next()? {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            } else {
                Ok(None)
            }
        })
        .await??;

        Ok(result)
    }

    /// Run a filter query, newest first.
    pub async fn query(&self, filter: &ExchangeFilter) -> anyhow::Result<Vec<Exchange>> {
        let (clause, params) = build_where_clause(filter);
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let offset = filter.offset.map(|o| o as i64).unwrap_or(0);
        let db = Arc::clone(&self.db);

        let rows = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Exchange>> {
            let guard = db.lock().expect("db mutex poisoned");
            let sql = format!(
                "SELECT data FROM exchanges {clause} ORDER BY ts DESC, id DESC LIMIT ? OFFSET ?"
            );
            let mut query_params = params;
            query_params.push(Value::from(limit));
            query_params.push(Value::from(offset));
            let mut stmt = guard.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(query_params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let data: String = row.get(0)?;
                out.push(serde_json::from_str(&data)?);
            }
            Ok(out)
        })
        .await??;

        Ok(rows)
    }

    /// Number of exchanges the filter matches, ignoring limit/offset.
    pub async fn count(&self, filter: &ExchangeFilter) -> anyhow::Result<u64> {
        let (clause, params) = build_where_clause(filter);
        let db = Arc::clone(&self.db);
        let count = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let guard = db.lock().expect("db mutex poisoned");
            let sql = format!("SELECT COUNT(*) FROM exchanges {clause}");
            let count: i64 = guard.query_row(
                &sql,
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await??;
        Ok(count)
    }

    pub async fn distinct_hosts(&self) -> anyhow::Result<Vec<String>> {
        self.distinct_column("host", false).await
    }

    pub async fn distinct_methods(&self) -> anyhow::Result<Vec<String>> {
        self.distinct_column("method", false).await
    }

    pub async fn distinct_content_types(&self) -> anyhow::Result<Vec<String>> {
        self.distinct_column("content_type", true).await
    }

    async fn distinct_column(&self, column: &str, nullable: bool) -> anyhow::Result<Vec<String>> {
        let db = Arc::clone(&self.db);
        let sql = if nullable {
            format!(
                "SELECT DISTINCT {column} FROM exchanges WHERE {column} IS NOT NULL ORDER BY {column} ASC"
            )
        } else {
            format!("SELECT DISTINCT {column} FROM exchanges ORDER BY {column} ASC")
        };
        let values = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let guard = db.lock().expect("db mutex poisoned");
            let mut stmt = guard.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get(0)?);
            }
            Ok(out)
        })
        .await??;
        Ok(values)
    }

    /// Delete a single exchange. Returns whether a row was removed.
    pub async fn delete(&self, id: i64) -> anyhow::Result<bool> {
        let db = Arc::clone(&self.db);
        let removed = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let guard = db.lock().expect("db mutex poisoned");
            let count = guard.execute("DELETE FROM exchanges WHERE id = ?1", params![id])?;
            Ok(count > 0)
        })
        .await??;
        Ok(removed)
    }

    /// Delete every exchange and reclaim file space.
    pub async fn clear_all(&self) -> anyhow::Result<u64> {
        let db = Arc::clone(&self.db);
        let deleted = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let guard = db.lock().expect("db mutex poisoned");
            let count = guard.execute("DELETE FROM exchanges", [])?;
            guard.execute_batch("VACUUM")?;
            Ok(count as u64)
        })
        .await??;

        tracing::info!("Cleared {} exchanges from the archive", deleted);
        Ok(deleted)
    }

    /// Delete exchanges whose timestamp is older than `now - age_ms`.
    pub async fn sweep_older_than(&self, age_ms: i64) -> anyhow::Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - age_ms;
        let db = Arc::clone(&self.db);
        let removed = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let guard = db.lock().expect("db mutex poisoned");
            let count = guard.execute("DELETE FROM exchanges WHERE ts < ?1", params![cutoff])?;
            if count > 0 {
                guard.execute_batch("VACUUM")?;
            }
            Ok(count as u64)
        })
        .await??;

        if removed > 0 {
            tracing::info!("Swept {} exchanges older than {}ms", removed, age_ms);
        }
        Ok(removed)
    }

    pub async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        let value = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
            let guard = db.lock().expect("db mutex poisoned");
            let mut stmt = guard.prepare("SELECT value FROM settings WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            if let Some(row) = rows.next()? {
                Ok(Some(row.get(0)?))
            } else {
                Ok(None)
            }
        })
        .await??;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let guard = db.lock().expect("db mutex poisoned");
            guard.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn build_where_clause(filter: &ExchangeFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if let Some(text) = filter.text.as_deref().filter(|t| !t.is_empty()) {
        let needle = format!("%{}%", text.to_lowercase());
        clauses.push(
            "(LOWER(url) LIKE ? OR LOWER(host) LIKE ? OR LOWER(path) LIKE ?)".to_string(),
        );
        params.push(Value::from(needle.clone()));
        params.push(Value::from(needle.clone()));
        params.push(Value::from(needle));
    }
    if !filter.methods.is_empty() {
        let marks = vec!["?"; filter.methods.len()].join(", ");
        clauses.push(format!("method IN ({marks})"));
        for method in &filter.methods {
            params.push(Value::from(method.clone()));
        }
    }
    if !filter.status_buckets.is_empty() {
        let ranges = filter
            .status_buckets
            .iter()
            .map(|bucket| {
                let (lo, hi) = bucket.range();
                format!("status BETWEEN {lo} AND {hi}")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        clauses.push(format!("({ranges})"));
    }
    if !filter.hosts.is_empty() {
        let marks = vec!["?"; filter.hosts.len()].join(", ");
        clauses.push(format!("host IN ({marks})"));
        for host in &filter.hosts {
            params.push(Value::from(host.clone()));
        }
    }
    if !filter.content_types.is_empty() {
        let likes = vec!["content_type LIKE ?"; filter.content_types.len()].join(" OR ");
        clauses.push(format!("({likes})"));
        for fragment in &filter.content_types {
            params.push(Value::from(format!("%{}%", fragment.to_lowercase())));
        }
    }
    if let Some(from) = filter.from_ms {
        clauses.push("ts >= ?".to_string());
        params.push(Value::from(from));
    }
    if let Some(to) = filter.to_ms {
        clauses.push("ts <= ?".to_string());
        params.push(Value::from(to));
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (clause, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatusBucket;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn open_exchange(method: &str, host: &str, path: &str, ts: i64) -> OpenExchange {
        let mut headers = HashMap::new();
        headers.insert("Host".to_string(), host.to_string());
        OpenExchange {
            timestamp_ms: ts,
            method: method.to_string(),
            url: format!("http://{host}{path}"),
            host: host.to_string(),
            path: path.to_string(),
            request_headers: headers,
            request_body: None,
            request_truncated: false,
        }
    }

    fn completion(status: u16, body: &[u8], content_type: &str) -> ExchangeCompletion {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        ExchangeCompletion {
            status,
            response_headers: Some(headers),
            response_body: Some(body.to_vec()),
            content_type: Some(content_type.to_lowercase()),
            duration_ms: 5,
            size_bytes: body.len() as u64,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_open_roundtrips_request_fields() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();

        let mut open = open_exchange("POST", "api.example.test", "/v1/items?page=2", 1_700_000_000_000);
        open.request_body = Some(vec![0, 159, 146, 150]); // not UTF-8 on purpose
        let id = store.insert_open(open.clone()).await.unwrap();
        assert!(id > 0);

        let fetched = store.get_by_id(id).await.unwrap().expect("row exists");
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.status, 0);
        assert_eq!(fetched.method, "POST");
        assert_eq!(fetched.host, "api.example.test");
        assert_eq!(fetched.path, "/v1/items?page=2");
        assert_eq!(fetched.request_body, open.request_body);
        assert_eq!(fetched.request_headers, open.request_headers);
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        let mut last = 0;
        for i in 0..5 {
            let id = store
                .insert_open(open_exchange("GET", "a.test", "/", 1000 + i))
                .await
                .unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn complete_is_exactly_once() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        let id = store
            .insert_open(open_exchange("GET", "a.test", "/", 1000))
            .await
            .unwrap();

        store
            .complete(id, completion(200, b"hello", "text/plain"))
            .await
            .unwrap();
        // Second completion must not overwrite the first.
        store
            .complete(id, completion(500, b"late", "text/html"))
            .await
            .unwrap();

        let fetched = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.response_body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(fetched.content_type.as_deref(), Some("text/plain"));
        assert_eq!(fetched.size_bytes, 5);

        // Completing an unknown id is a no-op, not an error.
        store
            .complete(id + 100, completion(200, b"", "text/plain"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn query_filters_by_method() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        for (method, ts) in [("GET", 1000), ("POST", 2000), ("GET", 3000)] {
            store
                .insert_open(open_exchange(method, "a.test", "/", ts))
                .await
                .unwrap();
        }

        let filter = ExchangeFilter {
            methods: vec!["POST".to_string()],
            ..Default::default()
        };
        let rows = store.query(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].method, "POST");
        assert_eq!(store.count(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_paginates() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        for ts in [1000, 2000, 3000, 4000] {
            store
                .insert_open(open_exchange("GET", "a.test", "/", ts))
                .await
                .unwrap();
        }

        let page = store
            .query(&ExchangeFilter {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].timestamp_ms, 3000);
        assert_eq!(page[1].timestamp_ms, 2000);
    }

    #[tokio::test]
    async fn query_is_pure() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        for ts in [1000, 2000] {
            let id = store
                .insert_open(open_exchange("GET", "a.test", "/p", ts))
                .await
                .unwrap();
            store
                .complete(id, completion(200, b"x", "text/plain"))
                .await
                .unwrap();
        }
        let filter = ExchangeFilter::default();
        let first = store.query(&filter).await.unwrap();
        let second = store.query(&filter).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn text_search_is_case_insensitive_over_url_host_path() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        store
            .insert_open(open_exchange("GET", "CDN.Example.test", "/Assets/app.js", 1000))
            .await
            .unwrap();
        store
            .insert_open(open_exchange("GET", "api.other.test", "/login", 2000))
            .await
            .unwrap();

        let rows = store
            .query(&ExchangeFilter {
                text: Some("assets".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host, "CDN.Example.test");
    }

    #[tokio::test]
    async fn status_buckets_and_content_types_filter() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        let cases = [
            (200, "application/json; charset=utf-8"),
            (404, "text/html"),
            (502, "text/plain"),
        ];
        for (i, (status, ct)) in cases.iter().enumerate() {
            let id = store
                .insert_open(open_exchange("GET", "a.test", "/", 1000 + i as i64))
                .await
                .unwrap();
            store.complete(id, completion(*status, b"b", ct)).await.unwrap();
        }

        let errors = store
            .query(&ExchangeFilter {
                status_buckets: vec![StatusBucket::ClientError, StatusBucket::ServerError],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);

        let json = store
            .query(&ExchangeFilter {
                content_types: vec!["json".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(json.len(), 1);
        assert_eq!(json[0].status, 200);
    }

    #[tokio::test]
    async fn time_range_and_host_filters_are_conjunctive() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        store
            .insert_open(open_exchange("GET", "a.test", "/", 1000))
            .await
            .unwrap();
        store
            .insert_open(open_exchange("GET", "b.test", "/", 2000))
            .await
            .unwrap();
        store
            .insert_open(open_exchange("GET", "a.test", "/", 3000))
            .await
            .unwrap();

        let rows = store
            .query(&ExchangeFilter {
                hosts: vec!["a.test".to_string()],
                from_ms: Some(1500),
                to_ms: Some(3500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_ms, 3000);
    }

    #[tokio::test]
    async fn distinct_lists_are_sorted() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        for (method, host, ct) in [
            ("POST", "zeta.test", "text/plain"),
            ("GET", "alpha.test", "application/json"),
            ("GET", "zeta.test", "application/json"),
        ] {
            let id = store
                .insert_open(open_exchange(method, host, "/", 1000))
                .await
                .unwrap();
            store.complete(id, completion(200, b"x", ct)).await.unwrap();
        }

        assert_eq!(
            store.distinct_hosts().await.unwrap(),
            vec!["alpha.test", "zeta.test"]
        );
        assert_eq!(store.distinct_methods().await.unwrap(), vec!["GET", "POST"]);
        assert_eq!(
            store.distinct_content_types().await.unwrap(),
            vec!["application/json", "text/plain"]
        );
    }

    #[tokio::test]
    async fn delete_and_clear_all() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        let id = store
            .insert_open(open_exchange("GET", "a.test", "/", 1000))
            .await
            .unwrap();
        store
            .insert_open(open_exchange("GET", "b.test", "/", 2000))
            .await
            .unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert_eq!(store.clear_all().await.unwrap(), 1);
        assert_eq!(store.count(&ExchangeFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_rows_past_the_horizon() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        let now = Utc::now().timestamp_millis();
        store
            .insert_open(open_exchange("GET", "old.test", "/", now - 2 * 3_600_000))
            .await
            .unwrap();
        store
            .insert_open(open_exchange("GET", "new.test", "/", now - 30 * 60_000))
            .await
            .unwrap();

        let removed = store.sweep_older_than(3_600_000).await.unwrap();
        assert_eq!(removed, 1);
        let rows = store.query(&ExchangeFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host, "new.test");
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let dir = tempdir().unwrap();
        let store = TrafficStore::open(dir.path()).unwrap();
        assert_eq!(store.get_setting("theme").await.unwrap(), None);
        store.set_setting("theme", "dark").await.unwrap();
        store.set_setting("theme", "light").await.unwrap();
        assert_eq!(
            store.get_setting("theme").await.unwrap().as_deref(),
            Some("light")
        );
    }

    #[tokio::test]
    async fn archive_survives_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let store = TrafficStore::open(dir.path()).unwrap();
            let id = store
                .insert_open(open_exchange("GET", "a.test", "/persist", 1000))
                .await
                .unwrap();
            store
                .complete(id, completion(200, b"kept", "text/plain"))
                .await
                .unwrap();
            id
        };

        let store = TrafficStore::open(dir.path()).unwrap();
        let fetched = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(fetched.path, "/persist");
        assert_eq!(fetched.response_body.as_deref(), Some(&b"kept"[..]));
    }
}
