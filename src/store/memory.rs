//! In-process store backend.
//!
//! Understands the statements this crate emits (DDL from [`TableSchema`],
//! multi-row inserts, `SELECT 1`, the column catalog query, `count(*)` and
//! `VACUUM TABLE`). Useful for dry runs and for exercising the pool and retry
//! paths: failures can be injected per statement kind.
//!
//! [`TableSchema`]: crate::schema::TableSchema

use super::connection::{Connector, QueryResult, StoreConnection};
use crate::schema::SqlValue;
use crate::utils::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct MemTable {
    /// (name, type, nullable)
    columns: Vec<(String, String, bool)>,
    rows: Vec<Vec<SqlValue>>,
}

/// Statements kept in the log; older ones are dropped first.
const STATEMENT_LOG_CAP: usize = 512;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemTable>,
    fail_connects: u32,
    fail_pings: u32,
    fail_inserts: u32,
    inserts_before_failure: u32,
    fail_queries: u32,
    fail_rollbacks: u32,
    connects: u64,
    commits: u64,
    rollbacks: u64,
    statements: VecDeque<String>,
}

/// Shared in-memory database; every connection it opens sees the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connection attempts fail.
    pub async fn fail_connects(&self, n: u32) {
        self.state.lock().await.fail_connects = n;
    }

    /// The next `n` liveness probes fail and close their connection.
    pub async fn fail_pings(&self, n: u32) {
        self.state.lock().await.fail_pings = n;
    }

    /// The next `n` insert statements fail.
    pub async fn fail_inserts(&self, n: u32) {
        self.fail_inserts_after(0, n).await;
    }

    /// Let `ok` inserts through, then fail the `n` after them.
    pub async fn fail_inserts_after(&self, ok: u32, n: u32) {
        let mut state = self.state.lock().await;
        state.inserts_before_failure = ok;
        state.fail_inserts = n;
    }

    /// The next `n` non-insert, non-ping statements fail.
    pub async fn fail_queries(&self, n: u32) {
        self.state.lock().await.fail_queries = n;
    }

    /// The next `n` rollbacks fail after discarding pending rows.
    pub async fn fail_rollbacks(&self, n: u32) {
        self.state.lock().await.fail_rollbacks = n;
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.state.lock().await.tables.keys().cloned().collect()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.state.lock().await.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub async fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn connects(&self) -> u64 {
        self.state.lock().await.connects
    }

    pub async fn commits(&self) -> u64 {
        self.state.lock().await.commits
    }

    pub async fn rollbacks(&self) -> u64 {
        self.state.lock().await.rollbacks
    }

    /// The most recent statements received, oldest first.
    pub async fn statements(&self) -> Vec<String> {
        self.state.lock().await.statements.iter().cloned().collect()
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(StoreError::Connection("injected connect failure".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            in_tx: false,
            pending: Vec::new(),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    in_tx: bool,
    pending: Vec<(String, Vec<Vec<SqlValue>>)>,
    closed: bool,
}

enum Statement {
    Ping,
    Create { table: String, columns: Vec<(String, String, bool)> },
    Insert { table: String, rows: Vec<Vec<SqlValue>> },
    Catalog,
    Count { table: String },
    Vacuum { table: String },
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Connection("connection is closed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn run(&mut self, sql: &str, params: &[SqlValue]) -> Result<(u64, QueryResult), StoreError> {
        self.ensure_open()?;
        let sql = bind(sql, params);
        let stmt = parse(&sql)?;
        let mut state = self.state.lock().await;
        if state.statements.len() == STATEMENT_LOG_CAP {
            state.statements.pop_front();
        }
        state.statements.push_back(sql.clone());

        match stmt {
            | Statement::Ping => {
                if state.fail_pings > 0 {
                    state.fail_pings -= 1;
                    self.closed = true;
                    return Err(StoreError::Connection("injected ping failure".to_string()));
                }
                Ok((0, single(SqlValue::Long(1))))
            }
            | Statement::Insert { table, rows } => {
                if state.fail_inserts > 0 {
                    if state.inserts_before_failure > 0 {
                        state.inserts_before_failure -= 1;
                    } else {
                        state.fail_inserts -= 1;
                        return Err(StoreError::Query("injected insert failure".to_string()));
                    }
                }
                if !state.tables.contains_key(&table) {
                    return Err(StoreError::Query(format!("table does not exist [table={table}]")));
                }
                let n = rows.len() as u64;
                if self.in_tx {
                    self.pending.push((table, rows));
                } else if let Some(t) = state.tables.get_mut(&table) {
                    t.rows.extend(rows);
                }
                Ok((n, QueryResult::default()))
            }
            | other => {
                if state.fail_queries > 0 {
                    state.fail_queries -= 1;
                    return Err(StoreError::Query("injected query failure".to_string()));
                }
                match other {
                    | Statement::Create { table, columns } => {
                        state.tables.entry(table).or_insert(MemTable { columns, rows: Vec::new() });
                        Ok((0, QueryResult::default()))
                    }
                    | Statement::Catalog => {
                        let rows = state
                            .tables
                            .iter()
                            .flat_map(|(name, t)| {
                                t.columns.iter().map(move |(col, ty, nullable)| {
                                    vec![
                                        SqlValue::Text(name.clone()),
                                        SqlValue::Text(col.clone()),
                                        SqlValue::Text(ty.to_ascii_lowercase()),
                                        SqlValue::Text(if *nullable { "YES" } else { "NO" }.to_string()),
                                    ]
                                })
                            })
                            .collect();
                        let columns = ["table_name", "column_name", "data_type", "is_nullable"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect();
                        Ok((0, QueryResult { columns, rows }))
                    }
                    | Statement::Count { table } => {
                        let t = state
                            .tables
                            .get(&table)
                            .ok_or_else(|| StoreError::Query(format!("table does not exist [table={table}]")))?;
                        Ok((0, single(SqlValue::Long(t.rows.len() as i64))))
                    }
                    | Statement::Vacuum { table } => {
                        if state.tables.contains_key(&table) {
                            Ok((0, QueryResult::default()))
                        } else {
                            Err(StoreError::Query(format!("table does not exist [table={table}]")))
                        }
                    }
                    | Statement::Ping | Statement::Insert { .. } => Ok((0, QueryResult::default())),
                }
            }
        }
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.run(sql, params).await.map(|(n, _)| n)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, StoreError> {
        self.run(sql, params).await.map(|(_, rows)| rows)
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.in_tx = true;
        self.pending.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        for (table, rows) in self.pending.drain(..) {
            if let Some(t) = state.tables.get_mut(&table) {
                t.rows.extend(rows);
            }
        }
        state.commits += 1;
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        self.in_tx = false;
        let mut state = self.state.lock().await;
        if state.fail_rollbacks > 0 {
            state.fail_rollbacks -= 1;
            return Err(StoreError::Query("injected rollback failure".to_string()));
        }
        state.rollbacks += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn single(value: SqlValue) -> QueryResult {
    QueryResult { columns: vec!["value".to_string()], rows: vec![vec![value]] }
}

/// Substitute `$n` placeholders with literals, highest index first so `$1`
/// never clobbers `$10`.
fn bind(sql: &str, params: &[SqlValue]) -> String {
    let mut out = sql.to_string();
    for (i, p) in params.iter().enumerate().rev() {
        out = out.replace(&format!("${}", i + 1), &p.to_literal());
    }
    out
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn table_token(s: &str) -> String {
    s.trim().trim_end_matches(';').trim().to_string()
}

fn parse(sql: &str) -> Result<Statement, StoreError> {
    let s = sql.trim();
    let unsupported = || StoreError::Query(format!("unsupported statement: {s}"));

    if s.eq_ignore_ascii_case("SELECT 1") || s.eq_ignore_ascii_case("SELECT 1;") {
        return Ok(Statement::Ping);
    }
    if s.to_ascii_lowercase().contains("information_schema.columns") {
        return Ok(Statement::Catalog);
    }
    if let Some(rest) = strip_prefix_ci(s, "SELECT count(*) FROM ") {
        return Ok(Statement::Count { table: table_token(rest) });
    }
    if let Some(rest) = strip_prefix_ci(s, "VACUUM TABLE ") {
        return Ok(Statement::Vacuum { table: table_token(rest) });
    }
    if let Some(rest) = strip_prefix_ci(s, "CREATE TABLE IF NOT EXISTS ") {
        let open = rest.find('(').ok_or_else(unsupported)?;
        let close = open + rest[open..].find(')').ok_or_else(unsupported)?;
        let table = rest[..open].trim().to_string();
        let columns = rest[open + 1..close]
            .split(',')
            .filter_map(|def| {
                let mut parts = def.split_whitespace();
                let name = parts.next()?.to_string();
                let ty = parts.next()?.to_string();
                Some((name, ty, !def.contains("NOT NULL")))
            })
            .collect();
        return Ok(Statement::Create { table, columns });
    }
    if let Some(rest) = strip_prefix_ci(s, "INSERT INTO ") {
        let open = rest.find('(').ok_or_else(unsupported)?;
        let table = rest[..open].trim().to_string();
        let close = open + rest[open..].find(')').ok_or_else(unsupported)?;
        let values = strip_prefix_ci(rest[close + 1..].trim_start(), "VALUES").ok_or_else(unsupported)?;
        let rows = parse_tuples(values)
            .map_err(|e| StoreError::Query(format!("malformed VALUES: {e}")))?;
        return Ok(Statement::Insert { table, rows });
    }
    debug!(sql = %s, "memory backend rejected statement");
    Err(unsupported())
}

fn parse_tuples(s: &str) -> Result<Vec<Vec<SqlValue>>, String> {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut rows = Vec::new();

    loop {
        while i < chars.len() && (chars[i].is_whitespace() || chars[i] == ',' || chars[i] == ';') {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        if chars[i] != '(' {
            return Err(format!("expected '(' at {i}"));
        }
        i += 1;

        let mut row = Vec::new();
        loop {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            match chars.get(i) {
                | Some('\'') => {
                    i += 1;
                    let mut text = String::new();
                    loop {
                        match chars.get(i) {
                            | Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                                text.push('\'');
                                i += 2;
                            }
                            | Some('\'') => {
                                i += 1;
                                break;
                            }
                            | Some(c) => {
                                text.push(*c);
                                i += 1;
                            }
                            | None => return Err("unterminated string".to_string()),
                        }
                    }
                    row.push(SqlValue::Text(text));
                }
                | Some(_) => {
                    let start = i;
                    while i < chars.len() && chars[i] != ',' && chars[i] != ')' {
                        i += 1;
                    }
                    let token: String = chars[start..i].iter().collect();
                    row.push(literal(token.trim()));
                }
                | None => return Err("unterminated tuple".to_string()),
            }
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            match chars.get(i) {
                | Some(',') => i += 1,
                | Some(')') => {
                    i += 1;
                    break;
                }
                | _ => return Err(format!("expected ',' or ')' at {i}")),
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

fn literal(token: &str) -> SqlValue {
    if token.eq_ignore_ascii_case("NULL") {
        SqlValue::Null
    } else if token.eq_ignore_ascii_case("true") {
        SqlValue::Bool(true)
    } else if token.eq_ignore_ascii_case("false") {
        SqlValue::Bool(false)
    } else if let Ok(v) = token.parse::<i64>() {
        SqlValue::Long(v)
    } else if let Ok(v) = token.parse::<f64>() {
        SqlValue::Double(v)
    } else {
        SqlValue::Text(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE: &str = "CREATE TABLE IF NOT EXISTS quotes (\n    timestamp TIMESTAMP NOT NULL,\n    symbol SYMBOL CAPACITY 256 CACHE,\n    price DOUBLE\n) TIMESTAMP(timestamp) PARTITION BY DAY WAL;";

    #[test]
    fn parses_value_tuples() {
        let rows = parse_tuples(" ('a''b', 1, 2.5, NULL, true),\n('x', -3, 0, NULL, false);").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], SqlValue::Text("a'b".into()));
        assert_eq!(rows[0][2], SqlValue::Double(2.5));
        assert_eq!(rows[1][1], SqlValue::Long(-3));
        assert_eq!(rows[1][4], SqlValue::Bool(false));
        assert!(parse_tuples("('open").is_err());
    }

    #[test]
    fn binds_positional_params() {
        let sql = bind("SELECT $1, $10", &(1..=10).map(SqlValue::Long).collect::<Vec<_>>());
        assert_eq!(sql, "SELECT 1, 10");
    }

    #[tokio::test]
    async fn create_insert_count() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        conn.execute(CREATE, &[]).await.unwrap();
        conn.execute(CREATE, &[]).await.unwrap();

        let n = conn
            .execute("INSERT INTO quotes (timestamp, symbol, price) VALUES\n('2024-01-01T00:00:00.000000Z', 'SPY', 1.5);", &[])
            .await
            .unwrap();
        assert_eq!(n, 1);

        let count = conn.query("SELECT count(*) FROM quotes", &[]).await.unwrap();
        assert_eq!(count.scalar(), Some(&SqlValue::Long(1)));

        let catalog = conn
            .query("SELECT table_name, column_name, data_type, is_nullable FROM information_schema.columns", &[])
            .await
            .unwrap();
        assert_eq!(catalog.rows.len(), 3);
        assert_eq!(catalog.rows[0][3], SqlValue::Text("NO".into()));
        assert_eq!(catalog.rows[1][2], SqlValue::Text("symbol".into()));
    }

    #[tokio::test]
    async fn rollback_discards_pending_rows() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        conn.execute(CREATE, &[]).await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO quotes (timestamp, symbol, price) VALUES ('t', 'A', 1);", &[])
            .await
            .unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(backend.row_count("quotes").await, 0);

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO quotes (timestamp, symbol, price) VALUES ('t', 'A', 1);", &[])
            .await
            .unwrap();
        conn.commit().await.unwrap();
        assert_eq!(backend.row_count("quotes").await, 1);
        assert_eq!(backend.rollbacks().await, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_connects(1).await;
        assert!(backend.connect().await.is_err());
        let mut conn = backend.connect().await.unwrap();

        backend.fail_pings(1).await;
        assert!(conn.ping().await.is_err());
        assert!(conn.is_closed());

        let mut conn = backend.connect().await.unwrap();
        assert!(conn.ping().await.is_ok());
        assert!(conn.execute("DROP TABLE x", &[]).await.is_err());
    }

    #[tokio::test]
    async fn statement_log_keeps_only_recent_entries() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        for _ in 0..STATEMENT_LOG_CAP + 20 {
            conn.ping().await.unwrap();
        }
        conn.execute(CREATE, &[]).await.unwrap();

        let log = backend.statements().await;
        assert_eq!(log.len(), STATEMENT_LOG_CAP);
        assert!(log.last().unwrap().starts_with("CREATE TABLE"));
    }
}
