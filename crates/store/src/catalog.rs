//! Embedded table store.
//!
//! Each lakehouse table is a SQLite table named by its fully qualified dotted
//! name (`lakehouse.options.silver_ticks`). Writes are grouped into a single
//! transaction per stage so a failed stage leaves every table untouched.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tickhouse_core::{Error, Result, RetryPolicy, TimeRange};
use tracing::{debug, info};

/// Lock wait before SQLite reports `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a SQLite error onto the pipeline error type.
///
/// Busy and locked databases are transient; everything else is not.
pub fn sql_error(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Error::transient(err.to_string())
        }
        _ => Error::database(err.to_string()),
    }
}

fn is_already_exists(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("already exists"))
}

/// Quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

/// Column layout of one table plus the event-time column used for ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub columns: Vec<(String, ColumnType)>,
    pub time_column: String,
}

impl TableSchema {
    pub fn new(time_column: &str, columns: &[(&str, ColumnType)]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
            time_column: time_column.to_string(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, ty: ColumnType) {
        self.columns.push((name.into(), ty));
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    fn time_index(&self) -> Result<usize> {
        self.column_names()
            .position(|c| c == self.time_column)
            .ok_or_else(|| Error::config(format!("time column `{}` not in schema", self.time_column)))
    }
}

/// How a write replaces existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Strict append.
    Append,
    /// Delete rows whose time column falls in the range, then insert.
    /// Rows outside the range are not written.
    OverwriteRange(TimeRange),
    /// Replace the whole table.
    OverwriteAll,
}

/// Rows destined for one table.
#[derive(Debug, Clone)]
pub struct TableWrite {
    pub table: String,
    pub schema: TableSchema,
    pub mode: WriteMode,
    pub rows: Vec<Vec<Value>>,
}

impl TableWrite {
    pub fn new(table: impl Into<String>, schema: TableSchema, mode: WriteMode, rows: Vec<Vec<Value>>) -> Self {
        Self {
            table: table.into(),
            schema,
            mode,
            rows,
        }
    }
}

/// `WHERE` fragment and parameters selecting `range` on `column`.
fn range_clause(column: &str, range: &TimeRange) -> (String, Vec<Value>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    if let Some(start) = range.start {
        conditions.push(format!("{} >= ?", quote_ident(column)));
        params.push(Value::Integer(start));
    }
    if let Some(end) = range.end {
        conditions.push(format!("{} < ?", quote_ident(column)));
        params.push(Value::Integer(end));
    }
    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), params)
    }
}

/// Connection to the lakehouse catalog.
pub struct Catalog {
    conn: Connection,
    retry: RetryPolicy,
}

impl Catalog {
    /// Open (or create) an on-disk catalog.
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_error)?;
        Self::init(conn, retry)
    }

    pub fn open_in_memory(retry: RetryPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        Self::init(conn, retry)
    }

    fn init(conn: Connection, retry: RetryPolicy) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(sql_error)?;
        Ok(Self { conn, retry })
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists_in(&self.conn, table)
    }

    /// Column names of an existing table, in declaration order.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        table_columns_in(&self.conn, table)
    }

    /// Create `table` if missing, otherwise check it carries every column of
    /// `schema`.
    pub fn ensure_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        self.retry
            .retry(&format!("ensure {table}"), |_| ensure_table_in(&self.conn, table, schema))
    }

    fn check_columns(&self, table: &str, schema: &TableSchema) -> Result<()> {
        check_columns_in(&self.conn, table, schema)
    }

    /// Apply all writes in one transaction. Returns rows written per write.
    ///
    /// Missing tables are created inside the same transaction, so a failed
    /// commit leaves no new table behind.
    pub fn commit(&mut self, writes: &[TableWrite]) -> Result<Vec<usize>> {
        let policy = self.retry.clone();
        let conn = &mut self.conn;
        policy.retry("commit", |_| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;
            let mut counts = Vec::with_capacity(writes.len());
            for write in writes {
                ensure_table_in(&tx, &write.table, &write.schema)?;
                counts.push(apply_write(&tx, write)?);
            }
            tx.commit().map_err(sql_error)?;
            Ok(counts)
        })
    }

    /// Strict append to one table.
    pub fn append(&mut self, table: &str, schema: &TableSchema, rows: Vec<Vec<Value>>) -> Result<usize> {
        let counts = self.commit(&[TableWrite::new(table, schema.clone(), WriteMode::Append, rows)])?;
        Ok(counts.iter().sum())
    }

    /// Replace the rows of `range` in one table.
    pub fn overwrite_range(
        &mut self,
        table: &str,
        schema: &TableSchema,
        range: TimeRange,
        rows: Vec<Vec<Value>>,
    ) -> Result<usize> {
        let counts = self.commit(&[TableWrite::new(
            table,
            schema.clone(),
            WriteMode::OverwriteRange(range),
            rows,
        )])?;
        Ok(counts.iter().sum())
    }

    /// Replace the whole table.
    pub fn overwrite_all(&mut self, table: &str, schema: &TableSchema, rows: Vec<Vec<Value>>) -> Result<usize> {
        let counts = self.commit(&[TableWrite::new(table, schema.clone(), WriteMode::OverwriteAll, rows)])?;
        Ok(counts.iter().sum())
    }

    /// Read the `schema` columns of `table` for rows in `range`.
    ///
    /// A missing table reads as empty. `order_by` entries are trusted SQL
    /// expressions such as column names or `rowid`.
    pub fn query<T, F>(
        &self,
        table: &str,
        schema: &TableSchema,
        range: &TimeRange,
        order_by: &[&str],
        mut map: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        if !self.table_exists(table)? {
            debug!(%table, "table missing, reading nothing");
            return Ok(Vec::new());
        }
        self.check_columns(table, schema)?;

        let columns: Vec<String> = schema.column_names().map(quote_ident).collect();
        let (filter, params) = range_clause(&schema.time_column, range);
        let order = if order_by.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", order_by.join(", "))
        };
        let sql = format!(
            "SELECT {} FROM {}{filter}{order}",
            columns.join(", "),
            quote_ident(table)
        );

        self.retry.retry(&format!("read {table}"), |_| {
            let mut stmt = self.conn.prepare(&sql).map_err(sql_error)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), &mut map)
                .map_err(sql_error)?
                .collect::<rusqlite::Result<Vec<T>>>()
                .map_err(sql_error)?;
            Ok(rows)
        })
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| {
                row.get(0)
            })
            .map_err(sql_error)?;
        Ok(count as u64)
    }
}

fn table_exists_in(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .map_err(sql_error)?;
    Ok(count > 0)
}

fn table_columns_in(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(sql_error)?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(sql_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error)?;
    Ok(names)
}

fn check_columns_in(conn: &Connection, table: &str, schema: &TableSchema) -> Result<()> {
    let existing = table_columns_in(conn, table)?;
    match schema.column_names().find(|c| !existing.iter().any(|e| e == c)) {
        Some(missing) => Err(Error::schema_mismatch(table, missing)),
        None => Ok(()),
    }
}

fn create_table(conn: &Connection, table: &str, schema: &TableSchema) -> rusqlite::Result<()> {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE {t} ({cols});
         CREATE INDEX IF NOT EXISTS {idx} ON {t} ({time});",
        t = quote_ident(table),
        cols = columns.join(", "),
        idx = quote_ident(&format!("{table}__{}", schema.time_column)),
        time = quote_ident(&schema.time_column),
    ))
}

/// Create `table` on `conn` or check the existing one against `schema`.
fn ensure_table_in(conn: &Connection, table: &str, schema: &TableSchema) -> Result<()> {
    if table_exists_in(conn, table)? {
        return check_columns_in(conn, table, schema);
    }
    match create_table(conn, table, schema) {
        Ok(()) => {
            info!(%table, "created table");
            Ok(())
        }
        // another writer won the race
        Err(e) if is_already_exists(&e) => {
            if table_exists_in(conn, table)? {
                check_columns_in(conn, table, schema)
            } else {
                Err(Error::transient(format!("{table}: {e}")))
            }
        }
        Err(e) => Err(sql_error(e)),
    }
}

fn apply_write(tx: &rusqlite::Transaction<'_>, write: &TableWrite) -> Result<usize> {
    let table = quote_ident(&write.table);
    let time_idx = write.schema.time_index()?;

    let range = match write.mode {
        WriteMode::Append => None,
        WriteMode::OverwriteAll => {
            tx.execute(&format!("DELETE FROM {table}"), []).map_err(sql_error)?;
            None
        }
        WriteMode::OverwriteRange(range) => {
            let (filter, params) = range_clause(&write.schema.time_column, &range);
            let deleted = tx
                .execute(&format!("DELETE FROM {table}{filter}"), params_from_iter(params.iter()))
                .map_err(sql_error)?;
            debug!(table = %write.table, %range, deleted, "cleared range");
            Some(range)
        }
    };
    let in_range = |row: &[Value]| match (range, row.get(time_idx)) {
        (None, _) => true,
        (Some(r), Some(Value::Integer(ts))) => r.contains(*ts),
        _ => false,
    };

    let columns: Vec<String> = write.schema.column_names().map(quote_ident).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut stmt = tx
        .prepare(&format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        ))
        .map_err(sql_error)?;

    let mut written = 0;
    for row in &write.rows {
        if !in_range(row.as_slice()) {
            continue;
        }
        if row.len() != columns.len() {
            return Err(Error::Other(format!(
                "{}: row has {} values for {} columns",
                write.table,
                row.len(),
                columns.len()
            )));
        }
        stmt.execute(params_from_iter(row.iter())).map_err(sql_error)?;
        written += 1;
    }
    debug!(table = %write.table, rows = written, "wrote rows");
    Ok(written)
}
