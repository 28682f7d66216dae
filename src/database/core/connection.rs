//! Database connection management
//!
//! This module provides the SQLite connection wrapper handed out by an
//! [`Engine`](super::Engine) to sessions and callers.

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::OpenFlags;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::{EngineProperties, CONVERT_UNICODE_KEY, DEFAULT_CONVERT_UNICODE};

/// Where a connection's database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Process-private in-memory database shared by all connections opened
    /// under the same name
    Memory { name: String },

    /// Database file on disk
    File(PathBuf),
}

/// Per-connection settings derived from engine properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub convert_unicode: bool,
    pub echo: bool,
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
    pub foreign_keys: bool,
    pub busy_timeout_ms: Option<u64>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            convert_unicode: DEFAULT_CONVERT_UNICODE,
            echo: false,
            journal_mode: None,
            synchronous: None,
            foreign_keys: true,
            busy_timeout_ms: None,
        }
    }
}

impl ConnectionSettings {
    pub fn from_properties(props: &EngineProperties) -> Result<Self> {
        let defaults = Self::default();
        let busy_timeout_ms = match props.get_i64("busy_timeout_ms")? {
            Some(ms) => Some(u64::try_from(ms).map_err(|_| {
                crate::database::DatabaseError::Configuration(format!(
                    "engine property 'busy_timeout_ms' must not be negative, found {}",
                    ms
                ))
            })?),
            None => None,
        };

        Ok(Self {
            convert_unicode: props
                .get_bool(CONVERT_UNICODE_KEY)?
                .unwrap_or(defaults.convert_unicode),
            echo: props.get_bool("echo")?.unwrap_or(defaults.echo),
            journal_mode: props.get_str("journal_mode")?.map(str::to_string),
            synchronous: props.get_str("synchronous")?.map(str::to_string),
            foreign_keys: props
                .get_bool("foreign_keys")?
                .unwrap_or(defaults.foreign_keys),
            busy_timeout_ms,
        })
    }
}

/// A single result row, keyed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Result<i64> {
        match self.get(column) {
            Some(Value::Integer(i)) => Ok(*i),
            other => Err(anyhow!("Column '{}' is not an integer: {:?}", column, other)),
        }
    }

    pub fn get_f64(&self, column: &str) -> Result<f64> {
        match self.get(column) {
            Some(Value::Real(f)) => Ok(*f),
            Some(Value::Integer(i)) => Ok(*i as f64),
            other => Err(anyhow!("Column '{}' is not a number: {:?}", column, other)),
        }
    }

    pub fn get_string(&self, column: &str) -> Result<String> {
        match self.get(column) {
            Some(Value::Text(s)) => Ok(s.clone()),
            other => Err(anyhow!("Column '{}' is not text: {:?}", column, other)),
        }
    }

    pub fn get_opt_string(&self, column: &str) -> Result<Option<String>> {
        match self.get(column) {
            Some(Value::Null) => Ok(None),
            _ => self.get_string(column).map(Some),
        }
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }
}

/// SQLite connection owned by an engine
///
/// `Connection` wraps a `rusqlite::Connection`, configures it from the
/// engine's settings and tags it with the engine it belongs to.
pub struct Connection {
    pub conn: rusqlite::Connection,
    engine_id: u64,
    settings: ConnectionSettings,
}

impl Connection {
    /// Open a connection to `location` configured with `settings`
    pub fn open(location: &Location, settings: &ConnectionSettings, engine_id: u64) -> Result<Self> {
        let conn = match location {
            Location::Memory { name } => {
                let uri = format!("file:{}?mode=memory&cache=shared", name);
                rusqlite::Connection::open_with_flags(
                    &uri,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .with_context(|| format!("Failed to open in-memory database '{}'", name))?
            }
            Location::File(path) => rusqlite::Connection::open(path).with_context(|| {
                format!("Failed to open database at '{}'", path.display())
            })?,
        };

        let connection = Connection {
            conn,
            engine_id,
            settings: settings.clone(),
        };
        connection.configure(location)?;
        Ok(connection)
    }

    /// Configure the connection from its settings
    fn configure(&self, location: &Location) -> Result<()> {
        // File databases default to WAL with NORMAL sync; memory databases
        // have no journal to tune.
        let (journal_mode, synchronous) = match location {
            Location::File(_) => (
                Some(self.settings.journal_mode.as_deref().unwrap_or("WAL")),
                Some(self.settings.synchronous.as_deref().unwrap_or("NORMAL")),
            ),
            Location::Memory { .. } => (None, self.settings.synchronous.as_deref()),
        };

        if let Some(mode) = journal_mode {
            let _: String = self
                .conn
                .query_row(&format!("PRAGMA journal_mode={}", mode), [], |row| row.get(0))
                .context("Failed to set journal mode")?;
        }

        if let Some(sync) = synchronous {
            self.conn
                .execute_batch(&format!("PRAGMA synchronous={}", sync))
                .context("Failed to set synchronous mode")?;
        }

        let foreign_keys = if self.settings.foreign_keys { "ON" } else { "OFF" };
        self.conn
            .execute_batch(&format!("PRAGMA foreign_keys={}", foreign_keys))
            .context("Failed to configure foreign keys")?;

        if let Some(ms) = self.settings.busy_timeout_ms {
            self.conn
                .busy_timeout(Duration::from_millis(ms))
                .context("Failed to set busy timeout")?;
        }

        Ok(())
    }

    /// Id of the engine this connection belongs to
    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn echo(&self, sql: &str) {
        if self.settings.echo {
            debug!(target: "lead::sql", engine = self.engine_id, "{}", sql.trim());
        }
    }

    /// Execute a SQL statement
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.echo(sql);
        self.conn
            .execute(sql, [])
            .with_context(|| format!("Failed to execute SQL: {}", sql.trim()))
    }

    /// Execute one or more statements without parameters
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.echo(sql);
        self.conn
            .execute_batch(sql)
            .with_context(|| format!("Failed to execute SQL batch: {}", sql.trim()))
    }

    /// Execute a SQL statement with parameters
    pub fn execute_with_params<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.echo(sql);
        self.conn
            .execute(sql, params)
            .with_context(|| format!("Failed to execute SQL with params: {}", sql.trim()))
    }

    /// Run a query and collect every row
    pub fn query_rows<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Row>> {
        self.echo(sql);
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare query: {}", sql.trim()))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt.query(params).context("Failed to run query")?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            let mut values = BTreeMap::new();
            for (idx, name) in names.iter().enumerate() {
                let value = self.decode(name, row.get_ref(idx)?)?;
                values.insert(name.clone(), value);
            }
            result.push(Row { values });
        }
        Ok(result)
    }

    fn decode(&self, column: &str, value: ValueRef<'_>) -> Result<Value> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => {
                if self.settings.convert_unicode {
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                } else {
                    Value::Text(
                        String::from_utf8(bytes.to_vec())
                            .with_context(|| format!("Invalid UTF-8 in column '{}'", column))?,
                    )
                }
            }
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        })
    }

    /// Whether a transaction is currently open on this connection
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn begin(&self) -> Result<()> {
        self.echo("BEGIN");
        self.conn
            .execute_batch("BEGIN")
            .context("Failed to begin transaction")
    }

    pub fn commit(&self) -> Result<()> {
        self.echo("COMMIT");
        self.conn
            .execute_batch("COMMIT")
            .context("Failed to commit transaction")
    }

    pub fn rollback(&self) -> Result<()> {
        self.echo("ROLLBACK");
        self.conn
            .execute_batch("ROLLBACK")
            .context("Failed to roll back transaction")
    }

    /// Check if a table exists in the database
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        let count: i32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [table_name],
                |row| row.get(0),
            )
            .context("Failed to check table existence")?;
        Ok(count > 0)
    }

    /// Get the row count for a table
    pub fn table_count(&self, table_name: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table_name));
        self.echo(&query);
        let count: u64 = self
            .conn
            .query_row(&query, [], |row| row.get(0))
            .context("Failed to get table count")?;
        Ok(count)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("engine_id", &self.engine_id)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

/// Quote an SQL identifier
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(name: &str) -> Location {
        Location::Memory {
            name: format!("connection-test-{}-{}", name, std::process::id()),
        }
    }

    fn open(name: &str) -> Connection {
        Connection::open(&memory(name), &ConnectionSettings::default(), 0).unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let db = Connection::open(&memory("open"), &ConnectionSettings::default(), 9);
        assert!(db.is_ok());
        assert_eq!(db.unwrap().engine_id(), 9);
    }

    #[test]
    fn test_execute() {
        let db = open("execute");
        let result = db.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_table_exists() {
        let db = open("exists");
        db.execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY)")
            .unwrap();

        assert!(db.table_exists("test_table").unwrap());
        assert!(!db.table_exists("nonexistent_table").unwrap());
    }

    #[test]
    fn test_table_count() {
        let db = open("count");
        db.execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute("INSERT INTO test_table (id) VALUES (1), (2), (3)")
            .unwrap();

        assert_eq!(db.table_count("test_table").unwrap(), 3);
    }

    #[test]
    fn test_same_memory_name_is_shared() {
        let location = memory("shared");
        let a = Connection::open(&location, &ConnectionSettings::default(), 0).unwrap();
        let b = Connection::open(&location, &ConnectionSettings::default(), 0).unwrap();

        a.execute("CREATE TABLE shared (id INTEGER)").unwrap();
        assert!(b.table_exists("shared").unwrap());
    }

    #[test]
    fn test_transaction_state() {
        let db = open("tx");
        db.execute("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(!db.in_transaction());

        db.begin().unwrap();
        assert!(db.in_transaction());
        db.execute("INSERT INTO t (id) VALUES (1)").unwrap();
        db.rollback().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(db.table_count("t").unwrap(), 0);
    }

    #[test]
    fn test_query_rows() {
        let db = open("rows");
        db.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, note TEXT)")
            .unwrap();
        db.execute_with_params(
            "INSERT INTO items (id, name, note) VALUES (?1, ?2, NULL)",
            rusqlite::params![1, "widget"],
        )
        .unwrap();

        let rows = db.query_rows("SELECT * FROM items", []).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id").unwrap(), 1);
        assert_eq!(rows[0].get_string("name").unwrap(), "widget");
        assert_eq!(rows[0].get_opt_string("note").unwrap(), None);
        assert!(rows[0].get_i64("name").is_err());
    }

    #[test]
    fn test_convert_unicode_controls_decoding() {
        let lossy = open("unicode-lossy");
        lossy.execute("CREATE TABLE t (v TEXT)").unwrap();
        lossy
            .execute("INSERT INTO t (v) VALUES (CAST(X'FF61' AS TEXT))")
            .unwrap();
        let rows = lossy.query_rows("SELECT v FROM t", []).unwrap();
        assert_eq!(rows[0].get_string("v").unwrap(), "\u{FFFD}a");

        let strict_settings = ConnectionSettings {
            convert_unicode: false,
            ..ConnectionSettings::default()
        };
        let strict = Connection::open(&memory("unicode-strict"), &strict_settings, 0).unwrap();
        strict.execute("CREATE TABLE t (v TEXT)").unwrap();
        strict
            .execute("INSERT INTO t (v) VALUES (CAST(X'FF61' AS TEXT))")
            .unwrap();
        assert!(strict.query_rows("SELECT v FROM t", []).is_err());
    }

    #[test]
    fn test_settings_from_properties() {
        let props = EngineProperties::new()
            .with(CONVERT_UNICODE_KEY, false)
            .with("echo", true)
            .with("busy_timeout_ms", 100)
            .with("journal_mode", "DELETE");
        let settings = ConnectionSettings::from_properties(&props).unwrap();
        assert!(!settings.convert_unicode);
        assert!(settings.echo);
        assert!(settings.foreign_keys);
        assert_eq!(settings.busy_timeout_ms, Some(100));
        assert_eq!(settings.journal_mode.as_deref(), Some("DELETE"));

        let negative = EngineProperties::new().with("busy_timeout_ms", -1);
        assert!(ConnectionSettings::from_properties(&negative).is_err());
    }
}
