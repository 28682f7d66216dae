//! Engine: connection factory plus per-context transaction state
//!
//! An [`Engine`] is created from a connection URL and a set of
//! [`EngineProperties`]. It is shared by every execution context; the
//! connections it hands out are not. With the `threadlocal` strategy each
//! thread gets one connection that is reused for the lifetime of the engine,
//! and the [`TransactionTracker`] of that thread drives transactions on it.

use anyhow::Result;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionSettings, Location};
use super::context::ContextLocal;
use crate::config::{EngineProperties, DEFAULT_STRATEGY, STRATEGY_KEY};
use crate::database::DatabaseError;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// How connections are handed out to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One connection per thread, reused by every caller on that thread
    ThreadLocal,
    /// A fresh connection for every `contextual_connect` call
    Plain,
}

impl FromStr for Strategy {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threadlocal" => Ok(Strategy::ThreadLocal),
            "plain" => Ok(Strategy::Plain),
            other => Err(DatabaseError::Configuration(format!(
                "unknown engine strategy '{}', expected 'threadlocal' or 'plain'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::ThreadLocal => write!(f, "threadlocal"),
            Strategy::Plain => write!(f, "plain"),
        }
    }
}

/// Parsed connection URL
///
/// Supported forms:
/// - `sqlite://memory`, `sqlite://:memory:`, `sqlite://` for an in-memory database
/// - `sqlite:///absolute/path.db` and `sqlite://relative/path.db` for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineUrl {
    raw: String,
    path: Option<PathBuf>,
}

impl EngineUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            DatabaseError::Configuration(format!("malformed database url '{}'", url))
        })?;

        if !scheme.eq_ignore_ascii_case("sqlite") {
            return Err(DatabaseError::Configuration(format!(
                "unsupported database url scheme '{}' in '{}'",
                scheme, url
            ))
            .into());
        }

        let path = match rest {
            "" | "memory" | ":memory:" => None,
            file => Some(PathBuf::from(file)),
        };

        Ok(Self {
            raw: url.to_string(),
            path,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_memory(&self) -> bool {
        self.path.is_none()
    }

    /// Database file path, `None` for in-memory databases
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

impl std::fmt::Display for EngineUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Handle to a configured database
pub struct Engine {
    id: u64,
    url: EngineUrl,
    properties: EngineProperties,
    strategy: Strategy,
    settings: ConnectionSettings,
    location: Location,
    connections: ContextLocal<Rc<Connection>>,
    // Keeps a shared in-memory database alive while the engine is in use
    anchor: Mutex<Option<rusqlite::Connection>>,
    disposed: AtomicBool,
}

/// Build an engine from a URL and its properties
///
/// The properties are used as given; missing `strategy` falls back to
/// `threadlocal`.
pub fn create_engine(url: &str, properties: &EngineProperties) -> Result<Arc<Engine>> {
    let url = EngineUrl::parse(url)?;
    let strategy = properties
        .get_str(STRATEGY_KEY)?
        .unwrap_or(DEFAULT_STRATEGY)
        .parse::<Strategy>()?;
    let settings = ConnectionSettings::from_properties(properties)?;
    let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);

    let location = match url.path() {
        None => Location::Memory {
            name: format!("lead-memory-{}-{}", std::process::id(), id),
        },
        Some(path) => Location::File(path.clone()),
    };

    let anchor = match &location {
        Location::Memory { .. } => Some(Connection::open(&location, &settings, id)?.conn),
        Location::File(_) => None,
    };

    debug!(engine = id, url = %url, strategy = %strategy, "created engine");

    Ok(Arc::new(Engine {
        id,
        url,
        properties: properties.clone(),
        strategy,
        settings,
        location,
        connections: ContextLocal::new(),
        anchor: Mutex::new(anchor),
        disposed: AtomicBool::new(false),
    }))
}

impl Engine {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &EngineUrl {
        &self.url
    }

    /// Properties the engine was constructed with
    pub fn properties(&self) -> &EngineProperties {
        &self.properties
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Open a new, unshared connection
    pub fn connect(&self) -> Result<Connection> {
        Connection::open(&self.location, &self.settings, self.id)
    }

    /// Connection for the current execution context
    ///
    /// Under `threadlocal` this is the thread's connection, so work done
    /// through it joins the transaction the thread's tracker has begun.
    /// Under `plain` every call opens a new connection.
    pub fn contextual_connect(&self) -> Result<Rc<Connection>> {
        match self.strategy {
            Strategy::ThreadLocal => self.context_connection(),
            Strategy::Plain => Ok(Rc::new(self.connect()?)),
        }
    }

    fn context_connection(&self) -> Result<Rc<Connection>> {
        self.connections.get_or_try_insert_with(|| {
            debug!(engine = self.id, "opening connection for current context");
            Ok(Rc::new(self.connect()?))
        })
    }

    /// Transaction state of the current execution context
    pub fn transaction(&self) -> Result<TransactionTracker> {
        Ok(TransactionTracker {
            engine_id: self.id,
            connection: self.context_connection()?,
        })
    }

    /// Mark the engine as replaced and release the in-memory anchor
    ///
    /// Only the calling thread's connection is released here. Other threads
    /// release theirs with [`Engine::release_context`] the next time they
    /// go through the database manager; sessions bound to a disposed engine
    /// refuse further work in the meantime.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            let anchor = self
                .anchor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(anchor);
            self.release_context();
            debug!(engine = self.id, "disposed engine");
        }
    }

    /// Drop the current thread's connection, rolling back its open transaction
    ///
    /// Returns whether a connection was released. Holders of the old `Rc`
    /// keep a connection object, but it no longer holds any lock.
    pub fn release_context(&self) -> bool {
        let Some(connection) = self.connections.take() else {
            return false;
        };
        if connection.in_transaction() {
            if let Err(e) = connection.rollback() {
                warn!(engine = self.id, error = %e, "failed to roll back released connection");
            }
        }
        debug!(engine = self.id, "released connection for current context");
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("strategy", &self.strategy)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Transaction state of one execution context on one engine
pub struct TransactionTracker {
    engine_id: u64,
    connection: Rc<Connection>,
}

impl TransactionTracker {
    pub fn active(&self) -> bool {
        self.connection.in_transaction()
    }

    pub fn begin(&self) -> Result<()> {
        debug!(engine = self.engine_id, "beginning transaction");
        self.connection.begin()
    }

    pub fn commit(&self) -> Result<()> {
        debug!(engine = self.engine_id, "committing transaction");
        self.connection.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        debug!(engine = self.engine_id, "rolling back transaction");
        self.connection.rollback()
    }

    pub fn connection(&self) -> &Rc<Connection> {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_engine(props: EngineProperties) -> Arc<Engine> {
        create_engine("sqlite://memory", &props.with_defaults()).unwrap()
    }

    #[test]
    fn test_parse_memory_urls() {
        for url in ["sqlite://memory", "sqlite://:memory:", "sqlite://", "SQLITE://memory"] {
            let parsed = EngineUrl::parse(url).unwrap();
            assert!(parsed.is_memory(), "{}", url);
        }
    }

    #[test]
    fn test_parse_file_urls() {
        let abs = EngineUrl::parse("sqlite:///var/lib/app.db").unwrap();
        assert_eq!(abs.path(), Some(&PathBuf::from("/var/lib/app.db")));

        let rel = EngineUrl::parse("sqlite://data/app.db").unwrap();
        assert_eq!(rel.path(), Some(&PathBuf::from("data/app.db")));
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        for url in ["postgres://localhost/db", "memory"] {
            let err = EngineUrl::parse(url).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DatabaseError>(),
                Some(DatabaseError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("threadlocal".parse::<Strategy>(), Ok(Strategy::ThreadLocal));
        assert_eq!("Plain".parse::<Strategy>(), Ok(Strategy::Plain));
        assert!("pooled".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let props = EngineProperties::new().with(STRATEGY_KEY, "pooled");
        let err = create_engine("sqlite://memory", &props).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatabaseError>(),
            Some(DatabaseError::Configuration(_))
        ));
    }

    #[test]
    fn test_threadlocal_reuses_connection() {
        let engine = memory_engine(EngineProperties::new());
        let a = engine.contextual_connect().unwrap();
        let b = engine.contextual_connect().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.engine_id(), engine.id());
    }

    #[test]
    fn test_threadlocal_connections_differ_per_thread() {
        let engine = memory_engine(EngineProperties::new());
        engine
            .contextual_connect()
            .unwrap()
            .execute("CREATE TABLE t (id INTEGER)")
            .unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let conn = engine.contextual_connect().unwrap();
                // Different connection, same in-memory database
                assert!(conn.table_exists("t").unwrap());
            });
        });
    }

    #[test]
    fn test_plain_opens_new_connections() {
        let engine = memory_engine(EngineProperties::new().with(STRATEGY_KEY, "plain"));
        assert_eq!(engine.strategy(), Strategy::Plain);

        let a = engine.contextual_connect().unwrap();
        let b = engine.contextual_connect().unwrap();
        assert!(!Rc::ptr_eq(&a, &b));

        a.execute("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(b.table_exists("t").unwrap());
    }

    #[test]
    fn test_memory_engines_are_isolated() {
        let first = memory_engine(EngineProperties::new());
        let second = memory_engine(EngineProperties::new());
        first
            .contextual_connect()
            .unwrap()
            .execute("CREATE TABLE only_first (id INTEGER)")
            .unwrap();
        assert!(!second
            .contextual_connect()
            .unwrap()
            .table_exists("only_first")
            .unwrap());
    }

    #[test]
    fn test_transaction_tracker() {
        let engine = memory_engine(EngineProperties::new());
        let tx = engine.transaction().unwrap();
        assert!(!tx.active());

        tx.begin().unwrap();
        assert!(tx.active());
        // The tracker shares the thread's contextual connection
        assert!(engine.contextual_connect().unwrap().in_transaction());

        tx.commit().unwrap();
        assert!(!engine.transaction().unwrap().active());
    }

    #[test]
    fn test_dispose() {
        let engine = memory_engine(EngineProperties::new());
        assert!(!engine.is_disposed());
        engine.dispose();
        assert!(engine.is_disposed());
        engine.dispose();
        assert!(engine.is_disposed());
    }

    #[test]
    fn test_release_context_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("release.sqlite3").display());
        let props = EngineProperties::new()
            .with("busy_timeout_ms", 100)
            .with_defaults();
        let engine = create_engine(&url, &props).unwrap();

        let conn = engine.contextual_connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        engine.transaction().unwrap().begin().unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)").unwrap();

        assert!(engine.release_context());
        assert!(!conn.in_transaction());
        assert!(!engine.release_context());

        let fresh = engine.contextual_connect().unwrap();
        assert!(!Rc::ptr_eq(&conn, &fresh));
        assert_eq!(fresh.table_count("t").unwrap(), 0);

        // No write lock is left behind by the released connection
        let other = engine.connect().unwrap();
        other.execute("INSERT INTO t (id) VALUES (2)").unwrap();
    }
}
