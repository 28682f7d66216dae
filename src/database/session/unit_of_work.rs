//! Session: a unit of work over one contextual connection
//!
//! A [`Session`] queues changes in memory and writes them on [`Session::flush`]
//! (or implicitly before queries when autoflush is on), publishing
//! [`FlushEvent`]s around the write. Sessions are bound to the thread that
//! created them and to the engine they were created against; once that
//! engine is disposed the session refuses further work.

use anyhow::Result;
use rusqlite::types::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::events::{FlushEvent, FlushObservers};
use crate::database::core::connection::quote_ident;
use crate::database::core::{Connection, Engine, Mapped, Mapper, MapperMap, Row, Table};
use crate::database::DatabaseError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const FLUSH_SAVEPOINT: &str = "lead_flush";

/// Behaviour switches for sessions built by a [`SessionFactory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Flush pending changes before running queries
    pub autoflush: bool,
    /// Begin a transaction whenever the session works without one
    pub transactional: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autoflush: true,
            transactional: true,
        }
    }
}

/// A change queued by a session and written on flush
#[derive(Debug, Clone)]
pub enum PendingChange {
    Insert {
        table: Arc<Table>,
        values: Vec<(String, Value)>,
    },
    Update {
        table: Arc<Table>,
        key: (String, Value),
        values: Vec<(String, Value)>,
    },
    Delete {
        table: Arc<Table>,
        key: (String, Value),
    },
}

impl PendingChange {
    pub fn table(&self) -> &Arc<Table> {
        match self {
            PendingChange::Insert { table, .. }
            | PendingChange::Update { table, .. }
            | PendingChange::Delete { table, .. } => table,
        }
    }

    /// SQL statement and positional parameters for this change
    pub fn statement(&self) -> (String, Vec<Value>) {
        match self {
            PendingChange::Insert { table, values } if values.is_empty() => (
                format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table.name())),
                Vec::new(),
            ),
            PendingChange::Insert { table, values } => {
                let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
                let placeholders: Vec<String> =
                    (1..=values.len()).map(|i| format!("?{}", i)).collect();
                (
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote_ident(table.name()),
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    values.iter().map(|(_, v)| v.clone()).collect(),
                )
            }
            PendingChange::Update { table, key, values } => {
                let assignments: Vec<String> = values
                    .iter()
                    .enumerate()
                    .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(c), i + 1))
                    .collect();
                let mut params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
                params.push(key.1.clone());
                (
                    format!(
                        "UPDATE {} SET {} WHERE {} = ?{}",
                        quote_ident(table.name()),
                        assignments.join(", "),
                        quote_ident(&key.0),
                        params.len()
                    ),
                    params,
                )
            }
            PendingChange::Delete { table, key } => (
                format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    quote_ident(table.name()),
                    quote_ident(&key.0)
                ),
                vec![key.1.clone()],
            ),
        }
    }
}

/// Builds sessions bound to one engine
pub struct SessionFactory {
    engine: Arc<Engine>,
    options: SessionOptions,
    hooks: Arc<FlushObservers>,
    mappers: Arc<MapperMap>,
}

impl SessionFactory {
    pub fn new(
        engine: Arc<Engine>,
        options: SessionOptions,
        hooks: Arc<FlushObservers>,
        mappers: Arc<MapperMap>,
    ) -> Self {
        Self {
            engine,
            options,
            hooks,
            mappers,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Create a session on the engine's connection for the current context
    pub fn create(&self) -> Result<Session> {
        let connection = self.engine.contextual_connect()?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, engine = self.engine.id(), "created session");

        Ok(Session {
            id,
            engine: self.engine.clone(),
            connection,
            options: self.options,
            hooks: self.hooks.clone(),
            mappers: self.mappers.clone(),
            pending: RefCell::new(Vec::new()),
            flushing: Cell::new(false),
        })
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("engine", &self.engine.id())
            .field("options", &self.options)
            .finish()
    }
}

/// Unit of work tracking pending changes against an engine
pub struct Session {
    id: u64,
    engine: Arc<Engine>,
    connection: Rc<Connection>,
    options: SessionOptions,
    hooks: Arc<FlushObservers>,
    mappers: Arc<MapperMap>,
    pending: RefCell<Vec<PendingChange>>,
    flushing: Cell<bool>,
}

fn collect_values<I, K, V>(values: I) -> Vec<(String, Value)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    values
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn connection(&self) -> &Rc<Connection> {
        &self.connection
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Whether the engine this session was created against has been replaced
    pub fn is_stale(&self) -> bool {
        self.engine.is_disposed()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_stale() {
            return Err(DatabaseError::StaleSession {
                session: self.id,
                engine: self.engine.id(),
            }
            .into());
        }
        Ok(())
    }

    fn ensure_transaction(&self) -> Result<()> {
        if self.options.transactional && !self.connection.in_transaction() {
            debug!(session = self.id, "beginning session transaction");
            self.connection.begin()?;
        }
        Ok(())
    }

    fn mapper<T: Mapped>(&self) -> Result<&Mapper> {
        self.mappers
            .get(T::ENTITY)
            .ok_or_else(|| DatabaseError::UnknownMapper(T::ENTITY.to_string()).into())
    }

    fn enqueue(&self, change: PendingChange) -> Result<()> {
        self.ensure_live()?;
        let table = change.table();
        match &change {
            PendingChange::Insert { values, .. } => {
                for (column, _) in values {
                    table.check_column(column)?;
                }
            }
            PendingChange::Update { key, values, .. } => {
                table.check_column(&key.0)?;
                for (column, _) in values {
                    table.check_column(column)?;
                }
            }
            PendingChange::Delete { key, .. } => table.check_column(&key.0)?,
        }
        self.pending.borrow_mut().push(change);
        Ok(())
    }

    /// Queue a mapped entity for insertion
    pub fn add<T: Mapped>(&self, entity: &T) -> Result<()> {
        let table = self.mapper::<T>()?.table().clone();
        self.enqueue(PendingChange::Insert {
            table,
            values: entity.to_values(),
        })
    }

    /// Queue a row for insertion into `table`
    pub fn insert<I, K, V>(&self, table: &Arc<Table>, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.enqueue(PendingChange::Insert {
            table: table.clone(),
            values: collect_values(values),
        })
    }

    /// Queue an update of the rows whose `key` column matches
    pub fn update<I, K, V>(
        &self,
        table: &Arc<Table>,
        key: (&str, impl Into<Value>),
        values: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.enqueue(PendingChange::Update {
            table: table.clone(),
            key: (key.0.to_string(), key.1.into()),
            values: collect_values(values),
        })
    }

    /// Queue a delete of the rows whose `key` column matches
    pub fn delete(&self, table: &Arc<Table>, key: (&str, impl Into<Value>)) -> Result<()> {
        self.enqueue(PendingChange::Delete {
            table: table.clone(),
            key: (key.0.to_string(), key.1.into()),
        })
    }

    /// Write all pending changes
    ///
    /// Publishes `BeforeSessionFlush` before the first write and
    /// `SessionFlushed` after the last. Changes queued by a before-flush
    /// observer are written in the same flush. Nothing is published when
    /// there is nothing to write, and a flush requested while one is already
    /// running is a no-op.
    ///
    /// A flush is atomic: if any statement fails, everything written by that
    /// flush is rolled back and its changes stay pending.
    pub fn flush(&self) -> Result<()> {
        self.ensure_live()?;
        if self.flushing.get() || self.pending.borrow().is_empty() {
            return Ok(());
        }
        self.ensure_transaction()?;

        self.flushing.set(true);
        let result = self.flush_pending();
        self.flushing.set(false);
        result
    }

    fn flush_pending(&self) -> Result<()> {
        self.hooks
            .publish(&FlushEvent::BeforeSessionFlush { session: self });

        let changes = std::mem::take(&mut *self.pending.borrow_mut());
        debug!(session = self.id, changes = changes.len(), "flushing session");

        self.connection.execute_batch(&format!("SAVEPOINT {}", FLUSH_SAVEPOINT))?;
        if let Err(e) = self.write_changes(&changes) {
            debug!(session = self.id, error = %e, "flush failed, rolling back to savepoint");
            self.connection.execute_batch(&format!(
                "ROLLBACK TO {sp}; RELEASE {sp}",
                sp = FLUSH_SAVEPOINT
            ))?;
            // Unwritten changes stay queued ahead of anything added since
            let mut pending = self.pending.borrow_mut();
            let added = std::mem::replace(&mut *pending, changes);
            pending.extend(added);
            return Err(e);
        }
        self.connection
            .execute_batch(&format!("RELEASE {}", FLUSH_SAVEPOINT))?;

        self.hooks.publish(&FlushEvent::SessionFlushed { session: self });
        Ok(())
    }

    fn write_changes(&self, changes: &[PendingChange]) -> Result<()> {
        for change in changes {
            let (sql, params) = change.statement();
            self.connection
                .execute_with_params(&sql, rusqlite::params_from_iter(params.iter()))?;
        }
        Ok(())
    }

    /// Flush, then commit the current transaction
    ///
    /// For transactional sessions the next operation begins a new one.
    pub fn commit(&self) -> Result<()> {
        self.flush()?;
        if self.connection.in_transaction() {
            debug!(session = self.id, "committing session transaction");
            self.connection.commit()?;
        }
        Ok(())
    }

    /// Discard pending changes and roll back the current transaction
    pub fn rollback(&self) -> Result<()> {
        self.ensure_live()?;
        self.pending.borrow_mut().clear();
        if self.connection.in_transaction() {
            debug!(session = self.id, "rolling back session transaction");
            self.connection.rollback()?;
        }
        Ok(())
    }

    /// Discard pending changes and roll back, whether or not the engine is live
    ///
    /// Used to release a session whose engine was replaced.
    pub fn close(&self) -> Result<()> {
        self.pending.borrow_mut().clear();
        if self.connection.in_transaction() {
            debug!(session = self.id, "closing session, rolling back");
            self.connection.rollback()?;
        }
        Ok(())
    }

    fn prepare_read(&self) -> Result<()> {
        self.ensure_live()?;
        if self.options.autoflush {
            self.flush()?;
        }
        self.ensure_transaction()
    }

    /// Run a raw query inside the session's transaction
    pub fn query_rows<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Row>> {
        self.prepare_read()?;
        self.connection.query_rows(sql, params)
    }

    /// Load every entity of a mapped type
    pub fn query<T: Mapped>(&self) -> Result<Vec<T>> {
        let table = self.mapper::<T>()?.table().clone();
        let rows = self.query_rows(&format!("SELECT * FROM {}", quote_ident(table.name())), [])?;
        rows.iter().map(T::from_row).collect()
    }

    /// Number of rows currently visible in `table`
    pub fn count(&self, table: &Table) -> Result<u64> {
        self.prepare_read()?;
        self.connection.table_count(table.name())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("engine", &self.engine.id())
            .field("pending", &self.pending_count())
            .field("stale", &self.is_stale())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineProperties;
    use crate::database::core::{create_engine, Column, Metadata};
    use crate::database::session::FlushEventKind;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct Item {
        id: i64,
        name: String,
    }

    impl Mapped for Item {
        const ENTITY: &'static str = "Item";

        fn to_values(&self) -> Vec<(String, Value)> {
            vec![
                ("id".to_string(), Value::Integer(self.id)),
                ("name".to_string(), Value::Text(self.name.clone())),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Item {
                id: row.get_i64("id")?,
                name: row.get_string("name")?,
            })
        }
    }

    struct Fixture {
        factory: SessionFactory,
        observers: Arc<FlushObservers>,
        items: Arc<Table>,
    }

    fn fixture(options: SessionOptions) -> Fixture {
        let engine =
            create_engine("sqlite://memory", &EngineProperties::new().with_defaults()).unwrap();
        let metadata = Metadata::new(engine.clone());
        let items = Table::new(
            "items",
            &metadata,
            vec![Column::integer("id").primary_key(), Column::text("name").not_null()],
        );
        metadata.create_all().unwrap();

        let mut mappers = MapperMap::new();
        mappers.insert("Item".to_string(), Mapper::new("Item", &items));

        let observers = Arc::new(FlushObservers::new());
        let factory = SessionFactory::new(engine, options, observers.clone(), Arc::new(mappers));
        Fixture {
            factory,
            observers,
            items,
        }
    }

    fn record(observers: &FlushObservers) -> Arc<Mutex<Vec<(FlushEventKind, u64)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        observers.subscribe_fn(move |event| {
            sink_log
                .lock()
                .unwrap()
                .push((event.kind(), event.session().id()));
        });
        log
    }

    #[test]
    fn test_statements() {
        let f = fixture(SessionOptions::default());
        let insert = PendingChange::Insert {
            table: f.items.clone(),
            values: vec![("name".to_string(), Value::Text("a".to_string()))],
        };
        assert_eq!(
            insert.statement().0,
            r#"INSERT INTO "items" ("name") VALUES (?1)"#
        );

        let update = PendingChange::Update {
            table: f.items.clone(),
            key: ("id".to_string(), Value::Integer(1)),
            values: vec![("name".to_string(), Value::Text("b".to_string()))],
        };
        let (sql, params) = update.statement();
        assert_eq!(sql, r#"UPDATE "items" SET "name" = ?1 WHERE "id" = ?2"#);
        assert_eq!(params.len(), 2);

        let delete = PendingChange::Delete {
            table: f.items.clone(),
            key: ("id".to_string(), Value::Integer(1)),
        };
        assert_eq!(delete.statement().0, r#"DELETE FROM "items" WHERE "id" = ?1"#);
    }

    #[test]
    fn test_add_and_query_autoflushes() {
        let f = fixture(SessionOptions::default());
        let session = f.factory.create().unwrap();

        session
            .add(&Item {
                id: 1,
                name: "widget".to_string(),
            })
            .unwrap();
        assert_eq!(session.pending_count(), 1);

        let items: Vec<Item> = session.query().unwrap();
        assert_eq!(
            items,
            vec![Item {
                id: 1,
                name: "widget".to_string()
            }]
        );
        assert_eq!(session.pending_count(), 0);
        assert!(session.connection().in_transaction());
    }

    #[test]
    fn test_without_autoflush_queries_do_not_flush() {
        let f = fixture(SessionOptions {
            autoflush: false,
            transactional: true,
        });
        let session = f.factory.create().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();

        assert_eq!(session.count(&f.items).unwrap(), 0);
        session.flush().unwrap();
        assert_eq!(session.count(&f.items).unwrap(), 1);
    }

    #[test]
    fn test_non_transactional_session_autocommits() {
        let f = fixture(SessionOptions {
            autoflush: true,
            transactional: false,
        });
        let session = f.factory.create().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();
        session.flush().unwrap();
        assert!(!session.connection().in_transaction());
    }

    #[test]
    fn test_flush_publishes_before_and_after() {
        let f = fixture(SessionOptions::default());
        let log = record(&f.observers);
        let session = f.factory.create().unwrap();

        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();
        session.flush().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (FlushEventKind::BeforeFlush, session.id()),
                (FlushEventKind::AfterFlush, session.id())
            ]
        );
    }

    #[test]
    fn test_empty_flush_publishes_nothing() {
        let f = fixture(SessionOptions::default());
        let log = record(&f.observers);
        let session = f.factory.create().unwrap();

        session.flush().unwrap();
        session.commit().unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_before_flush_observer_can_queue_changes() {
        let f = fixture(SessionOptions::default());
        let items = f.items.clone();
        f.observers.subscribe_fn(move |event| {
            if event.kind() == FlushEventKind::BeforeFlush {
                let session = event.session();
                session
                    .insert(
                        &items,
                        [("id", Value::Integer(99)), ("name", Value::Text("audit".into()))],
                    )
                    .unwrap();
                // Re-entrant flush is ignored while one is running
                session.flush().unwrap();
            }
        });

        let session = f.factory.create().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();
        session.flush().unwrap();

        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.count(&f.items).unwrap(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let f = fixture(SessionOptions::default());
        let session = f.factory.create().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(2)), ("name", Value::Text("b".into()))])
            .unwrap();
        session
            .update(&f.items, ("id", 1), [("name", Value::Text("renamed".into()))])
            .unwrap();
        session.delete(&f.items, ("id", 2)).unwrap();

        let items: Vec<Item> = session.query().unwrap();
        assert_eq!(
            items,
            vec![Item {
                id: 1,
                name: "renamed".to_string()
            }]
        );
    }

    #[test]
    fn test_commit_and_rollback() {
        let f = fixture(SessionOptions::default());
        let session = f.factory.create().unwrap();

        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("kept".into()))])
            .unwrap();
        session.commit().unwrap();
        assert!(!session.connection().in_transaction());

        session
            .insert(&f.items, [("id", Value::Integer(2)), ("name", Value::Text("lost".into()))])
            .unwrap();
        session.flush().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(3)), ("name", Value::Text("never".into()))])
            .unwrap();
        session.rollback().unwrap();

        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.count(&f.items).unwrap(), 1);
    }

    #[test]
    fn test_unknown_column_and_mapper() {
        let f = fixture(SessionOptions::default());
        let session = f.factory.create().unwrap();

        let err = session
            .insert(&f.items, [("price", Value::Integer(1))])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatabaseError>(),
            Some(DatabaseError::UnknownColumn { .. })
        ));

        struct Unmapped;
        impl Mapped for Unmapped {
            const ENTITY: &'static str = "Unmapped";
            fn to_values(&self) -> Vec<(String, Value)> {
                Vec::new()
            }
            fn from_row(_row: &Row) -> Result<Self> {
                Ok(Unmapped)
            }
        }
        let err = session.add(&Unmapped).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DatabaseError>(),
            Some(&DatabaseError::UnknownMapper("Unmapped".to_string()))
        );
    }

    #[test]
    fn test_engine_errors_propagate_unchanged() {
        let f = fixture(SessionOptions::default());
        let session = f.factory.create().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("b".into()))])
            .unwrap();

        let err = session.flush().unwrap_err();
        assert!(err.downcast_ref::<rusqlite::Error>().is_some());
    }

    fn queue_with_duplicate(session: &Session, items: &Arc<Table>) {
        for (id, name) in [(1, "a"), (1, "dup"), (2, "c")] {
            session
                .insert(items, [("id", Value::Integer(id)), ("name", Value::Text(name.into()))])
                .unwrap();
        }
    }

    #[test]
    fn test_failed_flush_writes_nothing() {
        let f = fixture(SessionOptions::default());
        let log = record(&f.observers);
        let session = f.factory.create().unwrap();
        queue_with_duplicate(&session, &f.items);

        assert!(session.flush().is_err());
        assert_eq!(session.pending_count(), 3);
        assert_eq!(session.connection().table_count("items").unwrap(), 0);
        assert_eq!(log.lock().unwrap().len(), 1);

        // Commit retries the same flush and still writes nothing
        assert!(session.commit().is_err());
        session.rollback().unwrap();
        assert_eq!(session.pending_count(), 0);
        session.commit().unwrap();

        let other = f.factory.engine().connect().unwrap();
        assert_eq!(other.table_count("items").unwrap(), 0);
    }

    #[test]
    fn test_failed_flush_is_atomic_without_transaction() {
        let f = fixture(SessionOptions {
            autoflush: true,
            transactional: false,
        });
        let session = f.factory.create().unwrap();
        queue_with_duplicate(&session, &f.items);

        assert!(session.flush().is_err());
        assert!(!session.connection().in_transaction());
        assert_eq!(session.connection().table_count("items").unwrap(), 0);
        assert_eq!(session.pending_count(), 3);
    }

    #[test]
    fn test_close_discards_work_even_when_stale() {
        let f = fixture(SessionOptions::default());
        let session = f.factory.create().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(1)), ("name", Value::Text("a".into()))])
            .unwrap();
        session.flush().unwrap();
        session
            .insert(&f.items, [("id", Value::Integer(2)), ("name", Value::Text("b".into()))])
            .unwrap();

        session.close().unwrap();
        assert_eq!(session.pending_count(), 0);
        assert!(!session.connection().in_transaction());
        assert_eq!(session.connection().table_count("items").unwrap(), 0);

        f.factory.engine().dispose();
        session.close().unwrap();
    }
}
