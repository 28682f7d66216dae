//! Database lifecycle manager
//!
//! [`Database`] owns everything a concrete [`DatabaseDefinition`] needs at
//! runtime: the engine, the schema metadata, the table and mapper registries
//! and one cached [`Session`] per execution context. Nothing is created until
//! first use.

use anyhow::Result;
use std::rc::Rc;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::core::{
    create_engine, Connection, ContextLocal, Engine, MapperMap, Mapper, Metadata, Table, TableMap,
};
use super::session::{
    FlushEvent, FlushObservers, NotificationSink, Session, SessionFactory, SessionOptions,
};
use super::DatabaseError;
use crate::config::EngineProperties;

/// Configuration contract implemented by each concrete database
pub trait DatabaseDefinition: Send + Sync + 'static {
    /// Connection string; `None` makes engine creation fail
    fn url(&self) -> Option<String>;

    /// Engine options; `strategy` and `convert_unicode` are defaulted if absent
    fn engine_properties(&self) -> EngineProperties {
        EngineProperties::default()
    }

    /// Define the tables of this database against a fresh `metadata`
    ///
    /// Called once per manager. Tables must be inserted into `tables` under
    /// their name.
    fn setup_tables(&self, metadata: &Arc<Metadata>, tables: &mut TableMap) -> Result<()> {
        let _ = (metadata, tables);
        Err(DatabaseError::NotImplemented("setup_tables").into())
    }

    /// Register entity mappers; optional
    fn setup_mappers(&self, tables: &TableMap, mappers: &mut MapperMap) -> Result<()> {
        let _ = (tables, mappers);
        Ok(())
    }
}

/// Where the manager is in its initialization lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No engine has been built yet; tables are not set up
    Uninitialized,
    /// Engine, metadata and tables are available
    Ready,
    /// The engine was discarded; tables exist and will be rebound
    Invalidated,
}

#[derive(Clone)]
struct Bound {
    engine: Arc<Engine>,
    metadata: Arc<Metadata>,
    factory: Arc<SessionFactory>,
}

struct EngineState {
    lifecycle: LifecycleState,
    bound: Option<Bound>,
}

/// Lazily initialized engine plus per-context session cache
pub struct Database<D: DatabaseDefinition> {
    definition: D,
    state: RwLock<EngineState>,
    tables: RwLock<TableMap>,
    mappers: RwLock<Arc<MapperMap>>,
    sessions: ContextLocal<Rc<Session>>,
    context_engines: ContextLocal<Arc<Engine>>,
    observers: Arc<FlushObservers>,
}

impl<D: DatabaseDefinition> Database<D> {
    pub fn new(definition: D) -> Self {
        Self::with_observers(definition, Arc::new(FlushObservers::new()))
    }

    /// Create a manager publishing flush events to an existing observer list
    pub fn with_observers(definition: D, observers: Arc<FlushObservers>) -> Self {
        Self {
            definition,
            state: RwLock::new(EngineState {
                lifecycle: LifecycleState::Uninitialized,
                bound: None,
            }),
            tables: RwLock::new(TableMap::new()),
            mappers: RwLock::new(Arc::new(MapperMap::new())),
            sessions: ContextLocal::new(),
            context_engines: ContextLocal::new(),
            observers,
        }
    }

    pub fn definition(&self) -> &D {
        &self.definition
    }

    pub fn state(&self) -> LifecycleState {
        self.read_state().lifecycle
    }

    pub fn observers(&self) -> &Arc<FlushObservers> {
        &self.observers
    }

    /// Subscribe a sink to flush events of every session of this database
    pub fn subscribe<S: NotificationSink + 'static>(&self, sink: S) {
        self.observers.subscribe(Arc::new(sink));
    }

    /// Subscribe a closure to flush events of every session of this database
    pub fn on_flush<F>(&self, sink: F)
    where
        F: Fn(&FlushEvent<'_>) + Send + Sync + 'static,
    {
        self.observers.subscribe_fn(sink);
    }

    /// Session for the current execution context
    ///
    /// Created on first request, then reused until the context ends or the
    /// engine is invalidated. Creating a session goes through
    /// [`Database::engine`], so the context's transaction is active.
    pub fn session(&self) -> Result<Rc<Session>> {
        if let Some(session) = self.sessions.get() {
            if !session.is_stale() {
                return Ok(session);
            }
            debug!(session = session.id(), "discarding session of invalidated engine");
            if let Err(e) = session.close() {
                warn!(session = session.id(), error = %e, "failed to close stale session");
            }
            self.sessions.take();
        }

        let engine = self.engine()?;
        let factory = self.bound()?.factory;
        let session = Rc::new(factory.create()?);
        debug!(session = session.id(), engine = engine.id(), "cached session for context");
        self.sessions.set(session.clone());
        Ok(session)
    }

    /// New contextual connection from the engine
    pub fn connection(&self) -> Result<Rc<Connection>> {
        self.engine()?.contextual_connect()
    }

    /// Current engine, initializing it on first access
    ///
    /// Every call also makes sure the current context has an active
    /// transaction, beginning one if necessary.
    pub fn engine(&self) -> Result<Arc<Engine>> {
        let engine = self.bound()?.engine;
        self.switch_context_engine(&engine);
        let transaction = engine.transaction()?;
        if !transaction.active() {
            transaction.begin()?;
        }
        Ok(engine)
    }

    /// Current schema metadata, initializing the engine if needed
    pub fn metadata(&self) -> Result<Arc<Metadata>> {
        Ok(self.bound()?.metadata)
    }

    /// Table handle by name
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.bound()?;
        self.read_tables()
            .get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownTable(name.to_string()).into())
    }

    /// All table handles
    pub fn tables(&self) -> Result<TableMap> {
        self.bound()?;
        Ok(self.read_tables().clone())
    }

    /// Mapper registered for `entity`
    pub fn mapper(&self, entity: &str) -> Result<Mapper> {
        self.bound()?;
        self.mappers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownMapper(entity.to_string()).into())
    }

    /// Rebuild the engine after `url` or engine properties changed
    ///
    /// The old engine is disposed. Existing tables are rebound to the new
    /// metadata instead of being defined again, so handles to them stay
    /// valid, and the ones missing from the new database are created. Sessions created against the old engine become stale: the
    /// next `session()` call in each context replaces them, and using an old
    /// handle fails with [`DatabaseError::StaleSession`].
    ///
    /// Must not race with other threads using this database.
    pub fn invalidate(&self) -> Result<()> {
        let mut state = self.write_state();
        if let Some(bound) = state.bound.take() {
            bound.engine.dispose();
            info!(engine = bound.engine.id(), "invalidated database engine");
        }
        if state.lifecycle == LifecycleState::Ready {
            state.lifecycle = LifecycleState::Invalidated;
        }
        drop(self.sessions.take());

        self.initialize(&mut state)
    }

    /// Release this context's connection to an engine that has been replaced
    fn switch_context_engine(&self, engine: &Arc<Engine>) {
        if let Some(previous) = self.context_engines.get() {
            if Arc::ptr_eq(&previous, engine) {
                return;
            }
            if previous.release_context() {
                debug!(
                    old = previous.id(),
                    new = engine.id(),
                    "released context connection of replaced engine"
                );
            }
        }
        self.context_engines.set(engine.clone());
    }

    fn bound(&self) -> Result<Bound> {
        {
            let state = self.read_state();
            if let Some(bound) = &state.bound {
                return Ok(bound.clone());
            }
        }

        let mut state = self.write_state();
        if state.bound.is_none() {
            self.initialize(&mut state)?;
        }
        state
            .bound
            .clone()
            .ok_or_else(|| anyhow::anyhow!("database engine missing after initialization"))
    }

    fn initialize(&self, state: &mut EngineState) -> Result<()> {
        let url = self
            .definition
            .url()
            .ok_or_else(|| DatabaseError::Configuration("database url is not set".to_string()))?;
        let properties = self.definition.engine_properties().with_defaults();

        let engine = create_engine(&url, &properties)?;
        let metadata = Metadata::new(engine.clone());

        match state.lifecycle {
            LifecycleState::Uninitialized => {
                let mut tables = TableMap::new();
                self.definition.setup_tables(&metadata, &mut tables)?;
                let mut mappers = MapperMap::new();
                self.definition.setup_mappers(&tables, &mut mappers)?;

                info!(
                    engine = engine.id(),
                    url = %engine.url(),
                    tables = tables.len(),
                    mappers = mappers.len(),
                    "initialized database"
                );
                *self.write_tables() = tables;
                *self.mappers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(mappers);
            }
            LifecycleState::Ready | LifecycleState::Invalidated => {
                let tables = self.read_tables();
                for table in tables.values() {
                    table.rebind(&metadata);
                }
                let created = metadata.create_missing()?;
                info!(
                    engine = engine.id(),
                    url = %engine.url(),
                    tables = tables.len(),
                    created,
                    "re-initialized database, tables rebound"
                );
            }
        }

        let mappers = self
            .mappers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let factory = Arc::new(SessionFactory::new(
            engine.clone(),
            SessionOptions::default(),
            self.observers.clone(),
            mappers,
        ));

        state.bound = Some(Bound {
            engine,
            metadata,
            factory,
        });
        state.lifecycle = LifecycleState::Ready;
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, TableMap> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, TableMap> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}
